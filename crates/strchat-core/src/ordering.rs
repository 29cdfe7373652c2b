//! Short per-stream holding buffer that releases messages in
//! `(created_at, id)` order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::updates::{ChatMessage, DisplayEvent};

struct Pending {
    created_at: u64,
    id: String,
    message: ChatMessage,
}

struct Stream {
    epoch: u64,
    items: VecDeque<Pending>,
}

/// Messages are held per stream key (`chat:<name>` or `group:<name>`).
/// The first arrival on an idle key arms one flush timer; later arrivals
/// ride along and never push it back.
pub struct OrderingBuffer {
    streams: Arc<Mutex<HashMap<String, Stream>>>,
    next_epoch: AtomicU64,
    display: flume::Sender<DisplayEvent>,
    delay: Duration,
    capacity: usize,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl OrderingBuffer {
    pub fn new(
        display: flume::Sender<DisplayEvent>,
        delay: Duration,
        capacity: usize,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            next_epoch: AtomicU64::new(1),
            display,
            delay,
            capacity: capacity.max(1),
            tracker,
            cancel,
        }
    }

    pub fn push(&self, key: &str, created_at: u64, id: &str, message: ChatMessage) {
        let arm = {
            let mut streams = self.streams.lock();
            let mut armed = None;
            let stream = streams.entry(key.to_string()).or_insert_with(|| {
                let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
                armed = Some(epoch);
                Stream {
                    epoch,
                    items: VecDeque::new(),
                }
            });
            if stream.items.len() >= self.capacity {
                stream.items.pop_front();
                tracing::debug!(stream = %key, "ordering buffer full, dropped oldest");
            }
            stream.items.push_back(Pending {
                created_at,
                id: id.to_string(),
                message,
            });
            armed
        };

        if let Some(epoch) = arm {
            let streams = self.streams.clone();
            let display = self.display.clone();
            let cancel = self.cancel.clone();
            let delay = self.delay;
            let key = key.to_string();
            self.tracker.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        flush_stream(&streams, &display, &key, Some(epoch));
                    }
                }
            });
        }
    }

    /// Number of messages waiting across all streams.
    pub fn pending(&self) -> usize {
        self.streams.lock().values().map(|s| s.items.len()).sum()
    }

    /// Release everything still held, used on shutdown.
    pub fn flush_all(&self) {
        let keys: Vec<String> = self.streams.lock().keys().cloned().collect();
        for key in keys {
            flush_stream(&self.streams, &self.display, &key, None);
        }
    }
}

/// Remove `key` and emit its messages sorted. With `epoch` set, only the
/// stream generation that armed the timer is flushed.
fn flush_stream(
    streams: &Mutex<HashMap<String, Stream>>,
    display: &flume::Sender<DisplayEvent>,
    key: &str,
    epoch: Option<u64>,
) {
    let stream = {
        let mut streams = streams.lock();
        match (streams.get(key), epoch) {
            (Some(s), Some(e)) if s.epoch != e => return,
            (None, _) => return,
            _ => {}
        }
        streams.remove(key)
    };
    let Some(stream) = stream else {
        return;
    };
    let mut items: Vec<Pending> = stream.items.into();
    items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    for item in items {
        if display.send(DisplayEvent::NewMessage(item.message)).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(content: &str, ts: u64) -> ChatMessage {
        ChatMessage {
            chat: "nostr".into(),
            nick: "jan".into(),
            short_pubkey: "abcd".into(),
            full_pubkey: "00abcd".into(),
            is_own: false,
            content: content.into(),
            short_id: "0000".into(),
            relay_url: "wss://r".into(),
            timestamp: ts,
        }
    }

    fn contents(rx: &flume::Receiver<DisplayEvent>) -> Vec<String> {
        rx.try_iter()
            .filter_map(|ev| match ev {
                DisplayEvent::NewMessage(m) => Some(m.content),
                _ => None,
            })
            .collect()
    }

    fn buffer(capacity: usize) -> (OrderingBuffer, flume::Receiver<DisplayEvent>) {
        let (tx, rx) = flume::unbounded();
        let buf = OrderingBuffer::new(
            tx,
            Duration::from_millis(200),
            capacity,
            TaskTracker::new(),
            CancellationToken::new(),
        );
        (buf, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_sorted_by_time_then_id() {
        let (buf, rx) = buffer(256);
        buf.push("chat:nostr", 20, "bb", message("third", 20));
        buf.push("chat:nostr", 10, "zz", message("first", 10));
        buf.push("chat:nostr", 20, "aa", message("second", 20));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(contents(&rx).is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(contents(&rx), ["first", "second", "third"]);
        assert_eq!(buf.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_is_not_extended_by_later_arrivals() {
        let (buf, rx) = buffer(256);
        buf.push("chat:nostr", 1, "a", message("early", 1));
        tokio::time::sleep(Duration::from_millis(150)).await;
        buf.push("chat:nostr", 2, "b", message("late", 2));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(contents(&rx), ["early", "late"]);

        // a fresh arrival after the flush arms a new timer
        buf.push("chat:nostr", 3, "c", message("next", 3));
        tokio::time::sleep(Duration::from_millis(199)).await;
        assert!(contents(&rx).is_empty());
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(contents(&rx), ["next"]);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_drops_oldest() {
        let (buf, rx) = buffer(2);
        buf.push("group:g", 1, "a", message("one", 1));
        buf.push("group:g", 2, "b", message("two", 2));
        buf.push("group:g", 3, "c", message("three", 3));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(contents(&rx), ["two", "three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn streams_are_independent_and_flush_all_drains() {
        let (buf, rx) = buffer(256);
        buf.push("chat:a", 5, "x", message("a5", 5));
        buf.push("chat:b", 1, "y", message("b1", 1));
        assert_eq!(buf.pending(), 2);
        buf.flush_all();
        let mut got = contents(&rx);
        got.sort();
        assert_eq!(got, ["a5", "b1"]);

        // the old timers find nothing left to flush
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(contents(&rx).is_empty());
    }
}
