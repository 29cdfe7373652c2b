//! In-process relay network. Backs the offline mode and the test suites.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::transport::{
    RelayConnection, RelayConnector, RelaySubscription, SubscriptionFilter, SubscriptionMessage,
};

const SUBSCRIPTION_BUFFER: usize = 1024;

struct LiveSub {
    filters: Vec<SubscriptionFilter>,
    tx: mpsc::Sender<SubscriptionMessage>,
}

#[derive(Default)]
struct RelayInner {
    online: bool,
    epoch: u64,
    events: Vec<Event>,
    subs: HashMap<String, LiveSub>,
    publish_error: Option<String>,
}

#[derive(Default)]
struct Counters {
    connects: AtomicUsize,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
    publishes: AtomicUsize,
}

pub struct MemoryRelay {
    url: String,
    inner: Mutex<RelayInner>,
    counters: Counters,
}

impl MemoryRelay {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            inner: Mutex::new(RelayInner {
                online: true,
                ..RelayInner::default()
            }),
            counters: Counters::default(),
        }
    }

    /// Store and fan out. Duplicate ids are stored once but still fanned out,
    /// like a relay that does not dedup its live stream.
    fn accept(&self, event: &Event) {
        let mut inner = self.inner.lock();
        if !inner.events.iter().any(|e| e.id == event.id) {
            inner.events.push(event.clone());
        }
        for sub in inner.subs.values() {
            if sub.filters.iter().any(|f| f.matches(event)) {
                let _ = sub
                    .tx
                    .try_send(SubscriptionMessage::Event(Box::new(event.clone())));
            }
        }
    }
}

/// A set of named in-memory relays. Unknown URLs are created on first
/// connect unless the network is strict.
pub struct MemoryNetwork {
    relays: Mutex<HashMap<String, Arc<MemoryRelay>>>,
    auto_create: bool,
    next_id: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            relays: Mutex::new(HashMap::new()),
            auto_create: true,
            next_id: AtomicU64::new(1),
        })
    }

    /// Only relays added with [`MemoryNetwork::add_relay`] accept connections.
    pub fn strict() -> Arc<Self> {
        Arc::new(Self {
            relays: Mutex::new(HashMap::new()),
            auto_create: false,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn add_relay(&self, url: &str) -> Arc<MemoryRelay> {
        self.relays
            .lock()
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(MemoryRelay::new(url)))
            .clone()
    }

    fn relay(&self, url: &str) -> Option<Arc<MemoryRelay>> {
        self.relays.lock().get(url).cloned()
    }

    /// Taking a relay offline drops every connection to it; connects fail
    /// until it comes back.
    pub fn set_online(&self, url: &str, online: bool) {
        let relay = self.add_relay(url);
        let mut inner = relay.inner.lock();
        inner.online = online;
        if !online {
            inner.epoch += 1;
            inner.subs.clear();
        }
    }

    /// Kill current connections and their subscriptions; the relay stays up.
    pub fn drop_connections(&self, url: &str) {
        if let Some(relay) = self.relay(url) {
            let mut inner = relay.inner.lock();
            inner.epoch += 1;
            inner.subs.clear();
        }
    }

    /// Make every publish on `url` fail with `reason`, or succeed again with `None`.
    pub fn set_publish_error(&self, url: &str, reason: Option<&str>) {
        let relay = self.add_relay(url);
        relay.inner.lock().publish_error = reason.map(str::to_string);
    }

    /// Deliver an event as if another client had published it to `url`.
    pub fn inject(&self, url: &str, event: &Event) {
        self.add_relay(url).accept(event);
    }

    pub fn stored_events(&self, url: &str) -> Vec<Event> {
        self.relay(url)
            .map(|r| r.inner.lock().events.clone())
            .unwrap_or_default()
    }

    pub fn active_subscriptions(&self, url: &str) -> usize {
        self.relay(url).map(|r| r.inner.lock().subs.len()).unwrap_or(0)
    }

    pub fn connect_count(&self, url: &str) -> usize {
        self.relay(url)
            .map(|r| r.counters.connects.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn subscribe_count(&self, url: &str) -> usize {
        self.relay(url)
            .map(|r| r.counters.subscribes.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn unsubscribe_count(&self, url: &str) -> usize {
        self.relay(url)
            .map(|r| r.counters.unsubscribes.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn publish_count(&self, url: &str) -> usize {
        self.relay(url)
            .map(|r| r.counters.publishes.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

#[async_trait]
impl RelayConnector for MemoryNetwork {
    async fn connect(&self, url: &str, _timeout: Duration) -> Result<Arc<dyn RelayConnection>> {
        let relay = if self.auto_create {
            self.add_relay(url)
        } else {
            self.relay(url)
                .ok_or_else(|| anyhow!("connect {url}: no such relay"))?
        };
        let epoch = {
            let inner = relay.inner.lock();
            if !inner.online {
                bail!("connect {url}: relay offline");
            }
            inner.epoch
        };
        relay.counters.connects.fetch_add(1, Ordering::SeqCst);
        let conn_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            relay,
            conn_id,
            epoch,
            next_sub: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct MemoryConnection {
    relay: Arc<MemoryRelay>,
    conn_id: u64,
    epoch: u64,
    next_sub: AtomicU64,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn alive(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let inner = self.relay.inner.lock();
        inner.online && inner.epoch == self.epoch
    }

    fn owns(&self, sub_id: &str) -> bool {
        sub_id.starts_with(&format!("mem-{}-", self.conn_id))
    }
}

#[async_trait]
impl RelayConnection for MemoryConnection {
    fn url(&self) -> &str {
        &self.relay.url
    }

    async fn is_connected(&self) -> bool {
        self.alive()
    }

    async fn subscribe(&self, filters: Vec<SubscriptionFilter>) -> Result<RelaySubscription> {
        if !self.alive() {
            bail!("subscribe {}: not connected", self.relay.url);
        }
        let id = format!(
            "mem-{}-{}",
            self.conn_id,
            self.next_sub.fetch_add(1, Ordering::SeqCst)
        );
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        {
            let mut inner = self.relay.inner.lock();
            for event in inner
                .events
                .iter()
                .filter(|e| filters.iter().any(|f| f.matches(e)))
            {
                let _ = tx.try_send(SubscriptionMessage::Event(Box::new(event.clone())));
            }
            let _ = tx.try_send(SubscriptionMessage::EndOfStoredEvents);
            inner.subs.insert(id.clone(), LiveSub { filters, tx });
        }
        self.relay.counters.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(RelaySubscription { id, messages: rx })
    }

    async fn unsubscribe(&self, id: &str) {
        if self.relay.inner.lock().subs.remove(id).is_some() {
            self.relay
                .counters
                .unsubscribes
                .fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn publish(&self, event: &Event, _timeout: Duration) -> Result<()> {
        if !self.alive() {
            bail!("publish {}: not connected", self.relay.url);
        }
        self.relay.counters.publishes.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.relay.inner.lock().publish_error.clone() {
            bail!("{reason}");
        }
        self.relay.accept(event);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.relay
            .inner
            .lock()
            .subs
            .retain(|id, _| !self.owns(id));
    }
}
