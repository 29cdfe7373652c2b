//! Inbound event pipeline: dedup, moderation, PoW, shaping, and hand-off to
//! the ordering buffer.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use nostr_sdk::prelude::Event;
use parking_lot::{Mutex, RwLock};

use crate::event::{chat_of, first_tag_value};
use crate::moderation::{CompiledPattern, matches_any};
use crate::ordering::OrderingBuffer;
use crate::pow;
use crate::relay::EventSink;
use crate::text;
use crate::updates::ChatMessage;

const MAX_COMPLETIONS: usize = 10;

/// Who we last saw behind a pubkey.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserContext {
    pub nick: String,
    pub chat: String,
    pub short_pubkey: String,
}

impl UserContext {
    pub fn handle(&self) -> String {
        text::user_handle(&self.nick, &self.short_pubkey)
    }
}

/// Snapshot of the orchestrator state the pipeline needs. Replaced
/// wholesale whenever views, moderation lists or identities change.
#[derive(Clone, Debug, Default)]
pub struct IngestPolicy {
    pub blocked: HashSet<String>,
    /// Chats shown by the active view (the chat itself, or a group's children).
    pub view_chats: HashSet<String>,
    /// Required difficulty per chat; missing means none.
    pub pow: HashMap<String, u32>,
    /// Name of the active view when it is a group.
    pub active_group: Option<String>,
    pub mutes: Vec<CompiledPattern>,
    pub filters: Vec<CompiledPattern>,
    pub own_pubkeys: HashSet<String>,
}

impl IngestPolicy {
    fn stream_key(&self, chat: &str) -> String {
        match &self.active_group {
            Some(group) if self.view_chats.contains(chat) => format!("group:{group}"),
            _ => format!("chat:{chat}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    Blocked,
    Duplicate,
    NoChat,
    InsufficientPow { required: u32 },
    Muted,
    Filtered,
}

pub struct Ingestor {
    policy: RwLock<IngestPolicy>,
    seen: Mutex<LruCache<String, ()>>,
    users: Mutex<LruCache<String, UserContext>>,
    ordering: Arc<OrderingBuffer>,
}

fn cache_size(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

impl Ingestor {
    pub fn new(seen_capacity: usize, user_capacity: usize, ordering: Arc<OrderingBuffer>) -> Self {
        Self {
            policy: RwLock::new(IngestPolicy::default()),
            seen: Mutex::new(LruCache::new(cache_size(seen_capacity))),
            users: Mutex::new(LruCache::new(cache_size(user_capacity))),
            ordering,
        }
    }

    pub fn set_policy(&self, policy: IngestPolicy) {
        *self.policy.write() = policy;
    }

    pub fn ordering(&self) -> &Arc<OrderingBuffer> {
        &self.ordering
    }

    /// Run one event through the pipeline. On success the message is queued
    /// for display.
    pub fn process(&self, event: &Event, relay_url: &str) -> Result<(), Rejection> {
        let policy = self.policy.read();
        let pubkey = event.pubkey.to_hex();
        if policy.blocked.contains(&pubkey) {
            return Err(Rejection::Blocked);
        }

        let id = event.id.to_hex();
        {
            let mut seen = self.seen.lock();
            if seen.contains(&id) {
                return Err(Rejection::Duplicate);
            }
            seen.put(id.clone(), ());
        }

        let chat = chat_of(event).ok_or(Rejection::NoChat)?;

        if policy.view_chats.contains(&chat) {
            let required = policy.pow.get(&chat).copied().unwrap_or(0);
            if !pow::is_pow_valid(event, required) {
                return Err(Rejection::InsufficientPow { required });
            }
        }

        let content = text::sanitize(&text::truncate_graphemes(
            &event.content,
            text::MAX_MESSAGE_GRAPHEMES,
        ));
        if matches_any(&content, &policy.mutes) {
            return Err(Rejection::Muted);
        }
        if !policy.filters.is_empty() && !matches_any(&content, &policy.filters) {
            return Err(Rejection::Filtered);
        }

        let nick = first_tag_value(event, "n")
            .map(text::sanitize)
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| text::derived_nick(&pubkey));
        let short_pubkey = text::short_pubkey(&pubkey);
        self.users.lock().put(
            pubkey.clone(),
            UserContext {
                nick: nick.clone(),
                chat: chat.clone(),
                short_pubkey: short_pubkey.clone(),
            },
        );

        let created_at = event.created_at.as_secs();
        let message = ChatMessage {
            chat: chat.clone(),
            nick,
            short_pubkey,
            is_own: policy.own_pubkeys.contains(&pubkey),
            full_pubkey: pubkey,
            content,
            short_id: text::short_event_id(&id),
            relay_url: relay_url.to_string(),
            timestamp: created_at,
        };
        let key = policy.stream_key(&chat);
        drop(policy);
        self.ordering.push(&key, created_at, &id, message);
        Ok(())
    }

    /// Most recently seen users first.
    pub fn users(&self) -> Vec<(String, UserContext)> {
        self.users
            .lock()
            .iter()
            .map(|(pk, ctx)| (pk.clone(), ctx.clone()))
            .collect()
    }

    /// Resolve a direct reply: the user whose `@nick#short` handle is the
    /// longest prefix of `message`.
    pub fn resolve_reply(&self, message: &str) -> Option<(String, UserContext)> {
        self.users()
            .into_iter()
            .filter(|(_, ctx)| message.starts_with(&ctx.handle()))
            .max_by_key(|(_, ctx)| ctx.handle().len())
    }

    /// First cached user whose handle starts with `prefix`.
    pub fn find_by_handle_prefix(&self, prefix: &str) -> Option<(String, UserContext)> {
        self.users()
            .into_iter()
            .find(|(_, ctx)| ctx.handle().starts_with(prefix))
    }

    /// `@nick#short ` completions for users seen in `chats`.
    pub fn complete_nick(&self, prefix: &str, chats: &HashSet<String>) -> Vec<String> {
        let prefix = prefix.strip_prefix('@').unwrap_or(prefix);
        let mut entries: Vec<String> = self
            .users()
            .into_iter()
            .filter(|(_, ctx)| chats.contains(&ctx.chat) && ctx.nick.starts_with(prefix))
            .map(|(_, ctx)| format!("{} ", ctx.handle()))
            .collect();
        entries.sort();
        entries.dedup();
        entries.truncate(MAX_COMPLETIONS);
        entries
    }
}

impl EventSink for Ingestor {
    fn ingest(&self, event: Box<Event>, relay_url: &str) {
        match self.process(&event, relay_url) {
            Ok(()) => {}
            Err(Rejection::InsufficientPow { required }) => {
                tracing::debug!(id = %event.id, relay = %relay_url, required, "dropped event failing PoW check");
            }
            Err(Rejection::Duplicate) => {}
            Err(reason) => {
                tracing::debug!(id = %event.id, relay = %relay_url, ?reason, "dropped event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nostr_sdk::prelude::Keys;
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    use super::*;
    use crate::event::EventDraft;
    use crate::updates::DisplayEvent;

    fn ingestor() -> (Ingestor, flume::Receiver<DisplayEvent>) {
        let (tx, rx) = flume::unbounded();
        let ordering = Arc::new(OrderingBuffer::new(
            tx,
            Duration::from_millis(200),
            256,
            TaskTracker::new(),
            CancellationToken::new(),
        ));
        (Ingestor::new(64, 64, ordering), rx)
    }

    fn chat_event(keys: &Keys, chat: &str, content: &str) -> Event {
        EventDraft::chat_message(chat, content).sign(keys).unwrap()
    }

    fn drain(ingestor: &Ingestor, rx: &flume::Receiver<DisplayEvent>) -> Vec<ChatMessage> {
        ingestor.ordering().flush_all();
        rx.try_iter()
            .filter_map(|ev| match ev {
                DisplayEvent::NewMessage(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn duplicates_are_displayed_once() {
        let (ing, rx) = ingestor();
        let keys = Keys::generate();
        let ev = chat_event(&keys, "nostr", "hello");
        assert_eq!(ing.process(&ev, "wss://a"), Ok(()));
        assert_eq!(ing.process(&ev, "wss://b"), Err(Rejection::Duplicate));
        let msgs = drain(&ing, &rx);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].relay_url, "wss://a");
        assert_eq!(msgs[0].chat, "nostr");
        assert_eq!(msgs[0].short_pubkey, text::short_pubkey(&keys.public_key().to_hex()));
        assert_eq!(msgs[0].nick, text::derived_nick(&keys.public_key().to_hex()));
    }

    #[tokio::test]
    async fn blocked_and_chatless_events_are_dropped() {
        let (ing, rx) = ingestor();
        let keys = Keys::generate();
        ing.set_policy(IngestPolicy {
            blocked: [keys.public_key().to_hex()].into(),
            ..IngestPolicy::default()
        });
        assert_eq!(
            ing.process(&chat_event(&keys, "nostr", "hi"), "wss://a"),
            Err(Rejection::Blocked)
        );

        let other = Keys::generate();
        let chatless = EventDraft::verification_probe().sign(&other).unwrap();
        assert_eq!(ing.process(&chatless, "wss://a"), Err(Rejection::NoChat));
        assert!(drain(&ing, &rx).is_empty());
    }

    #[tokio::test]
    async fn pow_is_enforced_only_for_the_active_view() {
        let (ing, _rx) = ingestor();
        let keys = Keys::generate();
        ing.set_policy(IngestPolicy {
            view_chats: ["nostr".to_string()].into(),
            pow: [("nostr".to_string(), 8), ("other".to_string(), 8)].into(),
            ..IngestPolicy::default()
        });
        assert_eq!(
            ing.process(&chat_event(&keys, "nostr", "cheap"), "wss://a"),
            Err(Rejection::InsufficientPow { required: 8 })
        );
        // outside the active view no PoW is required
        assert_eq!(ing.process(&chat_event(&keys, "other", "cheap"), "wss://a"), Ok(()));

        let mined = pow::mine(
            EventDraft::chat_message("nostr", "worked"),
            &keys.public_key(),
            8,
            &CancellationToken::new(),
        )
        .unwrap()
        .sign(&keys)
        .unwrap();
        assert_eq!(ing.process(&mined, "wss://a"), Ok(()));
    }

    #[tokio::test]
    async fn mutes_win_over_filters() {
        let (ing, rx) = ingestor();
        let keys = Keys::generate();
        ing.set_policy(IngestPolicy {
            mutes: vec![CompiledPattern::compile("spam")],
            filters: vec![CompiledPattern::compile("/^gm/")],
            ..IngestPolicy::default()
        });
        assert_eq!(
            ing.process(&chat_event(&keys, "nostr", "gm spam"), "wss://a"),
            Err(Rejection::Muted)
        );
        assert_eq!(
            ing.process(&chat_event(&keys, "nostr", "hello"), "wss://a"),
            Err(Rejection::Filtered)
        );
        assert_eq!(ing.process(&chat_event(&keys, "nostr", "gm all"), "wss://a"), Ok(()));
        assert_eq!(drain(&ing, &rx).len(), 1);
    }

    #[tokio::test]
    async fn content_and_nick_are_sanitized() {
        let (ing, rx) = ingestor();
        let keys = Keys::generate();
        let ev = EventDraft::chat_message("nostr", "hi\u{202E}there\u{7}")
            .with_tag(["n", "ja\u{200B}n"])
            .sign(&keys)
            .unwrap();
        ing.process(&ev, "wss://a").unwrap();
        let msgs = drain(&ing, &rx);
        assert_eq!(msgs[0].content, "hithere");
        assert_eq!(msgs[0].nick, "jan");
        assert_eq!(msgs[0].short_id, text::short_event_id(&ev.id.to_hex()));
    }

    #[tokio::test]
    async fn own_messages_are_flagged() {
        let (ing, rx) = ingestor();
        let me = Keys::generate();
        ing.set_policy(IngestPolicy {
            own_pubkeys: [me.public_key().to_hex()].into(),
            ..IngestPolicy::default()
        });
        ing.process(&chat_event(&me, "nostr", "mine"), "wss://a").unwrap();
        ing.process(&chat_event(&Keys::generate(), "nostr", "theirs"), "wss://a")
            .unwrap();
        let msgs = drain(&ing, &rx);
        let own: Vec<bool> = msgs.iter().map(|m| m.is_own).collect();
        assert_eq!(own.iter().filter(|o| **o).count(), 1);
    }

    #[tokio::test]
    async fn user_cache_drives_replies_and_completion() {
        let (ing, _rx) = ingestor();
        let a = Keys::generate();
        let b = Keys::generate();
        let ev_a = EventDraft::chat_message("nostr", "x").with_tag(["n", "jan"]).sign(&a).unwrap();
        let ev_b = EventDraft::chat_message("u4pr", "y").with_tag(["n", "jana"]).sign(&b).unwrap();
        ing.process(&ev_a, "wss://a").unwrap();
        ing.process(&ev_b, "wss://a").unwrap();

        let spk_a = text::short_pubkey(&a.public_key().to_hex());
        let spk_b = text::short_pubkey(&b.public_key().to_hex());

        let (pk, ctx) = ing.resolve_reply(&format!("@jana#{spk_b} hello")).unwrap();
        assert_eq!(pk, b.public_key().to_hex());
        assert_eq!(ctx.chat, "u4pr");
        assert!(ing.resolve_reply("@nobody#0000 hi").is_none());

        let chats: HashSet<String> = ["nostr".to_string()].into();
        assert_eq!(ing.complete_nick("@ja", &chats), vec![format!("@jan#{spk_a} ")]);
        let both: HashSet<String> = ["nostr".to_string(), "u4pr".to_string()].into();
        assert_eq!(ing.complete_nick("ja", &both).len(), 2);

        let (found, _) = ing.find_by_handle_prefix("@jan#").unwrap();
        assert_eq!(found, a.public_key().to_hex());
    }

    #[test]
    fn group_children_share_a_stream() {
        let policy = IngestPolicy {
            view_chats: ["a".to_string(), "b".to_string()].into(),
            active_group: Some("Group-abc123".into()),
            ..IngestPolicy::default()
        };
        assert_eq!(policy.stream_key("a"), "group:Group-abc123");
        assert_eq!(policy.stream_key("c"), "chat:c");
        assert_eq!(IngestPolicy::default().stream_key("a"), "chat:a");
    }
}
