use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use nostr_sdk::prelude::*;
use tokio::sync::mpsc;

/// Wire filter understood by every transport. Maps onto a nostr `Filter`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub kinds: Vec<u16>,
    pub tag: Option<(char, Vec<String>)>,
    pub ids: Vec<String>,
    pub since: Option<u64>,
    pub limit: Option<usize>,
}

impl SubscriptionFilter {
    /// Live filter for one chat, starting now.
    pub fn for_chat(chat: &str) -> Self {
        Self {
            kinds: vec![crate::event::chat_kind(chat)],
            tag: Some((crate::event::chat_tag_letter(chat), vec![chat.to_string()])),
            ids: Vec::new(),
            since: Some(Timestamp::now().as_secs()),
            limit: None,
        }
    }

    pub fn relay_lists() -> Self {
        Self {
            kinds: vec![crate::event::RELAY_LIST_KIND],
            ..Self::default()
        }
    }

    pub fn by_id(id_hex: &str) -> Self {
        Self {
            ids: vec![id_hex.to_string()],
            ..Self::default()
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind.as_u16()) {
            return false;
        }
        if !self.ids.is_empty() && !self.ids.iter().any(|id| *id == event.id.to_hex()) {
            return false;
        }
        if let Some(since) = self.since
            && event.created_at.as_secs() < since
        {
            return false;
        }
        if let Some((letter, values)) = &self.tag {
            let letter = letter.to_string();
            let tagged = event.tags.iter().any(|tag| {
                let parts = tag.as_slice();
                parts.len() >= 2 && parts[0] == letter && values.contains(&parts[1])
            });
            if !tagged {
                return false;
            }
        }
        true
    }

    pub fn to_nostr(&self) -> Filter {
        let mut filter = Filter::new();
        if !self.kinds.is_empty() {
            filter = filter.kinds(self.kinds.iter().map(|k| Kind::from(*k)));
        }
        let ids: Vec<EventId> = self
            .ids
            .iter()
            .filter_map(|id| EventId::from_hex(id).ok())
            .collect();
        if !ids.is_empty() {
            filter = filter.ids(ids);
        }
        if let Some((letter, values)) = &self.tag
            && let Some(alphabet) = tag_alphabet(*letter)
        {
            filter = filter.custom_tags(SingleLetterTag::lowercase(alphabet), values.clone());
        }
        if let Some(since) = self.since {
            filter = filter.since(Timestamp::from(since));
        }
        if let Some(limit) = self.limit {
            filter = filter.limit(limit);
        }
        filter
    }
}

fn tag_alphabet(letter: char) -> Option<Alphabet> {
    match letter {
        'd' => Some(Alphabet::D),
        'g' => Some(Alphabet::G),
        'p' => Some(Alphabet::P),
        _ => None,
    }
}

#[derive(Clone, Debug)]
pub enum SubscriptionMessage {
    Event(Box<Event>),
    EndOfStoredEvents,
}

/// A live subscription. The channel closing means the relay closed it or
/// the connection died.
#[derive(Debug)]
pub struct RelaySubscription {
    pub id: String,
    pub messages: mpsc::Receiver<SubscriptionMessage>,
}

/// One physical connection to a relay.
#[async_trait]
pub trait RelayConnection: Send + Sync {
    fn url(&self) -> &str;
    async fn is_connected(&self) -> bool;
    async fn subscribe(&self, filters: Vec<SubscriptionFilter>) -> Result<RelaySubscription>;
    async fn unsubscribe(&self, id: &str);
    async fn publish(&self, event: &Event, timeout: Duration) -> Result<()>;
    async fn close(&self);
}

/// Opens connections. Production uses nostr-sdk; tests and offline mode
/// use the in-process network.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, url: &str, timeout: Duration) -> Result<Arc<dyn RelayConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventDraft;

    #[test]
    fn chat_filter_matches_only_its_chat() {
        let keys = Keys::generate();
        let mut draft = EventDraft::chat_message("nostr", "hi");
        draft.created_at = Timestamp::from(Timestamp::now().as_secs() + 5);
        let event = draft.sign(&keys).unwrap();

        let filter = SubscriptionFilter::for_chat("nostr");
        assert!(filter.matches(&event));
        assert!(!SubscriptionFilter::for_chat("other").matches(&event));
        assert!(!SubscriptionFilter::for_chat("u4pr").matches(&event));
    }

    #[test]
    fn since_excludes_older_events() {
        let keys = Keys::generate();
        let mut draft = EventDraft::chat_message("nostr", "old");
        draft.created_at = Timestamp::from(1_000u64);
        let event = draft.sign(&keys).unwrap();
        assert!(!SubscriptionFilter::for_chat("nostr").matches(&event));
    }

    #[test]
    fn id_filter_matches_exact_event() {
        let keys = Keys::generate();
        let event = EventDraft::verification_probe().sign(&keys).unwrap();
        assert!(SubscriptionFilter::by_id(&event.id.to_hex()).matches(&event));
        assert!(!SubscriptionFilter::by_id(&"0".repeat(64)).matches(&event));
    }
}
