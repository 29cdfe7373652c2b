//! Chat event kinds, tag conventions and unsigned drafts.

use anyhow::{Context, Result};
use nostr_sdk::prelude::*;
use sha2::{Digest, Sha256};

use crate::geohash;

pub const GEOHASH_CHAT_KIND: u16 = 20000;
pub const NAMED_CHAT_KIND: u16 = 23333;
pub const RELAY_LIST_KIND: u16 = 10002;
pub const CLIENT_NAME: &str = "strchat-tui";

pub fn chat_kind(chat: &str) -> u16 {
    if geohash::is_geohash(chat) {
        GEOHASH_CHAT_KIND
    } else {
        NAMED_CHAT_KIND
    }
}

/// Single-letter tag carrying the chat name: `g` for geohash chats, `d` otherwise.
pub fn chat_tag_letter(chat: &str) -> char {
    if geohash::is_geohash(chat) { 'g' } else { 'd' }
}

pub fn first_tag_value<'a>(event: &'a Event, name: &str) -> Option<&'a str> {
    event.tags.iter().find_map(|tag| {
        let parts = tag.as_slice();
        if parts.len() >= 2 && parts[0] == name {
            Some(parts[1].as_str())
        } else {
            None
        }
    })
}

/// Chat an inbound event belongs to, `g` tag first, then `d`.
pub fn chat_of(event: &Event) -> Option<String> {
    first_tag_value(event, "g")
        .or_else(|| first_tag_value(event, "d"))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// An event before signing. Tags are kept as raw string arrays so the id
/// can be recomputed cheaply while mining.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventDraft {
    pub kind: u16,
    pub content: String,
    pub tags: Vec<Vec<String>>,
    pub created_at: Timestamp,
}

impl EventDraft {
    pub fn chat_message(chat: &str, content: &str) -> Self {
        Self {
            kind: chat_kind(chat),
            content: content.to_string(),
            tags: vec![vec![chat_tag_letter(chat).to_string(), chat.to_string()]],
            created_at: Timestamp::now(),
        }
    }

    /// Disposable event published while verifying a relay.
    pub fn verification_probe() -> Self {
        Self {
            kind: GEOHASH_CHAT_KIND,
            content: String::new(),
            tags: vec![vec!["client".to_string(), CLIENT_NAME.to_string()]],
            created_at: Timestamp::now(),
        }
    }

    pub fn with_tag<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.push(values.into_iter().map(Into::into).collect());
        self
    }

    /// NIP-01 event id for this draft signed by `pubkey`.
    pub fn id_hex(&self, pubkey: &PublicKey) -> String {
        let canonical = serde_json::json!([
            0,
            pubkey.to_hex(),
            self.created_at.as_secs(),
            self.kind,
            self.tags,
            self.content,
        ]);
        hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
    }

    pub fn sign(self, keys: &Keys) -> Result<Event> {
        let tags: Vec<Tag> = self
            .tags
            .into_iter()
            .filter(|parts| !parts.is_empty())
            .map(|mut parts| {
                let values = parts.split_off(1);
                Tag::custom(TagKind::custom(parts.remove(0)), values)
            })
            .collect();
        UnsignedEvent::new(
            keys.public_key(),
            self.created_at,
            Kind::from(self.kind),
            tags,
            self.content,
        )
        .sign_with_keys(keys)
        .context("sign chat event")
    }
}
