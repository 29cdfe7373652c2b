use std::collections::HashMap;

use nostr_sdk::prelude::Keys;

use crate::text;

/// Ephemeral identity used while a chat is active.
#[derive(Clone, Debug)]
pub struct ChatSession {
    pub keys: Keys,
    pub nick: String,
}

impl ChatSession {
    pub fn pubkey_hex(&self) -> String {
        self.keys.public_key().to_hex()
    }
}

/// Per-chat ephemeral identities. The main key never appears here.
#[derive(Debug, Default)]
pub struct ChatSessions {
    sessions: HashMap<String, ChatSession>,
}

impl ChatSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh keypair for `chat`. A persistent nick overrides the derived one.
    pub fn rotate(&mut self, chat: &str, persistent_nick: &str) -> &ChatSession {
        let keys = Keys::generate();
        let nick = nick_for(&keys, persistent_nick);
        self.sessions.insert(chat.to_string(), ChatSession { keys, nick });
        &self.sessions[chat]
    }

    /// The session for `chat`, generated on first use.
    pub fn ensure(&mut self, chat: &str, persistent_nick: &str) -> &ChatSession {
        self.sessions.entry(chat.to_string()).or_insert_with(|| {
            let keys = Keys::generate();
            let nick = nick_for(&keys, persistent_nick);
            ChatSession { keys, nick }
        })
    }

    pub fn get(&self, chat: &str) -> Option<&ChatSession> {
        self.sessions.get(chat)
    }

    pub fn remove(&mut self, chat: &str) -> Option<ChatSession> {
        self.sessions.remove(chat)
    }

    /// Re-derive every session nick after the persistent nick changed.
    pub fn apply_nick(&mut self, persistent_nick: &str) {
        for session in self.sessions.values_mut() {
            session.nick = nick_for(&session.keys, persistent_nick);
        }
    }

    pub fn pubkeys(&self) -> impl Iterator<Item = String> + '_ {
        self.sessions.values().map(ChatSession::pubkey_hex)
    }
}

pub fn nick_for(keys: &Keys, persistent_nick: &str) -> String {
    let nick = persistent_nick.trim();
    if nick.is_empty() {
        text::derived_nick(&keys.public_key().to_hex())
    } else {
        nick.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_replaces_the_key() {
        let mut sessions = ChatSessions::new();
        let first = sessions.rotate("nostr", "").pubkey_hex();
        let second = sessions.rotate("nostr", "").pubkey_hex();
        assert_ne!(first, second);
        assert_eq!(sessions.pubkeys().count(), 1);
        assert_eq!(
            sessions.get("nostr").unwrap().nick,
            text::derived_nick(&second)
        );
    }

    #[test]
    fn ensure_keeps_an_existing_session() {
        let mut sessions = ChatSessions::new();
        let created = sessions.ensure("nostr", "").pubkey_hex();
        assert_eq!(sessions.ensure("nostr", "").pubkey_hex(), created);
        assert_ne!(sessions.ensure("rust", "").pubkey_hex(), created);
        assert_eq!(sessions.pubkeys().count(), 2);
    }

    #[test]
    fn persistent_nick_overrides_and_clears() {
        let mut sessions = ChatSessions::new();
        sessions.rotate("nostr", "jan");
        assert_eq!(sessions.get("nostr").unwrap().nick, "jan");
        sessions.apply_nick("");
        let session = sessions.get("nostr").unwrap();
        assert_eq!(session.nick, text::derived_nick(&session.pubkey_hex()));
        assert!(sessions.remove("nostr").is_some());
        assert!(sessions.get("nostr").is_none());
    }
}
