use std::collections::HashSet;

use sha2::{Digest, Sha256};

use super::ChatCore;
use crate::config::View;
use crate::error::ActionError;
use crate::geohash;
use crate::text;
use crate::updates::DisplayEvent;

/// `Group-` plus the first six hex characters of the SHA-256 of the sorted
/// member names concatenated.
pub(super) fn group_name(members: &[String]) -> String {
    let mut sorted = members.to_vec();
    sorted.sort();
    let digest = Sha256::digest(sorted.concat().as_bytes());
    format!("Group-{}", &hex::encode(digest)[..6])
}

/// Comma-separated member list, trimmed, empties dropped, first occurrence
/// kept.
fn parse_members(raw: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .filter(|m| seen.insert(m.to_string()))
        .map(str::to_string)
        .collect()
}

impl ChatCore {
    pub(super) fn activate_view(&mut self, name: &str) -> Result<(), ActionError> {
        let Some(view) = self.config.find_view(name) else {
            return Err(ActionError::ViewNotFound(name.to_string()));
        };
        let is_group = view.is_group;
        let name = view.name.clone();

        if let Some(mining) = self.mining.take() {
            mining.cancel();
        }
        self.config.active_view_name = name.clone();

        if !is_group {
            let session = self.sessions.rotate(&name, &self.config.nick);
            let status = format!(
                "Generated new ephemeral identity for this session: {} ({}...)",
                session.nick,
                text::short_pubkey(&session.pubkey_hex())
            );
            self.emit(DisplayEvent::status(status));
        }
        tracing::info!(view = %name, is_group, "view activated");

        self.save_config();
        self.ordering.flush_all();
        self.sync_policy();
        self.emit_state();
        self.request_reconcile();
        Ok(())
    }

    pub(super) fn create_group(&mut self, raw: &str) -> Result<(), ActionError> {
        let members = parse_members(raw);
        if let Some(unknown) = members.iter().find(|m| !self.config.has_chat(m)) {
            return Err(ActionError::GroupMemberUnknown(unknown.clone()));
        }
        if members.len() < 2 {
            return Err(ActionError::GroupTooSmall);
        }
        let name = group_name(&members);
        if self.config.find_view(&name).is_some() {
            return Err(ActionError::GroupExists(name));
        }

        self.emit(DisplayEvent::status(format!(
            "Created group {name} with chats: {}",
            members.join(", ")
        )));
        self.config.views.push(View::group(&name, members));
        self.activate_view(&name)
    }

    pub(super) fn join_chats(&mut self, raw: &str) -> Result<(), ActionError> {
        let mut requested = Vec::new();
        for word in raw.split_whitespace() {
            let name = if geohash::is_geohash(word) {
                word.to_string()
            } else {
                text::normalize_chat_name(word)?
            };
            if !name.is_empty() && !requested.contains(&name) {
                requested.push(name);
            }
        }
        if requested.is_empty() {
            return Err(ActionError::NoChatsGiven);
        }

        let (existing, added): (Vec<String>, Vec<String>) = requested
            .into_iter()
            .partition(|name| self.config.find_view(name).is_some());

        if added.is_empty() {
            let message = match existing.as_slice() {
                [single] => format!("You are already in the '{single}' chat."),
                _ => format!(
                    "You are already in all specified chats: {}.",
                    existing.join(", ")
                ),
            };
            self.emit(DisplayEvent::info(message));
            return Ok(());
        }

        for name in &added {
            self.config.views.push(View::chat(name));
        }
        let active = added[0].clone();
        self.emit(DisplayEvent::status(format!(
            "Joined {} new chat(s): {}. Active: {}",
            added.len(),
            added.join(", "),
            active
        )));
        self.activate_view(&active)
    }

    /// Remove a chat, pruning it from groups. Groups left with fewer than
    /// two children go too.
    pub(super) fn leave_chat(&mut self, name: &str) {
        let before = self.config.views.len();
        self.config.views.retain(|v| v.is_group || v.name != name);
        if self.config.views.len() == before {
            return;
        }
        for view in self.config.views.iter_mut().filter(|v| v.is_group) {
            view.children.retain(|c| c != name);
        }
        let active = self.config.active_view_name.clone();
        self.config
            .views
            .retain(|v| !v.is_group || v.children.len() >= 2);

        self.sessions.remove(name);
        if active == name || self.config.find_view(&active).is_none() {
            self.config.active_view_name.clear();
        }
        tracing::info!(chat = %name, "left chat");
        self.emit(DisplayEvent::status(format!("Left chat '{name}'.")));
        self.after_view_removed();
    }

    pub(super) fn delete_group(&mut self, name: &str) {
        let before = self.config.views.len();
        self.config.views.retain(|v| !(v.is_group && v.name == name));
        if self.config.views.len() == before {
            return;
        }
        if self.config.active_view_name == name {
            self.config.active_view_name.clear();
        }
        self.emit(DisplayEvent::status(format!("Group '{name}' deleted.")));
        self.after_view_removed();
    }

    /// Empty `name` targets the active view.
    pub(super) fn delete_view(&mut self, name: &str) -> Result<(), ActionError> {
        let name = if name.is_empty() {
            match self.config.active_view() {
                Some(view) => view.name.clone(),
                None => return Err(ActionError::NoActiveChat),
            }
        } else {
            name.to_string()
        };
        let Some(view) = self.config.find_view(&name) else {
            return Err(ActionError::ViewNotFound(name));
        };
        if view.is_group {
            self.delete_group(&name);
        } else {
            self.leave_chat(&name);
        }
        Ok(())
    }

    fn after_view_removed(&mut self) {
        // the fallback view needs its own session like any activation
        if self.config.find_view(&self.config.active_view_name).is_none()
            && let Some(next) = self.config.views.first().map(|v| v.name.clone())
            && self.activate_view(&next).is_ok()
        {
            return;
        }
        if let Some(mining) = self.mining.take() {
            mining.cancel();
        }
        self.save_config();
        self.sync_policy();
        self.emit_state();
        self.request_reconcile();
    }

    pub(super) fn list_chats(&self) {
        if self.config.views.is_empty() {
            self.emit(DisplayEvent::info(
                "You are not in any chats. Use /join <chat_name> to join one.",
            ));
            return;
        }
        let mut out = String::from("Available chats and groups:\n");
        for view in &self.config.views {
            if view.is_group {
                out.push_str(&format!(" - {} (Group)\n", view.name));
            } else {
                out.push_str(&format!(" - {}\n", view.name));
            }
        }
        self.emit(DisplayEvent::info(out));
    }

    pub(super) fn get_active_chat(&self) {
        let message = match self.config.active_view() {
            Some(view) => format!("Current active chat/group is: {}", view.name),
            None => "There is no active chat/group.".to_string(),
        };
        self.emit(DisplayEvent::info(message));
    }

    pub(super) fn set_pow(&mut self, raw: &str) -> Result<(), ActionError> {
        let raw = raw.trim();
        let difficulty: i64 = raw
            .parse()
            .map_err(|_| ActionError::InvalidPow(raw.to_string()))?;
        if difficulty < 0 {
            return Err(ActionError::NegativePow);
        }
        let difficulty =
            u32::try_from(difficulty).map_err(|_| ActionError::InvalidPow(raw.to_string()))?;
        let Some(active) = self.config.active_view().map(|v| v.name.clone()) else {
            return Err(ActionError::NoActiveChat);
        };
        let Some(view) = self.config.find_view_mut(&active) else {
            return Err(ActionError::ViewNotFound(active));
        };
        view.pow = difficulty;
        let name = view.name.clone();

        let message = if difficulty > 0 {
            format!("PoW difficulty for {name} set to {difficulty}.")
        } else {
            format!("PoW disabled for {name}.")
        };
        self.emit(DisplayEvent::status(message));
        self.save_config();
        self.sync_policy();
        self.emit_state();
        Ok(())
    }

    pub(super) fn set_nick(&mut self, raw: &str) {
        let nick = raw.trim().to_string();
        let message = if nick.is_empty() {
            "Nick has been cleared.".to_string()
        } else {
            format!("Nick set to: {nick}")
        };
        self.config.nick = nick;
        self.sessions.apply_nick(&self.config.nick);
        self.emit(DisplayEvent::status(message));
        self.save_config();
        self.emit_state();
    }

    pub(super) fn complete_nick(&self, prefix: &str) {
        let chats: HashSet<String> = self.active_chats().into_iter().collect();
        let candidates = self.ingestor.complete_nick(prefix, &chats);
        self.emit(DisplayEvent::NickCompletion { candidates });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_name_ignores_member_order() {
        let a = group_name(&["nostr".into(), "u4pr".into()]);
        let b = group_name(&["u4pr".into(), "nostr".into()]);
        assert_eq!(a, b);
        assert!(a.starts_with("Group-"));
        assert_eq!(a.len(), "Group-".len() + 6);

        let digest = hex::encode(Sha256::digest(b"nostru4pr"));
        assert_eq!(a, format!("Group-{}", &digest[..6]));
    }

    #[test]
    fn members_are_trimmed_and_deduplicated() {
        assert_eq!(parse_members(" a, b ,,a ,c"), ["a", "b", "c"]);
        assert!(parse_members(" , ").is_empty());
    }
}
