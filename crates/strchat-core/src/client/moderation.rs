use super::ChatCore;
use crate::config::{BlockedUser, PatternEntry};
use crate::error::ActionError;
use crate::updates::DisplayEvent;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PatternList {
    Filters,
    Mutes,
}

impl PatternList {
    fn noun(self) -> &'static str {
        match self {
            Self::Filters => "Filter",
            Self::Mutes => "Mute",
        }
    }

    fn added(self, pattern: &str) -> String {
        match self {
            Self::Filters => format!("Added filter: {pattern}"),
            Self::Mutes => format!("Muted: {pattern}"),
        }
    }

    fn removed(self, pattern: &str) -> String {
        match self {
            Self::Filters => format!("Removed filter: {pattern}"),
            Self::Mutes => format!("Removed mute: {pattern}"),
        }
    }

    fn cleared(self) -> &'static str {
        match self {
            Self::Filters => "Cleared all filters.",
            Self::Mutes => "Cleared all mutes.",
        }
    }

    fn empty(self) -> &'static str {
        match self {
            Self::Filters => "No filters set.",
            Self::Mutes => "No mutes set.",
        }
    }

    fn heading(self) -> &'static str {
        match self {
            Self::Filters => "\nFilters:",
            Self::Mutes => "\nMutes:",
        }
    }

    fn invalid(self) -> ActionError {
        match self {
            Self::Filters => ActionError::InvalidFilterNumber,
            Self::Mutes => ActionError::InvalidMuteNumber,
        }
    }
}

fn render_patterns(list: PatternList, entries: &[PatternEntry]) -> String {
    if entries.is_empty() {
        return list.empty().to_string();
    }
    let mut out = String::from(list.heading());
    for (i, entry) in entries.iter().enumerate() {
        out.push_str(&format!("\n[{}] {}", i + 1, entry.pattern));
        if !entry.enabled {
            out.push_str(" (disabled)");
        }
    }
    out
}

/// 1-based position in a list of `len`.
fn list_position(raw: &str, len: usize) -> Option<usize> {
    let n: usize = raw.parse().ok()?;
    (1..=len).contains(&n).then(|| n - 1)
}

fn render_blocked(blocked: &[BlockedUser]) -> String {
    if blocked.is_empty() {
        return "Your block list is empty. Use /block <@nick> to block someone.".to_string();
    }
    let mut out = String::from("Blocked Users:\n");
    for (i, user) in blocked.iter().enumerate() {
        let nick = if user.nick.is_empty() {
            "(no nick saved)"
        } else {
            user.nick.as_str()
        };
        out.push_str(&format!(
            "[{}] - {} ({}...)\n",
            i + 1,
            nick,
            short_hex(&user.pubkey)
        ));
    }
    out
}

fn short_hex(pubkey: &str) -> &str {
    pubkey.get(..8).unwrap_or(pubkey)
}

impl ChatCore {
    fn moderation_changed(&self) {
        self.save_config();
        self.sync_policy();
    }

    pub(super) fn block_user(&mut self, target: &str) -> Result<(), ActionError> {
        if target.is_empty() {
            self.list_blocked();
            return Ok(());
        }
        let handle_prefix = if target.starts_with('@') {
            target.to_string()
        } else {
            format!("@{target}")
        };
        let Some((pubkey, ctx)) = self.ingestor.find_by_handle_prefix(&handle_prefix) else {
            return Err(ActionError::UserNotFound(target.to_string()));
        };
        let label = format!("{}#{}", ctx.nick, ctx.short_pubkey);
        if self.config.is_blocked(&pubkey) {
            self.emit(DisplayEvent::info(format!("User {label} is already blocked.")));
            return Ok(());
        }
        self.config.blocked_users.push(BlockedUser {
            pubkey,
            nick: label.clone(),
        });
        tracing::info!(blocked = self.config.blocked_users.len(), "user blocked");
        self.emit(DisplayEvent::status(format!(
            "Blocked user {label}. Their messages will now be hidden."
        )));
        self.moderation_changed();
        Ok(())
    }

    pub(super) fn unblock_user(&mut self, target: &str) -> Result<(), ActionError> {
        if target.is_empty() {
            self.list_blocked();
            return Ok(());
        }
        let position = if let Ok(index) = target.parse::<i64>() {
            let len = self.config.blocked_users.len() as i64;
            if index < 1 || index > len {
                return Err(ActionError::InvalidIndex {
                    index,
                    list_command: "/block",
                });
            }
            index as usize - 1
        } else {
            let needle = target.strip_prefix('@').unwrap_or(target);
            self.config
                .blocked_users
                .iter()
                .position(|b| {
                    (!b.nick.is_empty() && b.nick.starts_with(needle))
                        || b.pubkey.starts_with(needle)
                })
                .ok_or_else(|| ActionError::BlockedUserNotFound(target.to_string()))?
        };

        let removed = self.config.blocked_users.remove(position);
        let label = if removed.nick.is_empty() {
            format!("{}...", short_hex(&removed.pubkey))
        } else {
            removed.nick
        };
        self.emit(DisplayEvent::status(format!("Unblocked user {label}.")));
        self.moderation_changed();
        Ok(())
    }

    pub(super) fn list_blocked(&self) {
        self.emit(DisplayEvent::info(render_blocked(&self.config.blocked_users)));
    }

    fn patterns_mut(&mut self, list: PatternList) -> &mut Vec<PatternEntry> {
        match list {
            PatternList::Filters => &mut self.config.filters,
            PatternList::Mutes => &mut self.config.mutes,
        }
    }

    /// No argument lists, a number toggles that entry, anything else is
    /// added as a new pattern.
    fn handle_pattern(&mut self, list: PatternList, arg: &str) -> Result<(), ActionError> {
        if arg.is_empty() {
            let entries = match list {
                PatternList::Filters => &self.config.filters,
                PatternList::Mutes => &self.config.mutes,
            };
            self.emit(DisplayEvent::info(render_patterns(list, entries)));
            return Ok(());
        }
        let message = if arg.parse::<i64>().is_ok() {
            let entries = self.patterns_mut(list);
            let idx = list_position(arg, entries.len()).ok_or_else(|| list.invalid())?;
            let entry = &mut entries[idx];
            entry.enabled = !entry.enabled;
            format!(
                "{} [{}] {}: {}",
                list.noun(),
                idx + 1,
                if entry.enabled { "enabled" } else { "disabled" },
                entry.pattern
            )
        } else {
            self.patterns_mut(list).push(PatternEntry::new(arg));
            list.added(arg)
        };
        self.emit(DisplayEvent::status(message));
        self.moderation_changed();
        Ok(())
    }

    /// An empty argument clears the list.
    fn remove_pattern(&mut self, list: PatternList, arg: &str) -> Result<(), ActionError> {
        if arg.is_empty() {
            self.clear_patterns(list);
            return Ok(());
        }
        let entries = self.patterns_mut(list);
        let idx = list_position(arg, entries.len()).ok_or_else(|| list.invalid())?;
        let removed = entries.remove(idx);
        self.emit(DisplayEvent::status(list.removed(&removed.pattern)));
        self.moderation_changed();
        Ok(())
    }

    fn clear_patterns(&mut self, list: PatternList) {
        self.patterns_mut(list).clear();
        self.emit(DisplayEvent::status(list.cleared()));
        self.moderation_changed();
    }

    pub(super) fn handle_filter(&mut self, arg: &str) -> Result<(), ActionError> {
        self.handle_pattern(PatternList::Filters, arg)
    }

    pub(super) fn remove_filter(&mut self, arg: &str) -> Result<(), ActionError> {
        self.remove_pattern(PatternList::Filters, arg)
    }

    pub(super) fn clear_filters(&mut self) {
        self.clear_patterns(PatternList::Filters);
    }

    pub(super) fn handle_mute(&mut self, arg: &str) -> Result<(), ActionError> {
        self.handle_pattern(PatternList::Mutes, arg)
    }

    pub(super) fn remove_mute(&mut self, arg: &str) -> Result<(), ActionError> {
        self.remove_pattern(PatternList::Mutes, arg)
    }

    pub(super) fn clear_mutes(&mut self) {
        self.clear_patterns(PatternList::Mutes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_listing_marks_disabled_entries() {
        let entries = vec![
            PatternEntry::new("spam"),
            PatternEntry {
                pattern: "/^gm/".into(),
                enabled: false,
            },
        ];
        assert_eq!(
            render_patterns(PatternList::Mutes, &entries),
            "\nMutes:\n[1] spam\n[2] /^gm/ (disabled)"
        );
        assert_eq!(render_patterns(PatternList::Filters, &[]), "No filters set.");
    }

    #[test]
    fn positions_are_one_based() {
        assert_eq!(list_position("1", 2), Some(0));
        assert_eq!(list_position("2", 2), Some(1));
        assert_eq!(list_position("0", 2), None);
        assert_eq!(list_position("3", 2), None);
        assert_eq!(list_position("x", 2), None);
    }

    #[test]
    fn block_list_shows_short_pubkeys() {
        let blocked = vec![
            BlockedUser {
                pubkey: "abcdef0123456789".into(),
                nick: "jan#6789".into(),
            },
            BlockedUser {
                pubkey: "0011223344556677".into(),
                nick: String::new(),
            },
        ];
        assert_eq!(
            render_blocked(&blocked),
            "Blocked Users:\n[1] - jan#6789 (abcdef01...)\n[2] - (no nick saved) (00112233...)\n"
        );
        assert!(render_blocked(&[]).starts_with("Your block list is empty."));
    }
}
