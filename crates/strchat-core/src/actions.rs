use serde::{Deserialize, Serialize};

/// Everything the UI can ask the core to do. Payloads are the raw user
/// text after the command word; the core parses and validates them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UserAction {
    // Messaging
    SendMessage { text: String },
    RequestNickCompletion { prefix: String },

    // Views
    ActivateView { name: String },
    CreateGroup { members: String },
    JoinChats { names: String },
    LeaveChat { name: String },
    DeleteGroup { name: String },
    DeleteView { name: String },
    ListChats,
    GetActiveChat,

    // Identity and PoW
    SetPow { difficulty: String },
    SetNick { nick: String },

    // Moderation
    BlockUser { target: String },
    UnblockUser { target: String },
    ListBlocked,
    HandleFilter { pattern: String },
    RemoveFilter { index: String },
    ClearFilters,
    HandleMute { pattern: String },
    RemoveMute { index: String },
    ClearMutes,

    // Relays
    ManageAnchors { args: String },

    GetHelp,
    Quit,
}

impl UserAction {
    /// Log-safe action tag (never includes message text).
    pub fn tag(&self) -> &'static str {
        match self {
            UserAction::SendMessage { .. } => "SendMessage",
            UserAction::RequestNickCompletion { .. } => "RequestNickCompletion",

            UserAction::ActivateView { .. } => "ActivateView",
            UserAction::CreateGroup { .. } => "CreateGroup",
            UserAction::JoinChats { .. } => "JoinChats",
            UserAction::LeaveChat { .. } => "LeaveChat",
            UserAction::DeleteGroup { .. } => "DeleteGroup",
            UserAction::DeleteView { .. } => "DeleteView",
            UserAction::ListChats => "ListChats",
            UserAction::GetActiveChat => "GetActiveChat",

            UserAction::SetPow { .. } => "SetPow",
            UserAction::SetNick { .. } => "SetNick",

            UserAction::BlockUser { .. } => "BlockUser",
            UserAction::UnblockUser { .. } => "UnblockUser",
            UserAction::ListBlocked => "ListBlocked",
            UserAction::HandleFilter { .. } => "HandleFilter",
            UserAction::RemoveFilter { .. } => "RemoveFilter",
            UserAction::ClearFilters => "ClearFilters",
            UserAction::HandleMute { .. } => "HandleMute",
            UserAction::RemoveMute { .. } => "RemoveMute",
            UserAction::ClearMutes => "ClearMutes",

            UserAction::ManageAnchors { .. } => "ManageAnchors",

            UserAction::GetHelp => "GetHelp",
            UserAction::Quit => "Quit",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_use_snake_case_tags_on_the_wire() {
        let json = serde_json::to_string(&UserAction::JoinChats {
            names: "nostr u4pr".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"action":"join_chats","names":"nostr u4pr"}"#);

        let parsed: UserAction = serde_json::from_str(r#"{"action":"list_chats"}"#).unwrap();
        assert_eq!(parsed, UserAction::ListChats);
    }

    #[test]
    fn tag_hides_message_text() {
        let action = UserAction::SendMessage {
            text: "secret plans".into(),
        };
        assert_eq!(action.tag(), "SendMessage");
    }
}
