use std::path::PathBuf;

/// A rejected user action. The `Display` text is what the user sees.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("chat name contains invalid character: '{0}'")]
    InvalidChatCharacter(char),
    #[error("Chat name '{0}' is too long (max {max} characters).", max = crate::text::MAX_CHAT_NAME_LEN)]
    ChatNameTooLong(String),
    #[error("Usage: /join <chat1> [chat2]...")]
    NoChatsGiven,
    #[error("Broadcasting to a group is disabled. Use @nick to send a message.")]
    GroupBroadcast,
    #[error("Could not find a known user matching your message prefix.")]
    UnknownReplyTarget,
    #[error("No active chat. Use /join <chat> to join one.")]
    NoActiveChat,
    #[error("Not connected to any suitable relays for chat {0}")]
    NoPublishRelays(String),
    #[error("Invalid PoW difficulty: '{0}'. Must be a number.")]
    InvalidPow(String),
    #[error("PoW difficulty cannot be negative.")]
    NegativePow,
    #[error("Chat or group '{0}' not found.")]
    ViewNotFound(String),
    #[error("A group needs at least two distinct chats.")]
    GroupTooSmall,
    #[error("Chat '{0}' must be joined before it can be grouped.")]
    GroupMemberUnknown(String),
    #[error("Group {0} already exists.")]
    GroupExists(String),
    #[error("Could not find user matching '{0}' to block.")]
    UserNotFound(String),
    #[error("Could not find a blocked user matching '{0}'.")]
    BlockedUserNotFound(String),
    #[error("Invalid number: {index}. Use '{list_command}' to see the list.")]
    InvalidIndex {
        index: i64,
        list_command: &'static str,
    },
    #[error("Invalid filter number.")]
    InvalidFilterNumber,
    #[error("Invalid mute number.")]
    InvalidMuteNumber,
    #[error("Invalid URL(s) skipped: {0}")]
    InvalidRelayUrls(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no config directory available on this platform")]
    NoConfigDir,
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("encode config: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid private key in config: {0}")]
    PrivateKey(String),
}
