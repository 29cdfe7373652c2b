use serde::{Deserialize, Serialize};

use crate::UserAction;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub chat: String,
    pub nick: String,
    pub short_pubkey: String,
    pub full_pubkey: String,
    pub is_own: bool,
    pub content: String,
    pub short_id: String,
    pub relay_url: String,
    pub timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewSummary {
    pub name: String,
    pub is_group: bool,
    pub children: Vec<String>,
    pub pow: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInfo {
    pub url: String,
    pub latency_ms: Option<u64>,
    pub connected: bool,
}

/// Everything the core tells the UI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DisplayEvent {
    NewMessage(ChatMessage),
    Info {
        content: String,
    },
    Status {
        content: String,
    },
    Error {
        content: String,
    },
    StateUpdate {
        views: Vec<ViewSummary>,
        active_index: usize,
        nick: String,
    },
    RelaysUpdate {
        relays: Vec<RelayInfo>,
    },
    NickCompletion {
        candidates: Vec<String>,
    },
    Shutdown,
}

impl DisplayEvent {
    pub fn info(content: impl Into<String>) -> Self {
        Self::Info {
            content: content.into(),
        }
    }

    pub fn status(content: impl Into<String>) -> Self {
        Self::Status {
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::Error {
            content: content.into(),
        }
    }
}

#[derive(Debug)]
pub enum CoreMsg {
    Action(UserAction),
    Internal(Box<InternalEvent>),
}

#[derive(Debug)]
pub enum InternalEvent {
    /// The debounced recompute window elapsed.
    RecomputeSubscriptions,
    /// A reconcile pass finished; `token` identifies which one.
    ReconcileFinished { token: u64 },
    /// The georelay dataset was downloaded.
    GeoRelaysRefreshed,
}
