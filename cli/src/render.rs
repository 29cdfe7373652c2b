use chrono::{DateTime, Local};
use strchat_core::{ChatMessage, DisplayEvent};

fn clock(timestamp: u64) -> String {
    DateTime::from_timestamp(timestamp as i64, 0)
        .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string())
}

fn message_line(msg: &ChatMessage) -> String {
    let marker = if msg.is_own { "*" } else { "" };
    format!(
        "{} [{}] {}{}#{}: {}",
        clock(msg.timestamp),
        msg.chat,
        marker,
        msg.nick,
        msg.short_pubkey,
        msg.content
    )
}

/// Text-mode line for a display event. `None` for events with nothing to
/// show.
pub fn render(ev: &DisplayEvent) -> Option<String> {
    match ev {
        DisplayEvent::NewMessage(msg) => Some(message_line(msg)),
        DisplayEvent::Info { content } => Some(content.trim_end().to_string()),
        DisplayEvent::Status { content } => Some(format!("-- {content}")),
        DisplayEvent::Error { content } => Some(format!("!! {content}")),
        DisplayEvent::StateUpdate {
            views,
            active_index,
            nick,
        } => {
            let active = views.get(*active_index)?;
            let kind = if active.is_group { "group" } else { "chat" };
            Some(format!("-- {kind} {} as {nick}", active.name))
        }
        DisplayEvent::RelaysUpdate { relays } => {
            let connected = relays.iter().filter(|r| r.connected).count();
            Some(format!("-- relays: {connected}/{} connected", relays.len()))
        }
        DisplayEvent::NickCompletion { candidates } if candidates.is_empty() => {
            Some("-- no matching nicks".to_string())
        }
        DisplayEvent::NickCompletion { candidates } => {
            Some(format!("-- {}", candidates.join(" ").trim_end()))
        }
        DisplayEvent::Shutdown => None,
    }
}

#[cfg(test)]
mod tests {
    use strchat_core::{RelayInfo, ViewSummary};

    use super::*;

    #[test]
    fn messages_show_chat_handle_and_own_marker() {
        let msg = ChatMessage {
            chat: "nostr".into(),
            nick: "jan".into(),
            short_pubkey: "beef".into(),
            full_pubkey: "00beef".into(),
            is_own: true,
            content: "gm".into(),
            short_id: "1234".into(),
            relay_url: "wss://relay.example".into(),
            timestamp: 1_700_000_000,
        };
        let line = render(&DisplayEvent::NewMessage(msg)).unwrap();
        assert!(line.ends_with(" [nostr] *jan#beef: gm"), "{line}");
        assert_eq!(line.split(' ').next().unwrap().len(), "00:00:00".len());
    }

    #[test]
    fn state_and_relay_summaries() {
        let state = DisplayEvent::StateUpdate {
            views: vec![ViewSummary {
                name: "Group-abc123".into(),
                is_group: true,
                children: vec!["a".into(), "b".into()],
                pow: 0,
            }],
            active_index: 0,
            nick: "jan".into(),
        };
        assert_eq!(render(&state).unwrap(), "-- group Group-abc123 as jan");

        let empty = DisplayEvent::StateUpdate {
            views: Vec::new(),
            active_index: 0,
            nick: "jan".into(),
        };
        assert_eq!(render(&empty), None);

        let relays = DisplayEvent::RelaysUpdate {
            relays: vec![
                RelayInfo {
                    url: "wss://a".into(),
                    latency_ms: Some(12),
                    connected: true,
                },
                RelayInfo {
                    url: "wss://b".into(),
                    latency_ms: None,
                    connected: false,
                },
            ],
        };
        assert_eq!(render(&relays).unwrap(), "-- relays: 1/2 connected");
        assert_eq!(render(&DisplayEvent::Shutdown), None);
    }
}
