use std::sync::OnceLock;
use std::time::Duration;

use nostr_sdk::prelude::{Event, Keys};
use regex::Regex;
use tokio::task::JoinSet;

use super::ChatCore;
use crate::error::ActionError;
use crate::event::EventDraft;
use crate::pow;
use crate::relay::pool::PublishTarget;
use crate::session::nick_for;
use crate::text;
use crate::updates::DisplayEvent;

/// Difficulty a relay asked for in a rejection message, e.g.
/// "pow: difficulty 20 required" or "attach pow with difficulty of 12".
pub(crate) fn pow_hint(reason: &str) -> Option<u32> {
    static HINT: OnceLock<Option<Regex>> = OnceLock::new();
    let re = HINT
        .get_or_init(|| Regex::new(r"(?i)\bpow\b[^0-9]*?\bdifficulty(?:\s+of)?\s*:?\s*(\d+)").ok())
        .as_ref()?;
    re.captures(reason)?.get(1)?.as_str().parse().ok()
}

/// Everything the background publish needs once the actor has decided
/// what to send.
struct Outgoing {
    chat: String,
    draft: EventDraft,
    keys: Keys,
    difficulty: u32,
}

impl ChatCore {
    pub(super) fn send_message(&mut self, raw: &str) -> Result<(), ActionError> {
        let message = raw.trim();
        if message.is_empty() {
            return Ok(());
        }
        let Some(view) = self.config.active_view() else {
            return Err(ActionError::NoActiveChat);
        };
        let is_group = view.is_group;
        let view_name = view.name.clone();

        let (chat, recipient) = if message.starts_with('@') {
            match self.ingestor.resolve_reply(message) {
                Some((pubkey, ctx)) => (ctx.chat, Some(pubkey)),
                None => return Err(ActionError::UnknownReplyTarget),
            }
        } else if is_group {
            return Err(ActionError::GroupBroadcast);
        } else {
            (view_name, None)
        };

        if self.pool.publish_targets(&chat).is_empty() {
            return Err(ActionError::NoPublishRelays(chat));
        }

        // groups speak with the main key; single chats never do
        let (keys, nick) = if is_group {
            (self.keys.clone(), nick_for(&self.keys, &self.config.nick))
        } else {
            let created = self.sessions.get(&chat).is_none();
            let session = self.sessions.ensure(&chat, &self.config.nick);
            let identity = (session.keys.clone(), session.nick.clone());
            if created {
                tracing::info!(chat = %chat, "session created on send");
                self.sync_policy();
                self.emit_state();
            }
            identity
        };

        let content = text::truncate_graphemes(message, text::MAX_MESSAGE_GRAPHEMES);
        let mut draft = EventDraft::chat_message(&chat, &content).with_tag(["n", nick.as_str()]);
        if let Some(pubkey) = &recipient {
            draft = draft.with_tag(["p", pubkey.as_str()]);
        }

        let difficulty = self.effective_pow(&chat);
        if difficulty > 0 {
            self.emit(DisplayEvent::status(format!(
                "Calculating Proof-of-Work (difficulty {difficulty})..."
            )));
        }
        tracing::debug!(chat = %chat, difficulty, reply = recipient.is_some(), "sending message");

        if let Some(previous) = self.mining.take() {
            previous.cancel();
        }
        let mining = self.cancel.child_token();
        self.mining = Some(mining.clone());

        let pool = self.pool.clone();
        let display = self.display.clone();
        let timeout = self.settings.connect_timeout;
        let outgoing = Outgoing {
            chat,
            draft,
            keys,
            difficulty,
        };
        self.tracker.spawn(async move {
            let chat = outgoing.chat.clone();
            let Some(event) = prepare(outgoing, &mining, &display).await else {
                return;
            };
            let targets = pool.publish_targets(&chat);
            if targets.is_empty() {
                let _ = display.send(DisplayEvent::error(
                    ActionError::NoPublishRelays(chat).to_string(),
                ));
                return;
            }

            let total = targets.len();
            let results = deliver(targets, &event, timeout).await;
            let mut ok = 0usize;
            for (url, res) in results {
                match res {
                    Ok(()) => ok += 1,
                    Err(reason) => {
                        tracing::warn!(relay = %url, "publish failed: {reason}");
                        let _ = display.send(DisplayEvent::error(format!(
                            "Publish failed on {url}: {reason}"
                        )));
                        match pow_hint(&reason) {
                            Some(n) => {
                                let _ = display.send(DisplayEvent::info(format!(
                                    "Hint: relay suggests PoW {n} for {chat}. Try `/pow {n}` and resend."
                                )));
                            }
                            None => pool.mark_publish_failed(&url),
                        }
                    }
                }
            }
            let _ = display.send(DisplayEvent::status(format!(
                "Event {} sent to {ok}/{total} relays for {chat}.",
                text::short_event_id(&event.id.to_hex())
            )));
            pool.emit_relays_update();
        });
        Ok(())
    }
}

/// Mine when asked to, then sign. `None` when mining was cancelled or
/// signing failed; the user has been told either way.
async fn prepare(
    outgoing: Outgoing,
    mining: &tokio_util::sync::CancellationToken,
    display: &flume::Sender<DisplayEvent>,
) -> Option<Event> {
    let Outgoing {
        draft,
        keys,
        difficulty,
        ..
    } = outgoing;
    let draft = if difficulty > 0 {
        let pubkey = keys.public_key();
        let token = mining.clone();
        match tokio::task::spawn_blocking(move || pow::mine(draft, &pubkey, difficulty, &token)).await
        {
            Ok(Some(mined)) => mined,
            Ok(None) => {
                tracing::debug!(difficulty, "mining cancelled");
                let _ = display.send(DisplayEvent::status("PoW calculation cancelled."));
                return None;
            }
            Err(err) => {
                tracing::warn!("mining task failed: {err}");
                return None;
            }
        }
    } else {
        draft
    };
    match draft.sign(&keys) {
        Ok(event) => Some(event),
        Err(err) => {
            let _ = display.send(DisplayEvent::error(format!("Failed to sign event: {err:#}")));
            None
        }
    }
}

/// Publish to every target at once. Results come back in target order.
async fn deliver(
    targets: Vec<PublishTarget>,
    event: &Event,
    timeout: Duration,
) -> Vec<(String, Result<(), String>)> {
    let mut set = JoinSet::new();
    for (idx, target) in targets.into_iter().enumerate() {
        let event = event.clone();
        set.spawn(async move {
            let res = target
                .connection
                .publish(&event, timeout)
                .await
                .map_err(|err| format!("{err:#}"));
            (idx, target.url, res)
        });
    }
    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(err) => tracing::warn!("publish task failed: {err}"),
        }
    }
    results.sort_by_key(|(idx, _, _)| *idx);
    results
        .into_iter()
        .map(|(_, url, res)| (url, res))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_pow_hints_from_relay_messages() {
        assert_eq!(pow_hint("pow: difficulty 20 required"), Some(20));
        assert_eq!(pow_hint("blocked: attach PoW with difficulty of 12"), Some(12));
        assert_eq!(pow_hint("rate-limited: slow down"), None);
        assert_eq!(pow_hint("difficulty 8"), None);
    }
}
