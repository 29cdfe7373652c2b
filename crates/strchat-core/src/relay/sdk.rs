use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::transport::{
    RelayConnection, RelayConnector, RelaySubscription, SubscriptionFilter, SubscriptionMessage,
};

const LIVENESS_POLL: Duration = Duration::from_secs(2);
const FORWARD_BUFFER: usize = 1024;

/// Opens one nostr-sdk client per relay URL so each relay's subscription
/// state and failure stay isolated.
pub struct NostrConnector {
    keys: Keys,
}

impl NostrConnector {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl RelayConnector for NostrConnector {
    async fn connect(&self, url: &str, timeout: Duration) -> Result<Arc<dyn RelayConnection>> {
        crate::tls::init_rustls_crypto_provider();
        let relay_url = RelayUrl::parse(url).with_context(|| format!("parse relay url: {url}"))?;
        let client = Client::new(self.keys.clone());
        client
            .add_relay(relay_url.clone())
            .await
            .with_context(|| format!("add relay {url}"))?;
        client.connect().await;
        client.wait_for_connection(timeout).await;

        let connected = match client.relay(relay_url.clone()).await {
            Ok(relay) => relay.is_connected(),
            Err(_) => false,
        };
        if !connected {
            client.shutdown().await;
            bail!("connect {url}: not connected after {timeout:?}");
        }
        tracing::debug!(relay = %url, "websocket connected");
        Ok(Arc::new(NostrConnection {
            url: url.to_string(),
            relay_url,
            client,
            subs: Mutex::new(HashMap::new()),
            next_sub: AtomicU64::new(1),
        }))
    }
}

struct ForwardedSub {
    nostr_ids: Vec<SubscriptionId>,
    cancel: CancellationToken,
}

pub struct NostrConnection {
    url: String,
    relay_url: RelayUrl,
    client: Client,
    subs: Mutex<HashMap<String, ForwardedSub>>,
    next_sub: AtomicU64,
}

impl NostrConnection {
    async fn relay_connected(client: &Client, relay_url: &RelayUrl) -> bool {
        match client.relay(relay_url.clone()).await {
            Ok(relay) => relay.is_connected(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl RelayConnection for NostrConnection {
    fn url(&self) -> &str {
        &self.url
    }

    async fn is_connected(&self) -> bool {
        Self::relay_connected(&self.client, &self.relay_url).await
    }

    async fn subscribe(&self, filters: Vec<SubscriptionFilter>) -> Result<RelaySubscription> {
        // Take the receiver before subscribing so nothing between REQ and
        // the forwarder start is lost.
        let mut notifications = self.client.notifications();

        let mut nostr_ids = Vec::with_capacity(filters.len());
        for filter in &filters {
            let out = self
                .client
                .subscribe(filter.to_nostr(), None)
                .await
                .with_context(|| format!("subscribe on {}", self.url))?;
            nostr_ids.push(out.val);
        }

        let id = format!("sub-{}", self.next_sub.fetch_add(1, Ordering::SeqCst));
        let cancel = CancellationToken::new();
        self.subs.lock().insert(
            id.clone(),
            ForwardedSub {
                nostr_ids: nostr_ids.clone(),
                cancel: cancel.clone(),
            },
        );

        let (tx, rx) = mpsc::channel(FORWARD_BUFFER);
        let client = self.client.clone();
        let relay_url = self.relay_url.clone();
        let log_id = id.clone();
        tokio::spawn(async move {
            let wanted: HashSet<SubscriptionId> = nostr_ids.into_iter().collect();
            let mut awaiting_eose = wanted.clone();
            let mut liveness = tokio::time::interval(LIVENESS_POLL);
            liveness.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = liveness.tick() => {
                        if !NostrConnection::relay_connected(&client, &relay_url).await {
                            tracing::info!(relay = %relay_url, sub = %log_id, "relay disconnected, ending subscription");
                            break;
                        }
                    }
                    notification = notifications.recv() => match notification {
                        Ok(RelayPoolNotification::Event { subscription_id, event, .. }) => {
                            if wanted.contains(&subscription_id)
                                && tx.send(SubscriptionMessage::Event(event)).await.is_err()
                            {
                                break;
                            }
                        }
                        Ok(RelayPoolNotification::Message { message, .. }) => match message {
                            RelayMessage::EndOfStoredEvents(sid) if wanted.contains(&*sid) => {
                                let was_pending = awaiting_eose.remove(&*sid);
                                if was_pending
                                    && awaiting_eose.is_empty()
                                    && tx.send(SubscriptionMessage::EndOfStoredEvents).await.is_err()
                                {
                                    break;
                                }
                            }
                            RelayMessage::Closed { subscription_id, message } if wanted.contains(&*subscription_id) => {
                                tracing::warn!(relay = %relay_url, sub = %log_id, reason = %message, "relay closed subscription");
                                break;
                            }
                            _ => {}
                        },
                        Ok(RelayPoolNotification::Shutdown) => break,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(relay = %relay_url, skipped, "notification stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Ok(RelaySubscription { id, messages: rx })
    }

    async fn unsubscribe(&self, id: &str) {
        let Some(sub) = self.subs.lock().remove(id) else {
            return;
        };
        sub.cancel.cancel();
        for sid in &sub.nostr_ids {
            let _ = self.client.unsubscribe(sid).await;
        }
    }

    async fn publish(&self, event: &Event, timeout: Duration) -> Result<()> {
        let out = tokio::time::timeout(
            timeout,
            self.client.send_event_to([self.relay_url.clone()], event),
        )
        .await
        .map_err(|_| anyhow!("publish to {} timed out", self.url))?
        .with_context(|| format!("send_event_to {}", self.url))?;
        if out.success.is_empty() {
            let reasons: Vec<String> = out.failed.values().cloned().collect();
            bail!("{}", reasons.join("; "));
        }
        Ok(())
    }

    async fn close(&self) {
        let subs: Vec<ForwardedSub> = self.subs.lock().drain().map(|(_, s)| s).collect();
        for sub in subs {
            sub.cancel.cancel();
        }
        self.client.shutdown().await;
    }
}
