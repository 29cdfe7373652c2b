//! Relay discovery: crawl kind-10002 relay lists outward from the anchors,
//! verify each new candidate and feed survivors to the pool.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use nostr_sdk::prelude::{Event, Keys};
use parking_lot::{Mutex, RwLock};
use strchat_relay_profiles::{is_secure_relay_url, normalize_relay_url};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::store::DiscoveredRelayStore;
use crate::config::EngineSettings;
use crate::debounce::Debouncer;
use crate::event::{EventDraft, RELAY_LIST_KIND};
use crate::relay::transport::{RelayConnector, SubscriptionFilter, SubscriptionMessage};
use crate::relay::{FailureCache, RelayPool};

/// Why a relay-list entry was not verified.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Skip {
    Malformed,
    Insecure,
    Marker,
    Anchor,
    Failed,
    Connected,
    Verified,
    Verifying,
}

pub struct Crawler {
    connector: Arc<dyn RelayConnector>,
    pool: Arc<RelayPool>,
    store: Arc<DiscoveredRelayStore>,
    failures: Arc<FailureCache>,
    debouncer: Debouncer,
    keys: Keys,
    anchors: RwLock<Vec<String>>,
    verifying: Mutex<HashSet<String>>,
    active: AtomicUsize,
    settings: Arc<EngineSettings>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// Holds one crawl slot; released on drop.
struct CrawlSlot(Arc<Crawler>);

impl Drop for CrawlSlot {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Crawler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<RelayPool>,
        store: Arc<DiscoveredRelayStore>,
        failures: Arc<FailureCache>,
        debouncer: Debouncer,
        keys: Keys,
        settings: Arc<EngineSettings>,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector: pool.connector(),
            pool,
            store,
            failures,
            debouncer,
            keys,
            anchors: RwLock::new(Vec::new()),
            verifying: Mutex::new(HashSet::new()),
            active: AtomicUsize::new(0),
            settings,
            tracker,
            cancel,
        })
    }

    pub fn set_anchors(&self, anchors: &[String]) {
        *self.anchors.write() = anchors
            .iter()
            .filter_map(|a| normalize_relay_url(a))
            .collect();
    }

    /// Start crawling from each of `seeds` at `depth`.
    pub fn discover(self: &Arc<Self>, seeds: &[String], depth: u32) {
        for seed in seeds {
            let Some(url) = normalize_relay_url(seed) else {
                continue;
            };
            if self.failures.contains(&url) {
                continue;
            }
            self.spawn_crawl(url, depth);
        }
    }

    /// Depth and the concurrency ceiling are checked here, before any task
    /// or connection exists.
    fn spawn_crawl(self: &Arc<Self>, url: String, depth: u32) -> bool {
        if depth > self.settings.max_discovery_depth {
            return false;
        }
        let max = self.settings.max_active_discoveries;
        if self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .is_err()
        {
            tracing::debug!(relay = %url, depth, "crawl ceiling reached, skipping");
            return false;
        }
        let slot = CrawlSlot(self.clone());
        let crawler = self.clone();
        self.tracker.spawn(async move {
            let _slot = slot;
            if let Err(err) = crawler.crawl(&url, depth).await {
                tracing::debug!(relay = %url, depth, "crawl ended: {err:#}");
            }
        });
        true
    }

    /// Read the stored relay lists of one relay until EOSE.
    async fn crawl(self: &Arc<Self>, url: &str, depth: u32) -> Result<()> {
        let connection = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            res = self.connector.connect(url, self.settings.discovery_connect_timeout) => res?,
        };
        let mut sub = connection
            .subscribe(vec![SubscriptionFilter::relay_lists()])
            .await
            .with_context(|| format!("subscribe relay lists on {url}"))?;
        tracing::debug!(relay = %url, depth, "crawling relay lists");

        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = sub.messages.recv() => msg,
            };
            match msg {
                Some(SubscriptionMessage::Event(event)) => {
                    self.handle_relay_list(&event, depth).await;
                }
                Some(SubscriptionMessage::EndOfStoredEvents) | None => break,
            }
        }
        connection.unsubscribe(&sub.id).await;
        connection.close().await;
        Ok(())
    }

    async fn handle_relay_list(self: &Arc<Self>, event: &Event, depth: u32) {
        if event.kind.as_u16() != RELAY_LIST_KIND {
            return;
        }
        let mut found = 0usize;
        for tag in event.tags.iter() {
            let parts = tag.as_slice();
            if parts.len() < 2 || parts[0] != "r" {
                continue;
            }
            let url = match self.admit(&parts[1], parts.get(2).map(String::as_str)) {
                Ok(url) => url,
                Err(skip) => {
                    tracing::trace!(candidate = %parts[1], ?skip, "relay candidate skipped");
                    continue;
                }
            };

            let verified = self.verify_relay(&url).await;
            if verified {
                self.accept(&url);
                found += 1;
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.settings.relay_add_rate_limit) => {}
                }
                if depth < self.settings.max_discovery_depth {
                    self.spawn_crawl(url.clone(), depth + 1);
                }
            } else {
                tracing::debug!(relay = %url, "relay verification failed");
                self.failures.record(&url);
            }
            self.verifying.lock().remove(&url);
            if self.cancel.is_cancelled() {
                return;
            }
        }
        if found > 0 {
            self.debouncer.trigger();
        }
    }

    /// Filter a relay-list entry. On success the URL is marked as being
    /// verified and must be released by the caller.
    pub fn admit(&self, raw: &str, marker: Option<&str>) -> Result<String, Skip> {
        let url = normalize_relay_url(raw).ok_or(Skip::Malformed)?;
        if !is_secure_relay_url(&url) {
            return Err(Skip::Insecure);
        }
        if let Some(marker) = marker
            && matches!(marker.trim().to_ascii_lowercase().as_str(), "read" | "write")
        {
            return Err(Skip::Marker);
        }
        let mut verifying = self.verifying.lock();
        if self.anchors.read().contains(&url) {
            return Err(Skip::Anchor);
        }
        if self.failures.contains(&url) {
            return Err(Skip::Failed);
        }
        if self.pool.contains(&url) {
            return Err(Skip::Connected);
        }
        if self.store.contains(&url) {
            return Err(Skip::Verified);
        }
        if !verifying.insert(url.clone()) {
            return Err(Skip::Verifying);
        }
        Ok(url)
    }

    fn accept(self: &Arc<Self>, url: &str) {
        self.store.add(url);
        if let Err(err) = self.store.save() {
            tracing::warn!("saving discovered relays failed: {err}");
        }
        tracing::info!(relay = %url, "discovered relay verified");
        let pool = self.pool.clone();
        let url = url.to_string();
        self.tracker.spawn(async move {
            match pool.connect_idle(&url).await {
                Ok(()) => pool.emit_relays_update(),
                Err(err) => tracing::debug!(relay = %url, "idle connect failed: {err:#}"),
            }
        });
    }

    /// Publish a throwaway event and read it back by id.
    pub async fn verify_relay(&self, url: &str) -> bool {
        let timeout = self.settings.verify_timeout;
        let attempt = async {
            tokio::time::timeout(timeout, self.probe(url, timeout))
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("verify {url}: timed out")))
        };
        let res = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            res = attempt => res,
        };
        match res {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(relay = %url, "{err:#}");
                false
            }
        }
    }

    async fn probe(&self, url: &str, timeout: Duration) -> Result<()> {
        let connection = self.connector.connect(url, timeout).await?;
        let outcome: Result<()> = async {
            let probe = EventDraft::verification_probe().sign(&self.keys)?;
            connection
                .publish(&probe, timeout)
                .await
                .with_context(|| format!("publish probe to {url}"))?;
            let probe_id = probe.id.to_hex();
            let mut sub = connection
                .subscribe(vec![SubscriptionFilter::by_id(&probe_id)])
                .await?;
            let read_back = async {
                while let Some(msg) = sub.messages.recv().await {
                    match msg {
                        SubscriptionMessage::Event(ev) if ev.id == probe.id => return Ok(()),
                        SubscriptionMessage::Event(_) => bail!("{url} returned a different event"),
                        SubscriptionMessage::EndOfStoredEvents => return Ok(()),
                    }
                }
                bail!("{url} closed the read-back subscription")
            };
            let res = match tokio::time::timeout(timeout / 2, read_back).await {
                Ok(res) => res,
                Err(_) => Err(anyhow::anyhow!("{url}: no read-back within {:?}", timeout / 2)),
            };
            connection.unsubscribe(&sub.id).await;
            res
        }
        .await;
        connection.close().await;
        outcome
    }
}
