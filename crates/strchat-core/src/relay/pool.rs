//! Relay table, subscription reconcile and per-relay listeners.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nostr_sdk::prelude::Event;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::failures::FailureCache;
use super::lifecycle::{LinkEvent, LinkState, RelayRole, backoff_delay, transition};
use super::transport::{
    RelayConnection, RelayConnector, SubscriptionFilter, SubscriptionMessage,
};
use crate::config::EngineSettings;
use crate::geohash;
use crate::georelays::NearestRelays;
use crate::updates::{DisplayEvent, RelayInfo};

/// Receives every event delivered by any relay subscription.
pub trait EventSink: Send + Sync {
    fn ingest(&self, event: Box<Event>, relay_url: &str);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayPlan {
    pub chats: BTreeSet<String>,
    pub role: RelayRole,
}

pub type DesiredMapping = BTreeMap<String, RelayPlan>;

/// Where relays for a chat come from.
pub struct RelaySources<'a> {
    pub anchors: &'a [String],
    pub discovered: &'a [String],
    pub geo: Option<&'a dyn NearestRelays>,
    pub fallback: &'a [String],
    pub nearest: usize,
}

/// Relay URL to the set of chats it should carry. Per chat: anchors,
/// discovered relays and (for geohash chats) the nearest geo relays; the
/// fallback list when that comes up empty.
pub fn compute_desired_mapping(chats: &[String], src: &RelaySources<'_>) -> DesiredMapping {
    let mut mapping = DesiredMapping::new();
    let mut required: HashSet<String> = src.anchors.iter().cloned().collect();

    for chat in chats {
        let mut pool: BTreeSet<String> = BTreeSet::new();
        pool.extend(src.anchors.iter().cloned());
        pool.extend(src.discovered.iter().cloned());
        if let (Some(geo), Some((lat, lon))) = (src.geo, geohash::decode_center(chat)) {
            for url in geo.nearest(lat, lon, src.nearest) {
                required.insert(url.clone());
                pool.insert(url);
            }
        }
        if pool.is_empty() {
            for url in src.fallback {
                required.insert(url.clone());
                pool.insert(url.clone());
            }
        }
        for url in pool {
            mapping
                .entry(url)
                .or_insert_with(|| RelayPlan {
                    chats: BTreeSet::new(),
                    role: RelayRole::Opportunistic,
                })
                .chats
                .insert(chat.clone());
        }
    }

    for (url, plan) in mapping.iter_mut() {
        if required.contains(url) {
            plan.role = RelayRole::Required;
        }
    }
    mapping
}

struct ActiveSubscription {
    id: String,
    chats: BTreeSet<String>,
    generation: u64,
}

struct RelayState {
    connection: Arc<dyn RelayConnection>,
    subscription: Option<ActiveSubscription>,
    latency: Option<Duration>,
    connected: bool,
    reconnect_attempts: u32,
    role: RelayRole,
    next_generation: u64,
}

/// A subscription stream handed to the listener. Higher generations
/// supersede lower ones.
struct Handoff {
    generation: u64,
    messages: mpsc::Receiver<SubscriptionMessage>,
}

pub struct ManagedRelay {
    url: String,
    /// Serializes subscription replacement and resubscribe.
    replace_lock: tokio::sync::Mutex<()>,
    state: Mutex<RelayState>,
    handoff_tx: mpsc::UnboundedSender<Handoff>,
    cancel: CancellationToken,
}

impl ManagedRelay {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn chats(&self) -> BTreeSet<String> {
        self.state
            .lock()
            .subscription
            .as_ref()
            .map(|s| s.chats.clone())
            .unwrap_or_default()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn role(&self) -> RelayRole {
        self.state.lock().role
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.state.lock().reconnect_attempts
    }

    fn connection(&self) -> Arc<dyn RelayConnection> {
        self.state.lock().connection.clone()
    }

    fn current_generation(&self) -> Option<u64> {
        self.state.lock().subscription.as_ref().map(|s| s.generation)
    }
}

/// A required relay that could not be opened yet and is being retried.
struct PendingOpen {
    plan: RelayPlan,
    cancel: CancellationToken,
}

/// A relay picked for publishing.
#[derive(Clone)]
pub struct PublishTarget {
    pub url: String,
    pub connection: Arc<dyn RelayConnection>,
    pub latency: Option<Duration>,
}

pub struct RelayPool {
    relays: RwLock<HashMap<String, Arc<ManagedRelay>>>,
    pending: Mutex<HashMap<String, PendingOpen>>,
    connector: Arc<dyn RelayConnector>,
    sink: Arc<dyn EventSink>,
    failures: Arc<FailureCache>,
    settings: Arc<EngineSettings>,
    display: flume::Sender<DisplayEvent>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl RelayPool {
    pub fn new(
        connector: Arc<dyn RelayConnector>,
        sink: Arc<dyn EventSink>,
        failures: Arc<FailureCache>,
        settings: Arc<EngineSettings>,
        display: flume::Sender<DisplayEvent>,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            relays: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            connector,
            sink,
            failures,
            settings,
            display,
            tracker,
            cancel,
        })
    }

    pub fn connector(&self) -> Arc<dyn RelayConnector> {
        self.connector.clone()
    }

    pub fn get(&self, url: &str) -> Option<Arc<ManagedRelay>> {
        self.relays.read().get(url).cloned()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.relays.read().contains_key(url)
    }

    pub fn urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.relays.read().keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Current relay -> chats table, for inspection.
    pub fn mapping(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.relays
            .read()
            .iter()
            .map(|(url, relay)| (url.clone(), relay.chats()))
            .collect()
    }

    pub fn relay_infos(&self) -> Vec<RelayInfo> {
        let relays: Vec<Arc<ManagedRelay>> = self.relays.read().values().cloned().collect();
        let mut infos: Vec<RelayInfo> = relays
            .iter()
            .map(|relay| {
                let state = relay.state.lock();
                RelayInfo {
                    url: relay.url.clone(),
                    latency_ms: state.latency.map(|l| l.as_millis() as u64),
                    connected: state.connected,
                }
            })
            .collect();
        for url in self.pending.lock().keys() {
            if !infos.iter().any(|i| &i.url == url) {
                infos.push(RelayInfo {
                    url: url.clone(),
                    latency_ms: None,
                    connected: false,
                });
            }
        }
        infos.sort_by(|a, b| a.url.cmp(&b.url));
        infos
    }

    pub fn emit_relays_update(&self) {
        let _ = self.display.send(DisplayEvent::RelaysUpdate {
            relays: self.relay_infos(),
        });
    }

    /// Connected, non-failed relays carrying `chat`, fastest first.
    pub fn publish_targets(&self, chat: &str) -> Vec<PublishTarget> {
        let relays: Vec<Arc<ManagedRelay>> = self.relays.read().values().cloned().collect();
        let mut targets: Vec<PublishTarget> = relays
            .iter()
            .filter(|relay| !self.failures.contains(&relay.url))
            .filter_map(|relay| {
                let state = relay.state.lock();
                let carries = state
                    .subscription
                    .as_ref()
                    .is_some_and(|s| s.chats.contains(chat));
                (state.connected && carries).then(|| PublishTarget {
                    url: relay.url.clone(),
                    connection: state.connection.clone(),
                    latency: state.latency,
                })
            })
            .collect();
        targets.sort_by(|a, b| match (a.latency, b.latency) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.url.cmp(&b.url),
        });
        targets
    }

    /// A publish to `url` failed: stop using it for publishing until it
    /// resubscribes.
    pub fn mark_publish_failed(&self, url: &str) {
        if let Some(relay) = self.get(url) {
            relay.state.lock().connected = false;
        }
        self.failures.record(url);
    }

    /// Bring the table in line with `desired`. Per-relay work runs
    /// concurrently; returns when all of it is done.
    pub async fn reconcile(self: &Arc<Self>, desired: DesiredMapping) {
        let current: Vec<(String, Arc<ManagedRelay>)> = self
            .relays
            .read()
            .iter()
            .map(|(url, relay)| (url.clone(), relay.clone()))
            .collect();
        let current_urls: HashSet<&str> = current.iter().map(|(u, _)| u.as_str()).collect();

        // retries still wanted pick up the new plan; the rest stop
        let retrying: HashSet<String> = {
            let mut pending = self.pending.lock();
            pending.retain(|url, open| match desired.get(url) {
                Some(plan) if plan.role == RelayRole::Required => {
                    open.plan = plan.clone();
                    true
                }
                _ => {
                    open.cancel.cancel();
                    false
                }
            });
            pending.keys().cloned().collect()
        };

        let mut set = JoinSet::new();
        for (url, plan) in &desired {
            if retrying.contains(url) {
                continue;
            }
            let pool = self.clone();
            let url = url.clone();
            let plan = plan.clone();
            if current_urls.contains(url.as_str()) {
                set.spawn(async move {
                    if let Some(relay) = pool.get(&url)
                        && let Err(err) = pool.replace_subscription(&relay, plan).await
                    {
                        tracing::warn!(relay = %url, "replace subscription failed: {err:#}");
                    }
                });
            } else {
                set.spawn(async move {
                    if let Err(err) = pool.open_relay(&url, plan.chats.clone(), plan.role).await {
                        tracing::warn!(relay = %url, "open relay failed: {err:#}");
                        let role = plan.role;
                        match role {
                            RelayRole::Opportunistic => pool.failures.record(&url),
                            RelayRole::Required => pool.schedule_reopen(&url, plan),
                        }
                    }
                });
            }
        }
        for (url, relay) in current {
            if desired.contains_key(&url) {
                continue;
            }
            let pool = self.clone();
            set.spawn(async move {
                pool.close_relay(&relay).await;
            });
        }
        while set.join_next().await.is_some() {}
        tracing::debug!(relays = desired.len(), "reconcile done");
    }

    /// Open a connection without any chat subscription, used for freshly
    /// verified relays ahead of the next mapping recompute.
    pub async fn connect_idle(self: &Arc<Self>, url: &str) -> Result<()> {
        if self.contains(url) {
            return Ok(());
        }
        self.open_relay(url, BTreeSet::new(), RelayRole::Opportunistic)
            .await
    }

    /// Keep trying to open a required relay that failed its first connect,
    /// with the same backoff and ceiling as a dropped stream.
    fn schedule_reopen(self: &Arc<Self>, url: &str, plan: RelayPlan) {
        let cancel = self.cancel.child_token();
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(url) {
                return;
            }
            pending.insert(
                url.to_string(),
                PendingOpen {
                    plan,
                    cancel: cancel.clone(),
                },
            );
        }
        let _ = self
            .display
            .send(DisplayEvent::error(format!("Failed to connect to {url}")));
        let pool = self.clone();
        let url = url.to_string();
        self.tracker.spawn(async move {
            pool.reopen(url, cancel).await;
        });
    }

    async fn reopen(self: Arc<Self>, url: String, cancel: CancellationToken) {
        let ceiling = self.settings.reconnect_ceiling;
        let role = RelayRole::Required;
        let mut link = transition(LinkState::Live, LinkEvent::StreamClosed, role, ceiling);
        let mut attempts = 0;
        while let LinkState::Degraded { attempt } = link {
            let delay = backoff_delay(
                attempt,
                self.settings.reconnect_backoff_base,
                self.settings.reconnect_backoff_max,
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(plan) = self.pending.lock().get(&url).map(|p| p.plan.clone()) else {
                return;
            };
            attempts = attempt;
            match self.open_relay(&url, plan.chats, plan.role).await {
                Ok(()) => {
                    self.pending.lock().remove(&url);
                    if cancel.is_cancelled() {
                        // no longer wanted while the connect was in flight
                        if let Some(relay) = self.get(&url) {
                            self.close_relay(&relay).await;
                        }
                        return;
                    }
                    tracing::info!(relay = %url, attempt, "relay connected after retry");
                    let _ = self
                        .display
                        .send(DisplayEvent::status(format!("Connected to {url}")));
                    self.emit_relays_update();
                    return;
                }
                Err(err) => {
                    tracing::warn!(relay = %url, attempt, "reopen failed: {err:#}");
                    link = transition(link, LinkEvent::ResubscribeFailed, role, ceiling);
                }
            }
        }
        if self.pending.lock().remove(&url).is_none() || cancel.is_cancelled() {
            return;
        }
        tracing::warn!(relay = %url, attempts, "relay abandoned");
        let _ = self.display.send(DisplayEvent::error(format!(
            "Could not connect to {url} after {attempts} attempts; giving up."
        )));
        self.emit_relays_update();
    }

    async fn open_relay(
        self: &Arc<Self>,
        url: &str,
        chats: BTreeSet<String>,
        role: RelayRole,
    ) -> Result<()> {
        let started = Instant::now();
        let connection = self
            .connector
            .connect(url, self.settings.connect_timeout)
            .await
            .with_context(|| format!("connect {url}"))?;
        let latency = started.elapsed();

        let first = if chats.is_empty() {
            None
        } else {
            let sub = connection
                .subscribe(chat_filters(&chats))
                .await
                .with_context(|| format!("subscribe {url}"))?;
            Some(sub)
        };

        let (handoff_tx, handoff_rx) = mpsc::unbounded_channel();
        let relay = Arc::new(ManagedRelay {
            url: url.to_string(),
            replace_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(RelayState {
                connection: connection.clone(),
                subscription: first.as_ref().map(|sub| ActiveSubscription {
                    id: sub.id.clone(),
                    chats: chats.clone(),
                    generation: 1,
                }),
                latency: Some(latency),
                connected: true,
                reconnect_attempts: 0,
                role,
                next_generation: 2,
            }),
            handoff_tx,
            cancel: self.cancel.child_token(),
        });

        let inserted = {
            let mut relays = self.relays.write();
            if relays.contains_key(url) {
                false
            } else {
                relays.insert(url.to_string(), relay.clone());
                true
            }
        };
        if !inserted {
            // lost a race with another opener
            connection.close().await;
            if let Some(existing) = self.get(url) {
                self.replace_subscription(&existing, RelayPlan { chats, role })
                    .await?;
            }
            return Ok(());
        }

        self.failures.forget(url);
        if let Some(sub) = first {
            let _ = relay.handoff_tx.send(Handoff {
                generation: 1,
                messages: sub.messages,
            });
        }
        tracing::info!(relay = %url, latency_ms = latency.as_millis() as u64, chats = chats.len(), "relay connected");

        let pool = self.clone();
        self.tracker.spawn(async move {
            pool.listen(relay, handoff_rx).await;
        });
        Ok(())
    }

    /// Make-before-break: subscribe with the new chat set, hand the stream
    /// to the listener, then drop the old subscription. No-op when the chat
    /// set is unchanged.
    async fn replace_subscription(&self, relay: &Arc<ManagedRelay>, plan: RelayPlan) -> Result<()> {
        let _guard = relay.replace_lock.lock().await;
        let (connection, old_id) = {
            let mut state = relay.state.lock();
            state.role = plan.role;
            let same = match &state.subscription {
                Some(sub) => sub.chats == plan.chats,
                None => plan.chats.is_empty(),
            };
            if same {
                return Ok(());
            }
            (
                state.connection.clone(),
                state.subscription.as_ref().map(|s| s.id.clone()),
            )
        };

        if plan.chats.is_empty() {
            relay.state.lock().subscription = None;
        } else {
            let sub = connection
                .subscribe(chat_filters(&plan.chats))
                .await
                .with_context(|| format!("resubscribe {}", relay.url))?;
            let generation = {
                let mut state = relay.state.lock();
                let generation = state.next_generation;
                state.next_generation += 1;
                state.subscription = Some(ActiveSubscription {
                    id: sub.id.clone(),
                    chats: plan.chats.clone(),
                    generation,
                });
                generation
            };
            let _ = relay.handoff_tx.send(Handoff {
                generation,
                messages: sub.messages,
            });
        }

        if let Some(old) = old_id {
            connection.unsubscribe(&old).await;
        }
        tracing::debug!(relay = %relay.url, chats = plan.chats.len(), "subscription replaced");
        Ok(())
    }

    async fn close_relay(&self, relay: &Arc<ManagedRelay>) {
        let removed = {
            let mut relays = self.relays.write();
            match relays.get(&relay.url) {
                Some(current) if Arc::ptr_eq(current, relay) => relays.remove(&relay.url),
                _ => None,
            }
        };
        if removed.is_none() {
            return;
        }
        relay.cancel.cancel();
        let (connection, sub_id) = {
            let mut state = relay.state.lock();
            state.connected = false;
            (
                state.connection.clone(),
                state.subscription.take().map(|s| s.id),
            )
        };
        if let Some(id) = sub_id {
            connection.unsubscribe(&id).await;
        }
        connection.close().await;
        tracing::info!(relay = %relay.url, "relay closed");
    }

    /// Re-establish the subscription on `relay`, reconnecting first if the
    /// connection is gone.
    async fn resubscribe(&self, relay: &Arc<ManagedRelay>) -> Result<Option<Handoff>> {
        let _guard = relay.replace_lock.lock().await;
        let (mut connection, chats, mut stale_id) = {
            let state = relay.state.lock();
            let sub = state.subscription.as_ref();
            (
                state.connection.clone(),
                sub.map(|s| s.chats.clone()).unwrap_or_default(),
                sub.map(|s| s.id.clone()),
            )
        };
        if chats.is_empty() {
            return Ok(None);
        }

        if !connection.is_connected().await {
            let started = Instant::now();
            let fresh = self
                .connector
                .connect(&relay.url, self.settings.connect_timeout)
                .await
                .with_context(|| format!("reconnect {}", relay.url))?;
            let latency = started.elapsed();
            let old = {
                let mut state = relay.state.lock();
                state.latency = Some(latency);
                std::mem::replace(&mut state.connection, fresh.clone())
            };
            old.close().await;
            connection = fresh;
            // ids from the closed connection died with it
            stale_id = None;
        }

        let sub = connection
            .subscribe(chat_filters(&chats))
            .await
            .with_context(|| format!("resubscribe {}", relay.url))?;
        let generation = {
            let mut state = relay.state.lock();
            let generation = state.next_generation;
            state.next_generation += 1;
            state.subscription = Some(ActiveSubscription {
                id: sub.id,
                chats,
                generation,
            });
            state.connected = true;
            state.reconnect_attempts = 0;
            generation
        };
        // a subscription placed by a concurrent replace may still be open
        if let Some(id) = stale_id {
            connection.unsubscribe(&id).await;
        }
        Ok(Some(Handoff {
            generation,
            messages: sub.messages,
        }))
    }

    /// Drop a relay for good after its listener gave up.
    async fn abandon(&self, relay: &Arc<ManagedRelay>) {
        let role = relay.role();
        let attempts = relay.reconnect_attempts();
        self.close_relay(relay).await;
        match role {
            RelayRole::Opportunistic => {
                self.failures.record(&relay.url);
                tracing::info!(relay = %relay.url, "discovered relay dropped");
            }
            RelayRole::Required => {
                tracing::warn!(relay = %relay.url, attempts, "relay abandoned");
                let _ = self.display.send(DisplayEvent::error(format!(
                    "Lost connection to {} after {} attempts; giving up.",
                    relay.url, attempts
                )));
            }
        }
        self.emit_relays_update();
    }

    async fn listen(
        self: Arc<Self>,
        relay: Arc<ManagedRelay>,
        mut handoffs: mpsc::UnboundedReceiver<Handoff>,
    ) {
        let mut current: Option<Handoff> = None;
        loop {
            let closed_generation = match current.as_mut() {
                None => {
                    tokio::select! {
                        _ = relay.cancel.cancelled() => return,
                        next = handoffs.recv() => match next {
                            Some(h) => {
                                current = Some(h);
                                continue;
                            }
                            None => return,
                        },
                    }
                }
                Some(active) => {
                    tokio::select! {
                        biased;
                        _ = relay.cancel.cancelled() => return,
                        next = handoffs.recv() => {
                            match next {
                                Some(h) if h.generation > active.generation => current = Some(h),
                                Some(_) => {}
                                None => return,
                            }
                            continue;
                        }
                        msg = active.messages.recv() => match msg {
                            Some(SubscriptionMessage::Event(event)) => {
                                self.sink.ingest(event, &relay.url);
                                continue;
                            }
                            Some(SubscriptionMessage::EndOfStoredEvents) => continue,
                            None => active.generation,
                        },
                    }
                }
            };

            current = None;
            if relay.current_generation() != Some(closed_generation) {
                // superseded stream wound down
                continue;
            }
            match self.recover(&relay).await {
                Some(handoff) => current = Some(handoff),
                None => return,
            }
        }
    }

    /// Drive the link state machine after the live stream closed. Returns
    /// the new stream, or `None` once the relay is abandoned or shutting down.
    async fn recover(&self, relay: &Arc<ManagedRelay>) -> Option<Handoff> {
        let ceiling = self.settings.reconnect_ceiling;
        let role = relay.role();
        let mut link = transition(LinkState::Live, LinkEvent::StreamClosed, role, ceiling);
        relay.state.lock().connected = false;
        self.emit_relays_update();
        tracing::info!(relay = %relay.url, ?role, "subscription closed");

        loop {
            match link {
                LinkState::Live => return None,
                LinkState::Abandoned => {
                    self.abandon(relay).await;
                    return None;
                }
                LinkState::Degraded { attempt } => {
                    relay.state.lock().reconnect_attempts = attempt;
                    let delay = backoff_delay(
                        attempt,
                        self.settings.reconnect_backoff_base,
                        self.settings.reconnect_backoff_max,
                    );
                    tokio::select! {
                        _ = relay.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    match self.resubscribe(relay).await {
                        Ok(Some(handoff)) => {
                            link = transition(link, LinkEvent::ResubscribeOk, role, ceiling);
                            self.failures.forget(&relay.url);
                            tracing::info!(relay = %relay.url, attempt, state = ?link, "relay reconnected");
                            let _ = self
                                .display
                                .send(DisplayEvent::status(format!("Reconnected to {}", relay.url)));
                            self.emit_relays_update();
                            return Some(handoff);
                        }
                        Ok(None) => return None,
                        Err(err) => {
                            tracing::warn!(relay = %relay.url, attempt, "resubscribe failed: {err:#}");
                            link = transition(link, LinkEvent::ResubscribeFailed, role, ceiling);
                        }
                    }
                }
            }
        }
    }

    /// Stop every listener and close every connection.
    pub async fn shutdown(&self) {
        for (_, open) in self.pending.lock().drain() {
            open.cancel.cancel();
        }
        let relays: Vec<Arc<ManagedRelay>> =
            self.relays.write().drain().map(|(_, r)| r).collect();
        for relay in &relays {
            relay.cancel.cancel();
        }
        for relay in relays {
            let connection = relay.connection();
            connection.close().await;
        }
    }
}

fn chat_filters(chats: &BTreeSet<String>) -> Vec<SubscriptionFilter> {
    chats
        .iter()
        .map(|chat| SubscriptionFilter::for_chat(chat))
        .collect()
}
