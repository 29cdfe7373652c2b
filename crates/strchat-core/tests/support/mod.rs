#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nostr_sdk::prelude::{Event, Keys, Timestamp};
use strchat_core::config::ConfigStore;
use strchat_core::event::EventDraft;
use strchat_core::{ChatCore, Config, CoreHandle, DisplayEvent, EngineSettings, MemoryNetwork, Transport, UserAction};
use tempfile::TempDir;

pub const WAIT: Duration = Duration::from_secs(5);

/// Production defaults with every timer shrunk and the network-facing
/// extras switched off.
pub fn test_settings() -> EngineSettings {
    EngineSettings {
        connect_timeout: Duration::from_secs(1),
        discovery_connect_timeout: Duration::from_secs(1),
        verify_timeout: Duration::from_secs(1),
        relay_add_rate_limit: Duration::from_millis(10),
        recompute_debounce: Duration::from_millis(300),
        ordering_flush_delay: Duration::from_millis(20),
        reconnect_backoff_base: Duration::from_millis(20),
        reconnect_backoff_max: Duration::from_millis(100),
        shutdown_grace: Duration::from_millis(500),
        discovery_enabled: false,
        georelays_url: String::new(),
        fallback_relays: Vec::new(),
        ..EngineSettings::default()
    }
}

pub fn config_with_anchors(anchors: &[&str]) -> Config {
    Config {
        anchor_relays: anchors.iter().map(|a| a.to_string()).collect(),
        ..Config::default()
    }
}

/// A running core on an in-memory network with its display stream
/// collected in the background.
pub struct Harness {
    pub net: Arc<MemoryNetwork>,
    pub dir: TempDir,
    handle: CoreHandle,
    events: Arc<Mutex<Vec<DisplayEvent>>>,
}

impl Harness {
    pub fn start(config: Config, settings: EngineSettings) -> Self {
        Self::start_on(MemoryNetwork::new(), config, settings)
    }

    pub fn start_on(net: Arc<MemoryNetwork>, config: Config, settings: EngineSettings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        ConfigStore::new(dir.path()).save(&config).unwrap();
        let handle = ChatCore::start(dir.path(), settings, Transport::Memory(net.clone())).unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let rx = handle.updates();
        let sink = events.clone();
        tokio::spawn(async move {
            while let Ok(ev) = rx.recv_async().await {
                sink.lock().unwrap().push(ev);
            }
        });
        Self {
            net,
            dir,
            handle,
            events,
        }
    }

    pub fn dispatch(&self, action: UserAction) {
        self.handle.dispatch(action);
    }

    pub fn events(&self) -> Vec<DisplayEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&DisplayEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|ev| pred(ev)).count()
    }

    pub fn saw_text(&self, needle: &str) -> bool {
        self.count(|ev| text_of(ev).is_some_and(|t| t.contains(needle))) > 0
    }

    pub async fn wait_for_text(&self, needle: &str) {
        wait_until(needle, WAIT, || self.saw_text(needle)).await;
    }

    pub async fn wait_for(&self, what: &str, pred: impl Fn(&DisplayEvent) -> bool) {
        wait_until(what, WAIT, || self.count(&pred) > 0).await;
    }

    pub fn messages(&self) -> Vec<strchat_core::ChatMessage> {
        self.events()
            .into_iter()
            .filter_map(|ev| match ev {
                DisplayEvent::NewMessage(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    /// Wait until `urls` are all in the pool, connected and subscribed.
    pub async fn wait_for_relays(&self, urls: &[&str]) {
        wait_until("relays connected", WAIT, || {
            let relays_ready = self.events().iter().rev().find_map(|ev| match ev {
                DisplayEvent::RelaysUpdate { relays } => Some(
                    urls.iter()
                        .all(|url| relays.iter().any(|r| r.url == *url && r.connected)),
                ),
                _ => None,
            });
            relays_ready.unwrap_or(false)
                && urls.iter().all(|url| self.net.active_subscriptions(url) > 0)
        })
        .await;
    }

    /// Quit and wait for the core. Hands back the config dir so callers
    /// can inspect what was persisted.
    pub async fn shutdown(self) -> TempDir {
        self.handle.dispatch(UserAction::Quit);
        tokio::time::timeout(WAIT, self.handle.join())
            .await
            .expect("core did not shut down");
        self.dir
    }
}

pub fn text_of(ev: &DisplayEvent) -> Option<&str> {
    match ev {
        DisplayEvent::Info { content }
        | DisplayEvent::Status { content }
        | DisplayEvent::Error { content } => Some(content.as_str()),
        _ => None,
    }
}

pub fn is_error(ev: &DisplayEvent, needle: &str) -> bool {
    matches!(ev, DisplayEvent::Error { content } if content.contains(needle))
}

pub async fn wait_until(what: &str, timeout: Duration, mut f: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{what}: condition not met within {timeout:?}");
}

/// A chat message from someone else, dated slightly ahead so live
/// subscriptions opened just now still match it.
pub fn foreign_message(keys: &Keys, chat: &str, nick: &str, content: &str) -> Event {
    let mut draft = EventDraft::chat_message(chat, content).with_tag(["n", nick]);
    draft.created_at = Timestamp::from(Timestamp::now().as_secs() + 5);
    draft.sign(keys).unwrap()
}
