//! The chat actor: owns config, identities and the active view, and turns
//! user actions into relay work and display events.

mod moderation;
mod publish;
mod relays;
mod views;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use nostr_sdk::prelude::Keys;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::actions::UserAction;
use crate::config::{Config, ConfigStore, EngineSettings};
use crate::debounce::Debouncer;
use crate::discovery::{Crawler, DiscoveredRelayStore};
use crate::error::{ActionError, ConfigError};
use crate::georelays::GeoRelayDirectory;
use crate::ingest::{IngestPolicy, Ingestor};
use crate::moderation::compile_enabled;
use crate::ordering::OrderingBuffer;
use crate::relay::{FailureCache, MemoryNetwork, NostrConnector, RelayConnector, RelayPool};
use crate::session::{ChatSessions, nick_for};
use crate::text;
use crate::updates::{CoreMsg, DisplayEvent, InternalEvent, ViewSummary};

const HELP_TEXT: &str = "COMMANDS:\n\
* /join <chat1> [chat2]... - Joins one or more chats. (Alias: /j)\n\
* /set [name|names...] - Without args: shows active chat. With one name: activates a chat/group. With multiple names: creates a group. (Alias: /s)\n\
* /list - Lists all your chats and groups. (Alias: /l)\n\
* /del [name] - Deletes a chat/group. If no name, deletes the active chat/group. (Alias: /d)\n\
* /nick [new_nick] - Sets or clears your nickname. (Alias: /n)\n\
* /pow [number] - Sets Proof-of-Work difficulty for the active chat/group. 0 to disable. (Alias: /p)\n\
* /block [@nick] - Blocks a user. Without nick, lists blocked users. (Alias: /b)\n\
* /unblock [<num>|@nick|pubkey] - Unblocks a user. Without args, lists blocked users. (Alias: /ub)\n\
* /filter [word|regex|<num>] - Adds a filter. Without args, lists filters. With number, toggles off/on. (Alias: /f)\n\
* /unfilter [<num>] - Removes a filter by number. Without args, clears all. (Alias: /uf)\n\
* /mute [word|regex|<num>] - Adds a mute. Without args, lists mutes. With number, toggles off/on. (Alias: /m)\n\
* /unmute [<num>] - Removes a mute by number. Without args, clears all. (Alias: /um)\n\
* /relay [url...|<num>] - Lists, adds or removes anchor relays. (Alias: /r)\n\
* /help - Shows this help. (Alias: /h)\n\
* /quit - Exits the application. (Alias: /q)";

/// Which wire the core talks over.
pub enum Transport {
    Nostr,
    Memory(Arc<MemoryNetwork>),
}

/// Caller side of a running core.
pub struct CoreHandle {
    core_tx: flume::Sender<CoreMsg>,
    updates: flume::Receiver<DisplayEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CoreHandle {
    /// Never blocks.
    pub fn dispatch(&self, action: UserAction) {
        let _ = self.core_tx.send(CoreMsg::Action(action));
    }

    pub fn updates(&self) -> flume::Receiver<DisplayEvent> {
        self.updates.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the actor to finish its shutdown.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            tracing::warn!("core task ended abnormally: {err}");
        }
    }
}

pub struct ChatCore {
    config: Config,
    store: ConfigStore,
    settings: Arc<EngineSettings>,
    keys: Keys,
    sessions: ChatSessions,

    display: flume::Sender<DisplayEvent>,
    core_tx: flume::Sender<CoreMsg>,

    pool: Arc<RelayPool>,
    ingestor: Arc<Ingestor>,
    ordering: Arc<OrderingBuffer>,
    crawler: Arc<Crawler>,
    discovered: Arc<DiscoveredRelayStore>,
    failures: Arc<FailureCache>,
    geo: Arc<GeoRelayDirectory>,

    tracker: TaskTracker,
    cancel: CancellationToken,
    mining: Option<CancellationToken>,

    reconcile_in_flight: bool,
    reconcile_dirty: bool,
    reconcile_token: u64,
}

impl ChatCore {
    /// Load config from `config_dir`, wire up the engine and spawn the
    /// actor. Must be called inside a tokio runtime.
    pub fn start(
        config_dir: &Path,
        settings: EngineSettings,
        transport: Transport,
    ) -> Result<CoreHandle, ConfigError> {
        let store = ConfigStore::new(config_dir);
        let mut config = store.load_or_create()?;
        let keys = config.ensure_keys()?;
        let settings = Arc::new(settings);

        let connector: Arc<dyn RelayConnector> = match transport {
            Transport::Nostr => Arc::new(NostrConnector::new(keys.clone())),
            Transport::Memory(net) => net,
        };

        let (display_tx, display_rx) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded::<CoreMsg>();
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();

        let ordering = Arc::new(OrderingBuffer::new(
            display_tx.clone(),
            settings.ordering_flush_delay,
            settings.ordering_capacity,
            tracker.clone(),
            cancel.clone(),
        ));
        let ingestor = Arc::new(Ingestor::new(
            settings.seen_cache_size,
            settings.user_cache_size,
            ordering.clone(),
        ));
        let failures = Arc::new(FailureCache::new(settings.verify_failure_cache_size));
        let pool = RelayPool::new(
            connector,
            ingestor.clone(),
            failures.clone(),
            settings.clone(),
            display_tx.clone(),
            tracker.clone(),
            cancel.clone(),
        );
        let discovered = Arc::new(DiscoveredRelayStore::load(config_dir));
        let debouncer = Debouncer::new(
            settings.recompute_debounce,
            core_tx.clone(),
            tracker.clone(),
            cancel.clone(),
        );
        let crawler = Crawler::new(
            pool.clone(),
            discovered.clone(),
            failures.clone(),
            debouncer,
            keys.clone(),
            settings.clone(),
            tracker.clone(),
            cancel.clone(),
        );
        let geo = Arc::new(GeoRelayDirectory::new(config_dir, &settings.georelays_url));

        let core = ChatCore {
            config,
            store,
            settings,
            keys,
            sessions: ChatSessions::new(),
            display: display_tx,
            core_tx: core_tx.clone(),
            pool,
            ingestor,
            ordering,
            crawler,
            discovered,
            failures,
            geo,
            tracker,
            cancel: cancel.clone(),
            mining: None,
            reconcile_in_flight: false,
            reconcile_dirty: false,
            reconcile_token: 0,
        };
        let task = tokio::spawn(core.run(core_rx));
        Ok(CoreHandle {
            core_tx,
            updates: display_rx,
            cancel,
            task,
        })
    }

    async fn run(mut self, core_rx: flume::Receiver<CoreMsg>) {
        self.startup();
        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = core_rx.recv_async() => msg,
            };
            match msg {
                Ok(msg) => {
                    if !self.handle_message(msg) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        self.shutdown().await;
    }

    /// Returns `false` once the actor should stop.
    fn handle_message(&mut self, msg: CoreMsg) -> bool {
        match msg {
            CoreMsg::Action(action) => {
                // never log the payload: it can carry message text
                tracing::info!(action = action.tag(), "dispatch");
                if action == UserAction::Quit {
                    return false;
                }
                if let Err(err) = self.handle_action(action) {
                    self.emit(DisplayEvent::error(err.to_string()));
                }
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
        }
        true
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        match internal {
            InternalEvent::RecomputeSubscriptions => {
                if let Err(err) = self.discovered.save() {
                    tracing::warn!("saving discovered relays failed: {err}");
                }
                self.request_reconcile();
            }
            InternalEvent::ReconcileFinished { token } => {
                // stale result from an earlier pass
                if token != self.reconcile_token {
                    return;
                }
                self.reconcile_in_flight = false;
                if self.reconcile_dirty {
                    self.reconcile_dirty = false;
                    self.request_reconcile();
                }
            }
            InternalEvent::GeoRelaysRefreshed => self.request_reconcile(),
        }
    }

    fn handle_action(&mut self, action: UserAction) -> Result<(), ActionError> {
        match action {
            UserAction::SendMessage { text } => self.send_message(&text),
            UserAction::RequestNickCompletion { prefix } => {
                self.complete_nick(&prefix);
                Ok(())
            }
            UserAction::ActivateView { name } => self.activate_view(name.trim()),
            UserAction::CreateGroup { members } => self.create_group(&members),
            UserAction::JoinChats { names } => self.join_chats(&names),
            UserAction::LeaveChat { name } => {
                self.leave_chat(name.trim());
                Ok(())
            }
            UserAction::DeleteGroup { name } => {
                self.delete_group(name.trim());
                Ok(())
            }
            UserAction::DeleteView { name } => self.delete_view(name.trim()),
            UserAction::ListChats => {
                self.list_chats();
                Ok(())
            }
            UserAction::GetActiveChat => {
                self.get_active_chat();
                Ok(())
            }
            UserAction::SetPow { difficulty } => self.set_pow(&difficulty),
            UserAction::SetNick { nick } => {
                self.set_nick(&nick);
                Ok(())
            }
            UserAction::BlockUser { target } => self.block_user(target.trim()),
            UserAction::UnblockUser { target } => self.unblock_user(target.trim()),
            UserAction::ListBlocked => {
                self.list_blocked();
                Ok(())
            }
            UserAction::HandleFilter { pattern } => self.handle_filter(pattern.trim()),
            UserAction::RemoveFilter { index } => self.remove_filter(index.trim()),
            UserAction::ClearFilters => {
                self.clear_filters();
                Ok(())
            }
            UserAction::HandleMute { pattern } => self.handle_mute(pattern.trim()),
            UserAction::RemoveMute { index } => self.remove_mute(index.trim()),
            UserAction::ClearMutes => {
                self.clear_mutes();
                Ok(())
            }
            UserAction::ManageAnchors { args } => self.manage_anchors(&args),
            UserAction::GetHelp => {
                self.emit(DisplayEvent::info(HELP_TEXT));
                Ok(())
            }
            UserAction::Quit => Ok(()),
        }
    }

    fn startup(&mut self) {
        self.crawler.set_anchors(&self.config.anchor_relays);
        self.load_geo_relays();

        let restore = if self
            .config
            .find_view(&self.config.active_view_name)
            .is_some()
        {
            Some(self.config.active_view_name.clone())
        } else {
            self.config.views.first().map(|v| v.name.clone())
        };
        match restore {
            Some(name) => {
                if let Err(err) = self.activate_view(&name) {
                    self.emit(DisplayEvent::error(err.to_string()));
                }
            }
            None => {
                let nick = nick_for(&self.keys, &self.config.nick);
                self.emit(DisplayEvent::status(format!(
                    "No chats joined. Initial identity: {} ({}...)",
                    nick,
                    text::short_pubkey(&self.keys.public_key().to_hex())
                )));
                self.sync_policy();
                self.emit_state();
                self.request_reconcile();
            }
        }

        if self.settings.discovery_enabled {
            self.crawler.discover(&self.config.anchor_relays, 1);
        }
        tracing::info!(
            pubkey = %self.keys.public_key(),
            views = self.config.views.len(),
            anchors = self.config.anchor_relays.len(),
            "core started"
        );
    }

    async fn shutdown(&mut self) {
        tracing::info!("core shutting down");
        self.cancel.cancel();
        if let Some(mining) = self.mining.take() {
            mining.cancel();
        }
        self.tracker.close();
        if tokio::time::timeout(self.settings.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                pending = self.tracker.len(),
                "tasks still running after shutdown grace"
            );
        }
        self.ordering.flush_all();
        self.pool.shutdown().await;
        if let Err(err) = self.discovered.save() {
            tracing::warn!("saving discovered relays failed: {err}");
        }
        self.emit(DisplayEvent::Shutdown);
    }

    fn emit(&self, event: DisplayEvent) {
        let _ = self.display.send(event);
    }

    fn save_config(&self) {
        if let Err(err) = self.store.save(&self.config) {
            tracing::warn!("saving config failed: {err}");
            self.emit(DisplayEvent::error(format!(
                "Failed to save configuration: {err}"
            )));
        }
    }

    /// Chats the active view shows.
    fn active_chats(&self) -> Vec<String> {
        match self.config.active_view() {
            Some(view) if view.is_group => view.children.clone(),
            Some(view) if !view.name.is_empty() => vec![view.name.clone()],
            _ => Vec::new(),
        }
    }

    fn active_group_name(&self) -> Option<String> {
        self.config
            .active_view()
            .filter(|v| v.is_group)
            .map(|v| v.name.clone())
    }

    fn effective_pow(&self, chat: &str) -> u32 {
        effective_pow(&self.config, chat)
    }

    /// Nick shown for the current identity.
    fn current_nick(&self) -> String {
        match self.config.active_view() {
            Some(view) if !view.is_group => match self.sessions.get(&view.name) {
                Some(session) => session.nick.clone(),
                None => nick_for(&self.keys, &self.config.nick),
            },
            _ => nick_for(&self.keys, &self.config.nick),
        }
    }

    /// Push the pieces of state the inbound pipeline depends on.
    fn sync_policy(&self) {
        let pow: HashMap<String, u32> = self
            .config
            .views
            .iter()
            .filter(|v| !v.is_group)
            .map(|v| (v.name.clone(), self.effective_pow(&v.name)))
            .filter(|(_, pow)| *pow > 0)
            .collect();
        let mut own_pubkeys: HashSet<String> = self.sessions.pubkeys().collect();
        own_pubkeys.insert(self.keys.public_key().to_hex());
        self.ingestor.set_policy(IngestPolicy {
            blocked: self
                .config
                .blocked_users
                .iter()
                .map(|b| b.pubkey.clone())
                .collect(),
            view_chats: self.active_chats().into_iter().collect(),
            pow,
            active_group: self.active_group_name(),
            mutes: compile_enabled(&self.config.mutes),
            filters: compile_enabled(&self.config.filters),
            own_pubkeys,
        });
    }

    fn emit_state(&mut self) {
        let active_index = match self
            .config
            .views
            .iter()
            .position(|v| v.name == self.config.active_view_name)
        {
            Some(idx) => idx,
            None => {
                if let Some(first) = self.config.views.first() {
                    self.config.active_view_name = first.name.clone();
                }
                0
            }
        };
        let views = self
            .config
            .views
            .iter()
            .map(|v| ViewSummary {
                name: v.name.clone(),
                is_group: v.is_group,
                children: v.children.clone(),
                pow: v.pow,
            })
            .collect();
        let nick = self.current_nick();
        self.emit(DisplayEvent::StateUpdate {
            views,
            active_index,
            nick,
        });
    }
}

/// The chat's own difficulty, else the active group's when the chat is one
/// of its children.
fn effective_pow(config: &Config, chat: &str) -> u32 {
    if let Some(view) = config.find_view(chat)
        && !view.is_group
        && view.pow > 0
    {
        return view.pow;
    }
    match config.active_view() {
        Some(group) if group.is_group && group.pow > 0 && group.children.iter().any(|c| c == chat) => {
            group.pow
        }
        _ => 0,
    }
}
