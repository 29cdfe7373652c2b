use strchat_relay_profiles::normalize_relay_url;

use super::ChatCore;
use crate::error::ActionError;
use crate::georelays::NearestRelays;
use crate::relay::{RelaySources, compute_desired_mapping};
use crate::updates::{CoreMsg, DisplayEvent, InternalEvent};

impl ChatCore {
    /// Recompute the relay mapping for the active view and reconcile the
    /// pool. Passes never overlap: a request during a pass marks it dirty
    /// and one more pass runs when it finishes.
    pub(super) fn request_reconcile(&mut self) {
        if self.reconcile_in_flight {
            self.reconcile_dirty = true;
            return;
        }

        let chats = self.active_chats();
        if chats.is_empty() {
            self.emit(DisplayEvent::status(
                "No active chat/group. Relay connections are inactive.",
            ));
        } else {
            self.emit(DisplayEvent::status(
                "Updating subscriptions for active chat/group...",
            ));
        }

        let discovered: Vec<String> = self
            .discovered
            .urls()
            .into_iter()
            .filter(|url| !self.failures.contains(url))
            .collect();
        let geo = (!self.geo.is_empty()).then(|| self.geo.as_ref() as &dyn NearestRelays);
        let sources = RelaySources {
            anchors: &self.config.anchor_relays,
            discovered: &discovered,
            geo,
            fallback: &self.settings.fallback_relays,
            nearest: self.settings.nearest_geo_relays,
        };
        let desired = compute_desired_mapping(&chats, &sources);

        self.reconcile_in_flight = true;
        self.reconcile_dirty = false;
        self.reconcile_token = self.reconcile_token.wrapping_add(1);
        let token = self.reconcile_token;
        tracing::debug!(token, chats = chats.len(), relays = desired.len(), "reconcile requested");

        let pool = self.pool.clone();
        let core_tx = self.core_tx.clone();
        self.tracker.spawn(async move {
            pool.reconcile(desired).await;
            pool.emit_relays_update();
            let _ = core_tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::ReconcileFinished { token },
            )));
        });
    }

    /// Read the georelay cache now; download it in the background when it
    /// is missing or stale.
    pub(super) fn load_geo_relays(&self) {
        let loaded = self.geo.load_cached();
        if (loaded && self.geo.cache_is_fresh()) || self.settings.georelays_url.is_empty() {
            return;
        }
        let geo = self.geo.clone();
        let core_tx = self.core_tx.clone();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let refreshed = tokio::select! {
                _ = cancel.cancelled() => return,
                res = geo.refresh() => res,
            };
            match refreshed {
                Ok(count) => {
                    tracing::info!(count, "georelays ready");
                    let _ = core_tx.send(CoreMsg::Internal(Box::new(
                        InternalEvent::GeoRelaysRefreshed,
                    )));
                }
                Err(err) => tracing::warn!("georelay refresh failed: {err}"),
            }
        });
    }

    /// `/relay`: list with no args, remove by 1-based index with a single
    /// number, otherwise add URLs.
    pub(super) fn manage_anchors(&mut self, payload: &str) -> Result<(), ActionError> {
        let args: Vec<&str> = payload.split_whitespace().collect();

        if args.is_empty() {
            if self.config.anchor_relays.is_empty() {
                self.emit(DisplayEvent::info(
                    "No anchor relays set. Use /relay <url> to add one.",
                ));
                return Ok(());
            }
            let mut out = String::from("Anchor Relays:\n");
            for (i, url) in self.config.anchor_relays.iter().enumerate() {
                out.push_str(&format!("[{}] {}\n", i + 1, url));
            }
            self.emit(DisplayEvent::info(out));
            return Ok(());
        }

        if let [single] = args.as_slice()
            && let Ok(index) = single.parse::<i64>()
        {
            if index < 1 || index as usize > self.config.anchor_relays.len() {
                return Err(ActionError::InvalidIndex {
                    index,
                    list_command: "/relay",
                });
            }
            let removed = self.config.anchor_relays.remove(index as usize - 1);
            self.save_config();
            self.crawler.set_anchors(&self.config.anchor_relays);
            self.emit(DisplayEvent::status(format!(
                "Removed anchor relay: {removed}"
            )));
            self.request_reconcile();
            return Ok(());
        }

        let mut added = Vec::new();
        let mut invalid = Vec::new();
        for raw in args {
            let Some(url) = normalize_relay_url(raw) else {
                invalid.push(raw.to_string());
                continue;
            };
            if self.config.anchor_relays.contains(&url) {
                continue;
            }
            self.config.anchor_relays.push(url.clone());
            added.push(url);
        }

        if !added.is_empty() {
            self.save_config();
            self.crawler.set_anchors(&self.config.anchor_relays);
            self.emit(DisplayEvent::status(format!(
                "Added anchor relay(s): {}",
                added.join(", ")
            )));
            self.request_reconcile();
            if self.settings.discovery_enabled {
                self.crawler.discover(&added, 1);
            }
        }
        if !invalid.is_empty() {
            return Err(ActionError::InvalidRelayUrls(invalid.join(", ")));
        }
        if added.is_empty() {
            self.emit(DisplayEvent::status(
                "Specified relay(s) are already in the anchor list.",
            ));
        }
        Ok(())
    }
}
