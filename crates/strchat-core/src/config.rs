use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nostr_sdk::prelude::Keys;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const CONFIG_DIR_ENV: &str = "STRCHAT_CONFIG_DIR";
pub const DISABLE_DISCOVERY_ENV: &str = "STRCHAT_DISABLE_DISCOVERY";
const APP_DIR_NAME: &str = "strchat-tui";
const CONFIG_FILE: &str = "config.json";

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct View {
    pub name: String,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    #[serde(default)]
    pub pow: u32,
}

impl View {
    pub fn chat(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn group(name: &str, children: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            is_group: true,
            children,
            pow: 0,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockedUser {
    pub pubkey: String,
    #[serde(default)]
    pub nick: String,
}

/// Filter or mute entry. Older configs stored bare strings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "PatternRepr")]
pub struct PatternEntry {
    pub pattern: String,
    pub enabled: bool,
}

impl PatternEntry {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            enabled: true,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PatternRepr {
    Plain(String),
    Full {
        pattern: String,
        #[serde(default = "enabled_by_default")]
        enabled: bool,
    },
}

fn enabled_by_default() -> bool {
    true
}

impl From<PatternRepr> for PatternEntry {
    fn from(repr: PatternRepr) -> Self {
        match repr {
            PatternRepr::Plain(pattern) => Self {
                pattern,
                enabled: true,
            },
            PatternRepr::Full { pattern, enabled } => Self { pattern, enabled },
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub private_key: String,
    pub nick: String,
    pub views: Vec<View>,
    pub active_view_name: String,
    pub anchor_relays: Vec<String>,
    pub blocked_users: Vec<BlockedUser>,
    pub filters: Vec<PatternEntry>,
    pub mutes: Vec<PatternEntry>,
}

impl Config {
    pub fn find_view(&self, name: &str) -> Option<&View> {
        self.views.iter().find(|v| v.name == name)
    }

    pub fn find_view_mut(&mut self, name: &str) -> Option<&mut View> {
        self.views.iter_mut().find(|v| v.name == name)
    }

    pub fn has_chat(&self, name: &str) -> bool {
        self.find_view(name).is_some_and(|v| !v.is_group)
    }

    /// The view named by `active_view_name`, else the first view.
    pub fn active_view(&self) -> Option<&View> {
        self.find_view(&self.active_view_name)
            .or_else(|| self.views.first())
    }

    pub fn is_blocked(&self, pubkey_hex: &str) -> bool {
        self.blocked_users.iter().any(|b| b.pubkey == pubkey_hex)
    }

    /// Main identity, generated on first use.
    pub fn ensure_keys(&mut self) -> Result<Keys, ConfigError> {
        if self.private_key.trim().is_empty() {
            let keys = Keys::generate();
            self.private_key = keys.secret_key().to_secret_hex();
            return Ok(keys);
        }
        Keys::parse(self.private_key.trim()).map_err(|e| ConfigError::PrivateKey(e.to_string()))
    }
}

/// Directory holding `config.json`, the discovered relay store, the
/// georelay cache and the log file.
pub fn resolve_config_dir(explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    if let Some(dir) = explicit {
        return Ok(dir);
    }
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    dirs::config_dir()
        .map(|d| d.join(APP_DIR_NAME))
        .ok_or(ConfigError::NoConfigDir)
}

/// Write `bytes` to a sibling temp file and rename it over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    {
        let mut f = std::fs::File::create(&tmp).map_err(write_err)?;
        f.write_all(bytes).map_err(write_err)?;
        f.sync_all().map_err(write_err)?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            .map_err(write_err)?;
    }
    std::fs::rename(&tmp, path).map_err(write_err)
}

/// Loads and persists [`Config`] as compact JSON.
#[derive(Clone, Debug)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(CONFIG_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the config, creating (and saving) a default one with a fresh
    /// private key when none exists yet.
    pub fn load_or_create(&self) -> Result<Config, ConfigError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let mut cfg = Config::default();
                cfg.ensure_keys()?;
                self.save(&cfg)?;
                tracing::info!(path = %self.path.display(), "created default config");
                return Ok(cfg);
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let mut cfg: Config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;
        if cfg.private_key.trim().is_empty() {
            cfg.ensure_keys()?;
            self.save(&cfg)?;
        }
        Ok(cfg)
    }

    pub fn save(&self, cfg: &Config) -> Result<(), ConfigError> {
        let json = serde_json::to_vec(cfg)?;
        write_atomic(&self.path, &json)
    }
}

/// Timing and sizing knobs for the engine. Defaults are the production
/// values; tests shrink the timers.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub connect_timeout: Duration,
    pub discovery_connect_timeout: Duration,
    pub verify_timeout: Duration,
    pub relay_add_rate_limit: Duration,
    pub recompute_debounce: Duration,
    pub ordering_flush_delay: Duration,
    pub ordering_capacity: usize,
    pub seen_cache_size: usize,
    pub user_cache_size: usize,
    pub verify_failure_cache_size: usize,
    pub reconnect_ceiling: u32,
    pub reconnect_backoff_base: Duration,
    pub reconnect_backoff_max: Duration,
    pub max_discovery_depth: u32,
    pub max_active_discoveries: usize,
    pub nearest_geo_relays: usize,
    pub shutdown_grace: Duration,
    pub discovery_enabled: bool,
    /// Empty disables the dataset download; the cache is still read.
    pub georelays_url: String,
    pub fallback_relays: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            discovery_connect_timeout: Duration::from_secs(10),
            verify_timeout: Duration::from_secs(5),
            relay_add_rate_limit: Duration::from_secs(1),
            recompute_debounce: Duration::from_secs(60),
            ordering_flush_delay: Duration::from_millis(200),
            ordering_capacity: 256,
            seen_cache_size: 8192,
            user_cache_size: 4096,
            verify_failure_cache_size: 2000,
            reconnect_ceiling: 3,
            reconnect_backoff_base: Duration::from_millis(500),
            reconnect_backoff_max: Duration::from_secs(30),
            max_discovery_depth: 2,
            max_active_discoveries: 10,
            nearest_geo_relays: 5,
            shutdown_grace: Duration::from_secs(2),
            discovery_enabled: true,
            georelays_url: strchat_relay_profiles::default_georelay_dataset_url().to_string(),
            fallback_relays: strchat_relay_profiles::default_fallback_relays(),
        }
    }
}

impl EngineSettings {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if std::env::var(DISABLE_DISCOVERY_ENV)
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false)
        {
            settings.discovery_enabled = false;
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_is_created_with_a_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        let mut cfg = store.load_or_create().unwrap();
        assert!(!cfg.private_key.is_empty());
        assert!(store.path().exists());

        let again = store.load_or_create().unwrap();
        assert_eq!(again.private_key, cfg.private_key);
        assert_eq!(
            cfg.ensure_keys().unwrap().public_key(),
            again.clone().ensure_keys().unwrap().public_key()
        );
    }

    #[test]
    fn saved_config_is_compact_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        let mut cfg = Config::default();
        cfg.ensure_keys().unwrap();
        cfg.nick = "jan".into();
        cfg.views = vec![
            View::chat("nostr"),
            View::chat("u4pr"),
            View::group("Group-abc123", vec!["nostr".into(), "u4pr".into()]),
        ];
        cfg.active_view_name = "nostr".into();
        cfg.filters = vec![PatternEntry::new("/gm/")];
        store.save(&cfg).unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(!raw.contains('\n'));
        assert_eq!(store.load_or_create().unwrap(), cfg);
        assert!(!dir.path().join("config.json.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn saved_config_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        store.load_or_create().unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn legacy_string_patterns_load_enabled() {
        let raw = r#"{"filters":["spam",{"pattern":"/x/","enabled":false}],"mutes":[{"pattern":"m"}]}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.filters[0], PatternEntry::new("spam"));
        assert!(!cfg.filters[1].enabled);
        assert!(cfg.mutes[0].enabled);
    }

    #[test]
    fn active_view_falls_back_to_first() {
        let mut cfg = Config {
            views: vec![View::chat("a"), View::chat("b")],
            active_view_name: "b".into(),
            ..Config::default()
        };
        assert_eq!(cfg.active_view().unwrap().name, "b");
        cfg.active_view_name = "gone".into();
        assert_eq!(cfg.active_view().unwrap().name, "a");
        assert!(cfg.has_chat("a"));
        assert!(!cfg.has_chat("gone"));
    }

    #[test]
    fn explicit_dir_wins() {
        let dir = resolve_config_dir(Some(PathBuf::from("/tmp/strchat-test"))).unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/strchat-test"));
    }

    #[test]
    fn corrupt_config_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{not json").unwrap();
        let err = ConfigStore::new(dir.path()).load_or_create().unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
