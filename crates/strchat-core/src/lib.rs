mod actions;
mod client;
mod debounce;
mod tls;
mod updates;

pub mod config;
pub mod discovery;
pub mod error;
pub mod event;
pub mod geohash;
pub mod georelays;
pub mod ingest;
pub mod moderation;
pub mod ordering;
pub mod pow;
pub mod relay;
pub mod session;
pub mod text;

pub use actions::UserAction;
pub use client::{ChatCore, CoreHandle, Transport};
pub use config::{Config, EngineSettings, resolve_config_dir};
pub use debounce::Debouncer;
pub use error::{ActionError, ConfigError};
pub use relay::MemoryNetwork;
pub use updates::*;

// Binaries call this before any socket is opened so rustls never has to
// guess between crypto backends.
pub fn init_rustls_crypto_provider() {
    tls::init_rustls_crypto_provider();
}
