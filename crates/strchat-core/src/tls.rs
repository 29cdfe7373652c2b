use std::sync::Once;

static INIT: Once = Once::new();

/// rustls 0.23 needs one process-wide `CryptoProvider`. nostr-sdk and
/// reqwest both pull rustls in, so pick ring before either opens a socket.
pub fn init_rustls_crypto_provider() {
    INIT.call_once(|| {
        // another provider may already be installed by the embedding app
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
