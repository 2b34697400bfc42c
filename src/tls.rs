use std::sync::OnceLock;

/// Pin the process-wide rustls `CryptoProvider` to ring before the first
/// TLS handshake.
///
/// When a dependency tree pulls in both `ring` and `aws-lc-rs`, rustls 0.23
/// refuses to pick one at config-build time and panics instead. Called from
/// every transport open, so connecting never depends on the embedder having
/// set one up.
pub fn install_rustls_crypto_provider() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        // Err here means the embedder installed a provider first; keep theirs.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
