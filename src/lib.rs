pub mod config;
pub mod wallet;

pub use config::{ConfigError, Endpoints, HostConfig};
pub use wallet::types::{HostState, WalletNotification, WalletStatus};
pub use wallet::{Connection, WalletError, WalletManager};

/// Per-target level clamps for chatty dependencies.
const QUIET_TARGETS: [&str; 4] = ["rustls", "electrum_client", "reqwest", "lwk_wollet"];

/// Configure `env_logger` at `level` (overridable through `RUST_LOG`) with
/// the noisy dependency targets clamped to `Warn`. Safe to call more than
/// once; later calls are ignored.
pub fn init_logging(level: log::LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    for target in QUIET_TARGETS {
        builder.filter_module(target, log::LevelFilter::Warn);
    }
    builder.parse_default_env();
    if builder.try_init().is_err() {
        log::debug!("logger already initialised");
    }
}

/// Install the rustls CryptoProvider before any TLS connection.
/// electrum-client pulls in rustls 0.23 which requires an explicit provider.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}
