use std::path::PathBuf;

use tidewallet_lib::{init_logging, WalletManager};

/// Print the host state for the data directory given as the first argument
/// (default `.tidewallet`).
fn main() {
    init_logging(log::LevelFilter::Info);
    let data_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".tidewallet"));

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let manager = WalletManager::new(&data_dir);
    let state = runtime.block_on(manager.state());
    match serde_json::to_string_pretty(&state) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            log::error!("failed to encode state: {e}");
            std::process::exit(1);
        }
    }
}
