pub mod manager;
pub mod persister;
pub mod types;

pub use manager::{Connection, WalletError, WalletManager};
