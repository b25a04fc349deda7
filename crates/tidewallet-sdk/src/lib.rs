pub use lwk_wollet::elements;

pub mod account;
pub mod blinder;
pub mod chain;
pub mod chain_watcher;
pub mod coin_selection;
pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod mnemonic;
pub mod network;
pub mod node;
pub mod pset;
pub mod restorer;
pub mod sdk;
pub mod signer;
pub mod store;
pub mod taproot;
pub mod taxi;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod updater;

// Core types
pub use config::WalletConfig;
pub use error::{Error, NodeError, Result};
pub use network::Network;
pub use node::TideNode;
pub use sdk::{SendResult, TideSdk};

// Re-export LWK for app-layer use
pub use lwk_wollet;

// Accounts and storage
pub use account::{
    Account, AccountDetails, AccountId, AccountType, Chain, ConstructorArgs, CovenantTemplate,
    DerivedAddress, NextKeyIndexes, SigningIdentity, WatchIdentity, MAIN_ACCOUNT,
    MAIN_ACCOUNT_LEGACY, MAIN_ACCOUNT_TEST,
};
pub use mnemonic::EncryptedMnemonic;
pub use store::{MemoryStore, StoreError, TxRecord, UnblindingData, Utxo, WalletRepository};

// Chain access and discovery
pub use chain::{ChainSource, ElectrumChainSource, FeeRate, HistoryEntry};
pub use chain_watcher::WatcherEvent;
pub use restorer::{DeepRestorer, RestoreOutcome, ScriptActivity};
pub use updater::{UpdateSummary, UtxoUpdater};

// Spending
pub use coin_selection::{select, CoinSelection, Reservation, Reservations, Target};
pub use pset::{
    pset_from_base64, pset_to_base64, AddressRecipient, BuiltPset, DataRecipient, PsetBuilder,
    SpendRequest,
};
pub use taxi::{FeeSponsor, TaxiClient, Topup, TopupRequest};
pub use blinder::{blind, is_fully_blinded};
pub use signer::{finalize_and_extract, sign, validate_all_inputs};

// History and events
pub use events::{EventEmitter, WalletEvent, WalletSnapshot};
pub use history::{balances, TxDetails, TxType, Transfer};
