use lwk_wollet::elements::AssetId;
use thiserror::Error;

use crate::account::AccountType;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("relay rejected transaction: {0}")]
    RelayRejected(String),

    #[error("unexpected backend reply: {0}")]
    Protocol(String),

    #[error("insufficient funds for asset {asset}: requested {requested}, available {available}")]
    InsufficientFunds {
        asset: AssetId,
        requested: u64,
        available: u64,
    },

    #[error("unsupported sync function for account type: {0}")]
    UnsupportedAccountType(AccountType),

    #[error("invalid password")]
    InvalidPassword,

    #[error("blinding left outputs unblinded: {0}")]
    IncompleteBlinding(String),

    #[error("signature validation failed: {0}")]
    SignatureValidationFailed(String),

    #[error("unknown account: {0}")]
    UnknownAccount(String),

    #[error("account already exists: {0}")]
    AccountExists(String),

    #[error("derivation error: {0}")]
    Derivation(String),

    #[error("covenant template error: {0}")]
    Template(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("PSET construction error: {0}")]
    Pset(String),

    #[error("blinding error: {0}")]
    Blinding(String),

    #[error("cannot unblind output: {0}")]
    Unblind(String),

    #[error("signer error: {0}")]
    Signer(String),

    #[error("finalize error: {0}")]
    Finalize(String),

    #[error("fee sponsor error: {0}")]
    Taxi(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    /// Only connectivity failures are worth retrying; everything else is
    /// terminal for the call that produced it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of [`TideNode`](crate::node::TideNode) calls.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("wallet is locked")]
    WalletLocked,
    #[error("wallet is already unlocked")]
    WalletAlreadyUnlocked,
    /// A panic inside an engine call poisoned the session lock.
    #[error("wallet session lock poisoned")]
    MutexPoisoned,
    #[error("engine error: {0}")]
    Sdk(#[from] Error),
    #[error("blocking task failed: {0}")]
    Task(String),
}
