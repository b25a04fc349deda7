//! `TideNode`: async coordinator around an unlocked wallet session.
//!
//! The engine is blocking; every call runs on `spawn_blocking` with the
//! session mutex held, which serializes mutations of the store. Wallet
//! events from the session are forwarded to the node's subscribers, and
//! script activity reported by the chain source triggers an update of that
//! script followed by an event publish.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lwk_wollet::elements::{AssetId, Txid};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::account::{AccountId, Chain, DerivedAddress};
use crate::chain::ChainSource;
use crate::error::{Error, NodeError};
use crate::events::WalletEvent;
use crate::history::TxDetails;
use crate::network::Network;
use crate::pset::SpendRequest;
use crate::restorer::RestoreOutcome;
use crate::sdk::{SendResult, TideSdk, EVENT_CAPACITY};
use crate::store::Utxo;
use crate::taxi::FeeSponsor;

pub struct TideNode {
    sdk: Arc<Mutex<Option<TideSdk>>>,
    events: broadcast::Sender<WalletEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TideNode {
    pub fn new() -> (Self, broadcast::Receiver<WalletEvent>) {
        let (events, rx) = broadcast::channel(EVENT_CAPACITY);
        (
            Self {
                sdk: Arc::new(Mutex::new(None)),
                events,
                tasks: Mutex::new(Vec::new()),
            },
            rx,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    // ── Wallet lifecycle ────────────────────────────────────────────────

    /// Take ownership of an unlocked session and start forwarding its
    /// events and script activity. Must be called inside a Tokio runtime.
    pub fn unlock_wallet(&self, mut sdk: TideSdk) -> Result<(), NodeError> {
        let mut guard = self.sdk.lock().map_err(|_| NodeError::MutexPoisoned)?;
        if guard.is_some() {
            return Err(NodeError::WalletAlreadyUnlocked);
        }

        // Replay the current state to subscribers and set the baseline for
        // later diffs.
        let events = sdk.subscribe_events();
        sdk.publish_events()?;

        let mut handles = Vec::new();
        handles.push(tokio::spawn(forward_events(events, self.events.clone())));
        if let Some(mut activity) = sdk.take_script_activity() {
            let session = self.sdk.clone();
            handles.push(tokio::spawn(async move {
                while let Some(seen) = activity.recv().await {
                    if seen.status.is_none() {
                        continue;
                    }
                    let session = session.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        let mut guard = session.lock().map_err(|_| NodeError::MutexPoisoned)?;
                        let sdk = guard.as_mut().ok_or(NodeError::WalletLocked)?;
                        sdk.update_script(&seen.script)?;
                        sdk.publish_events().map_err(NodeError::Sdk)
                    })
                    .await;
                    match result {
                        Ok(Ok(_)) => {}
                        Ok(Err(NodeError::WalletLocked)) => break,
                        Ok(Err(e)) => log::warn!("script update failed: {e}"),
                        Err(e) => log::warn!("script update task failed: {e}"),
                    }
                }
            }));
        }

        *guard = Some(sdk);
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }
        log::info!("wallet unlocked");
        Ok(())
    }

    /// Drop the session after closing its chain connection.
    pub fn lock_wallet(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        if let Ok(mut guard) = self.sdk.lock() {
            if let Some(sdk) = guard.take() {
                if let Err(e) = sdk.close() {
                    log::warn!("closing session: {e}");
                }
                log::info!("wallet locked");
            }
        }
    }

    pub fn is_wallet_unlocked(&self) -> bool {
        self.sdk.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    // ── Internal: spawn_blocking SDK helper ─────────────────────────────

    /// Run `f` against the unlocked session on a blocking thread, holding
    /// the session mutex for its whole duration.
    async fn with_sdk<F, R>(&self, f: F) -> Result<R, NodeError>
    where
        F: FnOnce(&mut TideSdk) -> Result<R, Error> + Send + 'static,
        R: Send + 'static,
    {
        let sdk = self.sdk.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = sdk.lock().map_err(|_| NodeError::MutexPoisoned)?;
            let sdk = guard.as_mut().ok_or(NodeError::WalletLocked)?;
            f(sdk).map_err(NodeError::Sdk)
        })
        .await
        .map_err(|e| NodeError::Task(e.to_string()))?
    }

    // ── Wallet operations ───────────────────────────────────────────────

    pub async fn network(&self) -> Result<Network, NodeError> {
        self.with_sdk(|sdk| Ok(sdk.network())).await
    }

    /// Restore every account, then publish what changed.
    pub async fn sync(&self) -> Result<Vec<RestoreOutcome>, NodeError> {
        self.with_sdk(|sdk| {
            let outcomes = sdk.sync_all()?;
            sdk.publish_events()?;
            Ok(outcomes)
        })
        .await
    }

    pub async fn next_address(
        &self,
        account_id: Option<AccountId>,
        chain: Chain,
    ) -> Result<DerivedAddress, NodeError> {
        self.with_sdk(move |sdk| {
            let id = account_id.unwrap_or_else(|| sdk.main_account_id().to_string());
            sdk.next_address(&id, chain, None)
        })
        .await
    }

    pub async fn balances(&self) -> Result<HashMap<AssetId, u64>, NodeError> {
        self.with_sdk(|sdk| sdk.balances()).await
    }

    pub async fn utxos(&self) -> Result<Vec<Utxo>, NodeError> {
        self.with_sdk(|sdk| sdk.utxos(&[])).await
    }

    pub async fn transactions(&self) -> Result<Vec<TxDetails>, NodeError> {
        self.with_sdk(|sdk| sdk.transactions()).await
    }

    pub async fn explorer_url(&self, txid: Txid) -> Result<String, NodeError> {
        self.with_sdk(move |sdk| sdk.explorer_url(&txid)).await
    }

    pub async fn create_account(&self, name: String, password: String) -> Result<AccountId, NodeError> {
        self.with_sdk(move |sdk| sdk.create_account(&name, &password))
            .await
    }

    /// Build, blind, sign and broadcast, then publish the resulting events.
    pub async fn send(
        &self,
        request: SpendRequest,
        password: String,
    ) -> Result<SendResult, NodeError> {
        self.with_sdk(move |sdk| {
            let sent = sdk.send(&request, &password)?;
            sdk.publish_events()?;
            Ok(sent)
        })
        .await
    }

    pub async fn set_site_enabled(
        &self,
        network: Network,
        hostname: String,
        enabled: bool,
    ) -> Result<(), NodeError> {
        self.with_sdk(move |sdk| {
            if enabled {
                sdk.enable_site(network, &hostname);
            } else {
                sdk.disable_site(network, &hostname);
            }
            sdk.publish_events()?;
            Ok(())
        })
        .await
    }

    pub async fn set_current_hostname(&self, hostname: Option<String>) -> Result<(), NodeError> {
        self.with_sdk(move |sdk| {
            sdk.set_current_hostname(hostname);
            Ok(())
        })
        .await
    }

    pub async fn switch_network(
        &self,
        network: Network,
        chain: Arc<dyn ChainSource>,
        sponsor: Option<Arc<dyn FeeSponsor>>,
    ) -> Result<(), NodeError> {
        self.with_sdk(move |sdk| {
            sdk.switch_network(network, chain, sponsor)?;
            sdk.publish_events()?;
            Ok(())
        })
        .await
    }
}

impl Drop for TideNode {
    fn drop(&mut self) {
        self.lock_wallet();
    }
}

async fn forward_events(
    mut from: broadcast::Receiver<WalletEvent>,
    to: broadcast::Sender<WalletEvent>,
) {
    loop {
        match from.recv().await {
            Ok(event) => {
                // No subscribers is fine.
                let _ = to.send(event);
            }
            Err(RecvError::Lagged(n)) => log::warn!("dropped {n} wallet events"),
            Err(RecvError::Closed) => break,
        }
    }
}
