use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

use tidewallet_sdk::account::Chain;
use tidewallet_sdk::{
    AddressRecipient, ChainSource, ElectrumChainSource, EncryptedMnemonic, FeeSponsor,
    MemoryStore, Network, NodeError, SpendRequest, TaxiClient, TideNode, TideSdk, WalletConfig,
    WalletEvent,
};

use crate::config::{ConfigError, HostConfig};

use super::persister::{MnemonicPersister, WalletPersistError};
use super::types::{
    HostState, LiquidSendResult, NetworkStatus, WalletAddress, WalletBalance, WalletNotification,
    WalletStatus, WalletTransaction, WalletUtxo,
};

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Wallet already exists")]
    AlreadyExists,

    #[error("No wallet has been created")]
    NotCreated,

    #[error("Invalid mnemonic")]
    InvalidMnemonic,

    #[error("Engine error: {0}")]
    Engine(#[from] tidewallet_sdk::Error),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Persist error: {0}")]
    Persist(#[from] WalletPersistError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Task error: {0}")]
    Task(String),
}

/// Chain access and fee sponsor for one network.
pub struct Connection {
    pub chain: Arc<dyn ChainSource>,
    pub sponsor: Option<Arc<dyn FeeSponsor>>,
}

type Connector = dyn Fn(&WalletConfig) -> tidewallet_sdk::Result<Connection> + Send + Sync;

/// Electrum for chain data, the taxi service for sponsored fees.
fn connect_remote(config: &WalletConfig) -> tidewallet_sdk::Result<Connection> {
    Ok(Connection {
        chain: Arc::new(ElectrumChainSource::new(config.electrum_url())),
        sponsor: Some(Arc::new(TaxiClient::new(config.taxi_url())?)),
    })
}

/// Host-side wallet lifecycle: the sealed seed on disk, the host
/// configuration, and the engine session behind a [`TideNode`].
pub struct WalletManager {
    data_dir: PathBuf,
    config: HostConfig,
    persister: MnemonicPersister,
    node: TideNode,
    connector: Arc<Connector>,
}

impl WalletManager {
    pub fn new(data_dir: &Path) -> Self {
        crate::install_crypto_provider();
        let config = HostConfig::load(data_dir);
        let (node, _rx) = TideNode::new();
        Self {
            data_dir: data_dir.to_path_buf(),
            persister: MnemonicPersister::new(data_dir),
            config,
            node,
            connector: Arc::new(connect_remote),
        }
    }

    /// Replace how sessions reach the chain and the fee sponsor.
    pub fn with_connector<F>(mut self, connector: F) -> Self
    where
        F: Fn(&WalletConfig) -> tidewallet_sdk::Result<Connection> + Send + Sync + 'static,
    {
        self.connector = Arc::new(connector);
        self
    }

    pub fn network(&self) -> Network {
        self.config.network
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn status(&self) -> WalletStatus {
        if !self.persister.exists() {
            WalletStatus::NotCreated
        } else if !self.node.is_wallet_unlocked() {
            WalletStatus::Locked
        } else {
            WalletStatus::Unlocked
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.node.subscribe()
    }

    /// Push every wallet event, in serializable form, to `sink` until the
    /// manager is dropped. Must be called inside a Tokio runtime.
    pub fn forward_notifications<F>(&self, mut sink: F) -> JoinHandle<()>
    where
        F: FnMut(WalletNotification) + Send + 'static,
    {
        let mut rx = self.node.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => sink(WalletNotification::from(&event)),
                    Err(RecvError::Lagged(n)) => log::warn!("notification sink lagged by {n}"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    // ── Seed lifecycle ──────────────────────────────────────────────────

    /// Create a wallet with a fresh mnemonic sealed under `password` and
    /// unlock it. Returns the mnemonic for user backup.
    pub async fn create_wallet(&self, password: &str) -> Result<Zeroizing<String>, WalletError> {
        if self.persister.exists() {
            return Err(WalletError::AlreadyExists);
        }
        let mnemonic = Zeroizing::new(TideSdk::generate_mnemonic(self.network())?);
        self.seal(&mnemonic, password)?;
        self.unlock(password).await?;
        Ok(mnemonic)
    }

    /// Seal an existing mnemonic under `password`, replacing any stored
    /// seed, and unlock it.
    pub async fn restore_wallet(&self, mnemonic: &str, password: &str) -> Result<(), WalletError> {
        let _mnemonic: bip39::Mnemonic = mnemonic
            .parse()
            .map_err(|_| WalletError::InvalidMnemonic)?;
        self.node.lock_wallet();
        self.seal(mnemonic, password)?;
        self.unlock(password).await
    }

    fn seal(&self, mnemonic: &str, password: &str) -> Result<(), WalletError> {
        let sealed = EncryptedMnemonic::encrypt(mnemonic, password)?;
        self.persister.save(&sealed)?;
        Ok(())
    }

    /// Open an engine session for the configured network. A wrong password
    /// fails with the engine's `InvalidPassword`.
    pub async fn unlock(&self, password: &str) -> Result<(), WalletError> {
        if !self.persister.exists() {
            return Err(WalletError::NotCreated);
        }
        if self.node.is_wallet_unlocked() {
            return Err(NodeError::WalletAlreadyUnlocked.into());
        }
        let sealed = self.persister.load()?;
        let config = self.config.wallet_config(self.network());
        let connector = self.connector.clone();
        let password = Zeroizing::new(password.to_string());

        let sdk = tokio::task::spawn_blocking(move || -> Result<TideSdk, WalletError> {
            let mnemonic = sealed.decrypt(&password)?;
            let Connection { chain, sponsor } = connector(&config)?;
            let mut sdk = TideSdk::new(config, Arc::new(MemoryStore::new()), chain);
            if let Some(sponsor) = sponsor {
                sdk = sdk.with_sponsor(sponsor);
            }
            sdk.restore_wallet(&mnemonic, &password)?;
            Ok(sdk)
        })
        .await
        .map_err(|e| WalletError::Task(e.to_string()))??;

        self.node.unlock_wallet(sdk)?;
        log::info!("wallet unlocked on {}", self.network());
        Ok(())
    }

    pub fn lock(&self) {
        self.node.lock_wallet();
    }

    /// Lock and forget the sealed seed.
    pub fn delete_wallet(&self) -> Result<(), WalletError> {
        self.node.lock_wallet();
        self.persister.delete()?;
        Ok(())
    }

    // ── Configuration ───────────────────────────────────────────────────

    /// Persist `network` as the active network and move an unlocked
    /// session over to it.
    pub async fn set_network(&mut self, network: Network) -> Result<(), WalletError> {
        self.config.network = network;
        self.config.save(&self.data_dir)?;
        if self.node.is_wallet_unlocked() {
            let config = self.config.wallet_config(network);
            let connector = self.connector.clone();
            let Connection { chain, sponsor } = tokio::task::spawn_blocking(move || connector(&config))
                .await
                .map_err(|e| WalletError::Task(e.to_string()))??;
            self.node.switch_network(network, chain, sponsor).await?;
        }
        Ok(())
    }

    /// Takes effect at the next unlock or network switch.
    pub fn set_electrum_url(
        &mut self,
        network: Network,
        url: Option<String>,
    ) -> Result<(), WalletError> {
        self.config.set_electrum_url(network, url);
        self.config.save(&self.data_dir)?;
        Ok(())
    }

    // ── Wallet queries and actions ──────────────────────────────────────

    pub async fn sync(&self) -> Result<(), WalletError> {
        let outcomes = self.node.sync().await?;
        let txs: usize = outcomes.iter().map(|o| o.transactions).sum();
        log::info!("synced {} accounts, {txs} transactions", outcomes.len());
        Ok(())
    }

    pub async fn balance(&self) -> Result<WalletBalance, WalletError> {
        Ok(WalletBalance::from(self.node.balances().await?))
    }

    pub async fn address(&self) -> Result<WalletAddress, WalletError> {
        let address = self.node.next_address(None, Chain::External).await?;
        Ok(WalletAddress::from(&address))
    }

    pub async fn utxos(&self) -> Result<Vec<WalletUtxo>, WalletError> {
        Ok(self.node.utxos().await?.iter().map(WalletUtxo::from).collect())
    }

    pub async fn transactions(&self) -> Result<Vec<WalletTransaction>, WalletError> {
        let policy_asset = self.network().policy_asset();
        Ok(self
            .node
            .transactions()
            .await?
            .iter()
            .map(|tx| WalletTransaction::from_details(tx, &policy_asset))
            .collect())
    }

    /// Send policy asset to a Liquid address from the main account.
    pub async fn send_lbtc(
        &self,
        address: &str,
        amount_sat: u64,
        password: &str,
    ) -> Result<LiquidSendResult, WalletError> {
        let policy_asset = self.network().policy_asset();
        let request = SpendRequest {
            recipients: vec![AddressRecipient {
                address: address.to_string(),
                asset: policy_asset,
                value: amount_sat,
            }],
            data: vec![],
            fee_asset: policy_asset,
            accounts: vec![],
        };
        let sent = self.node.send(request, password.to_string()).await?;
        Ok(LiquidSendResult::from(&sent))
    }

    pub fn network_status(&self) -> NetworkStatus {
        let network = self.network();
        NetworkStatus {
            network: network.as_str().to_string(),
            is_mainnet: network.is_mainnet(),
            electrum_url: self.config.wallet_config(network).electrum_url().to_string(),
            policy_asset_id: network.policy_asset().to_string(),
        }
    }

    pub async fn state(&self) -> HostState {
        let wallet_status = self.status();
        let wallet_balance = if wallet_status == WalletStatus::Unlocked {
            self.balance().await.ok()
        } else {
            None
        };
        HostState {
            network_status: self.network_status(),
            wallet_status,
            wallet_balance,
        }
    }
}
