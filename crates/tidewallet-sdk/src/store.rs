//! Wallet repository: the persistence seam of the engine.
//!
//! [`WalletRepository`] is the storage contract; [`MemoryStore`] is the
//! in-process implementation used by default and in tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use lwk_wollet::elements::confidential::{AssetBlindingFactor, ValueBlindingFactor};
use lwk_wollet::elements::{AssetId, OutPoint, Script, Transaction, TxOut, TxOutSecrets, Txid};
use thiserror::Error;

use crate::account::{AccountDetails, AccountId, Chain, NextKeyIndexes, ScriptDetails};
use crate::network::Network;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("outpoint {outpoint} already belongs to account {owner}")]
    DuplicateOutpoint { outpoint: OutPoint, owner: AccountId },

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("storage lock poisoned")]
    Poisoned,

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Secrets that open a confidential output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnblindingData {
    pub asset: AssetId,
    pub value: u64,
    pub asset_blinding_factor: AssetBlindingFactor,
    pub value_blinding_factor: ValueBlindingFactor,
}

impl UnblindingData {
    /// Secrets of an explicit (unblinded) output.
    pub fn explicit(asset: AssetId, value: u64) -> Self {
        Self {
            asset,
            value,
            asset_blinding_factor: AssetBlindingFactor::zero(),
            value_blinding_factor: ValueBlindingFactor::zero(),
        }
    }

    pub fn to_txout_secrets(&self) -> TxOutSecrets {
        TxOutSecrets {
            asset: self.asset,
            asset_bf: self.asset_blinding_factor,
            value: self.value,
            value_bf: self.value_blinding_factor,
        }
    }
}

impl From<TxOutSecrets> for UnblindingData {
    fn from(s: TxOutSecrets) -> Self {
        Self {
            asset: s.asset,
            value: s.value,
            asset_blinding_factor: s.asset_bf,
            value_blinding_factor: s.value_bf,
        }
    }
}

/// A wallet-owned output. Outputs we failed to unblind are kept but are
/// never eligible for coin selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub prevout: TxOut,
    pub unblinding: Option<UnblindingData>,
    pub account_id: AccountId,
    pub height: Option<u32>,
}

impl Utxo {
    pub fn asset(&self) -> Option<AssetId> {
        self.unblinding.map(|u| u.asset)
    }

    pub fn value(&self) -> Option<u64> {
        self.unblinding.map(|u| u.value)
    }

    pub fn is_spendable(&self) -> bool {
        self.unblinding.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
    pub txid: Txid,
    pub tx: Transaction,
    /// `None` while unconfirmed.
    pub height: Option<u32>,
}

/// Storage contract for accounts, derivation indexes, scripts, outputs
/// and transactions, partitioned by network where the data is
/// network-specific.
pub trait WalletRepository: Send + Sync {
    fn get_account_details(&self, id: &str) -> StoreResult<Option<AccountDetails>>;

    fn list_accounts(&self) -> StoreResult<Vec<AccountDetails>>;

    /// Insert or replace an account record.
    fn update_account_details(&self, details: AccountDetails) -> StoreResult<()>;

    fn get_next_key_indexes(&self, account: &str, network: Network) -> StoreResult<NextKeyIndexes>;

    fn set_next_key_indexes(
        &self,
        account: &str,
        network: Network,
        indexes: NextKeyIndexes,
    ) -> StoreResult<()>;

    /// Atomically return the current index of `chain` and advance it by one.
    fn next_key_index(&self, account: &str, network: Network, chain: Chain) -> StoreResult<u32>;

    fn add_script_details(
        &self,
        network: Network,
        script: &Script,
        details: ScriptDetails,
    ) -> StoreResult<()>;

    fn get_script_details(&self, network: Network, script: &Script)
        -> StoreResult<Option<ScriptDetails>>;

    fn list_scripts(&self, network: Network, account: &str)
        -> StoreResult<Vec<(Script, ScriptDetails)>>;

    /// UTXOs of `accounts` (all accounts when empty), ordered by outpoint.
    fn get_utxos(&self, network: Network, accounts: &[AccountId]) -> StoreResult<Vec<Utxo>>;

    fn get_utxo(&self, network: Network, outpoint: &OutPoint) -> StoreResult<Option<Utxo>>;

    /// Fails when the outpoint is already owned by a different account.
    fn add_utxo(&self, network: Network, utxo: Utxo) -> StoreResult<()>;

    fn delete_utxo(&self, network: Network, outpoint: &OutPoint) -> StoreResult<Option<Utxo>>;

    /// Unblinding data survives spending; history and explorer links need it.
    fn update_outpoint_blinding_data(
        &self,
        network: Network,
        data: &[(OutPoint, UnblindingData)],
    ) -> StoreResult<()>;

    fn get_outpoint_blinding_data(
        &self,
        network: Network,
        outpoint: &OutPoint,
    ) -> StoreResult<Option<UnblindingData>>;

    /// Insert or replace (height changes on confirmation).
    fn add_transaction(&self, network: Network, record: TxRecord) -> StoreResult<()>;

    fn get_transaction(&self, network: Network, txid: &Txid) -> StoreResult<Option<TxRecord>>;

    fn get_transactions(&self, network: Network) -> StoreResult<Vec<TxRecord>>;

    /// Drop outputs and transactions of `network` ahead of a re-restore.
    fn clear_network(&self, network: Network) -> StoreResult<()>;
}

#[derive(Default)]
struct NetworkData {
    utxos: HashMap<OutPoint, Utxo>,
    blinding: HashMap<OutPoint, UnblindingData>,
    scripts: HashMap<Script, ScriptDetails>,
    transactions: HashMap<Txid, TxRecord>,
    indexes: HashMap<AccountId, NextKeyIndexes>,
}

#[derive(Default)]
struct Inner {
    accounts: Vec<AccountDetails>,
    networks: HashMap<Network, NetworkData>,
}

impl Inner {
    fn net(&mut self, network: Network) -> &mut NetworkData {
        self.networks.entry(network).or_default()
    }
}

/// In-memory [`WalletRepository`]; one lock guards everything so
/// multi-step updates stay consistent.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl WalletRepository for MemoryStore {
    fn get_account_details(&self, id: &str) -> StoreResult<Option<AccountDetails>> {
        Ok(self.lock()?.accounts.iter().find(|a| a.id == id).cloned())
    }

    fn list_accounts(&self) -> StoreResult<Vec<AccountDetails>> {
        Ok(self.lock()?.accounts.clone())
    }

    fn update_account_details(&self, details: AccountDetails) -> StoreResult<()> {
        let mut inner = self.lock()?;
        match inner.accounts.iter_mut().find(|a| a.id == details.id) {
            Some(existing) => *existing = details,
            None => inner.accounts.push(details),
        }
        Ok(())
    }

    fn get_next_key_indexes(&self, account: &str, network: Network) -> StoreResult<NextKeyIndexes> {
        let mut inner = self.lock()?;
        Ok(inner.net(network).indexes.get(account).copied().unwrap_or_default())
    }

    fn set_next_key_indexes(
        &self,
        account: &str,
        network: Network,
        indexes: NextKeyIndexes,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if !inner.accounts.iter().any(|a| a.id == account) {
            return Err(StoreError::AccountNotFound(account.to_string()));
        }
        inner.net(network).indexes.insert(account.to_string(), indexes);
        Ok(())
    }

    fn next_key_index(&self, account: &str, network: Network, chain: Chain) -> StoreResult<u32> {
        let mut inner = self.lock()?;
        let entry = inner
            .net(network)
            .indexes
            .entry(account.to_string())
            .or_default();
        let index = entry.get(chain);
        entry.set(chain, index + 1);
        Ok(index)
    }

    fn add_script_details(
        &self,
        network: Network,
        script: &Script,
        details: ScriptDetails,
    ) -> StoreResult<()> {
        self.lock()?.net(network).scripts.insert(script.clone(), details);
        Ok(())
    }

    fn get_script_details(
        &self,
        network: Network,
        script: &Script,
    ) -> StoreResult<Option<ScriptDetails>> {
        Ok(self.lock()?.net(network).scripts.get(script).cloned())
    }

    fn list_scripts(
        &self,
        network: Network,
        account: &str,
    ) -> StoreResult<Vec<(Script, ScriptDetails)>> {
        let mut inner = self.lock()?;
        let mut scripts: Vec<_> = inner
            .net(network)
            .scripts
            .iter()
            .filter(|(_, d)| d.account_id == account)
            .map(|(s, d)| (s.clone(), d.clone()))
            .collect();
        scripts.sort_by_key(|(_, d)| (d.chain.index(), d.index));
        Ok(scripts)
    }

    fn get_utxos(&self, network: Network, accounts: &[AccountId]) -> StoreResult<Vec<Utxo>> {
        let mut inner = self.lock()?;
        let mut utxos: Vec<Utxo> = inner
            .net(network)
            .utxos
            .values()
            .filter(|u| accounts.is_empty() || accounts.contains(&u.account_id))
            .cloned()
            .collect();
        utxos.sort_by_key(|u| (u.outpoint.txid.to_string(), u.outpoint.vout));
        Ok(utxos)
    }

    fn get_utxo(&self, network: Network, outpoint: &OutPoint) -> StoreResult<Option<Utxo>> {
        Ok(self.lock()?.net(network).utxos.get(outpoint).cloned())
    }

    fn add_utxo(&self, network: Network, utxo: Utxo) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let net = inner.net(network);
        if let Some(existing) = net.utxos.get(&utxo.outpoint) {
            if existing.account_id != utxo.account_id {
                return Err(StoreError::DuplicateOutpoint {
                    outpoint: utxo.outpoint,
                    owner: existing.account_id.clone(),
                });
            }
        }
        if let Some(data) = utxo.unblinding {
            net.blinding.insert(utxo.outpoint, data);
        }
        net.utxos.insert(utxo.outpoint, utxo);
        Ok(())
    }

    fn delete_utxo(&self, network: Network, outpoint: &OutPoint) -> StoreResult<Option<Utxo>> {
        Ok(self.lock()?.net(network).utxos.remove(outpoint))
    }

    fn update_outpoint_blinding_data(
        &self,
        network: Network,
        data: &[(OutPoint, UnblindingData)],
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let net = inner.net(network);
        for (outpoint, secrets) in data {
            net.blinding.insert(*outpoint, *secrets);
        }
        Ok(())
    }

    fn get_outpoint_blinding_data(
        &self,
        network: Network,
        outpoint: &OutPoint,
    ) -> StoreResult<Option<UnblindingData>> {
        Ok(self.lock()?.net(network).blinding.get(outpoint).copied())
    }

    fn add_transaction(&self, network: Network, record: TxRecord) -> StoreResult<()> {
        self.lock()?.net(network).transactions.insert(record.txid, record);
        Ok(())
    }

    fn get_transaction(&self, network: Network, txid: &Txid) -> StoreResult<Option<TxRecord>> {
        Ok(self.lock()?.net(network).transactions.get(txid).cloned())
    }

    fn get_transactions(&self, network: Network) -> StoreResult<Vec<TxRecord>> {
        let mut inner = self.lock()?;
        let mut txs: Vec<TxRecord> = inner.net(network).transactions.values().cloned().collect();
        // Confirmed first by height, mempool last.
        txs.sort_by_key(|t| (t.height.unwrap_or(u32::MAX), t.txid.to_string()));
        Ok(txs)
    }

    fn clear_network(&self, network: Network) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let net = inner.net(network);
        net.utxos.clear();
        net.transactions.clear();
        Ok(())
    }
}
