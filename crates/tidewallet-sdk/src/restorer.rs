//! Gap-limit address discovery.
//!
//! Scans each chain of an account in batches of `gap_limit` addresses
//! until a full run of `gap_limit` consecutive unused addresses is seen,
//! then fetches every transaction found, applies them, and only then
//! persists the discovered indexes.

use std::collections::{BTreeMap, HashSet};

use lwk_wollet::elements::encode::deserialize;
use lwk_wollet::elements::{Script, Transaction, Txid};
use tokio::sync::mpsc::UnboundedSender;

use crate::account::{AccountId, Chain, DerivedAddress, NextKeyIndexes, WatchIdentity};
use crate::chain::{ChainSource, HistoryEntry};
use crate::error::{Error, Result};
use crate::network::Network;
use crate::store::WalletRepository;
use crate::updater::{UpdateSummary, UtxoUpdater};

/// A status change on a subscribed wallet script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptActivity {
    pub network: Network,
    pub account_id: AccountId,
    pub script: Script,
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub account_id: AccountId,
    pub next: NextKeyIndexes,
    pub transactions: usize,
    pub update: UpdateSummary,
}

struct ChainScan {
    next: u32,
    history: Vec<HistoryEntry>,
    addresses: Vec<DerivedAddress>,
}

pub struct DeepRestorer<'a> {
    chain: &'a dyn ChainSource,
    store: &'a dyn WalletRepository,
    batch_retries: u32,
    activity: Option<UnboundedSender<ScriptActivity>>,
}

impl<'a> DeepRestorer<'a> {
    pub fn new(chain: &'a dyn ChainSource, store: &'a dyn WalletRepository) -> Self {
        Self {
            chain,
            store,
            batch_retries: 0,
            activity: None,
        }
    }

    /// Retry a failed batch this many extra times when the failure is a
    /// transport error.
    pub fn with_batch_retries(mut self, retries: u32) -> Self {
        self.batch_retries = retries;
        self
    }

    /// Subscribe discovered scripts and forward their status changes.
    pub fn with_activity_sink(mut self, sink: UnboundedSender<ScriptActivity>) -> Self {
        self.activity = Some(sink);
        self
    }

    fn retrying<T>(&self, what: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match f() {
                Err(e) if e.is_retryable() && attempt < self.batch_retries => {
                    attempt += 1;
                    log::warn!("{what} failed ({e}), retry {attempt}/{}", self.batch_retries);
                }
                other => return other,
            }
        }
    }

    fn scan_chain(
        &self,
        identity: &WatchIdentity,
        chain: Chain,
        start: u32,
        gap_limit: u32,
    ) -> Result<ChainScan> {
        let mut index = start;
        let mut last_used: Option<u32> = None;
        let mut empty_run = 0u32;
        let mut history = Vec::new();
        let mut addresses = Vec::new();

        loop {
            let batch = (index..index.saturating_add(gap_limit))
                .map(|i| identity.derive(chain, i, None))
                .collect::<Result<Vec<_>>>()?;
            let scripts: Vec<Script> = batch.iter().map(|a| a.script.clone()).collect();
            let histories = self.retrying("history batch", || self.chain.fetch_histories(&scripts))?;
            if histories.len() != batch.len() {
                return Err(Error::Protocol(format!(
                    "{} histories for {} scripts",
                    histories.len(),
                    batch.len()
                )));
            }

            for (address, entries) in batch.into_iter().zip(histories) {
                if entries.is_empty() {
                    empty_run += 1;
                } else {
                    empty_run = 0;
                    last_used = Some(address.index);
                    history.extend(entries);
                }
                addresses.push(address);
            }

            if empty_run >= gap_limit {
                break;
            }
            index = index.saturating_add(gap_limit);
        }

        let next = last_used.map(|i| i + 1).unwrap_or(start);
        addresses.retain(|a| a.index < next);
        log::debug!(
            "{}: {chain:?} chain scanned from {start}, next unused index {next}",
            identity.account_id
        );
        Ok(ChainScan {
            next,
            history,
            addresses,
        })
    }

    /// Restore one account. Starts at `start` when given (an explicit
    /// re-restore, indexes may go down) or at the stored indexes.
    pub fn sync(
        &self,
        identity: &WatchIdentity,
        gap_limit: u32,
        start: Option<NextKeyIndexes>,
    ) -> Result<RestoreOutcome> {
        let network = identity.network;
        let account = identity.account_id.as_str();
        let gap_limit = gap_limit.max(1);
        let current = self.store.get_next_key_indexes(account, network)?;
        let from = start.unwrap_or(current);

        let external = self.scan_chain(identity, Chain::External, from.external, gap_limit)?;
        let internal = self.scan_chain(identity, Chain::Internal, from.internal, gap_limit)?;

        let mut heights: BTreeMap<Txid, Option<u32>> = BTreeMap::new();
        for entry in external.history.iter().chain(&internal.history) {
            heights.insert(entry.txid, entry.confirmed_height());
        }
        let txids: Vec<Txid> = heights.keys().copied().collect();
        let raw = self.retrying("transaction batch", || self.chain.fetch_transactions(&txids))?;
        if raw.len() != txids.len() {
            return Err(Error::Protocol(format!(
                "{} transactions for {} txids",
                raw.len(),
                txids.len()
            )));
        }
        let mut txs = Vec::with_capacity(raw.len());
        for (txid, hex_tx) in txids.iter().zip(&raw) {
            let bytes = hex::decode(hex_tx)
                .map_err(|e| Error::Protocol(format!("bad transaction hex for {txid}: {e}")))?;
            let tx: Transaction = deserialize(&bytes)
                .map_err(|e| Error::Protocol(format!("bad transaction {txid}: {e}")))?;
            txs.push((tx, heights.get(txid).copied().flatten()));
        }
        // Parents before children: confirmed by height, mempool last.
        txs.sort_by_key(|(_, h)| h.unwrap_or(u32::MAX));

        // Every network call succeeded; from here on we only write.
        for address in external.addresses.iter().chain(&internal.addresses) {
            self.store
                .add_script_details(network, &address.script, address.script_details(account))?;
        }
        let update = UtxoUpdater::new(self.store, network, [identity.clone()]).apply(&txs)?;

        let discovered = NextKeyIndexes {
            external: external.next,
            internal: internal.next,
        };
        let next = match start {
            Some(_) => discovered,
            None => discovered.max(current),
        };
        self.store.set_next_key_indexes(account, network, next)?;

        if let Some(sink) = &self.activity {
            self.subscribe_all(identity, next, sink)?;
        }

        log::info!(
            "restored {account} on {network}: next {}/{}, {} txs",
            next.external,
            next.internal,
            txs.len()
        );
        Ok(RestoreOutcome {
            account_id: account.to_string(),
            next,
            transactions: txs.len(),
            update,
        })
    }

    fn subscribe_all(
        &self,
        identity: &WatchIdentity,
        next: NextKeyIndexes,
        sink: &UnboundedSender<ScriptActivity>,
    ) -> Result<()> {
        let mut seen = HashSet::new();
        for chain in Chain::BOTH {
            for index in 0..next.get(chain) {
                let address = identity.derive(chain, index, None)?;
                if !seen.insert(address.script.clone()) {
                    continue;
                }
                let sink = sink.clone();
                let activity = ScriptActivity {
                    network: identity.network,
                    account_id: identity.account_id.clone(),
                    script: address.script.clone(),
                    status: None,
                };
                self.chain.subscribe_script_status(
                    &address.script,
                    Box::new(move |_hash, status| {
                        let _ = sink.send(ScriptActivity {
                            status,
                            ..activity.clone()
                        });
                    }),
                )?;
            }
        }
        Ok(())
    }
}
