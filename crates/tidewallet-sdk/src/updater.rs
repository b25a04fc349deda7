//! Applies fetched transactions to the wallet repository: unblinds outputs
//! paying wallet scripts and removes outputs those transactions spend.

use std::collections::HashMap;

use lwk_wollet::elements::secp256k1_zkp::Secp256k1;
use lwk_wollet::elements::{OutPoint, Transaction, TxOut};

use crate::account::{AccountId, WatchIdentity};
use crate::error::Result;
use crate::network::Network;
use crate::store::{TxRecord, UnblindingData, Utxo, WalletRepository};

/// Outcome of applying a batch of transactions.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdateSummary {
    pub added: Vec<OutPoint>,
    pub spent: Vec<OutPoint>,
    /// Wallet outputs whose secrets could not be recovered.
    pub opaque: Vec<OutPoint>,
}

pub struct UtxoUpdater<'a> {
    store: &'a dyn WalletRepository,
    network: Network,
    identities: HashMap<AccountId, WatchIdentity>,
}

/// Open `txout` with the owning account's blinding key, or read it as is
/// when it is explicit.
pub fn unblind_output(identity: &WatchIdentity, txout: &TxOut) -> Option<UnblindingData> {
    if let (Some(asset), Some(value)) = (txout.asset.explicit(), txout.value.explicit()) {
        return Some(UnblindingData::explicit(asset, value));
    }
    let secp = Secp256k1::new();
    let sk = identity.blinding_private_key(&txout.script_pubkey);
    txout.unblind(&secp, sk).ok().map(UnblindingData::from)
}

impl<'a> UtxoUpdater<'a> {
    pub fn new(
        store: &'a dyn WalletRepository,
        network: Network,
        identities: impl IntoIterator<Item = WatchIdentity>,
    ) -> Self {
        Self {
            store,
            network,
            identities: identities
                .into_iter()
                .map(|i| (i.account_id.clone(), i))
                .collect(),
        }
    }

    /// Record `txs`, add every wallet output they create, then remove every
    /// wallet output they spend. Adding first keeps a batch that contains
    /// both a parent and its spending child consistent.
    pub fn apply(&self, txs: &[(Transaction, Option<u32>)]) -> Result<UpdateSummary> {
        let mut summary = UpdateSummary::default();

        for (tx, height) in txs {
            let txid = tx.txid();
            for (vout, txout) in tx.output.iter().enumerate() {
                if txout.is_fee() || txout.script_pubkey.is_empty() {
                    continue;
                }
                let Some(details) = self
                    .store
                    .get_script_details(self.network, &txout.script_pubkey)?
                else {
                    continue;
                };
                let Some(identity) = self.identities.get(&details.account_id) else {
                    continue;
                };

                let outpoint = OutPoint::new(txid, vout as u32);
                let unblinding = unblind_output(identity, txout);
                if unblinding.is_none() {
                    log::warn!("cannot unblind wallet output {outpoint}, keeping it unspendable");
                    summary.opaque.push(outpoint);
                }
                self.store.add_utxo(
                    self.network,
                    Utxo {
                        outpoint,
                        prevout: txout.clone(),
                        unblinding,
                        account_id: details.account_id.clone(),
                        height: *height,
                    },
                )?;
                summary.added.push(outpoint);
            }
            self.store.add_transaction(
                self.network,
                TxRecord {
                    txid,
                    tx: tx.clone(),
                    height: *height,
                },
            )?;
        }

        for (tx, _) in txs {
            for input in &tx.input {
                if self
                    .store
                    .delete_utxo(self.network, &input.previous_output)?
                    .is_some()
                {
                    summary.spent.push(input.previous_output);
                }
            }
        }

        summary.added.retain(|o| !summary.spent.contains(o));
        log::debug!(
            "applied {} transactions on {}: +{} -{} utxos",
            txs.len(),
            self.network,
            summary.added.len(),
            summary.spent.len()
        );
        Ok(summary)
    }
}
