//! Wallet-perspective views over stored transactions: balances, net
//! transfers per asset and explorer links with unblinding data.

use std::collections::HashMap;

use lwk_wollet::elements::{AssetId, OutPoint, Transaction, Txid};
use serde::Serialize;

use crate::error::Result;
use crate::network::Network;
use crate::store::{TxRecord, UnblindingData, Utxo, WalletRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TxType {
    SelfTransfer,
    Deposit,
    Withdraw,
    Swap,
    Unknown,
}

/// Net movement of one asset; negative when the wallet paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transfer {
    pub asset: AssetId,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxDetails {
    pub txid: Txid,
    pub height: Option<u32>,
    pub fee: u64,
    pub transfers: Vec<Transfer>,
    pub tx_type: TxType,
}

/// Per-asset sum of spendable UTXOs. Outputs we could not unblind do not
/// count.
pub fn balances(utxos: &[Utxo]) -> HashMap<AssetId, u64> {
    let mut out = HashMap::new();
    for data in utxos.iter().filter_map(|u| u.unblinding) {
        *out.entry(data.asset).or_insert(0) += data.value;
    }
    out
}

/// Value of the explicit fee output, if the transaction has one.
pub fn fee_amount_from_tx(tx: &Transaction) -> Option<u64> {
    tx.output
        .iter()
        .find(|o| o.script_pubkey.is_empty())
        .and_then(|o| o.value.explicit())
}

fn fee_output(tx: &Transaction) -> Option<(AssetId, u64)> {
    let out = tx.output.iter().find(|o| o.script_pubkey.is_empty())?;
    Some((out.asset.explicit()?, out.value.explicit()?))
}

pub fn tx_type(transfers: &[Transfer]) -> TxType {
    if transfers.iter().any(|t| t.amount == 0) {
        return TxType::SelfTransfer;
    }
    match transfers {
        [t] if t.amount > 0 => TxType::Deposit,
        [t] if t.amount < 0 => TxType::Withdraw,
        [_, _] => TxType::Swap,
        _ => TxType::Unknown,
    }
}

fn is_wallet_output(
    store: &dyn WalletRepository,
    network: Network,
    outpoint: &OutPoint,
) -> Result<bool> {
    let Some(prev) = store.get_transaction(network, &outpoint.txid)? else {
        return Ok(false);
    };
    let Some(txout) = prev.tx.output.get(outpoint.vout as usize) else {
        return Ok(false);
    };
    Ok(store
        .get_script_details(network, &txout.script_pubkey)?
        .is_some())
}

/// Secrets of the wallet outputs `tx` creates, by output index.
fn wallet_outputs(
    store: &dyn WalletRepository,
    network: Network,
    tx: &Transaction,
) -> Result<Vec<(u32, UnblindingData)>> {
    let txid = tx.txid();
    let mut out = Vec::new();
    for (vout, txout) in tx.output.iter().enumerate() {
        if txout.script_pubkey.is_empty()
            || store
                .get_script_details(network, &txout.script_pubkey)?
                .is_none()
        {
            continue;
        }
        let outpoint = OutPoint::new(txid, vout as u32);
        match store.get_outpoint_blinding_data(network, &outpoint)? {
            Some(data) => out.push((vout as u32, data)),
            None => log::warn!("wallet output {outpoint} has no unblinding data"),
        }
    }
    Ok(out)
}

/// Net transfers of `record` from the wallet's point of view, with the
/// fee output accounted for.
pub fn classify(
    record: &TxRecord,
    store: &dyn WalletRepository,
    network: Network,
) -> Result<TxDetails> {
    let mut transfers: Vec<Transfer> = Vec::new();
    let mut add = |asset: AssetId, amount: i64| match transfers.iter_mut().find(|t| t.asset == asset)
    {
        Some(t) => t.amount += amount,
        None => transfers.push(Transfer { asset, amount }),
    };

    for input in &record.tx.input {
        let prev = input.previous_output;
        if !is_wallet_output(store, network, &prev)? {
            continue;
        }
        match store.get_outpoint_blinding_data(network, &prev)? {
            Some(data) => add(data.asset, -(data.value as i64)),
            None => log::warn!("spent wallet output {prev} has no unblinding data"),
        }
    }
    for (_, data) in wallet_outputs(store, network, &record.tx)? {
        add(data.asset, data.value as i64);
    }

    let (fee_asset, fee) = fee_output(&record.tx).unwrap_or((network.policy_asset(), 0));
    let only_one = transfers.len() == 1;
    let transfers: Vec<Transfer> = transfers
        .into_iter()
        .filter_map(|mut t| {
            if t.asset == fee_asset && t.amount.unsigned_abs() == fee {
                if !only_one {
                    return None;
                }
                t.amount = 0;
            }
            Some(t)
        })
        .collect();

    Ok(TxDetails {
        txid: record.txid,
        height: record.height,
        fee,
        tx_type: tx_type(&transfers),
        transfers,
    })
}

/// Explorer link that lets the explorer open the wallet's outputs of `tx`:
/// `{explorer}/tx/{txid}#blinded=value,asset,vbf,abf,...`.
pub fn explorer_url_with_blinders(
    explorer: &str,
    tx: &Transaction,
    store: &dyn WalletRepository,
    network: Network,
) -> Result<String> {
    let blinders: Vec<String> = wallet_outputs(store, network, tx)?
        .into_iter()
        .map(|(_, d)| {
            format!(
                "{},{},{},{}",
                d.value, d.asset, d.value_blinding_factor, d.asset_blinding_factor
            )
        })
        .collect();
    Ok(format!(
        "{}/tx/{}#blinded={}",
        explorer.trim_end_matches('/'),
        tx.txid(),
        blinders.join(",")
    ))
}
