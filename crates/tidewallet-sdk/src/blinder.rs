//! Confidential blinding of built PSETs.
//!
//! Inputs are grouped by owner (a wallet account, or an outside party such
//! as a fee sponsor whose secrets we were handed). Owners whose inputs
//! cover the assets of their outputs blind them alone with
//! `blind_non_last`; the rest are blinded together by `blind_last`, which
//! also balances the transaction.

use std::collections::{HashMap, HashSet};

use lwk_wollet::elements::pset::PartiallySignedTransaction;
use lwk_wollet::elements::secp256k1_zkp::Secp256k1;
use lwk_wollet::elements::{AssetId, OutPoint, Script, TxOutSecrets};
use rand::thread_rng;

use crate::error::{Error, Result};
use crate::network::Network;
use crate::store::{UnblindingData, WalletRepository};

/// Owner label for inputs whose secrets came from outside the wallet.
const EXTERNAL_OWNER: &str = "external";

struct OwnedInput {
    owner: String,
    secrets: TxOutSecrets,
}

fn input_secrets(
    pset: &PartiallySignedTransaction,
    store: &dyn WalletRepository,
    network: Network,
) -> Result<Vec<OwnedInput>> {
    pset.inputs()
        .iter()
        .enumerate()
        .map(|(i, input)| {
            let outpoint = OutPoint::new(input.previous_txid, input.previous_output_index);
            if let Some(utxo) = store.get_utxo(network, &outpoint)? {
                let data = utxo.unblinding.ok_or_else(|| {
                    Error::Blinding(format!("input {i} ({outpoint}) was never unblinded"))
                })?;
                return Ok(OwnedInput {
                    owner: utxo.account_id,
                    secrets: data.to_txout_secrets(),
                });
            }
            if let Some(data) = store.get_outpoint_blinding_data(network, &outpoint)? {
                return Ok(OwnedInput {
                    owner: EXTERNAL_OWNER.to_string(),
                    secrets: data.to_txout_secrets(),
                });
            }
            let explicit = input.witness_utxo.as_ref().and_then(|txout| {
                Some(UnblindingData::explicit(
                    txout.asset.explicit()?,
                    txout.value.explicit()?,
                ))
            });
            match explicit {
                Some(data) => Ok(OwnedInput {
                    owner: EXTERNAL_OWNER.to_string(),
                    secrets: data.to_txout_secrets(),
                }),
                None => Err(Error::Blinding(format!(
                    "no unblinding data for input {i} ({outpoint})"
                ))),
            }
        })
        .collect()
}

/// True when every output with a script, other than those paying
/// `exclude`, carries both a range proof and a surjection proof.
pub fn is_fully_blinded(pset: &PartiallySignedTransaction, exclude: &[Script]) -> bool {
    pset.outputs().iter().all(|o| {
        o.script_pubkey.is_empty()
            || exclude.contains(&o.script_pubkey)
            || (o.value_rangeproof.is_some() && o.asset_surjection_proof.is_some())
    })
}

/// Split owners into those that blind alone with `blind_non_last` and the
/// group that balances the transaction with `blind_last`.
///
/// A surjection proof can only point at inputs whose secrets the pass
/// holds, so an owner may blind alone only when its own inputs carry every
/// asset it outputs. Everyone else joins the final group, together with any
/// earlier owner holding an asset that group lacks. Owners without outputs
/// always sit in the final group so their inputs are balanced.
fn plan_passes<'a>(
    order: &[&'a str],
    holds: &HashMap<&str, HashSet<AssetId>>,
    blinds: &HashMap<&str, HashSet<AssetId>>,
) -> (Vec<&'a str>, Vec<&'a str>) {
    let with_outputs: Vec<&'a str> = order
        .iter()
        .copied()
        .filter(|o| blinds.contains_key(o))
        .collect();
    if with_outputs.is_empty() {
        return (vec![], vec![]);
    }
    let alone = |owner: &str| match (blinds.get(owner), holds.get(owner)) {
        (Some(out), Some(held)) => out.is_subset(held),
        (Some(out), None) => out.is_empty(),
        (None, _) => false,
    };
    let mut earlier: Vec<&'a str> = with_outputs
        .iter()
        .copied()
        .filter(|o| alone(*o))
        .collect();
    if earlier.len() == with_outputs.len() {
        earlier.pop();
    }

    loop {
        let last: Vec<&'a str> = order
            .iter()
            .copied()
            .filter(|o| !earlier.contains(o))
            .collect();
        let held: HashSet<AssetId> = last
            .iter()
            .filter_map(|o| holds.get(o))
            .flatten()
            .copied()
            .collect();
        let missing: HashSet<AssetId> = last
            .iter()
            .filter_map(|o| blinds.get(o))
            .flatten()
            .filter(|a| !held.contains(a))
            .copied()
            .collect();
        let before = earlier.len();
        earlier.retain(|o| holds.get(o).map_or(true, |h| h.is_disjoint(&missing)));
        if earlier.len() == before {
            return (earlier, last);
        }
    }
}

/// Blind every output that has a blinding key and no proofs yet.
pub fn blind(
    pset: &mut PartiallySignedTransaction,
    store: &dyn WalletRepository,
    network: Network,
) -> Result<()> {
    let inputs = input_secrets(pset, store, network)?;

    // A zero-value output cannot carry a range proof.
    for output in pset.outputs_mut() {
        if output.blinding_key.is_some() && output.amount == Some(0) {
            output.blinding_key = None;
            output.blinder_index = None;
        }
    }

    let mut order: Vec<&str> = Vec::new();
    let mut holds: HashMap<&str, HashSet<AssetId>> = HashMap::new();
    for input in &inputs {
        if !order.contains(&input.owner.as_str()) {
            order.push(&input.owner);
        }
        holds
            .entry(input.owner.as_str())
            .or_default()
            .insert(input.secrets.asset);
    }

    let mut blinds: HashMap<&str, HashSet<AssetId>> = HashMap::new();
    for (i, output) in pset.outputs().iter().enumerate() {
        if output.blinding_key.is_none() || output.value_rangeproof.is_some() {
            continue;
        }
        let owner = output
            .blinder_index
            .and_then(|b| inputs.get(b as usize))
            .map(|input| input.owner.as_str())
            .ok_or_else(|| Error::Blinding(format!("output {i} has no valid blinder index")))?;
        let asset = output
            .asset
            .ok_or_else(|| Error::Blinding(format!("output {i} has no explicit asset")))?;
        blinds.entry(owner).or_default().insert(asset);
    }

    let secrets_of = |owners: &[&str]| -> HashMap<usize, TxOutSecrets> {
        inputs
            .iter()
            .enumerate()
            .filter(|(_, input)| owners.contains(&input.owner.as_str()))
            .map(|(i, input)| (i, input.secrets))
            .collect()
    };

    let (earlier, last_group) = plan_passes(&order, &holds, &blinds);
    if !last_group.is_empty() {
        let secp = Secp256k1::new();
        let mut rng = thread_rng();
        for owner in &earlier {
            log::debug!("blinding outputs of {owner}");
            pset.blind_non_last(&mut rng, &secp, &secrets_of(&[*owner]))
                .map_err(|e| Error::Blinding(format!("{e:?}")))?;
        }
        log::debug!("balancing blinders with {}", last_group.join(", "));
        pset.blind_last(&mut rng, &secp, &secrets_of(&last_group))
            .map_err(|e| Error::Blinding(format!("{e:?}")))?;
    }

    let exclude: Vec<Script> = pset
        .outputs()
        .iter()
        .filter(|o| o.blinding_key.is_none())
        .map(|o| o.script_pubkey.clone())
        .collect();
    if !is_fully_blinded(pset, &exclude) {
        let unblinded: Vec<String> = pset
            .outputs()
            .iter()
            .enumerate()
            .filter(|(_, o)| {
                o.blinding_key.is_some()
                    && (o.value_rangeproof.is_none() || o.asset_surjection_proof.is_none())
            })
            .map(|(i, _)| i.to_string())
            .collect();
        return Err(Error::IncompleteBlinding(format!(
            "outputs {}",
            unblinded.join(", ")
        )));
    }
    Ok(())
}
