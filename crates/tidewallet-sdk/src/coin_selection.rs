//! Greedy per-asset coin selection and UTXO reservations.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use lwk_wollet::elements::{AssetId, OutPoint};

use crate::error::{Error, Result};
use crate::store::Utxo;

/// An amount of one asset the selection must cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub asset: AssetId,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeOutput<D> {
    pub asset: AssetId,
    pub amount: u64,
    pub destination: D,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinSelection<D> {
    pub utxos: Vec<Utxo>,
    pub change: Vec<ChangeOutput<D>>,
}

impl<D> CoinSelection<D> {
    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.utxos.iter().map(|u| u.outpoint).collect()
    }
}

/// Sum targets per asset, keeping first-appearance order and dropping
/// zero amounts.
fn aggregate(targets: &[Target]) -> Vec<Target> {
    let mut out: Vec<Target> = Vec::new();
    for t in targets.iter().filter(|t| t.amount > 0) {
        match out.iter_mut().find(|o| o.asset == t.asset) {
            Some(o) => o.amount += t.amount,
            None => out.push(*t),
        }
    }
    out
}

/// For each target asset, take the largest eligible UTXOs until the target
/// is covered. Change destinations are requested only once the whole
/// selection has succeeded, one per asset with a positive remainder.
pub fn select<D>(
    available: &[Utxo],
    targets: &[Target],
    mut change_destination: impl FnMut(AssetId) -> Result<D>,
) -> Result<CoinSelection<D>> {
    let mut utxos = Vec::new();
    let mut remainders = Vec::new();

    for target in aggregate(targets) {
        let mut candidates: Vec<(&Utxo, u64)> = available
            .iter()
            .filter_map(|u| {
                let data = u.unblinding?;
                (data.asset == target.asset).then_some((u, data.value))
            })
            .collect();
        candidates.sort_by(|(a, va), (b, vb)| {
            vb.cmp(va)
                .then_with(|| a.outpoint.txid.cmp(&b.outpoint.txid))
                .then_with(|| a.outpoint.vout.cmp(&b.outpoint.vout))
        });

        let mut total = 0u64;
        for (utxo, value) in &candidates {
            if total >= target.amount {
                break;
            }
            total += value;
            utxos.push((*utxo).clone());
        }

        if total < target.amount {
            return Err(Error::InsufficientFunds {
                asset: target.asset,
                requested: target.amount,
                available: total,
            });
        }
        if total > target.amount {
            remainders.push((target.asset, total - target.amount));
        }
    }

    let change = remainders
        .into_iter()
        .map(|(asset, amount)| {
            Ok(ChangeOutput {
                asset,
                amount,
                destination: change_destination(asset)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CoinSelection { utxos, change })
}

/// Process-wide set of outpoints held by in-flight PSETs.
#[derive(Debug, Default, Clone)]
pub struct Reservations {
    held: Arc<Mutex<HashSet<OutPoint>>>,
}

fn lock(set: &Mutex<HashSet<OutPoint>>) -> MutexGuard<'_, HashSet<OutPoint>> {
    // A poisoned set is still a valid set of outpoints.
    set.lock().unwrap_or_else(|p| p.into_inner())
}

impl Reservations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_reserved(&self, outpoint: &OutPoint) -> bool {
        lock(&self.held).contains(outpoint)
    }

    pub fn len(&self) -> usize {
        lock(&self.held).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot, select and reserve under one lock so concurrent builders
    /// never pick the same outpoint.
    pub fn reserve<D>(
        &self,
        snapshot: impl FnOnce() -> Result<Vec<Utxo>>,
        choose: impl FnOnce(&[Utxo]) -> Result<CoinSelection<D>>,
    ) -> Result<(CoinSelection<D>, Reservation)> {
        let mut held = lock(&self.held);
        let available: Vec<Utxo> = snapshot()?
            .into_iter()
            .filter(|u| !held.contains(&u.outpoint))
            .collect();
        let selection = choose(&available)?;
        let outpoints = selection.outpoints();
        held.extend(outpoints.iter().copied());
        Ok((
            selection,
            Reservation {
                outpoints,
                held: self.held.clone(),
                active: true,
            },
        ))
    }

    /// UTXOs from `snapshot` not held by anyone, without reserving.
    pub fn unreserved(&self, snapshot: Vec<Utxo>) -> Vec<Utxo> {
        let held = lock(&self.held);
        snapshot
            .into_iter()
            .filter(|u| !held.contains(&u.outpoint))
            .collect()
    }
}

/// Outpoints held for one PSET. Released on drop unless consumed by a
/// successful broadcast.
#[derive(Debug)]
pub struct Reservation {
    outpoints: Vec<OutPoint>,
    held: Arc<Mutex<HashSet<OutPoint>>>,
    active: bool,
}

impl Reservation {
    pub fn outpoints(&self) -> &[OutPoint] {
        &self.outpoints
    }

    /// Take over the outpoints of `other`.
    pub fn merge(&mut self, mut other: Reservation) {
        self.outpoints.append(&mut other.outpoints);
        other.active = false;
    }

    /// The outpoints are now spent; stop holding them.
    pub fn consume(mut self) -> Vec<OutPoint> {
        self.release_all();
        self.active = false;
        std::mem::take(&mut self.outpoints)
    }

    fn release_all(&self) {
        let mut held = lock(&self.held);
        for o in &self.outpoints {
            held.remove(o);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.active {
            self.release_all();
        }
    }
}
