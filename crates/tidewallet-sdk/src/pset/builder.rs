//! Spend PSET construction: coin selection, size-based fee estimation and
//! the sponsored (fee paid in another asset) variant.

use std::str::FromStr;

use lwk_wollet::elements::pset::{Output, PartiallySignedTransaction};
use lwk_wollet::elements::{Address, AssetId, OutPoint};

use super::estimate::{estimate_vsize, fee_for_vsize};
use super::{address_output, data_output, fee_output, new_pset, wallet_input};
use crate::account::{Account, AccountId, AccountType, Chain};
use crate::chain::{ChainSource, FeeRate};
use crate::coin_selection::{select, ChangeOutput, CoinSelection, Reservation, Reservations, Target};
use crate::config::DEFAULT_FEE_MULTIPLIER;
use crate::error::{Error, Result};
use crate::network::Network;
use crate::store::{UnblindingData, Utxo, WalletRepository};
use crate::taxi::{FeeSponsor, Topup, TopupRequest};

/// Pay `value` of `asset` to a (normally confidential) address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecipient {
    pub address: String,
    pub asset: AssetId,
    pub value: u64,
}

/// Embed `data` in an `OP_RETURN` output, optionally burning `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRecipient {
    pub data: Vec<u8>,
    pub asset: AssetId,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendRequest {
    pub recipients: Vec<AddressRecipient>,
    pub data: Vec<DataRecipient>,
    pub fee_asset: AssetId,
    /// Accounts to spend from; the first one also receives change.
    pub accounts: Vec<AccountId>,
}

/// An unsigned, unblinded PSET and the outpoints held for it.
#[derive(Debug)]
pub struct BuiltPset {
    pub pset: PartiallySignedTransaction,
    /// What the wallet pays for the transaction, in `fee_asset` units.
    ///
    /// For a regular spend this is the value of the L-BTC fee output. For a
    /// sponsored spend it is the sponsor's charge in the requested asset;
    /// the fee output itself is funded by the sponsor and has a different
    /// value and asset.
    pub fee_amount: u64,
    pub fee_asset: AssetId,
    pub reservation: Reservation,
}

struct ResolvedRecipient {
    address: Address,
    asset: AssetId,
    value: u64,
}

pub struct PsetBuilder<'a> {
    store: &'a dyn WalletRepository,
    chain: &'a dyn ChainSource,
    reservations: &'a Reservations,
    network: Network,
    accounts: Vec<Account>,
    fee_multiplier: f64,
    sponsor: Option<&'a dyn FeeSponsor>,
}

impl<'a> PsetBuilder<'a> {
    /// `accounts` are the spend accounts; covenant accounts cannot fund a
    /// spend.
    pub fn new(
        store: &'a dyn WalletRepository,
        chain: &'a dyn ChainSource,
        reservations: &'a Reservations,
        network: Network,
        accounts: Vec<Account>,
    ) -> Result<Self> {
        if accounts.is_empty() {
            return Err(Error::UnknownAccount("no spend account given".into()));
        }
        if let Some(a) = accounts
            .iter()
            .find(|a| a.account_type() == AccountType::Covenant)
        {
            return Err(Error::UnsupportedAccountType(a.account_type()));
        }
        if let Some(a) = accounts.iter().find(|a| !a.is_valid_on(network)) {
            return Err(Error::UnknownAccount(format!(
                "{} is not available on {network}",
                a.id()
            )));
        }
        Ok(Self {
            store,
            chain,
            reservations,
            network,
            accounts,
            fee_multiplier: DEFAULT_FEE_MULTIPLIER,
            sponsor: None,
        })
    }

    pub fn with_fee_multiplier(mut self, multiplier: f64) -> Self {
        self.fee_multiplier = multiplier;
        self
    }

    pub fn with_sponsor(mut self, sponsor: &'a dyn FeeSponsor) -> Self {
        self.sponsor = Some(sponsor);
        self
    }

    fn change_account(&self) -> &Account {
        // `new` guarantees at least one account.
        &self.accounts[0]
    }

    fn account_ids(&self) -> Vec<AccountId> {
        self.accounts.iter().map(|a| a.id().to_string()).collect()
    }

    fn spendable_utxos(&self) -> Result<Vec<Utxo>> {
        Ok(self
            .store
            .get_utxos(self.network, &self.account_ids())?
            .into_iter()
            .filter(Utxo::is_spendable)
            .collect())
    }

    fn change_address(&self, _asset: AssetId) -> Result<Address> {
        Ok(self
            .change_account()
            .next_address(self.store, self.network, Chain::Internal, None)?
            .address)
    }

    /// The address the next change output would use, without issuing it.
    fn peek_change_address(&self) -> Result<Address> {
        let account = self.change_account();
        let next = self.store.get_next_key_indexes(account.id(), self.network)?;
        Ok(account
            .watch_identity(self.network)?
            .derive(Chain::Internal, next.internal, None)?
            .address)
    }

    fn resolve_recipients(&self, request: &SpendRequest) -> Result<Vec<ResolvedRecipient>> {
        request
            .recipients
            .iter()
            .map(|r| {
                let address = Address::from_str(&r.address)
                    .map_err(|e| Error::InvalidAddress(format!("{}: {e}", r.address)))?;
                if address.params != self.network.address_params() {
                    return Err(Error::InvalidAddress(format!(
                        "{} is not a {} address",
                        r.address, self.network
                    )));
                }
                if r.value == 0 {
                    return Err(Error::Pset(format!("zero amount for {}", r.address)));
                }
                Ok(ResolvedRecipient {
                    address,
                    asset: r.asset,
                    value: r.value,
                })
            })
            .collect()
    }

    fn targets(recipients: &[ResolvedRecipient], data: &[DataRecipient]) -> Vec<Target> {
        recipients
            .iter()
            .map(|r| Target {
                asset: r.asset,
                amount: r.value,
            })
            .chain(data.iter().map(|d| Target {
                asset: d.asset,
                amount: d.value,
            }))
            .collect()
    }

    fn fee_rate(&self) -> Result<FeeRate> {
        Ok(self.chain.get_relay_fee()?.scaled(self.fee_multiplier))
    }

    fn add_inputs(&self, pset: &mut PartiallySignedTransaction, utxos: &[Utxo]) -> Result<()> {
        for utxo in utxos {
            let details = self
                .store
                .get_script_details(self.network, &utxo.prevout.script_pubkey)?;
            let fingerprint = self
                .accounts
                .iter()
                .find(|a| a.id() == utxo.account_id)
                .map(|a| a.details().master_fingerprint)
                .ok_or_else(|| Error::UnknownAccount(utxo.account_id.clone()))?;
            let key_origin = details.map(|d| {
                (
                    lwk_wollet::elements::bitcoin::PublicKey::new(d.public_key.inner),
                    fingerprint,
                    d.derivation_path,
                )
            });
            pset.add_input(wallet_input(utxo, key_origin));
        }
        Ok(())
    }

    fn push_outputs(
        outputs: &mut Vec<Output>,
        recipients: &[ResolvedRecipient],
        data: &[DataRecipient],
        change: &[ChangeOutput<Address>],
        blinder_index: u32,
    ) {
        for r in recipients {
            outputs.push(address_output(&r.address, r.value, r.asset, blinder_index));
        }
        for d in data {
            outputs.push(data_output(&d.data, d.value, d.asset));
        }
        for c in change {
            outputs.push(address_output(&c.destination, c.amount, c.asset, blinder_index));
        }
    }

    /// Build the spend. A native fee asset is paid directly; any other fee
    /// asset goes through the configured sponsor.
    pub fn create_pset(&self, request: &SpendRequest) -> Result<BuiltPset> {
        let recipients = self.resolve_recipients(request)?;
        if recipients.is_empty() && request.data.is_empty() {
            return Err(Error::Pset("nothing to send".into()));
        }
        let targets = Self::targets(&recipients, &request.data);

        if request.fee_asset == self.network.policy_asset() {
            self.create_regular(&recipients, &request.data, &targets, request.fee_asset)
        } else {
            let sponsor = self
                .sponsor
                .ok_or_else(|| Error::Taxi("no fee sponsor configured".into()))?;
            self.create_sponsored(sponsor, &recipients, &request.data, &targets, request.fee_asset)
        }
    }

    fn create_regular(
        &self,
        recipients: &[ResolvedRecipient],
        data: &[DataRecipient],
        targets: &[Target],
        fee_asset: AssetId,
    ) -> Result<BuiltPset> {
        let (selection, mut reservation) = self.reservations.reserve(
            || self.spendable_utxos(),
            |available| select(available, targets, |a| self.change_address(a)),
        )?;

        let mut pset = new_pset();
        self.add_inputs(&mut pset, &selection.utxos)?;
        let mut outputs = Vec::new();
        Self::push_outputs(&mut outputs, recipients, data, &selection.change, 0);

        let rate = self.fee_rate()?;
        let vsize = estimate_vsize(pset.inputs(), &outputs, true)?;
        let mut fee = fee_for_vsize(vsize, rate);

        let covering_change = outputs.iter().position(|o| {
            o.asset == Some(fee_asset)
                && is_change(&selection, o)
                && o.amount.is_some_and(|a| a >= fee)
        });

        match covering_change {
            // Change spent entirely on the fee is dropped, not kept at zero.
            Some(i) if outputs[i].amount == Some(fee) => {
                outputs.remove(i);
            }
            Some(i) => {
                outputs[i].amount = outputs[i].amount.map(|a| a - fee);
            }
            None => {
                let (extra, extra_reservation) = self.reservations.reserve(
                    || self.spendable_utxos(),
                    |available| {
                        select(
                            available,
                            &[Target {
                                asset: fee_asset,
                                amount: fee,
                            }],
                            |a| self.change_address(a),
                        )
                    },
                )?;
                reservation.merge(extra_reservation);
                self.add_inputs(&mut pset, &extra.utxos)?;
                fee = settle_second_pass(&pset, &mut outputs, &extra.change, fee, rate, fee_asset)?;
            }
        }

        for output in outputs {
            pset.add_output(output);
        }
        pset.add_output(fee_output(fee, fee_asset));
        log::info!(
            "built PSET with {} inputs, {} outputs, fee {fee}",
            pset.n_inputs(),
            pset.n_outputs()
        );
        Ok(BuiltPset {
            pset,
            fee_amount: fee,
            fee_asset,
            reservation,
        })
    }

    fn create_sponsored(
        &self,
        sponsor: &dyn FeeSponsor,
        recipients: &[ResolvedRecipient],
        data: &[DataRecipient],
        targets: &[Target],
        fee_asset: AssetId,
    ) -> Result<BuiltPset> {
        let draft = self.draft_for_estimate(recipients, data, targets)?;
        let vsize = estimate_vsize(draft.inputs(), draft.outputs(), true)?;
        let relay = self.chain.get_relay_fee()?;
        let topup = sponsor.request_topup(&TopupRequest {
            asset: fee_asset,
            estimated_tx_size: vsize as u64,
            millisat_per_byte: relay.millisats_per_byte().ceil() as u64,
        })?;
        if topup.asset != fee_asset {
            return Err(Error::Taxi(format!(
                "sponsor quoted {} instead of {fee_asset}",
                topup.asset
            )));
        }
        log::info!(
            "topup {} charges {} of {fee_asset}",
            topup.topup_id,
            topup.asset_amount
        );

        let mut funded = targets.to_vec();
        funded.push(Target {
            asset: fee_asset,
            amount: topup.asset_amount,
        });
        let (selection, reservation) = self.reservations.reserve(
            || self.spendable_utxos(),
            |available| select(available, &funded, |a| self.change_address(a)),
        )?;

        let fee_amount = topup.asset_amount;
        let mut pset = self.merge_topup(topup)?;
        let first_ours = pset.n_inputs() as u32;
        self.add_inputs(&mut pset, &selection.utxos)?;
        let mut outputs = Vec::new();
        Self::push_outputs(&mut outputs, recipients, data, &selection.change, first_ours);
        for output in outputs {
            pset.add_output(output);
        }

        let fee_outputs = pset
            .outputs()
            .iter()
            .filter(|o| o.script_pubkey.is_empty())
            .count();
        if fee_outputs != 1 {
            return Err(Error::Taxi(format!(
                "sponsored PSET has {fee_outputs} fee outputs"
            )));
        }

        Ok(BuiltPset {
            pset,
            fee_amount,
            fee_asset,
            reservation,
        })
    }

    /// Selection and outputs as they would look, without reserving coins or
    /// issuing change addresses.
    fn draft_for_estimate(
        &self,
        recipients: &[ResolvedRecipient],
        data: &[DataRecipient],
        targets: &[Target],
    ) -> Result<PartiallySignedTransaction> {
        let available = self.reservations.unreserved(self.spendable_utxos()?);
        let peek = self.peek_change_address()?;
        let draft = select(&available, targets, |_| Ok(peek.clone()))?;
        let mut pset = new_pset();
        self.add_inputs(&mut pset, &draft.utxos)?;
        let mut outputs = Vec::new();
        Self::push_outputs(&mut outputs, recipients, data, &draft.change, 0);
        for output in outputs {
            pset.add_output(output);
        }
        Ok(pset)
    }

    /// Remember the secrets of the sponsor's inputs so the blinder can use
    /// them, and hand back the sponsor's partial as the base PSET.
    fn merge_topup(&self, topup: Topup) -> Result<PartiallySignedTransaction> {
        let inputs = topup.partial.inputs();
        if inputs.len() != topup.input_blinding_data.len() {
            return Err(Error::Taxi(format!(
                "{} sponsor inputs but {} blinding entries",
                inputs.len(),
                topup.input_blinding_data.len()
            )));
        }
        let data: Vec<(OutPoint, UnblindingData)> = inputs
            .iter()
            .zip(&topup.input_blinding_data)
            .map(|(i, d)| (OutPoint::new(i.previous_txid, i.previous_output_index), *d))
            .collect();
        self.store.update_outpoint_blinding_data(self.network, &data)?;
        Ok(topup.partial)
    }
}

/// Append the fee-only selection's change and reconcile the fee with the
/// grown transaction. Returns the final fee. `pset` already carries the
/// extra inputs.
fn settle_second_pass(
    pset: &PartiallySignedTransaction,
    outputs: &mut Vec<Output>,
    extra_change: &[ChangeOutput<Address>],
    fee: u64,
    rate: FeeRate,
    fee_asset: AssetId,
) -> Result<u64> {
    let before = outputs.len();
    for c in extra_change {
        outputs.push(address_output(&c.destination, c.amount, c.asset, 0));
    }

    let vsize = estimate_vsize(pset.inputs(), outputs, true)?;
    let new_fee = fee_for_vsize(vsize, rate);
    let diff = new_fee.saturating_sub(fee);
    if diff == 0 {
        return Ok(fee);
    }

    let Some(i) = (before..outputs.len()).find(|&i| outputs[i].asset == Some(fee_asset)) else {
        return Err(Error::InsufficientFunds {
            asset: fee_asset,
            requested: new_fee,
            available: fee,
        });
    };

    let change_amount = outputs[i].amount.unwrap_or(0);
    if change_amount > diff {
        outputs[i].amount = Some(change_amount - diff);
        return Ok(new_fee);
    }

    // The change cannot absorb the difference: fold it into the fee.
    outputs.remove(i);
    let vsize = estimate_vsize(pset.inputs(), outputs, true)?;
    let folded = fee + change_amount;
    let required = fee_for_vsize(vsize, rate);
    if folded < required {
        return Err(Error::InsufficientFunds {
            asset: fee_asset,
            requested: required,
            available: folded,
        });
    }
    Ok(folded)
}

fn is_change(selection: &CoinSelection<Address>, output: &Output) -> bool {
    selection
        .change
        .iter()
        .any(|c| c.destination.script_pubkey() == output.script_pubkey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{funded_wallet, funded_wallet_with, test_asset, MockFeeSponsor};

    fn recipient(network: Network, value: u64) -> AddressRecipient {
        AddressRecipient {
            address: crate::testing::foreign_address(network).to_string(),
            asset: network.policy_asset(),
            value,
        }
    }

    #[test]
    fn regular_spend_has_one_fee_output() {
        let w = funded_wallet(&[50_000, 30_000]);
        let builder = w.builder();
        let request = SpendRequest {
            recipients: vec![recipient(w.network, 60_000)],
            data: vec![],
            fee_asset: w.network.policy_asset(),
            accounts: vec![],
        };
        let built = builder.create_pset(&request).unwrap();
        let fees: Vec<_> = built
            .pset
            .outputs()
            .iter()
            .filter(|o| o.script_pubkey.is_empty())
            .collect();
        assert_eq!(fees.len(), 1);
        assert_eq!(fees[0].amount, Some(built.fee_amount));
        assert_eq!(built.fee_asset, w.network.policy_asset());
        assert!(built.fee_amount > 0);

        let spent: u64 = 80_000;
        let out: u64 = built.pset.outputs().iter().filter_map(|o| o.amount).sum();
        assert_eq!(spent, out);
        assert_eq!(built.reservation.outpoints().len(), 2);
    }

    #[test]
    fn exact_amount_triggers_second_pass() {
        let w = funded_wallet(&[10_000, 5_000]);
        let builder = w.builder();
        let request = SpendRequest {
            recipients: vec![recipient(w.network, 10_000)],
            data: vec![],
            fee_asset: w.network.policy_asset(),
            accounts: vec![],
        };
        let built = builder.create_pset(&request).unwrap();
        assert_eq!(built.pset.n_inputs(), 2);
        let out: u64 = built.pset.outputs().iter().filter_map(|o| o.amount).sum();
        assert_eq!(out, 15_000);
    }

    #[test]
    fn change_equal_to_fee_is_folded() {
        let quote = funded_wallet(&[10_000]);
        let request = |value| SpendRequest {
            recipients: vec![recipient(quote.network, value)],
            data: vec![],
            fee_asset: quote.network.policy_asset(),
            accounts: vec![],
        };
        let fee = quote.builder().create_pset(&request(5_000)).unwrap().fee_amount;

        let w = funded_wallet(&[10_000]);
        let built = w.builder().create_pset(&request(10_000 - fee)).unwrap();
        assert_eq!(built.fee_amount, fee);
        assert_eq!(built.pset.n_inputs(), 1);
        // recipient + fee, the emptied change is gone
        assert_eq!(built.pset.n_outputs(), 2);
        assert!(built.pset.outputs().iter().all(|o| o.amount != Some(0)));
    }

    #[test]
    fn concurrent_builds_do_not_share_coins() {
        let w = funded_wallet(&[20_000, 20_000]);
        let request = SpendRequest {
            recipients: vec![recipient(w.network, 5_000)],
            data: vec![],
            fee_asset: w.network.policy_asset(),
            accounts: vec![],
        };
        let first = w.builder().create_pset(&request).unwrap();
        let second = w.builder().create_pset(&request).unwrap();
        for o in first.reservation.outpoints() {
            assert!(!second.reservation.outpoints().contains(o));
        }
        assert!(w.builder().create_pset(&request).is_err());
        drop(first);
        assert!(w.builder().create_pset(&request).is_ok());
    }

    #[test]
    fn insufficient_funds_reports_asset() {
        let w = funded_wallet(&[1_000]);
        let request = SpendRequest {
            recipients: vec![recipient(w.network, 2_000)],
            data: vec![],
            fee_asset: w.network.policy_asset(),
            accounts: vec![],
        };
        let err = w.builder().create_pset(&request).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientFunds { requested: 2_000, available: 1_000, .. }
        ));
        assert!(w.reservations.is_empty());
    }

    #[test]
    fn wrong_network_address_is_rejected() {
        let w = funded_wallet(&[10_000]);
        let request = SpendRequest {
            recipients: vec![AddressRecipient {
                address: crate::testing::foreign_address(Network::Liquid).to_string(),
                asset: w.network.policy_asset(),
                value: 1_000,
            }],
            data: vec![],
            fee_asset: w.network.policy_asset(),
            accounts: vec![],
        };
        assert!(matches!(
            w.builder().create_pset(&request),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn data_outputs_are_embedded() {
        let w = funded_wallet(&[10_000]);
        let request = SpendRequest {
            recipients: vec![],
            data: vec![DataRecipient {
                data: b"tide".to_vec(),
                asset: w.network.policy_asset(),
                value: 0,
            }],
            fee_asset: w.network.policy_asset(),
            accounts: vec![],
        };
        let built = w.builder().create_pset(&request).unwrap();
        assert!(built
            .pset
            .outputs()
            .iter()
            .any(|o| o.script_pubkey.is_op_return()));
    }

    #[test]
    fn sponsored_spend_uses_partial_fee_output() {
        let network = Network::LiquidRegtest;
        let usdt = test_asset();
        let w = funded_wallet_with(&[(network.policy_asset(), 10_000), (usdt, 5_000)]);
        let sponsor = MockFeeSponsor::new(network, usdt, 700);
        let request = SpendRequest {
            recipients: vec![recipient(network, 2_000)],
            data: vec![],
            fee_asset: usdt,
            accounts: vec![],
        };
        let built = w.builder().with_sponsor(&sponsor).create_pset(&request).unwrap();
        assert_eq!(built.fee_amount, 700);
        assert_eq!(built.fee_asset, usdt);
        let fee_outputs: Vec<_> = built
            .pset
            .outputs()
            .iter()
            .filter(|o| o.script_pubkey.is_empty())
            .collect();
        assert_eq!(fee_outputs.len(), 1);
        assert_eq!(fee_outputs[0].asset, Some(network.policy_asset()));

        // Our change and recipients are blinded by our first input.
        let ours = sponsor.partial_inputs() as u32;
        let own_outputs = &built.pset.outputs()[sponsor.partial_outputs()..];
        assert!(own_outputs.iter().all(|o| o.blinder_index == Some(ours)));

        let sponsor_input = &built.pset.inputs()[0];
        let outpoint = OutPoint::new(sponsor_input.previous_txid, sponsor_input.previous_output_index);
        assert!(w
            .store
            .get_outpoint_blinding_data(network, &outpoint)
            .unwrap()
            .is_some());
        assert_eq!(sponsor.requests().len(), 1);
        assert!(sponsor.requests()[0].estimated_tx_size > 0);
    }

    #[test]
    fn sponsored_spend_needs_a_sponsor() {
        let network = Network::LiquidRegtest;
        let w = funded_wallet_with(&[(network.policy_asset(), 10_000), (test_asset(), 5_000)]);
        let request = SpendRequest {
            recipients: vec![recipient(network, 2_000)],
            data: vec![],
            fee_asset: test_asset(),
            accounts: vec![],
        };
        assert!(matches!(w.builder().create_pset(&request), Err(Error::Taxi(_))));
    }
}
