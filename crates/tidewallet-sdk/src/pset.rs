pub mod builder;
pub mod estimate;

use std::str::FromStr;

use lwk_wollet::bitcoin::bip32::{DerivationPath, Fingerprint};
use lwk_wollet::elements::opcodes;
use lwk_wollet::elements::pset::{Input, Output, PartiallySignedTransaction, PsbtSighashType};
use lwk_wollet::elements::script::Builder;
use lwk_wollet::elements::{Address, AssetId, Script, Sequence};

use crate::error::{Error, Result};
use crate::store::Utxo;

pub use builder::{AddressRecipient, BuiltPset, DataRecipient, PsetBuilder, SpendRequest};

/// SIGHASH_ALL
const SIGHASH_ALL: u32 = 0x01;

/// Create a new empty PSET v2.
pub(crate) fn new_pset() -> PartiallySignedTransaction {
    PartiallySignedTransaction::new_v2()
}

/// PSET input spending a wallet UTXO, with the key origin the signer needs.
pub(crate) fn wallet_input(
    utxo: &Utxo,
    key_origin: Option<(lwk_wollet::elements::bitcoin::PublicKey, Fingerprint, DerivationPath)>,
) -> Input {
    let mut input = Input {
        previous_txid: utxo.outpoint.txid,
        previous_output_index: utxo.outpoint.vout,
        witness_utxo: Some(utxo.prevout.clone()),
        sequence: Some(Sequence::ENABLE_LOCKTIME_NO_RBF),
        sighash_type: Some(PsbtSighashType::from_u32(SIGHASH_ALL)),
        ..Default::default()
    };
    if let Some((pk, fingerprint, path)) = key_origin {
        input.bip32_derivation.insert(pk, (fingerprint, path));
    }
    input
}

/// Output paying `address`. Confidential addresses get their blinding key
/// and `blinder_index` set so the blinder can find the owning input.
pub(crate) fn address_output(
    address: &Address,
    amount: u64,
    asset: AssetId,
    blinder_index: u32,
) -> Output {
    let blinding_key = address
        .blinding_pubkey
        .map(|inner| lwk_wollet::elements::bitcoin::PublicKey {
            inner,
            compressed: true,
        });
    let mut output = Output::new_explicit(address.script_pubkey(), amount, asset, blinding_key);
    if output.blinding_key.is_some() {
        output.blinder_index = Some(blinder_index);
    }
    output
}

/// `OP_RETURN <data>` output.
pub(crate) fn data_output(data: &[u8], amount: u64, asset: AssetId) -> Output {
    let script = Builder::new()
        .push_opcode(opcodes::all::OP_RETURN)
        .push_slice(data)
        .into_script();
    Output::new_explicit(script, amount, asset, None)
}

/// Explicit fee output (empty script).
pub(crate) fn fee_output(amount: u64, asset: AssetId) -> Output {
    Output::new_explicit(Script::new(), amount, asset, None)
}

pub fn pset_from_base64(s: &str) -> Result<PartiallySignedTransaction> {
    PartiallySignedTransaction::from_str(s).map_err(|e| Error::Pset(format!("bad PSET: {e}")))
}

pub fn pset_to_base64(pset: &PartiallySignedTransaction) -> String {
    pset.to_string()
}
