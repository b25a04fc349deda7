//! Virtual-size estimation for unsigned, unblinded Liquid PSETs.
//!
//! Confidential outputs are priced with their range and surjection proofs
//! included; wallet inputs with a typical single-key witness.

use lwk_wollet::elements::pset::{Input, Output};
use lwk_wollet::elements::Script;

use crate::chain::FeeRate;
use crate::error::{Error, Result};

/// Explicit output: asset(33) + value(9) + nonce(1).
const EXPLICIT_OUTPUT_SIZE: usize = 33 + 9 + 1;
/// Confidential output: asset(33) + value(33) + nonce(33).
const CONFIDENTIAL_OUTPUT_SIZE: usize = 33 + 33 + 33;
/// Fee output: explicit output plus its empty script.
const FEE_OUTPUT_SIZE: usize = 44;
/// Empty range and surjection proof lengths.
const EXPLICIT_OUTPUT_WITNESS: usize = 1 + 1;
/// Surjection proof + range proof, each with a varint length prefix.
const CONFIDENTIAL_OUTPUT_WITNESS: usize = 3 + 4174 + 1 + 131;
/// Signature (72) + pubkey (33) pushes with their lengths, plus item count.
const SINGLE_KEY_WITNESS: usize = 3 + (1 + 107);
/// Fixed per-input bytes besides the script sig: outpoint(36) + sequence(4).
const INPUT_BASE_SIZE: usize = 40;
/// Version(4) + locktime(4) + flag(1).
const TX_BASE_SIZE: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    P2pkh,
    P2sh,
    P2wpkh,
    P2wsh,
    P2tr,
    Other,
}

impl ScriptKind {
    pub fn of(script: &Script) -> Self {
        let b = script.as_bytes();
        match b {
            [0x76, 0xa9, 0x14, .., 0x88, 0xac] if b.len() == 25 => ScriptKind::P2pkh,
            [0xa9, 0x14, .., 0x87] if b.len() == 23 => ScriptKind::P2sh,
            [0x00, 0x14, ..] if b.len() == 22 => ScriptKind::P2wpkh,
            [0x00, 0x20, ..] if b.len() == 34 => ScriptKind::P2wsh,
            [0x51, 0x20, ..] if b.len() == 34 => ScriptKind::P2tr,
            _ => ScriptKind::Other,
        }
    }

    fn script_sig_size(self) -> usize {
        match self {
            ScriptKind::P2pkh => 108,
            ScriptKind::P2sh | ScriptKind::P2wsh => 35,
            ScriptKind::P2wpkh | ScriptKind::P2tr => 1,
            ScriptKind::Other => 0,
        }
    }
}

pub(crate) fn varint_len(n: usize) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffff_ffff => 5,
        _ => 9,
    }
}

fn var_slice_size(len: usize) -> usize {
    varint_len(len) + len
}

fn input_witness_size(input: &Input) -> usize {
    match (&input.witness_script, &input.redeem_script) {
        (Some(script), _) | (None, Some(script)) => {
            let bytes = script.as_bytes();
            let m = match bytes.first() {
                Some(op @ 0x51..=0x60) => (*op - 0x50) as usize,
                _ => 1,
            };
            var_slice_size(bytes.len()) + m * 75 + m - 1
        }
        (None, None) => SINGLE_KEY_WITNESS,
    }
}

/// Estimated virtual size. With `with_fee_output` an explicit fee output
/// is priced in as well.
pub fn estimate_vsize(inputs: &[Input], outputs: &[Output], with_fee_output: bool) -> Result<usize> {
    let mut base = TX_BASE_SIZE + varint_len(inputs.len());
    let mut witness = 0usize;

    for (i, input) in inputs.iter().enumerate() {
        let prevout = input
            .witness_utxo
            .as_ref()
            .ok_or_else(|| Error::Pset(format!("input {i} has no witness utxo")))?;
        base += ScriptKind::of(&prevout.script_pubkey).script_sig_size() + INPUT_BASE_SIZE;
        witness += input_witness_size(input);
    }

    let mut out_sizes = Vec::with_capacity(outputs.len() + 1);
    for output in outputs {
        let script_len = var_slice_size(output.script_pubkey.len());
        if output.blinding_key.is_some() {
            out_sizes.push(CONFIDENTIAL_OUTPUT_SIZE + script_len);
            witness += CONFIDENTIAL_OUTPUT_WITNESS;
        } else {
            out_sizes.push(EXPLICIT_OUTPUT_SIZE + script_len);
            witness += EXPLICIT_OUTPUT_WITNESS;
        }
    }
    if with_fee_output {
        out_sizes.push(FEE_OUTPUT_SIZE);
        witness += EXPLICIT_OUTPUT_WITNESS;
    }

    base += varint_len(out_sizes.len() + 1) + out_sizes.iter().sum::<usize>();
    // Issuance/peg-in witness flags and the fee output proof lengths.
    witness += 1 + 1;

    let weight = base * 3 + base + witness;
    Ok(weight.div_ceil(4))
}

/// Fee in satoshis for `vsize` at `rate`, rounded up.
pub fn fee_for_vsize(vsize: usize, rate: FeeRate) -> u64 {
    (vsize as f64 * rate.sats_per_vbyte()).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use lwk_wollet::elements::hashes::Hash;
    use lwk_wollet::elements::{confidential, AssetId, TxOut, Txid};

    fn input_with(script: Vec<u8>) -> Input {
        Input {
            previous_txid: Txid::all_zeros(),
            previous_output_index: 0,
            witness_utxo: Some(TxOut {
                asset: confidential::Asset::Explicit(AssetId::from_slice(&[0u8; 32]).unwrap()),
                value: confidential::Value::Explicit(1),
                nonce: confidential::Nonce::Null,
                script_pubkey: Script::from(script),
                witness: Default::default(),
            }),
            ..Default::default()
        }
    }

    fn p2wpkh() -> Vec<u8> {
        let mut s = vec![0x00, 0x14];
        s.extend([0u8; 20]);
        s
    }

    fn p2pkh() -> Vec<u8> {
        let mut s = vec![0x76, 0xa9, 0x14];
        s.extend([0u8; 20]);
        s.extend([0x88, 0xac]);
        s
    }

    fn confidential_output() -> Output {
        let pk = lwk_wollet::elements::bitcoin::PublicKey::from_slice(&[
            0x02, 0x79, 0xbe, 0x66, 0x7e, 0xf9, 0xdc, 0xbb, 0xac, 0x55, 0xa0, 0x62, 0x95, 0xce,
            0x87, 0x0b, 0x07, 0x02, 0x9b, 0xfc, 0xdb, 0x2d, 0xce, 0x28, 0xd9, 0x59, 0xf2, 0x81,
            0x5b, 0x16, 0xf8, 0x17, 0x98,
        ])
        .unwrap();
        Output::new_explicit(Script::from(p2wpkh()), 1, AssetId::from_slice(&[0u8; 32]).unwrap(), Some(pk))
    }

    #[test]
    fn classifies_scripts() {
        assert_eq!(ScriptKind::of(&Script::from(p2wpkh())), ScriptKind::P2wpkh);
        assert_eq!(ScriptKind::of(&Script::from(p2pkh())), ScriptKind::P2pkh);
        let mut tr = vec![0x51, 0x20];
        tr.extend([1u8; 32]);
        assert_eq!(ScriptKind::of(&Script::from(tr)), ScriptKind::P2tr);
        assert_eq!(ScriptKind::of(&Script::new()), ScriptKind::Other);
    }

    #[test]
    fn one_in_one_confidential_out_with_fee() {
        let vsize = estimate_vsize(&[input_with(p2wpkh())], &[confidential_output()], true).unwrap();
        // base = 9 + 1 + (1 + 40) + 1 + (99 + 23) + 44 = 218
        // witness = 111 + 4309 + 2 + 2 = 4424
        // weight = 4 * 218 + 4424 = 5296
        assert_eq!(vsize, 1324);
    }

    #[test]
    fn legacy_inputs_cost_more() {
        let segwit = estimate_vsize(&[input_with(p2wpkh())], &[], true).unwrap();
        let legacy = estimate_vsize(&[input_with(p2pkh())], &[], true).unwrap();
        assert!(legacy > segwit);
    }

    #[test]
    fn fee_output_adds_size() {
        let with = estimate_vsize(&[input_with(p2wpkh())], &[], true).unwrap();
        let without = estimate_vsize(&[input_with(p2wpkh())], &[], false).unwrap();
        assert!(with > without);
    }

    #[test]
    fn missing_witness_utxo_is_an_error() {
        let input = Input::default();
        assert!(matches!(estimate_vsize(&[input], &[], true), Err(Error::Pset(_))));
    }

    #[test]
    fn fee_rounds_up() {
        let rate = FeeRate::from_btc_per_kvb(0.000001).scaled(1.5);
        assert_eq!(fee_for_vsize(1324, rate), 199);
        assert_eq!(fee_for_vsize(0, rate), 0);
    }
}
