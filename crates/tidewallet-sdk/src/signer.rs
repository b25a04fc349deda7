//! Signing, signature validation and finalization of blinded PSETs.

use lwk_wollet::bitcoin::secp256k1::{ecdsa, Message, Secp256k1};
use lwk_wollet::elements::encode::serialize;
use lwk_wollet::elements::hashes::{hash160, Hash};
use lwk_wollet::elements::opcodes::all::{OP_CHECKSIG, OP_DUP, OP_EQUALVERIFY, OP_HASH160};
use lwk_wollet::elements::pset::{Input, PartiallySignedTransaction};
use lwk_wollet::elements::script::Builder;
use lwk_wollet::elements::secp256k1_zkp::{self, XOnlyPublicKey};
use lwk_wollet::elements::sighash::{Prevouts, SighashCache};
use lwk_wollet::elements::{BlockHash, EcdsaSighashType, Script, Transaction, TxOut};
use lwk_wollet::elements_miniscript::psbt::PsbtExt;

use crate::account::SigningIdentity;
use crate::error::{Error, Result};
use crate::pset::estimate::ScriptKind;

/// Outcome of checking one input.
type Check = std::result::Result<(), String>;

fn p2pkh_script_code(pk: &lwk_wollet::bitcoin::PublicKey) -> Script {
    let hash = hash160::Hash::hash(&pk.to_bytes());
    Builder::new()
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(hash.as_byte_array())
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

fn validate_ecdsa(tx: &Transaction, index: usize, input: &Input) -> Check {
    if input.partial_sigs.is_empty() {
        return Err("no ECDSA signature".into());
    }
    let prevout = input
        .witness_utxo
        .as_ref()
        .ok_or("no witness utxo")?;
    let expected_type = input
        .sighash_type
        .and_then(|t| t.ecdsa_hash_ty())
        .unwrap_or(EcdsaSighashType::All);
    let secp = Secp256k1::verification_only();
    let mut cache = SighashCache::new(tx);

    for (pk, sig) in &input.partial_sigs {
        let (hash_byte, der) = sig.split_last().ok_or("empty signature")?;
        if *hash_byte as u32 != expected_type.as_u32() {
            return Err(format!("unexpected sighash byte {hash_byte:#x}"));
        }
        let sighash = match ScriptKind::of(&prevout.script_pubkey) {
            ScriptKind::P2pkh => {
                cache.legacy_sighash(index, &prevout.script_pubkey, expected_type)
            }
            _ => cache.segwitv0_sighash(
                index,
                &p2pkh_script_code(pk),
                prevout.value,
                expected_type,
            ),
        };
        let msg = Message::from_digest_slice(&sighash[..]).map_err(|e| e.to_string())?;
        let sig = ecdsa::Signature::from_der(der).map_err(|e| e.to_string())?;
        secp.verify_ecdsa(&msg, &sig, &pk.inner)
            .map_err(|e| format!("bad signature for {pk}: {e}"))?;
    }
    Ok(())
}

fn validate_schnorr(
    tx: &Transaction,
    index: usize,
    input: &Input,
    prevouts: &[TxOut],
    genesis_hash: BlockHash,
) -> Check {
    let sig = input.tap_key_sig.as_ref().ok_or("no taproot key signature")?;
    let prevout = prevouts.get(index).ok_or("no witness utxo")?;
    let script = prevout.script_pubkey.as_bytes();
    if ScriptKind::of(&prevout.script_pubkey) != ScriptKind::P2tr {
        return Err("prevout is not taproot".into());
    }
    let output_key = XOnlyPublicKey::from_slice(&script[2..34]).map_err(|e| e.to_string())?;
    let sighash = SighashCache::new(tx)
        .taproot_key_spend_signature_hash(index, &Prevouts::All(prevouts), sig.hash_ty, genesis_hash)
        .map_err(|e| e.to_string())?;
    let msg = secp256k1_zkp::Message::from_digest_slice(&sighash[..]).map_err(|e| e.to_string())?;
    secp256k1_zkp::Secp256k1::verification_only()
        .verify_schnorr(&sig.sig, &msg, &output_key)
        .map_err(|e| e.to_string())
}

/// Check the inputs at `indices`: each passes when either its ECDSA
/// signatures or its taproot key-path signature verify.
pub fn validate_inputs(
    pset: &PartiallySignedTransaction,
    genesis_hash: BlockHash,
    indices: &[usize],
) -> Result<()> {
    let tx = pset
        .extract_tx()
        .map_err(|e| Error::SignatureValidationFailed(e.to_string()))?;
    let prevouts: Vec<TxOut> = pset
        .inputs()
        .iter()
        .map(|i| i.witness_utxo.clone().unwrap_or_default())
        .collect();

    for &index in indices {
        let input = pset.inputs().get(index).ok_or_else(|| {
            Error::SignatureValidationFailed(format!("no input {index}"))
        })?;
        let ecdsa = validate_ecdsa(&tx, index, input);
        if ecdsa.is_ok() {
            continue;
        }
        let schnorr = validate_schnorr(&tx, index, input, &prevouts, genesis_hash);
        if let (Err(a), Err(b)) = (ecdsa, schnorr) {
            return Err(Error::SignatureValidationFailed(format!(
                "input {index}: {a}; {b}"
            )));
        }
    }
    Ok(())
}

pub fn validate_all_inputs(pset: &PartiallySignedTransaction, genesis_hash: BlockHash) -> Result<()> {
    let all: Vec<usize> = (0..pset.n_inputs()).collect();
    validate_inputs(pset, genesis_hash, &all)
}

/// Let each identity sign in turn, stopping as soon as every input
/// validates.
pub fn sign(
    pset: &mut PartiallySignedTransaction,
    identities: &[SigningIdentity],
    genesis_hash: BlockHash,
) -> Result<()> {
    let all: Vec<usize> = (0..pset.n_inputs()).collect();
    sign_inputs(pset, identities, genesis_hash, &all)
}

/// Like [`sign`], but only the inputs at `indices` have to validate. Used
/// when other parties sign their own inputs, as a fee sponsor does.
pub fn sign_inputs(
    pset: &mut PartiallySignedTransaction,
    identities: &[SigningIdentity],
    genesis_hash: BlockHash,
    indices: &[usize],
) -> Result<()> {
    for identity in identities {
        let added = identity.sign(pset)?;
        log::debug!("{} added {added} signatures", identity.watch().account_id);
        if validate_inputs(pset, genesis_hash, indices).is_ok() {
            return Ok(());
        }
    }
    validate_inputs(pset, genesis_hash, indices)
}

/// Finalize every input not finalized yet and return the raw transaction
/// hex. Inputs that arrive with a final witness are taken as they are.
pub fn finalize_and_extract(
    pset: &mut PartiallySignedTransaction,
    genesis_hash: BlockHash,
) -> Result<String> {
    let secp = secp256k1_zkp::Secp256k1::verification_only();
    let pending: Vec<usize> = (0..pset.n_inputs())
        .filter(|&i| !is_finalized(&pset.inputs()[i]))
        .collect();
    for index in pending {
        pset.finalize_inp_mut(&secp, index, genesis_hash)
            .map_err(|e| Error::Finalize(format!("input {index}: {e}")))?;
    }
    let tx = pset
        .extract_tx()
        .map_err(|e| Error::Finalize(e.to_string()))?;
    Ok(hex::encode(serialize(&tx)))
}

/// Whether `input` already carries its final script witness or script sig.
pub fn is_finalized(input: &Input) -> bool {
    input.final_script_witness.as_ref().is_some_and(|w| !w.is_empty())
        || input.final_script_sig.as_ref().is_some_and(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blinder::blind;
    use crate::pset::{AddressRecipient, SpendRequest};
    use crate::testing::{
        foreign_address, funded_wallet, funded_wallet_with, test_asset, MockFeeSponsor,
        TEST_PASSWORD,
    };
    use lwk_wollet::elements::encode::deserialize;

    fn blinded(w: &crate::testing::FundedWallet) -> PartiallySignedTransaction {
        let request = SpendRequest {
            recipients: vec![AddressRecipient {
                address: foreign_address(w.network).to_string(),
                asset: w.network.policy_asset(),
                value: 7_000,
            }],
            data: vec![],
            fee_asset: w.network.policy_asset(),
            accounts: vec![],
        };
        let mut built = w.builder().create_pset(&request).unwrap();
        blind(&mut built.pset, &w.store, w.network).unwrap();
        built.pset
    }

    #[test]
    fn unsigned_pset_fails_validation() {
        let w = funded_wallet(&[10_000]);
        let pset = blinded(&w);
        assert!(matches!(
            validate_all_inputs(&pset, w.network.genesis_hash()),
            Err(Error::SignatureValidationFailed(_))
        ));
    }

    #[test]
    fn sign_finalize_extract() {
        let w = funded_wallet(&[6_000, 5_000]);
        let mut pset = blinded(&w);
        let identity = w.account.signing_identity(w.network, TEST_PASSWORD).unwrap();
        sign(&mut pset, &[identity], w.network.genesis_hash()).unwrap();

        let hex_tx = finalize_and_extract(&mut pset, w.network.genesis_hash()).unwrap();
        let tx: Transaction = deserialize(&hex::decode(hex_tx).unwrap()).unwrap();
        assert_eq!(tx.input.len(), 2);
        // recipient + change + fee
        assert_eq!(tx.output.len(), 3);
        assert!(tx.input.iter().all(|i| !i.witness.script_witness.is_empty()));
    }

    #[test]
    fn wrong_password_never_signs() {
        let w = funded_wallet(&[10_000]);
        assert!(matches!(
            w.account.signing_identity(w.network, "wrong"),
            Err(Error::InvalidPassword)
        ));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let w = funded_wallet(&[10_000]);
        let mut pset = blinded(&w);
        let identity = w.account.signing_identity(w.network, TEST_PASSWORD).unwrap();
        sign(&mut pset, &[identity], w.network.genesis_hash()).unwrap();
        for sig in pset.inputs_mut()[0].partial_sigs.values_mut() {
            let n = sig.len();
            sig[n / 2] ^= 0x01;
        }
        assert!(validate_all_inputs(&pset, w.network.genesis_hash()).is_err());
    }

    #[test]
    fn inputs_signed_elsewhere_are_left_alone() {
        let network = crate::network::Network::LiquidRegtest;
        let usdt = test_asset();
        let w = funded_wallet_with(&[(usdt, 5_000)]);
        let sponsor = MockFeeSponsor::new(network, usdt, 700);
        let request = SpendRequest {
            recipients: vec![AddressRecipient {
                address: foreign_address(network).to_string(),
                asset: usdt,
                value: 2_000,
            }],
            data: vec![],
            fee_asset: usdt,
            accounts: vec![],
        };
        let mut pset = w.builder().with_sponsor(&sponsor).create_pset(&request).unwrap().pset;
        blind(&mut pset, &w.store, network).unwrap();
        let sponsor_witness = pset.inputs()[0].final_script_witness.clone().unwrap();

        let ours: Vec<usize> = (sponsor.partial_inputs()..pset.n_inputs()).collect();
        let identity = w.account.signing_identity(network, TEST_PASSWORD).unwrap();
        sign_inputs(&mut pset, &[identity], network.genesis_hash(), &ours).unwrap();
        assert!(validate_all_inputs(&pset, network.genesis_hash()).is_err());

        let hex_tx = finalize_and_extract(&mut pset, network.genesis_hash()).unwrap();
        let tx: Transaction = deserialize(&hex::decode(hex_tx).unwrap()).unwrap();
        assert_eq!(tx.input[0].witness.script_witness, sponsor_witness);
        assert!(tx.input[1..].iter().all(|i| !i.witness.script_witness.is_empty()));
    }

    #[test]
    fn unsigned_foreign_input_cannot_be_finalized() {
        let network = crate::network::Network::LiquidRegtest;
        let usdt = test_asset();
        let w = funded_wallet_with(&[(usdt, 5_000)]);
        let sponsor = MockFeeSponsor::new(network, usdt, 700).unsigned();
        let request = SpendRequest {
            recipients: vec![AddressRecipient {
                address: foreign_address(network).to_string(),
                asset: usdt,
                value: 2_000,
            }],
            data: vec![],
            fee_asset: usdt,
            accounts: vec![],
        };
        let mut pset = w.builder().with_sponsor(&sponsor).create_pset(&request).unwrap().pset;
        blind(&mut pset, &w.store, network).unwrap();
        assert!(!is_finalized(&pset.inputs()[0]));
        assert!(matches!(
            validate_inputs(&pset, network.genesis_hash(), &[0]),
            Err(Error::SignatureValidationFailed(_))
        ));
        assert!(matches!(
            finalize_and_extract(&mut pset, network.genesis_hash()),
            Err(Error::Finalize(_))
        ));
    }
}
