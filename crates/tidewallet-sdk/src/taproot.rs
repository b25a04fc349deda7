use lwk_wollet::elements::hashes::{Hash, HashEngine, sha256};
use lwk_wollet::elements::secp256k1_zkp::{Parity, Scalar, Secp256k1, XOnlyPublicKey};
use lwk_wollet::elements::Script;

use crate::error::{Error, Result};

/// Tapscript leaf version on Elements/Liquid.
pub const TAPSCRIPT_LEAF_VERSION: u8 = 0xc4;

/// Compute a SHA256 tagged hash: SHA256(SHA256(tag) || SHA256(tag) || data).
pub(crate) fn tagged_hash(tag: &[u8], data: &[u8]) -> [u8; 32] {
    let tag_hash = sha256::Hash::hash(tag);
    let mut engine = sha256::Hash::engine();
    engine.input(tag_hash.as_ref());
    engine.input(tag_hash.as_ref());
    engine.input(data);
    sha256::Hash::from_engine(engine).to_byte_array()
}

pub(crate) fn compact_size(len: usize) -> Vec<u8> {
    match len {
        0..=0xfc => vec![len as u8],
        0xfd..=0xffff => {
            let mut v = vec![0xfd];
            v.extend_from_slice(&(len as u16).to_le_bytes());
            v
        }
        0x10000..=0xffff_ffff => {
            let mut v = vec![0xfe];
            v.extend_from_slice(&(len as u32).to_le_bytes());
            v
        }
        _ => {
            let mut v = vec![0xff];
            v.extend_from_slice(&(len as u64).to_le_bytes());
            v
        }
    }
}

/// Format: `TaggedHash("TapLeaf/elements", leaf_version || compact_size(len) || script)`
pub fn tapleaf_hash(script: &Script) -> [u8; 32] {
    let bytes = script.as_bytes();
    let mut leaf_data = Vec::with_capacity(1 + 9 + bytes.len());
    leaf_data.push(TAPSCRIPT_LEAF_VERSION);
    leaf_data.extend_from_slice(&compact_size(bytes.len()));
    leaf_data.extend_from_slice(bytes);
    tagged_hash(b"TapLeaf/elements", &leaf_data)
}

/// Compute the tapbranch hash from two children (sorted lexicographically).
pub fn tapbranch_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let (a, b) = if left <= right {
        (left, right)
    } else {
        (right, left)
    };
    let mut data = Vec::with_capacity(64);
    data.extend_from_slice(a);
    data.extend_from_slice(b);
    tagged_hash(b"TapBranch/elements", &data)
}

/// Compute the taptweak hash for key tweaking.
pub fn taptweak_hash(pubkey: &[u8; 32], merkle_root: &[u8; 32]) -> [u8; 32] {
    let mut data = Vec::with_capacity(64);
    data.extend_from_slice(pubkey);
    data.extend_from_slice(merkle_root);
    tagged_hash(b"TapTweak/elements", &data)
}

/// Merkle root over leaf hashes, pairing neighbours level by level. An odd
/// node at the end of a level is carried up unchanged.
pub fn merkle_root(leaves: &[[u8; 32]]) -> Option<[u8; 32]> {
    if leaves.is_empty() {
        return None;
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [a, b] => tapbranch_hash(a, b),
                _ => pair[0],
            })
            .collect();
    }
    level.first().copied()
}

/// Tweak `internal_key` with the script tree root and return the output key.
pub fn output_key(
    internal_key: &XOnlyPublicKey,
    merkle_root: &[u8; 32],
) -> Result<(XOnlyPublicKey, Parity)> {
    let tweak = taptweak_hash(&internal_key.serialize(), merkle_root);
    let scalar = Scalar::from_be_bytes(tweak)
        .map_err(|e| Error::Derivation(format!("taproot tweak out of range: {e}")))?;
    let secp = Secp256k1::verification_only();
    internal_key
        .add_tweak(&secp, &scalar)
        .map_err(|e| Error::Derivation(format!("taproot tweak failed: {e}")))
}

/// P2TR witness v1 script: OP_1 <32-byte-x-only-key>
pub fn p2tr_script(output_key: &XOnlyPublicKey) -> Script {
    let mut script_bytes = Vec::with_capacity(34);
    script_bytes.push(0x51);
    script_bytes.push(0x20);
    script_bytes.extend_from_slice(&output_key.serialize());
    Script::from(script_bytes)
}
