use lwk_wollet::bitcoin::bip32::{ChildNumber, DerivationPath};
use sha2::{Digest, Sha256};

use super::Chain;
use crate::network::Network;

const HARDENED: u32 = 0x8000_0000;
const PURPOSE_P2WPKH: u32 = 84;
/// Coin type of the pre-1776 account layout.
const LEGACY_COIN_TYPE: u32 = 0;

fn hardened(index: u32) -> ChildNumber {
    ChildNumber::from(HARDENED | index)
}

/// `m/84'/<coin>'/0'` where coin is 1776 on mainnet and 1 elsewhere.
pub fn standard_path(network: Network) -> DerivationPath {
    DerivationPath::from(vec![
        hardened(PURPOSE_P2WPKH),
        hardened(network.coin_type()),
        hardened(0),
    ])
}

/// `m/84'/0'/0'`, valid on every network.
pub fn legacy_path() -> DerivationPath {
    DerivationPath::from(vec![
        hardened(PURPOSE_P2WPKH),
        hardened(LEGACY_COIN_TYPE),
        hardened(0),
    ])
}

/// SLIP-13 style path for a named account.
///
/// The first 16 bytes of SHA256(name) are read as four little-endian u32
/// components; a zero component is replaced by `0x80000000`.
pub fn slip13_path(name: &str) -> DerivationPath {
    let digest = Sha256::digest(name.as_bytes());
    let children = digest[..16]
        .chunks_exact(4)
        .map(|chunk| {
            let value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            ChildNumber::from(if value == 0 { HARDENED } else { value })
        })
        .collect::<Vec<_>>();
    DerivationPath::from(children)
}

/// Relative `<chain>/<index>` step below an account path.
pub fn relative_children(chain: Chain, index: u32) -> Option<[ChildNumber; 2]> {
    let chain = ChildNumber::from_normal_idx(chain.index()).ok()?;
    let index = ChildNumber::from_normal_idx(index).ok()?;
    Some([chain, index])
}

/// Full path from the master key to the key at `<chain>/<index>`.
pub fn full_path(base: &DerivationPath, chain: Chain, index: u32) -> Option<DerivationPath> {
    let [c, i] = relative_children(chain, index)?;
    Some(base.child(c).child(i))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_paths_per_network() {
        let main: Vec<ChildNumber> = standard_path(Network::Liquid).into();
        assert_eq!(main, vec![hardened(84), hardened(1776), hardened(0)]);
        let test: Vec<ChildNumber> = standard_path(Network::LiquidTestnet).into();
        assert_eq!(test, vec![hardened(84), hardened(1), hardened(0)]);
        assert_eq!(
            standard_path(Network::LiquidTestnet),
            standard_path(Network::LiquidRegtest)
        );
        assert_ne!(legacy_path(), standard_path(Network::Liquid));
    }

    #[test]
    fn slip13_reads_le_words() {
        let name = "mainAccount";
        let digest = Sha256::digest(name.as_bytes());
        let first = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
        let path: Vec<ChildNumber> = slip13_path(name).into();
        assert_eq!(path.len(), 4);
        let expected = if first == 0 { HARDENED } else { first };
        assert_eq!(path[0], ChildNumber::from(expected));
    }

    #[test]
    fn slip13_is_deterministic_and_name_sensitive() {
        assert_eq!(slip13_path("savings"), slip13_path("savings"));
        assert_ne!(slip13_path("savings"), slip13_path("Savings"));
    }

    #[test]
    fn full_path_appends_chain_and_index() {
        let base = standard_path(Network::LiquidRegtest);
        let path: Vec<ChildNumber> = full_path(&base, Chain::Internal, 7).unwrap().into();
        assert_eq!(path.len(), 5);
        assert_eq!(path[3], ChildNumber::from_normal_idx(1).unwrap());
        assert_eq!(path[4], ChildNumber::from_normal_idx(7).unwrap());
        assert!(full_path(&base, Chain::External, HARDENED).is_none());
    }
}
