use std::str::FromStr;

use lwk_wollet::ElementsNetwork;
use lwk_wollet::elements::hashes::Hash as _;
use lwk_wollet::elements::{AddressParams, AssetId, BlockHash};
use serde::{Deserialize, Serialize};

/// Network variants for Liquid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Liquid,
    LiquidTestnet,
    LiquidRegtest,
}

impl Network {
    pub const ALL: [Network; 3] = [
        Network::Liquid,
        Network::LiquidTestnet,
        Network::LiquidRegtest,
    ];

    pub fn into_lwk(self) -> ElementsNetwork {
        match self {
            Network::Liquid => ElementsNetwork::Liquid,
            Network::LiquidTestnet => ElementsNetwork::LiquidTestnet,
            Network::LiquidRegtest => ElementsNetwork::default_regtest(),
        }
    }

    pub fn is_mainnet(self) -> bool {
        matches!(self, Network::Liquid)
    }

    /// The native (policy) asset fees are paid in.
    pub fn policy_asset(self) -> AssetId {
        self.into_lwk().policy_asset()
    }

    /// SLIP-44 coin type used by the standard account path.
    pub fn coin_type(self) -> u32 {
        if self.is_mainnet() { 1776 } else { 1 }
    }

    pub fn default_electrum_url(self) -> &'static str {
        match self {
            Network::Liquid => "ssl://blockstream.info:995",
            Network::LiquidTestnet => "ssl://blockstream.info:465",
            Network::LiquidRegtest => "tcp://localhost:50001",
        }
    }

    /// Fee-sponsorship ("taxi") endpoint.
    pub fn default_taxi_url(self) -> &'static str {
        match self {
            Network::Liquid => "https://grpc.liquid.taxi/v1",
            Network::LiquidTestnet => "https://stage-api.liquid.taxi/v1",
            Network::LiquidRegtest => "http://localhost:8000",
        }
    }

    pub fn explorer_url(self) -> &'static str {
        match self {
            Network::Liquid => "https://blockstream.info/liquid",
            Network::LiquidTestnet => "https://blockstream.info/liquidtestnet",
            Network::LiquidRegtest => "http://localhost:5001",
        }
    }

    pub fn address_params(self) -> &'static AddressParams {
        match self {
            Network::Liquid => &AddressParams::LIQUID,
            Network::LiquidTestnet => &AddressParams::LIQUID_TESTNET,
            Network::LiquidRegtest => &AddressParams::ELEMENTS,
        }
    }

    /// Genesis block hash, committed to by taproot signature hashes.
    pub fn genesis_hash(self) -> BlockHash {
        let hex = match self {
            Network::Liquid => "1466275836220db2944ca059a3a10ef6fd2ea684b0688d2c379296888a206003",
            Network::LiquidTestnet => {
                "a771da8e52ee6ad581ed1e9a99825e5b3b7992225534eaa2ae23244fe26ab1c1"
            }
            Network::LiquidRegtest => {
                "00902a6b70c2ca83b5d9c815d96a0e2f4202179316970d14ea1847dae5b1ca21"
            }
        };
        BlockHash::from_str(hex).unwrap_or_else(|_| BlockHash::all_zeros())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Liquid => "liquid",
            Network::LiquidTestnet => "testnet",
            Network::LiquidRegtest => "regtest",
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "liquid" => Ok(Network::Liquid),
            "testnet" | "liquid-testnet" | "liquidtestnet" => Ok(Network::LiquidTestnet),
            "regtest" | "liquid-regtest" | "liquidregtest" => Ok(Network::LiquidRegtest),
            _ => Err(format!("invalid network: {}", s)),
        }
    }
}
