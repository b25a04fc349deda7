use serde::{Deserialize, Serialize};

use crate::network::Network;

pub const DEFAULT_GAP_LIMIT: u32 = 20;
pub const DEFAULT_FEE_MULTIPLIER: f64 = 1.5;

/// Engine configuration for one wallet session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletConfig {
    pub network: Network,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub electrum_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taxi_url: Option<String>,
    /// Consecutive unused addresses that end discovery of a chain.
    #[serde(default = "default_gap_limit")]
    pub gap_limit: u32,
    /// Safety margin applied to the relay fee when pricing a PSET.
    #[serde(default = "default_fee_multiplier")]
    pub fee_multiplier: f64,
    /// Extra attempts for a chain-source batch that failed on transport.
    #[serde(default)]
    pub batch_retries: u32,
}

fn default_gap_limit() -> u32 {
    DEFAULT_GAP_LIMIT
}

fn default_fee_multiplier() -> f64 {
    DEFAULT_FEE_MULTIPLIER
}

impl WalletConfig {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            electrum_url: None,
            taxi_url: None,
            gap_limit: DEFAULT_GAP_LIMIT,
            fee_multiplier: DEFAULT_FEE_MULTIPLIER,
            batch_retries: 0,
        }
    }

    pub fn electrum_url(&self) -> &str {
        self.electrum_url
            .as_deref()
            .unwrap_or_else(|| self.network.default_electrum_url())
    }

    pub fn taxi_url(&self) -> &str {
        self.taxi_url
            .as_deref()
            .unwrap_or_else(|| self.network.default_taxi_url())
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self::new(Network::Liquid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_network() {
        let cfg = WalletConfig::new(Network::LiquidRegtest);
        assert_eq!(cfg.gap_limit, 20);
        assert_eq!(cfg.fee_multiplier, 1.5);
        assert_eq!(cfg.electrum_url(), "tcp://localhost:50001");
        assert_eq!(cfg.taxi_url(), "http://localhost:8000");
    }

    #[test]
    fn overrides_take_precedence() {
        let cfg = WalletConfig {
            electrum_url: Some("tcp://10.0.0.2:60401".into()),
            ..WalletConfig::new(Network::LiquidTestnet)
        };
        assert_eq!(cfg.electrum_url(), "tcp://10.0.0.2:60401");
    }

    #[test]
    fn missing_fields_deserialize_to_defaults() {
        let cfg: WalletConfig = serde_json::from_str(r#"{"network":"liquid"}"#).unwrap();
        assert_eq!(cfg, WalletConfig::new(Network::Liquid));
    }
}
