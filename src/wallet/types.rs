use serde::Serialize;
use std::collections::HashMap;

use tidewallet_sdk::elements::AssetId;
use tidewallet_sdk::{DerivedAddress, Network, SendResult, TxDetails, Utxo, WalletEvent};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WalletStatus {
    NotCreated,
    Locked,
    Unlocked,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WalletBalance {
    /// Map of asset_id hex -> satoshi amount
    pub assets: HashMap<String, u64>,
}

impl From<HashMap<AssetId, u64>> for WalletBalance {
    fn from(balances: HashMap<AssetId, u64>) -> Self {
        let assets = balances
            .into_iter()
            .filter(|(_, amount)| *amount > 0)
            .map(|(asset, amount)| (asset.to_string(), amount))
            .collect();
        Self { assets }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletAddress {
    pub index: u32,
    pub address: String,
}

impl From<&DerivedAddress> for WalletAddress {
    fn from(a: &DerivedAddress) -> Self {
        Self {
            index: a.index,
            address: a.address.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletUtxo {
    pub txid: String,
    pub vout: u32,
    pub account: String,
    pub asset_id: Option<String>,
    pub value: Option<u64>,
    pub height: Option<u32>,
}

impl From<&Utxo> for WalletUtxo {
    fn from(u: &Utxo) -> Self {
        Self {
            txid: u.outpoint.txid.to_string(),
            vout: u.outpoint.vout,
            account: u.account_id.clone(),
            asset_id: u.asset().map(|a| a.to_string()),
            value: u.value(),
            height: u.height,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletTransaction {
    pub txid: String,
    /// Net policy-asset change in satoshis (positive = received, negative = sent)
    pub balance_change: i64,
    /// Net change per asset hex.
    pub transfers: HashMap<String, i64>,
    pub fee: u64,
    pub height: Option<u32>,
    pub tx_type: String,
}

impl WalletTransaction {
    pub fn from_details(tx: &TxDetails, policy_asset: &AssetId) -> Self {
        let balance_change = tx
            .transfers
            .iter()
            .find(|t| &t.asset == policy_asset)
            .map(|t| t.amount)
            .unwrap_or(0);
        Self {
            txid: tx.txid.to_string(),
            balance_change,
            transfers: tx
                .transfers
                .iter()
                .map(|t| (t.asset.to_string(), t.amount))
                .collect(),
            fee: tx.fee,
            height: tx.height,
            tx_type: format!("{:?}", tx.tx_type).to_lowercase(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidSendResult {
    pub txid: String,
    pub fee_sat: u64,
}

impl From<&SendResult> for LiquidSendResult {
    fn from(r: &SendResult) -> Self {
        Self {
            txid: r.txid.to_string(),
            fee_sat: r.fee_amount,
        }
    }
}

/// Network-level status shown before and after unlock.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub network: String,
    pub is_mainnet: bool,
    pub electrum_url: String,
    pub policy_asset_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostState {
    pub network_status: NetworkStatus,
    pub wallet_status: WalletStatus,
    pub wallet_balance: Option<WalletBalance>,
}

/// Serializable form of an engine [`WalletEvent`] for host subscribers.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalletNotification {
    NewUtxo { txid: String, vout: u32 },
    SpentUtxo { txid: String, vout: u32 },
    NewTx { txid: String },
    Enabled { network: Network, hostname: String },
    Disabled { network: Network, hostname: String },
    Network { network: Network },
}

impl From<&WalletEvent> for WalletNotification {
    fn from(event: &WalletEvent) -> Self {
        match event {
            WalletEvent::NewUtxo(u) => Self::NewUtxo {
                txid: u.outpoint.txid.to_string(),
                vout: u.outpoint.vout,
            },
            WalletEvent::SpentUtxo(o) => Self::SpentUtxo {
                txid: o.txid.to_string(),
                vout: o.vout,
            },
            WalletEvent::NewTx(tx) => Self::NewTx {
                txid: tx.txid.to_string(),
            },
            WalletEvent::Enabled { network, hostname } => Self::Enabled {
                network: *network,
                hostname: hostname.clone(),
            },
            WalletEvent::Disabled { network, hostname } => Self::Disabled {
                network: *network,
                hostname: hostname.clone(),
            },
            WalletEvent::Network(network) => Self::Network { network: *network },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidewallet_sdk::elements::hashes::Hash;
    use tidewallet_sdk::elements::{OutPoint, Txid};

    #[test]
    fn zero_balances_are_hidden() {
        let mut balances = HashMap::new();
        balances.insert(AssetId::from_slice(&[1; 32]).unwrap(), 0);
        balances.insert(AssetId::from_slice(&[2; 32]).unwrap(), 5);
        let dto = WalletBalance::from(balances);
        assert_eq!(dto.assets.len(), 1);
        assert_eq!(dto.assets.values().copied().collect::<Vec<_>>(), vec![5]);
    }

    #[test]
    fn notifications_are_tagged() {
        let outpoint = OutPoint::new(Txid::all_zeros(), 3);
        let json = serde_json::to_value(WalletNotification::from(&WalletEvent::SpentUtxo(
            outpoint,
        )))
        .unwrap();
        assert_eq!(json["type"], "SPENT_UTXO");
        assert_eq!(json["vout"], 3);

        let json = serde_json::to_value(WalletNotification::from(&WalletEvent::Network(
            Network::LiquidTestnet,
        )))
        .unwrap();
        assert_eq!(json["type"], "NETWORK");
        assert_eq!(json["network"], "liquidtestnet");
    }
}
