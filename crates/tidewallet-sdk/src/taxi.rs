//! Fee sponsorship ("taxi"): a third party pays the network fee in the
//! policy asset in exchange for an amount of another asset.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use lwk_wollet::elements::confidential::{AssetBlindingFactor, ValueBlindingFactor};
use lwk_wollet::elements::pset::PartiallySignedTransaction;
use lwk_wollet::elements::AssetId;
use reqwest::blocking::Client;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};
use crate::pset::pset_from_base64;
use crate::store::UnblindingData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopupRequest {
    pub asset: AssetId,
    pub estimated_tx_size: u64,
    pub millisat_per_byte: u64,
}

/// A sponsor's offer: a partial PSET carrying the sponsor's inputs, the
/// fee output and the payment output, plus the secrets of its inputs.
#[derive(Debug, Clone)]
pub struct Topup {
    pub topup_id: String,
    pub partial: PartiallySignedTransaction,
    pub asset: AssetId,
    pub asset_amount: u64,
    pub asset_spread: u64,
    pub expiry: u64,
    /// Secrets of the partial's inputs, in input order.
    pub input_blinding_data: Vec<UnblindingData>,
}

pub trait FeeSponsor: Send + Sync {
    fn request_topup(&self, request: &TopupRequest) -> Result<Topup>;
}

impl<T: FeeSponsor + ?Sized> FeeSponsor for Arc<T> {
    fn request_topup(&self, request: &TopupRequest) -> Result<Topup> {
        (**self).request_topup(request)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TopupRequestBody {
    asset_hash: String,
    estimated_tx_size: u64,
    millisat_per_byte: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopupReply {
    asset_hash: String,
    #[serde(deserialize_with = "u64_from_str_or_num")]
    asset_amount: u64,
    #[serde(default, deserialize_with = "u64_from_str_or_num")]
    asset_spread: u64,
    #[serde(default, deserialize_with = "u64_from_str_or_num")]
    expiry: u64,
    #[serde(default)]
    in_blinding_data: Vec<BlindingDataReply>,
    topup: TopupBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopupBody {
    topup_id: String,
    partial: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlindingDataReply {
    asset: String,
    #[serde(deserialize_with = "u64_from_str_or_num")]
    value: u64,
    asset_blinder: String,
    value_blinder: String,
}

/// Gateway replies encode 64-bit integers as strings.
fn u64_from_str_or_num<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u64, D::Error> {
    use serde::de::Error as _;
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| D::Error::custom(format!("not a u64: {n}"))),
        serde_json::Value::String(s) => s.parse().map_err(D::Error::custom),
        other => Err(D::Error::custom(format!("expected integer, got {other}"))),
    }
}

/// Base64 fields carry bytes in reverse of display order.
fn reversed_hex(b64: &str) -> Result<String> {
    let mut bytes = BASE64
        .decode(b64)
        .map_err(|e| Error::Taxi(format!("bad base64: {e}")))?;
    bytes.reverse();
    Ok(hex::encode(bytes))
}

impl BlindingDataReply {
    fn into_unblinding(self) -> Result<UnblindingData> {
        let asset = AssetId::from_str(&reversed_hex(&self.asset)?)
            .map_err(|e| Error::Taxi(format!("bad input asset: {e}")))?;
        let abf = AssetBlindingFactor::from_str(&reversed_hex(&self.asset_blinder)?)
            .map_err(|e| Error::Taxi(format!("bad asset blinder: {e}")))?;
        let vbf = ValueBlindingFactor::from_str(&reversed_hex(&self.value_blinder)?)
            .map_err(|e| Error::Taxi(format!("bad value blinder: {e}")))?;
        Ok(UnblindingData {
            asset,
            value: self.value,
            asset_blinding_factor: abf,
            value_blinding_factor: vbf,
        })
    }
}

impl TopupReply {
    fn into_topup(self) -> Result<Topup> {
        let asset = AssetId::from_str(&self.asset_hash)
            .map_err(|e| Error::Taxi(format!("bad asset hash: {e}")))?;
        let partial = pset_from_base64(&self.topup.partial)?;
        let input_blinding_data = self
            .in_blinding_data
            .into_iter()
            .map(BlindingDataReply::into_unblinding)
            .collect::<Result<Vec<_>>>()?;
        Ok(Topup {
            topup_id: self.topup.topup_id,
            partial,
            asset,
            asset_amount: self.asset_amount,
            asset_spread: self.asset_spread,
            expiry: self.expiry,
            input_blinding_data,
        })
    }
}

/// HTTP client for a taxi endpoint.
pub struct TaxiClient {
    url: String,
    client: Client,
}

impl TaxiClient {
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Taxi(format!("http client: {e}")))?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl FeeSponsor for TaxiClient {
    fn request_topup(&self, request: &TopupRequest) -> Result<Topup> {
        let body = TopupRequestBody {
            asset_hash: request.asset.to_string(),
            estimated_tx_size: request.estimated_tx_size,
            millisat_per_byte: request.millisat_per_byte,
        };
        log::debug!(
            "taxi: requesting topup of {} for {} vB",
            body.asset_hash,
            body.estimated_tx_size
        );
        let resp = self
            .client
            .post(format!("{}/asset/topup", self.url))
            .json(&body)
            .send()
            .map_err(|e| Error::Transport(format!("taxi: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().unwrap_or_default();
            return Err(Error::Taxi(format!("topup refused ({status}): {text}")));
        }
        let reply: TopupReply = resp
            .json()
            .map_err(|e| Error::Protocol(format!("taxi reply: {e}")))?;
        reply.into_topup()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Network;
    use crate::pset::{new_pset, pset_to_base64};

    fn b64_reversed(hex_display: &str) -> String {
        let mut bytes = hex::decode(hex_display).unwrap();
        bytes.reverse();
        BASE64.encode(bytes)
    }

    #[test]
    fn parses_gateway_reply() {
        let asset = Network::LiquidRegtest.policy_asset().to_string();
        let blinder = "11".repeat(32);
        let json = serde_json::json!({
            "assetHash": asset,
            "assetAmount": "1500",
            "assetSpread": "20",
            "expiry": 1700000000u64,
            "inBlindingData": [{
                "asset": b64_reversed(&asset),
                "value": "100000",
                "assetBlinder": b64_reversed(&blinder),
                "valueBlinder": b64_reversed(&blinder),
            }],
            "topup": {"topupId": "abc", "partial": pset_to_base64(&new_pset())}
        });
        let reply: TopupReply = serde_json::from_value(json).unwrap();
        let topup = reply.into_topup().unwrap();
        assert_eq!(topup.topup_id, "abc");
        assert_eq!(topup.asset_amount, 1500);
        assert_eq!(topup.asset_spread, 20);
        assert_eq!(topup.expiry, 1_700_000_000);
        assert_eq!(topup.input_blinding_data.len(), 1);
        let data = topup.input_blinding_data[0];
        assert_eq!(data.asset, Network::LiquidRegtest.policy_asset());
        assert_eq!(data.value, 100_000);
        assert_eq!(data.asset_blinding_factor.to_string(), blinder);
    }

    #[test]
    fn rejects_bad_partial() {
        let json = serde_json::json!({
            "assetHash": Network::LiquidRegtest.policy_asset().to_string(),
            "assetAmount": 10,
            "topup": {"topupId": "x", "partial": "garbage"}
        });
        let reply: TopupReply = serde_json::from_value(json).unwrap();
        assert!(reply.into_topup().is_err());
    }

    #[test]
    fn amount_must_be_integer() {
        let json = serde_json::json!({
            "assetHash": "00",
            "assetAmount": true,
            "topup": {"topupId": "x", "partial": ""}
        });
        assert!(serde_json::from_value::<TopupReply>(json).is_err());
    }

    #[test]
    fn client_trims_trailing_slash() {
        let client = TaxiClient::new("http://localhost:8000/").unwrap();
        assert_eq!(client.url(), "http://localhost:8000");
    }
}
