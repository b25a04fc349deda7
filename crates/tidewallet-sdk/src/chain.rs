use std::sync::{Arc, Mutex};

use electrum_client::{Batch, ElectrumApi, Param};
use lwk_wollet::elements::encode::deserialize;
use lwk_wollet::elements::{BlockHeader, Script, Txid};
use sha2::{Digest, Sha256};

use crate::chain_watcher::{spawn_watcher, WatcherEvent, WatcherHandle, WatcherSettings};
use crate::error::{Error, Result};

/// A single entry of a script's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub txid: Txid,
    /// Block height. -1 or 0 means unconfirmed (mempool), >0 means confirmed.
    pub height: i32,
}

impl HistoryEntry {
    pub fn confirmed_height(&self) -> Option<u32> {
        (self.height > 0).then_some(self.height as u32)
    }
}

/// Fee rate as reported by the backend, in BTC per 1000 virtual bytes.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct FeeRate(f64);

impl FeeRate {
    pub fn from_btc_per_kvb(rate: f64) -> Self {
        Self(rate)
    }

    pub fn btc_per_kvb(self) -> f64 {
        self.0
    }

    pub fn sats_per_vbyte(self) -> f64 {
        self.0 * 1e8 / 1000.0
    }

    /// Satoshis per kvB, which is also millisatoshis per byte.
    pub fn millisats_per_byte(self) -> f64 {
        self.0 * 1e8
    }

    pub fn scaled(self, factor: f64) -> Self {
        Self(self.0 * factor)
    }
}

/// Invoked with the Electrum script hash and the new status hash.
pub type StatusCallback = Box<dyn Fn(String, Option<String>) + Send + 'static>;

/// Read/broadcast access to the Liquid chain.
///
/// Batch methods return results in request order.
pub trait ChainSource: Send + Sync {
    /// Register `callback` for status changes of `script`. The callback is
    /// also invoked once with the current status.
    fn subscribe_script_status(&self, script: &Script, callback: StatusCallback) -> Result<()>;

    fn unsubscribe_script_status(&self, script: &Script) -> Result<()>;

    fn fetch_histories(&self, scripts: &[Script]) -> Result<Vec<Vec<HistoryEntry>>>;

    /// Raw transaction hex for each txid.
    fn fetch_transactions(&self, txids: &[Txid]) -> Result<Vec<String>>;

    fn fetch_block_header(&self, height: u32) -> Result<BlockHeader>;

    fn estimate_fees(&self, target_blocks: usize) -> Result<FeeRate>;

    fn broadcast_transaction(&self, tx_hex: &str) -> Result<Txid>;

    fn get_relay_fee(&self) -> Result<FeeRate>;

    fn close(&self) -> Result<()>;
}

impl<T: ChainSource + ?Sized> ChainSource for Arc<T> {
    fn subscribe_script_status(&self, script: &Script, callback: StatusCallback) -> Result<()> {
        (**self).subscribe_script_status(script, callback)
    }

    fn unsubscribe_script_status(&self, script: &Script) -> Result<()> {
        (**self).unsubscribe_script_status(script)
    }

    fn fetch_histories(&self, scripts: &[Script]) -> Result<Vec<Vec<HistoryEntry>>> {
        (**self).fetch_histories(scripts)
    }

    fn fetch_transactions(&self, txids: &[Txid]) -> Result<Vec<String>> {
        (**self).fetch_transactions(txids)
    }

    fn fetch_block_header(&self, height: u32) -> Result<BlockHeader> {
        (**self).fetch_block_header(height)
    }

    fn estimate_fees(&self, target_blocks: usize) -> Result<FeeRate> {
        (**self).estimate_fees(target_blocks)
    }

    fn broadcast_transaction(&self, tx_hex: &str) -> Result<Txid> {
        (**self).broadcast_transaction(tx_hex)
    }

    fn get_relay_fee(&self) -> Result<FeeRate> {
        (**self).get_relay_fee()
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }
}

/// Electrum script hash: SHA256(scriptPubKey) with reversed byte order, hex.
pub fn script_hash(script: &Script) -> String {
    let mut hash = Sha256::digest(script.as_bytes()).to_vec();
    hash.reverse();
    hex::encode(hash)
}

pub(crate) fn parse_history(value: &serde_json::Value) -> Result<Vec<HistoryEntry>> {
    let entries = value
        .as_array()
        .ok_or_else(|| Error::Protocol("expected array response".into()))?;

    let mut results = Vec::with_capacity(entries.len());
    for entry in entries {
        let tx_hash_hex = entry["tx_hash"]
            .as_str()
            .ok_or_else(|| Error::Protocol("missing tx_hash".into()))?;
        let height = entry["height"]
            .as_i64()
            .ok_or_else(|| Error::Protocol("missing height".into()))? as i32;
        let txid: Txid = tx_hash_hex
            .parse()
            .map_err(|e| Error::Protocol(format!("bad tx_hash: {e}")))?;
        results.push(HistoryEntry { txid, height });
    }
    Ok(results)
}

fn map_electrum_err(e: electrum_client::Error) -> Error {
    match e {
        electrum_client::Error::Protocol(value) => Error::Protocol(value.to_string()),
        other => Error::Transport(other.to_string()),
    }
}

fn as_fee_rate(value: &serde_json::Value) -> Result<FeeRate> {
    let rate = value
        .as_f64()
        .ok_or_else(|| Error::Protocol(format!("expected fee rate, got {value}")))?;
    if rate < 0.0 {
        return Err(Error::Protocol("fee estimate unavailable".into()));
    }
    Ok(FeeRate::from_btc_per_kvb(rate))
}

/// Electrum-based chain source for Liquid.
///
/// Request/response calls open a short-lived connection each; script
/// subscriptions live on a watcher thread that is started on first use.
pub struct ElectrumChainSource {
    electrum_url: String,
    watcher: Mutex<Option<WatcherHandle>>,
    events: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<WatcherEvent>>>,
}

impl ElectrumChainSource {
    pub fn new(electrum_url: &str) -> Self {
        Self {
            electrum_url: electrum_url.to_string(),
            watcher: Mutex::new(None),
            events: Mutex::new(None),
        }
    }

    pub fn electrum_url(&self) -> &str {
        &self.electrum_url
    }

    /// Block and connection events from the watcher thread, once.
    pub fn take_watcher_events(&self) -> Option<tokio::sync::mpsc::UnboundedReceiver<WatcherEvent>> {
        self.events.lock().ok()?.take()
    }

    fn client(&self) -> Result<electrum_client::Client> {
        electrum_client::Client::new(&self.electrum_url).map_err(map_electrum_err)
    }

    fn watcher(&self) -> Result<WatcherHandle> {
        let mut guard = self
            .watcher
            .lock()
            .map_err(|_| Error::Transport("watcher lock poisoned".into()))?;
        if let Some(handle) = guard.as_ref() {
            return Ok(handle.clone());
        }
        let (handle, events) = spawn_watcher(WatcherSettings::new(&self.electrum_url))
            .map_err(|e| Error::Transport(format!("spawn script watcher: {e}")))?;
        if let Ok(mut slot) = self.events.lock() {
            *slot = Some(events);
        }
        *guard = Some(handle.clone());
        Ok(handle)
    }

    fn batch_by_script_hash(
        &self,
        method: &str,
        scripts: &[Script],
    ) -> Result<Vec<serde_json::Value>> {
        if scripts.is_empty() {
            return Ok(Vec::new());
        }
        let mut batch = Batch::default();
        for script in scripts {
            batch.raw(method.to_string(), vec![Param::String(script_hash(script))]);
        }
        let client = self.client()?;
        let values = client.batch_call(&batch).map_err(map_electrum_err)?;
        if values.len() != scripts.len() {
            return Err(Error::Protocol(format!(
                "batch returned {} results for {} requests",
                values.len(),
                scripts.len()
            )));
        }
        Ok(values)
    }
}

impl ChainSource for ElectrumChainSource {
    fn subscribe_script_status(&self, script: &Script, callback: StatusCallback) -> Result<()> {
        self.watcher()?.watch(script.clone(), callback)
    }

    fn unsubscribe_script_status(&self, script: &Script) -> Result<()> {
        self.watcher()?.unwatch(script.clone())
    }

    fn fetch_histories(&self, scripts: &[Script]) -> Result<Vec<Vec<HistoryEntry>>> {
        self.batch_by_script_hash("blockchain.scripthash.get_history", scripts)?
            .iter()
            .map(parse_history)
            .collect()
    }

    fn fetch_transactions(&self, txids: &[Txid]) -> Result<Vec<String>> {
        if txids.is_empty() {
            return Ok(Vec::new());
        }
        let mut batch = Batch::default();
        for txid in txids {
            batch.raw(
                "blockchain.transaction.get".to_string(),
                vec![Param::String(txid.to_string())],
            );
        }
        let client = self.client()?;
        let values = client.batch_call(&batch).map_err(map_electrum_err)?;
        if values.len() != txids.len() {
            return Err(Error::Protocol(format!(
                "batch returned {} transactions for {} requests",
                values.len(),
                txids.len()
            )));
        }
        values
            .into_iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::Protocol("expected transaction hex".into()))
            })
            .collect()
    }

    fn fetch_block_header(&self, height: u32) -> Result<BlockHeader> {
        let client = self.client()?;
        let resp = client
            .raw_call("blockchain.block.header", [Param::Usize(height as usize)])
            .map_err(map_electrum_err)?;
        let header_hex = resp
            .as_str()
            .ok_or_else(|| Error::Protocol("expected header hex".into()))?;
        let bytes = hex::decode(header_hex)
            .map_err(|e| Error::Protocol(format!("bad header hex: {e}")))?;
        deserialize(&bytes).map_err(|e| Error::Protocol(format!("bad header: {e}")))
    }

    fn estimate_fees(&self, target_blocks: usize) -> Result<FeeRate> {
        let client = self.client()?;
        let resp = client
            .raw_call("blockchain.estimatefee", [Param::Usize(target_blocks)])
            .map_err(map_electrum_err)?;
        as_fee_rate(&resp)
    }

    fn broadcast_transaction(&self, tx_hex: &str) -> Result<Txid> {
        let client = self.client()?;
        let resp = client
            .raw_call(
                "blockchain.transaction.broadcast",
                [Param::String(tx_hex.to_string())],
            )
            .map_err(|e| match map_electrum_err(e) {
                Error::Protocol(msg) => Error::RelayRejected(msg),
                other => other,
            })?;
        let txid_hex = resp
            .as_str()
            .ok_or_else(|| Error::Protocol("expected txid".into()))?;
        txid_hex
            .parse()
            .map_err(|e| Error::Protocol(format!("bad txid: {e}")))
    }

    fn get_relay_fee(&self) -> Result<FeeRate> {
        let client = self.client()?;
        let resp = client
            .raw_call("blockchain.relayfee", Vec::<Param>::new())
            .map_err(map_electrum_err)?;
        as_fee_rate(&resp)
    }

    fn close(&self) -> Result<()> {
        if let Ok(mut guard) = self.watcher.lock() {
            if let Some(handle) = guard.take() {
                handle.stop();
            }
        }
        Ok(())
    }
}

impl Drop for ElectrumChainSource {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn script_hash_is_reversed_sha256() {
        let script = Script::from(vec![0x00, 0x14]);
        let mut expected = Sha256::digest([0x00u8, 0x14]).to_vec();
        expected.reverse();
        assert_eq!(script_hash(&script), hex::encode(expected));
    }

    #[test]
    fn parse_history_reads_heights() {
        let value = json!([
            {"tx_hash": "0000000000000000000000000000000000000000000000000000000000000001", "height": 120},
            {"tx_hash": "0000000000000000000000000000000000000000000000000000000000000002", "height": 0},
        ]);
        let history = parse_history(&value).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].confirmed_height(), Some(120));
        assert_eq!(history[1].confirmed_height(), None);
    }

    #[test]
    fn parse_history_rejects_garbage() {
        assert!(matches!(
            parse_history(&json!({"error": "nope"})),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            parse_history(&json!([{"height": 1}])),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn fee_rate_conversions() {
        let rate = FeeRate::from_btc_per_kvb(0.000001);
        assert!((rate.sats_per_vbyte() - 0.1).abs() < 1e-12);
        assert!((rate.millisats_per_byte() - 100.0).abs() < 1e-9);
        assert!((rate.scaled(1.5).sats_per_vbyte() - 0.15).abs() < 1e-12);
    }

    #[test]
    fn negative_estimate_is_protocol_error() {
        assert!(matches!(as_fee_rate(&json!(-1)), Err(Error::Protocol(_))));
        assert!(as_fee_rate(&json!(0.0001)).is_ok());
    }

    #[test]
    fn electrum_source_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ElectrumChainSource>();
    }
}
