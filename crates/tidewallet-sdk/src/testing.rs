//! Test fixtures: an in-memory chain backend, a scripted fee sponsor and a
//! pre-funded regtest wallet.
//!
//! Available to unit tests and, behind the `testing` feature, to the
//! integration tests and to downstream crates.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use lwk_wollet::elements::confidential::{Asset, Nonce, Value};
use lwk_wollet::elements::encode::{deserialize, serialize};
use lwk_wollet::elements::hashes::Hash;
use lwk_wollet::elements::secp256k1_zkp::{PublicKey, Secp256k1, SecretKey};
use lwk_wollet::elements::{
    Address, AssetId, BlockHash, BlockHeader, BlockExtData, LockTime, OutPoint, Script, Sequence,
    Transaction, TxIn, TxMerkleNode, TxOut, TxOutWitness, Txid,
};
use sha2::{Digest, Sha256};

use crate::account::{default_accounts, Account, Chain, CovenantTemplate, MAIN_ACCOUNT_TEST};
use crate::chain::{script_hash, ChainSource, FeeRate, HistoryEntry, StatusCallback};
use crate::coin_selection::Reservations;
use crate::error::{Error, Result};
use crate::mnemonic::EncryptedMnemonic;
use crate::network::Network;
use crate::pset::{address_output, fee_output, new_pset, PsetBuilder};
use crate::store::{MemoryStore, UnblindingData, WalletRepository};
use crate::taxi::{FeeSponsor, Topup, TopupRequest};
use crate::updater::UtxoUpdater;

pub const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
pub const TEST_PASSWORD: &str = "correct horse battery staple";

/// Minimum relay fee reported by [`MockChainSource`], in BTC/kvB.
pub const MOCK_RELAY_FEE: f64 = 0.000_001;

const SAMPLE_TEMPLATE: &str = r#"{
    "contractName": "Vault",
    "constructorInputs": [
        {"name": "owner", "type": "xonlypublickey"},
        {"name": "tag", "type": "bytes"}
    ],
    "functions": [
        {"name": "spend", "asm": ["$owner", "OP_CHECKSIG"]},
        {"name": "tagged", "asm": ["OP_SIZE", "$tag", "OP_EQUALVERIFY", "OP_1"]}
    ]
}"#;

/// Two-leaf vault: a key spend for `owner` and a leaf gated on `tag`.
pub fn sample_covenant_template() -> CovenantTemplate {
    CovenantTemplate::from_json(SAMPLE_TEMPLATE).expect("sample template parses")
}

/// An issued asset distinct from every network's policy asset.
pub fn test_asset() -> AssetId {
    AssetId::from_slice(&[0x5a; 32]).expect("32 bytes")
}

fn fixed_key(byte: u8) -> PublicKey {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[byte; 32]).expect("valid secret key");
    PublicKey::from_secret_key(&secp, &sk)
}

fn confidential_p2wpkh(network: Network, key_byte: u8) -> Address {
    let pk = lwk_wollet::elements::bitcoin::PublicKey::new(fixed_key(key_byte));
    Address::p2wpkh(&pk, Some(fixed_key(key_byte + 1)), network.address_params())
}

/// A confidential address no wallet account owns.
pub fn foreign_address(network: Network) -> Address {
    confidential_p2wpkh(network, 0x42)
}

fn fake_txin(seed: u32) -> TxIn {
    let mut bytes = [0xee; 32];
    bytes[..4].copy_from_slice(&seed.to_le_bytes());
    TxIn {
        previous_output: OutPoint::new(Txid::from_byte_array(bytes), 0),
        is_pegin: false,
        script_sig: Script::new(),
        sequence: Sequence::ENABLE_LOCKTIME_NO_RBF,
        asset_issuance: Default::default(),
        witness: Default::default(),
    }
}

pub fn explicit_txout(script: Script, asset: AssetId, value: u64) -> TxOut {
    TxOut {
        asset: Asset::Explicit(asset),
        value: Value::Explicit(value),
        nonce: Nonce::Null,
        script_pubkey: script,
        witness: TxOutWitness::default(),
    }
}

/// A transaction paying explicit outputs from an outpoint nobody owns.
/// Different `seed`s give different txids.
pub fn funding_tx(seed: u32, outputs: &[(Script, AssetId, u64)]) -> Transaction {
    Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: vec![fake_txin(seed)],
        output: outputs
            .iter()
            .map(|(script, asset, value)| explicit_txout(script.clone(), *asset, *value))
            .collect(),
    }
}

fn electrum_status(history: &[HistoryEntry]) -> Option<String> {
    if history.is_empty() {
        return None;
    }
    let mut hasher = Sha256::new();
    for entry in history {
        hasher.update(format!("{}:{}:", entry.txid, entry.height));
    }
    Some(hex::encode(hasher.finalize()))
}

#[derive(Default)]
struct ChainState {
    histories: HashMap<Script, Vec<HistoryEntry>>,
    transactions: HashMap<Txid, Transaction>,
    spent: HashSet<OutPoint>,
    broadcasts: Vec<Txid>,
    funding_seed: u32,
}

/// In-memory [`ChainSource`]. Transactions added through
/// [`add_transaction`](Self::add_transaction), [`fund`](Self::fund) or a
/// broadcast appear in the histories of the scripts they touch, and
/// subscribers of those scripts are notified.
pub struct MockChainSource {
    state: Mutex<ChainState>,
    subscriptions: Mutex<HashMap<Script, StatusCallback>>,
    failing_batches: AtomicU32,
    closed: AtomicBool,
    relay_fee: FeeRate,
}

impl Default for MockChainSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChainSource {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChainState::default()),
            subscriptions: Mutex::new(HashMap::new()),
            failing_batches: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            relay_fee: FeeRate::from_btc_per_kvb(MOCK_RELAY_FEE),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The next `n` batch requests fail with a transport error.
    pub fn fail_next_batches(&self, n: u32) {
        self.failing_batches.store(n, Ordering::SeqCst);
    }

    fn check_batch(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection closed".into()));
        }
        let failing = self
            .failing_batches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match failing {
            Ok(_) => Err(Error::Transport("injected batch failure".into())),
            Err(_) => Ok(()),
        }
    }

    /// Record `tx` at `height` (`None` for mempool) and notify subscribers.
    pub fn add_transaction(&self, tx: Transaction, height: Option<u32>) -> Txid {
        let txid = tx.txid();
        let entry = HistoryEntry {
            txid,
            height: height.map_or(0, |h| h as i32),
        };
        let mut touched: Vec<Script> = Vec::new();
        {
            let mut state = self.state();
            for input in &tx.input {
                state.spent.insert(input.previous_output);
                let prev_script = state
                    .transactions
                    .get(&input.previous_output.txid)
                    .and_then(|p| p.output.get(input.previous_output.vout as usize))
                    .map(|o| o.script_pubkey.clone());
                if let Some(script) = prev_script {
                    touched.push(script);
                }
            }
            touched.extend(
                tx.output
                    .iter()
                    .filter(|o| !o.script_pubkey.is_empty())
                    .map(|o| o.script_pubkey.clone()),
            );
            touched.dedup();
            for script in &touched {
                let history = state.histories.entry(script.clone()).or_default();
                history.retain(|e| e.txid != txid);
                history.push(entry.clone());
            }
            state.transactions.insert(txid, tx);
        }
        self.notify(&touched);
        txid
    }

    /// Pay `value` of `asset` to `address` in a fresh transaction.
    pub fn fund(&self, address: &Address, asset: AssetId, value: u64, height: Option<u32>) -> Txid {
        let seed = {
            let mut state = self.state();
            state.funding_seed += 1;
            state.funding_seed
        };
        let tx = funding_tx(seed, &[(address.script_pubkey(), asset, value)]);
        self.add_transaction(tx, height)
    }

    /// Move `txid` into a block at `height` everywhere it appears.
    pub fn confirm(&self, txid: &Txid, height: u32) {
        let touched: Vec<Script> = {
            let mut state = self.state();
            let mut touched = Vec::new();
            for (script, history) in state.histories.iter_mut() {
                for entry in history.iter_mut().filter(|e| e.txid == *txid) {
                    entry.height = height as i32;
                    touched.push(script.clone());
                }
            }
            touched
        };
        self.notify(&touched);
    }

    pub fn transaction(&self, txid: &Txid) -> Option<Transaction> {
        self.state().transactions.get(txid).cloned()
    }

    /// Txids accepted through `broadcast_transaction`, in order.
    pub fn broadcasts(&self) -> Vec<Txid> {
        self.state().broadcasts.clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn status_of(&self, script: &Script) -> Option<String> {
        self.state()
            .histories
            .get(script)
            .and_then(|h| electrum_status(h))
    }

    fn notify(&self, scripts: &[Script]) {
        let statuses: Vec<(Script, Option<String>)> = scripts
            .iter()
            .map(|s| (s.clone(), self.status_of(s)))
            .collect();
        let subscriptions = self.subscriptions.lock().unwrap_or_else(|p| p.into_inner());
        for (script, status) in statuses {
            if let Some(callback) = subscriptions.get(&script) {
                callback(script_hash(&script), status);
            }
        }
    }
}

impl ChainSource for MockChainSource {
    fn subscribe_script_status(&self, script: &Script, callback: StatusCallback) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Transport("connection closed".into()));
        }
        callback(script_hash(script), self.status_of(script));
        self.subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(script.clone(), callback);
        Ok(())
    }

    fn unsubscribe_script_status(&self, script: &Script) -> Result<()> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(script);
        Ok(())
    }

    fn fetch_histories(&self, scripts: &[Script]) -> Result<Vec<Vec<HistoryEntry>>> {
        self.check_batch()?;
        let state = self.state();
        Ok(scripts
            .iter()
            .map(|s| state.histories.get(s).cloned().unwrap_or_default())
            .collect())
    }

    fn fetch_transactions(&self, txids: &[Txid]) -> Result<Vec<String>> {
        self.check_batch()?;
        let state = self.state();
        txids
            .iter()
            .map(|txid| {
                state
                    .transactions
                    .get(txid)
                    .map(|tx| hex::encode(serialize(tx)))
                    .ok_or_else(|| Error::Protocol(format!("unknown transaction {txid}")))
            })
            .collect()
    }

    fn fetch_block_header(&self, height: u32) -> Result<BlockHeader> {
        Ok(BlockHeader {
            version: 0x2000_0000,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_700_000_000 + height * 60,
            height,
            ext: BlockExtData::Proof {
                challenge: Script::new(),
                solution: Script::new(),
            },
        })
    }

    fn estimate_fees(&self, _target_blocks: usize) -> Result<FeeRate> {
        Ok(self.relay_fee)
    }

    fn broadcast_transaction(&self, tx_hex: &str) -> Result<Txid> {
        let bytes = hex::decode(tx_hex).map_err(|e| Error::RelayRejected(e.to_string()))?;
        let tx: Transaction =
            deserialize(&bytes).map_err(|e| Error::RelayRejected(e.to_string()))?;
        {
            let state = self.state();
            if let Some(input) = tx.input.iter().find(|i| state.spent.contains(&i.previous_output)) {
                return Err(Error::RelayRejected(format!(
                    "bad-txns-inputs-missingorspent: {}",
                    input.previous_output
                )));
            }
        }
        let txid = self.add_transaction(tx, None);
        self.state().broadcasts.push(txid);
        Ok(txid)
    }

    fn get_relay_fee(&self) -> Result<FeeRate> {
        Ok(self.relay_fee)
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        Ok(())
    }
}

/// Fee sponsor that answers every request with a partial PSET: one explicit
/// policy-asset input, the sponsor's payment output in the requested
/// asset, its change and the fee output.
pub struct MockFeeSponsor {
    network: Network,
    fee_asset: AssetId,
    amount: u64,
    input_value: u64,
    signs_inputs: bool,
    requests: Mutex<Vec<TopupRequest>>,
}

impl MockFeeSponsor {
    pub fn new(network: Network, fee_asset: AssetId, amount: u64) -> Self {
        Self {
            network,
            fee_asset,
            amount,
            input_value: 100_000,
            signs_inputs: true,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A sponsor whose partial inputs come without a final witness.
    pub fn unsigned(mut self) -> Self {
        self.signs_inputs = false;
        self
    }

    pub fn requests(&self) -> Vec<TopupRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn partial_inputs(&self) -> usize {
        1
    }

    pub fn partial_outputs(&self) -> usize {
        3
    }

    fn sponsor_input(&self) -> (OutPoint, TxOut) {
        let script = confidential_p2wpkh(self.network, 0x61).script_pubkey();
        let outpoint = OutPoint::new(Txid::from_byte_array([0x7a; 32]), 1);
        let prevout = explicit_txout(script, self.network.policy_asset(), self.input_value);
        (outpoint, prevout)
    }
}

impl FeeSponsor for MockFeeSponsor {
    fn request_topup(&self, request: &TopupRequest) -> Result<Topup> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(*request);
        if request.asset != self.fee_asset {
            return Err(Error::Taxi(format!("asset {} is not supported", request.asset)));
        }
        let fee = (request.estimated_tx_size * request.millisat_per_byte).div_ceil(1000);
        let policy = self.network.policy_asset();

        let (outpoint, prevout) = self.sponsor_input();
        let mut partial = new_pset();
        // The mock chain never checks scripts, so a placeholder witness
        // stands in for the sponsor's signature.
        let final_script_witness = self
            .signs_inputs
            .then(|| vec![vec![0x30; 72], fixed_key(0x61).serialize().to_vec()]);
        partial.add_input(lwk_wollet::elements::pset::Input {
            previous_txid: outpoint.txid,
            previous_output_index: outpoint.vout,
            witness_utxo: Some(prevout),
            sequence: Some(Sequence::ENABLE_LOCKTIME_NO_RBF),
            final_script_witness,
            ..Default::default()
        });
        let payee = confidential_p2wpkh(self.network, 0x63);
        partial.add_output(address_output(&payee, self.amount, self.fee_asset, 0));
        let change = confidential_p2wpkh(self.network, 0x65);
        partial.add_output(address_output(&change, self.input_value - fee, policy, 0));
        partial.add_output(fee_output(fee, policy));

        Ok(Topup {
            topup_id: format!("mock-{}", self.requests().len()),
            partial,
            asset: self.fee_asset,
            asset_amount: self.amount,
            asset_spread: 0,
            expiry: u64::MAX,
            input_blinding_data: vec![UnblindingData::explicit(policy, self.input_value)],
        })
    }
}

/// A regtest wallet whose test account already owns some outputs.
pub struct FundedWallet {
    pub network: Network,
    pub store: MemoryStore,
    pub reservations: Reservations,
    pub chain: MockChainSource,
    pub account: Account,
}

impl FundedWallet {
    pub fn builder(&self) -> PsetBuilder<'_> {
        PsetBuilder::new(
            &self.store,
            &self.chain,
            &self.reservations,
            self.network,
            vec![self.account.clone()],
        )
        .expect("test account spends on regtest")
    }
}

/// The test account on regtest, persisted in `store`.
pub fn test_account(store: &dyn WalletRepository) -> Account {
    let sealed = EncryptedMnemonic::encrypt(TEST_MNEMONIC, TEST_PASSWORD).expect("encrypt");
    let details = default_accounts(TEST_MNEMONIC, &sealed)
        .expect("derive accounts")
        .into_iter()
        .find(|d| d.id == MAIN_ACCOUNT_TEST)
        .expect("test account exists");
    store
        .update_account_details(details.clone())
        .expect("store account");
    Account::from_details(details).expect("standard account")
}

/// Wallet holding one policy-asset output per entry of `values`.
pub fn funded_wallet(values: &[u64]) -> FundedWallet {
    let policy = Network::LiquidRegtest.policy_asset();
    let outputs: Vec<(AssetId, u64)> = values.iter().map(|v| (policy, *v)).collect();
    funded_wallet_with(&outputs)
}

/// Wallet holding one output per `(asset, value)`, all created by a single
/// confirmed funding transaction.
pub fn funded_wallet_with(outputs: &[(AssetId, u64)]) -> FundedWallet {
    let network = Network::LiquidRegtest;
    let store = MemoryStore::new();
    let account = test_account(&store);
    let chain = MockChainSource::new();

    let paid: Vec<(Script, AssetId, u64)> = outputs
        .iter()
        .map(|(asset, value)| {
            let address = account
                .next_address(&store, network, Chain::External, None)
                .expect("issue address");
            (address.script, *asset, *value)
        })
        .collect();
    let tx = funding_tx(0, &paid);
    chain.add_transaction(tx.clone(), Some(1));

    let identity = account.watch_identity(network).expect("watch identity");
    UtxoUpdater::new(&store, network, [identity])
        .apply(&[(tx, Some(1))])
        .expect("apply funding");

    FundedWallet {
        network,
        store,
        reservations: Reservations::new(),
        chain,
        account,
    }
}
