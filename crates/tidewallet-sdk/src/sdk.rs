use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use lwk_signer::SwSigner;
use lwk_wollet::elements::encode::deserialize;
use lwk_wollet::elements::pset::PartiallySignedTransaction;
use lwk_wollet::elements::{AssetId, OutPoint, Script, Transaction, Txid};
use tokio::sync::{broadcast, mpsc};
use zeroize::Zeroizing;

use crate::account::{
    covenant_account, default_accounts, named_account, Account, AccountDetails, AccountId,
    AccountType, Chain, ConstructorArgs, CovenantTemplate, DerivedAddress, NextKeyIndexes,
    SigningIdentity, WatchIdentity, MAIN_ACCOUNT, MAIN_ACCOUNT_TEST,
};
use crate::blinder;
use crate::chain::{ChainSource, ElectrumChainSource};
use crate::coin_selection::{Reservation, Reservations};
use crate::config::WalletConfig;
use crate::error::{Error, Result};
use crate::events::{EventEmitter, WalletEvent, WalletSnapshot};
use crate::history::{self, TxDetails};
use crate::mnemonic::EncryptedMnemonic;
use crate::network::Network;
use crate::pset::{BuiltPset, PsetBuilder, SpendRequest};
use crate::restorer::{DeepRestorer, RestoreOutcome, ScriptActivity};
use crate::signer;
use crate::store::{Utxo, WalletRepository};
use crate::taxi::{FeeSponsor, TaxiClient};
use crate::updater::{UpdateSummary, UtxoUpdater};

/// Buffered wallet events per subscriber before the slowest one lags.
pub const EVENT_CAPACITY: usize = 256;

/// Result of a successful send.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub txid: Txid,
    /// See [`BuiltPset::fee_amount`].
    pub fee_amount: u64,
    pub fee_asset: AssetId,
    pub tx_hex: String,
}

fn decode_transaction(txid: &Txid, hex_tx: &str) -> Result<Transaction> {
    let bytes = hex::decode(hex_tx)
        .map_err(|e| Error::Protocol(format!("bad transaction hex for {txid}: {e}")))?;
    deserialize(&bytes).map_err(|e| Error::Protocol(format!("bad transaction {txid}: {e}")))
}

/// One wallet session on one network: owns the store handle, the chain
/// connection, the in-flight coin reservations and the event emitter.
pub struct TideSdk {
    config: WalletConfig,
    store: Arc<dyn WalletRepository>,
    chain: Arc<dyn ChainSource>,
    sponsor: Option<Arc<dyn FeeSponsor>>,
    reservations: Reservations,
    emitter: EventEmitter,
    enabled_sites: BTreeMap<Network, BTreeSet<String>>,
    activity_tx: mpsc::UnboundedSender<ScriptActivity>,
    activity_rx: Option<mpsc::UnboundedReceiver<ScriptActivity>>,
}

impl TideSdk {
    pub fn new(
        config: WalletConfig,
        store: Arc<dyn WalletRepository>,
        chain: Arc<dyn ChainSource>,
    ) -> Self {
        let (emitter, _) = EventEmitter::new(EVENT_CAPACITY);
        let (activity_tx, activity_rx) = mpsc::unbounded_channel();
        Self {
            config,
            store,
            chain,
            sponsor: None,
            reservations: Reservations::new(),
            emitter,
            enabled_sites: BTreeMap::new(),
            activity_tx,
            activity_rx: Some(activity_rx),
        }
    }

    /// Session against the configured Electrum server and fee sponsor.
    pub fn connect(config: WalletConfig, store: Arc<dyn WalletRepository>) -> Result<Self> {
        let chain = Arc::new(ElectrumChainSource::new(config.electrum_url()));
        let sponsor = Arc::new(TaxiClient::new(config.taxi_url())?);
        log::info!(
            "wallet session on {} via {}",
            config.network,
            config.electrum_url()
        );
        Ok(Self::new(config, store, chain).with_sponsor(sponsor))
    }

    pub fn with_sponsor(mut self, sponsor: Arc<dyn FeeSponsor>) -> Self {
        self.sponsor = Some(sponsor);
        self
    }

    pub fn generate_mnemonic(network: Network) -> Result<String> {
        let (_, mnemonic) =
            SwSigner::random(network.is_mainnet()).map_err(|e| Error::Signer(e.to_string()))?;
        Ok(mnemonic.to_string())
    }

    pub fn network(&self) -> Network {
        self.config.network
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn WalletRepository {
        &*self.store
    }

    pub fn chain(&self) -> &dyn ChainSource {
        &*self.chain
    }

    pub fn reservations(&self) -> &Reservations {
        &self.reservations
    }

    // ── Accounts ─────────────────────────────────────────────────────────

    /// Seal `mnemonic` with `password` and store the default accounts that
    /// are not stored yet. Returns the ids of the accounts added.
    pub fn restore_wallet(&self, mnemonic: &str, password: &str) -> Result<Vec<AccountId>> {
        let sealed = EncryptedMnemonic::encrypt(mnemonic, password)?;
        let mut added = Vec::new();
        for details in default_accounts(mnemonic, &sealed)? {
            if self.store.get_account_details(&details.id)?.is_some() {
                continue;
            }
            added.push(details.id.clone());
            self.store.update_account_details(details)?;
        }
        log::info!("stored accounts {added:?}");
        Ok(added)
    }

    fn unlock_mnemonic(&self, password: &str) -> Result<(EncryptedMnemonic, Zeroizing<String>)> {
        let any = self
            .store
            .list_accounts()?
            .into_iter()
            .next()
            .ok_or_else(|| Error::UnknownAccount("wallet has no accounts".into()))?;
        let mnemonic = any.encrypted_mnemonic.decrypt(password)?;
        Ok((any.encrypted_mnemonic, mnemonic))
    }

    fn insert_new_account(&self, details: AccountDetails) -> Result<AccountId> {
        if self.store.get_account_details(&details.id)?.is_some() {
            return Err(Error::AccountExists(details.id));
        }
        let id = details.id.clone();
        self.store.update_account_details(details)?;
        log::info!("created account {id}");
        Ok(id)
    }

    /// Standard account at the SLIP-13 path of `name`.
    pub fn create_account(&self, name: &str, password: &str) -> Result<AccountId> {
        let (sealed, mnemonic) = self.unlock_mnemonic(password)?;
        self.insert_new_account(named_account(name, &mnemonic, &sealed)?)
    }

    pub fn create_covenant_account(
        &self,
        name: &str,
        password: &str,
        template: CovenantTemplate,
    ) -> Result<AccountId> {
        let (sealed, mnemonic) = self.unlock_mnemonic(password)?;
        self.insert_new_account(covenant_account(name, &mnemonic, &sealed, template)?)
    }

    pub fn account(&self, id: &str) -> Result<Account> {
        let details = self
            .store
            .get_account_details(id)?
            .ok_or_else(|| Error::UnknownAccount(id.to_string()))?;
        Account::from_details(details)
    }

    /// Accounts usable on the session's network.
    pub fn accounts(&self) -> Result<Vec<Account>> {
        let network = self.network();
        self.store
            .list_accounts()?
            .into_iter()
            .map(Account::from_details)
            .filter(|a| a.as_ref().map_or(true, |a| a.is_valid_on(network)))
            .collect()
    }

    /// The account that pays and receives change when a request names none.
    pub fn main_account_id(&self) -> &'static str {
        if self.network().is_mainnet() {
            MAIN_ACCOUNT
        } else {
            MAIN_ACCOUNT_TEST
        }
    }

    fn watch_identities(&self) -> Result<Vec<WatchIdentity>> {
        self.accounts()?
            .iter()
            .map(|a| a.watch_identity(self.network()))
            .collect()
    }

    // ── Addresses ────────────────────────────────────────────────────────

    /// Issue the next address of `chain` and watch its script.
    pub fn next_address(
        &self,
        account_id: &str,
        chain: Chain,
        args: Option<&ConstructorArgs>,
    ) -> Result<DerivedAddress> {
        let account = self.account(account_id)?;
        let address = account.next_address(&*self.store, self.network(), chain, args)?;
        self.watch_script(account_id, &address.script);
        Ok(address)
    }

    fn watch_script(&self, account_id: &str, script: &Script) {
        let sink = self.activity_tx.clone();
        let activity = ScriptActivity {
            network: self.network(),
            account_id: account_id.to_string(),
            script: script.clone(),
            status: None,
        };
        let subscribed = self.chain.subscribe_script_status(
            script,
            Box::new(move |_hash, status| {
                let _ = sink.send(ScriptActivity {
                    status,
                    ..activity.clone()
                });
            }),
        );
        if let Err(e) = subscribed {
            log::warn!("cannot watch new script of {account_id}: {e}");
        }
    }

    // ── Sync ─────────────────────────────────────────────────────────────

    fn restorer(&self) -> DeepRestorer<'_> {
        DeepRestorer::new(&*self.chain, &*self.store)
            .with_batch_retries(self.config.batch_retries)
            .with_activity_sink(self.activity_tx.clone())
    }

    /// Deep-restore one account. `start` forces a re-restore from the given
    /// indexes.
    pub fn sync(&self, account_id: &str, start: Option<NextKeyIndexes>) -> Result<RestoreOutcome> {
        let account = self.account(account_id)?;
        account.sync(&self.restorer(), self.network(), self.config.gap_limit, start)
    }

    /// Deep-restore every restorable account of the network. Covenant
    /// accounts are skipped.
    pub fn sync_all(&self) -> Result<Vec<RestoreOutcome>> {
        let restorer = self.restorer();
        let mut outcomes = Vec::new();
        for account in self.accounts()? {
            if account.account_type() == AccountType::Covenant {
                log::debug!("skipping restore of covenant account {}", account.id());
                continue;
            }
            outcomes.push(account.sync(&restorer, self.network(), self.config.gap_limit, None)?);
        }
        Ok(outcomes)
    }

    /// Forget the network's outputs and transactions, then restore every
    /// account from index zero.
    pub fn resync(&self) -> Result<Vec<RestoreOutcome>> {
        self.store.clear_network(self.network())?;
        let restorer = self.restorer();
        let mut outcomes = Vec::new();
        for account in self.accounts()? {
            if account.account_type() == AccountType::Covenant {
                continue;
            }
            outcomes.push(account.sync(
                &restorer,
                self.network(),
                self.config.gap_limit,
                Some(NextKeyIndexes::default()),
            )?);
        }
        Ok(outcomes)
    }

    /// Status changes of watched scripts, once per session.
    pub fn take_script_activity(&mut self) -> Option<mpsc::UnboundedReceiver<ScriptActivity>> {
        self.activity_rx.take()
    }

    /// Bring one script's transactions up to date after a status change.
    pub fn update_script(&self, script: &Script) -> Result<UpdateSummary> {
        let network = self.network();
        let history = self
            .chain
            .fetch_histories(std::slice::from_ref(script))?
            .into_iter()
            .next()
            .unwrap_or_default();

        let mut heights = HashMap::new();
        for entry in &history {
            let height = entry.confirmed_height();
            match self.store.get_transaction(network, &entry.txid)? {
                Some(record) if record.height == height => {}
                Some(mut record) => {
                    record.height = height;
                    self.store.add_transaction(network, record.clone())?;
                    self.set_utxo_heights(&record.tx, height)?;
                }
                None => {
                    heights.insert(entry.txid, height);
                }
            }
        }
        if heights.is_empty() {
            return Ok(UpdateSummary::default());
        }

        let txids: Vec<Txid> = heights.keys().copied().collect();
        let raw = self.chain.fetch_transactions(&txids)?;
        let mut txs = txids
            .iter()
            .zip(&raw)
            .map(|(txid, hex_tx)| Ok((decode_transaction(txid, hex_tx)?, heights[txid])))
            .collect::<Result<Vec<_>>>()?;
        txs.sort_by_key(|(_, h)| h.unwrap_or(u32::MAX));
        UtxoUpdater::new(&*self.store, network, self.watch_identities()?).apply(&txs)
    }

    fn set_utxo_heights(&self, tx: &Transaction, height: Option<u32>) -> Result<()> {
        let txid = tx.txid();
        for vout in 0..tx.output.len() {
            let outpoint = OutPoint::new(txid, vout as u32);
            if let Some(mut utxo) = self.store.get_utxo(self.network(), &outpoint)? {
                utxo.height = height;
                self.store.add_utxo(self.network(), utxo)?;
            }
        }
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// UTXOs of `accounts`, or of every account when empty.
    pub fn utxos(&self, accounts: &[AccountId]) -> Result<Vec<Utxo>> {
        Ok(self.store.get_utxos(self.network(), accounts)?)
    }

    pub fn balances(&self) -> Result<HashMap<AssetId, u64>> {
        Ok(history::balances(&self.utxos(&[])?))
    }

    /// Wallet history, mempool first, then newest block first.
    pub fn transactions(&self) -> Result<Vec<TxDetails>> {
        let network = self.network();
        let mut details = self
            .store
            .get_transactions(network)?
            .iter()
            .map(|record| history::classify(record, &*self.store, network))
            .collect::<Result<Vec<_>>>()?;
        details.sort_by_key(|d| std::cmp::Reverse(d.height.unwrap_or(u32::MAX)));
        Ok(details)
    }

    pub fn explorer_url(&self, txid: &Txid) -> Result<String> {
        let record = self
            .store
            .get_transaction(self.network(), txid)?
            .ok_or_else(|| Error::Protocol(format!("unknown transaction {txid}")))?;
        history::explorer_url_with_blinders(
            self.network().explorer_url(),
            &record.tx,
            &*self.store,
            self.network(),
        )
    }

    // ── Spending ─────────────────────────────────────────────────────────

    fn spend_accounts(&self, ids: &[AccountId]) -> Result<Vec<Account>> {
        if ids.is_empty() {
            return Ok(vec![self.account(self.main_account_id())?]);
        }
        ids.iter().map(|id| self.account(id)).collect()
    }

    /// Select coins and build an unsigned, unblinded PSET. The selected
    /// outpoints stay reserved until the returned reservation is consumed
    /// or dropped.
    pub fn create_pset(&self, request: &SpendRequest) -> Result<BuiltPset> {
        let builder = PsetBuilder::new(
            &*self.store,
            &*self.chain,
            &self.reservations,
            self.network(),
            self.spend_accounts(&request.accounts)?,
        )?
        .with_fee_multiplier(self.config.fee_multiplier);
        let builder = match &self.sponsor {
            Some(sponsor) => builder.with_sponsor(sponsor.as_ref()),
            None => builder,
        };
        builder.create_pset(request)
    }

    pub fn blind(&self, pset: &mut PartiallySignedTransaction) -> Result<()> {
        blinder::blind(pset, &*self.store, self.network())
    }

    /// Index and owning account of every `pset` input spending a wallet
    /// coin.
    fn wallet_inputs(
        &self,
        pset: &PartiallySignedTransaction,
    ) -> Result<Vec<(usize, AccountId)>> {
        let mut owned = Vec::new();
        for (index, input) in pset.inputs().iter().enumerate() {
            let outpoint = OutPoint::new(input.previous_txid, input.previous_output_index);
            if let Some(utxo) = self.store.get_utxo(self.network(), &outpoint)? {
                owned.push((index, utxo.account_id));
            }
        }
        Ok(owned)
    }

    /// Signing identities of the accounts owning `pset`'s wallet inputs.
    fn signing_identities(
        &self,
        pset: &PartiallySignedTransaction,
        password: &str,
    ) -> Result<Vec<SigningIdentity>> {
        let mut owners: Vec<AccountId> = Vec::new();
        for (_, account_id) in self.wallet_inputs(pset)? {
            if !owners.contains(&account_id) {
                owners.push(account_id);
            }
        }
        owners
            .iter()
            .map(|id| self.account(id)?.signing_identity(self.network(), password))
            .collect()
    }

    /// Sign with every account involved; succeeds only once all inputs
    /// validate.
    pub fn sign(&self, pset: &mut PartiallySignedTransaction, password: &str) -> Result<()> {
        let identities = self.signing_identities(pset, password)?;
        signer::sign(pset, &identities, self.network().genesis_hash())
    }

    /// Sign and validate only the wallet's own inputs. Inputs contributed
    /// by a fee sponsor are left for the sponsor to sign.
    pub fn sign_wallet_inputs(
        &self,
        pset: &mut PartiallySignedTransaction,
        password: &str,
    ) -> Result<()> {
        let identities = self.signing_identities(pset, password)?;
        let ours: Vec<usize> = self.wallet_inputs(pset)?.into_iter().map(|(i, _)| i).collect();
        signer::sign_inputs(pset, &identities, self.network().genesis_hash(), &ours)
    }

    /// Inputs that are not the wallet's must come finalized or carry valid
    /// signatures already.
    fn check_foreign_inputs(&self, pset: &PartiallySignedTransaction) -> Result<()> {
        let ours: Vec<usize> = self.wallet_inputs(pset)?.into_iter().map(|(i, _)| i).collect();
        let unsigned: Vec<usize> = (0..pset.n_inputs())
            .filter(|i| !ours.contains(i) && !signer::is_finalized(&pset.inputs()[*i]))
            .collect();
        signer::validate_inputs(pset, self.network().genesis_hash(), &unsigned)
            .map_err(|e| Error::Taxi(format!("sponsor inputs are not signed: {e}")))
    }

    pub fn finalize_and_extract(&self, pset: &mut PartiallySignedTransaction) -> Result<String> {
        signer::finalize_and_extract(pset, self.network().genesis_hash())
    }

    /// Broadcast `tx_hex`. On success the reservation is consumed and the
    /// transaction applied locally, so spent outputs disappear and change
    /// shows up before the next sync. On failure the reservation is
    /// released.
    pub fn broadcast(&self, tx_hex: &str, reservation: Reservation) -> Result<Txid> {
        let txid = self.chain.broadcast_transaction(tx_hex)?;
        reservation.consume();
        let tx = decode_transaction(&txid, tx_hex)?;
        UtxoUpdater::new(&*self.store, self.network(), self.watch_identities()?)
            .apply(&[(tx, None)])?;
        log::info!("broadcast {txid}");
        Ok(txid)
    }

    /// Build, blind, sign, finalize and broadcast in one go. A sponsored
    /// spend signs only the wallet's inputs and expects the sponsor's to
    /// arrive signed.
    pub fn send(&self, request: &SpendRequest, password: &str) -> Result<SendResult> {
        let BuiltPset {
            mut pset,
            fee_amount,
            fee_asset,
            reservation,
        } = self.create_pset(request)?;
        self.blind(&mut pset)?;
        if fee_asset == self.network().policy_asset() {
            self.sign(&mut pset, password)?;
        } else {
            self.sign_wallet_inputs(&mut pset, password)?;
            self.check_foreign_inputs(&pset)?;
        }
        let tx_hex = self.finalize_and_extract(&mut pset)?;
        let txid = self.broadcast(&tx_hex, reservation)?;
        Ok(SendResult {
            txid,
            fee_amount,
            fee_asset,
            tx_hex,
        })
    }

    // ── Sites and events ─────────────────────────────────────────────────

    pub fn enable_site(&mut self, network: Network, hostname: &str) {
        self.enabled_sites
            .entry(network)
            .or_default()
            .insert(hostname.to_string());
    }

    pub fn disable_site(&mut self, network: Network, hostname: &str) {
        if let Some(sites) = self.enabled_sites.get_mut(&network) {
            sites.remove(hostname);
        }
    }

    pub fn is_site_enabled(&self, network: Network, hostname: &str) -> bool {
        self.enabled_sites
            .get(&network)
            .is_some_and(|s| s.contains(hostname))
    }

    /// Site events are only published for this hostname.
    pub fn set_current_hostname(&mut self, hostname: Option<String>) {
        self.emitter.set_hostname(hostname);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<WalletEvent> {
        self.emitter.subscribe()
    }

    pub fn snapshot(&self) -> Result<WalletSnapshot> {
        let network = self.network();
        Ok(WalletSnapshot {
            network,
            utxos: self
                .store
                .get_utxos(network, &[])?
                .into_iter()
                .map(|u| (u.outpoint, u))
                .collect(),
            transactions: self
                .store
                .get_transactions(network)?
                .into_iter()
                .map(|t| (t.txid, t))
                .collect(),
            enabled_sites: self.enabled_sites.clone(),
        })
    }

    /// Publish whatever changed since the previous call. Returns the number
    /// of events sent.
    pub fn publish_events(&mut self) -> Result<usize> {
        let snapshot = self.snapshot()?;
        Ok(self.emitter.publish(snapshot))
    }

    /// Move the session to `network` over `chain`, with `sponsor` as the
    /// new network's fee sponsor. The old connection is closed and
    /// in-flight reservations are forgotten.
    pub fn switch_network(
        &mut self,
        network: Network,
        chain: Arc<dyn ChainSource>,
        sponsor: Option<Arc<dyn FeeSponsor>>,
    ) -> Result<()> {
        if network == self.network() {
            return Ok(());
        }
        if let Err(e) = self.chain.close() {
            log::warn!("closing {} connection: {e}", self.network());
        }
        self.chain = chain;
        self.sponsor = sponsor;
        self.config.network = network;
        self.reservations = Reservations::new();
        log::info!("switched to {network}");
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        log::info!("closing wallet session on {}", self.network());
        self.chain.close()
    }
}
