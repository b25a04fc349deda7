//! Wallet events derived by diffing successive state snapshots.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use lwk_wollet::elements::{OutPoint, Txid};
use tokio::sync::broadcast;

use crate::network::Network;
use crate::store::{TxRecord, Utxo};

/// Point-in-time view of the state observers care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletSnapshot {
    pub network: Network,
    pub utxos: HashMap<OutPoint, Utxo>,
    pub transactions: HashMap<Txid, TxRecord>,
    /// Hostnames allowed to talk to the wallet, per network.
    pub enabled_sites: BTreeMap<Network, BTreeSet<String>>,
}

impl WalletSnapshot {
    pub fn empty(network: Network) -> Self {
        Self {
            network,
            utxos: HashMap::new(),
            transactions: HashMap::new(),
            enabled_sites: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    NewUtxo(Utxo),
    SpentUtxo(OutPoint),
    NewTx(TxRecord),
    Enabled { network: Network, hostname: String },
    Disabled { network: Network, hostname: String },
    Network(Network),
}

pub fn compare_utxos<'a>(
    old: &'a HashMap<OutPoint, Utxo>,
    new: &'a HashMap<OutPoint, Utxo>,
) -> impl Iterator<Item = WalletEvent> + 'a {
    let added = new
        .iter()
        .filter(|(o, _)| !old.contains_key(*o))
        .map(|(_, u)| WalletEvent::NewUtxo(u.clone()));
    let spent = old
        .keys()
        .filter(|o| !new.contains_key(*o))
        .map(|o| WalletEvent::SpentUtxo(*o));
    added.chain(spent)
}

pub fn compare_transactions<'a>(
    old: &'a HashMap<Txid, TxRecord>,
    new: &'a HashMap<Txid, TxRecord>,
) -> impl Iterator<Item = WalletEvent> + 'a {
    new.iter()
        .filter(|(id, _)| !old.contains_key(*id))
        .map(|(_, tx)| WalletEvent::NewTx(tx.clone()))
}

/// Enable/disable transitions, keeping only those for `hostname`.
pub fn compare_enabled_sites<'a>(
    old: &'a BTreeMap<Network, BTreeSet<String>>,
    new: &'a BTreeMap<Network, BTreeSet<String>>,
    hostname: &'a str,
) -> impl Iterator<Item = WalletEvent> + 'a {
    let empty: &'a BTreeSet<String> = empty_set();
    Network::ALL.into_iter().flat_map(move |network| {
        let before = old.get(&network).unwrap_or(empty);
        let after = new.get(&network).unwrap_or(empty);
        let enabled = (!before.contains(hostname) && after.contains(hostname)).then(|| {
            WalletEvent::Enabled {
                network,
                hostname: hostname.to_string(),
            }
        });
        let disabled = (before.contains(hostname) && !after.contains(hostname)).then(|| {
            WalletEvent::Disabled {
                network,
                hostname: hostname.to_string(),
            }
        });
        enabled.into_iter().chain(disabled)
    })
}

fn empty_set() -> &'static BTreeSet<String> {
    static EMPTY: BTreeSet<String> = BTreeSet::new();
    &EMPTY
}

pub fn network_change(old: Network, new: Network) -> Option<WalletEvent> {
    (old != new).then_some(WalletEvent::Network(new))
}

/// Every event separating `old` from `new`. Site events are only produced
/// when a current `hostname` is given.
pub fn diff<'a>(
    old: &'a WalletSnapshot,
    new: &'a WalletSnapshot,
    hostname: Option<&'a str>,
) -> impl Iterator<Item = WalletEvent> + 'a {
    let sites = hostname
        .into_iter()
        .flat_map(move |h| compare_enabled_sites(&old.enabled_sites, &new.enabled_sites, h));
    compare_utxos(&old.utxos, &new.utxos)
        .chain(compare_transactions(&old.transactions, &new.transactions))
        .chain(sites)
        .chain(network_change(old.network, new.network))
}

/// Remembers the last published snapshot and broadcasts the events that
/// lead to each new one.
pub struct EventEmitter {
    last: Option<WalletSnapshot>,
    hostname: Option<String>,
    tx: broadcast::Sender<WalletEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<WalletEvent>) {
        let (tx, rx) = broadcast::channel(capacity);
        (
            Self {
                last: None,
                hostname: None,
                tx,
            },
            rx,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.tx.subscribe()
    }

    /// Site events are filtered to this hostname.
    pub fn set_hostname(&mut self, hostname: Option<String>) {
        self.hostname = hostname;
    }

    /// Publish the events since the previous snapshot (or since an empty
    /// wallet, the first time). Returns the number of events.
    pub fn publish(&mut self, snapshot: WalletSnapshot) -> usize {
        let baseline = self
            .last
            .take()
            .unwrap_or_else(|| WalletSnapshot::empty(snapshot.network));
        let mut count = 0;
        for event in diff(&baseline, &snapshot, self.hostname.as_deref()) {
            count += 1;
            // No receivers is fine.
            let _ = self.tx.send(event);
        }
        if count > 0 {
            log::debug!("published {count} wallet events");
        }
        self.last = Some(snapshot);
        count
    }
}
