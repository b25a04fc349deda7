use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use tidewallet_lib::{
    Connection, HostConfig, WalletError, WalletManager, WalletNotification, WalletStatus,
};
use tidewallet_sdk::elements::Address;
use tidewallet_sdk::testing::{MockChainSource, TEST_MNEMONIC, TEST_PASSWORD};
use tidewallet_sdk::Network;

// ── Helpers ──────────────────────────────────────────────────────────────

fn regtest_manager(dir: &Path, chain: Arc<MockChainSource>) -> WalletManager {
    HostConfig {
        network: Network::LiquidRegtest,
        ..HostConfig::default()
    }
    .save(dir)
    .unwrap();
    WalletManager::new(dir).with_connector(move |_config| {
        Ok(Connection {
            chain: chain.clone(),
            sponsor: None,
        })
    })
}

async fn next_notification(rx: &mut mpsc::UnboundedReceiver<WalletNotification>) -> WalletNotification {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("notification within timeout")
        .expect("sink open")
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn fresh_data_dir_has_no_wallet() {
    let dir = tempfile::tempdir().unwrap();
    let manager = WalletManager::new(dir.path());
    assert_eq!(manager.status(), WalletStatus::NotCreated);
    assert_eq!(manager.network(), Network::Liquid);
    assert!(matches!(
        manager.unlock(TEST_PASSWORD).await,
        Err(WalletError::NotCreated)
    ));

    let state = manager.state().await;
    assert_eq!(state.wallet_status, WalletStatus::NotCreated);
    assert!(state.wallet_balance.is_none());
    assert!(state.network_status.is_mainnet);
}

#[tokio::test]
async fn create_lock_and_unlock() {
    let dir = tempfile::tempdir().unwrap();
    let manager = regtest_manager(dir.path(), Arc::new(MockChainSource::new()));

    let mnemonic = manager.create_wallet(TEST_PASSWORD).await.unwrap();
    assert_eq!(mnemonic.split_whitespace().count(), 12);
    assert_eq!(manager.status(), WalletStatus::Unlocked);
    assert!(matches!(
        manager.create_wallet(TEST_PASSWORD).await,
        Err(WalletError::AlreadyExists)
    ));

    manager.lock();
    assert_eq!(manager.status(), WalletStatus::Locked);
    assert!(matches!(
        manager.unlock("wrong password").await,
        Err(WalletError::Engine(tidewallet_sdk::Error::InvalidPassword))
    ));
    assert_eq!(manager.status(), WalletStatus::Locked);

    manager.unlock(TEST_PASSWORD).await.unwrap();
    assert_eq!(manager.status(), WalletStatus::Unlocked);
}

#[tokio::test]
async fn restore_rejects_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let manager = regtest_manager(dir.path(), Arc::new(MockChainSource::new()));
    assert!(matches!(
        manager.restore_wallet("not a mnemonic", TEST_PASSWORD).await,
        Err(WalletError::InvalidMnemonic)
    ));
    assert_eq!(manager.status(), WalletStatus::NotCreated);
}

#[tokio::test]
async fn incoming_funds_are_announced() {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(MockChainSource::new());
    let manager = regtest_manager(dir.path(), chain.clone());
    manager
        .restore_wallet(TEST_MNEMONIC, TEST_PASSWORD)
        .await
        .unwrap();
    manager.sync().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _forwarder = manager.forward_notifications(move |n| {
        let _ = tx.send(n);
    });

    let address = manager.address().await.unwrap();
    assert_eq!(address.index, 0);
    let address: Address = address.address.parse().unwrap();
    let txid = chain.fund(&address, Network::LiquidRegtest.policy_asset(), 42_000, None);

    let mut seen = Vec::new();
    while !seen.contains(&WalletNotification::NewTx {
        txid: txid.to_string(),
    }) {
        seen.push(next_notification(&mut rx).await);
    }
    assert!(seen.contains(&WalletNotification::NewUtxo {
        txid: txid.to_string(),
        vout: 0
    }));

    let balance = manager.balance().await.unwrap();
    let policy = Network::LiquidRegtest.policy_asset().to_string();
    assert_eq!(balance.assets[&policy], 42_000);
    let txs = manager.transactions().await.unwrap();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].balance_change, 42_000);
    assert_eq!(txs[0].tx_type, "deposit");

    let state = manager.state().await;
    assert_eq!(state.wallet_status, WalletStatus::Unlocked);
    assert_eq!(state.wallet_balance.unwrap().assets[&policy], 42_000);
}

#[tokio::test]
async fn network_switch_is_persisted_and_announced() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = regtest_manager(dir.path(), Arc::new(MockChainSource::new()));
    manager
        .restore_wallet(TEST_MNEMONIC, TEST_PASSWORD)
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _forwarder = manager.forward_notifications(move |n| {
        let _ = tx.send(n);
    });

    manager.set_network(Network::LiquidTestnet).await.unwrap();
    assert_eq!(
        next_notification(&mut rx).await,
        WalletNotification::Network {
            network: Network::LiquidTestnet
        }
    );
    assert_eq!(HostConfig::load(dir.path()).network, Network::LiquidTestnet);
    assert_eq!(manager.network_status().network, "testnet");
}
