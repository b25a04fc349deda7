use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use tidewallet_sdk::account::Chain;
use tidewallet_sdk::testing::{foreign_address, MockChainSource, TEST_MNEMONIC, TEST_PASSWORD};
use tidewallet_sdk::{
    AddressRecipient, MemoryStore, Network, NodeError, SpendRequest, TideNode, TideSdk,
    WalletConfig, WalletEvent,
};

const NETWORK: Network = Network::LiquidRegtest;

fn session() -> (TideSdk, Arc<MockChainSource>) {
    let chain = Arc::new(MockChainSource::new());
    let sdk = TideSdk::new(
        WalletConfig::new(NETWORK),
        Arc::new(MemoryStore::new()),
        chain.clone(),
    );
    sdk.restore_wallet(TEST_MNEMONIC, TEST_PASSWORD).unwrap();
    (sdk, chain)
}

/// Wait for the first event accepted by `pred`, skipping the others.
async fn wait_for(
    rx: &mut broadcast::Receiver<WalletEvent>,
    pred: impl Fn(&WalletEvent) -> bool,
) -> WalletEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event stream open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event within timeout")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn node_wallet_lifecycle() {
    let (node, _rx) = TideNode::new();

    // Initially locked
    assert!(!node.is_wallet_unlocked());

    // Lock when already locked is a no-op
    node.lock_wallet();
    assert!(!node.is_wallet_unlocked());

    match node.sync().await {
        Err(NodeError::WalletLocked) => {}
        other => panic!("expected WalletLocked, got {other:?}"),
    }
    assert!(matches!(node.balances().await, Err(NodeError::WalletLocked)));
}

#[tokio::test]
async fn unlocking_twice_is_refused() {
    let (node, _rx) = TideNode::new();
    let (sdk, chain) = session();
    node.unlock_wallet(sdk).unwrap();
    assert!(node.is_wallet_unlocked());
    assert_eq!(node.network().await.unwrap(), NETWORK);

    let (second, _) = session();
    assert!(matches!(
        node.unlock_wallet(second),
        Err(NodeError::WalletAlreadyUnlocked)
    ));

    node.lock_wallet();
    assert!(!node.is_wallet_unlocked());
    assert!(chain.is_closed());
}

#[tokio::test]
async fn incoming_payment_reaches_subscribers() {
    let (node, mut rx) = TideNode::new();
    let (sdk, chain) = session();
    node.unlock_wallet(sdk).unwrap();

    let address = node.next_address(None, Chain::External).await.unwrap();
    let txid = chain.fund(&address.address, NETWORK.policy_asset(), 25_000, None);

    let event = wait_for(&mut rx, |e| matches!(e, WalletEvent::NewUtxo(_))).await;
    match event {
        WalletEvent::NewUtxo(utxo) => {
            assert_eq!(utxo.outpoint.txid, txid);
            assert_eq!(utxo.prevout.script_pubkey, address.script);
        }
        _ => unreachable!(),
    }
    assert_eq!(node.balances().await.unwrap()[&NETWORK.policy_asset()], 25_000);
    assert_eq!(node.transactions().await.unwrap().len(), 1);
}

#[tokio::test]
async fn send_through_node_publishes_spend() {
    let (node, mut rx) = TideNode::new();
    let (sdk, chain) = session();
    node.unlock_wallet(sdk).unwrap();

    let address = node.next_address(None, Chain::External).await.unwrap();
    chain.fund(&address.address, NETWORK.policy_asset(), 25_000, Some(3));
    wait_for(&mut rx, |e| matches!(e, WalletEvent::NewUtxo(_))).await;

    let request = SpendRequest {
        recipients: vec![AddressRecipient {
            address: foreign_address(NETWORK).to_string(),
            asset: NETWORK.policy_asset(),
            value: 10_000,
        }],
        data: vec![],
        fee_asset: NETWORK.policy_asset(),
        accounts: vec![],
    };
    let sent = node
        .send(request, TEST_PASSWORD.to_string())
        .await
        .unwrap();
    assert_eq!(chain.broadcasts(), vec![sent.txid]);

    let spent = wait_for(&mut rx, |e| matches!(e, WalletEvent::SpentUtxo(_))).await;
    assert!(matches!(spent, WalletEvent::SpentUtxo(o) if o.vout == 0));
    wait_for(&mut rx, |e| matches!(e, WalletEvent::NewTx(t) if t.txid == sent.txid)).await;
}

#[tokio::test]
async fn site_permissions_follow_current_host() {
    let (node, mut rx) = TideNode::new();
    let (sdk, _chain) = session();
    node.unlock_wallet(sdk).unwrap();

    node.set_current_hostname(Some("dex.example".into()))
        .await
        .unwrap();
    node.set_site_enabled(NETWORK, "dex.example".into(), true)
        .await
        .unwrap();
    let event = wait_for(&mut rx, |e| matches!(e, WalletEvent::Enabled { .. })).await;
    assert_eq!(
        event,
        WalletEvent::Enabled {
            network: NETWORK,
            hostname: "dex.example".into()
        }
    );

    node.set_site_enabled(NETWORK, "dex.example".into(), false)
        .await
        .unwrap();
    wait_for(&mut rx, |e| matches!(e, WalletEvent::Disabled { .. })).await;
}

#[tokio::test]
async fn switching_network_is_announced() {
    let (node, mut rx) = TideNode::new();
    let (sdk, old_chain) = session();
    node.unlock_wallet(sdk).unwrap();

    let new_chain = Arc::new(MockChainSource::new());
    node.switch_network(Network::LiquidTestnet, new_chain, None)
        .await
        .unwrap();
    let event = wait_for(&mut rx, |e| matches!(e, WalletEvent::Network(_))).await;
    assert_eq!(event, WalletEvent::Network(Network::LiquidTestnet));
    assert!(old_chain.is_closed());
    assert_eq!(node.network().await.unwrap(), Network::LiquidTestnet);
}
