use std::sync::Arc;

use tidewallet_sdk::account::Chain;
use tidewallet_sdk::elements::encode::deserialize;
use tidewallet_sdk::elements::{AssetId, Transaction, Txid};
use tidewallet_sdk::testing::{
    foreign_address, test_asset, MockChainSource, MockFeeSponsor, TEST_MNEMONIC, TEST_PASSWORD,
};
use tidewallet_sdk::{
    is_fully_blinded, AddressRecipient, DataRecipient, Error, MemoryStore, Network,
    SpendRequest, TideSdk, TxType, WalletConfig, MAIN_ACCOUNT_TEST,
};

const NETWORK: Network = Network::LiquidRegtest;

// ── Helpers ──────────────────────────────────────────────────────────────

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

/// Receive `value` of `asset` on a fresh address of `account` and apply it.
fn receive(sdk: &TideSdk, chain: &MockChainSource, account: &str, asset: AssetId, value: u64) {
    let address = sdk.next_address(account, Chain::External, None).unwrap();
    chain.fund(&address.address, asset, value, Some(10));
    sdk.update_script(&address.script).unwrap();
}

fn pay(asset: AssetId, value: u64, fee_asset: AssetId) -> SpendRequest {
    SpendRequest {
        recipients: vec![AddressRecipient {
            address: foreign_address(NETWORK).to_string(),
            asset,
            value,
        }],
        data: vec![],
        fee_asset,
        accounts: vec![],
    }
}

fn broadcast_tx(chain: &MockChainSource, txid: &Txid) -> Transaction {
    chain.transaction(txid).expect("broadcast transaction is on chain")
}

// ── Tests ────────────────────────────────────────────────────────────────

#[test]
fn send_pays_recipient_and_fee() {
    let (sdk, chain) = session();
    let policy = NETWORK.policy_asset();
    receive(&sdk, &chain, MAIN_ACCOUNT_TEST, policy, 50_000);
    receive(&sdk, &chain, MAIN_ACCOUNT_TEST, policy, 30_000);

    let sent = sdk.send(&pay(policy, 60_000, policy), TEST_PASSWORD).unwrap();
    assert!(sent.fee_amount > 0);

    let tx: Transaction = deserialize(&hex::decode(&sent.tx_hex).unwrap()).unwrap();
    assert_eq!(tx.txid(), sent.txid);
    assert_eq!(tx.input.len(), 2);
    assert!(tx.input.iter().all(|i| !i.witness.script_witness.is_empty()));
    assert_eq!(broadcast_tx(&chain, &sent.txid).txid(), sent.txid);

    // Everything but the fee output is confidential.
    for output in &tx.output {
        if output.is_fee() {
            assert_eq!(output.value.explicit(), Some(sent.fee_amount));
        } else {
            assert!(output.value.is_confidential());
            assert!(output.asset.is_confidential());
        }
    }

    let balance = sdk.balances().unwrap()[&policy];
    assert_eq!(balance, 80_000 - 60_000 - sent.fee_amount);
    let latest = &sdk.transactions().unwrap()[0];
    assert_eq!(latest.txid, sent.txid);
    assert_eq!(latest.tx_type, TxType::Withdraw);
    assert_eq!(latest.fee, sent.fee_amount);
}

#[test]
fn spending_from_two_accounts() {
    let (sdk, chain) = session();
    let policy = NETWORK.policy_asset();
    let savings = sdk.create_account("savings", TEST_PASSWORD).unwrap();
    receive(&sdk, &chain, MAIN_ACCOUNT_TEST, policy, 30_000);
    receive(&sdk, &chain, &savings, policy, 40_000);

    let mut request = pay(policy, 60_000, policy);
    request.accounts = vec![MAIN_ACCOUNT_TEST.to_string(), savings.clone()];
    let sent = sdk.send(&request, TEST_PASSWORD).unwrap();

    // Both accounts signed; change went back to the first one.
    assert!(sdk.utxos(&[savings]).unwrap().is_empty());
    let main = sdk.utxos(&[MAIN_ACCOUNT_TEST.to_string()]).unwrap();
    assert_eq!(main.len(), 1);
    assert_eq!(
        main[0].unblinding.as_ref().unwrap().value,
        70_000 - 60_000 - sent.fee_amount
    );
}

#[test]
fn asset_payment_keeps_asset_change() {
    let (sdk, chain) = session();
    let policy = NETWORK.policy_asset();
    let asset = test_asset();
    receive(&sdk, &chain, MAIN_ACCOUNT_TEST, policy, 10_000);
    receive(&sdk, &chain, MAIN_ACCOUNT_TEST, asset, 1_000);

    let sent = sdk.send(&pay(asset, 400, policy), TEST_PASSWORD).unwrap();
    let balances = sdk.balances().unwrap();
    assert_eq!(balances[&asset], 600);
    assert_eq!(balances[&policy], 10_000 - sent.fee_amount);
}

#[test]
fn data_outputs_survive_the_pipeline() {
    let (sdk, chain) = session();
    let policy = NETWORK.policy_asset();
    receive(&sdk, &chain, MAIN_ACCOUNT_TEST, policy, 10_000);

    let mut request = pay(policy, 1_000, policy);
    request.data.push(DataRecipient {
        data: b"tidewallet".to_vec(),
        asset: policy,
        value: 0,
    });
    let sent = sdk.send(&request, TEST_PASSWORD).unwrap();
    let tx = broadcast_tx(&chain, &sent.txid);
    let op_return = tx
        .output
        .iter()
        .find(|o| o.script_pubkey.is_op_return())
        .expect("data output");
    assert_eq!(op_return.value.explicit(), Some(0));
}

#[test]
fn insufficient_funds_names_the_asset() {
    let (sdk, chain) = session();
    let policy = NETWORK.policy_asset();
    receive(&sdk, &chain, MAIN_ACCOUNT_TEST, policy, 5_000);

    match sdk.send(&pay(policy, 9_000, policy), TEST_PASSWORD) {
        Err(Error::InsufficientFunds {
            asset,
            requested,
            available,
        }) => {
            assert_eq!(asset, policy);
            assert!(requested >= 9_000);
            assert_eq!(available, 5_000);
        }
        other => panic!("expected InsufficientFunds, got {other:?}"),
    }
    assert!(sdk.reservations().is_empty());
    assert!(chain.broadcasts().is_empty());
}

#[test]
fn wrong_password_leaves_coins_spendable() {
    let (sdk, chain) = session();
    let policy = NETWORK.policy_asset();
    receive(&sdk, &chain, MAIN_ACCOUNT_TEST, policy, 5_000);

    assert!(matches!(
        sdk.send(&pay(policy, 1_000, policy), "wrong"),
        Err(Error::InvalidPassword)
    ));
    assert!(sdk.reservations().is_empty());
    sdk.send(&pay(policy, 1_000, policy), TEST_PASSWORD).unwrap();
}

#[test]
fn reserved_coins_are_not_selected_twice() {
    let (sdk, chain) = session();
    let policy = NETWORK.policy_asset();
    receive(&sdk, &chain, MAIN_ACCOUNT_TEST, policy, 5_000);

    let first = sdk.create_pset(&pay(policy, 1_000, policy)).unwrap();
    assert!(matches!(
        sdk.create_pset(&pay(policy, 1_000, policy)),
        Err(Error::InsufficientFunds { .. })
    ));
    drop(first);
    assert!(sdk.create_pset(&pay(policy, 1_000, policy)).is_ok());
}

#[test]
fn sponsored_send_pays_fee_in_asset() {
    let asset = test_asset();
    let sponsor = Arc::new(MockFeeSponsor::new(NETWORK, asset, 700));
    let (sdk, chain) = session();
    let sdk = sdk.with_sponsor(sponsor.clone());
    receive(&sdk, &chain, MAIN_ACCOUNT_TEST, asset, 5_000);

    let mut built = sdk.create_pset(&pay(asset, 2_000, asset)).unwrap();
    assert_eq!(built.fee_amount, 700);
    assert_eq!(built.fee_asset, asset);
    assert_eq!(sponsor.requests().len(), 1);

    sdk.blind(&mut built.pset).unwrap();
    assert!(is_fully_blinded(&built.pset, &[]));

    // Full validation fails on the sponsor's input; the wallet's own pass.
    assert!(matches!(
        sdk.sign(&mut built.pset, TEST_PASSWORD),
        Err(Error::SignatureValidationFailed(_))
    ));
    sdk.sign_wallet_inputs(&mut built.pset, TEST_PASSWORD).unwrap();
    let ours = &built.pset.inputs()[sponsor.partial_inputs()..];
    assert!(ours.iter().all(|i| !i.partial_sigs.is_empty()));
    assert!(built.pset.inputs()[0].partial_sigs.is_empty());

    let tx_hex = sdk.finalize_and_extract(&mut built.pset).unwrap();
    let tx: Transaction = deserialize(&hex::decode(tx_hex).unwrap()).unwrap();
    assert!(tx.input.iter().all(|i| !i.witness.script_witness.is_empty()));
}

#[test]
fn sponsored_send_broadcasts() {
    let asset = test_asset();
    let sponsor = Arc::new(MockFeeSponsor::new(NETWORK, asset, 700));
    let (sdk, chain) = session();
    let sdk = sdk.with_sponsor(sponsor);
    receive(&sdk, &chain, MAIN_ACCOUNT_TEST, asset, 5_000);

    let sent = sdk.send(&pay(asset, 2_000, asset), TEST_PASSWORD).unwrap();
    assert_eq!(sent.fee_amount, 700);
    assert_eq!(sent.fee_asset, asset);
    assert_eq!(broadcast_tx(&chain, &sent.txid).txid(), sent.txid);

    // The wallet never held L-BTC and still holds none.
    let balances = sdk.balances().unwrap();
    assert_eq!(balances[&asset], 5_000 - 2_000 - 700);
    assert!(!balances.contains_key(&NETWORK.policy_asset()));
}

#[test]
fn sponsored_send_refuses_unsigned_sponsor_inputs() {
    let asset = test_asset();
    let sponsor = Arc::new(MockFeeSponsor::new(NETWORK, asset, 700).unsigned());
    let (sdk, chain) = session();
    let sdk = sdk.with_sponsor(sponsor);
    receive(&sdk, &chain, MAIN_ACCOUNT_TEST, asset, 5_000);

    assert!(matches!(
        sdk.send(&pay(asset, 2_000, asset), TEST_PASSWORD),
        Err(Error::Taxi(_))
    ));
    assert!(chain.broadcasts().is_empty());
    // The failed send released its coins.
    assert!(sdk.create_pset(&pay(asset, 2_000, asset)).is_ok());
}
