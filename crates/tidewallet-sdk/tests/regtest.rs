//! End-to-end runs against `elementsd` and `electrs` started by
//! `lwk_test_util`. Ignored unless the binaries are configured
//! (`ELEMENTSD_EXEC`, `ELECTRS_EXEC`); run with `--ignored`.

use std::sync::Arc;
use std::time::Duration;

use lwk_test_util::{regtest_policy_asset, TestEnv, TestEnvBuilder, TEST_MNEMONIC};

use tidewallet_sdk::account::Chain;
use tidewallet_sdk::testing::{foreign_address, TEST_PASSWORD};
use tidewallet_sdk::{
    AddressRecipient, ElectrumChainSource, MemoryStore, Network, NextKeyIndexes, SpendRequest,
    TideSdk, WalletConfig, WalletRepository, MAIN_ACCOUNT_TEST,
};

const COIN: u64 = 100_000_000;

// ── Helpers ──────────────────────────────────────────────────────────────

struct TestFixture {
    env: TestEnv,
    sdk: TideSdk,
}

impl TestFixture {
    fn new() -> Self {
        let env = TestEnvBuilder::from_env().with_electrum().build();
        let config = WalletConfig {
            electrum_url: Some(env.electrum_url()),
            ..WalletConfig::new(Network::LiquidRegtest)
        };
        let chain = Arc::new(ElectrumChainSource::new(config.electrum_url()));
        let sdk = TideSdk::new(config, Arc::new(MemoryStore::new()), chain);
        sdk.restore_wallet(TEST_MNEMONIC, TEST_PASSWORD).unwrap();

        TestFixture { env, sdk }
    }

    /// Send `count` outputs of `sats_each` to each of the first `addresses`
    /// external addresses, then mine a block.
    fn fund(&self, addresses: u32, count: u32, sats_each: u64) {
        for _ in 0..addresses {
            let address = self
                .sdk
                .next_address(MAIN_ACCOUNT_TEST, Chain::External, None)
                .unwrap();
            for _ in 0..count {
                self.env
                    .elementsd_sendtoaddress(&address.address, sats_each, None);
            }
        }
        self.env.elementsd_generate(1);
        std::thread::sleep(Duration::from_secs(2));
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[test]
#[ignore = "needs elementsd and electrs"]
fn deep_restore_finds_regtest_funds() {
    let fixture = TestFixture::new();
    assert_eq!(Network::LiquidRegtest.policy_asset(), regtest_policy_asset());
    fixture.fund(3, 2, COIN);

    // Forget the issued indexes; discovery has to find them again.
    fixture
        .sdk
        .store()
        .set_next_key_indexes(
            MAIN_ACCOUNT_TEST,
            Network::LiquidRegtest,
            NextKeyIndexes::default(),
        )
        .unwrap();
    let outcome = fixture
        .sdk
        .sync(MAIN_ACCOUNT_TEST, Some(NextKeyIndexes::default()))
        .unwrap();

    assert_eq!(outcome.next.external, 3);
    assert_eq!(fixture.sdk.utxos(&[]).unwrap().len(), 6);
    assert_eq!(
        fixture.sdk.balances().unwrap()[&regtest_policy_asset()],
        6 * COIN
    );
}

#[test]
#[ignore = "needs elementsd and electrs"]
fn regtest_send_is_accepted() {
    let fixture = TestFixture::new();
    fixture.fund(1, 1, COIN);
    fixture
        .sdk
        .sync(MAIN_ACCOUNT_TEST, Some(NextKeyIndexes::default()))
        .unwrap();

    let request = SpendRequest {
        recipients: vec![AddressRecipient {
            address: foreign_address(Network::LiquidRegtest).to_string(),
            asset: regtest_policy_asset(),
            value: 10_000_000,
        }],
        data: vec![],
        fee_asset: regtest_policy_asset(),
        accounts: vec![],
    };
    let sent = fixture.sdk.send(&request, TEST_PASSWORD).unwrap();
    assert!(sent.fee_amount > 0);

    fixture.env.elementsd_generate(1);
    std::thread::sleep(Duration::from_secs(2));
    fixture.sdk.sync_all().unwrap();

    let balance = fixture.sdk.balances().unwrap()[&regtest_policy_asset()];
    assert_eq!(balance, COIN - 10_000_000 - sent.fee_amount);
}
