//! Wallet accounts: a closed set of account kinds sharing one seed.
//!
//! Every account exposes the same capabilities (watch identity, signing
//! identity, address issuance, sync) and dispatches to its kind-specific
//! behaviour. Covenant accounts cannot be restored by address discovery.

pub mod covenant;
pub mod derivation;
pub mod identity;

use std::fmt;

use lwk_signer::SwSigner;
use lwk_wollet::bitcoin::bip32::{DerivationPath, Fingerprint, Xpub};
use lwk_wollet::bitcoin::PublicKey;
use lwk_wollet::elements_miniscript::slip77::MasterBlindingKey;
use serde::{Deserialize, Serialize};

pub use covenant::{ConstructorArgs, CovenantTemplate};
pub use identity::{DerivedAddress, SigningIdentity, WatchIdentity};

use crate::error::{Error, Result};
use crate::mnemonic::EncryptedMnemonic;
use crate::network::Network;
use crate::restorer::{DeepRestorer, RestoreOutcome};
use crate::store::WalletRepository;

pub type AccountId = String;

pub const MAIN_ACCOUNT: &str = "mainAccount";
pub const MAIN_ACCOUNT_TEST: &str = "mainAccountTest";
pub const MAIN_ACCOUNT_LEGACY: &str = "mainAccountLegacy";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Standard,
    Legacy,
    Covenant,
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccountType::Standard => "standard",
            AccountType::Legacy => "legacy",
            AccountType::Covenant => "covenant",
        })
    }
}

/// External (receive) or internal (change) branch of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    External,
    Internal,
}

impl Chain {
    pub const BOTH: [Chain; 2] = [Chain::External, Chain::Internal];

    pub fn index(self) -> u32 {
        match self {
            Chain::External => 0,
            Chain::Internal => 1,
        }
    }
}

/// Low-water marks of the next never-issued index on each chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextKeyIndexes {
    pub external: u32,
    pub internal: u32,
}

impl NextKeyIndexes {
    pub fn get(&self, chain: Chain) -> u32 {
        match chain {
            Chain::External => self.external,
            Chain::Internal => self.internal,
        }
    }

    pub fn set(&mut self, chain: Chain, value: u32) {
        match chain {
            Chain::External => self.external = value,
            Chain::Internal => self.internal = value,
        }
    }

    pub fn max(self, other: NextKeyIndexes) -> NextKeyIndexes {
        NextKeyIndexes {
            external: self.external.max(other.external),
            internal: self.internal.max(other.internal),
        }
    }
}

/// What the store remembers about a script the wallet handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptDetails {
    pub account_id: AccountId,
    pub chain: Chain,
    pub index: u32,
    pub derivation_path: DerivationPath,
    pub public_key: PublicKey,
    pub constructor_args: Option<ConstructorArgs>,
}

/// Persisted account record.
#[derive(Debug, Clone)]
pub struct AccountDetails {
    pub id: AccountId,
    pub account_type: AccountType,
    pub base_derivation_path: DerivationPath,
    pub account_xpub: Xpub,
    pub master_fingerprint: Fingerprint,
    pub master_blinding_key: MasterBlindingKey,
    pub networks: Vec<Network>,
    pub encrypted_mnemonic: EncryptedMnemonic,
    pub covenant_template: Option<CovenantTemplate>,
}

impl AccountDetails {
    fn derive(
        signer: &SwSigner,
        encrypted_mnemonic: &EncryptedMnemonic,
        id: &str,
        account_type: AccountType,
        base_derivation_path: DerivationPath,
        networks: Vec<Network>,
        covenant_template: Option<CovenantTemplate>,
    ) -> Result<Self> {
        use lwk_common::Signer as _;

        let account_xpub = signer
            .derive_xpub(&base_derivation_path)
            .map_err(|e| Error::Signer(format!("{e:?}")))?;
        let master_blinding_key = signer
            .slip77_master_blinding_key()
            .map_err(|e| Error::Signer(format!("{e:?}")))?;
        Ok(Self {
            id: id.to_string(),
            account_type,
            base_derivation_path,
            account_xpub,
            master_fingerprint: signer.xpub().fingerprint(),
            master_blinding_key,
            networks,
            encrypted_mnemonic: encrypted_mnemonic.clone(),
            covenant_template,
        })
    }
}

fn signer_for(mnemonic: &str) -> Result<SwSigner> {
    SwSigner::new(mnemonic, true).map_err(|e| Error::Signer(e.to_string()))
}

/// The three accounts every wallet starts with: the standard account for
/// mainnet, its test-network twin, and the legacy-path account.
pub fn default_accounts(
    mnemonic: &str,
    encrypted: &EncryptedMnemonic,
) -> Result<Vec<AccountDetails>> {
    let signer = signer_for(mnemonic)?;
    Ok(vec![
        AccountDetails::derive(
            &signer,
            encrypted,
            MAIN_ACCOUNT,
            AccountType::Standard,
            derivation::standard_path(Network::Liquid),
            vec![Network::Liquid],
            None,
        )?,
        AccountDetails::derive(
            &signer,
            encrypted,
            MAIN_ACCOUNT_TEST,
            AccountType::Standard,
            derivation::standard_path(Network::LiquidTestnet),
            vec![Network::LiquidTestnet, Network::LiquidRegtest],
            None,
        )?,
        AccountDetails::derive(
            &signer,
            encrypted,
            MAIN_ACCOUNT_LEGACY,
            AccountType::Legacy,
            derivation::legacy_path(),
            Network::ALL.to_vec(),
            None,
        )?,
    ])
}

/// A standard account at the SLIP-13 path of `name`.
pub fn named_account(
    name: &str,
    mnemonic: &str,
    encrypted: &EncryptedMnemonic,
) -> Result<AccountDetails> {
    let signer = signer_for(mnemonic)?;
    AccountDetails::derive(
        &signer,
        encrypted,
        name,
        AccountType::Standard,
        derivation::slip13_path(name),
        Network::ALL.to_vec(),
        None,
    )
}

/// A covenant account at the SLIP-13 path of `name`.
pub fn covenant_account(
    name: &str,
    mnemonic: &str,
    encrypted: &EncryptedMnemonic,
    template: CovenantTemplate,
) -> Result<AccountDetails> {
    let signer = signer_for(mnemonic)?;
    AccountDetails::derive(
        &signer,
        encrypted,
        name,
        AccountType::Covenant,
        derivation::slip13_path(name),
        Network::ALL.to_vec(),
        Some(template),
    )
}

#[derive(Debug, Clone)]
pub struct KeyAccount {
    details: AccountDetails,
}

#[derive(Debug, Clone)]
pub struct CovenantAccount {
    details: AccountDetails,
    template: CovenantTemplate,
}

#[derive(Debug, Clone)]
pub enum Account {
    Standard(KeyAccount),
    Legacy(KeyAccount),
    Covenant(CovenantAccount),
}

impl Account {
    pub fn from_details(details: AccountDetails) -> Result<Self> {
        match details.account_type {
            AccountType::Standard => Ok(Account::Standard(KeyAccount { details })),
            AccountType::Legacy => Ok(Account::Legacy(KeyAccount { details })),
            AccountType::Covenant => {
                let template = details.covenant_template.clone().ok_or_else(|| {
                    Error::Template(format!("covenant account {} has no template", details.id))
                })?;
                Ok(Account::Covenant(CovenantAccount { details, template }))
            }
        }
    }

    pub fn details(&self) -> &AccountDetails {
        match self {
            Account::Standard(a) | Account::Legacy(a) => &a.details,
            Account::Covenant(a) => &a.details,
        }
    }

    pub fn id(&self) -> &str {
        &self.details().id
    }

    pub fn account_type(&self) -> AccountType {
        self.details().account_type
    }

    pub fn is_valid_on(&self, network: Network) -> bool {
        self.details().networks.contains(&network)
    }

    pub fn watch_identity(&self, network: Network) -> Result<WatchIdentity> {
        if !self.is_valid_on(network) {
            return Err(Error::UnknownAccount(format!(
                "{} is not available on {network}",
                self.id()
            )));
        }
        let d = self.details();
        let template = match self {
            Account::Covenant(a) => Some(a.template.clone()),
            _ => None,
        };
        Ok(WatchIdentity::new(
            d.id.clone(),
            d.account_type,
            network,
            d.account_xpub,
            d.base_derivation_path.clone(),
            d.master_fingerprint,
            d.master_blinding_key.clone(),
            template,
        ))
    }

    /// Decrypts the mnemonic with `password`; a wrong password yields
    /// [`Error::InvalidPassword`].
    pub fn signing_identity(&self, network: Network, password: &str) -> Result<SigningIdentity> {
        let watch = self.watch_identity(network)?;
        let mnemonic = self.details().encrypted_mnemonic.decrypt(password)?;
        SigningIdentity::new(watch, &mnemonic)
    }

    /// Issue the address at the current low-water mark of `chain` and
    /// advance the mark. Indices are never handed out twice.
    pub fn next_address(
        &self,
        store: &dyn WalletRepository,
        network: Network,
        chain: Chain,
        args: Option<&ConstructorArgs>,
    ) -> Result<DerivedAddress> {
        let identity = self.watch_identity(network)?;
        if let Account::Covenant(a) = self {
            let args = args.ok_or_else(|| {
                Error::Template(format!(
                    "{} needs constructor arguments",
                    a.template.contract_name
                ))
            })?;
            a.template.check_args(args)?;
        }

        let index = store.next_key_index(self.id(), network, chain)?;
        let derived = identity.derive(chain, index, args)?;
        store.add_script_details(network, &derived.script, derived.script_details(self.id()))?;
        log::debug!(
            "issued {:?} address {} for {} on {network}",
            chain,
            index,
            self.id()
        );
        Ok(derived)
    }

    /// Discover used addresses and their outputs, starting at `start` or at
    /// the stored indexes.
    pub fn sync(
        &self,
        restorer: &DeepRestorer<'_>,
        network: Network,
        gap_limit: u32,
        start: Option<NextKeyIndexes>,
    ) -> Result<RestoreOutcome> {
        match self {
            Account::Standard(_) | Account::Legacy(_) => {
                restorer.sync(&self.watch_identity(network)?, gap_limit, start)
            }
            Account::Covenant(_) => Err(Error::UnsupportedAccountType(AccountType::Covenant)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{sample_covenant_template, TEST_MNEMONIC, TEST_PASSWORD};

    fn accounts() -> Vec<AccountDetails> {
        let sealed = EncryptedMnemonic::encrypt(TEST_MNEMONIC, TEST_PASSWORD).unwrap();
        default_accounts(TEST_MNEMONIC, &sealed).unwrap()
    }

    #[test]
    fn default_accounts_cover_networks() {
        let accounts = accounts();
        let ids: Vec<_> = accounts.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec![MAIN_ACCOUNT, MAIN_ACCOUNT_TEST, MAIN_ACCOUNT_LEGACY]);
        assert_eq!(accounts[0].networks, vec![Network::Liquid]);
        assert!(accounts[2].networks.contains(&Network::LiquidRegtest));
        assert_eq!(accounts[0].master_fingerprint, accounts[1].master_fingerprint);
        assert_ne!(accounts[0].account_xpub, accounts[1].account_xpub);
    }

    #[test]
    fn next_address_never_repeats() {
        let store = MemoryStore::new();
        let account = Account::from_details(accounts().remove(1)).unwrap();
        let mut seen = std::collections::HashSet::new();
        for expected in 0..5 {
            let addr = account
                .next_address(&store, Network::LiquidRegtest, Chain::External, None)
                .unwrap();
            assert_eq!(addr.index, expected);
            assert!(addr.blinding_public_key().is_some());
            assert!(seen.insert(addr.address.to_string()));
        }
        let change = account
            .next_address(&store, Network::LiquidRegtest, Chain::Internal, None)
            .unwrap();
        assert_eq!(change.index, 0);
        assert!(seen.insert(change.address.to_string()));
    }

    #[test]
    fn issued_scripts_are_recorded() {
        let store = MemoryStore::new();
        let account = Account::from_details(accounts().remove(1)).unwrap();
        let addr = account
            .next_address(&store, Network::LiquidRegtest, Chain::Internal, None)
            .unwrap();
        let details = store
            .get_script_details(Network::LiquidRegtest, &addr.script)
            .unwrap()
            .unwrap();
        assert_eq!(details.account_id, MAIN_ACCOUNT_TEST);
        assert_eq!(details.chain, Chain::Internal);
        assert_eq!(details.derivation_path, addr.derivation_path);
    }

    #[test]
    fn account_rejects_foreign_network() {
        let account = Account::from_details(accounts().remove(0)).unwrap();
        assert!(matches!(
            account.watch_identity(Network::LiquidTestnet),
            Err(Error::UnknownAccount(_))
        ));
    }

    #[test]
    fn wrong_password_cannot_sign() {
        let account = Account::from_details(accounts().remove(1)).unwrap();
        assert!(matches!(
            account.signing_identity(Network::LiquidRegtest, "not-it"),
            Err(Error::InvalidPassword)
        ));
        assert!(account
            .signing_identity(Network::LiquidRegtest, TEST_PASSWORD)
            .is_ok());
    }

    #[test]
    fn covenant_addresses_need_args_and_depend_on_them() {
        let sealed = EncryptedMnemonic::encrypt(TEST_MNEMONIC, TEST_PASSWORD).unwrap();
        let details =
            covenant_account("vault", TEST_MNEMONIC, &sealed, sample_covenant_template()).unwrap();
        let account = Account::from_details(details).unwrap();
        let store = MemoryStore::new();

        assert!(matches!(
            account.next_address(&store, Network::LiquidRegtest, Chain::External, None),
            Err(Error::Template(_))
        ));

        let mut args = ConstructorArgs::new();
        args.insert("owner".into(), vec![0x11; 32]);
        args.insert("tag".into(), vec![0x01]);
        let identity = account.watch_identity(Network::LiquidRegtest).unwrap();
        let a = identity.derive(Chain::External, 0, Some(&args)).unwrap();
        args.insert("tag".into(), vec![0x02]);
        let b = identity.derive(Chain::External, 0, Some(&args)).unwrap();
        assert_ne!(a.script, b.script);
        assert_eq!(a.script.len(), 34);
        assert_eq!(a.script.as_bytes()[0], 0x51);

        let issued = account
            .next_address(&store, Network::LiquidRegtest, Chain::External, Some(&args))
            .unwrap();
        assert_eq!(issued.index, 0);
        assert_eq!(issued.constructor_args.as_ref(), Some(&args));
    }

    #[test]
    fn named_accounts_use_slip13_path() {
        let sealed = EncryptedMnemonic::encrypt(TEST_MNEMONIC, TEST_PASSWORD).unwrap();
        let details = named_account("savings", TEST_MNEMONIC, &sealed).unwrap();
        assert_eq!(details.base_derivation_path, derivation::slip13_path("savings"));
        assert_eq!(details.account_type, AccountType::Standard);
    }
}
