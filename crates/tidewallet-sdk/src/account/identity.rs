use lwk_common::Signer as _;
use lwk_signer::SwSigner;
use lwk_wollet::bitcoin::bip32::{DerivationPath, Fingerprint, Xpub};
use lwk_wollet::bitcoin::secp256k1::Secp256k1;
use lwk_wollet::bitcoin::PublicKey;
use lwk_wollet::elements::pset::PartiallySignedTransaction;
use lwk_wollet::elements::secp256k1_zkp::{self, XOnlyPublicKey};
use lwk_wollet::elements::{Address, Script};
use lwk_wollet::elements_miniscript::slip77::MasterBlindingKey;

use super::covenant::{ConstructorArgs, CovenantTemplate};
use super::derivation;
use super::{AccountId, AccountType, Chain, ScriptDetails};
use crate::error::{Error, Result};
use crate::network::Network;

/// An address derived from an account at `<chain>/<index>`.
#[derive(Debug, Clone)]
pub struct DerivedAddress {
    pub address: Address,
    pub script: Script,
    pub chain: Chain,
    pub index: u32,
    /// Full path from the master key.
    pub derivation_path: DerivationPath,
    pub public_key: PublicKey,
    pub constructor_args: Option<ConstructorArgs>,
}

impl DerivedAddress {
    pub fn blinding_public_key(&self) -> Option<secp256k1_zkp::PublicKey> {
        self.address.blinding_pubkey
    }

    pub fn script_details(&self, account_id: &str) -> ScriptDetails {
        ScriptDetails {
            account_id: account_id.to_string(),
            chain: self.chain,
            index: self.index,
            derivation_path: self.derivation_path.clone(),
            public_key: self.public_key,
            constructor_args: self.constructor_args.clone(),
        }
    }
}

/// Public-key-only view of an account: derives addresses and blinding keys.
#[derive(Debug, Clone)]
pub struct WatchIdentity {
    pub account_id: AccountId,
    pub account_type: AccountType,
    pub network: Network,
    account_xpub: Xpub,
    base_path: DerivationPath,
    master_fingerprint: Fingerprint,
    master_blinding_key: MasterBlindingKey,
    template: Option<CovenantTemplate>,
}

impl WatchIdentity {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        account_id: AccountId,
        account_type: AccountType,
        network: Network,
        account_xpub: Xpub,
        base_path: DerivationPath,
        master_fingerprint: Fingerprint,
        master_blinding_key: MasterBlindingKey,
        template: Option<CovenantTemplate>,
    ) -> Self {
        Self {
            account_id,
            account_type,
            network,
            account_xpub,
            base_path,
            master_fingerprint,
            master_blinding_key,
            template,
        }
    }

    pub fn master_fingerprint(&self) -> Fingerprint {
        self.master_fingerprint
    }

    pub fn base_path(&self) -> &DerivationPath {
        &self.base_path
    }

    fn child_key(&self, chain: Chain, index: u32) -> Result<PublicKey> {
        let children = derivation::relative_children(chain, index)
            .ok_or_else(|| Error::Derivation(format!("index {index} is out of range")))?;
        let secp = Secp256k1::verification_only();
        let child = self
            .account_xpub
            .derive_pub(&secp, &children)
            .map_err(|e| Error::Derivation(e.to_string()))?;
        Ok(PublicKey::new(child.public_key))
    }

    /// Derive the address at `<chain>/<index>`. Covenant accounts need the
    /// template's constructor arguments.
    pub fn derive(
        &self,
        chain: Chain,
        index: u32,
        args: Option<&ConstructorArgs>,
    ) -> Result<DerivedAddress> {
        let public_key = self.child_key(chain, index)?;
        let params = self.network.address_params();

        let script = match &self.template {
            None => Address::p2wpkh(&public_key, None, params).script_pubkey(),
            Some(template) => {
                let args = args.ok_or_else(|| {
                    Error::Template(format!(
                        "{} needs constructor arguments",
                        template.contract_name
                    ))
                })?;
                let internal = XOnlyPublicKey::from_slice(&public_key.inner.x_only_public_key().0.serialize())
                    .map_err(|e| Error::Derivation(e.to_string()))?;
                template.script_pubkey(&internal, args)?
            }
        };

        let secp = secp256k1_zkp::Secp256k1::new();
        let blinding_key = self.master_blinding_key.blinding_key(&secp, &script);
        let address = Address::from_script(&script, Some(blinding_key), params)
            .ok_or_else(|| Error::Derivation("script has no address form".into()))?;
        let derivation_path = derivation::full_path(&self.base_path, chain, index)
            .ok_or_else(|| Error::Derivation(format!("index {index} is out of range")))?;

        Ok(DerivedAddress {
            address,
            script,
            chain,
            index,
            derivation_path,
            public_key,
            constructor_args: self.template.as_ref().and(args.cloned()),
        })
    }

    /// SLIP-77 blinding private key for one of this account's scripts.
    pub fn blinding_private_key(&self, script: &Script) -> secp256k1_zkp::SecretKey {
        self.master_blinding_key.blinding_private_key(script)
    }
}

/// Watch identity plus the seed-backed signer. Lives only for the duration
/// of a signing operation.
pub struct SigningIdentity {
    watch: WatchIdentity,
    signer: SwSigner,
}

impl SigningIdentity {
    pub(crate) fn new(watch: WatchIdentity, mnemonic: &str) -> Result<Self> {
        let signer = SwSigner::new(mnemonic, watch.network.is_mainnet())
            .map_err(|e| Error::Signer(e.to_string()))?;
        if signer.xpub().fingerprint() != watch.master_fingerprint {
            return Err(Error::Signer(format!(
                "mnemonic does not match account {}",
                watch.account_id
            )));
        }
        Ok(Self { watch, signer })
    }

    pub fn watch(&self) -> &WatchIdentity {
        &self.watch
    }

    /// Add signatures for every input carrying one of our derivations.
    pub fn sign(&self, pset: &mut PartiallySignedTransaction) -> Result<u32> {
        self.signer
            .sign(pset)
            .map_err(|e| Error::Signer(format!("{e:?}")))
    }
}
