//! Request/response boundary of the signing engine.
//!
//! [`WalletEngine`] owns accounts, their UTXO sets and the change registry.
//! Calls that need private keys take an [`UnlockedSession`] argument; the
//! engine itself never stores one.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{Address, CompressedPublicKey, OutPoint, PublicKey, Txid};
use chain_btc::address::{single_key_address, ChainBranch, ScriptType};
use chain_btc::multisig::{self, FinalizedTransaction, MultisigPsbt, PsbtSigner};
use chain_btc::transaction::{Recipient, UnsignedTransaction};
use chain_btc::utxo::{Utxo, UtxoSelector};
use chain_btc::{wif, BtcNetwork, WifError};
use crypto_utils::{KdfProfile, SealedBox};
use parking_lot::{Mutex, RwLock};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::account::{Account, AccountRecord, Cosigner};
use crate::builder::TransactionBuilder;
use crate::change::ChangeAddressManager;
use crate::config::EngineConfig;
use crate::error::WalletError;
use crate::seed_encryption;
use crate::session::UnlockedSession;
use crate::signer::SessionSigner;
use crate::types::{
    AccountId, AccountKeys, AddressRecord, ImportedKey, ValidationError, ValidationResult,
};

/// A private key leaving the wallet.
#[derive(Debug)]
pub enum ExportedKey {
    /// Plain WIF. Only produced when the caller supplied no password.
    Wif(SecretString),
    /// WIF sealed under the key-export KDF tier.
    Sealed(SealedBox),
}

/// Persistent engine state. Contains no private key material in the clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub network: BtcNetwork,
    pub accounts: Vec<AccountRecord>,
    pub imports: Vec<ImportedKey>,
}

#[derive(Debug)]
pub struct WalletEngine {
    config: EngineConfig,
    selector: UtxoSelector,
    change: ChangeAddressManager,
    accounts: RwLock<BTreeMap<AccountId, Arc<Account>>>,
    utxos: Mutex<HashMap<AccountId, Vec<Utxo>>>,
    imports: Mutex<Vec<ImportedKey>>,
}

impl WalletEngine {
    pub fn new(config: EngineConfig) -> Result<Self, WalletError> {
        config.validate()?;
        tracing::info!(network = %config.network, "wallet engine started");
        Ok(Self {
            selector: UtxoSelector::new(config.selection_policy()),
            change: ChangeAddressManager::new(config.change_lookahead),
            config,
            accounts: RwLock::new(BTreeMap::new()),
            utxos: Mutex::new(HashMap::new()),
            imports: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn network(&self) -> BtcNetwork {
        self.config.network
    }

    // ─── Keys and accounts ───────────────────────────────────────────

    /// Account-level extended public key of a single-key account.
    pub fn derive_account_keys(
        &self,
        seed: &[u8],
        account_index: u32,
        script_type: ScriptType,
    ) -> Result<AccountKeys, WalletError> {
        let session = UnlockedSession::unlock(seed, self.network())?;
        let keys = Account::single_sig_keys(&session, account_index, script_type);
        session.lock();
        keys
    }

    /// This wallet's cosigner key for a multisig account.
    pub fn derive_cosigner_keys(
        &self,
        seed: &[u8],
        account_index: u32,
        script_type: ScriptType,
    ) -> Result<AccountKeys, WalletError> {
        let session = UnlockedSession::unlock(seed, self.network())?;
        let keys = Account::multisig_keys(&session, account_index, script_type);
        session.lock();
        keys
    }

    pub fn create_single_account(
        &self,
        session: &UnlockedSession,
        account_index: u32,
        script_type: ScriptType,
    ) -> Result<AccountId, WalletError> {
        self.check_session(session)?;
        self.insert_account(Account::single(session, account_index, script_type)?)
    }

    /// Create a multisig account from `[fingerprint/path]xpub` cosigner
    /// expressions, one of which must be this wallet's own.
    pub fn create_multisig_account(
        &self,
        session: &UnlockedSession,
        account_index: u32,
        script_type: ScriptType,
        threshold: usize,
        cosigners: &[String],
    ) -> Result<AccountId, WalletError> {
        self.check_session(session)?;
        let cosigners = cosigners
            .iter()
            .map(|c| Cosigner::parse(c))
            .collect::<Result<Vec<_>, _>>()?;
        self.insert_account(Account::multisig(
            session,
            account_index,
            script_type,
            threshold,
            cosigners,
        )?)
    }

    pub fn account(&self, id: &AccountId) -> Result<Arc<Account>, WalletError> {
        self.accounts
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| WalletError::UnknownAccount(id.to_string()))
    }

    pub fn account_ids(&self) -> Vec<AccountId> {
        self.accounts.read().keys().cloned().collect()
    }

    pub fn next_receive_address(&self, id: &AccountId) -> Result<AddressRecord, WalletError> {
        self.account(id)?.next_receive_address()
    }

    pub fn next_change_address(&self, id: &AccountId) -> Result<AddressRecord, WalletError> {
        let account = self.account(id)?;
        self.change.next_change_address(&account)
    }

    // ─── UTXOs and building ──────────────────────────────────────────

    /// Replace the observed unspent outputs of an account.
    pub fn set_utxos(&self, id: &AccountId, utxos: Vec<Utxo>) -> Result<(), WalletError> {
        let account = self.account(id)?;
        account.mark_used(&utxos);
        tracing::debug!(account = %id, count = utxos.len(), "UTXO set replaced");
        self.utxos.lock().insert(id.clone(), utxos);
        Ok(())
    }

    pub fn unspent(&self, id: &AccountId) -> Result<Vec<Utxo>, WalletError> {
        self.account(id)?;
        Ok(self.utxos.lock().get(id).cloned().unwrap_or_default())
    }

    /// Select inputs, issue change if needed and assemble an unsigned
    /// transaction. Nothing changes if any step fails.
    pub fn build_transaction(
        &self,
        id: &AccountId,
        recipients: &[Recipient],
        fee_rate: u64,
    ) -> Result<UnsignedTransaction, WalletError> {
        let account = self.account(id)?;
        let utxos = self.unspent(id)?;
        TransactionBuilder::new(&self.selector, &self.change, self.config.lock_time())
            .build(&account, &utxos, recipients, fee_rate)
    }

    // ─── Signing ─────────────────────────────────────────────────────

    pub fn start_signing(&self, unsigned: &UnsignedTransaction) -> Result<MultisigPsbt, WalletError> {
        Ok(MultisigPsbt::from_unsigned(unsigned)?)
    }

    /// Sign with `signer`, returning the updated PSBT. `psbt` is untouched.
    pub fn apply_signature(
        &self,
        psbt: &MultisigPsbt,
        signer: &dyn PsbtSigner,
    ) -> Result<MultisigPsbt, WalletError> {
        let mut next = psbt.clone();
        next.apply_signature(signer)?;
        Ok(next)
    }

    pub fn sign_with_session(
        &self,
        psbt: &MultisigPsbt,
        session: &UnlockedSession,
    ) -> Result<MultisigPsbt, WalletError> {
        self.apply_signature(psbt, &SessionSigner::new(session))
    }

    pub fn merge_psbts(
        &self,
        a: &MultisigPsbt,
        b: &MultisigPsbt,
    ) -> Result<MultisigPsbt, WalletError> {
        Ok(multisig::merge(a, b)?)
    }

    pub fn finalize_and_serialize(
        &self,
        psbt: &mut MultisigPsbt,
    ) -> Result<FinalizedTransaction, WalletError> {
        Ok(psbt.finalize()?)
    }

    /// Record that the host broadcast `psbt` and drop its inputs from the
    /// account's unspent set. Refused, with `psbt` left as it was, when none
    /// of its inputs is an unspent output of `id`.
    pub fn record_broadcast(
        &self,
        id: &AccountId,
        psbt: &mut MultisigPsbt,
    ) -> Result<Txid, WalletError> {
        self.account(id)?;
        let spent: HashSet<OutPoint> = psbt
            .psbt()
            .unsigned_tx
            .input
            .iter()
            .map(|i| i.previous_output)
            .collect();

        let mut utxos = self.utxos.lock();
        let owned = utxos
            .get_mut(id)
            .filter(|set| set.iter().any(|u| spent.contains(&u.outpoint())));
        let Some(owned) = owned else {
            return Err(WalletError::Validation(format!(
                "transaction spends no unspent output of account {id}"
            )));
        };
        let txid = psbt.mark_broadcast()?.txid;
        owned.retain(|u| !spent.contains(&u.outpoint()));
        tracing::info!(account = %id, %txid, spent = spent.len(), "broadcast recorded");
        Ok(txid)
    }

    // ─── WIF export and import ───────────────────────────────────────

    /// Export the key at `branch/index` of an account as compressed WIF,
    /// sealed when `password` is given.
    pub fn export_private_key_as_wif(
        &self,
        session: &UnlockedSession,
        id: &AccountId,
        branch: ChainBranch,
        index: u32,
        password: Option<&SecretString>,
    ) -> Result<ExportedKey, WalletError> {
        self.check_session(session)?;
        let account = self.account(id)?;
        let expected = account.derive_address(branch, index)?;
        let owned = expected
            .policy
            .key_for(session.master_fingerprint())
            .ok_or_else(|| WalletError::Validation("session holds no key of this account".into()))?;

        let node = session.derive(&account.local_path(branch, index)?)?;
        if PublicKey::new(node.compressed_public_key()?.0) != owned.pubkey {
            return Err(WalletError::Validation(
                "session holds no key of this account".into(),
            ));
        }
        let private_key = node
            .private_key()
            .ok_or_else(|| WalletError::Internal("derived node has no private key".into()))?;
        let encoded = zeroize::Zeroizing::new(wif::encode(&private_key, self.network(), true)?);

        tracing::info!(account = %id, ?branch, index, sealed = password.is_some(), "private key exported");
        match password {
            Some(password) => Ok(ExportedKey::Sealed(crypto_utils::seal(
                encoded.as_bytes(),
                password.expose_secret().as_bytes(),
                KdfProfile::KeyExport,
            )?)),
            None => Ok(ExportedKey::Wif(SecretString::from(encoded.as_str().to_string()))),
        }
    }

    /// Check a WIF without touching wallet state.
    pub fn import_wif(&self, wif: &str, required_network: BtcNetwork) -> ValidationResult {
        match self.preview_wif(wif, required_network) {
            Ok((address, address_type)) => ValidationResult {
                valid: true,
                network: Some(required_network),
                first_address: Some(address),
                address_type: Some(address_type),
                error: None,
            },
            Err(err) => {
                let network = match &err {
                    WalletError::Wif(WifError::NetworkMismatch { found, .. }) => Some(*found),
                    _ => None,
                };
                ValidationResult {
                    valid: false,
                    network,
                    first_address: None,
                    address_type: None,
                    error: Some(ValidationError {
                        code: err.code(),
                        message: err.to_string(),
                    }),
                }
            }
        }
    }

    /// Import a WIF, storing it sealed under `password`.
    pub fn commit_wif_import(
        &self,
        wif: &str,
        required_network: BtcNetwork,
        password: &SecretString,
    ) -> Result<ImportedKey, WalletError> {
        let (first_address, address_type) = self.preview_wif(wif, required_network)?;
        let sealed = crypto_utils::seal(
            wif.trim().as_bytes(),
            password.expose_secret().as_bytes(),
            KdfProfile::KeyExport,
        )?;
        let imported = ImportedKey {
            first_address,
            address_type,
            network: required_network,
            sealed,
        };

        let mut imports = self.imports.lock();
        if imports.iter().any(|k| k.first_address == imported.first_address) {
            return Err(WalletError::DuplicateImport(imported.first_address));
        }
        imports.push(imported.clone());
        tracing::info!(address = %imported.first_address, "WIF key imported");
        Ok(imported)
    }

    pub fn imported_keys(&self) -> Vec<ImportedKey> {
        self.imports.lock().clone()
    }

    // ─── Persistence ─────────────────────────────────────────────────

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            network: self.network(),
            accounts: self.accounts.read().values().map(|a| a.record()).collect(),
            imports: self.imported_keys(),
        }
    }

    /// Load a snapshot. Chain cursors only move forward, so an older
    /// snapshot can never cause an index to be issued twice.
    pub fn restore(&self, snapshot: EngineSnapshot) -> Result<(), WalletError> {
        if snapshot.network != self.network() {
            return Err(WalletError::Validation(format!(
                "snapshot is for {}, engine runs on {}",
                snapshot.network,
                self.network()
            )));
        }

        // rebuild every new account before touching live state
        let mut accounts = self.accounts.write();
        let mut fresh = Vec::new();
        for record in &snapshot.accounts {
            if record.network != self.network() {
                return Err(WalletError::Validation(format!(
                    "account {} is for {}",
                    record.id, record.network
                )));
            }
            if !accounts.contains_key(&record.id) {
                fresh.push(Account::from_record(record.clone())?);
            }
        }

        for record in &snapshot.accounts {
            self.change.register(&record.internal.issued);
            if let Some(existing) = accounts.get(&record.id) {
                existing.advance_to(record);
            }
        }
        for account in fresh {
            accounts.insert(account.id().clone(), Arc::new(account));
        }
        let restored = accounts.len();
        drop(accounts);

        let mut imports = self.imports.lock();
        for key in snapshot.imports {
            if !imports.iter().any(|k| k.first_address == key.first_address) {
                imports.push(key);
            }
        }
        tracing::info!(accounts = restored, imports = imports.len(), "snapshot restored");
        Ok(())
    }

    /// Seal a whole-wallet seed for backup.
    pub fn seal_seed_backup(
        &self,
        seed: &[u8],
        password: &SecretString,
    ) -> Result<SealedBox, WalletError> {
        seed_encryption::seal_seed(seed, password.expose_secret().as_bytes())
    }

    fn check_session(&self, session: &UnlockedSession) -> Result<(), WalletError> {
        if session.network() != self.network() {
            return Err(WalletError::Validation(format!(
                "session is for {}, engine runs on {}",
                session.network(),
                self.network()
            )));
        }
        Ok(())
    }

    fn insert_account(&self, account: Account) -> Result<AccountId, WalletError> {
        let id = account.id().clone();
        let mut accounts = self.accounts.write();
        if accounts.contains_key(&id) {
            return Err(WalletError::Validation(format!("account {id} already exists")));
        }
        accounts.insert(id.clone(), Arc::new(account));
        tracing::info!(account = %id, "account created");
        Ok(id)
    }

    /// Decode `wif` for `network` and work out its first address, refusing
    /// keys the wallet already holds.
    fn preview_wif(
        &self,
        wif: &str,
        network: BtcNetwork,
    ) -> Result<(String, ScriptType), WalletError> {
        let decoded = wif::decode_for_network(wif, network)?;
        let secret = SecretKey::from_slice(&decoded.private_key[..])
            .map_err(|e| WalletError::Validation(format!("invalid key: {e}")))?;
        let pubkey = PublicKey {
            compressed: decoded.compressed,
            inner: secret.public_key(&Secp256k1::signing_only()),
        };

        let (address, address_type) = if decoded.compressed {
            let compressed = CompressedPublicKey(pubkey.inner);
            (
                single_key_address(&compressed, ScriptType::NativeSegwit, network),
                ScriptType::NativeSegwit,
            )
        } else {
            (
                Address::p2pkh(pubkey.pubkey_hash(), network.to_bitcoin_network()),
                ScriptType::Legacy,
            )
        };
        let address = address.to_string();

        if self.holds_key(&pubkey, network)? {
            return Err(WalletError::DuplicateImport(address));
        }
        Ok((address, address_type))
    }

    /// Whether `pubkey` is already imported, issued by an account, or within
    /// the lookahead window of one. Matches on the key, not on one address
    /// form of it.
    fn holds_key(&self, pubkey: &PublicKey, network: BtcNetwork) -> Result<bool, WalletError> {
        let renderings = key_renderings(pubkey, network);
        if self
            .imports
            .lock()
            .iter()
            .any(|k| renderings.contains(&k.first_address))
        {
            return Ok(true);
        }

        let window = u32::try_from(self.config.change_lookahead)
            .map_err(|_| WalletError::Internal("lookahead window exceeds u32".into()))?;
        for account in self.accounts.read().values() {
            if account.owns_key(pubkey, window)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Every single-key address `pubkey` can appear under.
fn key_renderings(pubkey: &PublicKey, network: BtcNetwork) -> Vec<String> {
    let compressed = CompressedPublicKey(pubkey.inner);
    let uncompressed = PublicKey {
        compressed: false,
        inner: pubkey.inner,
    };
    let mut all: Vec<String> = [
        ScriptType::Legacy,
        ScriptType::NestedSegwit,
        ScriptType::NativeSegwit,
    ]
    .into_iter()
    .map(|script_type| single_key_address(&compressed, script_type, network).to_string())
    .collect();
    all.push(Address::p2pkh(uncompressed.pubkey_hash(), network.to_bitcoin_network()).to_string());
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::test_support::*;

    fn make_engine(network: BtcNetwork) -> WalletEngine {
        WalletEngine::new(EngineConfig::for_network(network)).unwrap()
    }

    #[test]
    fn session_network_must_match() {
        let engine = make_engine(BtcNetwork::Mainnet);
        let session = session_for(TEST_MNEMONIC, BtcNetwork::Testnet);
        assert!(matches!(
            engine.create_single_account(&session, 0, ScriptType::NativeSegwit),
            Err(WalletError::Validation(_))
        ));
    }

    #[test]
    fn duplicate_account_is_refused() {
        let engine = make_engine(BtcNetwork::Mainnet);
        let session = session_for(TEST_MNEMONIC, BtcNetwork::Mainnet);
        engine.create_single_account(&session, 0, ScriptType::NativeSegwit).unwrap();
        assert!(engine.create_single_account(&session, 0, ScriptType::NativeSegwit).is_err());
        assert_eq!(engine.account_ids().len(), 1);
    }

    #[test]
    fn unknown_account() {
        let engine = make_engine(BtcNetwork::Mainnet);
        let err = engine.next_receive_address(&AccountId("nope".into())).unwrap_err();
        assert!(matches!(err, WalletError::UnknownAccount(_)));
    }

    #[test]
    fn restore_rejects_other_network() {
        let engine = make_engine(BtcNetwork::Mainnet);
        let snapshot = EngineSnapshot {
            network: BtcNetwork::Testnet,
            accounts: Vec::new(),
            imports: Vec::new(),
        };
        assert!(engine.restore(snapshot).is_err());
    }

    #[test]
    fn export_requires_owning_session() {
        let engine = make_engine(BtcNetwork::Testnet);
        let sessions = cosigner_sessions(BtcNetwork::Testnet);
        let id = engine
            .create_single_account(&sessions[0], 0, ScriptType::NativeSegwit)
            .unwrap();
        let err = engine
            .export_private_key_as_wif(&sessions[1], &id, ChainBranch::External, 0, None)
            .unwrap_err();
        assert!(matches!(err, WalletError::Validation(_)));
    }
}
