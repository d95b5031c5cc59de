//! Accounts and their address chains.
//!
//! An account is either a single-key tree or an `m`-of-`n` multisig policy
//! over cosigner extended keys. Both kinds expose an external (receive) and an
//! internal (change) chain, each with a monotonic index cursor.

use std::collections::{BTreeSet, VecDeque};

use bitcoin::bip32::Fingerprint;
use bitcoin::{PublicKey, ScriptBuf};
use chain_btc::address::{
    multisig_address, single_key_address, ChainBranch, ScriptType, MAX_MULTISIG_KEYS,
};
use chain_btc::multisig::{CosignerKey, InputPolicy};
use chain_btc::transaction::SpendKind;
use chain_btc::utxo::Utxo;
use chain_btc::BtcNetwork;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::WalletError;
use crate::extended_key::{self, KeyPurpose, KeyVersion};
use crate::hd_derivation::{DerivationPath, KeyNode, PathSegment, MULTISIG_PURPOSE};
use crate::session::UnlockedSession;
use crate::types::{AccountId, AccountKeys, AddressRecord};

/// One party of a multisig account, as `[fingerprint/path]xpub`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cosigner {
    pub fingerprint: Fingerprint,
    /// Path from the cosigner's master key to `xpub`.
    pub origin: DerivationPath,
    pub xpub: String,
}

impl Cosigner {
    /// Parse a key-origin expression such as `[73c5da0a/48'/1'/0'/2']tpub...`.
    pub fn parse(expression: &str) -> Result<Self, WalletError> {
        let invalid = |msg: &str| WalletError::Validation(format!("cosigner key: {msg}"));

        let rest = expression
            .trim()
            .strip_prefix('[')
            .ok_or_else(|| invalid("missing [fingerprint/path] key origin"))?;
        let (origin, xpub) = rest
            .split_once(']')
            .ok_or_else(|| invalid("unterminated key origin"))?;
        let (fp_hex, path) = match origin.split_once('/') {
            Some((fp, path)) => (fp, format!("m/{path}")),
            None => (origin, "m".to_string()),
        };

        let fp_bytes: [u8; 4] = hex::decode(fp_hex)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| invalid("fingerprint must be 8 hex characters"))?;
        let origin: DerivationPath = path.parse()?;
        extended_key::decode_public(xpub)?;

        Ok(Self {
            fingerprint: Fingerprint::from(fp_bytes),
            origin,
            xpub: xpub.to_string(),
        })
    }

    fn node(&self) -> Result<KeyNode, WalletError> {
        Ok(extended_key::decode_public(&self.xpub)?.node)
    }
}

/// What kind of key policy an account spends under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountKind {
    Single {
        master_fingerprint: Fingerprint,
        account_xpub: String,
    },
    Multisig {
        threshold: usize,
        cosigners: Vec<Cosigner>,
        local_fingerprint: Fingerprint,
    },
}

/// Index cursor and issued addresses of one chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCursor {
    /// Next index to hand out; never moves backwards.
    pub next_index: u32,
    pub issued: Vec<AddressRecord>,
    /// Pre-derived addresses starting at `next_index`.
    #[serde(skip)]
    pub(crate) lookahead: VecDeque<DerivedAddress>,
}

/// An address together with how to spend from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedAddress {
    pub record: AddressRecord,
    pub script_pubkey: ScriptBuf,
    pub policy: InputPolicy,
}

/// Serializable account state, used by engine snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: AccountId,
    pub index: u32,
    pub script_type: ScriptType,
    pub network: BtcNetwork,
    pub origin: DerivationPath,
    pub kind: AccountKind,
    pub external: ChainCursor,
    pub internal: ChainCursor,
}

#[derive(Debug)]
pub struct Account {
    id: AccountId,
    index: u32,
    script_type: ScriptType,
    network: BtcNetwork,
    origin: DerivationPath,
    kind: AccountKind,
    external: Mutex<ChainCursor>,
    internal: Mutex<ChainCursor>,
}

impl Account {
    /// Public keys of a single-key account at `m/purpose'/coin'/index'`.
    pub fn single_sig_keys(
        session: &UnlockedSession,
        index: u32,
        script_type: ScriptType,
    ) -> Result<AccountKeys, WalletError> {
        let path = DerivationPath::single_sig_account(script_type, session.network(), index)?;
        account_keys(session, path, script_type, KeyPurpose::SingleSig)
    }

    /// Public keys of this wallet's share of a multisig account (BIP48).
    pub fn multisig_keys(
        session: &UnlockedSession,
        index: u32,
        script_type: ScriptType,
    ) -> Result<AccountKeys, WalletError> {
        let path = DerivationPath::multisig_account(script_type, session.network(), index)?;
        account_keys(session, path, script_type, KeyPurpose::Multisig)
    }

    pub fn single(
        session: &UnlockedSession,
        index: u32,
        script_type: ScriptType,
    ) -> Result<Self, WalletError> {
        let keys = Self::single_sig_keys(session, index, script_type)?;
        let fingerprint = session.master_fingerprint();
        Ok(Self::new(
            account_id(fingerprint, &keys.derivation_path),
            index,
            script_type,
            session.network(),
            keys.derivation_path,
            AccountKind::Single {
                master_fingerprint: fingerprint,
                account_xpub: keys.extended_public_key,
            },
        ))
    }

    /// Multisig account over `cosigners`, which must include this wallet's
    /// own key for the same account index and script type.
    pub fn multisig(
        session: &UnlockedSession,
        index: u32,
        script_type: ScriptType,
        threshold: usize,
        cosigners: Vec<Cosigner>,
    ) -> Result<Self, WalletError> {
        let network = session.network();
        let local = Self::multisig_keys(session, index, script_type)?;
        let local_fingerprint = session.master_fingerprint();

        let n = cosigners.len();
        if n == 0 || n > MAX_MULTISIG_KEYS {
            return Err(WalletError::Validation(format!(
                "cosigner count {n} outside 1..={MAX_MULTISIG_KEYS}"
            )));
        }
        if threshold == 0 || threshold > n {
            return Err(WalletError::Validation(format!(
                "threshold {threshold} outside 1..={n}"
            )));
        }

        let fingerprints: BTreeSet<Fingerprint> = cosigners.iter().map(|c| c.fingerprint).collect();
        if fingerprints.len() != n {
            return Err(WalletError::Validation("duplicate cosigner fingerprint".into()));
        }

        let mut pubkeys = BTreeSet::new();
        for cosigner in &cosigners {
            let node = validate_cosigner(cosigner, script_type, network)?;
            if !pubkeys.insert(node.public_key()) {
                return Err(WalletError::Validation("duplicate cosigner key".into()));
            }
        }

        let own = cosigners
            .iter()
            .find(|c| c.fingerprint == local_fingerprint)
            .ok_or_else(|| {
                WalletError::Validation("local signer is not one of the cosigners".into())
            })?;
        let own_node = own.node()?;
        let local_node = extended_key::decode_public(&local.extended_public_key)?.node;
        if own.origin != local.derivation_path || own_node.public_key() != local_node.public_key()
        {
            return Err(WalletError::Validation(
                "cosigner entry for this wallet does not match its own key".into(),
            ));
        }

        let account = Self::new(
            account_id(local_fingerprint, &local.derivation_path),
            index,
            script_type,
            network,
            local.derivation_path,
            AccountKind::Multisig {
                threshold,
                cosigners,
                local_fingerprint,
            },
        );
        tracing::info!(account = %account.id, threshold, cosigners = n, "multisig account created");
        Ok(account)
    }

    /// Rebuild an account from a snapshot, re-checking every stored key.
    pub fn from_record(record: AccountRecord) -> Result<Self, WalletError> {
        match &record.kind {
            AccountKind::Single { account_xpub, .. } => {
                extended_key::decode_public(account_xpub)?;
            }
            AccountKind::Multisig { cosigners, .. } => {
                for cosigner in cosigners {
                    validate_cosigner(cosigner, record.script_type, record.network)?;
                }
            }
        }
        let mut account = Self::new(
            record.id,
            record.index,
            record.script_type,
            record.network,
            record.origin,
            record.kind,
        );
        account.external = Mutex::new(fresh_cursor(record.external));
        account.internal = Mutex::new(fresh_cursor(record.internal));
        Ok(account)
    }

    fn new(
        id: AccountId,
        index: u32,
        script_type: ScriptType,
        network: BtcNetwork,
        origin: DerivationPath,
        kind: AccountKind,
    ) -> Self {
        Self {
            id,
            index,
            script_type,
            network,
            origin,
            kind,
            external: Mutex::new(ChainCursor::default()),
            internal: Mutex::new(ChainCursor::default()),
        }
    }

    pub fn id(&self) -> &AccountId {
        &self.id
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn script_type(&self) -> ScriptType {
        self.script_type
    }

    pub fn network(&self) -> BtcNetwork {
        self.network
    }

    /// Local account path, e.g. `m/84'/0'/0'` or `m/48'/0'/0'/2'`.
    pub fn origin(&self) -> &DerivationPath {
        &self.origin
    }

    pub fn kind(&self) -> &AccountKind {
        &self.kind
    }

    pub fn spend_kind(&self) -> SpendKind {
        match &self.kind {
            AccountKind::Single { .. } => SpendKind::SingleKey(self.script_type),
            AccountKind::Multisig {
                threshold,
                cosigners,
                ..
            } => SpendKind::Multisig {
                script_type: self.script_type,
                threshold: *threshold,
                cosigners: cosigners.len(),
            },
        }
    }

    /// Local key path of `branch/index`, from this wallet's master.
    pub fn local_path(&self, branch: ChainBranch, index: u32) -> Result<DerivationPath, WalletError> {
        Ok(self.origin.extend(&chain_tail(branch, index)?))
    }

    /// Derive the address at `branch/index` and its spending policy.
    pub fn derive_address(
        &self,
        branch: ChainBranch,
        index: u32,
    ) -> Result<DerivedAddress, WalletError> {
        let tail = chain_tail(branch, index)?;
        let relative = DerivationPath::from_segments(tail.to_vec());
        let path = self.origin.extend(&tail);

        let (address, policy) = match &self.kind {
            AccountKind::Single {
                master_fingerprint,
                account_xpub,
            } => {
                let node = extended_key::decode_public(account_xpub)?
                    .node
                    .derive_path(&relative)?;
                let pubkey = node.compressed_public_key()?;
                let address = single_key_address(&pubkey, self.script_type, self.network);
                let policy = InputPolicy::single_key(
                    self.script_type,
                    *master_fingerprint,
                    path.to_bip32(),
                    pubkey,
                );
                (address, policy)
            }
            AccountKind::Multisig {
                threshold,
                cosigners,
                ..
            } => {
                let mut pubkeys = Vec::with_capacity(cosigners.len());
                let mut keys = Vec::with_capacity(cosigners.len());
                for cosigner in cosigners {
                    let pubkey = cosigner.node()?.derive_path(&relative)?.compressed_public_key()?;
                    pubkeys.push(pubkey);
                    keys.push(CosignerKey {
                        fingerprint: cosigner.fingerprint,
                        pubkey: PublicKey::new(pubkey.0),
                        path: cosigner.origin.extend(&tail).to_bip32(),
                    });
                }
                let scripts = multisig_address(*threshold, &pubkeys, self.script_type, self.network)?;
                let policy = InputPolicy::multisig(self.script_type, *threshold, keys, &scripts)?;
                (scripts.address, policy)
            }
        };

        Ok(DerivedAddress {
            script_pubkey: address.script_pubkey(),
            record: AddressRecord {
                value: address.to_string(),
                derivation_path: path,
                branch,
                index,
                used: false,
            },
            policy,
        })
    }

    /// Issue the next receive address.
    pub fn next_receive_address(&self) -> Result<AddressRecord, WalletError> {
        let mut cursor = self.external.lock();
        let derived = self.derive_address(ChainBranch::External, cursor.next_index)?;
        cursor.next_index = next_index(cursor.next_index)?;
        cursor.issued.push(derived.record.clone());
        tracing::debug!(account = %self.id, index = derived.record.index, "receive address issued");
        Ok(derived.record)
    }

    /// Spending policy for `utxo`, checked against its locking script.
    pub fn input_policy(&self, utxo: &Utxo) -> Result<InputPolicy, WalletError> {
        let derived = self.derive_address(utxo.branch, utxo.address_index)?;
        if derived.script_pubkey != utxo.script_pubkey {
            return Err(WalletError::Validation(format!(
                "UTXO {}:{} does not pay to {} of account {}",
                utxo.txid, utxo.vout, derived.record.derivation_path, self.id
            )));
        }
        Ok(derived.policy)
    }

    /// Fingerprint of the master key this wallet holds in the account.
    pub fn local_fingerprint(&self) -> Fingerprint {
        match &self.kind {
            AccountKind::Single {
                master_fingerprint, ..
            } => *master_fingerprint,
            AccountKind::Multisig {
                local_fingerprint, ..
            } => *local_fingerprint,
        }
    }

    /// Whether the wallet's own key at some index of either chain is
    /// `pubkey`. Scans every issued index and `window` indices past each
    /// cursor, whatever script type the account renders them as.
    pub fn owns_key(&self, pubkey: &PublicKey, window: u32) -> Result<bool, WalletError> {
        let own = self.local_fingerprint();
        for branch in [ChainBranch::External, ChainBranch::Internal] {
            let end = self.next_index_of(branch).saturating_add(window);
            for index in 0..end {
                let derived = self.derive_address(branch, index)?;
                if derived
                    .policy
                    .key_for(own)
                    .is_some_and(|key| key.pubkey.inner == pubkey.inner)
                {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    pub fn issued_addresses(&self) -> Vec<AddressRecord> {
        let mut all = self.external.lock().issued.clone();
        all.extend(self.internal.lock().issued.iter().cloned());
        all
    }

    pub fn next_index_of(&self, branch: ChainBranch) -> u32 {
        self.cursor(branch).lock().next_index
    }

    /// Flag issued addresses that received the given outputs.
    pub fn mark_used(&self, utxos: &[Utxo]) {
        for branch in [ChainBranch::External, ChainBranch::Internal] {
            let mut cursor = self.cursor(branch).lock();
            for record in cursor.issued.iter_mut() {
                if utxos
                    .iter()
                    .any(|u| u.branch == branch && u.address_index == record.index)
                {
                    record.used = true;
                }
            }
        }
    }

    /// Move both cursors forward to at least the snapshot's positions.
    pub fn advance_to(&self, record: &AccountRecord) {
        for (branch, saved) in [
            (ChainBranch::External, &record.external),
            (ChainBranch::Internal, &record.internal),
        ] {
            let mut cursor = self.cursor(branch).lock();
            if saved.next_index > cursor.next_index {
                cursor.next_index = saved.next_index;
                cursor.lookahead.clear();
            }
            for issued in &saved.issued {
                if !cursor.issued.iter().any(|r| r.index == issued.index) {
                    cursor.issued.push(issued.clone());
                }
            }
            cursor.issued.sort_by_key(|r| r.index);
        }
    }

    pub fn record(&self) -> AccountRecord {
        AccountRecord {
            id: self.id.clone(),
            index: self.index,
            script_type: self.script_type,
            network: self.network,
            origin: self.origin.clone(),
            kind: self.kind.clone(),
            external: self.external.lock().clone(),
            internal: self.internal.lock().clone(),
        }
    }

    pub(crate) fn internal_cursor(&self) -> &Mutex<ChainCursor> {
        &self.internal
    }

    fn cursor(&self, branch: ChainBranch) -> &Mutex<ChainCursor> {
        match branch {
            ChainBranch::External => &self.external,
            ChainBranch::Internal => &self.internal,
        }
    }
}

pub(crate) fn next_index(index: u32) -> Result<u32, WalletError> {
    index
        .checked_add(1)
        .ok_or_else(|| WalletError::Internal("chain index counter overflow".into()))
}

fn chain_tail(branch: ChainBranch, index: u32) -> Result<[PathSegment; 2], WalletError> {
    Ok([
        PathSegment::normal(branch.index())?,
        PathSegment::normal(index)?,
    ])
}

fn fresh_cursor(mut cursor: ChainCursor) -> ChainCursor {
    cursor.lookahead.clear();
    cursor
}

fn account_id(fingerprint: Fingerprint, path: &DerivationPath) -> AccountId {
    let path = path.to_string();
    AccountId(format!("{fingerprint}{}", path.strip_prefix('m').unwrap_or(&path)))
}

fn account_keys(
    session: &UnlockedSession,
    path: DerivationPath,
    script_type: ScriptType,
    purpose: KeyPurpose,
) -> Result<AccountKeys, WalletError> {
    let node = session.derive_public(&path)?;
    let version = KeyVersion::public_for(session.network(), script_type, purpose);
    Ok(AccountKeys {
        extended_public_key: extended_key::encode_public(&node, version),
        master_fingerprint: session.master_fingerprint().to_string(),
        derivation_path: path,
        script_type,
    })
}

/// Check a cosigner key against the account's network, script type and the
/// `m/48'/coin'/account'/script'` template.
fn validate_cosigner(
    cosigner: &Cosigner,
    script_type: ScriptType,
    network: BtcNetwork,
) -> Result<KeyNode, WalletError> {
    let key = extended_key::decode_public(&cosigner.xpub)?;
    let fp = cosigner.fingerprint;

    if !key.version.matches_network(network) {
        return Err(WalletError::Validation(format!(
            "cosigner {fp} key is not for {network}"
        )));
    }
    if let Some(tagged) = key.version.script_type {
        if tagged != script_type {
            return Err(WalletError::Validation(format!(
                "cosigner {fp} key is tagged {tagged:?}, account is {script_type:?}"
            )));
        }
    }
    if key.version.purpose == Some(KeyPurpose::SingleSig) {
        return Err(WalletError::Validation(format!(
            "cosigner {fp} supplied a single-sig key"
        )));
    }

    let segments = cosigner.origin.segments();
    let template_ok = segments.len() == 4
        && segments.iter().all(|s| s.hardened)
        && segments[0].index == MULTISIG_PURPOSE
        && segments[1].index == network.coin_type()
        && segments[3].index == script_type.multisig_script_index();
    if !template_ok {
        return Err(WalletError::Validation(format!(
            "cosigner {fp} path {} does not follow m/48'/{}'/account'/{}'",
            cosigner.origin,
            network.coin_type(),
            script_type.multisig_script_index()
        )));
    }
    if usize::from(key.node.depth()) != segments.len() {
        return Err(WalletError::Validation(format!(
            "cosigner {fp} key depth {} does not match its path",
            key.node.depth()
        )));
    }
    Ok(key.node)
}
