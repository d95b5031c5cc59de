//! BIP32 hierarchical deterministic keys over secp256k1.
//!
//! Child key derivation is delegated to the `bip32` crate; this module owns
//! the path grammar and the account templates (BIP44/49/84 and BIP48). A
//! public-only node derives unhardened public children and can never produce
//! a private key.

use std::fmt;
use std::str::FromStr;

use bip32::{ChildNumber as Bip32ChildNumber, ExtendedKeyAttrs, Prefix, XPrv, XPub};
use bitcoin::bip32::ChildNumber;
use bitcoin::secp256k1::SecretKey;
use bitcoin::CompressedPublicKey;
use chain_btc::address::ScriptType;
use chain_btc::BtcNetwork;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::DerivationError;

/// Bit set on the child number of a hardened child.
pub const HARDENED_BIT: u32 = 0x8000_0000;

/// BIP48 purpose for multisig account templates.
pub const MULTISIG_PURPOSE: u32 = 48;

/// Seed sizes `bip32` accepts for a master key.
const SEED_LENGTHS: [usize; 3] = [16, 32, 64];

/// One component of a derivation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathSegment {
    /// Index without the hardened bit, always below 2^31.
    pub index: u32,
    pub hardened: bool,
}

impl PathSegment {
    pub fn normal(index: u32) -> Result<Self, DerivationError> {
        if index >= HARDENED_BIT {
            return Err(DerivationError::IndexOverflow(format!(
                "unhardened index {index} does not fit below 2^31"
            )));
        }
        Ok(Self {
            index,
            hardened: false,
        })
    }

    pub fn hardened(index: u32) -> Result<Self, DerivationError> {
        if index >= HARDENED_BIT {
            return Err(DerivationError::IndexOverflow(format!(
                "hardened index {index} must be below 2^31"
            )));
        }
        Ok(Self {
            index,
            hardened: true,
        })
    }

    /// Split a raw 32-bit child number; the top bit selects hardening.
    pub fn from_child_number(child_number: u32) -> Self {
        Self {
            index: child_number & !HARDENED_BIT,
            hardened: child_number & HARDENED_BIT != 0,
        }
    }

    pub fn child_number(self) -> u32 {
        if self.hardened {
            self.index | HARDENED_BIT
        } else {
            self.index
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hardened {
            write!(f, "{}'", self.index)
        } else {
            write!(f, "{}", self.index)
        }
    }
}

/// Ordered path from a master key, written `m/84'/0'/0'/1/5`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DerivationPath(Vec<PathSegment>);

impl DerivationPath {
    pub fn master() -> Self {
        Self::default()
    }

    pub fn from_segments(segments: Vec<PathSegment>) -> Self {
        Self(segments)
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn child(&self, segment: PathSegment) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment);
        Self(segments)
    }

    pub fn extend(&self, tail: &[PathSegment]) -> Self {
        let mut segments = self.0.clone();
        segments.extend_from_slice(tail);
        Self(segments)
    }

    /// `m/purpose'/coin'/account'` for a single-key account (BIP44/49/84).
    pub fn single_sig_account(
        script_type: ScriptType,
        network: BtcNetwork,
        account: u32,
    ) -> Result<Self, DerivationError> {
        Ok(Self(vec![
            PathSegment::hardened(script_type.purpose())?,
            PathSegment::hardened(network.coin_type())?,
            PathSegment::hardened(account)?,
        ]))
    }

    /// `m/48'/coin'/account'/script'` for a multisig account (BIP48).
    pub fn multisig_account(
        script_type: ScriptType,
        network: BtcNetwork,
        account: u32,
    ) -> Result<Self, DerivationError> {
        Ok(Self(vec![
            PathSegment::hardened(MULTISIG_PURPOSE)?,
            PathSegment::hardened(network.coin_type())?,
            PathSegment::hardened(account)?,
            PathSegment::hardened(script_type.multisig_script_index())?,
        ]))
    }

    pub fn to_bip32(&self) -> bitcoin::bip32::DerivationPath {
        self.0
            .iter()
            .map(|s| ChildNumber::from(s.child_number()))
            .collect::<Vec<_>>()
            .into()
    }

    pub fn from_bip32(path: &bitcoin::bip32::DerivationPath) -> Self {
        Self(
            path.as_ref()
                .iter()
                .map(|c| PathSegment::from_child_number(u32::from(*c)))
                .collect(),
        )
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("m")?;
        for segment in &self.0 {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for DerivationPath {
    type Err = DerivationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('/');
        match parts.next() {
            Some("m") | Some("M") => {}
            _ => {
                return Err(DerivationError::InvalidPath(format!(
                    "path must start with 'm': {s:?}"
                )))
            }
        }
        parts.map(parse_segment).collect::<Result<Vec<_>, _>>().map(Self)
    }
}

fn parse_segment(part: &str) -> Result<PathSegment, DerivationError> {
    let (digits, hardened) = match part.strip_suffix(|c| matches!(c, '\'' | 'h' | 'H')) {
        Some(digits) => (digits, true),
        None => (part, false),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DerivationError::InvalidPath(format!(
            "bad path component {part:?}"
        )));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| DerivationError::IndexOverflow(format!("index {digits} is too large")))?;

    if hardened {
        let index = u32::try_from(value)
            .map_err(|_| DerivationError::IndexOverflow(format!("index {digits} is too large")))?;
        PathSegment::hardened(index)
    } else {
        let raw = u32::try_from(value).map_err(|_| {
            DerivationError::IndexOverflow(format!("index {digits} does not fit in 32 bits"))
        })?;
        Ok(PathSegment::from_child_number(raw))
    }
}

impl TryFrom<String> for DerivationPath {
    type Error = DerivationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DerivationPath> for String {
    fn from(path: DerivationPath) -> Self {
        path.to_string()
    }
}

#[derive(Clone)]
enum NodeKey {
    Private(XPrv),
    Public(XPub),
}

/// A node of a BIP32 key tree.
#[derive(Clone)]
pub struct KeyNode(NodeKey);

impl KeyNode {
    /// Master node of the tree rooted at `seed` (16, 32 or 64 bytes).
    pub fn master(seed: &[u8]) -> Result<Self, DerivationError> {
        if !SEED_LENGTHS.contains(&seed.len()) {
            return Err(DerivationError::InvalidKey(format!(
                "seed must be 16, 32 or 64 bytes, got {}",
                seed.len()
            )));
        }
        XPrv::new(seed)
            .map(|xprv| Self(NodeKey::Private(xprv)))
            .map_err(key_error)
    }

    /// Rebuild a node from a parsed extended key. The prefix decides whether
    /// the key bytes are read as private or public.
    pub fn from_extended_key(key: bip32::ExtendedKey) -> Result<Self, DerivationError> {
        if key.prefix.is_private() {
            XPrv::try_from(key)
                .map(|xprv| Self(NodeKey::Private(xprv)))
                .map_err(|_| DerivationError::InvalidKey("private key is not a valid scalar".into()))
        } else {
            if !matches!(key.key_bytes[0], 0x02 | 0x03) {
                return Err(DerivationError::InvalidKey(
                    "public key is not in compressed form".into(),
                ));
            }
            XPub::try_from(key)
                .map(|xpub| Self(NodeKey::Public(xpub)))
                .map_err(|_| DerivationError::InvalidKey("public key is not on the curve".into()))
        }
    }

    fn attrs(&self) -> &ExtendedKeyAttrs {
        match &self.0 {
            NodeKey::Private(xprv) => xprv.attrs(),
            NodeKey::Public(xpub) => xpub.attrs(),
        }
    }

    fn xpub(&self) -> XPub {
        match &self.0 {
            NodeKey::Private(xprv) => xprv.public_key(),
            NodeKey::Public(xpub) => xpub.clone(),
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self.0, NodeKey::Private(_))
    }

    pub fn private_key(&self) -> Option<Zeroizing<[u8; 32]>> {
        match &self.0 {
            NodeKey::Private(xprv) => Some(Zeroizing::new(xprv.to_bytes())),
            NodeKey::Public(_) => None,
        }
    }

    /// SEC1 compressed public key.
    pub fn public_key(&self) -> [u8; 33] {
        match &self.0 {
            NodeKey::Private(xprv) => xprv.public_key().to_bytes(),
            NodeKey::Public(xpub) => xpub.to_bytes(),
        }
    }

    pub fn chain_code(&self) -> [u8; 32] {
        self.attrs().chain_code
    }

    pub fn depth(&self) -> u8 {
        self.attrs().depth
    }

    pub fn parent_fingerprint(&self) -> [u8; 4] {
        self.attrs().parent_fingerprint
    }

    pub fn child_number(&self) -> u32 {
        self.attrs().child_number.0
    }

    /// First four bytes of HASH160 of the public key.
    pub fn fingerprint(&self) -> [u8; 4] {
        self.xpub().fingerprint()
    }

    pub fn compressed_public_key(&self) -> Result<CompressedPublicKey, DerivationError> {
        CompressedPublicKey::from_slice(&self.public_key())
            .map_err(|e| DerivationError::InvalidKey(e.to_string()))
    }

    pub fn secret_key(&self) -> Result<SecretKey, DerivationError> {
        let key = self.private_key().ok_or(DerivationError::PrivateKeyRequired)?;
        SecretKey::from_slice(&key[..]).map_err(|e| DerivationError::InvalidKey(e.to_string()))
    }

    /// Same node with the private half dropped.
    pub fn neuter(&self) -> KeyNode {
        KeyNode(NodeKey::Public(self.xpub()))
    }

    /// Serialize the public half under `prefix`.
    pub fn to_public_extended_key(&self, prefix: Prefix) -> bip32::ExtendedKey {
        self.xpub().to_extended_key(prefix)
    }

    pub fn to_private_extended_key(
        &self,
        prefix: Prefix,
    ) -> Result<bip32::ExtendedKey, DerivationError> {
        match &self.0 {
            NodeKey::Private(xprv) => Ok(xprv.to_extended_key(prefix)),
            NodeKey::Public(_) => Err(DerivationError::PrivateKeyRequired),
        }
    }

    /// CKDpriv when this node holds a private key, CKDpub otherwise.
    pub fn derive_child(&self, segment: PathSegment) -> Result<KeyNode, DerivationError> {
        if self.depth() == u8::MAX {
            return Err(DerivationError::IndexOverflow("depth exceeds 255".into()));
        }
        let child_number = Bip32ChildNumber::new(segment.index, segment.hardened).map_err(|_| {
            DerivationError::IndexOverflow(format!("index {} must be below 2^31", segment.index))
        })?;
        let node = match &self.0 {
            NodeKey::Private(xprv) => {
                NodeKey::Private(xprv.derive_child(child_number).map_err(key_error)?)
            }
            NodeKey::Public(_) if segment.hardened => {
                return Err(DerivationError::PrivateKeyRequired)
            }
            NodeKey::Public(xpub) => {
                NodeKey::Public(xpub.derive_child(child_number).map_err(key_error)?)
            }
        };
        Ok(KeyNode(node))
    }

    pub fn derive_path(&self, path: &DerivationPath) -> Result<KeyNode, DerivationError> {
        path.segments()
            .iter()
            .try_fold(self.clone(), |node, segment| node.derive_child(*segment))
    }
}

impl fmt::Debug for KeyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyNode")
            .field("private_key", &self.is_private().then_some("[REDACTED]"))
            .field("public_key", &hex::encode(self.public_key()))
            .field("depth", &self.depth())
            .field("parent_fingerprint", &hex::encode(self.parent_fingerprint()))
            .field("child_number", &self.child_number())
            .finish()
    }
}

/// Derive the node at `path` below `parent`. Deterministic and side-effect free.
pub fn derive(parent: &KeyNode, path: &DerivationPath) -> Result<KeyNode, DerivationError> {
    parent.derive_path(path)
}

fn key_error(err: bip32::Error) -> DerivationError {
    match err {
        bip32::Error::Depth => DerivationError::IndexOverflow("depth exceeds 255".into()),
        other => DerivationError::InvalidKey(other.to_string()),
    }
}
