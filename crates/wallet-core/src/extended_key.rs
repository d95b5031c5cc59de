//! Extended keys with SLIP-132 version prefixes.
//!
//! `xpub`/`tpub` say nothing about the script type. The `y`/`z` (`u`/`v`)
//! prefixes tag single-sig nested/native SegWit and the capitalized `Y`/`Z`
//! (`U`/`V`) prefixes tag the multisig variants. Base58Check and the 78-byte
//! layout are handled by `bip32::ExtendedKey`.

use std::str::FromStr;

use bip32::Prefix;
use chain_btc::address::ScriptType;
use chain_btc::BtcNetwork;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::DerivationError;
use crate::hd_derivation::KeyNode;

/// Whether a key belongs to a single-key or a multisig account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyPurpose {
    SingleSig,
    Multisig,
}

/// What a version prefix says about the key behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyVersion {
    pub prefix: Prefix,
    pub mainnet: bool,
    pub script_type: Option<ScriptType>,
    pub purpose: Option<KeyPurpose>,
}

const fn version(
    chars: &str,
    bytes: u32,
    mainnet: bool,
    script_type: Option<ScriptType>,
    purpose: Option<KeyPurpose>,
) -> KeyVersion {
    KeyVersion {
        prefix: Prefix::from_parts_unchecked(chars, bytes),
        mainnet,
        script_type,
        purpose,
    }
}

use KeyPurpose::{Multisig, SingleSig};
use ScriptType::{NativeSegwit, NestedSegwit};

const VERSIONS: [KeyVersion; 12] = [
    version("xpub", 0x0488_B21E, true, None, None),
    version("xprv", 0x0488_ADE4, true, None, None),
    version("ypub", 0x049D_7CB2, true, Some(NestedSegwit), Some(SingleSig)),
    version("zpub", 0x04B2_4746, true, Some(NativeSegwit), Some(SingleSig)),
    version("Ypub", 0x0295_B43F, true, Some(NestedSegwit), Some(Multisig)),
    version("Zpub", 0x02AA_7ED3, true, Some(NativeSegwit), Some(Multisig)),
    version("tpub", 0x0435_87CF, false, None, None),
    version("tprv", 0x0435_8394, false, None, None),
    version("upub", 0x044A_5262, false, Some(NestedSegwit), Some(SingleSig)),
    version("vpub", 0x045F_1CF6, false, Some(NativeSegwit), Some(SingleSig)),
    version("Upub", 0x0242_89EF, false, Some(NestedSegwit), Some(Multisig)),
    version("Vpub", 0x0257_5483, false, Some(NativeSegwit), Some(Multisig)),
];

impl KeyVersion {
    pub fn lookup(bytes: u32) -> Result<KeyVersion, DerivationError> {
        VERSIONS
            .iter()
            .copied()
            .find(|v| v.prefix.version() == bytes)
            .ok_or_else(|| {
                DerivationError::InvalidExtendedKey(format!("unknown version 0x{bytes:08x}"))
            })
    }

    pub fn is_private(&self) -> bool {
        self.prefix.is_private()
    }

    /// Public version for an account of this shape. Legacy accounts use the
    /// plain `xpub`/`tpub` prefix.
    pub fn public_for(network: BtcNetwork, script_type: ScriptType, purpose: KeyPurpose) -> Self {
        let mainnet = network.is_mainnet();
        VERSIONS
            .iter()
            .copied()
            .find(|v| {
                v.mainnet == mainnet
                    && v.script_type == Some(script_type)
                    && v.purpose == Some(purpose)
            })
            .unwrap_or_else(|| Self::plain(mainnet, false))
    }

    pub fn private_for(network: BtcNetwork) -> Self {
        Self::plain(network.is_mainnet(), true)
    }

    fn plain(mainnet: bool, private: bool) -> Self {
        let prefix = match (mainnet, private) {
            (true, false) => Prefix::XPUB,
            (true, true) => Prefix::XPRV,
            (false, false) => Prefix::TPUB,
            (false, true) => Prefix::TPRV,
        };
        KeyVersion {
            prefix,
            mainnet,
            script_type: None,
            purpose: None,
        }
    }

    /// Whether a key with this prefix may be used on `network`.
    pub fn matches_network(&self, network: BtcNetwork) -> bool {
        self.mainnet == network.is_mainnet()
    }
}

/// A parsed extended key and what its prefix claims.
#[derive(Debug, Clone)]
pub struct ExtendedKey {
    pub node: KeyNode,
    pub version: KeyVersion,
}

/// Serialize the public half of `node` under `version`.
pub fn encode_public(node: &KeyNode, version: KeyVersion) -> String {
    node.to_public_extended_key(version.prefix).to_string()
}

/// Serialize a private node as `xprv`/`tprv`.
pub fn encode_private(
    node: &KeyNode,
    network: BtcNetwork,
) -> Result<Zeroizing<String>, DerivationError> {
    let key = node.to_private_extended_key(KeyVersion::private_for(network).prefix)?;
    Ok(Zeroizing::new(key.to_string()))
}

/// Parse any known extended key prefix.
pub fn decode(encoded: &str) -> Result<ExtendedKey, DerivationError> {
    let key = bip32::ExtendedKey::from_str(encoded.trim())
        .map_err(|e| DerivationError::InvalidExtendedKey(e.to_string()))?;
    let version = KeyVersion::lookup(key.prefix.version())?;

    let attrs = &key.attrs;
    if attrs.depth == 0 && (attrs.parent_fingerprint != [0; 4] || attrs.child_number.0 != 0) {
        return Err(DerivationError::InvalidExtendedKey(
            "master key with a parent".into(),
        ));
    }
    if version.is_private() && key.key_bytes[0] != 0 {
        return Err(DerivationError::InvalidExtendedKey(
            "private key data must start with 0x00".into(),
        ));
    }

    let node = KeyNode::from_extended_key(key)?;
    Ok(ExtendedKey { node, version })
}

/// Parse an extended key that must be public.
pub fn decode_public(encoded: &str) -> Result<ExtendedKey, DerivationError> {
    let key = decode(encoded)?;
    if key.version.is_private() {
        return Err(DerivationError::InvalidExtendedKey(
            "expected an extended public key".into(),
        ));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hd_derivation::DerivationPath;

    const VECTOR1_SEED: &str = "000102030405060708090a0b0c0d0e0f";
    const VECTOR1_XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";
    const VECTOR1_XPRV: &str = "xprv9s21ZrQH143K3QTDL4LXw2F7HEK3wJUD2nW2nRk4stbPy6cq3jPPqjiChkVvvNKmPGJxWUtg6LnF5kejMRNNU3TGtRBeJgk33yuGBxrMPHi";
    const VECTOR1_H0_XPUB: &str = "xpub68Gmy5EdvgibQVfPdqkBBCHxA5htiqg55crXYuXoQRKfDBFA1WEjWgP6LHhwBZeNK1VTsfTFUHCdrfp1bgwQ9xv5ski8PX9rL2dZXvgGDnw";
    const BIP84_ACCOUNT_ZPUB: &str = "zpub6rFR7y4Q2AijBEqTUquhVz398htDFrtymD9xYYfG1m4wAcvPhXNfE3EfH1r1ADqtfSdVCToUG868RvUUkgDKf31mGDtKsAYz2oz2AGutZYs";

    fn vector1_master() -> KeyNode {
        KeyNode::master(&hex::decode(VECTOR1_SEED).unwrap()).unwrap()
    }

    #[test]
    fn encodes_bip32_vector1() {
        let m = vector1_master();
        let xpub = KeyVersion::public_for(BtcNetwork::Mainnet, ScriptType::Legacy, KeyPurpose::SingleSig);
        assert_eq!(encode_public(&m, xpub), VECTOR1_XPUB);
        assert_eq!(encode_private(&m, BtcNetwork::Mainnet).unwrap().as_str(), VECTOR1_XPRV);

        let child = m.derive_path(&"m/0'".parse().unwrap()).unwrap();
        assert_eq!(encode_public(&child, xpub), VECTOR1_H0_XPUB);
    }

    #[test]
    fn decodes_bip32_vector1() {
        let key = decode(VECTOR1_XPRV).unwrap();
        assert!(key.version.is_private());
        assert!(key.version.mainnet);
        assert_eq!(key.node.public_key(), vector1_master().public_key());

        let key = decode_public(VECTOR1_XPUB).unwrap();
        assert!(!key.node.is_private());
        assert_eq!(key.version.script_type, None);
    }

    #[test]
    fn bip84_account_zpub() {
        let seed = crate::mnemonic::mnemonic_to_seed(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
            "",
        )
        .unwrap();
        let path: DerivationPath = "m/84'/0'/0'".parse().unwrap();
        let account = KeyNode::master(&seed).unwrap().derive_path(&path).unwrap();
        let zpub = KeyVersion::public_for(
            BtcNetwork::Mainnet,
            ScriptType::NativeSegwit,
            KeyPurpose::SingleSig,
        );
        assert_eq!(encode_public(&account, zpub), BIP84_ACCOUNT_ZPUB);

        let parsed = decode_public(BIP84_ACCOUNT_ZPUB).unwrap();
        assert_eq!(parsed.version.script_type, Some(ScriptType::NativeSegwit));
        assert_eq!(parsed.version.purpose, Some(KeyPurpose::SingleSig));
        assert_eq!(parsed.node.depth(), 3);
    }

    #[test]
    fn multisig_prefixes() {
        let m = vector1_master();
        let zpub = encode_public(
            &m,
            KeyVersion::public_for(BtcNetwork::Mainnet, ScriptType::NativeSegwit, KeyPurpose::Multisig),
        );
        assert!(zpub.starts_with("Zpub"));
        let vpub = encode_public(
            &m,
            KeyVersion::public_for(BtcNetwork::Testnet, ScriptType::NativeSegwit, KeyPurpose::Multisig),
        );
        assert!(vpub.starts_with("Vpub"));
        let upub = encode_public(
            &m,
            KeyVersion::public_for(BtcNetwork::Signet, ScriptType::NestedSegwit, KeyPurpose::Multisig),
        );
        assert!(upub.starts_with("Upub"));
        let tpub = encode_public(
            &m,
            KeyVersion::public_for(BtcNetwork::Regtest, ScriptType::Legacy, KeyPurpose::Multisig),
        );
        assert!(tpub.starts_with("tpub"));

        let parsed = decode_public(&vpub).unwrap();
        assert!(!parsed.version.mainnet);
        assert!(parsed.version.matches_network(BtcNetwork::Testnet));
        assert!(!parsed.version.matches_network(BtcNetwork::Mainnet));
        assert_eq!(parsed.version.purpose, Some(KeyPurpose::Multisig));
    }

    #[test]
    fn every_public_version_encodes_under_its_own_prefix() {
        let account = vector1_master().derive_path(&"m/0'".parse().unwrap()).unwrap();
        for v in VERSIONS.iter().filter(|v| !v.is_private()) {
            let encoded = encode_public(&account, *v);
            assert!(encoded.starts_with(v.prefix.as_str()), "{encoded}");
            let parsed = decode_public(&encoded).unwrap();
            assert_eq!(parsed.version, *v);
            assert_eq!(parsed.node.public_key(), account.public_key());
        }
    }

    #[test]
    fn private_key_rejected_where_public_required() {
        assert!(matches!(
            decode_public(VECTOR1_XPRV),
            Err(DerivationError::InvalidExtendedKey(_))
        ));
    }

    #[test]
    fn public_node_cannot_encode_private() {
        assert_eq!(
            encode_private(&vector1_master().neuter(), BtcNetwork::Mainnet).unwrap_err(),
            DerivationError::PrivateKeyRequired
        );
    }

    #[test]
    fn corrupt_keys_rejected() {
        let mut chars: Vec<char> = VECTOR1_XPUB.chars().collect();
        chars[20] = if chars[20] == 'a' { 'b' } else { 'a' };
        let tampered: String = chars.into_iter().collect();
        assert!(decode(&tampered).is_err());

        let short = bitcoin::base58::encode_check(&[0u8; 40]);
        assert!(decode(&short).is_err());

        let mut unknown = vec![0xde, 0xad, 0xbe, 0xef];
        unknown.extend_from_slice(&[0u8; 74]);
        let unknown = bitcoin::base58::encode_check(&unknown);
        assert!(matches!(
            decode(&unknown),
            Err(DerivationError::InvalidExtendedKey(_))
        ));
    }
}
