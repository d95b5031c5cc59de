use chain_btc::address::{ChainBranch, ScriptType};
use chain_btc::BtcNetwork;
use serde::{Deserialize, Serialize};

use crate::hd_derivation::DerivationPath;

/// Error taxonomy reported across the engine boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Validation,
    InsufficientFunds,
    DerivationFailed,
    DecryptionFailed,
    SignatureMismatch,
    Rejected,
    NotFullySigned,
    Mismatch,
    Internal,
}

/// Stable account identifier: `<master fingerprint>/<account path>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An address issued from one of an account's chains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub value: String,
    /// Full path from the local master key.
    pub derivation_path: DerivationPath,
    pub branch: ChainBranch,
    pub index: u32,
    /// Set once an output paying this address has been observed.
    pub used: bool,
}

/// Public half of an account, safe to hand to cosigners or a watch-only host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountKeys {
    /// SLIP-132 encoded account-level extended public key.
    pub extended_public_key: String,
    /// Fingerprint of the master key, hex.
    pub master_fingerprint: String,
    pub derivation_path: DerivationPath,
    pub script_type: ScriptType,
}

impl AccountKeys {
    /// Key-origin form `[fingerprint/path]xpub`, as cosigners exchange it.
    pub fn key_origin(&self) -> String {
        let path = self.derivation_path.to_string();
        let suffix = path.strip_prefix('m').unwrap_or(&path);
        format!(
            "[{}{}]{}",
            self.master_fingerprint, suffix, self.extended_public_key
        )
    }
}

/// Outcome of a side-effect-free WIF import preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub network: Option<BtcNetwork>,
    pub first_address: Option<String>,
    pub address_type: Option<ScriptType>,
    pub error: Option<ValidationError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub code: ErrorCode,
    pub message: String,
}

/// A single key brought in from another wallet, stored sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedKey {
    pub first_address: String,
    pub address_type: ScriptType,
    pub network: BtcNetwork,
    pub sealed: crypto_utils::SealedBox,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_origin_format() {
        let keys = AccountKeys {
            extended_public_key: "tpubXYZ".into(),
            master_fingerprint: "73c5da0a".into(),
            derivation_path: "m/48'/1'/0'/2'".parse().unwrap(),
            script_type: ScriptType::NativeSegwit,
        };
        assert_eq!(keys.key_origin(), "[73c5da0a/48'/1'/0'/2']tpubXYZ");
    }

    #[test]
    fn account_id_display() {
        assert_eq!(AccountId("73c5da0a/84'/0'/0'".into()).to_string(), "73c5da0a/84'/0'/0'");
    }

    #[test]
    fn error_code_serializes_as_name() {
        let json = serde_json::to_string(&ErrorCode::InsufficientFunds).unwrap();
        assert_eq!(json, "\"InsufficientFunds\"");
    }
}
