use chain_btc::{BtcError, PsbtError, WifError};
use crypto_utils::CryptoError;
use thiserror::Error;

use crate::types::ErrorCode;

/// BIP32 derivation and extended-key failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DerivationError {
    #[error("invalid derivation path: {0}")]
    InvalidPath(String),

    #[error("hardened derivation requires a private key")]
    PrivateKeyRequired,

    #[error("child index out of range: {0}")]
    IndexOverflow(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid extended key: {0}")]
    InvalidExtendedKey(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("key derivation failed: {0}")]
    Derivation(#[from] DerivationError),

    #[error("insufficient funds: have {have} sat, need {need} sat")]
    InsufficientFunds { have: u64, need: u64 },

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error(transparent)]
    Wif(#[from] WifError),

    #[error(transparent)]
    Psbt(#[from] PsbtError),

    #[error("unknown account: {0}")]
    UnknownAccount(String),

    #[error("key already present in wallet: {0}")]
    DuplicateImport(String),

    #[error("change address {0} was already issued")]
    AddressReused(String),

    #[error(transparent)]
    Chain(BtcError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WalletError {
    /// Boundary error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            WalletError::Validation(_)
            | WalletError::InvalidMnemonic(_)
            | WalletError::Wif(_)
            | WalletError::UnknownAccount(_)
            | WalletError::DuplicateImport(_) => ErrorCode::Validation,
            WalletError::Derivation(_) => ErrorCode::DerivationFailed,
            WalletError::InsufficientFunds { .. } => ErrorCode::InsufficientFunds,
            WalletError::DecryptionFailed => ErrorCode::DecryptionFailed,
            WalletError::Psbt(e) => psbt_code(e),
            WalletError::Chain(e) => match e {
                BtcError::SigningError(_) | BtcError::TransactionBuildError(_) => {
                    ErrorCode::Internal
                }
                _ => ErrorCode::Validation,
            },
            WalletError::EncryptionFailed(_)
            | WalletError::AddressReused(_)
            | WalletError::Internal(_) => ErrorCode::Internal,
        }
    }
}

fn psbt_code(err: &PsbtError) -> ErrorCode {
    match err {
        PsbtError::SignatureMismatch { .. } => ErrorCode::SignatureMismatch,
        PsbtError::UnknownCosigner { .. } | PsbtError::Rejected(_) => ErrorCode::Rejected,
        PsbtError::NotFullySigned { .. } => ErrorCode::NotFullySigned,
        PsbtError::Mismatch => ErrorCode::Mismatch,
        PsbtError::InvalidState { .. } | PsbtError::Policy(_) | PsbtError::Encoding(_) => {
            ErrorCode::Validation
        }
        PsbtError::Signer(_) | PsbtError::Sighash(_) => ErrorCode::Internal,
    }
}

impl From<BtcError> for WalletError {
    fn from(e: BtcError) -> Self {
        match e {
            BtcError::InsufficientFunds { have, need } => {
                WalletError::InsufficientFunds { have, need }
            }
            BtcError::Wif(e) => WalletError::Wif(e),
            BtcError::Psbt(e) => WalletError::Psbt(e),
            other => WalletError::Chain(other),
        }
    }
}

impl From<CryptoError> for WalletError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::DecryptionFailed => WalletError::DecryptionFailed,
            other => WalletError::EncryptionFailed(other.to_string()),
        }
    }
}
