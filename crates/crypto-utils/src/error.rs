use thiserror::Error;

/// Cryptographic operation errors.
///
/// `DecryptionFailed` deliberately carries no detail: a wrong password, a
/// tampered ciphertext and a malformed envelope all look the same to callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("key derivation failed: {0}")]
    KdfFailed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}
