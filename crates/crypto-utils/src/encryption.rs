//! Password sealing for exported key material.
//!
//! Argon2id (fixed tier, see [`KdfProfile`]) stretches the password into an
//! AES-256-GCM key. The nonce, salt and tag travel next to the ciphertext so
//! the envelope can be stored or shown as-is.

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce, Tag};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::kdf::{self, KdfProfile, SALT_SIZE};
use crate::random;
use crate::zeroizing::ZeroizingBytes;

/// AES-256-GCM nonce size in bytes.
pub const NONCE_SIZE: usize = 12;

/// AES-256-GCM authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// A sealed payload together with everything needed to open it, except the password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    pub ciphertext: Vec<u8>,
    pub salt: [u8; SALT_SIZE],
    pub nonce: [u8; NONCE_SIZE],
    pub auth_tag: [u8; TAG_SIZE],
    pub profile: KdfProfile,
}

impl SealedBox {
    /// Reassemble a box from loose parts (e.g. separate storage columns).
    ///
    /// Wrong part lengths are reported as [`CryptoError::DecryptionFailed`],
    /// the same error a wrong password produces.
    pub fn from_parts(
        ciphertext: Vec<u8>,
        salt: &[u8],
        nonce: &[u8],
        auth_tag: &[u8],
        profile: KdfProfile,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            ciphertext,
            salt: salt.try_into().map_err(|_| CryptoError::DecryptionFailed)?,
            nonce: nonce.try_into().map_err(|_| CryptoError::DecryptionFailed)?,
            auth_tag: auth_tag.try_into().map_err(|_| CryptoError::DecryptionFailed)?,
            profile,
        })
    }
}

/// Encrypts `plaintext` under a key stretched from `password` with `profile`.
pub fn seal(plaintext: &[u8], password: &[u8], profile: KdfProfile) -> Result<SealedBox, CryptoError> {
    if password.is_empty() {
        return Err(CryptoError::InvalidInput("password must not be empty".into()));
    }

    let salt = random::salt();
    let nonce = random::nonce();

    let mut key = kdf::derive_key(password, &salt, profile)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    key.zeroize();

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), profile.label(), &mut buffer)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut auth_tag = [0u8; TAG_SIZE];
    auth_tag.copy_from_slice(&tag);

    tracing::debug!(?profile, len = buffer.len(), "sealed payload");

    Ok(SealedBox {
        ciphertext: buffer,
        salt,
        nonce,
        auth_tag,
        profile,
    })
}

/// Decrypts a [`SealedBox`].
///
/// Every failure collapses into [`CryptoError::DecryptionFailed`].
pub fn open(sealed: &SealedBox, password: &[u8]) -> Result<ZeroizingBytes, CryptoError> {
    let mut key = kdf::derive_key(password, &sealed.salt, sealed.profile)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    key.zeroize();

    let mut buffer = sealed.ciphertext.clone();
    let result = cipher.decrypt_in_place_detached(
        Nonce::from_slice(&sealed.nonce),
        sealed.profile.label(),
        &mut buffer,
        Tag::from_slice(&sealed.auth_tag),
    );

    match result {
        Ok(()) => Ok(ZeroizingBytes::new(buffer)),
        Err(_) => {
            buffer.zeroize();
            Err(CryptoError::DecryptionFailed)
        }
    }
}
