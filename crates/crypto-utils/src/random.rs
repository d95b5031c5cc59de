//! OS randomness for sealing parameters and mnemonic entropy.

use rand::RngCore;
use rand_core::OsRng;

use crate::encryption::NONCE_SIZE;
use crate::error::CryptoError;
use crate::kdf::SALT_SIZE;
use crate::zeroizing::ZeroizingBytes;

/// Largest entropy request served; BIP-39 tops out at 32 bytes.
pub const MAX_ENTROPY_LEN: usize = 64;

/// Fresh Argon2 salt for one sealing operation.
pub fn salt() -> [u8; SALT_SIZE] {
    let mut buf = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Fresh AES-GCM nonce. Never reused: every seal draws a new key too.
pub fn nonce() -> [u8; NONCE_SIZE] {
    let mut buf = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// `len` bytes of secret entropy, wiped on drop.
pub fn entropy(len: usize) -> Result<ZeroizingBytes, CryptoError> {
    if len == 0 || len > MAX_ENTROPY_LEN {
        return Err(CryptoError::InvalidInput(format!(
            "entropy length {len} outside 1..={MAX_ENTROPY_LEN}"
        )));
    }
    let mut buf = ZeroizingBytes::new(vec![0u8; len]);
    OsRng.fill_bytes(buf.as_mut_slice());
    Ok(buf)
}
