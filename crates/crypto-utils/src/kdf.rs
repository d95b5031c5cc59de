use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

/// Salt length in bytes for every profile.
pub const SALT_SIZE: usize = 16;

/// Named Argon2id cost tiers.
///
/// Callers pick a tier by what they are protecting; the parameters themselves
/// are fixed here and cannot be tuned per call.
///
/// | profile        | memory    | iterations | lanes |
/// |----------------|-----------|------------|-------|
/// | `KeyExport`    | 19 MiB    | 2          | 1     |
/// | `WalletBackup` | 64 MiB    | 4          | 4     |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KdfProfile {
    /// Single private key leaving the wallet (WIF export).
    KeyExport,
    /// Whole-wallet seed backup.
    WalletBackup,
}

impl KdfProfile {
    /// Argon2 memory cost in KiB.
    pub const fn memory_kib(self) -> u32 {
        match self {
            KdfProfile::KeyExport => 19_456,
            KdfProfile::WalletBackup => 65_536,
        }
    }

    /// Argon2 iteration (time) cost.
    pub const fn iterations(self) -> u32 {
        match self {
            KdfProfile::KeyExport => 2,
            KdfProfile::WalletBackup => 4,
        }
    }

    /// Argon2 parallelism.
    pub const fn lanes(self) -> u32 {
        match self {
            KdfProfile::KeyExport => 1,
            KdfProfile::WalletBackup => 4,
        }
    }

    /// Stable label bound into the AEAD associated data.
    pub const fn label(self) -> &'static [u8] {
        match self {
            KdfProfile::KeyExport => b"vault/key-export/v1",
            KdfProfile::WalletBackup => b"vault/wallet-backup/v1",
        }
    }
}

/// Derives a 32-byte AES-256 key from `password` and `salt` using Argon2id
/// with the parameters of `profile`.
pub fn derive_key(
    password: &[u8],
    salt: &[u8; SALT_SIZE],
    profile: KdfProfile,
) -> Result<[u8; 32], CryptoError> {
    let params = Params::new(
        profile.memory_kib(),
        profile.iterations(),
        profile.lanes(),
        Some(32),
    )
    .map_err(|e| CryptoError::KdfFailed(format!("invalid argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut output = [0u8; 32];
    argon2
        .hash_password_into(password, salt, &mut output)
        .map_err(|e| CryptoError::KdfFailed(format!("argon2 hash failed: {e}")))?;

    Ok(output)
}
