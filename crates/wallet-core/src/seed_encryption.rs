use crypto_utils::{KdfProfile, SealedBox, ZeroizingBytes};

use crate::error::WalletError;

/// Seal a whole-wallet seed under the backup KDF tier.
pub fn seal_seed(seed: &[u8], password: &[u8]) -> Result<SealedBox, WalletError> {
    let sealed = crypto_utils::seal(seed, password, KdfProfile::WalletBackup)?;
    tracing::info!("wallet seed sealed for backup");
    Ok(sealed)
}

/// Open a sealed seed. A box sealed under another tier is refused.
pub fn open_seed(sealed: &SealedBox, password: &[u8]) -> Result<ZeroizingBytes, WalletError> {
    if sealed.profile != KdfProfile::WalletBackup {
        return Err(WalletError::Validation(format!(
            "sealed box uses the {:?} profile, not a wallet backup",
            sealed.profile
        )));
    }
    Ok(crypto_utils::open(sealed, password)?)
}

/// Serialize a sealed seed to JSON for storage.
pub fn serialize_sealed_seed(sealed: &SealedBox) -> Result<String, WalletError> {
    serde_json::to_string(sealed)
        .map_err(|e| WalletError::Internal(format!("serialization failed: {e}")))
}

pub fn deserialize_sealed_seed(json: &str) -> Result<SealedBox, WalletError> {
    serde_json::from_str(json)
        .map_err(|e| WalletError::Validation(format!("malformed sealed seed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let seed = [0xDE, 0xAD, 0xBE, 0xEF].repeat(16);
        let sealed = seal_seed(&seed, b"strong-password-123!").unwrap();
        assert_eq!(sealed.profile, KdfProfile::WalletBackup);
        assert_eq!(sealed.ciphertext.len(), 64);

        let opened = open_seed(&sealed, b"strong-password-123!").unwrap();
        assert_eq!(&*opened, seed.as_slice());
    }

    #[test]
    fn test_wrong_password_fails() {
        let sealed = seal_seed(&[0xCA; 32], b"correct-password").unwrap();
        assert_eq!(
            open_seed(&sealed, b"wrong-password").unwrap_err(),
            WalletError::DecryptionFailed
        );
    }

    #[test]
    fn test_key_export_box_refused() {
        let sealed = crypto_utils::seal(&[1u8; 32], b"pw", KdfProfile::KeyExport).unwrap();
        assert!(matches!(open_seed(&sealed, b"pw"), Err(WalletError::Validation(_))));
    }

    #[test]
    fn test_serialize_deserialize() {
        let seed = vec![0xAB; 32];
        let sealed = seal_seed(&seed, b"test").unwrap();
        let json = serialize_sealed_seed(&sealed).unwrap();
        let restored = deserialize_sealed_seed(&json).unwrap();
        assert_eq!(restored, sealed);
        assert_eq!(&*open_seed(&restored, b"test").unwrap(), seed.as_slice());
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            deserialize_sealed_seed("{not json"),
            Err(WalletError::Validation(_))
        ));
    }
}
