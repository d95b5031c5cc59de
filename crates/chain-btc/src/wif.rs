//! Wallet Import Format for single private keys.
//!
//! Layout: `version || key(32) [|| 0x01]`, Base58Check-encoded. A trailing
//! `0x01` marks the key as belonging to a compressed public key.

use bitcoin::secp256k1::SecretKey;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{BtcError, WifError};
use crate::network::{BtcNetwork, MAINNET_WIF_VERSION, TESTNET_WIF_VERSION};

const UNCOMPRESSED_LEN: usize = 33;
const COMPRESSED_LEN: usize = 34;
const COMPRESSED_FLAG: u8 = 0x01;

/// A decoded WIF key. Test networks share one version byte, so a test key
/// always decodes as [`BtcNetwork::Testnet`].
pub struct DecodedWif {
    pub private_key: Zeroizing<[u8; 32]>,
    pub network: BtcNetwork,
    pub compressed: bool,
}

impl std::fmt::Debug for DecodedWif {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedWif")
            .field("private_key", &"[REDACTED]")
            .field("network", &self.network)
            .field("compressed", &self.compressed)
            .finish()
    }
}

/// Encode a 32-byte secp256k1 secret as WIF.
pub fn encode(
    private_key: &[u8; 32],
    network: BtcNetwork,
    compressed: bool,
) -> Result<String, BtcError> {
    SecretKey::from_slice(private_key)
        .map_err(|e| BtcError::InvalidPrivateKey(format!("not a valid secp256k1 scalar: {e}")))?;

    let mut payload = Vec::with_capacity(COMPRESSED_LEN);
    payload.push(network.wif_version());
    payload.extend_from_slice(private_key);
    if compressed {
        payload.push(COMPRESSED_FLAG);
    }

    let encoded = bs58::encode(&payload).with_check().into_string();
    payload.zeroize();
    Ok(encoded)
}

/// Decode a WIF string of either network family.
pub fn decode(wif: &str) -> Result<DecodedWif, WifError> {
    let payload = check_decode(wif)?;
    let network = network_of(payload[0])?;
    parse_payload(&payload, network)
}

/// Decode a WIF string, refusing keys that belong to another network family.
///
/// The version byte is checked before any key bytes are interpreted; on a
/// mismatch no key material is returned.
pub fn decode_for_network(wif: &str, required: BtcNetwork) -> Result<DecodedWif, WifError> {
    let payload = check_decode(wif)?;
    let found = network_of(payload[0])?;
    if !found.same_key_family(required) {
        tracing::warn!(%required, %found, "WIF network mismatch");
        return Err(WifError::NetworkMismatch {
            expected: required,
            found,
        });
    }
    let mut decoded = parse_payload(&payload, found)?;
    decoded.network = required;
    Ok(decoded)
}

fn check_decode(wif: &str) -> Result<Zeroizing<Vec<u8>>, WifError> {
    let trimmed = wif.trim();
    if trimmed.is_empty() {
        return Err(WifError::MalformedInput("empty input".into()));
    }

    let payload = bs58::decode(trimmed)
        .with_check(None)
        .into_vec()
        .map_err(|e| match e {
            bs58::decode::Error::InvalidChecksum { .. } => WifError::ChecksumInvalid,
            other => WifError::MalformedInput(other.to_string()),
        })?;
    let payload = Zeroizing::new(payload);

    if payload.is_empty() {
        return Err(WifError::MalformedInput("missing version byte".into()));
    }
    Ok(payload)
}

fn network_of(version: u8) -> Result<BtcNetwork, WifError> {
    match version {
        MAINNET_WIF_VERSION => Ok(BtcNetwork::Mainnet),
        TESTNET_WIF_VERSION => Ok(BtcNetwork::Testnet),
        other => Err(WifError::MalformedInput(format!(
            "unknown version byte 0x{other:02x}"
        ))),
    }
}

fn parse_payload(payload: &[u8], network: BtcNetwork) -> Result<DecodedWif, WifError> {
    let compressed = match payload.len() {
        UNCOMPRESSED_LEN => false,
        COMPRESSED_LEN if payload[33] == COMPRESSED_FLAG => true,
        COMPRESSED_LEN => {
            return Err(WifError::MalformedInput(format!(
                "bad compression flag 0x{:02x}",
                payload[33]
            )))
        }
        len => {
            return Err(WifError::MalformedInput(format!(
                "payload length {len}, expected 33 or 34"
            )))
        }
    };

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&payload[1..33]);
    SecretKey::from_slice(key.as_ref())
        .map_err(|_| WifError::MalformedInput("key is not a valid secp256k1 scalar".into()))?;

    Ok(DecodedWif {
        private_key: key,
        network,
        compressed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "0C28FCA386C7A227600B2FE50B7CAE11EC86D3BF1FBE471BE89827E19D72AA1D";
    const WIF_UNCOMPRESSED: &str = "5HueCGU8rMjxEXxiPuD5BDku4MkFqeZyd4dZ1jvhTVqvbTLvyTJ";
    const WIF_COMPRESSED: &str = "KwdMAjGmerYanjeui5SHS7JkmpZvVipYvB2LJGU1ZxJwYvP98617";

    fn key() -> [u8; 32] {
        hex::decode(KEY_HEX).unwrap().try_into().unwrap()
    }

    #[test]
    fn encodes_known_vectors() {
        assert_eq!(encode(&key(), BtcNetwork::Mainnet, false).unwrap(), WIF_UNCOMPRESSED);
        assert_eq!(encode(&key(), BtcNetwork::Mainnet, true).unwrap(), WIF_COMPRESSED);
    }

    #[test]
    fn decodes_known_vectors() {
        let d = decode(WIF_COMPRESSED).unwrap();
        assert_eq!(*d.private_key, key());
        assert_eq!(d.network, BtcNetwork::Mainnet);
        assert!(d.compressed);

        let d = decode(WIF_UNCOMPRESSED).unwrap();
        assert_eq!(*d.private_key, key());
        assert!(!d.compressed);
    }

    #[test]
    fn key_one_compressed() {
        let mut one = [0u8; 32];
        one[31] = 1;
        assert_eq!(
            encode(&one, BtcNetwork::Mainnet, true).unwrap(),
            "KwDiBf89QgGbjEhKnhXJuH7LrciVrZi3qYjgd9M7rFU73sVHnoWn"
        );
    }

    #[test]
    fn testnet_roundtrip_reports_test_family() {
        for network in [BtcNetwork::Testnet, BtcNetwork::Signet, BtcNetwork::Regtest] {
            let wif = encode(&key(), network, true).unwrap();
            assert!(wif.starts_with('c'));
            let d = decode(&wif).unwrap();
            assert_eq!(d.network, BtcNetwork::Testnet);
            assert_eq!(*d.private_key, key());
        }
    }

    #[test]
    fn encode_rejects_invalid_scalar() {
        assert!(matches!(
            encode(&[0u8; 32], BtcNetwork::Mainnet, true),
            Err(BtcError::InvalidPrivateKey(_))
        ));
        assert!(encode(&[0xff; 32], BtcNetwork::Mainnet, true).is_err());
    }

    #[test]
    fn altered_character_is_checksum_error() {
        let mut chars: Vec<char> = WIF_COMPRESSED.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == '7' { '8' } else { '7' };
        let tampered: String = chars.into_iter().collect();
        assert_eq!(decode(&tampered).unwrap_err(), WifError::ChecksumInvalid);
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(decode("0OIl"), Err(WifError::MalformedInput(_))));
        assert!(matches!(decode(""), Err(WifError::MalformedInput(_))));
    }

    #[test]
    fn wrong_length_is_malformed() {
        let short = bs58::encode([0x80u8; 20]).with_check().into_string();
        assert!(matches!(decode(&short), Err(WifError::MalformedInput(_))));
    }

    #[test]
    fn unknown_version_is_malformed() {
        let mut payload = vec![0x42];
        payload.extend_from_slice(&key());
        let wif = bs58::encode(payload).with_check().into_string();
        assert!(matches!(decode(&wif), Err(WifError::MalformedInput(_))));
    }

    #[test]
    fn network_mismatch_is_reported_without_key() {
        let err = decode_for_network(WIF_COMPRESSED, BtcNetwork::Testnet).unwrap_err();
        assert_eq!(
            err,
            WifError::NetworkMismatch {
                expected: BtcNetwork::Testnet,
                found: BtcNetwork::Mainnet,
            }
        );
    }

    #[test]
    fn decode_for_matching_network() {
        let wif = encode(&key(), BtcNetwork::Signet, true).unwrap();
        let d = decode_for_network(&wif, BtcNetwork::Signet).unwrap();
        assert_eq!(d.network, BtcNetwork::Signet);
    }

    #[test]
    fn debug_redacts_key() {
        let d = decode(WIF_COMPRESSED).unwrap();
        let shown = format!("{d:?}");
        assert!(shown.contains("REDACTED"));
        assert!(!shown.to_lowercase().contains(&KEY_HEX.to_lowercase()[..8]));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(256))]

            #[test]
            fn roundtrip_any_valid_key(
                bytes in proptest::array::uniform32(any::<u8>()),
                compressed in any::<bool>(),
                mainnet in any::<bool>(),
            ) {
                prop_assume!(SecretKey::from_slice(&bytes).is_ok());
                let network = if mainnet { BtcNetwork::Mainnet } else { BtcNetwork::Testnet };

                let wif = encode(&bytes, network, compressed).unwrap();
                let decoded = decode(&wif).unwrap();
                prop_assert_eq!(*decoded.private_key, bytes);
                prop_assert_eq!(decoded.network, network);
                prop_assert_eq!(decoded.compressed, compressed);
            }

            #[test]
            fn other_family_is_always_rejected(
                bytes in proptest::array::uniform32(any::<u8>()),
                compressed in any::<bool>(),
            ) {
                prop_assume!(SecretKey::from_slice(&bytes).is_ok());
                let wif = encode(&bytes, BtcNetwork::Mainnet, compressed).unwrap();
                let is_mismatch = matches!(
                    decode_for_network(&wif, BtcNetwork::Regtest),
                    Err(WifError::NetworkMismatch { .. })
                );
                prop_assert!(is_mismatch);
            }
        }
    }
}
