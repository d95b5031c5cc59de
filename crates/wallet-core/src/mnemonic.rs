use bip39::{Language, Mnemonic};
use crypto_utils::ZeroizingBytes;
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use crate::error::WalletError;

/// Phrase lengths the engine will generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordCount {
    Twelve,
    TwentyFour,
}

impl WordCount {
    fn entropy_len(self) -> usize {
        match self {
            WordCount::Twelve => 16,
            WordCount::TwentyFour => 32,
        }
    }
}

/// Generate a fresh BIP-39 phrase from OS randomness.
pub fn generate_mnemonic(words: WordCount) -> Result<SecretString, WalletError> {
    let entropy = crypto_utils::random::entropy(words.entropy_len())?;
    let mnemonic = Mnemonic::from_entropy_in(Language::English, &entropy)
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))?;
    Ok(SecretString::from(mnemonic.to_string()))
}

pub fn validate_mnemonic(phrase: &str) -> bool {
    Mnemonic::parse_in_normalized(Language::English, phrase).is_ok()
}

/// 64-byte BIP-39 seed for `phrase` and `passphrase`.
pub fn mnemonic_to_seed(phrase: &str, passphrase: &str) -> Result<ZeroizingBytes, WalletError> {
    let mnemonic = Mnemonic::parse_in_normalized(Language::English, phrase)
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))?;
    let mut seed = mnemonic.to_seed(passphrase);
    let out = ZeroizingBytes::new(seed.to_vec());
    seed.zeroize();
    Ok(out)
}

/// Same as [`mnemonic_to_seed`] for a phrase held as a secret.
pub fn secret_mnemonic_to_seed(
    phrase: &SecretString,
    passphrase: &SecretString,
) -> Result<ZeroizingBytes, WalletError> {
    mnemonic_to_seed(phrase.expose_secret(), passphrase.expose_secret())
}

pub fn is_valid_word(word: &str) -> bool {
    Language::English.find_word(word).is_some()
}
