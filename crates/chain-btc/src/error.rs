use bitcoin::bip32::Fingerprint;
use thiserror::Error;

use crate::network::BtcNetwork;

/// Bitcoin chain operation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BtcError {
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("output of {value} sat is below the dust floor of {floor} sat")]
    DustOutput { value: u64, floor: u64 },

    #[error("insufficient funds: have {have} sat, need {need} sat")]
    InsufficientFunds { have: u64, need: u64 },

    #[error("invalid multisig policy: {0}")]
    InvalidPolicy(String),

    #[error("transaction build error: {0}")]
    TransactionBuildError(String),

    #[error("signing error: {0}")]
    SigningError(String),

    #[error(transparent)]
    Wif(#[from] WifError),

    #[error(transparent)]
    Psbt(#[from] PsbtError),
}

/// WIF decoding and encoding failures.
///
/// The three decode failures are kept apart so callers can tell a typo
/// (`ChecksumInvalid`) from garbage (`MalformedInput`) from a key that is
/// fine but belongs to another network (`NetworkMismatch`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WifError {
    #[error("malformed WIF: {0}")]
    MalformedInput(String),

    #[error("WIF checksum invalid")]
    ChecksumInvalid,

    #[error("WIF is for {found}, wallet requires {expected}")]
    NetworkMismatch {
        expected: BtcNetwork,
        found: BtcNetwork,
    },
}

/// Failures of the PSBT signing state machine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PsbtError {
    #[error("fingerprint {fingerprint} is not a cosigner of this PSBT")]
    UnknownCosigner { fingerprint: Fingerprint },

    #[error("signature from {fingerprint} on input {input} failed verification")]
    SignatureMismatch { fingerprint: Fingerprint, input: usize },

    #[error("PSBTs encode different unsigned transactions")]
    Mismatch,

    #[error("PSBT is not fully signed: {signed} of {required} signatures on input {input}")]
    NotFullySigned {
        input: usize,
        signed: usize,
        required: usize,
    },

    #[error("cannot {operation} a PSBT in state {state}")]
    InvalidState {
        state: String,
        operation: &'static str,
    },

    #[error("PSBT rejected: {0}")]
    Rejected(String),

    #[error("signer failed: {0}")]
    Signer(String),

    #[error("sighash computation failed: {0}")]
    Sighash(String),

    #[error("invalid signing policy: {0}")]
    Policy(String),

    #[error("PSBT encoding error: {0}")]
    Encoding(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_insufficient_funds() {
        let err = BtcError::InsufficientFunds { have: 1_000, need: 40_200 };
        assert_eq!(err.to_string(), "insufficient funds: have 1000 sat, need 40200 sat");
    }

    #[test]
    fn display_dust_output() {
        let err = BtcError::DustOutput { value: 100, floor: 546 };
        assert!(err.to_string().contains("below the dust floor"));
    }

    #[test]
    fn wif_errors_are_distinct() {
        let mismatch = WifError::NetworkMismatch {
            expected: BtcNetwork::Mainnet,
            found: BtcNetwork::Testnet,
        };
        assert_ne!(mismatch, WifError::ChecksumInvalid);
        assert_eq!(mismatch.to_string(), "WIF is for testnet, wallet requires mainnet");
    }

    #[test]
    fn wif_error_converts_into_btc_error() {
        let err: BtcError = WifError::ChecksumInvalid.into();
        assert_eq!(err.to_string(), "WIF checksum invalid");
    }

    #[test]
    fn display_signature_mismatch_names_fingerprint() {
        let err = PsbtError::SignatureMismatch {
            fingerprint: Fingerprint::from([0xde, 0xad, 0xbe, 0xef]),
            input: 2,
        };
        assert_eq!(
            err.to_string(),
            "signature from deadbeef on input 2 failed verification"
        );
    }

    #[test]
    fn error_trait_is_implemented() {
        let err: Box<dyn std::error::Error> =
            Box::new(BtcError::InvalidPrivateKey("test".into()));
        assert!(err.to_string().contains("test"));
    }
}
