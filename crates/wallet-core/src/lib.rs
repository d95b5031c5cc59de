//! # wallet-core
//!
//! Hierarchical key derivation, accounts, change issuance, transaction
//! building and multi-party signing for Bitcoin.
//!
//! [`WalletEngine`] is the request/response surface hosts talk to. Private
//! keys are only reachable through an [`UnlockedSession`] the host passes in
//! per call.

pub mod account;
pub mod builder;
pub mod change;
pub mod config;
pub mod engine;
pub mod error;
pub mod extended_key;
pub mod hd_derivation;
pub mod mnemonic;
pub mod seed_encryption;
pub mod session;
pub mod signer;
pub mod types;

pub use account::{Account, AccountKind, AccountRecord, Cosigner};
pub use builder::TransactionBuilder;
pub use change::ChangeAddressManager;
pub use config::EngineConfig;
pub use engine::{EngineSnapshot, ExportedKey, WalletEngine};
pub use error::{DerivationError, WalletError};
pub use hd_derivation::{DerivationPath, KeyNode, PathSegment};
pub use mnemonic::WordCount;
pub use session::UnlockedSession;
pub use signer::SessionSigner;
pub use types::{
    AccountId, AccountKeys, AddressRecord, ErrorCode, ImportedKey, ValidationError,
    ValidationResult,
};

pub use chain_btc::address::{ChainBranch, ScriptType};
pub use chain_btc::multisig::{FinalizedTransaction, MultisigPsbt, PsbtSigner, PsbtState};
pub use chain_btc::transaction::{Recipient, UnsignedTransaction};
pub use chain_btc::utxo::Utxo;
pub use chain_btc::BtcNetwork;
