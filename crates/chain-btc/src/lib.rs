//! Bitcoin chain support for the signing engine.
//!
//! Script and address encoding for single-key and sorted-multisig outputs,
//! the WIF codec, fee shapes, privacy-randomized coin selection, unsigned
//! transaction assembly, and the PSBT threshold-signing state machine.

pub mod address;
pub mod error;
pub mod multisig;
pub mod network;
pub mod transaction;
pub mod utxo;
pub mod wif;

pub use error::{BtcError, PsbtError, WifError};
pub use network::BtcNetwork;
