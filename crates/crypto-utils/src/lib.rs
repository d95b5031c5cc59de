//! # crypto-utils
//!
//! Password-based sealing of exported key material, key derivation tiers,
//! zeroizing buffers, and secure random generation for the signing engine.

pub mod encryption;
pub mod error;
pub mod kdf;
pub mod random;
pub mod zeroizing;

pub use encryption::{open, seal, SealedBox};
pub use error::CryptoError;
pub use kdf::KdfProfile;
pub use zeroizing::ZeroizingBytes;
