//! Unlocked key material.
//!
//! An [`UnlockedSession`] is the only holder of the master private key.
//! Anything that needs private material takes `&UnlockedSession` explicitly;
//! dropping or [`lock`](UnlockedSession::lock)ing it wipes the key.

use bitcoin::bip32::Fingerprint;
use chain_btc::BtcNetwork;
use crypto_utils::SealedBox;
use secrecy::{ExposeSecret, SecretString};

use crate::error::WalletError;
use crate::hd_derivation::{DerivationPath, KeyNode};
use crate::mnemonic;
use crate::seed_encryption;

pub struct UnlockedSession {
    master: KeyNode,
    network: BtcNetwork,
    fingerprint: Fingerprint,
}

impl UnlockedSession {
    pub fn unlock(seed: &[u8], network: BtcNetwork) -> Result<Self, WalletError> {
        let master = KeyNode::master(seed)?;
        let fingerprint = Fingerprint::from(master.fingerprint());
        tracing::info!(%fingerprint, %network, "session unlocked");
        Ok(Self {
            master,
            network,
            fingerprint,
        })
    }

    pub fn from_mnemonic(
        phrase: &SecretString,
        passphrase: &SecretString,
        network: BtcNetwork,
    ) -> Result<Self, WalletError> {
        let seed = mnemonic::secret_mnemonic_to_seed(phrase, passphrase)?;
        Self::unlock(&seed, network)
    }

    /// Open a sealed seed backup and unlock it.
    pub fn from_sealed_backup(
        sealed: &SealedBox,
        password: &SecretString,
        network: BtcNetwork,
    ) -> Result<Self, WalletError> {
        let seed = seed_encryption::open_seed(sealed, password.expose_secret().as_bytes())?;
        Self::unlock(&seed, network)
    }

    pub fn network(&self) -> BtcNetwork {
        self.network
    }

    pub fn master_fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Private node at `path` below the master key.
    pub fn derive(&self, path: &DerivationPath) -> Result<KeyNode, WalletError> {
        Ok(self.master.derive_path(path)?)
    }

    /// Public node at `path`; the private half never leaves this call.
    pub fn derive_public(&self, path: &DerivationPath) -> Result<KeyNode, WalletError> {
        Ok(self.master.derive_path(path)?.neuter())
    }

    /// End the session. The master key is wiped when `self` drops.
    pub fn lock(self) {
        tracing::info!(fingerprint = %self.fingerprint, "session locked");
    }
}

impl std::fmt::Debug for UnlockedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockedSession")
            .field("fingerprint", &self.fingerprint.to_string())
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}
