use bitcoin::bip32::{self, Fingerprint};
use bitcoin::secp256k1::{ecdsa, Message, Secp256k1};
use bitcoin::PublicKey;
use chain_btc::multisig::PsbtSigner;
use chain_btc::BtcError;

use crate::hd_derivation::DerivationPath;
use crate::session::UnlockedSession;

/// Software cosigner backed by an unlocked key tree.
pub struct SessionSigner<'a> {
    session: &'a UnlockedSession,
}

impl<'a> SessionSigner<'a> {
    pub fn new(session: &'a UnlockedSession) -> Self {
        Self { session }
    }
}

impl PsbtSigner for SessionSigner<'_> {
    fn fingerprint(&self) -> Fingerprint {
        self.session.master_fingerprint()
    }

    fn sign_sighash(
        &self,
        path: &bip32::DerivationPath,
        sighash: &[u8; 32],
    ) -> Result<(PublicKey, ecdsa::Signature), BtcError> {
        let node = self
            .session
            .derive(&DerivationPath::from_bip32(path))
            .map_err(|e| BtcError::SigningError(e.to_string()))?;
        let secret = node
            .secret_key()
            .map_err(|e| BtcError::SigningError(e.to_string()))?;

        let secp = Secp256k1::signing_only();
        let signature = secp.sign_ecdsa(&Message::from_digest(*sighash), &secret);
        let pubkey = PublicKey::new(secret.public_key(&secp));
        Ok((pubkey, signature))
    }
}
