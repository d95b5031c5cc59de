//! Threshold signing over BIP174 PSBTs.
//!
//! [`MultisigPsbt`] wraps a [`Psbt`] with the signing policy of every input
//! and tracks the lifecycle
//! `Draft → PartiallySigned(k/n) → FullySigned → Finalized → Broadcast`,
//! with `Rejected` reachable from anywhere. Single-key spends use the same
//! machinery as a 1-of-1 quorum.
//!
//! Every signature is checked against the input's sighash and the expected
//! cosigner key before it touches the PSBT. A failed operation leaves the
//! PSBT exactly as it was.

use std::collections::BTreeSet;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::script::{Builder, PushBytesBuf, ScriptBuf};
use bitcoin::secp256k1::{ecdsa, Message, Secp256k1, Verification};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{CompressedPublicKey, PublicKey, TxOut, Txid, Witness};
use serde::{Deserialize, Serialize};

use crate::address::{MultisigScripts, ScriptType};
use crate::error::{BtcError, PsbtError};
use crate::transaction::UnsignedTransaction;

/// One key allowed to sign an input, with its BIP32 origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CosignerKey {
    /// Master fingerprint of the cosigner's key tree.
    pub fingerprint: Fingerprint,
    pub pubkey: PublicKey,
    /// Full path from the cosigner's master to `pubkey`.
    pub path: DerivationPath,
}

/// How one input is unlocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputPolicy {
    pub script_type: ScriptType,
    pub threshold: usize,
    /// Signing keys; BIP67 order for multisig.
    pub keys: Vec<CosignerKey>,
    pub witness_script: Option<ScriptBuf>,
    pub redeem_script: Option<ScriptBuf>,
}

impl InputPolicy {
    /// Policy for an output locked to a single key.
    pub fn single_key(
        script_type: ScriptType,
        fingerprint: Fingerprint,
        path: DerivationPath,
        pubkey: CompressedPublicKey,
    ) -> Self {
        let redeem_script = match script_type {
            ScriptType::NestedSegwit => Some(ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash())),
            _ => None,
        };
        Self {
            script_type,
            threshold: 1,
            keys: vec![CosignerKey {
                fingerprint,
                pubkey: PublicKey::new(pubkey.0),
                path,
            }],
            witness_script: None,
            redeem_script,
        }
    }

    /// Policy for a sorted multisig output. `keys` may be in any order; they
    /// are matched to the BIP67 order of `scripts.sorted_keys`.
    pub fn multisig(
        script_type: ScriptType,
        threshold: usize,
        keys: Vec<CosignerKey>,
        scripts: &MultisigScripts,
    ) -> Result<Self, BtcError> {
        if keys.len() != scripts.sorted_keys.len() {
            return Err(BtcError::InvalidPolicy(format!(
                "{} cosigner keys for a {}-key script",
                keys.len(),
                scripts.sorted_keys.len()
            )));
        }
        let mut ordered = Vec::with_capacity(keys.len());
        for pubkey in &scripts.sorted_keys {
            let key = keys
                .iter()
                .find(|k| k.pubkey == *pubkey)
                .ok_or_else(|| BtcError::InvalidPolicy("cosigner key missing from script".into()))?;
            ordered.push(key.clone());
        }
        Ok(Self {
            script_type,
            threshold,
            keys: ordered,
            witness_script: scripts.witness_script.clone(),
            redeem_script: scripts.redeem_script.clone(),
        })
    }

    /// Whether the input is locked by an `OP_CHECKMULTISIG` script.
    pub fn is_multisig(&self) -> bool {
        match self.script_type {
            ScriptType::Legacy => self.redeem_script.is_some(),
            _ => self.witness_script.is_some(),
        }
    }

    pub fn key_for(&self, fingerprint: Fingerprint) -> Option<&CosignerKey> {
        self.keys.iter().find(|k| k.fingerprint == fingerprint)
    }

    pub fn key_by_pubkey(&self, pubkey: &PublicKey) -> Option<&CosignerKey> {
        self.keys.iter().find(|k| k.pubkey == *pubkey)
    }

    fn validate(&self) -> Result<(), PsbtError> {
        if self.keys.is_empty() || self.threshold == 0 || self.threshold > self.keys.len() {
            return Err(PsbtError::Policy(format!(
                "threshold {} with {} keys",
                self.threshold,
                self.keys.len()
            )));
        }
        let distinct: BTreeSet<Fingerprint> = self.keys.iter().map(|k| k.fingerprint).collect();
        if distinct.len() != self.keys.len() {
            return Err(PsbtError::Policy("duplicate cosigner fingerprint".into()));
        }
        Ok(())
    }
}

/// Signing threshold and the cosigners allowed to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quorum {
    pub threshold: usize,
    pub cosigners: Vec<Fingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PsbtState {
    Draft,
    PartiallySigned { signed: usize, total: usize },
    FullySigned,
    Finalized,
    Broadcast,
    Rejected { reason: String },
}

impl std::fmt::Display for PsbtState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PsbtState::Draft => write!(f, "draft"),
            PsbtState::PartiallySigned { signed, total } => {
                write!(f, "partially signed ({signed}/{total})")
            }
            PsbtState::FullySigned => write!(f, "fully signed"),
            PsbtState::Finalized => write!(f, "finalized"),
            PsbtState::Broadcast => write!(f, "broadcast"),
            PsbtState::Rejected { reason } => write!(f, "rejected: {reason}"),
        }
    }
}

/// A signed transaction ready for the broadcast collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedTransaction {
    pub raw_tx_hex: String,
    pub txid: Txid,
}

/// Something able to produce ECDSA signatures for one cosigner: a software
/// key tree or a hardware device handle.
pub trait PsbtSigner {
    /// Master fingerprint identifying the cosigner.
    fn fingerprint(&self) -> Fingerprint;

    /// Sign a 32-byte sighash with the key at `path`, returning that key too.
    fn sign_sighash(
        &self,
        path: &DerivationPath,
        sighash: &[u8; 32],
    ) -> Result<(PublicKey, ecdsa::Signature), BtcError>;
}

/// A PSBT and its threshold-signing state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigPsbt {
    psbt: Psbt,
    quorum: Quorum,
    policies: Vec<InputPolicy>,
    prevouts: Vec<TxOut>,
    state: PsbtState,
    finalized: Option<FinalizedTransaction>,
}

type StagedSignature = (usize, PublicKey, bitcoin::ecdsa::Signature);

impl MultisigPsbt {
    /// Wrap an unsigned transaction, attaching prevouts, scripts and the
    /// BIP32 origin of every cosigner key to each PSBT input.
    pub fn from_unsigned(unsigned: &UnsignedTransaction) -> Result<Self, PsbtError> {
        let inputs = unsigned.tx.input.len();
        if unsigned.input_policies.len() != inputs || unsigned.prevouts.len() != inputs {
            return Err(PsbtError::Policy(format!(
                "{inputs} inputs, {} policies, {} prevouts",
                unsigned.input_policies.len(),
                unsigned.prevouts.len()
            )));
        }

        let mut threshold = None;
        let mut cosigners = BTreeSet::new();
        for policy in &unsigned.input_policies {
            policy.validate()?;
            match threshold {
                None => threshold = Some(policy.threshold),
                Some(t) if t != policy.threshold => {
                    return Err(PsbtError::Policy("inputs disagree on threshold".into()))
                }
                Some(_) => {}
            }
            cosigners.extend(policy.keys.iter().map(|k| k.fingerprint));
        }
        let threshold =
            threshold.ok_or_else(|| PsbtError::Policy("transaction has no inputs".into()))?;

        let mut psbt = Psbt::from_unsigned_tx(unsigned.tx.clone())
            .map_err(|e| PsbtError::Encoding(e.to_string()))?;
        for ((input, policy), prevout) in psbt
            .inputs
            .iter_mut()
            .zip(&unsigned.input_policies)
            .zip(&unsigned.prevouts)
        {
            if policy.script_type.is_segwit() {
                input.witness_utxo = Some(prevout.clone());
            }
            input.witness_script = policy.witness_script.clone();
            input.redeem_script = policy.redeem_script.clone();
            input.sighash_type = Some(EcdsaSighashType::All.into());
            for key in &policy.keys {
                input
                    .bip32_derivation
                    .insert(key.pubkey.inner, (key.fingerprint, key.path.clone()));
            }
        }

        tracing::debug!(inputs, threshold, cosigners = cosigners.len(), "created PSBT");

        Ok(Self {
            psbt,
            quorum: Quorum {
                threshold,
                cosigners: cosigners.into_iter().collect(),
            },
            policies: unsigned.input_policies.clone(),
            prevouts: unsigned.prevouts.clone(),
            state: PsbtState::Draft,
            finalized: None,
        })
    }

    pub fn state(&self) -> &PsbtState {
        &self.state
    }

    pub fn quorum(&self) -> &Quorum {
        &self.quorum
    }

    pub fn psbt(&self) -> &Psbt {
        &self.psbt
    }

    pub fn policies(&self) -> &[InputPolicy] {
        &self.policies
    }

    pub fn txid(&self) -> Txid {
        self.psbt.unsigned_tx.compute_txid()
    }

    pub fn finalized(&self) -> Option<&FinalizedTransaction> {
        self.finalized.as_ref()
    }

    /// Fingerprints holding a signature on input `index`.
    pub fn input_signers(&self, index: usize) -> BTreeSet<Fingerprint> {
        let (Some(input), Some(policy)) = (self.psbt.inputs.get(index), self.policies.get(index))
        else {
            return BTreeSet::new();
        };
        input
            .partial_sigs
            .keys()
            .filter_map(|pk| policy.key_by_pubkey(pk).map(|k| k.fingerprint))
            .collect()
    }

    /// Fingerprints with a signature on any input.
    pub fn signed_fingerprints(&self) -> BTreeSet<Fingerprint> {
        (0..self.psbt.inputs.len())
            .flat_map(|i| self.input_signers(i))
            .collect()
    }

    /// Every input has at least its threshold of signatures.
    pub fn is_complete(&self) -> bool {
        self.policies
            .iter()
            .enumerate()
            .all(|(i, p)| self.input_signers(i).len() >= p.threshold)
    }

    /// Legacy or SegWit v0 sighash (`SIGHASH_ALL`) of input `index`.
    pub fn sighash(&self, index: usize) -> Result<[u8; 32], PsbtError> {
        let policy = self
            .policies
            .get(index)
            .ok_or_else(|| PsbtError::Sighash(format!("no input {index}")))?;
        let prevout = self
            .prevouts
            .get(index)
            .ok_or_else(|| PsbtError::Sighash(format!("no prevout for input {index}")))?;
        let mut cache = SighashCache::new(&self.psbt.unsigned_tx);
        let sighash_err = |e: &dyn std::fmt::Display| PsbtError::Sighash(e.to_string());
        let missing = |what: &str| PsbtError::Policy(format!("input {index} has no {what}"));

        let digest = match (policy.is_multisig(), policy.script_type) {
            (false, ScriptType::NativeSegwit) => cache
                .p2wpkh_signature_hash(index, &prevout.script_pubkey, prevout.value, EcdsaSighashType::All)
                .map_err(|e| sighash_err(&e))?
                .to_byte_array(),
            (false, ScriptType::NestedSegwit) => {
                let program = policy.redeem_script.as_ref().ok_or_else(|| missing("redeem script"))?;
                cache
                    .p2wpkh_signature_hash(index, program, prevout.value, EcdsaSighashType::All)
                    .map_err(|e| sighash_err(&e))?
                    .to_byte_array()
            }
            (false, ScriptType::Legacy) => cache
                .legacy_signature_hash(index, &prevout.script_pubkey, EcdsaSighashType::All.to_u32())
                .map_err(|e| sighash_err(&e))?
                .to_byte_array(),
            (true, ScriptType::Legacy) => {
                let redeem = policy.redeem_script.as_ref().ok_or_else(|| missing("redeem script"))?;
                cache
                    .legacy_signature_hash(index, redeem, EcdsaSighashType::All.to_u32())
                    .map_err(|e| sighash_err(&e))?
                    .to_byte_array()
            }
            (true, _) => {
                let script = policy.witness_script.as_ref().ok_or_else(|| missing("witness script"))?;
                cache
                    .p2wsh_signature_hash(index, script, prevout.value, EcdsaSighashType::All)
                    .map_err(|e| sighash_err(&e))?
                    .to_byte_array()
            }
        };
        Ok(digest)
    }

    /// Ask `signer` to sign every input it is a cosigner of.
    ///
    /// Returns how many signatures were added. Inputs the signer already
    /// signed are skipped, so re-applying the same signer is a no-op.
    pub fn apply_signature(&mut self, signer: &dyn PsbtSigner) -> Result<usize, PsbtError> {
        self.ensure_signable("sign")?;

        let fingerprint = signer.fingerprint();
        if !self.quorum.cosigners.contains(&fingerprint) {
            tracing::warn!(%fingerprint, "signature from unknown cosigner refused");
            return Err(PsbtError::UnknownCosigner { fingerprint });
        }

        let secp = Secp256k1::verification_only();
        let mut staged: Vec<StagedSignature> = Vec::new();
        for (index, policy) in self.policies.iter().enumerate() {
            let Some(key) = policy.key_for(fingerprint) else {
                continue;
            };
            if self.psbt.inputs[index].partial_sigs.contains_key(&key.pubkey) {
                continue;
            }

            let sighash = self.sighash(index)?;
            let (pubkey, signature) = signer
                .sign_sighash(&key.path, &sighash)
                .map_err(|e| PsbtError::Signer(e.to_string()))?;
            if pubkey != key.pubkey || !verify(&secp, &sighash, &pubkey, &signature) {
                tracing::warn!(%fingerprint, input = index, "signer returned a bad signature");
                return Err(PsbtError::SignatureMismatch {
                    fingerprint,
                    input: index,
                });
            }
            staged.push((index, pubkey, bitcoin::ecdsa::Signature::sighash_all(signature)));
        }

        let added = self.commit(staged);
        tracing::info!(%fingerprint, added, state = %self.state, "applied signature");
        Ok(added)
    }

    /// Add one externally produced signature to input `index`.
    ///
    /// Returns `false` if that key had already signed the input.
    pub fn add_partial_signature(
        &mut self,
        index: usize,
        pubkey: PublicKey,
        signature: bitcoin::ecdsa::Signature,
    ) -> Result<bool, PsbtError> {
        self.ensure_signable("sign")?;
        let staged = self.check_signature(index, &pubkey, &signature, &Secp256k1::verification_only())?;
        if staged.is_none() {
            return Ok(false);
        }
        Ok(self.commit(staged.into_iter().collect()) == 1)
    }

    /// Union the signature sets of `other` into this PSBT.
    ///
    /// Fails with [`PsbtError::Mismatch`] when the two wrap different unsigned
    /// transactions or policies. Incoming signatures are verified first; on
    /// any failure nothing is merged.
    pub fn merge(&mut self, other: &MultisigPsbt) -> Result<usize, PsbtError> {
        if self.quorum != other.quorum || self.policies != other.policies {
            return Err(PsbtError::Mismatch);
        }
        if let PsbtState::Rejected { reason } = &other.state {
            return Err(PsbtError::Rejected(reason.clone()));
        }
        self.merge_psbt(&other.psbt)
    }

    /// Merge the signatures of a bare PSBT (e.g. returned by a cosigner's
    /// own wallet) into this one.
    pub fn merge_psbt(&mut self, other: &Psbt) -> Result<usize, PsbtError> {
        self.ensure_signable("merge")?;
        if self.psbt.unsigned_tx != other.unsigned_tx {
            return Err(PsbtError::Mismatch);
        }

        let secp = Secp256k1::verification_only();
        let mut staged = Vec::new();
        for (index, input) in other.inputs.iter().enumerate() {
            for (pubkey, signature) in &input.partial_sigs {
                if let Some(entry) = self.check_signature(index, pubkey, signature, &secp)? {
                    staged.push(entry);
                }
            }
        }

        let added = self.commit(staged);
        tracing::info!(added, state = %self.state, "merged PSBT");
        Ok(added)
    }

    /// Re-check every signature, e.g. after restoring a snapshot from
    /// elsewhere. The first bad one moves the PSBT to `Rejected`.
    pub fn verify(&mut self) -> Result<(), PsbtError> {
        if let Some(err) = self.first_bad_signature()? {
            self.reject(err.to_string());
            return Err(err);
        }
        Ok(())
    }

    fn first_bad_signature(&self) -> Result<Option<PsbtError>, PsbtError> {
        let secp = Secp256k1::verification_only();
        if self.psbt.inputs.len() != self.policies.len() {
            return Ok(Some(PsbtError::Policy("input and policy counts differ".into())));
        }
        for (input, (index, policy)) in self.psbt.inputs.iter().zip(self.policies.iter().enumerate()) {
            for (pubkey, signature) in &input.partial_sigs {
                let Some(key) = policy.key_by_pubkey(pubkey) else {
                    return Ok(Some(PsbtError::Policy(format!(
                        "input {index} carries a signature from a key outside its policy"
                    ))));
                };
                let sighash = self.sighash(index)?;
                if signature.sighash_type != EcdsaSighashType::All
                    || !verify(&secp, &sighash, pubkey, &signature.signature)
                {
                    return Ok(Some(PsbtError::SignatureMismatch {
                        fingerprint: key.fingerprint,
                        input: index,
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Assemble the unlocking data of every input and extract the signed
    /// transaction.
    pub fn finalize(&mut self) -> Result<FinalizedTransaction, PsbtError> {
        match &self.state {
            PsbtState::FullySigned => {}
            PsbtState::Draft | PsbtState::PartiallySigned { .. } => {
                return Err(self.first_incomplete_input());
            }
            other => {
                return Err(PsbtError::InvalidState {
                    state: other.to_string(),
                    operation: "finalize",
                })
            }
        }

        let mut unlocks = Vec::with_capacity(self.policies.len());
        for (index, policy) in self.policies.iter().enumerate() {
            unlocks.push(self.unlocking_data(index, policy)?);
        }

        let mut tx = self.psbt.unsigned_tx.clone();
        for (index, (script_sig, witness)) in unlocks.into_iter().enumerate() {
            tx.input[index].script_sig = script_sig.clone();
            tx.input[index].witness = witness.clone();

            let input = &mut self.psbt.inputs[index];
            input.final_script_sig = (!script_sig.is_empty()).then_some(script_sig);
            input.final_script_witness = (!witness.is_empty()).then_some(witness);
            input.partial_sigs.clear();
            input.bip32_derivation.clear();
            input.sighash_type = None;
            input.redeem_script = None;
            input.witness_script = None;
        }

        let finalized = FinalizedTransaction {
            raw_tx_hex: serialize_hex(&tx),
            txid: tx.compute_txid(),
        };
        self.finalized = Some(finalized.clone());
        self.state = PsbtState::Finalized;
        tracing::info!(txid = %finalized.txid, "finalized PSBT");
        Ok(finalized)
    }

    /// Record that the finalized transaction was handed to the network.
    pub fn mark_broadcast(&mut self) -> Result<&FinalizedTransaction, PsbtError> {
        if self.state != PsbtState::Finalized {
            return Err(PsbtError::InvalidState {
                state: self.state.to_string(),
                operation: "broadcast",
            });
        }
        self.state = PsbtState::Broadcast;
        self.finalized.as_ref().ok_or_else(|| PsbtError::InvalidState {
            state: "finalized without transaction".into(),
            operation: "broadcast",
        })
    }

    pub fn reject(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(%reason, "PSBT rejected");
        self.state = PsbtState::Rejected { reason };
    }

    /// BIP174 base64 encoding of the wrapped PSBT.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.psbt.serialize())
    }

    /// Decode a BIP174 base64 PSBT.
    pub fn decode_base64(encoded: &str) -> Result<Psbt, PsbtError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| PsbtError::Encoding(e.to_string()))?;
        Psbt::deserialize(&bytes).map_err(|e| PsbtError::Encoding(e.to_string()))
    }

    fn ensure_signable(&self, operation: &'static str) -> Result<(), PsbtError> {
        if self.psbt.inputs.len() != self.policies.len() {
            return Err(PsbtError::Policy("input and policy counts differ".into()));
        }
        match &self.state {
            PsbtState::Draft | PsbtState::PartiallySigned { .. } | PsbtState::FullySigned => Ok(()),
            PsbtState::Rejected { reason } => Err(PsbtError::Rejected(reason.clone())),
            other => Err(PsbtError::InvalidState {
                state: other.to_string(),
                operation,
            }),
        }
    }

    /// Verify a candidate signature. `Ok(None)` if the key already signed.
    fn check_signature<C: Verification>(
        &self,
        index: usize,
        pubkey: &PublicKey,
        signature: &bitcoin::ecdsa::Signature,
        secp: &Secp256k1<C>,
    ) -> Result<Option<StagedSignature>, PsbtError> {
        let policy = self
            .policies
            .get(index)
            .ok_or_else(|| PsbtError::Policy(format!("no input {index}")))?;
        let key = policy.key_by_pubkey(pubkey).ok_or_else(|| {
            PsbtError::Policy(format!("key {pubkey} is not a cosigner of input {index}"))
        })?;
        if self.psbt.inputs[index].partial_sigs.contains_key(pubkey) {
            return Ok(None);
        }

        let sighash = self.sighash(index)?;
        if signature.sighash_type != EcdsaSighashType::All
            || !verify(secp, &sighash, pubkey, &signature.signature)
        {
            return Err(PsbtError::SignatureMismatch {
                fingerprint: key.fingerprint,
                input: index,
            });
        }
        Ok(Some((index, *pubkey, *signature)))
    }

    fn commit(&mut self, staged: Vec<StagedSignature>) -> usize {
        let added = staged.len();
        for (index, pubkey, signature) in staged {
            self.psbt.inputs[index].partial_sigs.insert(pubkey, signature);
        }
        self.refresh_state();
        added
    }

    fn refresh_state(&mut self) {
        let signed = self.signed_fingerprints().len();
        self.state = if signed == 0 {
            PsbtState::Draft
        } else if self.is_complete() {
            PsbtState::FullySigned
        } else {
            PsbtState::PartiallySigned {
                signed,
                total: self.quorum.cosigners.len(),
            }
        };
    }

    fn first_incomplete_input(&self) -> PsbtError {
        for (input, policy) in self.policies.iter().enumerate() {
            let signed = self.input_signers(input).len();
            if signed < policy.threshold {
                return PsbtError::NotFullySigned {
                    input,
                    signed,
                    required: policy.threshold,
                };
            }
        }
        PsbtError::InvalidState {
            state: self.state.to_string(),
            operation: "finalize",
        }
    }

    /// scriptSig and witness for input `index`.
    fn unlocking_data(
        &self,
        index: usize,
        policy: &InputPolicy,
    ) -> Result<(ScriptBuf, Witness), PsbtError> {
        let partial = &self.psbt.inputs[index].partial_sigs;
        // Signatures in key order, as OP_CHECKMULTISIG requires.
        let sigs: Vec<(&CosignerKey, Vec<u8>)> = policy
            .keys
            .iter()
            .filter_map(|k| partial.get(&k.pubkey).map(|s| (k, s.to_vec())))
            .take(policy.threshold)
            .collect();
        if sigs.len() < policy.threshold {
            return Err(PsbtError::NotFullySigned {
                input: index,
                signed: sigs.len(),
                required: policy.threshold,
            });
        }
        let missing = |what: &str| PsbtError::Policy(format!("input {index} has no {what}"));

        if !policy.is_multisig() {
            let (key, sig) = &sigs[0];
            return match policy.script_type {
                ScriptType::NativeSegwit => Ok((
                    ScriptBuf::new(),
                    Witness::from_slice(&[sig.clone(), key.pubkey.to_bytes()]),
                )),
                ScriptType::NestedSegwit => {
                    let program = policy.redeem_script.as_ref().ok_or_else(|| missing("redeem script"))?;
                    Ok((
                        push_only(&[program.to_bytes()])?,
                        Witness::from_slice(&[sig.clone(), key.pubkey.to_bytes()]),
                    ))
                }
                ScriptType::Legacy => Ok((
                    push_only(&[sig.clone(), key.pubkey.to_bytes()])?,
                    Witness::default(),
                )),
            };
        }

        let sig_items: Vec<Vec<u8>> = sigs.into_iter().map(|(_, s)| s).collect();
        match policy.script_type {
            ScriptType::Legacy => {
                let redeem = policy.redeem_script.as_ref().ok_or_else(|| missing("redeem script"))?;
                let mut items = vec![Vec::new()];
                items.extend(sig_items);
                items.push(redeem.to_bytes());
                Ok((push_only(&items)?, Witness::default()))
            }
            segwit => {
                let script = policy.witness_script.as_ref().ok_or_else(|| missing("witness script"))?;
                let mut items = vec![Vec::new()];
                items.extend(sig_items);
                items.push(script.to_bytes());
                let script_sig = if segwit == ScriptType::NestedSegwit {
                    let redeem = policy.redeem_script.as_ref().ok_or_else(|| missing("redeem script"))?;
                    push_only(&[redeem.to_bytes()])?
                } else {
                    ScriptBuf::new()
                };
                Ok((script_sig, Witness::from_slice(&items)))
            }
        }
    }
}

/// Merge two copies of the same PSBT into a new one.
pub fn merge(a: &MultisigPsbt, b: &MultisigPsbt) -> Result<MultisigPsbt, PsbtError> {
    let mut merged = a.clone();
    merged.merge(b)?;
    Ok(merged)
}

fn verify<C: Verification>(
    secp: &Secp256k1<C>,
    sighash: &[u8; 32],
    pubkey: &PublicKey,
    signature: &ecdsa::Signature,
) -> bool {
    let msg = Message::from_digest(*sighash);
    secp.verify_ecdsa(&msg, signature, &pubkey.inner).is_ok()
}

/// A push-only script; empty items become `OP_0`.
fn push_only(items: &[Vec<u8>]) -> Result<ScriptBuf, PsbtError> {
    let mut builder = Builder::new();
    for item in items {
        builder = if item.is_empty() {
            builder.push_int(0)
        } else {
            let push = PushBytesBuf::try_from(item.clone())
                .map_err(|e| PsbtError::Encoding(format!("script push: {e}")))?;
            builder.push_slice(push)
        };
    }
    Ok(builder.into_script())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::address::{multisig_address, single_key_address, ChainBranch};
    use crate::network::BtcNetwork;
    use crate::transaction::{assemble, DUST_THRESHOLD_SAT};
    use crate::utxo::{SelectionStrategy, Utxo, UtxoSelection};
    use bitcoin::absolute::LockTime;
    use std::str::FromStr;

    fn recipient() -> ScriptBuf {
        single_key_address(&compressed(9), ScriptType::NativeSegwit, BtcNetwork::Testnet).script_pubkey()
    }

    fn make_unsigned(spk: ScriptBuf, policies: Vec<InputPolicy>, amount: u64) -> UnsignedTransaction {
        let chosen: Vec<Utxo> = (0..policies.len())
            .map(|i| Utxo {
                txid: Txid::from_byte_array([i as u8 + 1; 32]),
                vout: i as u32,
                amount_sat: amount,
                script_pubkey: spk.clone(),
                branch: ChainBranch::External,
                address_index: 0,
                is_coinbase: false,
                confirmations: 3,
            })
            .collect();
        let total = amount * policies.len() as u64;
        let selection = UtxoSelection {
            chosen,
            total_sat: total,
            fee_sat: 1_000,
            change_sat: 0,
            strategy: SelectionStrategy::RandomShuffle,
        };
        assemble(
            &selection,
            &[(recipient(), total - 1_000)],
            None,
            policies,
            LockTime::ZERO,
            DUST_THRESHOLD_SAT,
        )
        .unwrap()
    }

    fn cosigner(byte: u8) -> CosignerKey {
        CosignerKey {
            fingerprint: fingerprint(byte),
            pubkey: PublicKey::new(compressed(byte).0),
            path: DerivationPath::from_str("m/48'/1'/0'/2'/0/0").unwrap(),
        }
    }

    fn two_of_three(script_type: ScriptType, inputs: usize) -> MultisigPsbt {
        let keys = [compressed(0xA), compressed(0xB), compressed(0xC)];
        let scripts = multisig_address(2, &keys, script_type, BtcNetwork::Testnet).unwrap();
        let policy = InputPolicy::multisig(
            script_type,
            2,
            vec![cosigner(0xA), cosigner(0xB), cosigner(0xC)],
            &scripts,
        )
        .unwrap();
        let unsigned = make_unsigned(scripts.address.script_pubkey(), vec![policy; inputs], 50_000);
        MultisigPsbt::from_unsigned(&unsigned).unwrap()
    }

    #[test]
    fn two_of_three_scenario() {
        let mut psbt = two_of_three(ScriptType::NativeSegwit, 2);
        assert_eq!(psbt.state(), &PsbtState::Draft);
        assert_eq!(psbt.quorum().cosigners.len(), 3);

        assert_eq!(psbt.apply_signature(&KeySigner::new(0xA)).unwrap(), 2);
        assert_eq!(psbt.state(), &PsbtState::PartiallySigned { signed: 1, total: 3 });

        assert_eq!(psbt.apply_signature(&KeySigner::new(0xA)).unwrap(), 0);
        assert_eq!(psbt.state(), &PsbtState::PartiallySigned { signed: 1, total: 3 });

        psbt.apply_signature(&KeySigner::new(0xB)).unwrap();
        assert_eq!(psbt.state(), &PsbtState::FullySigned);
        assert!(psbt.is_complete());
    }

    #[test]
    fn unknown_cosigner_leaves_psbt_untouched() {
        let mut psbt = two_of_three(ScriptType::NativeSegwit, 1);
        psbt.apply_signature(&KeySigner::new(0xA)).unwrap();
        let before = psbt.clone();

        let err = psbt.apply_signature(&KeySigner::new(0xD)).unwrap_err();
        assert_eq!(err, PsbtError::UnknownCosigner { fingerprint: fingerprint(0xD) });
        assert_eq!(psbt, before);
    }

    #[test]
    fn signer_with_wrong_key_is_signature_mismatch() {
        let mut psbt = two_of_three(ScriptType::NativeSegwit, 1);
        let impostor = KeySigner {
            fingerprint: fingerprint(0xB),
            secret: secret(0xE),
        };
        let before = psbt.clone();
        let err = psbt.apply_signature(&impostor).unwrap_err();
        assert_eq!(
            err,
            PsbtError::SignatureMismatch {
                fingerprint: fingerprint(0xB),
                input: 0
            }
        );
        assert_eq!(psbt, before);
    }

    #[test]
    fn finalize_before_threshold_is_not_fully_signed() {
        let mut psbt = two_of_three(ScriptType::NativeSegwit, 1);
        psbt.apply_signature(&KeySigner::new(0xC)).unwrap();
        assert_eq!(
            psbt.finalize().unwrap_err(),
            PsbtError::NotFullySigned {
                input: 0,
                signed: 1,
                required: 2
            }
        );
    }

    #[test]
    fn finalize_each_script_type() {
        for script_type in [ScriptType::NativeSegwit, ScriptType::NestedSegwit, ScriptType::Legacy] {
            let mut psbt = two_of_three(script_type, 2);
            psbt.apply_signature(&KeySigner::new(0xC)).unwrap();
            psbt.apply_signature(&KeySigner::new(0xA)).unwrap();
            let done = psbt.finalize().unwrap();

            assert_eq!(psbt.state(), &PsbtState::Finalized);
            assert_eq!(done.txid, psbt.txid());
            let tx: bitcoin::Transaction =
                bitcoin::consensus::deserialize(&hex::decode(&done.raw_tx_hex).unwrap()).unwrap();
            match script_type {
                ScriptType::NativeSegwit => {
                    assert!(tx.input[0].script_sig.is_empty());
                    assert_eq!(tx.input[0].witness.len(), 4);
                }
                ScriptType::NestedSegwit => {
                    assert!(!tx.input[0].script_sig.is_empty());
                    assert_eq!(tx.input[0].witness.len(), 4);
                }
                ScriptType::Legacy => {
                    assert!(tx.input[0].witness.is_empty());
                    assert!(tx.input[0].script_sig.as_bytes()[0] == 0x00);
                }
            }
        }
    }

    #[test]
    fn finalized_psbt_refuses_more_signatures() {
        let mut psbt = two_of_three(ScriptType::NativeSegwit, 1);
        psbt.apply_signature(&KeySigner::new(0xA)).unwrap();
        psbt.apply_signature(&KeySigner::new(0xB)).unwrap();
        psbt.finalize().unwrap();
        assert!(matches!(
            psbt.apply_signature(&KeySigner::new(0xC)),
            Err(PsbtError::InvalidState { .. })
        ));
        assert!(psbt.finalize().is_err());
    }

    #[test]
    fn broadcast_only_after_finalize() {
        let mut psbt = two_of_three(ScriptType::NativeSegwit, 1);
        assert!(psbt.mark_broadcast().is_err());
        psbt.apply_signature(&KeySigner::new(0xA)).unwrap();
        psbt.apply_signature(&KeySigner::new(0xB)).unwrap();
        let done = psbt.finalize().unwrap();
        assert_eq!(psbt.mark_broadcast().unwrap().txid, done.txid);
        assert_eq!(psbt.state(), &PsbtState::Broadcast);
    }

    #[test]
    fn merge_parallel_signatures() {
        let base = two_of_three(ScriptType::NativeSegwit, 2);
        let mut a = base.clone();
        let mut b = base.clone();
        a.apply_signature(&KeySigner::new(0xA)).unwrap();
        b.apply_signature(&KeySigner::new(0xC)).unwrap();

        let merged = merge(&a, &b).unwrap();
        assert_eq!(merged.state(), &PsbtState::FullySigned);
        assert_eq!(
            merged.signed_fingerprints(),
            [fingerprint(0xA), fingerprint(0xC)].into_iter().collect()
        );

        // Merging again adds nothing.
        let mut again = merged.clone();
        assert_eq!(again.merge(&b).unwrap(), 0);
        assert_eq!(again, merged);
    }

    #[test]
    fn merge_different_bodies_is_mismatch() {
        let a = two_of_three(ScriptType::NativeSegwit, 1);
        let b = two_of_three(ScriptType::NativeSegwit, 2);
        assert_eq!(merge(&a, &b).unwrap_err(), PsbtError::Mismatch);
    }

    #[test]
    fn merge_rejects_forged_signature() {
        let base = two_of_three(ScriptType::NativeSegwit, 1);
        let mut forged = base.psbt().clone();
        let pk = PublicKey::new(compressed(0xB).0);
        let bogus = Secp256k1::new().sign_ecdsa(&Message::from_digest([7u8; 32]), &secret(0xB));
        forged.inputs[0]
            .partial_sigs
            .insert(pk, bitcoin::ecdsa::Signature::sighash_all(bogus));

        let mut target = base.clone();
        let err = target.merge_psbt(&forged).unwrap_err();
        assert!(matches!(err, PsbtError::SignatureMismatch { .. }));
        assert_eq!(target, base);
    }

    #[test]
    fn verify_moves_tampered_snapshot_to_rejected() {
        let mut psbt = two_of_three(ScriptType::NativeSegwit, 1);
        psbt.apply_signature(&KeySigner::new(0xA)).unwrap();
        assert!(psbt.verify().is_ok());

        let mut json: serde_json::Value = serde_json::to_value(&psbt).unwrap();
        let restored: MultisigPsbt = serde_json::from_value(json.take()).unwrap();
        assert_eq!(restored, psbt);

        let mut tampered = psbt.clone();
        let pk = PublicKey::new(compressed(0xA).0);
        let bogus = Secp256k1::new().sign_ecdsa(&Message::from_digest([1u8; 32]), &secret(0xA));
        tampered.psbt.inputs[0]
            .partial_sigs
            .insert(pk, bitcoin::ecdsa::Signature::sighash_all(bogus));
        assert!(tampered.verify().is_err());
        assert!(matches!(tampered.state(), PsbtState::Rejected { .. }));
        assert!(matches!(
            tampered.apply_signature(&KeySigner::new(0xB)),
            Err(PsbtError::Rejected(_))
        ));
    }

    #[test]
    fn add_partial_signature_from_hardware() {
        let mut psbt = two_of_three(ScriptType::NativeSegwit, 1);
        let sighash = psbt.sighash(0).unwrap();
        let (pk, sig) = KeySigner::new(0xB)
            .sign_sighash(&DerivationPath::master(), &sighash)
            .unwrap();
        let sig = bitcoin::ecdsa::Signature::sighash_all(sig);
        assert!(psbt.add_partial_signature(0, pk, sig).unwrap());
        assert!(!psbt.add_partial_signature(0, pk, sig).unwrap());
        assert_eq!(psbt.state(), &PsbtState::PartiallySigned { signed: 1, total: 3 });
    }

    #[test]
    fn base64_roundtrip_and_merge() {
        let base = two_of_three(ScriptType::NestedSegwit, 1);
        let mut remote = base.clone();
        remote.apply_signature(&KeySigner::new(0xB)).unwrap();

        let decoded = MultisigPsbt::decode_base64(&remote.to_base64()).unwrap();
        let mut local = base.clone();
        assert_eq!(local.merge_psbt(&decoded).unwrap(), 1);
        assert_eq!(local.signed_fingerprints(), remote.signed_fingerprints());
        assert!(MultisigPsbt::decode_base64("not base64!").is_err());
    }

    #[test]
    fn single_key_is_one_of_one() {
        for script_type in [ScriptType::NativeSegwit, ScriptType::NestedSegwit, ScriptType::Legacy] {
            let policy = InputPolicy::single_key(
                script_type,
                fingerprint(1),
                DerivationPath::from_str("m/84'/1'/0'/0/0").unwrap(),
                compressed(1),
            );
            let spk = single_key_address(&compressed(1), script_type, BtcNetwork::Testnet).script_pubkey();
            let unsigned = make_unsigned(spk, vec![policy], 20_000);
            let mut psbt = MultisigPsbt::from_unsigned(&unsigned).unwrap();
            assert_eq!(psbt.quorum().threshold, 1);

            psbt.apply_signature(&KeySigner::new(1)).unwrap();
            assert_eq!(psbt.state(), &PsbtState::FullySigned);
            let done = psbt.finalize().unwrap();
            assert_eq!(done.txid, unsigned.tx.compute_txid());
        }
    }

    #[test]
    fn reject_from_any_state() {
        let mut psbt = two_of_three(ScriptType::NativeSegwit, 1);
        psbt.reject("cosigner withdrew");
        assert_eq!(psbt.state().to_string(), "rejected: cosigner withdrew");
        assert!(matches!(psbt.finalize(), Err(PsbtError::InvalidState { .. })));
    }
}
