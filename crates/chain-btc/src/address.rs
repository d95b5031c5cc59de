use bitcoin::address::{Address, NetworkUnchecked};
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::{Builder, ScriptBuf};
use bitcoin::{CompressedPublicKey, PublicKey};
use serde::{Deserialize, Serialize};

use crate::error::BtcError;
use crate::network::BtcNetwork;

/// Largest cosigner set a bare `OP_CHECKMULTISIG` policy may carry.
pub const MAX_MULTISIG_KEYS: usize = 15;

/// Output script family of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptType {
    /// P2PKH, or bare P2SH for multisig.
    Legacy,
    /// P2SH-wrapped SegWit v0.
    NestedSegwit,
    /// Native SegWit v0 (bech32).
    NativeSegwit,
}

impl ScriptType {
    /// BIP44/49/84 purpose for single-key accounts.
    pub fn purpose(self) -> u32 {
        match self {
            ScriptType::Legacy => 44,
            ScriptType::NestedSegwit => 49,
            ScriptType::NativeSegwit => 84,
        }
    }

    /// Last hardened component of the `m/48'/coin'/account'/script'` multisig template.
    pub fn multisig_script_index(self) -> u32 {
        match self {
            ScriptType::Legacy => 0,
            ScriptType::NestedSegwit => 1,
            ScriptType::NativeSegwit => 2,
        }
    }

    pub fn is_segwit(self) -> bool {
        !matches!(self, ScriptType::Legacy)
    }
}

/// External (receive) or internal (change) chain of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainBranch {
    External,
    Internal,
}

impl ChainBranch {
    /// Unhardened path component selecting this branch.
    pub fn index(self) -> u32 {
        match self {
            ChainBranch::External => 0,
            ChainBranch::Internal => 1,
        }
    }
}

/// Scripts that lock and unlock a sorted multisig output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigScripts {
    pub address: Address,
    /// Cosigner keys in BIP67 order.
    pub sorted_keys: Vec<PublicKey>,
    /// The bare `OP_CHECKMULTISIG` script.
    pub multisig_script: ScriptBuf,
    /// Present for P2WSH and P2SH-P2WSH.
    pub witness_script: Option<ScriptBuf>,
    /// Present for P2SH and P2SH-P2WSH.
    pub redeem_script: Option<ScriptBuf>,
}

/// Address paying to a single key under `script_type`.
pub fn single_key_address(
    pubkey: &CompressedPublicKey,
    script_type: ScriptType,
    network: BtcNetwork,
) -> Address {
    let net = network.to_bitcoin_network();
    match script_type {
        ScriptType::Legacy => Address::p2pkh(pubkey.pubkey_hash(), net),
        ScriptType::NestedSegwit => Address::p2shwpkh(pubkey, net),
        ScriptType::NativeSegwit => Address::p2wpkh(pubkey, net),
    }
}

/// `m`-of-`n` `OP_CHECKMULTISIG` script with the keys sorted lexicographically
/// by their compressed serialization (BIP67).
pub fn sorted_multisig_script(
    threshold: usize,
    pubkeys: &[CompressedPublicKey],
) -> Result<(ScriptBuf, Vec<PublicKey>), BtcError> {
    let n = pubkeys.len();
    if n == 0 || n > MAX_MULTISIG_KEYS {
        return Err(BtcError::InvalidPolicy(format!(
            "cosigner count {n} outside 1..={MAX_MULTISIG_KEYS}"
        )));
    }
    if threshold == 0 || threshold > n {
        return Err(BtcError::InvalidPolicy(format!(
            "threshold {threshold} outside 1..={n}"
        )));
    }

    let mut sorted: Vec<CompressedPublicKey> = pubkeys.to_vec();
    sorted.sort_by_key(|k| k.0.serialize());
    if sorted.windows(2).any(|w| w[0] == w[1]) {
        return Err(BtcError::InvalidPolicy("duplicate cosigner key".into()));
    }

    let keys: Vec<PublicKey> = sorted.iter().map(|k| PublicKey::new(k.0)).collect();
    let mut builder = Builder::new().push_int(threshold as i64);
    for key in &keys {
        builder = builder.push_key(key);
    }
    let script = builder
        .push_int(n as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script();

    Ok((script, keys))
}

/// Address and spending scripts of a sorted multisig policy.
pub fn multisig_address(
    threshold: usize,
    pubkeys: &[CompressedPublicKey],
    script_type: ScriptType,
    network: BtcNetwork,
) -> Result<MultisigScripts, BtcError> {
    let (script, sorted_keys) = sorted_multisig_script(threshold, pubkeys)?;
    let net = network.to_bitcoin_network();

    let (address, witness_script, redeem_script) = match script_type {
        ScriptType::NativeSegwit => (Address::p2wsh(&script, net), Some(script.clone()), None),
        ScriptType::NestedSegwit => {
            let redeem = ScriptBuf::new_p2wsh(&script.wscript_hash());
            (
                Address::p2shwsh(&script, net),
                Some(script.clone()),
                Some(redeem),
            )
        }
        ScriptType::Legacy => {
            let address = Address::p2sh(&script, net)
                .map_err(|e| BtcError::InvalidPolicy(format!("redeem script: {e}")))?;
            (address, None, Some(script.clone()))
        }
    };

    Ok(MultisigScripts {
        address,
        sorted_keys,
        multisig_script: script,
        witness_script,
        redeem_script,
    })
}

/// Parse `address` and require it to belong to `network`.
pub fn parse_address(address: &str, network: BtcNetwork) -> Result<Address, BtcError> {
    address
        .parse::<Address<NetworkUnchecked>>()
        .map_err(|e| BtcError::InvalidAddress(format!("failed to parse address: {e}")))?
        .require_network(network.to_bitcoin_network())
        .map_err(|e| BtcError::InvalidAddress(format!("address is not for {network}: {e}")))
}
