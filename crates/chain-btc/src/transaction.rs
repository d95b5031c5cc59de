use bitcoin::absolute::LockTime;
use bitcoin::script::ScriptBuf;
use bitcoin::transaction::Version;
use bitcoin::{Amount, Sequence, Transaction, TxIn, TxOut, Witness};
use serde::{Deserialize, Serialize};

use crate::address::{parse_address, ScriptType};
use crate::error::BtcError;
use crate::multisig::InputPolicy;
use crate::network::BtcNetwork;
use crate::utxo::{SelectionStrategy, UtxoSelection};

/// Outputs below this value are never created.
pub const DUST_THRESHOLD_SAT: u64 = 546;

/// Estimated virtual size of a P2PKH input with a compressed key.
const P2PKH_INPUT_VBYTES: u64 = 148;

/// Estimated virtual size of a P2SH-P2WPKH input.
const P2SH_P2WPKH_INPUT_VBYTES: u64 = 91;

/// Estimated virtual size of a P2WPKH input.
/// Breakdown: 41 bytes non-witness + ~27 witness bytes / 4 = ~68 vbytes per input.
const P2WPKH_INPUT_VBYTES: u64 = 68;

/// Outpoint (36) + sequence (4).
const INPUT_BASE_BYTES: u64 = 40;

/// DER signature plus sighash byte, upper bound, including its push opcode.
const SIGNATURE_PUSH_BYTES: u64 = 73;

/// What an input of an account spends, for size estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpendKind {
    SingleKey(ScriptType),
    Multisig {
        script_type: ScriptType,
        threshold: usize,
        cosigners: usize,
    },
}

impl SpendKind {
    pub fn script_type(self) -> ScriptType {
        match self {
            SpendKind::SingleKey(st) => st,
            SpendKind::Multisig { script_type, .. } => script_type,
        }
    }

    /// scriptPubKey length of an output paying to this kind (used for change).
    pub fn output_script_len(self) -> usize {
        match self {
            SpendKind::SingleKey(ScriptType::Legacy) => 25,
            SpendKind::SingleKey(ScriptType::NestedSegwit) => 23,
            SpendKind::SingleKey(ScriptType::NativeSegwit) => 22,
            SpendKind::Multisig { script_type: ScriptType::NativeSegwit, .. } => 34,
            SpendKind::Multisig { .. } => 23,
        }
    }
}

/// Virtual size of one fully-signed input of `kind`.
pub fn input_vbytes(kind: SpendKind) -> u64 {
    match kind {
        SpendKind::SingleKey(ScriptType::Legacy) => P2PKH_INPUT_VBYTES,
        SpendKind::SingleKey(ScriptType::NestedSegwit) => P2SH_P2WPKH_INPUT_VBYTES,
        SpendKind::SingleKey(ScriptType::NativeSegwit) => P2WPKH_INPUT_VBYTES,
        SpendKind::Multisig {
            script_type,
            threshold,
            cosigners,
        } => {
            let m = threshold as u64;
            let script_len = 3 + 34 * cosigners as u64;
            // Witness: item count, empty dummy, m signatures, script push.
            let witness = 1 + 1 + SIGNATURE_PUSH_BYTES * m + varint_len(script_len) + script_len;
            match script_type {
                ScriptType::NativeSegwit => INPUT_BASE_BYTES + 1 + witness.div_ceil(4),
                // scriptSig pushes the 34-byte P2WSH program.
                ScriptType::NestedSegwit => INPUT_BASE_BYTES + 1 + 35 + witness.div_ceil(4),
                ScriptType::Legacy => {
                    let script_sig = 1 + SIGNATURE_PUSH_BYTES * m + push_prefix_len(script_len) + script_len;
                    INPUT_BASE_BYTES + varint_len(script_sig) + script_sig
                }
            }
        }
    }
}

/// Serialized size of an output with a `script_len`-byte scriptPubKey.
pub fn output_vbytes(script_len: usize) -> u64 {
    let len = script_len as u64;
    8 + varint_len(len) + len
}

fn varint_len(n: u64) -> u64 {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

fn push_prefix_len(len: u64) -> u64 {
    match len {
        0..=75 => 1,
        76..=255 => 2,
        _ => 3,
    }
}

/// Size model of a transaction under construction: the spend kind of its
/// inputs plus the recipient outputs. Fees are integer satoshis throughout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxShape {
    pub spend: SpendKind,
    pub recipient_script_lens: Vec<usize>,
    pub change_script_len: usize,
}

impl TxShape {
    pub fn new(spend: SpendKind, recipient_script_lens: Vec<usize>) -> Self {
        Self {
            spend,
            recipient_script_lens,
            change_script_len: spend.output_script_len(),
        }
    }

    /// Virtual size with `inputs` inputs, with or without a change output.
    pub fn vbytes(&self, inputs: usize, with_change: bool) -> u64 {
        let outputs = self.recipient_script_lens.len() + usize::from(with_change);
        // version + locktime + input/output counts, plus marker and flag for segwit.
        let mut size = 8 + varint_len(inputs as u64) + varint_len(outputs as u64);
        if self.spend.script_type().is_segwit() {
            size += 1;
        }
        size += inputs as u64 * input_vbytes(self.spend);
        size += self
            .recipient_script_lens
            .iter()
            .map(|len| output_vbytes(*len))
            .sum::<u64>();
        if with_change {
            size += output_vbytes(self.change_script_len);
        }
        size
    }

    /// Fee for the given shape at `fee_rate` sat/vbyte.
    pub fn fee(&self, inputs: usize, with_change: bool, fee_rate: u64) -> Result<u64, BtcError> {
        self.vbytes(inputs, with_change)
            .checked_mul(fee_rate)
            .ok_or_else(|| BtcError::InvalidAmount(format!("fee overflow at {fee_rate} sat/vB")))
    }
}

/// Destination of a recipient output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentTarget {
    Address(String),
    Script(ScriptBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub target: PaymentTarget,
    pub amount_sat: u64,
}

impl Recipient {
    pub fn to_address(address: impl Into<String>, amount_sat: u64) -> Self {
        Self {
            target: PaymentTarget::Address(address.into()),
            amount_sat,
        }
    }

    /// Resolve the output script, requiring addresses to match `network`.
    pub fn script_pubkey(&self, network: BtcNetwork) -> Result<ScriptBuf, BtcError> {
        match &self.target {
            PaymentTarget::Address(addr) => Ok(parse_address(addr, network)?.script_pubkey()),
            PaymentTarget::Script(script) if script.is_empty() => {
                Err(BtcError::InvalidAddress("empty output script".into()))
            }
            PaymentTarget::Script(script) => Ok(script.clone()),
        }
    }
}

/// Validate recipients and resolve them into `(script, amount)` pairs.
pub fn resolve_recipients(
    recipients: &[Recipient],
    network: BtcNetwork,
    dust_floor: u64,
) -> Result<Vec<(ScriptBuf, u64)>, BtcError> {
    if recipients.is_empty() {
        return Err(BtcError::TransactionBuildError("no recipients".into()));
    }
    recipients
        .iter()
        .map(|r| {
            if r.amount_sat == 0 {
                return Err(BtcError::InvalidAmount("recipient amount is zero".into()));
            }
            if r.amount_sat < dust_floor {
                return Err(BtcError::DustOutput {
                    value: r.amount_sat,
                    floor: dust_floor,
                });
            }
            Ok((r.script_pubkey(network)?, r.amount_sat))
        })
        .collect()
}

/// Change output placed in an assembled transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeOutput {
    pub vout: u32,
    pub address: String,
    pub index: u32,
    pub value_sat: u64,
}

/// Change destination handed to [`assemble`].
#[derive(Debug, Clone)]
pub struct ChangeTarget {
    pub address: String,
    pub index: u32,
    pub script_pubkey: ScriptBuf,
}

/// An unsigned Bitcoin transaction ready for signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    /// The bitcoin transaction with empty script sigs and witnesses.
    pub tx: Transaction,
    /// The outputs being spent, in input order.
    pub prevouts: Vec<TxOut>,
    /// How each input is unlocked, in input order.
    pub input_policies: Vec<InputPolicy>,
    pub fee_sat: u64,
    pub strategy: SelectionStrategy,
    pub change: Option<ChangeOutput>,
}

impl UnsignedTransaction {
    pub fn input_total(&self) -> Result<u64, BtcError> {
        checked_sum(self.prevouts.iter().map(|o| o.value.to_sat()))
    }

    pub fn output_total(&self) -> Result<u64, BtcError> {
        checked_sum(self.tx.output.iter().map(|o| o.value.to_sat()))
    }

    /// `inputs == outputs + fee`, exactly.
    pub fn check_conservation(&self) -> Result<(), BtcError> {
        let inputs = self.input_total()?;
        let outputs = self.output_total()?;
        let spent = outputs
            .checked_add(self.fee_sat)
            .ok_or_else(|| BtcError::InvalidAmount("output total overflow".into()))?;
        if inputs != spent {
            return Err(BtcError::TransactionBuildError(format!(
                "inputs {inputs} sat != outputs {outputs} sat + fee {} sat",
                self.fee_sat
            )));
        }
        Ok(())
    }
}

fn checked_sum(mut values: impl Iterator<Item = u64>) -> Result<u64, BtcError> {
    values.try_fold(0u64, |acc, v| {
        acc.checked_add(v)
            .ok_or_else(|| BtcError::InvalidAmount("amount overflow".into()))
    })
}

/// Assemble selected inputs, recipient outputs and optional change into an
/// unsigned transaction.
///
/// `policies` must hold one entry per chosen UTXO, in the same order. A change
/// target is required exactly when the selection carries change.
pub fn assemble(
    selection: &UtxoSelection,
    recipients: &[(ScriptBuf, u64)],
    change: Option<ChangeTarget>,
    policies: Vec<InputPolicy>,
    lock_time: LockTime,
    dust_floor: u64,
) -> Result<UnsignedTransaction, BtcError> {
    if policies.len() != selection.chosen.len() {
        return Err(BtcError::TransactionBuildError(format!(
            "{} input policies for {} inputs",
            policies.len(),
            selection.chosen.len()
        )));
    }

    let inputs: Vec<TxIn> = selection
        .chosen
        .iter()
        .map(|utxo| TxIn {
            previous_output: utxo.outpoint(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::default(),
        })
        .collect();
    let prevouts: Vec<TxOut> = selection.chosen.iter().map(|u| u.tx_out()).collect();

    let mut outputs = Vec::with_capacity(recipients.len() + 1);
    for (script, value) in recipients {
        if *value < dust_floor {
            return Err(BtcError::DustOutput {
                value: *value,
                floor: dust_floor,
            });
        }
        outputs.push(TxOut {
            value: Amount::from_sat(*value),
            script_pubkey: script.clone(),
        });
    }

    let change_output = match (selection.change_sat, change) {
        (0, None) => None,
        (0, Some(_)) => {
            return Err(BtcError::TransactionBuildError(
                "change address supplied for a selection without change".into(),
            ))
        }
        (_, None) => {
            return Err(BtcError::TransactionBuildError(
                "selection has change but no change address".into(),
            ))
        }
        (value, Some(target)) => {
            if value < dust_floor {
                return Err(BtcError::DustOutput {
                    value,
                    floor: dust_floor,
                });
            }
            let vout = outputs.len() as u32;
            outputs.push(TxOut {
                value: Amount::from_sat(value),
                script_pubkey: target.script_pubkey,
            });
            Some(ChangeOutput {
                vout,
                address: target.address,
                index: target.index,
                value_sat: value,
            })
        }
    };

    let unsigned = UnsignedTransaction {
        tx: Transaction {
            version: Version::TWO,
            lock_time,
            input: inputs,
            output: outputs,
        },
        prevouts,
        input_policies: policies,
        fee_sat: selection.fee_sat,
        strategy: selection.strategy,
        change: change_output,
    };
    unsigned.check_conservation()?;

    tracing::debug!(
        inputs = unsigned.tx.input.len(),
        outputs = unsigned.tx.output.len(),
        fee_sat = unsigned.fee_sat,
        strategy = ?unsigned.strategy,
        "assembled unsigned transaction"
    );

    Ok(unsigned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ChainBranch;
    use crate::multisig::test_support::single_key_policy;
    use crate::utxo::Utxo;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;

    const MAINNET_ADDR: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";

    fn make_utxo(seed: u8, amount_sat: u64) -> Utxo {
        Utxo {
            txid: Txid::from_byte_array([seed; 32]),
            vout: 0,
            amount_sat,
            script_pubkey: ScriptBuf::from_hex(&format!("0014{}", "ab".repeat(20))).unwrap(),
            branch: ChainBranch::External,
            address_index: 0,
            is_coinbase: false,
            confirmations: 6,
        }
    }

    fn make_selection(amounts: &[u64], fee_sat: u64, change_sat: u64) -> UtxoSelection {
        let chosen: Vec<Utxo> = amounts
            .iter()
            .enumerate()
            .map(|(i, a)| make_utxo(i as u8 + 1, *a))
            .collect();
        UtxoSelection {
            total_sat: amounts.iter().sum(),
            chosen,
            fee_sat,
            change_sat,
            strategy: SelectionStrategy::RandomShuffle,
        }
    }

    fn recipient_script() -> ScriptBuf {
        parse_address(MAINNET_ADDR, BtcNetwork::Mainnet).unwrap().script_pubkey()
    }

    fn change_target() -> ChangeTarget {
        ChangeTarget {
            address: MAINNET_ADDR.into(),
            index: 0,
            script_pubkey: recipient_script(),
        }
    }

    #[test]
    fn single_key_input_sizes() {
        assert_eq!(input_vbytes(SpendKind::SingleKey(ScriptType::Legacy)), 148);
        assert_eq!(input_vbytes(SpendKind::SingleKey(ScriptType::NestedSegwit)), 91);
        assert_eq!(input_vbytes(SpendKind::SingleKey(ScriptType::NativeSegwit)), 68);
    }

    #[test]
    fn multisig_2_of_3_input_sizes() {
        let kind = |script_type| SpendKind::Multisig {
            script_type,
            threshold: 2,
            cosigners: 3,
        };
        // witness = 1 + 1 + 146 + 1 + 105 = 254 → 64 vB
        assert_eq!(input_vbytes(kind(ScriptType::NativeSegwit)), 41 + 64);
        assert_eq!(input_vbytes(kind(ScriptType::NestedSegwit)), 76 + 64);
        // scriptSig = 1 + 146 + 2 + 105 = 254 → 40 + 3 + 254
        assert_eq!(input_vbytes(kind(ScriptType::Legacy)), 297);
    }

    #[test]
    fn output_sizes() {
        assert_eq!(output_vbytes(22), 31);
        assert_eq!(output_vbytes(25), 34);
        assert_eq!(output_vbytes(34), 43);
    }

    #[test]
    fn shape_fee_one_input_two_outputs() {
        // 11 + 68 + 31 + 31 = 141 vbytes
        let shape = TxShape::new(SpendKind::SingleKey(ScriptType::NativeSegwit), vec![22]);
        assert_eq!(shape.vbytes(1, true), 141);
        assert_eq!(shape.fee(1, true, 1).unwrap(), 141);
        assert_eq!(shape.fee(1, false, 10).unwrap(), 1_100);
    }

    #[test]
    fn legacy_shape_has_no_segwit_overhead() {
        let shape = TxShape::new(SpendKind::SingleKey(ScriptType::Legacy), vec![25]);
        assert_eq!(shape.vbytes(1, false), 10 + 148 + 34);
    }

    #[test]
    fn shape_fee_overflow_is_an_error() {
        let shape = TxShape::new(SpendKind::SingleKey(ScriptType::NativeSegwit), vec![22]);
        assert!(shape.fee(1, true, u64::MAX).is_err());
    }

    #[test]
    fn resolve_rejects_zero_and_dust() {
        let zero = [Recipient::to_address(MAINNET_ADDR, 0)];
        assert!(matches!(
            resolve_recipients(&zero, BtcNetwork::Mainnet, 546),
            Err(BtcError::InvalidAmount(_))
        ));
        let dust = [Recipient::to_address(MAINNET_ADDR, 545)];
        assert!(matches!(
            resolve_recipients(&dust, BtcNetwork::Mainnet, 546),
            Err(BtcError::DustOutput { value: 545, floor: 546 })
        ));
    }

    #[test]
    fn resolve_rejects_wrong_network() {
        let r = [Recipient::to_address(MAINNET_ADDR, 10_000)];
        assert!(matches!(
            resolve_recipients(&r, BtcNetwork::Testnet, 546),
            Err(BtcError::InvalidAddress(_))
        ));
    }

    #[test]
    fn resolve_accepts_raw_script() {
        let r = [Recipient {
            target: PaymentTarget::Script(recipient_script()),
            amount_sat: 10_000,
        }];
        let resolved = resolve_recipients(&r, BtcNetwork::Testnet, 546).unwrap();
        assert_eq!(resolved[0].0, recipient_script());
    }

    #[test]
    fn assemble_with_change_conserves_value() {
        let selection = make_selection(&[100_000], 141, 49_859);
        let unsigned = assemble(
            &selection,
            &[(recipient_script(), 50_000)],
            Some(change_target()),
            vec![single_key_policy()],
            LockTime::ZERO,
            DUST_THRESHOLD_SAT,
        )
        .unwrap();

        assert_eq!(unsigned.tx.output.len(), 2);
        assert_eq!(unsigned.change.as_ref().unwrap().vout, 1);
        assert_eq!(unsigned.input_total().unwrap(), 100_000);
        assert_eq!(unsigned.output_total().unwrap() + unsigned.fee_sat, 100_000);
        assert_eq!(unsigned.tx.input[0].sequence, Sequence::ENABLE_RBF_NO_LOCKTIME);
        assert_eq!(unsigned.tx.version, Version::TWO);
    }

    #[test]
    fn assemble_without_change() {
        let selection = make_selection(&[50_300], 300, 0);
        let unsigned = assemble(
            &selection,
            &[(recipient_script(), 50_000)],
            None,
            vec![single_key_policy()],
            LockTime::ZERO,
            DUST_THRESHOLD_SAT,
        )
        .unwrap();
        assert_eq!(unsigned.tx.output.len(), 1);
        assert!(unsigned.change.is_none());
    }

    #[test]
    fn assemble_rejects_broken_conservation() {
        let selection = make_selection(&[100_000], 141, 40_000);
        let err = assemble(
            &selection,
            &[(recipient_script(), 50_000)],
            Some(change_target()),
            vec![single_key_policy()],
            LockTime::ZERO,
            DUST_THRESHOLD_SAT,
        )
        .unwrap_err();
        assert!(matches!(err, BtcError::TransactionBuildError(_)));
    }

    #[test]
    fn assemble_requires_change_target_when_change_present() {
        let selection = make_selection(&[100_000], 141, 49_859);
        let err = assemble(
            &selection,
            &[(recipient_script(), 50_000)],
            None,
            vec![single_key_policy()],
            LockTime::ZERO,
            DUST_THRESHOLD_SAT,
        )
        .unwrap_err();
        assert!(matches!(err, BtcError::TransactionBuildError(_)));
    }

    #[test]
    fn assemble_requires_one_policy_per_input() {
        let selection = make_selection(&[60_000, 40_000], 300, 0);
        let err = assemble(
            &selection,
            &[(recipient_script(), 99_700)],
            None,
            vec![single_key_policy()],
            LockTime::ZERO,
            DUST_THRESHOLD_SAT,
        )
        .unwrap_err();
        assert!(matches!(err, BtcError::TransactionBuildError(_)));
    }

    #[test]
    fn assemble_applies_locktime() {
        let selection = make_selection(&[50_300], 300, 0);
        let unsigned = assemble(
            &selection,
            &[(recipient_script(), 50_000)],
            None,
            vec![single_key_policy()],
            LockTime::from_consensus(800_000),
            DUST_THRESHOLD_SAT,
        )
        .unwrap();
        assert_eq!(unsigned.tx.lock_time.to_consensus_u32(), 800_000);
    }
}
