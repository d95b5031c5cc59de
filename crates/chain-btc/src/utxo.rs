use bitcoin::script::ScriptBuf;
use bitcoin::{Amount, OutPoint, TxOut, Txid};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::address::ChainBranch;
use crate::error::BtcError;
use crate::transaction::{TxShape, DUST_THRESHOLD_SAT};

/// Confirmations a coinbase output needs before it may be spent.
pub const COINBASE_MATURITY: u32 = 100;

/// A single unspent transaction output (UTXO).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: Txid,
    /// Output index within the transaction.
    pub vout: u32,
    /// Value in satoshis.
    pub amount_sat: u64,
    /// The locking script (scriptPubKey).
    pub script_pubkey: ScriptBuf,
    /// Account chain and index of the address holding this output.
    pub branch: ChainBranch,
    pub address_index: u32,
    pub is_coinbase: bool,
    pub confirmations: u32,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }

    pub fn tx_out(&self) -> TxOut {
        TxOut {
            value: Amount::from_sat(self.amount_sat),
            script_pubkey: self.script_pubkey.clone(),
        }
    }
}

/// Which algorithm produced a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelectionStrategy {
    RandomShuffle,
    LargestFirst,
}

/// Result of UTXO selection.
///
/// `total_sat == target + fee_sat + change_sat`. A `change_sat` of zero
/// means no change output; sub-dust remainders are already in `fee_sat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoSelection {
    pub chosen: Vec<Utxo>,
    pub total_sat: u64,
    pub fee_sat: u64,
    pub change_sat: u64,
    pub strategy: SelectionStrategy,
}

impl UtxoSelection {
    pub fn has_change(&self) -> bool {
        self.change_sat > 0
    }
}

/// Tunables of the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionPolicy {
    pub dust_floor: u64,
    pub min_confirmations: u32,
    pub coinbase_maturity: u32,
    /// Random shuffles tried before falling back to largest-first.
    pub max_random_attempts: usize,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            dust_floor: DUST_THRESHOLD_SAT,
            min_confirmations: 1,
            coinbase_maturity: COINBASE_MATURITY,
            max_random_attempts: 10,
        }
    }
}

/// Privacy-first coin selector: random accumulation with a bounded number of
/// attempts, then a deterministic largest-first pass.
#[derive(Debug, Clone, Default)]
pub struct UtxoSelector {
    policy: SelectionPolicy,
}

impl UtxoSelector {
    pub fn new(policy: SelectionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SelectionPolicy {
        &self.policy
    }

    /// Whether `utxo` may be spent under this policy.
    pub fn is_eligible(&self, utxo: &Utxo) -> bool {
        let required = if utxo.is_coinbase {
            self.policy.min_confirmations.max(self.policy.coinbase_maturity)
        } else {
            self.policy.min_confirmations
        };
        utxo.confirmations >= required
    }

    /// Select UTXOs covering `target_sat` plus the fee at `fee_rate` sat/vbyte.
    pub fn select(
        &self,
        utxos: &[Utxo],
        target_sat: u64,
        fee_rate: u64,
        shape: &TxShape,
    ) -> Result<UtxoSelection, BtcError> {
        self.select_with_rng(utxos, target_sat, fee_rate, shape, &mut rand::thread_rng())
    }

    pub fn select_with_rng<R: Rng + ?Sized>(
        &self,
        utxos: &[Utxo],
        target_sat: u64,
        fee_rate: u64,
        shape: &TxShape,
        rng: &mut R,
    ) -> Result<UtxoSelection, BtcError> {
        if target_sat == 0 {
            return Err(BtcError::InvalidAmount("target must be positive".into()));
        }
        if fee_rate == 0 {
            return Err(BtcError::InvalidAmount("fee rate must be positive".into()));
        }

        let eligible: Vec<&Utxo> = utxos.iter().filter(|u| self.is_eligible(u)).collect();
        let available = eligible
            .iter()
            .try_fold(0u64, |acc, u| acc.checked_add(u.amount_sat))
            .ok_or_else(|| BtcError::InvalidAmount("UTXO total overflow".into()))?;

        let minimum = add(target_sat, shape.fee(1, false, fee_rate)?)?;
        if available < minimum {
            tracing::debug!(available, minimum, "insufficient funds, fast fail");
            return Err(BtcError::InsufficientFunds {
                have: available,
                need: minimum,
            });
        }

        for attempt in 0..self.policy.max_random_attempts {
            let mut order = eligible.clone();
            order.shuffle(rng);
            if let Some(selection) =
                self.accumulate(&order, target_sat, fee_rate, shape, SelectionStrategy::RandomShuffle)?
            {
                tracing::debug!(
                    attempt,
                    inputs = selection.chosen.len(),
                    fee_sat = selection.fee_sat,
                    change_sat = selection.change_sat,
                    "random selection succeeded"
                );
                return Ok(selection);
            }
        }

        tracing::info!(
            attempts = self.policy.max_random_attempts,
            "random selection exhausted, falling back to largest-first"
        );
        let mut order = eligible;
        order.sort_by(|a, b| b.amount_sat.cmp(&a.amount_sat));
        match self.accumulate(&order, target_sat, fee_rate, shape, SelectionStrategy::LargestFirst)? {
            Some(selection) => Ok(selection),
            None => Err(BtcError::InsufficientFunds {
                have: available,
                need: add(target_sat, shape.fee(order.len(), false, fee_rate)?)?,
            }),
        }
    }

    /// Take UTXOs in `order` until they cover target plus the fee for the
    /// inputs taken so far.
    fn accumulate(
        &self,
        order: &[&Utxo],
        target_sat: u64,
        fee_rate: u64,
        shape: &TxShape,
        strategy: SelectionStrategy,
    ) -> Result<Option<UtxoSelection>, BtcError> {
        let mut chosen = Vec::new();
        let mut total = 0u64;

        for utxo in order {
            chosen.push((*utxo).clone());
            total = add(total, utxo.amount_sat)?;

            let fee_no_change = shape.fee(chosen.len(), false, fee_rate)?;
            if total < add(target_sat, fee_no_change)? {
                continue;
            }

            let fee_with_change = shape.fee(chosen.len(), true, fee_rate)?;
            let (fee_sat, change_sat) = match total.checked_sub(add(target_sat, fee_with_change)?) {
                Some(change) if change >= self.policy.dust_floor => (fee_with_change, change),
                // Sub-dust remainder goes to the miner.
                _ => (total - target_sat, 0),
            };

            return Ok(Some(UtxoSelection {
                chosen,
                total_sat: total,
                fee_sat,
                change_sat,
                strategy,
            }));
        }

        Ok(None)
    }
}

fn add(a: u64, b: u64) -> Result<u64, BtcError> {
    a.checked_add(b)
        .ok_or_else(|| BtcError::InvalidAmount("amount overflow".into()))
}
