//! Unsigned transaction construction for an account.
//!
//! Selection, change issuance and assembly run as one unit: either a complete
//! transaction comes out, or no state has changed.

use bitcoin::absolute::LockTime;
use chain_btc::transaction::{
    assemble, resolve_recipients, ChangeTarget, Recipient, TxShape, UnsignedTransaction,
};
use chain_btc::utxo::{Utxo, UtxoSelector};
use chain_btc::BtcError;
use rand::Rng;

use crate::account::Account;
use crate::change::ChangeAddressManager;
use crate::error::WalletError;

pub struct TransactionBuilder<'a> {
    selector: &'a UtxoSelector,
    change: &'a ChangeAddressManager,
    lock_time: LockTime,
}

impl<'a> TransactionBuilder<'a> {
    pub fn new(
        selector: &'a UtxoSelector,
        change: &'a ChangeAddressManager,
        lock_time: LockTime,
    ) -> Self {
        Self {
            selector,
            change,
            lock_time,
        }
    }

    pub fn build(
        &self,
        account: &Account,
        utxos: &[Utxo],
        recipients: &[Recipient],
        fee_rate: u64,
    ) -> Result<UnsignedTransaction, WalletError> {
        self.build_with_rng(account, utxos, recipients, fee_rate, &mut rand::thread_rng())
    }

    pub fn build_with_rng<R: Rng + ?Sized>(
        &self,
        account: &Account,
        utxos: &[Utxo],
        recipients: &[Recipient],
        fee_rate: u64,
        rng: &mut R,
    ) -> Result<UnsignedTransaction, WalletError> {
        let dust_floor = self.selector.policy().dust_floor;
        let outputs = resolve_recipients(recipients, account.network(), dust_floor)?;
        let target = outputs.iter().try_fold(0u64, |acc, (_, v)| {
            acc.checked_add(*v)
                .ok_or_else(|| BtcError::InvalidAmount("recipient total overflow".into()))
        })?;

        let shape = TxShape::new(
            account.spend_kind(),
            outputs.iter().map(|(script, _)| script.len()).collect(),
        );
        let selection = self
            .selector
            .select_with_rng(utxos, target, fee_rate, &shape, rng)?;

        let policies = selection
            .chosen
            .iter()
            .map(|utxo| account.input_policy(utxo))
            .collect::<Result<Vec<_>, _>>()?;

        let unsigned = if selection.has_change() {
            let (_, unsigned) = self.change.issue_with(account, |derived| {
                let target = ChangeTarget {
                    address: derived.record.value.clone(),
                    index: derived.record.index,
                    script_pubkey: derived.script_pubkey.clone(),
                };
                Ok(assemble(
                    &selection,
                    &outputs,
                    Some(target),
                    policies,
                    self.lock_time,
                    dust_floor,
                )?)
            })?;
            unsigned
        } else {
            assemble(&selection, &outputs, None, policies, self.lock_time, dust_floor)?
        };

        tracing::info!(
            account = %account.id(),
            inputs = unsigned.tx.input.len(),
            outputs = unsigned.tx.output.len(),
            fee_sat = unsigned.fee_sat,
            change = unsigned.change.is_some(),
            strategy = ?unsigned.strategy,
            "built unsigned transaction"
        );
        Ok(unsigned)
    }
}
