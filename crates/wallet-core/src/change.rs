//! Change address issuance.
//!
//! Each change address comes from an account's internal chain at its cursor.
//! The cursor only moves once the caller's assembly step has succeeded, so a
//! failed build neither burns an index nor leaves a reservation behind.

use std::collections::HashSet;

use chain_btc::address::ChainBranch;
use parking_lot::Mutex;

use crate::account::{next_index, Account, ChainCursor, DerivedAddress};
use crate::error::WalletError;
use crate::hd_derivation::HARDENED_BIT;
use crate::types::AddressRecord;

/// Default number of pre-derived internal addresses kept per account.
pub const DEFAULT_LOOKAHEAD: usize = 5;

#[derive(Debug)]
pub struct ChangeAddressManager {
    lookahead: usize,
    /// Every change address handed out, across all accounts.
    issued: Mutex<HashSet<String>>,
}

impl Default for ChangeAddressManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOOKAHEAD)
    }
}

impl ChangeAddressManager {
    pub fn new(lookahead: usize) -> Self {
        Self {
            lookahead: lookahead.max(1),
            issued: Mutex::new(HashSet::new()),
        }
    }

    pub fn lookahead(&self) -> usize {
        self.lookahead
    }

    /// Issue the next change address of `account` outright.
    pub fn next_change_address(&self, account: &Account) -> Result<AddressRecord, WalletError> {
        self.issue_with(account, |_| Ok(()))
            .map(|(derived, ())| derived.record)
    }

    /// Run `assemble` with the candidate change address and commit the
    /// issuance only if it succeeds.
    ///
    /// The account's internal cursor stays locked for the whole call, so
    /// concurrent builds on one account serialize here and never see the
    /// same index.
    pub fn issue_with<T, F>(
        &self,
        account: &Account,
        assemble: F,
    ) -> Result<(DerivedAddress, T), WalletError>
    where
        F: FnOnce(&DerivedAddress) -> Result<T, WalletError>,
    {
        let mut cursor = account.internal_cursor().lock();
        self.fill_lookahead(account, &mut cursor)?;
        let candidate = cursor
            .lookahead
            .front()
            .cloned()
            .ok_or_else(|| WalletError::Internal("change lookahead is empty".into()))?;

        if self.issued.lock().contains(&candidate.record.value) {
            tracing::warn!(account = %account.id(), index = candidate.record.index, "change address already issued");
            return Err(WalletError::AddressReused(candidate.record.value));
        }

        let output = assemble(&candidate)?;

        let following = next_index(candidate.record.index)?;
        if !self.issued.lock().insert(candidate.record.value.clone()) {
            return Err(WalletError::AddressReused(candidate.record.value));
        }
        cursor.lookahead.pop_front();
        cursor.next_index = following;
        cursor.issued.push(candidate.record.clone());

        tracing::debug!(
            account = %account.id(),
            index = candidate.record.index,
            "change address issued"
        );
        Ok((candidate, output))
    }

    /// Mark addresses as issued, e.g. after restoring a snapshot.
    pub fn register<'a>(&self, addresses: impl IntoIterator<Item = &'a AddressRecord>) {
        let mut issued = self.issued.lock();
        for record in addresses {
            if record.branch == ChainBranch::Internal {
                issued.insert(record.value.clone());
            }
        }
    }

    pub fn is_issued(&self, address: &str) -> bool {
        self.issued.lock().contains(address)
    }

    fn fill_lookahead(&self, account: &Account, cursor: &mut ChainCursor) -> Result<(), WalletError> {
        if cursor
            .lookahead
            .front()
            .is_some_and(|d| d.record.index != cursor.next_index)
        {
            cursor.lookahead.clear();
        }
        while cursor.lookahead.len() < self.lookahead {
            let offset = u32::try_from(cursor.lookahead.len())
                .map_err(|_| WalletError::Internal("lookahead too large".into()))?;
            let index = cursor.next_index.checked_add(offset).unwrap_or(u32::MAX);
            // the tail of the buffer may run past the last index; the head may not
            if index >= HARDENED_BIT && !cursor.lookahead.is_empty() {
                break;
            }
            let derived = account.derive_address(ChainBranch::Internal, index)?;
            cursor.lookahead.push_back(derived);
        }
        Ok(())
    }
}
