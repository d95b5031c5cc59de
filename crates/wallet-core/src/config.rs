//! Engine configuration.
//!
//! Provides [`EngineConfig`] with defaults for network, dust handling and
//! coin selection. Hosts can build it programmatically or load it from JSON.

use bitcoin::absolute::LockTime;
use chain_btc::transaction::DUST_THRESHOLD_SAT;
use chain_btc::utxo::{SelectionPolicy, COINBASE_MATURITY};
use chain_btc::BtcNetwork;
use serde::{Deserialize, Serialize};

use crate::change::DEFAULT_LOOKAHEAD;
use crate::error::WalletError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Network every account, address and WIF must belong to.
    pub network: BtcNetwork,
    /// Smallest output value, in satoshis, the engine will create.
    pub dust_floor: u64,
    /// Pre-derived internal addresses per account.
    pub change_lookahead: usize,
    /// Random selection rounds before the largest-first fallback.
    pub max_random_attempts: usize,
    pub min_confirmations: u32,
    pub coinbase_maturity: u32,
    /// Consensus-encoded nLockTime for built transactions.
    pub lock_time: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: BtcNetwork::Mainnet,
            dust_floor: DUST_THRESHOLD_SAT,
            change_lookahead: DEFAULT_LOOKAHEAD,
            max_random_attempts: 10,
            min_confirmations: 1,
            coinbase_maturity: COINBASE_MATURITY,
            lock_time: 0,
        }
    }
}

impl EngineConfig {
    pub fn for_network(network: BtcNetwork) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, WalletError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| WalletError::Validation(format!("invalid engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WalletError> {
        if self.dust_floor == 0 {
            return Err(WalletError::Validation("dust floor must be positive".into()));
        }
        if self.change_lookahead == 0 {
            return Err(WalletError::Validation("change lookahead must be positive".into()));
        }
        Ok(())
    }

    pub fn selection_policy(&self) -> SelectionPolicy {
        SelectionPolicy {
            dust_floor: self.dust_floor,
            min_confirmations: self.min_confirmations,
            coinbase_maturity: self.coinbase_maturity,
            max_random_attempts: self.max_random_attempts,
        }
    }

    pub fn lock_time(&self) -> LockTime {
        LockTime::from_consensus(self.lock_time)
    }
}
