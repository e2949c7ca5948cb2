//! Runtime settings for the trade services.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{TradeError, TradeResult};

/// Timestamp flavour a router expects for its `deadline` argument.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadlineUnit {
    Seconds,
    #[default]
    Milliseconds,
}

impl DeadlineUnit {
    /// `now_ms + ttl` expressed in this unit.
    pub fn deadline(self, now_ms: i64, ttl: Duration) -> U256 {
        let at_ms = now_ms.max(0) as u128 + ttl.as_millis();
        match self {
            DeadlineUnit::Seconds => U256::from(at_ms / 1_000),
            DeadlineUnit::Milliseconds => U256::from(at_ms),
        }
    }
}

/// Trading router deployed on one chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub address: Address,
    #[serde(default)]
    pub deadline_unit: DeadlineUnit,
}

/// How long to wait for a mined receipt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiptPolicy {
    pub attempts: u32,
    pub interval_secs: u64,
}

impl Default for ReceiptPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval_secs: 5,
        }
    }
}

impl ReceiptPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Custody signer endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignerConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    /// How often to ask the signer for a transaction hash before giving up.
    pub poll_attempts: u32,
    pub poll_interval_ms: u64,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8545".to_string(),
            timeout_secs: 10,
            poll_attempts: 30,
            poll_interval_ms: 1_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradeConfig {
    pub routers: HashMap<u64, RouterConfig>,
    pub receipts: ReceiptPolicy,
    /// Lifetime embedded in swap deadlines.
    pub deadline_ttl_secs: u64,
}

impl Default for TradeConfig {
    fn default() -> Self {
        Self {
            routers: HashMap::new(),
            receipts: ReceiptPolicy::default(),
            deadline_ttl_secs: 600,
        }
    }
}

impl TradeConfig {
    /// Router for `chain_id`.
    ///
    /// # Errors
    /// Returns [`TradeError::UnsupportedChain`] when no router is configured.
    pub fn router(&self, chain_id: u64) -> TradeResult<&RouterConfig> {
        self.routers
            .get(&chain_id)
            .ok_or(TradeError::UnsupportedChain(chain_id))
    }

    pub fn with_router(mut self, chain_id: u64, router: RouterConfig) -> Self {
        self.routers.insert(chain_id, router);
        self
    }

    pub fn deadline_ttl(&self) -> Duration {
        Duration::from_secs(self.deadline_ttl_secs)
    }
}
