use alloy::primitives::Address;
use dex_data::{ChainReader, Store};
use std::sync::Arc;

use crate::error::TradeResult;

/// Picks the nonce for a user's next transaction.
///
/// The chain's transaction count is the baseline; a locally reserved next
/// nonce (covering submissions not yet mined) wins when present. Nothing is
/// locked or written here: callers record `nonce + 1` after each submission.
#[derive(Clone)]
pub struct NonceSequencer {
    store: Arc<Store>,
}

impl NonceSequencer {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    #[tracing::instrument(skip(self, chain))]
    pub async fn next_nonce(
        &self,
        chain: &dyn ChainReader,
        chain_id: u64,
        user_id: &str,
        wallet: Address,
    ) -> TradeResult<u64> {
        let chain_nonce = chain.nonce(wallet).await?;
        tracing::info!(nonce = chain_nonce, user_id, "retrieved nonce for user");

        match self.store.reserved_nonce(chain_id, user_id) {
            Ok(Some(reserved)) => {
                if reserved < chain_nonce {
                    tracing::warn!(user_id, chain_id, reserved, chain_nonce, "reserved nonce is behind the chain nonce");
                }
                Ok(reserved)
            }
            Ok(None) => Ok(chain_nonce),
            Err(error) => {
                tracing::warn!(user_id, chain_id, error = %error, "nonce reservation lookup failed");
                Ok(chain_nonce)
            }
        }
    }

    /// Records the nonce following `used`.
    pub fn record_submission(&self, chain_id: u64, user_id: &str, used: u64) {
        if let Err(error) = self.store.reserve_nonce(chain_id, user_id, used.saturating_add(1)) {
            tracing::warn!(user_id, chain_id, error = %error, "failed to reserve next nonce");
        }
    }
}
