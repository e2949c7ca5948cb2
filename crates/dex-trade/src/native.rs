use dashmap::DashMap;
use dex_data::types::NativeToken;
use dex_data::Store;
use std::sync::Arc;

use crate::error::{TradeError, TradeResult};

/// Read-through cache of each chain's wrapped native token.
///
/// Entries never expire; a chain's native token does not change.
#[derive(Clone)]
pub struct NativeTokenCache {
    store: Arc<Store>,
    tokens: Arc<DashMap<u64, NativeToken>>,
}

impl NativeTokenCache {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            tokens: Arc::new(DashMap::new()),
        }
    }

    /// Cached native token of `chain_id`, loading it from the store on a miss.
    ///
    /// # Errors
    /// [`TradeError::NotFound`] for an unregistered chain; storage errors as
    /// [`TradeError::Runtime`]. Misses are not cached.
    pub fn get_or_load(&self, chain_id: u64) -> TradeResult<NativeToken> {
        if let Some(token) = self.tokens.get(&chain_id) {
            return Ok(token.clone());
        }

        let token = self
            .store
            .retrieve_native_token(chain_id)?
            .ok_or_else(|| TradeError::not_found("native token for chain", chain_id.to_string()))?;
        tracing::debug!(chain_id, symbol = %token.symbol, "cached native token");

        Ok(self
            .tokens
            .entry(chain_id)
            .or_insert(token)
            .value()
            .clone())
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
