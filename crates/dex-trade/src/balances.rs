use dex_data::types::{TokenBalance, User};
use dex_data::{ChainClients, ChainReaderExt, Store};
use futures::future::join_all;
use std::sync::Arc;

use crate::error::TradeResult;

/// Refreshes stored token balances from the chain.
#[derive(Clone)]
pub struct BalanceRefresher {
    store: Arc<Store>,
    chains: ChainClients,
}

impl BalanceRefresher {
    pub fn new(store: Arc<Store>, chains: ChainClients) -> Self {
        Self { store, chains }
    }

    /// Re-reads every positive balance of `user` on its default chain.
    ///
    /// Lookups run concurrently; a failed lookup keeps the stored value. The
    /// batch is persisted once, and a persistence failure is only logged.
    ///
    /// # Errors
    /// Returns error if the stored balances cannot be read.
    #[tracing::instrument(skip_all, fields(user_id = %user.id, chain_id = user.default_chain_id))]
    pub async fn refresh(&self, user: &User) -> TradeResult<Vec<TokenBalance>> {
        let balances = self
            .store
            .retrieve_positive_token_balances(&user.id, Some(user.default_chain_id))?;

        let lookups = balances.into_iter().map(|balance| self.lookup(user, balance));
        let refreshed = join_all(lookups).await;

        match self.store.update_token_balances(&refreshed) {
            Ok(count) => tracing::info!(count, "token balances refreshed"),
            Err(error) => tracing::error!(error = %error, "failed to update token balances"),
        }

        Ok(refreshed)
    }

    async fn lookup(&self, user: &User, mut balance: TokenBalance) -> TokenBalance {
        let Some(chain) = self.chains.get(balance.chain_id) else {
            tracing::warn!(chain_id = balance.chain_id, "no reader for chain, keeping stored balance");
            return balance;
        };
        let Some(wallet) = user.wallet_address(balance.chain_id) else {
            tracing::warn!(chain_id = balance.chain_id, "no wallet bound, keeping stored balance");
            return balance;
        };

        match chain.balance_of(balance.token_address, wallet).await {
            Ok(value) => balance.balance_wei = value,
            Err(error) => tracing::error!(
                pair_id = %balance.pair_id,
                token = %balance.token_address,
                error = %error,
                "failed to get token balance"
            ),
        }
        balance
    }
}
