//! Pair discovery and on-chain refresh.

use alloy::primitives::{address, Address, U256};
use dex_data::types::{DexPair, PairType, Token};
use dex_data::{ChainClients, ChainReader, ChainReaderExt, Store};
use std::sync::Arc;

use crate::amount;
use crate::error::{TradeError, TradeResult};
use crate::native::NativeTokenCache;

/// Holder of burned LP tokens.
pub const BURN_ADDRESS: Address = address!("000000000000000000000000000000000000dEaD");

#[derive(Clone)]
pub struct PairService {
    store: Arc<Store>,
    chains: ChainClients,
    natives: NativeTokenCache,
}

impl PairService {
    pub fn new(store: Arc<Store>, chains: ChainClients, natives: NativeTokenCache) -> Self {
        Self {
            store,
            chains,
            natives,
        }
    }

    fn chain(&self, chain_id: u64) -> TradeResult<Arc<dyn ChainReader>> {
        self.chains
            .get(chain_id)
            .ok_or(TradeError::UnsupportedChain(chain_id))
    }

    /// Registers the token/native pair deployed at `address`, then syncs it.
    ///
    /// An already known pair is re-synced instead of recreated.
    ///
    /// # Errors
    /// [`TradeError::InvalidPairType`] for an unknown `pair_type`; chain read
    /// failures on the pair layout; `NotFound` when neither side is the
    /// chain's native token.
    #[tracing::instrument(skip(self))]
    pub async fn create_pair_from_address(
        &self,
        chain_id: u64,
        pair_type: &str,
        address: Address,
    ) -> TradeResult<DexPair> {
        let pair_type =
            PairType::parse(pair_type).ok_or_else(|| TradeError::InvalidPairType(pair_type.to_string()))?;
        let chain = self.chain(chain_id)?;

        if let Some(existing) = self.store.get_pair_by_address(chain_id, address)? {
            tracing::info!(pair_id = %existing.id, "pair already registered");
            return self.sync_pair(existing).await;
        }

        let native = self.natives.get_or_load(chain_id)?;
        let token0 = chain.token0(address).await?;
        let token1 = chain.token1(address).await?;
        let (reserve0, reserve1) = chain.reserves(address).await?;

        let token_is_token0 = if token1 == native.contract_address {
            true
        } else if token0 == native.contract_address {
            false
        } else {
            return Err(TradeError::not_found(
                "native side of pair",
                address.to_string(),
            ));
        };
        let token_address = if token_is_token0 { token0 } else { token1 };

        let token = match self.store.get_token_by_address(chain_id, token_address)? {
            Some(token) => token,
            None => Token::new(uuid::Uuid::new_v4().to_string(), chain_id, token_address),
        };

        let pair = DexPair {
            id: uuid::Uuid::new_v4().to_string(),
            pair_type,
            chain_id,
            contract_address: address,
            token,
            native_token_address: native.contract_address,
            token_is_token0,
            reserve0,
            reserve1,
            total_supply: U256::ZERO,
            burned_supply: U256::ZERO,
        };
        self.store.upsert_pair(&pair)?;
        tracing::info!(pair_id = %pair.id, token = %token_address, "pair created");

        self.sync_pair(pair).await
    }

    /// Refreshes reserves, supplies, ownership, missing metadata and the
    /// token's market cap.
    ///
    /// Every read is independent; a failed read is logged and leaves the
    /// stored value untouched.
    ///
    /// # Errors
    /// Returns error if the chain is not configured or the pair cannot be
    /// persisted.
    #[tracing::instrument(skip_all, fields(pair_id = %pair.id, chain_id = pair.chain_id))]
    pub async fn sync_pair(&self, mut pair: DexPair) -> TradeResult<DexPair> {
        let chain = self.chain(pair.chain_id)?;
        let pair_address = pair.contract_address;
        let token_address = pair.token.contract_address;

        match chain.reserves(pair_address).await {
            Ok((reserve0, reserve1)) => {
                pair.reserve0 = reserve0;
                pair.reserve1 = reserve1;
            }
            Err(error) => tracing::error!(error = %error, "error getting pair reserves"),
        }

        match chain.total_supply(pair_address).await {
            Ok(supply) => pair.total_supply = supply,
            Err(error) => tracing::error!(error = %error, "error getting pair supply"),
        }

        match chain.balance_of(pair_address, BURN_ADDRESS).await {
            Ok(burned) => pair.burned_supply = burned,
            Err(error) => tracing::error!(error = %error, "error getting burned pair supply"),
        }

        if !pair.token.is_renounced {
            match chain.owner(token_address).await {
                Ok(owner) => pair.token.is_renounced = owner == Address::ZERO,
                Err(error) => {
                    tracing::debug!(token = %token_address, error = %error, "error getting token owner")
                }
            }
        }

        match chain.total_supply(token_address).await {
            Ok(supply) => pair.token.total_supply = supply,
            Err(error) => {
                tracing::error!(token = %token_address, error = %error, "error getting token total supply")
            }
        }

        if pair.token.decimals == 0 {
            self.fill_metadata(chain.as_ref(), &mut pair.token).await;
        }
        update_market_cap(&mut pair);

        self.store.upsert_pair(&pair)?;
        Ok(pair)
    }

    /// All-or-nothing: a token keeps its blank metadata unless every field
    /// could be read.
    async fn fill_metadata(&self, chain: &dyn ChainReader, token: &mut Token) {
        let address = token.contract_address;
        let metadata = async {
            let decimals = chain.decimals(address).await?;
            let symbol = chain.symbol(address).await?;
            let name = chain.name(address).await?;
            Ok::<_, dex_data::ChainError>((decimals, symbol, name))
        };
        match metadata.await {
            Ok((decimals, symbol, name)) => {
                token.decimals = decimals;
                token.symbol = symbol;
                token.name = name;
            }
            Err(error) => tracing::warn!(token = %address, error = %error, "error getting token metadata"),
        }
    }
}

/// Leaves the stored value alone unless decimals, token supply and both
/// reserves are known.
fn update_market_cap(pair: &mut DexPair) {
    let reserves = pair.reserves();
    let token = &pair.token;
    if token.decimals == 0
        || token.total_supply.is_zero()
        || reserves.token_reserve.is_zero()
        || reserves.native_reserve.is_zero()
    {
        return;
    }
    match amount::market_cap_in_native(token.decimals, token.total_supply, &reserves, pair.pair_type.fee_bps()) {
        Some(cap) => pair.token.market_cap_in_native = cap,
        None => tracing::warn!(decimals = token.decimals, "token decimals too large to price"),
    }
}
