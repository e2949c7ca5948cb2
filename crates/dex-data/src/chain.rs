//! Read-only EVM access.
//!
//! [`ChainReader`] is the seam everything else is written against; the
//! alloy-backed [`AlloyChainReader`] talks to a JSON-RPC endpoint and tests
//! plug in scripted doubles.

use alloy::network::Ethereum;
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::fillers::FillProvider;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::eth::{Filter, TransactionInput, TransactionRequest};
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::contracts::{IUniswapV2Pair, IERC20};
use crate::types::{EventLog, LogFilter};

type ProviderType = FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::Identity,
        alloy::providers::fillers::JoinFill<
            alloy::providers::fillers::GasFiller,
            alloy::providers::fillers::JoinFill<
                alloy::providers::fillers::BlobGasFiller,
                alloy::providers::fillers::JoinFill<
                    alloy::providers::fillers::NonceFiller,
                    alloy::providers::fillers::ChainIdFiller,
                >,
            >,
        >,
    >,
    alloy::providers::RootProvider<Ethereum>,
>;

/// Failures reported by a chain endpoint.
///
/// `Rpc` keeps the provider's message verbatim; the log fetcher inspects it
/// for range/size hints.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("failed to decode {method} output: {reason}")]
    Decode { method: &'static str, reason: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Outcome of a mined transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceiptStatus {
    pub transaction_hash: B256,
    /// 1 = success, anything else = reverted.
    pub status: u64,
    pub block_number: Option<u64>,
}

impl ReceiptStatus {
    pub fn succeeded(&self) -> bool {
        self.status == 1
    }
}

/// Read-only access to one EVM network.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// `eth_getLogs` for a single range.
    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<EventLog>, ChainError>;

    /// `eth_call` against `to` with raw calldata.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError>;

    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        data: Bytes,
        value: U256,
    ) -> Result<u64, ChainError>;

    async fn gas_price(&self) -> Result<u128, ChainError>;

    /// Latest transaction count of `address`.
    async fn nonce(&self, address: Address) -> Result<u64, ChainError>;

    /// `Ok(None)` while the transaction is not mined.
    async fn receipt(&self, tx_hash: B256) -> Result<Option<ReceiptStatus>, ChainError>;

    async fn native_balance(&self, address: Address) -> Result<U256, ChainError>;

    async fn block_number(&self) -> Result<u64, ChainError>;
}

fn decode_err(method: &'static str) -> impl FnOnce(alloy::sol_types::Error) -> ChainError {
    move |error| ChainError::Decode {
        method,
        reason: error.to_string(),
    }
}

/// Typed ERC-20 and pair reads layered over [`ChainReader::call`].
#[async_trait]
pub trait ChainReaderExt: ChainReader {
    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, ChainError> {
        let data = IERC20::allowanceCall { owner, spender }.abi_encode();
        let out = self.call(token, data.into()).await?;
        let decoded =
            IERC20::allowanceCall::abi_decode_returns(&out, true).map_err(decode_err("allowance"))?;
        Ok(decoded.remaining)
    }

    async fn balance_of(&self, token: Address, owner: Address) -> Result<U256, ChainError> {
        let data = IERC20::balanceOfCall { owner }.abi_encode();
        let out = self.call(token, data.into()).await?;
        let decoded =
            IERC20::balanceOfCall::abi_decode_returns(&out, true).map_err(decode_err("balanceOf"))?;
        Ok(decoded.balance)
    }

    async fn total_supply(&self, token: Address) -> Result<U256, ChainError> {
        let data = IERC20::totalSupplyCall {}.abi_encode();
        let out = self.call(token, data.into()).await?;
        let decoded = IERC20::totalSupplyCall::abi_decode_returns(&out, true)
            .map_err(decode_err("totalSupply"))?;
        Ok(decoded.supply)
    }

    async fn decimals(&self, token: Address) -> Result<u8, ChainError> {
        let data = IERC20::decimalsCall {}.abi_encode();
        let out = self.call(token, data.into()).await?;
        let decoded =
            IERC20::decimalsCall::abi_decode_returns(&out, true).map_err(decode_err("decimals"))?;
        Ok(decoded.value)
    }

    async fn symbol(&self, token: Address) -> Result<String, ChainError> {
        let data = IERC20::symbolCall {}.abi_encode();
        let out = self.call(token, data.into()).await?;
        let decoded =
            IERC20::symbolCall::abi_decode_returns(&out, true).map_err(decode_err("symbol"))?;
        Ok(decoded.value)
    }

    async fn name(&self, token: Address) -> Result<String, ChainError> {
        let data = IERC20::nameCall {}.abi_encode();
        let out = self.call(token, data.into()).await?;
        let decoded =
            IERC20::nameCall::abi_decode_returns(&out, true).map_err(decode_err("name"))?;
        Ok(decoded.value)
    }

    /// Ownable `owner()`; the zero address means ownership was renounced.
    async fn owner(&self, token: Address) -> Result<Address, ChainError> {
        let data = IERC20::ownerCall {}.abi_encode();
        let out = self.call(token, data.into()).await?;
        let decoded =
            IERC20::ownerCall::abi_decode_returns(&out, true).map_err(decode_err("owner"))?;
        Ok(decoded.account)
    }

    async fn token0(&self, pair: Address) -> Result<Address, ChainError> {
        let data = IUniswapV2Pair::token0Call {}.abi_encode();
        let out = self.call(pair, data.into()).await?;
        let decoded = IUniswapV2Pair::token0Call::abi_decode_returns(&out, true)
            .map_err(decode_err("token0"))?;
        Ok(decoded.token)
    }

    async fn token1(&self, pair: Address) -> Result<Address, ChainError> {
        let data = IUniswapV2Pair::token1Call {}.abi_encode();
        let out = self.call(pair, data.into()).await?;
        let decoded = IUniswapV2Pair::token1Call::abi_decode_returns(&out, true)
            .map_err(decode_err("token1"))?;
        Ok(decoded.token)
    }

    /// `getReserves()` as `(reserve0, reserve1)`.
    async fn reserves(&self, pair: Address) -> Result<(U256, U256), ChainError> {
        let data = IUniswapV2Pair::getReservesCall {}.abi_encode();
        let out = self.call(pair, data.into()).await?;
        let decoded = IUniswapV2Pair::getReservesCall::abi_decode_returns(&out, true)
            .map_err(decode_err("getReserves"))?;
        Ok((
            U256::from(decoded.reserve0.to::<u128>()),
            U256::from(decoded.reserve1.to::<u128>()),
        ))
    }
}

impl<T: ChainReader + ?Sized> ChainReaderExt for T {}

/// [`ChainReader`] backed by an alloy HTTP provider.
pub struct AlloyChainReader {
    chain_id: u64,
    provider: Arc<ProviderType>,
}

impl AlloyChainReader {
    /// Connects to `rpc_url` and checks the endpoint with `eth_blockNumber`.
    ///
    /// # Errors
    /// Returns error if the URL is malformed or the endpoint is unreachable.
    #[tracing::instrument(skip_all, fields(chain_id, rpc_url = %rpc_url))]
    pub async fn connect(chain_id: u64, rpc_url: &str) -> eyre::Result<Self> {
        use eyre::WrapErr;

        let provider =
            ProviderBuilder::new().on_http(rpc_url.parse().wrap_err("invalid RPC URL format")?);
        let provider = Arc::new(provider);

        let block_number = provider
            .get_block_number()
            .await
            .wrap_err("failed to test RPC connectivity with eth_blockNumber")?;

        tracing::info!(chain_id, latest_block = block_number, "RPC connection successful");

        Ok(Self { chain_id, provider })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }
}

fn rpc_err<E: std::fmt::Display>(error: E) -> ChainError {
    ChainError::Rpc(error.to_string())
}

#[async_trait]
impl ChainReader for AlloyChainReader {
    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<EventLog>, ChainError> {
        let mut query = Filter::new().from_block(filter.range.start);
        if let Some(end) = filter.range.end {
            query = query.to_block(end);
        }
        if !filter.addresses.is_empty() {
            query = query.address(filter.addresses.clone());
        }
        if !filter.topics.is_empty() {
            query = query.event_signature(filter.topics.clone());
        }
        self.provider.get_logs(&query).await.map_err(rpc_err)
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError> {
        let tx = TransactionRequest::default()
            .to(to)
            .input(TransactionInput::new(data));
        self.provider.call(tx).await.map_err(rpc_err)
    }

    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        data: Bytes,
        value: U256,
    ) -> Result<u64, ChainError> {
        let tx = TransactionRequest::default()
            .from(from)
            .to(to)
            .value(value)
            .input(TransactionInput::new(data));
        self.provider.estimate_gas(tx).await.map_err(rpc_err)
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        self.provider.get_gas_price().await.map_err(rpc_err)
    }

    async fn nonce(&self, address: Address) -> Result<u64, ChainError> {
        self.provider
            .get_transaction_count(address)
            .await
            .map_err(rpc_err)
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<ReceiptStatus>, ChainError> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(rpc_err)?;

        Ok(receipt.map(|receipt| ReceiptStatus {
            transaction_hash: receipt.transaction_hash,
            status: if receipt.status() { 1 } else { 0 },
            block_number: receipt.block_number,
        }))
    }

    async fn native_balance(&self, address: Address) -> Result<U256, ChainError> {
        self.provider.get_balance(address).await.map_err(rpc_err)
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        self.provider.get_block_number().await.map_err(rpc_err)
    }
}

/// Chain id → reader lookup shared by the services.
#[derive(Clone, Default)]
pub struct ChainClients {
    readers: HashMap<u64, Arc<dyn ChainReader>>,
}

impl ChainClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, chain_id: u64, reader: Arc<dyn ChainReader>) {
        self.readers.insert(chain_id, reader);
    }

    pub fn with(mut self, chain_id: u64, reader: Arc<dyn ChainReader>) -> Self {
        self.insert(chain_id, reader);
        self
    }

    pub fn get(&self, chain_id: u64) -> Option<Arc<dyn ChainReader>> {
        self.readers.get(&chain_id).cloned()
    }

    pub fn chain_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.readers.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_requires_valid_url() {
        let result = AlloyChainReader::connect(1, "invalid://url").await;
        assert!(result.is_err(), "should reject invalid URL");
    }

    #[test]
    fn receipt_status_one_is_success() {
        let ok = ReceiptStatus {
            transaction_hash: B256::ZERO,
            status: 1,
            block_number: Some(1),
        };
        let reverted = ReceiptStatus { status: 0, ..ok };
        assert!(ok.succeeded());
        assert!(!reverted.succeeded());
    }

    #[test]
    fn clients_lookup_by_chain() {
        let clients = ChainClients::new();
        assert!(clients.get(56).is_none());
        assert_eq!(clients.chain_ids().count(), 0);
    }
}
