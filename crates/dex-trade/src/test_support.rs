//! Scripted chain and signer doubles.
//!
//! Compiled for unit tests and, behind the `test-support` feature, for the
//! integration test crate.

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use dex_data::chain::{ChainError, ChainReader, ReceiptStatus};
use dex_data::contracts::{IUniswapV2Pair, IERC20};
use dex_data::types::{EventLog, LogFilter, RequestLog, SignerTransaction, TxKind};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::signer::{CustodySigner, SignerError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One 32-byte ABI word holding `value`.
pub fn word(value: U256) -> Vec<u8> {
    value.to_be_bytes::<32>().to_vec()
}

/// One 32-byte ABI word holding `address`.
pub fn address_word(address: Address) -> Vec<u8> {
    let mut out = vec![0u8; 12];
    out.extend_from_slice(address.as_slice());
    out
}

/// Arguments of one `estimate_gas` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EstimateCall {
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
}

#[derive(Default)]
struct ChainState {
    calls: HashMap<(Address, [u8; 4]), Result<Bytes, String>>,
    receipts: VecDeque<Option<ReceiptStatus>>,
    native_balances: HashMap<Address, U256>,
    estimates: Vec<EstimateCall>,
    receipt_calls: usize,
    call_count: usize,
}

/// [`ChainReader`] answering from a script.
///
/// Contract calls are matched on `(to, selector)`; unscripted calls fail.
/// Receipts are served in order, then `None` forever.
pub struct ScriptedChain {
    state: Mutex<ChainState>,
    nonce: u64,
    gas_price: u128,
    gas_estimate: Result<u64, String>,
    block_number: u64,
}

impl Default for ScriptedChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChainState::default()),
            nonce: 0,
            gas_price: 1_000_000_000,
            gas_estimate: Ok(21_000),
            block_number: 1,
        }
    }

    fn state_mut(&mut self) -> &mut ChainState {
        self.state.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn with_gas_price(mut self, gas_price: u128) -> Self {
        self.gas_price = gas_price;
        self
    }

    pub fn with_gas_estimate(mut self, gas: u64) -> Self {
        self.gas_estimate = Ok(gas);
        self
    }

    pub fn failing_estimate(mut self, message: &str) -> Self {
        self.gas_estimate = Err(message.to_string());
        self
    }

    pub fn with_block_number(mut self, block_number: u64) -> Self {
        self.block_number = block_number;
        self
    }

    pub fn with_receipt(mut self, receipt: Option<ReceiptStatus>) -> Self {
        self.state_mut().receipts.push_back(receipt);
        self
    }

    pub fn with_native_balance(mut self, owner: Address, balance: U256) -> Self {
        self.state_mut().native_balances.insert(owner, balance);
        self
    }

    pub fn with_call(mut self, to: Address, selector: [u8; 4], output: Vec<u8>) -> Self {
        self.state_mut()
            .calls
            .insert((to, selector), Ok(Bytes::from(output)));
        self
    }

    pub fn failing_call(mut self, to: Address, selector: [u8; 4], message: &str) -> Self {
        self.state_mut()
            .calls
            .insert((to, selector), Err(message.to_string()));
        self
    }

    /// `allowance(..)` on `token` answers `amount` for any owner/spender.
    pub fn with_allowance(self, token: Address, amount: U256) -> Self {
        self.with_call(token, IERC20::allowanceCall::SELECTOR, word(amount))
    }

    /// `balanceOf(..)` on `token` answers `amount` for any owner.
    pub fn with_token_balance(self, token: Address, amount: U256) -> Self {
        self.with_call(token, IERC20::balanceOfCall::SELECTOR, word(amount))
    }

    pub fn with_total_supply(self, contract: Address, supply: U256) -> Self {
        self.with_call(contract, IERC20::totalSupplyCall::SELECTOR, word(supply))
    }

    pub fn with_owner(self, token: Address, owner: Address) -> Self {
        self.with_call(token, IERC20::ownerCall::SELECTOR, address_word(owner))
    }

    pub fn with_metadata(self, token: Address, name: &str, symbol: &str, decimals: u8) -> Self {
        self.with_call(
            token,
            IERC20::nameCall::SELECTOR,
            IERC20::nameCall::abi_encode_returns(&(name.to_string(),)),
        )
        .with_call(
            token,
            IERC20::symbolCall::SELECTOR,
            IERC20::symbolCall::abi_encode_returns(&(symbol.to_string(),)),
        )
        .with_call(
            token,
            IERC20::decimalsCall::SELECTOR,
            word(U256::from(decimals)),
        )
    }

    /// Scripts `token0`, `token1` and `getReserves` for `pair`.
    pub fn with_pair(
        self,
        pair: Address,
        token0: Address,
        token1: Address,
        reserve0: U256,
        reserve1: U256,
    ) -> Self {
        let mut reserves = word(reserve0);
        reserves.extend(word(reserve1));
        reserves.extend(word(U256::ZERO));
        self.with_call(pair, IUniswapV2Pair::token0Call::SELECTOR, address_word(token0))
            .with_call(pair, IUniswapV2Pair::token1Call::SELECTOR, address_word(token1))
            .with_call(pair, IUniswapV2Pair::getReservesCall::SELECTOR, reserves)
    }

    pub fn estimates(&self) -> Vec<EstimateCall> {
        lock(&self.state).estimates.clone()
    }

    pub fn receipt_calls(&self) -> usize {
        lock(&self.state).receipt_calls
    }

    /// Number of `eth_call`s served, scripted or not.
    pub fn call_count(&self) -> usize {
        lock(&self.state).call_count
    }
}

#[async_trait]
impl ChainReader for ScriptedChain {
    async fn filter_logs(&self, _filter: &LogFilter) -> Result<Vec<EventLog>, ChainError> {
        Ok(Vec::new())
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError> {
        let mut state = lock(&self.state);
        state.call_count += 1;
        let selector: [u8; 4] = data
            .get(..4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| ChainError::InvalidInput("calldata shorter than a selector".into()))?;
        match state.calls.get(&(to, selector)) {
            Some(Ok(output)) => Ok(output.clone()),
            Some(Err(message)) => Err(ChainError::Rpc(message.clone())),
            None => Err(ChainError::Rpc(format!(
                "execution reverted: unscripted call 0x{} on {to}",
                alloy::primitives::hex::encode(selector)
            ))),
        }
    }

    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        data: Bytes,
        value: U256,
    ) -> Result<u64, ChainError> {
        lock(&self.state).estimates.push(EstimateCall {
            from,
            to,
            data,
            value,
        });
        self.gas_estimate.clone().map_err(ChainError::Rpc)
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        Ok(self.gas_price)
    }

    async fn nonce(&self, _address: Address) -> Result<u64, ChainError> {
        Ok(self.nonce)
    }

    async fn receipt(&self, _tx_hash: B256) -> Result<Option<ReceiptStatus>, ChainError> {
        let mut state = lock(&self.state);
        state.receipt_calls += 1;
        Ok(state.receipts.pop_front().flatten())
    }

    async fn native_balance(&self, address: Address) -> Result<U256, ChainError> {
        Ok(lock(&self.state)
            .native_balances
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.block_number)
    }
}

/// One transaction handed to [`RecordingSigner`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub request_id: String,
    pub auth_token: String,
    pub transaction: SignerTransaction,
    pub tracking_id: String,
}

/// [`CustodySigner`] that records submissions and answers polls with a
/// fixed hash. Tracking ids are `track-1`, `track-2`, ...
pub struct RecordingSigner {
    submissions: Mutex<Vec<Submission>>,
    polls: Mutex<Vec<String>>,
    hash: B256,
    submit_error: Option<String>,
    poll_error: Option<String>,
}

impl Default for RecordingSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSigner {
    pub fn new() -> Self {
        Self {
            submissions: Mutex::new(Vec::new()),
            polls: Mutex::new(Vec::new()),
            hash: B256::repeat_byte(0xee),
            submit_error: None,
            poll_error: None,
        }
    }

    pub fn with_hash(mut self, hash: B256) -> Self {
        self.hash = hash;
        self
    }

    pub fn failing_submit(mut self, message: &str) -> Self {
        self.submit_error = Some(message.to_string());
        self
    }

    pub fn failing_poll(mut self, reason: &str) -> Self {
        self.poll_error = Some(reason.to_string());
        self
    }

    pub fn submissions(&self) -> Vec<Submission> {
        lock(&self.submissions).clone()
    }

    pub fn polls(&self) -> Vec<String> {
        lock(&self.polls).clone()
    }
}

#[async_trait]
impl CustodySigner for RecordingSigner {
    async fn submit(
        &self,
        request_id: &str,
        auth_token: &str,
        tx: &SignerTransaction,
    ) -> Result<String, SignerError> {
        if let Some(body) = &self.submit_error {
            return Err(SignerError::Rejected {
                status: 400,
                body: body.clone(),
            });
        }
        let mut submissions = lock(&self.submissions);
        let tracking_id = format!("track-{}", submissions.len() + 1);
        submissions.push(Submission {
            request_id: request_id.to_string(),
            auth_token: auth_token.to_string(),
            transaction: tx.clone(),
            tracking_id: tracking_id.clone(),
        });
        Ok(tracking_id)
    }

    async fn poll_by_request_id(&self, tracking_id: &str, _auth_token: &str) -> Result<B256, SignerError> {
        lock(&self.polls).push(tracking_id.to_string());
        match &self.poll_error {
            Some(reason) => Err(SignerError::Failed {
                tracking_id: tracking_id.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(self.hash),
        }
    }
}

/// Pending buy log for `chain_id`.
pub fn sample_request_log(request_id: &str, returned_id: &str, chain_id: u64) -> RequestLog {
    RequestLog::new(
        request_id,
        returned_id,
        "user-1",
        TxKind::Buy,
        U256::from(1_000u64),
        "127.0.0.1",
        None,
        SignerTransaction {
            from: Address::repeat_byte(1),
            to: Address::repeat_byte(2),
            chain_id,
            data: Bytes::new(),
            nonce: 0,
            gas_price: "0x1".to_string(),
            gas_limit: "0x5208".to_string(),
            tx_type: 0,
            value: "0x3e8".to_string(),
        },
    )
}
