//! ABI payloads for approve, buy and sell.

use alloy::primitives::{Address, Bytes, U256};
use alloy::sol_types::SolCall;
use dex_data::contracts::{ITradeRouter, IERC20};
use dex_data::types::{DexPair, UserSettings};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::amount::{self, Direction, SwapRequest};
use crate::config::DeadlineUnit;

pub const APPROVE_METHOD: &str = "approve";
pub const BUY_METHOD: &str = "swapExactETHForTokensSupportingFeeOnTransferTokens";
pub const SELL_METHOD: &str = "swapExactTokensForETHSupportingFeeOnTransferTokens";

/// Unsigned call handed to client-side wallets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSignPayload {
    pub to_address: Address,
    pub chain_id: u64,
    pub method: String,
    pub value_in_wei: String,
    /// Named call arguments, for display and for wallets that encode themselves.
    pub call_data: serde_json::Value,
    /// Encoded calldata.
    pub data: Bytes,
}

/// Builds router and token calldata.
#[derive(Clone, Debug)]
pub struct CalldataComposer {
    deadline_ttl: Duration,
}

impl Default for CalldataComposer {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

impl CalldataComposer {
    pub fn new(deadline_ttl: Duration) -> Self {
        Self { deadline_ttl }
    }

    /// `approve(spender, amount)`; no amount means unlimited.
    pub fn approve(&self, spender: Address, amount: Option<U256>) -> Bytes {
        IERC20::approveCall {
            spender,
            amount: amount.unwrap_or(U256::MAX),
        }
        .abi_encode()
        .into()
    }

    /// Deadline `now + ttl` in the router's unit.
    pub fn deadline(&self, unit: DeadlineUnit) -> U256 {
        unit.deadline(chrono::Utc::now().timestamp_millis(), self.deadline_ttl)
    }

    pub fn buy(
        &self,
        request_id: &str,
        amount_out_min: U256,
        token: Address,
        recipient: Address,
        deadline: U256,
    ) -> Bytes {
        ITradeRouter::swapExactETHForTokensSupportingFeeOnTransferTokensCall {
            requestId: request_id.to_string(),
            amountOutMin: amount_out_min,
            token,
            to: recipient,
            deadline,
        }
        .abi_encode()
        .into()
    }

    pub fn sell(
        &self,
        request_id: &str,
        amount_in: U256,
        amount_out_min: U256,
        token: Address,
        recipient: Address,
        deadline: U256,
    ) -> Bytes {
        ITradeRouter::swapExactTokensForETHSupportingFeeOnTransferTokensCall {
            requestId: request_id.to_string(),
            amountIn: amount_in,
            amountOutMin: amount_out_min,
            token,
            to: recipient,
            deadline,
        }
        .abi_encode()
        .into()
    }
}

/// The caller's bound, or the quoted output minus the user's slippage.
pub fn resolve_min_out(
    pair: &DexPair,
    direction: Direction,
    amount_in: U256,
    min_out: Option<U256>,
    settings: &UserSettings,
) -> U256 {
    if let Some(min_out) = min_out {
        return min_out;
    }
    let reserves = pair.reserves();
    let fee_bps = pair.pair_type.fee_bps();
    let quoted = SwapRequest {
        direction,
        amount_in: Some(amount_in),
        amount_out: None,
    }
    .quote(&reserves, fee_bps)
    .unwrap_or(U256::ZERO);
    amount::min_out(quoted, settings.max_slippage_bps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dex_data::types::{PairType, Token};

    fn pair() -> DexPair {
        DexPair {
            id: "p".to_string(),
            pair_type: PairType::UniswapV2,
            chain_id: 1,
            contract_address: Address::repeat_byte(0x22),
            token: Token::new("t", 1, Address::repeat_byte(0x11)),
            native_token_address: Address::repeat_byte(0x33),
            token_is_token0: true,
            reserve0: U256::from(10_000u64),
            reserve1: U256::from(10_000u64),
            total_supply: U256::ZERO,
            burned_supply: U256::ZERO,
        }
    }

    #[test]
    fn approve_defaults_to_unlimited() {
        let composer = CalldataComposer::default();
        let data = composer.approve(Address::repeat_byte(0xaa), None);
        let decoded = IERC20::approveCall::abi_decode(&data, true).expect("decodes");
        assert_eq!(decoded.amount, U256::MAX);
        assert_eq!(decoded.spender, Address::repeat_byte(0xaa));

        let exact = composer.approve(Address::repeat_byte(0xaa), Some(U256::from(5u64)));
        let decoded = IERC20::approveCall::abi_decode(&exact, true).expect("decodes");
        assert_eq!(decoded.amount, U256::from(5u64));
    }

    #[test]
    fn buy_encodes_router_arguments() {
        let composer = CalldataComposer::default();
        let data = composer.buy(
            "req-1",
            U256::from(980u64),
            Address::repeat_byte(0x11),
            Address::repeat_byte(0x44),
            U256::from(123u64),
        );
        assert_eq!(
            &data[..4],
            ITradeRouter::swapExactETHForTokensSupportingFeeOnTransferTokensCall::SELECTOR
        );
        let decoded =
            ITradeRouter::swapExactETHForTokensSupportingFeeOnTransferTokensCall::abi_decode(&data, true)
                .expect("decodes");
        assert_eq!(decoded.requestId, "req-1");
        assert_eq!(decoded.amountOutMin, U256::from(980u64));
        assert_eq!(decoded.to, Address::repeat_byte(0x44));
        assert_eq!(decoded.deadline, U256::from(123u64));
    }

    #[test]
    fn sell_encodes_amount_in() {
        let composer = CalldataComposer::default();
        let data = composer.sell(
            "req-2",
            U256::from(7u64),
            U256::from(1u64),
            Address::repeat_byte(0x11),
            Address::repeat_byte(0x44),
            U256::from(9u64),
        );
        let decoded =
            ITradeRouter::swapExactTokensForETHSupportingFeeOnTransferTokensCall::abi_decode(&data, true)
                .expect("decodes");
        assert_eq!(decoded.amountIn, U256::from(7u64));
        assert_eq!(decoded.token, Address::repeat_byte(0x11));
    }

    #[test]
    fn min_out_falls_back_to_quote_with_slippage() {
        let settings = UserSettings {
            max_slippage_bps: 200,
            ..UserSettings::default()
        };
        // quote 906, minus 2% → 887
        assert_eq!(
            resolve_min_out(&pair(), Direction::Buy, U256::from(1_000u64), None, &settings),
            U256::from(887u64)
        );
        assert_eq!(
            resolve_min_out(
                &pair(),
                Direction::Buy,
                U256::from(1_000u64),
                Some(U256::from(1u64)),
                &settings
            ),
            U256::from(1u64)
        );
    }

    #[test]
    fn deadline_is_in_the_future() {
        let composer = CalldataComposer::new(Duration::from_secs(600));
        let now_ms = chrono::Utc::now().timestamp_millis() as u64;
        let deadline = composer.deadline(DeadlineUnit::Milliseconds);
        assert!(deadline >= U256::from(now_ms + 600_000));
    }
}
