//! Constant-product pricing and slippage bounds.
//!
//! All intermediates are 512-bit so 256-bit reserves and amounts never
//! overflow; every result is floored.

use alloy::primitives::{U256, U512};
use dex_data::types::{DexPair, Reserves};

use crate::error::{TradeError, TradeResult};

/// Scale for basis-point quantities (fees and slippage).
pub const PERCENTAGE_BASE: u32 = 10_000;

/// Uniswap V2 fee: 997/1000.
pub const DEFAULT_FEE_BPS: u32 = 30;

fn narrow(value: U512) -> U256 {
    if value > U512::from(U256::MAX) {
        U256::MAX
    } else {
        value.to::<U256>()
    }
}

/// Output of swapping `amount_in` at the default 30 bps fee.
pub fn amount_out(amount_in: U256, reserve_in: U256, reserve_out: U256) -> U256 {
    amount_out_with_fee(amount_in, reserve_in, reserve_out, DEFAULT_FEE_BPS)
}

/// `amount_in·(1−fee)·reserve_out / (reserve_in + amount_in·(1−fee))`.
///
/// Zero input or an empty pool yields zero.
pub fn amount_out_with_fee(amount_in: U256, reserve_in: U256, reserve_out: U256, fee_bps: u32) -> U256 {
    if amount_in.is_zero() || reserve_in.is_zero() || reserve_out.is_zero() {
        return U256::ZERO;
    }

    let fee_factor = U512::from(PERCENTAGE_BASE - fee_bps.min(PERCENTAGE_BASE));
    let in_with_fee = U512::from(amount_in) * fee_factor;
    let numerator = in_with_fee * U512::from(reserve_out);
    let denominator = U512::from(reserve_in) * U512::from(PERCENTAGE_BASE) + in_with_fee;

    if denominator.is_zero() {
        return U256::ZERO;
    }
    narrow(numerator / denominator)
}

/// `price(one whole token) × supply / 10^18`, the price taken by selling
/// `10^decimals` units into the pool. For 18-decimal tokens this is the
/// supply's value in native wei. `None` when `10^decimals` overflows.
pub fn market_cap_in_native(decimals: u8, supply: U256, reserves: &Reserves, fee_bps: u32) -> Option<U256> {
    let one_token = U256::from(10u64).checked_pow(U256::from(decimals))?;
    let price = amount_out_with_fee(one_token, reserves.token_reserve, reserves.native_reserve, fee_bps);
    let one_native = U512::from(10u64).pow(U512::from(18u64));
    Some(narrow(U512::from(price) * U512::from(supply) / one_native))
}

/// Input needed to receive `amount_out` at the default 30 bps fee.
pub fn amount_in(amount_out: U256, reserve_in: U256, reserve_out: U256) -> Option<U256> {
    amount_in_with_fee(amount_out, reserve_in, reserve_out, DEFAULT_FEE_BPS)
}

/// Inverse of [`amount_out_with_fee`], floored.
///
/// `None` when the pool cannot pay `amount_out` (it meets or exceeds
/// `reserve_out`, or the fee eats the whole input).
pub fn amount_in_with_fee(amount_out: U256, reserve_in: U256, reserve_out: U256, fee_bps: u32) -> Option<U256> {
    if amount_out.is_zero() {
        return Some(U256::ZERO);
    }
    if reserve_in.is_zero() || amount_out >= reserve_out {
        return None;
    }

    let fee_factor = U512::from(PERCENTAGE_BASE - fee_bps.min(PERCENTAGE_BASE));
    let numerator = U512::from(reserve_in) * U512::from(amount_out) * U512::from(PERCENTAGE_BASE);
    let denominator = U512::from(reserve_out - amount_out) * fee_factor;

    if denominator.is_zero() {
        return None;
    }
    Some(narrow(numerator / denominator))
}

/// `floor(amount_out × (10000 − max_slippage_bps) / 10000)`.
pub fn min_out(amount_out: U256, max_slippage_bps: u32) -> U256 {
    let keep = PERCENTAGE_BASE.saturating_sub(max_slippage_bps);
    narrow(U512::from(amount_out) * U512::from(keep) / U512::from(PERCENTAGE_BASE))
}

/// Direction of a swap against the native side of a pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Native in, token out.
    Buy,
    /// Token in, native out.
    Sell,
}

/// A quote request; exactly one of the amounts is expected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapRequest {
    pub direction: Direction,
    pub amount_in: Option<U256>,
    pub amount_out: Option<U256>,
}

impl SwapRequest {
    /// Derives the missing side of the request from `reserves`.
    ///
    /// A known input takes precedence when both amounts are given.
    ///
    /// # Errors
    /// [`TradeError::InvalidAmount`] when neither amount is set or the output
    /// cannot be met by the pool.
    pub fn quote(&self, reserves: &Reserves, fee_bps: u32) -> TradeResult<U256> {
        let (reserve_in, reserve_out) = match self.direction {
            Direction::Buy => (reserves.native_reserve, reserves.token_reserve),
            Direction::Sell => (reserves.token_reserve, reserves.native_reserve),
        };

        match (self.amount_in, self.amount_out) {
            (Some(amount), _) => Ok(amount_out_with_fee(amount, reserve_in, reserve_out, fee_bps)),
            (None, Some(amount)) => amount_in_with_fee(amount, reserve_in, reserve_out, fee_bps)
                .ok_or(TradeError::InvalidAmount),
            (None, None) => Err(TradeError::InvalidAmount),
        }
    }

    /// [`quote`](Self::quote) against a pair's stored reserves and fee.
    ///
    /// # Errors
    /// Same as [`quote`](Self::quote).
    pub fn quote_pair(&self, pair: &DexPair) -> TradeResult<U256> {
        self.quote(&pair.reserves(), pair.pair_type.fee_bps())
    }
}
