//! Compile-time ABI bindings for the contracts this workspace talks to.
//!
//! Output parameters are named so decoded returns expose readable fields.

use alloy::sol;

sol! {
    /// ERC-20 surface plus the Ownable `owner()` used for renounce checks.
    interface IERC20 {
        function approve(address spender, uint256 amount) external returns (bool ok);
        function allowance(address owner, address spender) external view returns (uint256 remaining);
        function balanceOf(address owner) external view returns (uint256 balance);
        function totalSupply() external view returns (uint256 supply);
        function decimals() external view returns (uint8 value);
        function symbol() external view returns (string value);
        function name() external view returns (string value);
        function owner() external view returns (address account);
    }
}

sol! {
    /// Uniswap V2 style pair.
    interface IUniswapV2Pair {
        function token0() external view returns (address token);
        function token1() external view returns (address token);
        function getReserves() external view returns (uint112 reserve0, uint112 reserve1, uint32 blockTimestampLast);
    }
}

sol! {
    /// Trading router driven by the buy/sell flows.
    ///
    /// `requestId` ties the on-chain swap back to the request log.
    interface ITradeRouter {
        function swapExactETHForTokensSupportingFeeOnTransferTokens(
            string requestId,
            uint256 amountOutMin,
            address token,
            address to,
            uint256 deadline
        ) external payable;

        function swapExactTokensForETHSupportingFeeOnTransferTokens(
            string requestId,
            uint256 amountIn,
            uint256 amountOutMin,
            address token,
            address to,
            uint256 deadline
        ) external;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, U256};
    use alloy::sol_types::SolCall;

    #[test]
    fn approve_selector_matches_erc20() {
        assert_eq!(IERC20::approveCall::SELECTOR, [0x09, 0x5e, 0xa7, 0xb3]);
    }

    #[test]
    fn approve_encoding_is_selector_plus_two_words() {
        let data = IERC20::approveCall {
            spender: Address::repeat_byte(0xaa),
            amount: U256::MAX,
        }
        .abi_encode();
        assert_eq!(data.len(), 4 + 64);
        assert!(data[36..].iter().all(|b| *b == 0xff));
    }

    #[test]
    fn get_reserves_selector_matches_pair_abi() {
        assert_eq!(IUniswapV2Pair::getReservesCall::SELECTOR, [0x09, 0x02, 0xf1, 0xac]);
    }
}
