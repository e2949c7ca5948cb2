//! Type definitions shared by the data and trade crates.

use alloy::primitives::{Address, Bytes, U256};
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Event log as returned by the chain endpoint.
///
/// The fetch layer never looks inside a log; it only concatenates them.
pub type EventLog = alloy::rpc::types::eth::Log;

/// Inclusive block interval; `end == None` means "up to the chain head".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    /// First block (inclusive).
    pub start: u64,
    /// Last block (inclusive), open when absent.
    pub end: Option<u64>,
}

impl BlockRange {
    /// Creates a range, rejecting `start > end`.
    ///
    /// # Errors
    /// Returns error if a bounded end precedes the start.
    pub fn new(start: u64, end: Option<u64>) -> Result<Self> {
        if let Some(end) = end {
            if start > end {
                return Err(eyre!("end block ({end}) must be >= start block ({start})"));
            }
        }
        Ok(Self { start, end })
    }

    /// Bounded range `[start, end]`; the caller guarantees `start <= end`.
    pub fn bounded(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "bounded range with start > end");
        Self {
            start,
            end: Some(end),
        }
    }

    /// Range from `start` to the chain head.
    pub fn open(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Number of blocks covered, `None` for open ranges.
    pub fn width(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start) + 1)
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "[{}, {}]", self.start, end),
            None => write!(f, "[{}, latest]", self.start),
        }
    }
}

/// Address/topic filter for one `eth_getLogs` request.
///
/// `topics` is the OR-set matched against topic0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogFilter {
    pub addresses: Vec<Address>,
    pub topics: Vec<alloy::primitives::B256>,
    pub range: BlockRange,
}

/// Pool state at query time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reserves {
    /// Reserve of the traded token.
    pub token_reserve: U256,
    /// Reserve of the wrapped native token.
    pub native_reserve: U256,
}

/// Supported liquidity pair flavours.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairType {
    UniswapV2,
    PancakeSwapV2,
}

impl PairType {
    /// LP fee charged by the pair, in basis points.
    pub fn fee_bps(self) -> u32 {
        match self {
            PairType::UniswapV2 => 30,
            PairType::PancakeSwapV2 => 25,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PairType::UniswapV2 => "uniswap_v2",
            PairType::PancakeSwapV2 => "pancakeswap_v2",
        }
    }

    /// Parses the stored/CLI form; returns `None` for unknown pair types.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "uniswap_v2" | "uniswapv2" => Some(PairType::UniswapV2),
            "pancakeswap_v2" | "pancakeswapv2" => Some(PairType::PancakeSwapV2),
            _ => None,
        }
    }
}

/// ERC-20 token traded against the native token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub chain_id: u64,
    pub contract_address: Address,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub total_supply: U256,
    pub is_renounced: bool,
    /// Value of the whole supply in native wei at the pair's last sync.
    pub market_cap_in_native: U256,
}

impl Token {
    /// Token row with only its identity filled in.
    pub fn new(id: impl Into<String>, chain_id: u64, contract_address: Address) -> Self {
        Self {
            id: id.into(),
            chain_id,
            contract_address,
            name: String::new(),
            symbol: String::new(),
            decimals: 0,
            total_supply: U256::ZERO,
            is_renounced: false,
            market_cap_in_native: U256::ZERO,
        }
    }
}

/// Wrapped native token of a chain (WETH, WBNB, ...).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeToken {
    pub chain_id: u64,
    pub token_id: String,
    pub contract_address: Address,
    pub symbol: String,
}

/// Token/native constant-product pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DexPair {
    pub id: String,
    pub pair_type: PairType,
    pub chain_id: u64,
    pub contract_address: Address,
    /// The non-native side of the pair.
    pub token: Token,
    pub native_token_address: Address,
    /// Whether the traded token sits in the token0 slot.
    pub token_is_token0: bool,
    pub reserve0: U256,
    pub reserve1: U256,
    pub total_supply: U256,
    /// LP tokens held by the burn address.
    pub burned_supply: U256,
}

impl DexPair {
    /// Splits the raw reserves into token/native sides.
    pub fn reserves(&self) -> Reserves {
        if self.token_is_token0 {
            Reserves {
                token_reserve: self.reserve0,
                native_reserve: self.reserve1,
            }
        } else {
            Reserves {
                token_reserve: self.reserve1,
                native_reserve: self.reserve0,
            }
        }
    }
}

/// Wallet kind; only custody users can sign through the signer service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Custody,
    External,
}

impl UserType {
    pub fn as_str(self) -> &'static str {
        match self {
            UserType::Custody => "custody",
            UserType::External => "external",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "custody" => Some(UserType::Custody),
            "external" => Some(UserType::External),
            _ => None,
        }
    }
}

/// Per-chain trading preferences.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    /// Maximum tolerated slippage in units of 1/10000.
    pub max_slippage_bps: u32,
    /// Native amount spent when a buy carries no explicit amount.
    pub default_buy_amount_wei: U256,
    /// Gas cost (price × limit) at or above which a buy needs confirmation.
    pub confirmation_gas_threshold_wei: Option<U256>,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            max_slippage_bps: 500,
            // 0.01 native
            default_buy_amount_wei: U256::from(10_000_000_000_000_000u64),
            confirmation_gas_threshold_wei: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub user_type: UserType,
    pub default_chain_id: u64,
    pub wallets: BTreeMap<u64, Address>,
    pub settings: BTreeMap<u64, UserSettings>,
}

impl User {
    /// Wallet bound for `chain_id`, if any.
    pub fn wallet_address(&self, chain_id: u64) -> Option<Address> {
        self.wallets.get(&chain_id).copied()
    }

    pub fn default_wallet_address(&self) -> Option<Address> {
        self.wallet_address(self.default_chain_id)
    }

    /// Settings for `chain_id`, falling back to defaults.
    pub fn settings_for(&self, chain_id: u64) -> UserSettings {
        self.settings.get(&chain_id).cloned().unwrap_or_default()
    }
}

/// Stored token position of a user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBalance {
    pub user_id: String,
    pub chain_id: u64,
    pub pair_id: String,
    pub token_address: Address,
    pub balance_wei: U256,
}

/// Transaction kinds driven through the signer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Approve,
    Buy,
    Sell,
    Withdraw,
}

impl TxKind {
    /// Business type recorded on the request log.
    pub fn as_str(self) -> &'static str {
        match self {
            TxKind::Approve => "approve",
            TxKind::Buy => "buy_token",
            TxKind::Sell => "sell_token",
            TxKind::Withdraw => "transfer_out",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approve" => Some(TxKind::Approve),
            "buy_token" => Some(TxKind::Buy),
            "sell_token" => Some(TxKind::Sell),
            "transfer_out" => Some(TxKind::Withdraw),
            _ => None,
        }
    }
}

/// Fully assembled legacy transaction awaiting signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingTransaction {
    pub request_id: String,
    pub from: Address,
    pub to: Address,
    pub chain_id: u64,
    pub data: Bytes,
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub value: U256,
    pub kind: TxKind,
}

/// Wire form of a [`PendingTransaction`] (quantities as hex text).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignerTransaction {
    pub from: Address,
    pub to: Address,
    pub chain_id: u64,
    pub data: Bytes,
    pub nonce: u64,
    pub gas_price: String,
    pub gas_limit: String,
    #[serde(rename = "type")]
    pub tx_type: u8,
    pub value: String,
}

impl From<&PendingTransaction> for SignerTransaction {
    fn from(tx: &PendingTransaction) -> Self {
        Self {
            from: tx.from,
            to: tx.to,
            chain_id: tx.chain_id,
            data: tx.data.clone(),
            nonce: tx.nonce,
            gas_price: format!("0x{:x}", tx.gas_price),
            gas_limit: format!("0x{:x}", tx.gas_limit),
            tx_type: 0,
            value: format!("0x{:x}", tx.value),
        }
    }
}

/// Lifecycle of a request log; only `Pending` may transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Confirmed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Confirmed => "confirmed",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RequestStatus::Pending),
            "confirmed" => Some(RequestStatus::Confirmed),
            "failed" => Some(RequestStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

/// Audit record of one signer submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLog {
    pub request_id: String,
    /// Tracking id handed back by the signer.
    pub returned_id: String,
    pub user_id: String,
    pub business_type: TxKind,
    /// Amount in wei (decimal text).
    pub amount: String,
    pub client_ip: String,
    pub token_id: Option<String>,
    pub transaction: SignerTransaction,
    pub status: RequestStatus,
    pub tx_hash: Option<String>,
    pub failure_reason: Option<String>,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds.
    pub updated_at: i64,
}

impl RequestLog {
    /// New `Pending` record stamped with the current time.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request_id: impl Into<String>,
        returned_id: impl Into<String>,
        user_id: impl Into<String>,
        business_type: TxKind,
        amount: U256,
        client_ip: impl Into<String>,
        token_id: Option<String>,
        transaction: SignerTransaction,
    ) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            request_id: request_id.into(),
            returned_id: returned_id.into(),
            user_id: user_id.into(),
            business_type,
            amount: amount.to_string(),
            client_ip: client_ip.into(),
            token_id,
            transaction,
            status: RequestStatus::Pending,
            tx_hash: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_range_rejects_inverted_bounds() {
        assert!(BlockRange::new(10, Some(9)).is_err());
        assert!(BlockRange::new(10, Some(10)).is_ok());
        assert!(BlockRange::new(10, None).is_ok());
    }

    #[test]
    fn pair_reserves_follow_token_slot() {
        let token = Token::new("t1", 56, Address::repeat_byte(0x11));
        let mut pair = DexPair {
            id: "p1".to_string(),
            pair_type: PairType::PancakeSwapV2,
            chain_id: 56,
            contract_address: Address::repeat_byte(0x22),
            token,
            native_token_address: Address::repeat_byte(0x33),
            token_is_token0: true,
            reserve0: U256::from(1_000u64),
            reserve1: U256::from(5u64),
            total_supply: U256::ZERO,
            burned_supply: U256::ZERO,
        };
        assert_eq!(pair.reserves().token_reserve, U256::from(1_000u64));
        assert_eq!(pair.reserves().native_reserve, U256::from(5u64));

        pair.token_is_token0 = false;
        assert_eq!(pair.reserves().token_reserve, U256::from(5u64));
    }

    #[test]
    fn signer_transaction_uses_hex_quantities() {
        let tx = PendingTransaction {
            request_id: "r".to_string(),
            from: Address::repeat_byte(1),
            to: Address::repeat_byte(2),
            chain_id: 56,
            data: Bytes::from(vec![0xde, 0xad]),
            nonce: 7,
            gas_price: 5_000_000_000,
            gas_limit: 21_000,
            value: U256::from(255u64),
            kind: TxKind::Buy,
        };
        let wire = SignerTransaction::from(&tx);
        assert_eq!(wire.gas_price, "0x12a05f200");
        assert_eq!(wire.gas_limit, "0x5208");
        assert_eq!(wire.value, "0xff");
        assert_eq!(wire.tx_type, 0);

        let json = serde_json::to_value(&wire).expect("serializes");
        assert_eq!(json["chainId"], 56);
        assert_eq!(json["type"], 0);
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(RequestStatus::Confirmed.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
    }
}
