//! Business errors surfaced by the trade services.

use dex_data::ChainError;

use crate::signer::SignerError;

pub type TradeResult<T> = Result<T, TradeError>;

/// Errors returned to callers of the trade services.
///
/// Precondition failures are reported before any chain or signer call.
/// Transport and storage failures collapse into [`TradeError::Runtime`].
#[derive(Debug, thiserror::Error)]
pub enum TradeError {
    #[error("amount is missing or invalid")]
    InvalidAmount,

    #[error("user {user_id} has no wallet bound for chain {chain_id}")]
    NoBoundWallet { user_id: String, chain_id: u64 },

    #[error("user {0} cannot sign through the custody service")]
    InvalidWalletType(String),

    #[error("unsupported pair type {0:?}")]
    InvalidPairType(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("chain {0} is not configured")]
    UnsupportedChain(u64),

    #[error("transaction reverted: {0}")]
    TransactionReverted(String),

    #[error("{0}")]
    Runtime(String),
}

impl TradeError {
    /// Stable identifier for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            TradeError::InvalidAmount => "InvalidAmountFailure",
            TradeError::NoBoundWallet { .. } => "NoBoundWalletFailure",
            TradeError::InvalidWalletType(_) => "InvalidWalletType",
            TradeError::InvalidPairType(_) => "InvalidPairType",
            TradeError::NotFound { .. } => "NotFound",
            TradeError::UnsupportedChain(_) => "UnsupportedChain",
            TradeError::TransactionReverted(_) => "TransactionReverted",
            TradeError::Runtime(_) => "RuntimeError",
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        TradeError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl From<ChainError> for TradeError {
    fn from(error: ChainError) -> Self {
        TradeError::Runtime(error.to_string())
    }
}

impl From<SignerError> for TradeError {
    fn from(error: SignerError) -> Self {
        TradeError::Runtime(error.to_string())
    }
}

impl From<eyre::Report> for TradeError {
    fn from(report: eyre::Report) -> Self {
        TradeError::Runtime(format!("{report:#}"))
    }
}
