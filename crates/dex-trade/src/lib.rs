//! dex-trade crate: quoting, calldata, nonces and custody-mediated trading.

pub mod amount;
pub mod balances;
pub mod calldata;
pub mod config;
pub mod confirm;
pub mod error;
pub mod native;
pub mod nonce;
pub mod pairs;
pub mod pipeline;
pub mod signer;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use balances::BalanceRefresher;
pub use calldata::{CalldataComposer, WalletSignPayload};
pub use config::{DeadlineUnit, ReceiptPolicy, RouterConfig, SignerConfig, TradeConfig};
pub use confirm::{recover_pending, ConfirmationJob, ConfirmationQueue, ConfirmationWorker, Confirmer};
pub use error::{TradeError, TradeResult};
pub use native::NativeTokenCache;
pub use nonce::NonceSequencer;
pub use pairs::PairService;
pub use pipeline::{Caller, GasOverrides, Preflight, SellOutcome, TradeService};
pub use signer::{CustodySigner, HttpCustodySigner, SignerError};
