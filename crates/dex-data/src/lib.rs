//! dex-data crate: chain access, log retrieval and persistence.

pub mod chain;
pub mod contracts;
pub mod logs;
pub mod store;
pub mod types;

pub use chain::{AlloyChainReader, ChainClients, ChainError, ChainReader, ChainReaderExt, ReceiptStatus};
pub use logs::{LogFetchConfig, LogFetcher};
pub use store::Store;
pub use types::{BlockRange, DexPair, EventLog, PairType, RequestLog, RequestStatus, User};
