//! Adaptive `eth_getLogs` retrieval.
//!
//! Providers cap both the block span and the response size of a log query and
//! report the violation as an error, often with a `[0x<start>, 0x<end>]` hint
//! of a range that would have worked. [`LogFetcher`] turns those errors into
//! smaller queries until the whole range is covered.
//!
//! Pending ranges live on an explicit LIFO work-list. A failing range is
//! replaced by its left part on top of its right part, so logs always come
//! out left-range-first (block ascending) and the stack depth stays bounded.

use alloy::primitives::{Address, B256};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use crate::chain::ChainReader;
use crate::types::{BlockRange, EventLog, LogFilter};

static RANGE_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[0x([0-9a-fA-F]+), 0x([0-9a-fA-F]+)\]").expect("range hint pattern is valid")
});

/// Retry tuning for [`LogFetcher`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogFetchConfig {
    /// From this retry count on, the provider's suggested end is halved
    /// instead of trusted.
    pub conservative_after: u32,
    /// Ranges that failed more often than this are dropped.
    pub max_retries: u32,
    /// Lowercase fragments identifying a size/range-exceeded error.
    pub size_markers: Vec<String>,
}

impl Default for LogFetchConfig {
    fn default() -> Self {
        Self {
            conservative_after: 3,
            max_retries: 16,
            size_markers: vec![
                "log response size exceeded".to_string(),
                "query returned more than".to_string(),
                "block range is too large".to_string(),
                "exceed maximum block range".to_string(),
            ],
        }
    }
}

/// One unit of the work-list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub range: BlockRange,
    pub retry_count: u32,
}

/// How a size/range-exceeded failure is recovered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryPlan {
    /// No usable hint: query the first block alone.
    SingleBlock(WorkItem),
    /// Query `left`, then `right` (absent when `left` already reaches the end).
    Split {
        left: WorkItem,
        right: Option<WorkItem>,
    },
}

/// Fetches event logs for one chain, recovering from provider range limits.
pub struct LogFetcher {
    chain_id: u64,
    reader: Arc<dyn ChainReader>,
    config: LogFetchConfig,
}

impl LogFetcher {
    pub fn new(chain_id: u64, reader: Arc<dyn ChainReader>, config: LogFetchConfig) -> Self {
        Self {
            chain_id,
            reader,
            config,
        }
    }

    pub fn config(&self) -> &LogFetchConfig {
        &self.config
    }

    /// Returns every log matching `addresses`/`topics` in `range`.
    ///
    /// Never fails: a query error that is not a size/range error drops the
    /// affected sub-range, and malformed filters yield an empty result.
    /// Blank address strings are ignored.
    #[tracing::instrument(skip(self, addresses, topics), fields(chain_id = self.chain_id, range = %range))]
    pub async fn fetch(
        &self,
        addresses: &[String],
        topics: &[String],
        range: BlockRange,
        retry_count: u32,
    ) -> Vec<EventLog> {
        let Some((addresses, topics)) = parse_filter(addresses, topics) else {
            return Vec::new();
        };

        let mut pending = vec![WorkItem { range, retry_count }];
        let mut logs = Vec::new();
        let mut queries = 0u64;

        while let Some(item) = pending.pop() {
            if item.retry_count > self.config.max_retries {
                tracing::warn!(
                    chain_id = self.chain_id,
                    range = %item.range,
                    retry_count = item.retry_count,
                    "log range still failing after retry ceiling, dropping"
                );
                continue;
            }

            let filter = LogFilter {
                addresses: addresses.clone(),
                topics: topics.clone(),
                range: item.range,
            };
            queries += 1;

            match self.reader.filter_logs(&filter).await {
                Ok(batch) => {
                    tracing::debug!(range = %item.range, logs = batch.len(), "fetched log batch");
                    logs.extend(batch);
                }
                Err(error) => {
                    let message = error.to_string();
                    tracing::error!(
                        chain_id = self.chain_id,
                        range = %item.range,
                        error = %message,
                        "error getting history logs"
                    );

                    if !self.is_size_error(&message) {
                        continue;
                    }

                    match plan_retry(item, &message, self.config.conservative_after) {
                        RetryPlan::SingleBlock(next) => pending.push(next),
                        RetryPlan::Split { left, right } => {
                            tracing::info!(
                                chain_id = self.chain_id,
                                until_block = left.range.end,
                                "retrying log query with a narrower range"
                            );
                            if let Some(right) = right {
                                pending.push(right);
                            }
                            pending.push(left);
                        }
                    }
                }
            }
        }

        tracing::debug!(logs = logs.len(), queries, "log fetch complete");
        logs
    }

    fn is_size_error(&self, message: &str) -> bool {
        let message = message.to_ascii_lowercase();
        self.config
            .size_markers
            .iter()
            .any(|marker| message.contains(&marker.to_ascii_lowercase()))
    }
}

fn parse_filter(addresses: &[String], topics: &[String]) -> Option<(Vec<Address>, Vec<B256>)> {
    let mut parsed_addresses = Vec::new();
    for raw in addresses.iter().map(|a| a.trim()).filter(|a| !a.is_empty()) {
        match Address::from_str(raw) {
            Ok(address) => parsed_addresses.push(address),
            Err(error) => {
                tracing::warn!(address = raw, error = %error, "invalid log filter address");
                return None;
            }
        }
    }

    let mut parsed_topics = Vec::new();
    for raw in topics.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
        match B256::from_str(raw) {
            Ok(topic) => parsed_topics.push(topic),
            Err(error) => {
                tracing::warn!(topic = raw, error = %error, "invalid log filter topic");
                return None;
            }
        }
    }

    Some((parsed_addresses, parsed_topics))
}

/// Decides the follow-up queries for a size/range-exceeded `message`.
pub fn plan_retry(item: WorkItem, message: &str, conservative_after: u32) -> RetryPlan {
    let start = item.range.start;
    let retry_count = item.retry_count + 1;

    let Some(caps) = RANGE_HINT.captures(message) else {
        return RetryPlan::SingleBlock(WorkItem {
            range: BlockRange::bounded(start, start),
            retry_count,
        });
    };

    let hinted_start = u64::from_str_radix(&caps[1], 16).unwrap_or(start);
    let hinted_end = u64::from_str_radix(&caps[2], 16).ok();

    let mut suggested_end = hinted_end.unwrap_or_else(|| item.range.end.unwrap_or(start));
    // Some providers answer with start > end.
    if hinted_start > suggested_end {
        suggested_end = hinted_start;
    }
    if hinted_end.is_none() || item.retry_count >= conservative_after {
        suggested_end = start + suggested_end.saturating_sub(start) / 2;
    }

    let mut adjusted_end = suggested_end.max(start);
    if let Some(end) = item.range.end {
        adjusted_end = adjusted_end.min(end);
    }

    let left = WorkItem {
        range: BlockRange::bounded(start, adjusted_end),
        retry_count,
    };
    let right = adjusted_end.checked_add(1).and_then(|next| match item.range.end {
        Some(end) if next > end => None,
        end => Some(WorkItem {
            range: BlockRange { start: next, end },
            retry_count,
        }),
    });

    RetryPlan::Split { left, right }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainError, ReceiptStatus};
    use alloy::primitives::{Bytes, U256};
    use async_trait::async_trait;
    use std::sync::Mutex;

    type Handler = Box<dyn Fn(&LogFilter) -> Result<Vec<EventLog>, ChainError> + Send + Sync>;

    /// Reader whose `eth_getLogs` behaviour is a closure; records every range.
    struct ScriptedLogs {
        handler: Handler,
        seen: Mutex<Vec<LogFilter>>,
    }

    impl ScriptedLogs {
        fn new(
            handler: impl Fn(&LogFilter) -> Result<Vec<EventLog>, ChainError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                handler: Box::new(handler),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn ranges(&self) -> Vec<BlockRange> {
            self.seen
                .lock()
                .expect("lock")
                .iter()
                .map(|f| f.range)
                .collect()
        }
    }

    fn unused() -> ChainError {
        ChainError::InvalidInput("not scripted".to_string())
    }

    #[async_trait]
    impl ChainReader for ScriptedLogs {
        async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<EventLog>, ChainError> {
            self.seen.lock().expect("lock").push(filter.clone());
            (self.handler)(filter)
        }
        async fn call(&self, _to: Address, _data: Bytes) -> Result<Bytes, ChainError> {
            Err(unused())
        }
        async fn estimate_gas(
            &self,
            _from: Address,
            _to: Address,
            _data: Bytes,
            _value: U256,
        ) -> Result<u64, ChainError> {
            Err(unused())
        }
        async fn gas_price(&self) -> Result<u128, ChainError> {
            Err(unused())
        }
        async fn nonce(&self, _address: Address) -> Result<u64, ChainError> {
            Err(unused())
        }
        async fn receipt(&self, _tx_hash: B256) -> Result<Option<ReceiptStatus>, ChainError> {
            Err(unused())
        }
        async fn native_balance(&self, _address: Address) -> Result<U256, ChainError> {
            Err(unused())
        }
        async fn block_number(&self) -> Result<u64, ChainError> {
            Err(unused())
        }
    }

    fn log_at(block: u64) -> EventLog {
        EventLog {
            block_number: Some(block),
            ..Default::default()
        }
    }

    fn logs_in(range: BlockRange, head: u64) -> Vec<EventLog> {
        (range.start..=range.end.unwrap_or(head)).map(log_at).collect()
    }

    fn size_error(hint: Option<(u64, u64)>) -> ChainError {
        let message = match hint {
            Some((a, b)) => format!(
                "error code -32005: Log response size exceeded. this block range should work: [0x{a:x}, 0x{b:x}]"
            ),
            None => "error code -32005: Log response size exceeded.".to_string(),
        };
        ChainError::Rpc(message)
    }

    fn fetcher(reader: Arc<ScriptedLogs>) -> LogFetcher {
        LogFetcher::new(56, reader, LogFetchConfig::default())
    }

    fn blocks(logs: &[EventLog]) -> Vec<u64> {
        logs.iter().filter_map(|l| l.block_number).collect()
    }

    #[tokio::test]
    async fn success_returns_logs_and_strips_blank_addresses() {
        let reader = ScriptedLogs::new(|f| Ok(logs_in(f.range, 0)));
        let addresses = vec![
            "".to_string(),
            "   ".to_string(),
            "0xb4e16d0168e52d35cacd2c6185b44281ec28c9dc".to_string(),
        ];

        let logs = fetcher(reader.clone())
            .fetch(&addresses, &[], BlockRange::bounded(10, 12), 0)
            .await;

        assert_eq!(blocks(&logs), vec![10, 11, 12]);
        let seen = reader.seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].addresses.len(), 1);
    }

    #[tokio::test]
    async fn splits_until_provider_cap_and_keeps_block_order() {
        // Provider accepts at most 10 blocks and suggests the widest valid range.
        let reader = ScriptedLogs::new(|f| {
            let end = f.range.end.expect("bounded in this test");
            if end - f.range.start + 1 > 10 {
                Err(size_error(Some((f.range.start, f.range.start + 9))))
            } else {
                Ok(logs_in(f.range, end))
            }
        });

        let logs = fetcher(reader.clone())
            .fetch(&[], &[], BlockRange::bounded(0, 99), 0)
            .await;

        assert_eq!(blocks(&logs), (0..=99).collect::<Vec<_>>());
        assert!(reader.ranges().len() > 10);
    }

    #[tokio::test]
    async fn unrelated_error_yields_empty_result_without_retry() {
        let reader = ScriptedLogs::new(|_| Err(ChainError::Rpc("connection reset".to_string())));

        let logs = fetcher(reader.clone())
            .fetch(&[], &[], BlockRange::bounded(0, 99), 0)
            .await;

        assert!(logs.is_empty());
        assert_eq!(reader.ranges().len(), 1);
    }

    #[tokio::test]
    async fn hintless_error_retries_single_block() {
        let reader = ScriptedLogs::new(|f| {
            if f.range.end == Some(f.range.start) {
                Ok(logs_in(f.range, f.range.start))
            } else {
                Err(size_error(None))
            }
        });

        let logs = fetcher(reader.clone())
            .fetch(&[], &[], BlockRange::bounded(40, 80), 0)
            .await;

        assert_eq!(blocks(&logs), vec![40]);
        assert_eq!(
            reader.ranges(),
            vec![BlockRange::bounded(40, 80), BlockRange::bounded(40, 40)]
        );
    }

    #[tokio::test]
    async fn persistent_failure_stops_at_retry_ceiling() {
        let reader = ScriptedLogs::new(|_| Err(size_error(None)));
        let config = LogFetchConfig {
            max_retries: 4,
            ..LogFetchConfig::default()
        };

        let logs = LogFetcher::new(56, reader.clone(), config)
            .fetch(&[], &[], BlockRange::bounded(7, 7), 0)
            .await;

        assert!(logs.is_empty());
        // initial query plus one single-block query per allowed retry
        assert_eq!(reader.ranges().len(), 5);
    }

    #[tokio::test]
    async fn invalid_address_yields_empty_result() {
        let reader = ScriptedLogs::new(|f| Ok(logs_in(f.range, 0)));

        let logs = fetcher(reader.clone())
            .fetch(&["not-an-address".to_string()], &[], BlockRange::bounded(1, 2), 0)
            .await;

        assert!(logs.is_empty());
        assert!(reader.ranges().is_empty());
    }

    #[test]
    fn inverted_hint_clamps_to_hinted_start() {
        let item = WorkItem {
            range: BlockRange::bounded(0, 1_000),
            retry_count: 0,
        };
        let plan = plan_retry(
            item,
            "Log response size exceeded. You can make eth_getLogs requests with up to a 2K block range: [0x64, 0x32]",
            3,
        );

        assert_eq!(
            plan,
            RetryPlan::Split {
                left: WorkItem {
                    range: BlockRange::bounded(0, 100),
                    retry_count: 1
                },
                right: Some(WorkItem {
                    range: BlockRange::bounded(101, 1_000),
                    retry_count: 1
                }),
            }
        );
    }

    #[test]
    fn repeated_retries_halve_the_suggested_range() {
        let item = WorkItem {
            range: BlockRange::bounded(0, 1_000),
            retry_count: 3,
        };
        let RetryPlan::Split { left, right } = plan_retry(item, "exceeded [0x0, 0x1f4]", 3) else {
            panic!("expected split");
        };
        assert_eq!(left.range, BlockRange::bounded(0, 250));
        assert_eq!(right.map(|r| r.range), Some(BlockRange::bounded(251, 1_000)));
    }

    #[test]
    fn open_range_keeps_open_right_side() {
        let item = WorkItem {
            range: BlockRange::open(500),
            retry_count: 0,
        };
        let RetryPlan::Split { left, right } = plan_retry(item, "[0x1f4, 0x257]", 3) else {
            panic!("expected split");
        };
        assert_eq!(left.range, BlockRange::bounded(500, 599));
        assert_eq!(right.map(|r| r.range), Some(BlockRange::open(600)));
    }

    #[test]
    fn unparseable_hint_end_halves_the_range() {
        let hint = "query returned more than 10000 results: [0x10, 0x1ffffffffffffffffff]";

        let bounded = WorkItem {
            range: BlockRange::bounded(0, 1_000),
            retry_count: 0,
        };
        let RetryPlan::Split { left, right } = plan_retry(bounded, hint, 3) else {
            panic!("expected split");
        };
        assert_eq!(left.range, BlockRange::bounded(0, 500));
        assert_eq!(left.retry_count, 1);
        assert_eq!(right.map(|r| r.range), Some(BlockRange::bounded(501, 1_000)));

        let open = WorkItem {
            range: BlockRange::open(100),
            retry_count: 0,
        };
        let RetryPlan::Split { left, right } = plan_retry(open, hint, 3) else {
            panic!("expected split");
        };
        assert_eq!(left.range, BlockRange::bounded(100, 100));
        assert_eq!(right.map(|r| r.range), Some(BlockRange::open(101)));
    }

    #[test]
    fn hint_past_the_end_leaves_no_right_side() {
        let item = WorkItem {
            range: BlockRange::bounded(10, 20),
            retry_count: 0,
        };
        let RetryPlan::Split { left, right } = plan_retry(item, "[0xa, 0xff]", 3) else {
            panic!("expected split");
        };
        assert_eq!(left.range, BlockRange::bounded(10, 20));
        assert_eq!(left.retry_count, 1);
        assert!(right.is_none());
    }
}
