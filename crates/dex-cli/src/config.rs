//! `dex.toml` loading and environment overrides.

use alloy::primitives::Address;
use color_eyre::eyre::{eyre, Context, Result};
use dex_data::LogFetchConfig;
use dex_trade::{DeadlineUnit, ReceiptPolicy, RouterConfig, SignerConfig, TradeConfig};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "dex.toml";

/// One `[chains.<id>]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChainConfig {
    pub rpc_url: String,
    /// Trading router; chains without one can be read but not traded on.
    #[serde(default)]
    pub router_address: Option<Address>,
    #[serde(default)]
    pub deadline_unit: DeadlineUnit,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub db_path: Option<String>,
    /// Keyed by decimal chain id.
    pub chains: BTreeMap<String, ChainConfig>,
    pub signer: SignerConfig,
    /// Signer token used for confirmation jobs recovered at startup.
    pub service_token: Option<String>,
    pub receipts: ReceiptPolicy,
    pub log_fetch: LogFetchConfig,
    pub deadline_ttl_secs: u64,
    /// `DEX_RPC_URL`; wins over the configured endpoint of any chain.
    #[serde(skip)]
    pub rpc_url_override: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            chains: BTreeMap::new(),
            signer: SignerConfig::default(),
            service_token: None,
            receipts: ReceiptPolicy::default(),
            log_fetch: LogFetchConfig::default(),
            deadline_ttl_secs: 600,
            rpc_url_override: None,
        }
    }
}

impl AppConfig {
    /// Reads `path`, or `dex.toml` when present. An explicitly named file
    /// must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path, true),
            None => (Path::new(DEFAULT_CONFIG_PATH), false),
        };

        if !required && !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        Self::parse(&raw).wrap_err_with(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.chain_ids()?;
        Ok(config)
    }

    /// Applies `DEX_RPC_URL`, `DEX_SIGNER_URL` and `DEX_SIGNER_TOKEN`.
    pub fn with_env(self) -> Self {
        self.with_overrides(
            std::env::var("DEX_RPC_URL").ok(),
            std::env::var("DEX_SIGNER_URL").ok(),
            std::env::var("DEX_SIGNER_TOKEN").ok(),
        )
    }

    fn with_overrides(
        mut self,
        rpc_url: Option<String>,
        signer_url: Option<String>,
        signer_token: Option<String>,
    ) -> Self {
        if rpc_url.is_some() {
            self.rpc_url_override = rpc_url;
        }
        if let Some(url) = signer_url {
            self.signer.base_url = url;
        }
        if signer_token.is_some() {
            self.service_token = signer_token;
        }
        self
    }

    pub fn chain_ids(&self) -> Result<Vec<u64>> {
        self.chains
            .keys()
            .map(|key| {
                key.parse::<u64>()
                    .map_err(|_| eyre!("chain key {key:?} is not a numeric chain id"))
            })
            .collect()
    }

    fn chain(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.get(&chain_id.to_string())
    }

    pub fn rpc_url(&self, chain_id: u64) -> Option<String> {
        self.rpc_url_override
            .clone()
            .or_else(|| self.chain(chain_id).map(|chain| chain.rpc_url.clone()))
    }

    pub fn trade_config(&self) -> Result<TradeConfig> {
        let mut config = TradeConfig {
            receipts: self.receipts,
            deadline_ttl_secs: self.deadline_ttl_secs,
            ..TradeConfig::default()
        };
        for chain_id in self.chain_ids()? {
            let Some(chain) = self.chain(chain_id) else {
                continue;
            };
            if let Some(address) = chain.router_address {
                config = config.with_router(
                    chain_id,
                    RouterConfig {
                        address,
                        deadline_unit: chain.deadline_unit,
                    },
                );
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
db_path = "data/dex.sqlite"
service_token = "svc"

[chains.56]
rpc_url = "https://bsc.example"
router_address = "0x5555555555555555555555555555555555555555"
deadline_unit = "seconds"

[chains.1]
rpc_url = "https://eth.example"

[signer]
base_url = "http://signer.local"

[receipts]
attempts = 3

[log_fetch]
max_retries = 8
"#;

    #[test]
    fn parses_chains_and_partial_sections() {
        let config = AppConfig::parse(SAMPLE).expect("parses");

        assert_eq!(config.chain_ids().expect("ids"), vec![1, 56]);
        assert_eq!(config.rpc_url(1).as_deref(), Some("https://eth.example"));
        assert_eq!(config.signer.base_url, "http://signer.local");
        assert_eq!(config.signer.poll_attempts, SignerConfig::default().poll_attempts);
        assert_eq!(config.receipts.attempts, 3);
        assert_eq!(config.receipts.interval_secs, 5);
        assert_eq!(config.log_fetch.max_retries, 8);
        assert_eq!(config.log_fetch.conservative_after, 3);

        let trade = config.trade_config().expect("trade config");
        let router = trade.router(56).expect("router");
        assert_eq!(router.deadline_unit, DeadlineUnit::Seconds);
        assert!(trade.router(1).is_err());
    }

    #[test]
    fn non_numeric_chain_key_is_rejected() {
        let raw = "[chains.bsc]\nrpc_url = \"http://x\"\n";
        assert!(AppConfig::parse(raw).is_err());
    }

    #[test]
    fn env_overrides_win() {
        let config = AppConfig::parse(SAMPLE).expect("parses").with_overrides(
            Some("http://override".to_string()),
            None,
            Some("env-token".to_string()),
        );
        assert_eq!(config.rpc_url(56).as_deref(), Some("http://override"));
        assert_eq!(config.rpc_url(999).as_deref(), Some("http://override"));
        assert_eq!(config.signer.base_url, "http://signer.local");
        assert_eq!(config.service_token.as_deref(), Some("env-token"));
    }

    #[test]
    fn missing_default_file_falls_back_to_defaults() {
        let config = AppConfig::load(None);
        // The workspace ships no dex.toml.
        assert!(config.is_ok());
    }
}
