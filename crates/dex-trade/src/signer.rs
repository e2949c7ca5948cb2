//! Boundary to the external custody signer.
//!
//! The signer accepts a fully built legacy transaction, signs and broadcasts
//! it, and reports the resulting hash when asked.

use alloy::primitives::B256;
use async_trait::async_trait;
use dex_data::types::SignerTransaction;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::config::SignerConfig;

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("signer transport error: {0}")]
    Transport(String),
    #[error("signer rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    /// The signer gave up on the transaction; it will never get a hash.
    #[error("signer failed transaction {tracking_id}: {reason}")]
    Failed { tracking_id: String, reason: String },
    #[error("signer returned no hash for {tracking_id} after {attempts} polls")]
    Timeout { tracking_id: String, attempts: u32 },
    #[error("unexpected signer response: {0}")]
    Decode(String),
}

/// Submit/poll capability of the custody service.
#[async_trait]
pub trait CustodySigner: Send + Sync {
    /// Hands `tx` over for signing; returns the signer's tracking id.
    async fn submit(
        &self,
        request_id: &str,
        auth_token: &str,
        tx: &SignerTransaction,
    ) -> Result<String, SignerError>;

    /// Waits until the signer reports the broadcast hash for `tracking_id`.
    async fn poll_by_request_id(&self, tracking_id: &str, auth_token: &str) -> Result<B256, SignerError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody<'a> {
    request_id: &'a str,
    transaction: &'a SignerTransaction,
}

#[derive(Deserialize)]
struct SubmitResponse {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: String,
    #[serde(default)]
    tx_hash: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// JSON-over-HTTP custody signer.
///
/// `POST {base}/v1/transactions` submits, `GET {base}/v1/transactions/{id}`
/// reports `pending`, `completed` (with `txHash`) or `failed`.
pub struct HttpCustodySigner {
    client: Client,
    base_url: String,
    poll_attempts: u32,
    poll_interval: Duration,
}

impl HttpCustodySigner {
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(config: &SignerConfig) -> eyre::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            poll_attempts: config.poll_attempts.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        })
    }

    async fn status(&self, tracking_id: &str, auth_token: &str) -> Result<StatusResponse, SignerError> {
        let response = self
            .client
            .get(format!("{}/v1/transactions/{tracking_id}", self.base_url))
            .bearer_auth(auth_token)
            .send()
            .await
            .map_err(|e| SignerError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SignerError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<StatusResponse>()
            .await
            .map_err(|e| SignerError::Decode(e.to_string()))
    }
}

#[async_trait]
impl CustodySigner for HttpCustodySigner {
    #[tracing::instrument(skip(self, auth_token, tx), fields(chain_id = tx.chain_id, nonce = tx.nonce))]
    async fn submit(
        &self,
        request_id: &str,
        auth_token: &str,
        tx: &SignerTransaction,
    ) -> Result<String, SignerError> {
        let response = self
            .client
            .post(format!("{}/v1/transactions", self.base_url))
            .bearer_auth(auth_token)
            .json(&SubmitBody {
                request_id,
                transaction: tx,
            })
            .send()
            .await
            .map_err(|e| SignerError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SignerError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| SignerError::Decode(e.to_string()))?;
        tracing::info!(tracking_id = %body.id, "transaction submitted to signer");
        Ok(body.id)
    }

    #[tracing::instrument(skip(self, auth_token))]
    async fn poll_by_request_id(&self, tracking_id: &str, auth_token: &str) -> Result<B256, SignerError> {
        for attempt in 1..=self.poll_attempts {
            let report = self.status(tracking_id, auth_token).await?;
            match report.status.as_str() {
                "completed" | "confirmed" | "broadcasted" => {
                    let raw = report.tx_hash.ok_or_else(|| {
                        SignerError::Decode(format!("{tracking_id} completed without txHash"))
                    })?;
                    return B256::from_str(&raw)
                        .map_err(|e| SignerError::Decode(format!("invalid txHash {raw:?}: {e}")));
                }
                "failed" | "rejected" => {
                    return Err(SignerError::Failed {
                        tracking_id: tracking_id.to_string(),
                        reason: report.error.unwrap_or_else(|| report.status.clone()),
                    });
                }
                other => {
                    tracing::debug!(attempt, status = other, "signer still processing");
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        Err(SignerError::Timeout {
            tracking_id: tracking_id.to_string(),
            attempts: self.poll_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_body_is_camel_case() {
        let tx = SignerTransaction {
            from: Default::default(),
            to: Default::default(),
            chain_id: 56,
            data: Default::default(),
            nonce: 1,
            gas_price: "0x1".to_string(),
            gas_limit: "0x2".to_string(),
            tx_type: 0,
            value: "0x0".to_string(),
        };
        let body = serde_json::to_value(SubmitBody {
            request_id: "req-1",
            transaction: &tx,
        })
        .expect("serializes");
        assert_eq!(body["requestId"], "req-1");
        assert_eq!(body["transaction"]["gasLimit"], "0x2");
    }

    #[test]
    fn status_response_tolerates_missing_fields() {
        let report: StatusResponse =
            serde_json::from_str(r#"{"status":"pending"}"#).expect("decodes");
        assert_eq!(report.status, "pending");
        assert!(report.tx_hash.is_none());
        assert!(report.error.is_none());
    }

    #[test]
    fn client_builds_from_config() {
        let signer = HttpCustodySigner::new(&SignerConfig {
            base_url: "http://signer.local/".to_string(),
            ..SignerConfig::default()
        })
        .expect("client builds");
        assert_eq!(signer.base_url, "http://signer.local");
    }
}
