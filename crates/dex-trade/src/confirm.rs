//! Confirmation of submitted transactions.
//!
//! Submissions enqueue a [`ConfirmationJob`]; a [`ConfirmationWorker`] runs
//! each job on its own task: it waits for the signer's broadcast hash, polls
//! for the receipt and moves the request log to its terminal state. Jobs are
//! not persisted themselves. A pending request log *is* the job, so
//! [`recover_pending`] re-enqueues whatever a previous process left behind.

use alloy::primitives::B256;
use dex_data::types::RequestStatus;
use dex_data::{ChainClients, ChainError, ChainReader, Store};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::ReceiptPolicy;
use crate::signer::{CustodySigner, SignerError};

pub const REVERTED_REASON: &str = "reverted transaction";
pub const NO_RECEIPT_REASON: &str = "no receipt from block";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfirmationJob {
    /// Signer tracking id, also the request log key.
    pub returned_id: String,
    pub chain_id: u64,
    pub auth_token: String,
}

/// Terminal result of receipt polling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiptOutcome {
    Confirmed(B256),
    Reverted,
    NoReceipt,
}

impl ReceiptOutcome {
    pub fn failure_reason(&self) -> Option<&'static str> {
        match self {
            ReceiptOutcome::Confirmed(_) => None,
            ReceiptOutcome::Reverted => Some(REVERTED_REASON),
            ReceiptOutcome::NoReceipt => Some(NO_RECEIPT_REASON),
        }
    }
}

/// Polls for the receipt of `tx_hash`, pausing `policy.interval()` between
/// attempts. Status 1 confirms; any other status is a revert.
///
/// # Errors
/// Propagates the first endpoint error.
pub async fn poll_receipt(
    chain: &dyn ChainReader,
    tx_hash: B256,
    policy: ReceiptPolicy,
) -> Result<ReceiptOutcome, ChainError> {
    for attempt in 1..=policy.attempts {
        if let Some(receipt) = chain.receipt(tx_hash).await? {
            return Ok(if receipt.succeeded() {
                ReceiptOutcome::Confirmed(receipt.transaction_hash)
            } else {
                ReceiptOutcome::Reverted
            });
        }
        tracing::debug!(%tx_hash, attempt, "receipt not available yet");
        if attempt < policy.attempts {
            tokio::time::sleep(policy.interval()).await;
        }
    }
    Ok(ReceiptOutcome::NoReceipt)
}

/// Writes `outcome` to the request log; storage failures are only logged.
pub fn record_outcome(store: &Store, returned_id: &str, outcome: ReceiptOutcome) {
    let result = match outcome {
        ReceiptOutcome::Confirmed(hash) => store.update_request_log_by_returned_id(
            returned_id,
            RequestStatus::Confirmed,
            Some(&hash.to_string()),
            None,
        ),
        failed => store.update_request_log_by_returned_id(
            returned_id,
            RequestStatus::Failed,
            None,
            failed.failure_reason(),
        ),
    };

    match result {
        Ok(true) => tracing::info!(returned_id, ?outcome, "request log finalized"),
        Ok(false) => tracing::warn!(returned_id, "no pending request log to finalize"),
        Err(error) => tracing::error!(returned_id, error = %error, "failed to update request log"),
    }
}

/// Everything a confirmation job needs, shared by all job tasks.
#[derive(Clone)]
pub struct Confirmer {
    store: Arc<Store>,
    chains: ChainClients,
    signer: Arc<dyn CustodySigner>,
    policy: ReceiptPolicy,
}

impl Confirmer {
    pub fn new(
        store: Arc<Store>,
        chains: ChainClients,
        signer: Arc<dyn CustodySigner>,
        policy: ReceiptPolicy,
    ) -> Self {
        Self {
            store,
            chains,
            signer,
            policy,
        }
    }

    /// Runs one job to completion.
    ///
    /// Transient signer or endpoint errors leave the log pending so a later
    /// [`recover_pending`] can retry it.
    #[tracing::instrument(skip_all, fields(returned_id = %job.returned_id, chain_id = job.chain_id))]
    pub async fn confirm(&self, job: ConfirmationJob) {
        let Some(chain) = self.chains.get(job.chain_id) else {
            tracing::warn!("no reader for chain, request log left pending");
            return;
        };

        let tx_hash = match self
            .signer
            .poll_by_request_id(&job.returned_id, &job.auth_token)
            .await
        {
            Ok(hash) => hash,
            Err(SignerError::Failed { reason, .. }) => {
                if let Err(error) = self.store.update_request_log_by_returned_id(
                    &job.returned_id,
                    RequestStatus::Failed,
                    None,
                    Some(&reason),
                ) {
                    tracing::error!(error = %error, "failed to update request log");
                }
                return;
            }
            Err(error) => {
                tracing::warn!(error = %error, "signer poll failed, request log left pending");
                return;
            }
        };

        match poll_receipt(chain.as_ref(), tx_hash, self.policy).await {
            Ok(outcome) => record_outcome(&self.store, &job.returned_id, outcome),
            Err(error) => {
                tracing::warn!(%tx_hash, error = %error, "receipt polling failed, request log left pending");
            }
        }
    }
}

/// Producer side of the confirmation queue.
#[derive(Clone)]
pub struct ConfirmationQueue {
    sender: mpsc::UnboundedSender<ConfirmationJob>,
}

impl ConfirmationQueue {
    /// Queues `job`; returns `false` once the worker has stopped.
    pub fn enqueue(&self, job: ConfirmationJob) -> bool {
        match self.sender.send(job) {
            Ok(()) => true,
            Err(mpsc::error::SendError(job)) => {
                tracing::warn!(
                    returned_id = %job.returned_id,
                    "confirmation worker stopped, request log left pending"
                );
                false
            }
        }
    }
}

/// Supervised consumer of the confirmation queue.
///
/// Stops when every [`ConfirmationQueue`] is dropped (after finishing the
/// jobs in flight) or when the cancellation token fires (aborting them).
pub struct ConfirmationWorker {
    confirmer: Arc<Confirmer>,
    receiver: mpsc::UnboundedReceiver<ConfirmationJob>,
    cancel: CancellationToken,
}

impl ConfirmationWorker {
    pub fn new(confirmer: Confirmer, cancel: CancellationToken) -> (Self, ConfirmationQueue) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = Self {
            confirmer: Arc::new(confirmer),
            receiver,
            cancel,
        };
        (worker, ConfirmationQueue { sender })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!(in_flight = tasks.len(), "confirmation worker cancelled");
                    tasks.abort_all();
                    break;
                }
                job = self.receiver.recv() => match job {
                    Some(job) => {
                        let confirmer = self.confirmer.clone();
                        tasks.spawn(async move { confirmer.confirm(job).await });
                    }
                    None => break,
                },
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(error) = result {
                        tracing::error!(error = %error, "confirmation task panicked");
                    }
                }
            }
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(error) = result {
                if error.is_panic() {
                    tracing::error!(error = %error, "confirmation task panicked");
                }
            }
        }
        tracing::debug!("confirmation worker stopped");
    }
}

/// Re-enqueues every pending request log using the service `auth_token`.
///
/// # Errors
/// Returns error if the pending logs cannot be read.
pub fn recover_pending(store: &Store, queue: &ConfirmationQueue, auth_token: &str) -> eyre::Result<usize> {
    let pending = store.pending_request_logs()?;
    let mut queued = 0;
    for log in pending {
        let job = ConfirmationJob {
            returned_id: log.returned_id,
            chain_id: log.transaction.chain_id,
            auth_token: auth_token.to_string(),
        };
        if queue.enqueue(job) {
            queued += 1;
        }
    }
    tracing::info!(queued, "re-enqueued pending request logs");
    Ok(queued)
}
