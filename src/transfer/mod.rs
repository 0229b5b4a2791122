// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Resumable data transport for online deals.
//!
//! One transfer fetches one deal's piece over HTTP into its staging file.
//! Interrupted fetches resume at byte granularity: every attempt starts a
//! `Range` request at the destination file's current length, so neither a
//! process crash nor a dropped connection ever re-downloads received bytes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ahash::HashSet;
use backon::{ExponentialBuilder, Retryable as _};
use cid::Cid;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::header;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// Wire parameters of one transfer, persisted on the deal record so the
/// fetch can be reconstructed after a restart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferParams {
    pub url: Url,
    pub headers: Vec<(String, String)>,
    /// Expected total length of the piece payload in bytes.
    pub size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: f32,
    /// Attempts after the first before a transient failure becomes final.
    pub max_retries: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            backoff_factor: 5.0,
            max_retries: 15,
        }
    }
}

/// Progress reports are coalesced to roughly one per 10% of the expected
/// size to bound event volume on large pieces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferEvent {
    Progress { received: u64 },
    Completed { received: u64 },
    Failed { error: String },
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The request can never succeed (4xx response, local file corrupt).
    #[error("transfer permanently failed: {0}")]
    Permanent(String),
    /// Worth retrying: connection errors, 5xx responses, early EOF.
    #[error("transient transfer failure: {0}")]
    Transient(String),
    #[error("transfer for {0} already executing")]
    AlreadyExecuting(Cid),
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    fn is_transient(&self) -> bool {
        matches!(self, TransferError::Transient(_))
    }
}

pub struct TransferManager {
    client: reqwest::Client,
    config: TransferConfig,
    active: Mutex<HashSet<Cid>>,
}

impl TransferManager {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            active: Mutex::new(HashSet::default()),
        }
    }

    /// Whether a transfer for this deal is currently running. Used by crash
    /// recovery to skip deals that are already mid-transfer.
    pub fn is_executing(&self, proposal_cid: &Cid) -> bool {
        self.active.lock().contains(proposal_cid)
    }

    /// Starts (or resumes) the fetch for one deal. Events arrive on the
    /// returned channel; the terminal event is always `Completed` or
    /// `Failed`. Cancelling stops the retry loop at its next checkpoint.
    pub fn execute(
        self: &Arc<Self>,
        proposal_cid: Cid,
        params: TransferParams,
        dest: PathBuf,
        cancel: CancellationToken,
    ) -> Result<flume::Receiver<TransferEvent>, TransferError> {
        if !self.active.lock().insert(proposal_cid) {
            return Err(TransferError::AlreadyExecuting(proposal_cid));
        }
        let (tx, rx) = flume::unbounded();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(TransferError::Cancelled),
                res = manager.run(&params, &dest, &tx) => res,
            };
            match result {
                Ok(received) => {
                    debug!(%proposal_cid, received, "transfer complete");
                    let _ = tx.send(TransferEvent::Completed { received });
                }
                Err(e) => {
                    warn!(%proposal_cid, "transfer failed: {e}");
                    let _ = tx.send(TransferEvent::Failed {
                        error: e.to_string(),
                    });
                }
            }
            manager.active.lock().remove(&proposal_cid);
        });
        Ok(rx)
    }

    async fn run(
        &self,
        params: &TransferParams,
        dest: &PathBuf,
        events: &flume::Sender<TransferEvent>,
    ) -> Result<u64, TransferError> {
        // Idempotent restart: everything already on disk means no request
        // at all.
        if file_len(dest).await == params.size {
            return Ok(params.size);
        }

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.config.min_backoff)
            .with_max_delay(self.config.max_backoff)
            .with_factor(self.config.backoff_factor)
            .with_max_times(self.config.max_retries)
            .with_jitter();

        (|| self.attempt(params, dest, events))
            .retry(backoff)
            .when(TransferError::is_transient)
            .await
    }

    /// One request cycle: resume from the current file length, stream the
    /// rest into the file in append mode.
    async fn attempt(
        &self,
        params: &TransferParams,
        dest: &PathBuf,
        events: &flume::Sender<TransferEvent>,
    ) -> Result<u64, TransferError> {
        let have = file_len(dest).await;
        if have == params.size {
            return Ok(have);
        }
        if have > params.size {
            return Err(TransferError::Permanent(format!(
                "staged file has {have} bytes, more than the expected {}",
                params.size
            )));
        }

        let mut request = self
            .client
            .get(params.url.clone())
            .header(header::RANGE, format!("bytes={have}-"));
        for (name, value) in &params.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| TransferError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(TransferError::Permanent(format!(
                "server rejected request: {status}"
            )));
        }
        if !status.is_success() {
            return Err(TransferError::Transient(format!(
                "unexpected response status: {status}"
            )));
        }

        // A server that ignores the range header replays the whole piece;
        // start the file over rather than appending a duplicate.
        let mut received = have;
        let mut file = if have > 0 && status == StatusCode::OK {
            received = 0;
            tokio::fs::File::create(dest)
                .await
                .map_err(|e| TransferError::Permanent(e.to_string()))?
        } else {
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dest)
                .await
                .map_err(|e| TransferError::Permanent(e.to_string()))?
        };

        let step = (params.size / 10).max(1);
        let mut last_reported = received;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| TransferError::Transient(e.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| TransferError::Permanent(e.to_string()))?;
            received += chunk.len() as u64;
            if received > params.size {
                return Err(TransferError::Permanent(format!(
                    "server sent {received} bytes, more than the expected {}",
                    params.size
                )));
            }
            if received - last_reported >= step {
                last_reported = received;
                let _ = events.send(TransferEvent::Progress { received });
            }
        }
        file.flush()
            .await
            .map_err(|e| TransferError::Permanent(e.to_string()))?;

        if received < params.size {
            return Err(TransferError::Transient(format!(
                "connection closed after {received} of {} bytes",
                params.size
            )));
        }
        Ok(received)
    }
}

async fn file_len(path: &PathBuf) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}
