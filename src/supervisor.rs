// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Supervision for the engine's background tasks.
//!
//! Transfers, publish timers and commitment watches run as detached tokio
//! tasks. Instead of fire-and-forget spawns that can only log, every task
//! goes through [`Supervisor::spawn`]: failures are delivered to an
//! aggregation channel the host daemon (and tests) can observe, and all
//! tasks share one shutdown token.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A background task that returned an error.
#[derive(Debug)]
pub struct TaskFailure {
    pub task: String,
    pub error: anyhow::Error,
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    failures_tx: flume::Sender<TaskFailure>,
    failures_rx: flume::Receiver<TaskFailure>,
    shutdown: CancellationToken,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (failures_tx, failures_rx) = flume::unbounded();
        Self {
            failures_tx,
            failures_rx,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cancelled when [`Supervisor::shutdown`] is called. Tasks that
    /// wait on external events should select against it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Failure stream. Receivers see every task error in delivery order.
    pub fn failures(&self) -> flume::Receiver<TaskFailure> {
        self.failures_rx.clone()
    }

    /// Runs `fut` in the background. An `Err` return is reported to the
    /// failure channel; cancellation via the shutdown token ends the task
    /// silently.
    pub fn spawn(
        &self,
        task: impl Into<String>,
        fut: impl Future<Output = anyhow::Result<()>> + Send + 'static,
    ) {
        let task = task.into();
        let failures = self.failures_tx.clone();
        let shutdown = self.shutdown.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                res = fut => {
                    if let Err(error) = res {
                        warn!(%task, "background task failed: {error:#}");
                        let _ = failures.send(TaskFailure { task, error });
                    }
                }
            }
        });
    }

    /// Cancels every supervised task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
