//! Background freshness loop.
//!
//! [`FreshnessScheduler`] runs one freshness pass per interval on a single
//! tokio task, so passes never overlap. A failed pass is logged and the
//! loop waits for the next interval. Cancellation is only observed between
//! passes: a pass that has started always finishes its batch.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use embedstore_core::models::ReembedReport;
use embedstore_core::store::ChunkStore;
use embedstore_core::EmbeddingIndex;

use crate::config::FreshnessConfig;

/// Result of one scheduler tick.
#[derive(Debug, Clone)]
pub enum TickOutcome {
    Completed(ReembedReport),
    Failed(String),
}

pub struct FreshnessScheduler<S> {
    index: Arc<EmbeddingIndex<S>>,
    config: FreshnessConfig,
    observer: Option<mpsc::UnboundedSender<TickOutcome>>,
}

/// Handle to a running scheduler task.
pub struct SchedulerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Ask the loop to stop after any in-flight pass.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to exit.
    pub async fn join(self) -> anyhow::Result<()> {
        self.task.await?;
        Ok(())
    }
}

impl<S: ChunkStore + 'static> FreshnessScheduler<S> {
    pub fn new(index: Arc<EmbeddingIndex<S>>, config: FreshnessConfig) -> Self {
        Self {
            index,
            config,
            observer: None,
        }
    }

    /// Report every tick's outcome on `tx`.
    pub fn with_observer(mut self, tx: mpsc::UnboundedSender<TickOutcome>) -> Self {
        self.observer = Some(tx);
        self
    }

    pub fn spawn(self) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { self.run(token).await });
        SchedulerHandle { cancel, task }
    }

    async fn run(self, cancel: CancellationToken) {
        let interval = self.config.interval();
        info!(
            interval_secs = interval.as_secs(),
            max_age_hours = self.config.max_age_hours,
            limit = self.config.limit,
            "freshness scheduler started"
        );

        if !wait_idle(&cancel, self.config.initial_delay()).await {
            info!("freshness scheduler cancelled before first tick");
            return;
        }

        loop {
            let outcome = self.tick().await;
            if let Some(tx) = &self.observer {
                // Receiver may be gone; the loop does not depend on it
                let _ = tx.send(outcome);
            }
            if !wait_idle(&cancel, interval).await {
                break;
            }
        }
        info!("freshness scheduler stopped");
    }

    async fn tick(&self) -> TickOutcome {
        match self
            .index
            .reembed_stale(&self.config.reembed_options())
            .await
        {
            Ok(report) => {
                debug!(
                    reembedded = report.reembedded,
                    skipped = report.skipped,
                    "freshness tick complete"
                );
                TickOutcome::Completed(report)
            }
            Err(e) => {
                warn!(error = %e, retryable = e.is_retryable(), "freshness tick failed");
                TickOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Sleep for `period` unless cancelled first. Returns `false` on cancel.
async fn wait_idle(cancel: &CancellationToken, period: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(period) => true,
    }
}
