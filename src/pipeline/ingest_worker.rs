use super::{PollSettings, StepOutcome, WorkerStats};
use crate::channel::Consumer;
use crate::error::Result;
use crate::observability::metrics;
use crate::storage::PartStore;
use crate::types::ScrapeResult;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// When a result message is committed after its parts were upserted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
    /// Commit once every part was attempted, even if some failed to persist.
    #[default]
    Always,
    /// Commit only when every part persisted; otherwise the result is redelivered.
    AllPersisted,
}

/// Pulls scrape results and upserts every part they carry.
pub struct IngestWorker {
    name: String,
    consumer: Box<dyn Consumer>,
    store: Arc<dyn PartStore>,
    policy: CommitPolicy,
    settings: PollSettings,
    stats: WorkerStats,
}

impl IngestWorker {
    pub fn new(
        name: impl Into<String>,
        consumer: Box<dyn Consumer>,
        store: Arc<dyn PartStore>,
        settings: PollSettings,
    ) -> Self {
        Self {
            name: name.into(),
            consumer,
            store,
            policy: CommitPolicy::default(),
            settings,
            stats: WorkerStats::default(),
        }
    }

    pub fn with_policy(mut self, policy: CommitPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> CommitPolicy {
        self.policy
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Upsert each part on its own; a failing part is logged and skipped.
    /// Returns `(persisted, failed)`.
    #[instrument(skip(self, result), fields(request_id = %result.request_id, parts = result.parts.len()))]
    pub async fn ingest(&self, result: &ScrapeResult) -> (u64, u64) {
        if let Some(failure) = &result.error {
            info!(
                "Scrape of {} failed ({:?}, retryable: {}): {}",
                result.url, failure.kind, failure.retryable, failure.message
            );
        }
        let (mut persisted, mut failed) = (0, 0);
        for part in &result.parts {
            match self.store.upsert_part(part).await {
                Ok(()) => {
                    persisted += 1;
                    metrics::ingest::part_persisted();
                }
                Err(e) => {
                    warn!("Failed to persist part {} ({}): {}", part.id, part.url, e);
                    failed += 1;
                    metrics::ingest::part_failed();
                }
            }
        }
        (persisted, failed)
    }

    /// One poll/process/commit cycle.
    pub async fn step(&mut self) -> Result<StepOutcome> {
        let Some(message) = self.consumer.poll(self.settings.poll_timeout).await? else {
            return Ok(StepOutcome::Idle);
        };
        self.stats.messages += 1;

        let result: ScrapeResult = match message.decode() {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    "Skipping malformed scrape result at {}[{}]@{}: {}",
                    message.topic, message.partition, message.offset, e
                );
                self.stats.malformed += 1;
                metrics::ingest::result_malformed();
                return Ok(StepOutcome::Uncommitted);
            }
        };
        metrics::ingest::result_consumed();

        let (persisted, failed) = self.ingest(&result).await;
        self.stats.parts_persisted += persisted;
        self.stats.parts_failed += failed;

        if failed > 0 && self.policy == CommitPolicy::AllPersisted {
            warn!(
                "{} of {} parts failed for request {}; leaving result uncommitted",
                failed,
                result.parts.len(),
                result.request_id
            );
            return Ok(StepOutcome::Uncommitted);
        }

        self.consumer.commit(&message).await?;
        self.stats.committed += 1;
        Ok(StepOutcome::Committed)
    }

    /// Loop until `token` is cancelled. A cycle in progress always completes first.
    pub async fn run(mut self, token: CancellationToken) -> WorkerStats {
        info!(
            "Ingest worker {} started on '{}' with {:?} commits",
            self.name,
            self.consumer.topic(),
            self.policy
        );
        while !token.is_cancelled() {
            let backoff = match self.step().await {
                Ok(StepOutcome::Idle) => true,
                Ok(_) => false,
                Err(e) => {
                    error!("Ingest worker {} poll failed: {}", self.name, e);
                    self.stats.poll_errors += 1;
                    metrics::poll_error(self.consumer.topic());
                    true
                }
            };
            if backoff {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.empty_poll_backoff) => {}
                }
            }
        }
        if let Err(e) = self.consumer.close().await {
            warn!("Ingest worker {} failed to close consumer: {}", self.name, e);
        }
        info!("Ingest worker {} stopped: {:?}", self.name, self.stats);
        self.stats
    }
}
