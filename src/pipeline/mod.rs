// Scrape pipeline: traversal engine, workers and the runner that wires them together

pub mod ingest_worker;
pub mod runner;
pub mod scrape_worker;
pub mod traversal;

use std::ops::AddAssign;
use std::time::Duration;

pub use ingest_worker::{CommitPolicy, IngestWorker};
pub use runner::{Runner, RunnerSettings, RunnerStats};
pub use scrape_worker::ScrapeWorker;

/// What one poll/process/commit cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing to read within the poll timeout
    Idle,
    /// Message handled and committed
    Committed,
    /// Message handled or rejected but left uncommitted
    Uncommitted,
}

/// Poll timing shared by both worker kinds.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub poll_timeout: Duration,
    pub empty_poll_backoff: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            empty_poll_backoff: Duration::from_millis(500),
        }
    }
}

impl From<&crate::config::WorkerConfig> for PollSettings {
    fn from(config: &crate::config::WorkerConfig) -> Self {
        Self {
            poll_timeout: config.poll_timeout(),
            empty_poll_backoff: config.empty_poll_backoff(),
        }
    }
}

/// Counters a worker reports when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub messages: u64,
    pub committed: u64,
    pub malformed: u64,
    /// Scrape results published
    pub published: u64,
    pub publish_failures: u64,
    pub parts_persisted: u64,
    pub parts_failed: u64,
    pub poll_errors: u64,
}

impl AddAssign for WorkerStats {
    fn add_assign(&mut self, other: Self) {
        self.messages += other.messages;
        self.committed += other.committed;
        self.malformed += other.malformed;
        self.published += other.published;
        self.publish_failures += other.publish_failures;
        self.parts_persisted += other.parts_persisted;
        self.parts_failed += other.parts_failed;
        self.poll_errors += other.poll_errors;
    }
}
