use super::{CommitPolicy, IngestWorker, PollSettings, ScrapeWorker, WorkerStats};
use crate::apis::ExtractorRegistry;
use crate::channel::{assign_partitions, Channels, ConsumerOptions};
use crate::constants::group_id;
use crate::error::Result;
use crate::storage::PartStore;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Topics, groups and worker counts for one runner.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub requests_topic: String,
    pub results_topic: String,
    pub group_prefix: String,
    pub scrape_workers: usize,
    pub ingest_workers: usize,
    pub commit_policy: CommitPolicy,
    pub poll: PollSettings,
}

impl From<&crate::config::Config> for RunnerSettings {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            requests_topic: config.channel.requests_topic.clone(),
            results_topic: config.channel.results_topic.clone(),
            group_prefix: config.channel.group_prefix.clone(),
            scrape_workers: config.worker.scrape_workers,
            ingest_workers: config.worker.ingest_workers,
            commit_policy: config.worker.commit_policy,
            poll: PollSettings::from(&config.worker),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerStats {
    pub scrape: WorkerStats,
    pub ingest: WorkerStats,
}

enum Finished {
    Scrape(WorkerStats),
    Ingest(WorkerStats),
}

/// Spawns scrape and ingestion workers that share one cancellation token.
///
/// Scrape workers need an extractor registry and ingest workers need a part store; a
/// role without its dependency is not started.
pub struct Runner {
    channels: Channels,
    registry: Option<Arc<ExtractorRegistry>>,
    store: Option<Arc<dyn PartStore>>,
    settings: RunnerSettings,
}

impl Runner {
    pub fn new(channels: Channels, settings: RunnerSettings) -> Self {
        Self {
            channels,
            registry: None,
            store: None,
            settings,
        }
    }

    pub fn with_scraping(mut self, registry: Arc<ExtractorRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_ingestion(mut self, store: Arc<dyn PartStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Static partition assignment for `workers` instances of one group.
    fn assignments(&self, workers: usize) -> Vec<Option<Vec<u32>>> {
        match self.channels.partitions() {
            Some(partitions) => {
                if workers as u32 > partitions {
                    warn!(
                        "{} workers for {} partitions; some workers will stay idle",
                        workers, partitions
                    );
                }
                assign_partitions(partitions, workers)
                    .into_iter()
                    .take(workers)
                    .map(Some)
                    .collect()
            }
            None => vec![None; workers],
        }
    }

    fn options(&self, topic: &str, partitions: Option<Vec<u32>>) -> ConsumerOptions {
        let options = ConsumerOptions::new(group_id(&self.settings.group_prefix, topic), topic);
        match partitions {
            Some(p) => options.with_partitions(p),
            None => options,
        }
    }

    /// Build every worker, then run them until `token` is cancelled. Failing to attach a
    /// consumer or producer is fatal and nothing is started.
    pub async fn run(self, token: CancellationToken) -> Result<RunnerStats> {
        let mut workers: JoinSet<Finished> = JoinSet::new();
        let mut scrape = Vec::new();
        let mut ingest = Vec::new();

        if let Some(registry) = self.registry.as_ref().filter(|_| self.settings.scrape_workers > 0) {
            let producer = self.channels.producer(&self.settings.results_topic)?;
            for (i, partitions) in self.assignments(self.settings.scrape_workers).into_iter().enumerate() {
                let consumer = self
                    .channels
                    .consumer(self.options(&self.settings.requests_topic, partitions))
                    .await?;
                scrape.push(ScrapeWorker::new(
                    format!("scrape-{}", i),
                    consumer,
                    Arc::clone(&producer),
                    Arc::clone(registry),
                    self.settings.poll,
                ));
            }
        }

        if let Some(store) = self.store.as_ref() {
            for (i, partitions) in self.assignments(self.settings.ingest_workers).into_iter().enumerate() {
                let consumer = self
                    .channels
                    .consumer(self.options(&self.settings.results_topic, partitions))
                    .await?;
                ingest.push(
                    IngestWorker::new(
                        format!("ingest-{}", i),
                        consumer,
                        Arc::clone(store),
                        self.settings.poll,
                    )
                    .with_policy(self.settings.commit_policy),
                );
            }
        }

        info!(
            "Starting {} scrape and {} ingest workers",
            scrape.len(),
            ingest.len()
        );
        for worker in scrape {
            let token = token.clone();
            workers.spawn(async move { Finished::Scrape(worker.run(token).await) });
        }
        for worker in ingest {
            let token = token.clone();
            workers.spawn(async move { Finished::Ingest(worker.run(token).await) });
        }

        let mut stats = RunnerStats::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Finished::Scrape(s)) => stats.scrape += s,
                Ok(Finished::Ingest(s)) => stats.ingest += s,
                Err(e) => error!("Worker task failed: {}", e),
            }
        }
        info!("All workers stopped: {:?}", stats);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MemoryBroker, Producer};
    use crate::infra::StaticPages;
    use crate::pipeline::traversal::TraversalLimits;
    use crate::storage::InMemoryPartStore;
    use crate::types::ScrapeRequest;
    use std::time::Duration;

    fn settings(scrape_workers: usize, ingest_workers: usize) -> RunnerSettings {
        RunnerSettings {
            requests_topic: "scrape_requests".into(),
            results_topic: "scrape_results".into(),
            group_prefix: "bike-parts-finder".into(),
            scrape_workers,
            ingest_workers,
            commit_policy: CommitPolicy::default(),
            poll: PollSettings {
                poll_timeout: Duration::from_millis(20),
                empty_poll_backoff: Duration::from_millis(10),
            },
        }
    }

    fn runner(broker: &MemoryBroker, store: Arc<InMemoryPartStore>, scrape: usize, ingest: usize) -> Runner {
        let registry = ExtractorRegistry::with_defaults(Arc::new(StaticPages::new()), TraversalLimits::default());
        Runner::new(Channels::Memory(broker.clone()), settings(scrape, ingest))
            .with_scraping(Arc::new(registry))
            .with_ingestion(store)
    }

    #[test]
    fn test_assignments_split_partitions() {
        let broker = MemoryBroker::new(4);
        let r = runner(&broker, Arc::new(InMemoryPartStore::new()), 2, 1);
        assert_eq!(r.assignments(2), vec![Some(vec![0, 2]), Some(vec![1, 3])]);
        assert_eq!(r.assignments(1), vec![Some(vec![0, 1, 2, 3])]);
        assert!(r.assignments(0).is_empty());
    }

    #[tokio::test]
    async fn test_requests_flow_through_until_cancelled() {
        let broker = MemoryBroker::new(2);
        let store = Arc::new(InMemoryPartStore::new());
        let requests = broker.producer("scrape_requests");
        for url in ["https://elsewhere.test/a", "https://elsewhere.test/b", "https://elsewhere.test/c"] {
            let request = ScrapeRequest::new(url, "");
            requests
                .publish(&serde_json::to_vec(&request).unwrap())
                .await
                .unwrap();
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(runner(&broker, store, 2, 2).run(token.clone()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while broker.len("scrape_results") < 3 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.scrape.committed, 3);
        assert_eq!(stats.scrape.published, 3);
        assert_eq!(stats.ingest.committed, 3);
        assert_eq!(stats.ingest.parts_persisted, 0);
    }
}
