use super::{PollSettings, StepOutcome, WorkerStats};
use crate::apis::ExtractorRegistry;
use crate::channel::{Consumer, Producer};
use crate::error::Result;
use crate::observability::metrics;
use crate::types::{ScrapeFailure, ScrapeRequest, ScrapeResult};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Pulls scrape requests, runs the matching extractor and publishes one result per request.
pub struct ScrapeWorker {
    name: String,
    consumer: Box<dyn Consumer>,
    producer: Arc<dyn Producer>,
    registry: Arc<ExtractorRegistry>,
    settings: PollSettings,
    stats: WorkerStats,
}

impl ScrapeWorker {
    pub fn new(
        name: impl Into<String>,
        consumer: Box<dyn Consumer>,
        producer: Arc<dyn Producer>,
        registry: Arc<ExtractorRegistry>,
        settings: PollSettings,
    ) -> Self {
        Self {
            name: name.into(),
            consumer,
            producer,
            registry,
            settings,
            stats: WorkerStats::default(),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Run the extractor for `request` and wrap the outcome. Never fails: problems end up
    /// in the result's error field.
    #[instrument(skip(self, request), fields(request_id = %request.id, url = %request.url))]
    pub async fn process(&self, request: &ScrapeRequest) -> ScrapeResult {
        let Some(extractor) = self.registry.find(&request.url) else {
            warn!("No extractor handles {}", request.url);
            metrics::scrape::request_unsupported();
            return ScrapeResult::failure(request, ScrapeFailure::unsupported(&request.url));
        };

        metrics::scrape::request_processed(extractor.source());
        match extractor.scrape(&request.url).await {
            Ok(parts) => {
                info!("Scraped {} parts with {}", parts.len(), extractor.source());
                ScrapeResult::success(request, parts)
            }
            Err(e) => {
                warn!("Extraction failed: {}", e);
                ScrapeResult::failure(request, ScrapeFailure::extraction(e.to_string()))
            }
        }
    }

    /// One poll/process/commit cycle.
    pub async fn step(&mut self) -> Result<StepOutcome> {
        let Some(message) = self.consumer.poll(self.settings.poll_timeout).await? else {
            return Ok(StepOutcome::Idle);
        };
        self.stats.messages += 1;

        let request: ScrapeRequest = match message.decode() {
            Ok(request) => request,
            Err(e) => {
                // Left uncommitted so the raw message stays available for inspection.
                warn!(
                    "Skipping malformed scrape request at {}[{}]@{}: {}",
                    message.topic, message.partition, message.offset, e
                );
                self.stats.malformed += 1;
                metrics::scrape::request_malformed();
                return Ok(StepOutcome::Uncommitted);
            }
        };

        let result = self.process(&request).await;
        let published = match serde_json::to_vec(&result) {
            Ok(payload) => self.producer.publish_keyed(&request.id, &payload).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = published {
            error!("Failed to publish result for request {}: {}", request.id, e);
            self.stats.publish_failures += 1;
            metrics::scrape::result_publish_error();
            return Ok(StepOutcome::Uncommitted);
        }
        self.stats.published += 1;
        metrics::scrape::result_published();

        self.consumer.commit(&message).await?;
        self.stats.committed += 1;
        Ok(StepOutcome::Committed)
    }

    /// Loop until `token` is cancelled. A cycle in progress always completes first.
    pub async fn run(mut self, token: CancellationToken) -> WorkerStats {
        info!("Scrape worker {} started on '{}'", self.name, self.consumer.topic());
        while !token.is_cancelled() {
            let backoff = match self.step().await {
                Ok(StepOutcome::Idle) => true,
                Ok(_) => false,
                Err(e) => {
                    error!("Scrape worker {} poll failed: {}", self.name, e);
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
            warn!("Scrape worker {} failed to close consumer: {}", self.name, e);
        }
        info!("Scrape worker {} stopped: {:?}", self.name, self.stats);
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::Extractor;
    use crate::channel::{ConsumerOptions, MemoryBroker};
    use crate::error::ScraperError;
    use crate::types::{FailureKind, Part};
    use async_trait::async_trait;
    use std::time::Duration;

    const REQUESTS: &str = "scrape_requests";
    const RESULTS: &str = "scrape_results";

    struct OnePart;

    #[async_trait]
    impl Extractor for OnePart {
        fn source(&self) -> &'static str {
            "Shop"
        }

        fn can_handle(&self, url: &str) -> bool {
            url.starts_with("https://shop.test/")
        }

        async fn scrape(&self, url: &str) -> Result<Vec<Part>> {
            if url.ends_with("/down") {
                return Err(ScraperError::extraction(url, "connection refused"));
            }
            Ok(vec![Part::new("Shop", url)])
        }
    }

    fn settings() -> PollSettings {
        PollSettings {
            poll_timeout: Duration::from_millis(20),
            empty_poll_backoff: Duration::from_millis(10),
        }
    }

    fn worker(broker: &MemoryBroker) -> ScrapeWorker {
        ScrapeWorker::new(
            "test",
            Box::new(broker.consumer(ConsumerOptions::new("g", REQUESTS)).unwrap()),
            Arc::new(broker.producer(RESULTS)),
            Arc::new(ExtractorRegistry::new(vec![Box::new(OnePart)])),
            settings(),
        )
    }

    async fn submit(broker: &MemoryBroker, url: &str) -> ScrapeRequest {
        let request = ScrapeRequest::new(url, "Shop");
        broker
            .producer(REQUESTS)
            .publish(&serde_json::to_vec(&request).unwrap())
            .await
            .unwrap();
        request
    }

    fn results(broker: &MemoryBroker) -> Vec<ScrapeResult> {
        broker
            .records(RESULTS)
            .iter()
            .map(|m| m.decode().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_success_is_published_then_committed() {
        let broker = MemoryBroker::new(1);
        let mut worker = worker(&broker);
        let request = submit(&broker, "https://shop.test/p/1").await;

        assert_eq!(worker.step().await.unwrap(), StepOutcome::Committed);
        let published = results(&broker);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].request_id, request.id);
        assert_eq!(published[0].parts.len(), 1);
        assert!(published[0].is_success());
        assert_eq!(broker.committed("g", REQUESTS, 0), Some(1));
        assert_eq!(broker.records(RESULTS)[0].key.as_deref(), Some(request.id.as_str()));
    }

    #[tokio::test]
    async fn test_unsupported_source_yields_failure_result() {
        let broker = MemoryBroker::new(1);
        let mut worker = worker(&broker);
        submit(&broker, "https://elsewhere.test/p/1").await;

        assert_eq!(worker.step().await.unwrap(), StepOutcome::Committed);
        let published = results(&broker);
        assert!(published[0].parts.is_empty());
        let failure = published[0].error.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::UnsupportedSource);
        assert!(!failure.retryable);
    }

    #[tokio::test]
    async fn test_extraction_error_is_reported_not_thrown() {
        let broker = MemoryBroker::new(1);
        let mut worker = worker(&broker);
        submit(&broker, "https://shop.test/down").await;

        assert_eq!(worker.step().await.unwrap(), StepOutcome::Committed);
        let failure = results(&broker)[0].error.clone().unwrap();
        assert_eq!(failure.kind, FailureKind::Extraction);
        assert!(failure.message.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_malformed_request_is_skipped_without_commit() {
        let broker = MemoryBroker::new(1);
        let mut worker = worker(&broker);
        broker.producer(REQUESTS).publish(b"{not json").await.unwrap();
        let good = submit(&broker, "https://shop.test/p/2").await;

        assert_eq!(worker.step().await.unwrap(), StepOutcome::Uncommitted);
        assert_eq!(broker.committed("g", REQUESTS, 0), None);
        assert!(broker.is_empty(RESULTS));

        // polling continues with the next message
        assert_eq!(worker.step().await.unwrap(), StepOutcome::Committed);
        assert_eq!(results(&broker)[0].request_id, good.id);
        assert_eq!(worker.stats().malformed, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let broker = MemoryBroker::new(1);
        let worker = worker(&broker);
        submit(&broker, "https://shop.test/p/3").await;

        let token = CancellationToken::new();
        let handle = tokio::spawn(worker.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.published, 1);
    }
}
