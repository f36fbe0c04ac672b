//! Metric names and recording helpers for the scrape pipeline.
//!
//! Recording is a no-op until a recorder is installed, so library code and tests can
//! call these helpers unconditionally.

use std::fmt;
use std::net::SocketAddr;
use tracing::{info, warn};

/// All metric names used in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Scrape worker
    RequestsProcessed,
    RequestsMalformed,
    RequestsUnsupported,
    ResultsPublished,
    ResultsPublishError,
    ExtractionDuration,
    ExtractionPagesVisited,
    ExtractionPageErrors,

    // Ingestion worker
    ResultsConsumed,
    PartsPersisted,
    PartsFailed,
    ResultsMalformed,

    // Channel
    ChannelPollError,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::RequestsProcessed => "parts_finder_scrape_requests_processed_total",
            MetricName::RequestsMalformed => "parts_finder_scrape_requests_malformed_total",
            MetricName::RequestsUnsupported => "parts_finder_scrape_requests_unsupported_total",
            MetricName::ResultsPublished => "parts_finder_scrape_results_published_total",
            MetricName::ResultsPublishError => "parts_finder_scrape_results_publish_error_total",
            MetricName::ExtractionDuration => "parts_finder_extraction_duration_seconds",
            MetricName::ExtractionPagesVisited => "parts_finder_extraction_pages_visited_total",
            MetricName::ExtractionPageErrors => "parts_finder_extraction_page_errors_total",

            MetricName::ResultsConsumed => "parts_finder_ingest_results_consumed_total",
            MetricName::PartsPersisted => "parts_finder_ingest_parts_persisted_total",
            MetricName::PartsFailed => "parts_finder_ingest_parts_failed_total",
            MetricName::ResultsMalformed => "parts_finder_ingest_results_malformed_total",

            MetricName::ChannelPollError => "parts_finder_channel_poll_error_total",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Install the Prometheus recorder with an HTTP listener on `addr`.
pub fn install_exporter(addr: SocketAddr) {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
    match builder.install() {
        Ok(()) => info!("Prometheus exporter listening on http://{}/metrics", addr),
        Err(e) => warn!("Prometheus exporter install failed (possibly already installed): {}", e),
    }
}

pub mod scrape {
    use super::MetricName;

    pub fn request_processed(source: &str) {
        ::metrics::counter!(MetricName::RequestsProcessed.as_str(), "source" => source.to_string())
            .increment(1);
    }

    pub fn request_malformed() {
        ::metrics::counter!(MetricName::RequestsMalformed.as_str()).increment(1);
    }

    pub fn request_unsupported() {
        ::metrics::counter!(MetricName::RequestsUnsupported.as_str()).increment(1);
    }

    pub fn result_published() {
        ::metrics::counter!(MetricName::ResultsPublished.as_str()).increment(1);
    }

    pub fn result_publish_error() {
        ::metrics::counter!(MetricName::ResultsPublishError.as_str()).increment(1);
    }

    pub fn extraction_duration(source: &str, secs: f64) {
        ::metrics::histogram!(MetricName::ExtractionDuration.as_str(), "source" => source.to_string())
            .record(secs);
    }

    pub fn pages_visited(count: u64) {
        ::metrics::counter!(MetricName::ExtractionPagesVisited.as_str()).increment(count);
    }

    pub fn page_errors(count: u64) {
        ::metrics::counter!(MetricName::ExtractionPageErrors.as_str()).increment(count);
    }
}

pub mod ingest {
    use super::MetricName;

    pub fn result_consumed() {
        ::metrics::counter!(MetricName::ResultsConsumed.as_str()).increment(1);
    }

    pub fn part_persisted() {
        ::metrics::counter!(MetricName::PartsPersisted.as_str()).increment(1);
    }

    pub fn part_failed() {
        ::metrics::counter!(MetricName::PartsFailed.as_str()).increment(1);
    }

    pub fn result_malformed() {
        ::metrics::counter!(MetricName::ResultsMalformed.as_str()).increment(1);
    }
}

pub fn poll_error(topic: &str) {
    ::metrics::counter!(MetricName::ChannelPollError.as_str(), "topic" => topic.to_string())
        .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_are_prefixed() {
        for name in [
            MetricName::RequestsProcessed,
            MetricName::ExtractionDuration,
            MetricName::PartsFailed,
            MetricName::ChannelPollError,
        ] {
            assert!(name.as_str().starts_with("parts_finder_"));
            assert_eq!(name.to_string(), name.as_str());
        }
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        scrape::request_processed("JensonUSA");
        ingest::part_failed();
        poll_error("scrape_requests");
    }
}
