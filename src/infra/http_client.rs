use crate::error::{Result, ScraperError};
use crate::infra::rate_limiter::RateLimiter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Fetches the HTML body of a page.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    limiter: RateLimiter,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration, limiter: RateLimiter) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .gzip(true)
            .build()?;
        Ok(Self { client, limiter })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let _permit = self.limiter.acquire().await;
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ScraperError::extraction(
                url,
                format!("request failed with status {}", status.as_u16()),
            ));
        }
        let body = resp.text().await?;
        debug!("Fetched {} ({} bytes)", url, body.len());
        Ok(body)
    }
}

/// Serves pages from memory. Used to replay saved pages and in tests.
#[derive(Default)]
pub struct StaticPages {
    pages: HashMap<String, String>,
    hits: Mutex<HashMap<String, usize>>,
}

impl StaticPages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.pages.insert(url.into(), html.into());
        self
    }

    /// Number of times `url` was requested, including misses.
    pub fn hits(&self, url: &str) -> usize {
        self.hits
            .lock()
            .map(|h| h.get(url).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.hits.lock().map(|h| h.values().sum()).unwrap_or(0)
    }
}

#[async_trait]
impl PageFetcher for StaticPages {
    async fn fetch(&self, url: &str) -> Result<String> {
        if let Ok(mut hits) = self.hits.lock() {
            *hits.entry(url.to_string()).or_insert(0) += 1;
        }
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| ScraperError::extraction(url, "request failed with status 404"))
    }
}
