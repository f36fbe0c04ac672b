//! Concurrent page traversal with an accumulator owned by one invocation.
//!
//! The engine fetches the start page, hands every fetched page to a [`PageHandler`],
//! and follows the links it returns until none are left. `traverse` only returns after
//! every spawned page visit has finished.

use crate::error::{Result, ScraperError};
use crate::infra::PageFetcher;
use crate::types::Part;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::Url;

/// Result of handling one fetched page.
#[derive(Debug, Default)]
pub struct PageVisit {
    pub parts: Vec<Part>,
    pub links: Vec<Url>,
}

/// Site rules applied to each fetched page. Runs synchronously so parsed DOM trees never
/// cross an await point.
pub trait PageHandler: Send + Sync + 'static {
    fn handle(&self, page_url: &Url, html: &str) -> PageVisit;

    /// Whether a discovered link may be visited at all.
    fn follows(&self, _url: &Url) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TraversalLimits {
    pub max_pages: usize,
    pub concurrency: usize,
}

impl Default for TraversalLimits {
    fn default() -> Self {
        Self {
            max_pages: 500,
            concurrency: 4,
        }
    }
}

/// Everything one traversal produced.
#[derive(Debug, Default)]
pub struct Accumulator {
    pub parts: Vec<Part>,
    pub pages_visited: usize,
    pub page_errors: usize,
    /// Links dropped because the page cap was reached
    pub pages_skipped: usize,
}

/// A pagination link back to the first page of a listing.
pub fn is_first_page_link(url: &Url) -> bool {
    url.query_pairs()
        .any(|(name, value)| name == "page" && value.trim() == "1")
}

fn visit_key(url: &Url) -> String {
    let mut key = url.clone();
    key.set_fragment(None);
    key.to_string()
}

struct Frontier {
    visited: HashSet<String>,
    queue: VecDeque<Url>,
    limits: TraversalLimits,
    skipped: usize,
}

impl Frontier {
    fn schedule(&mut self, handler: &dyn PageHandler, url: Url) {
        if is_first_page_link(&url) || !handler.follows(&url) {
            return;
        }
        let key = visit_key(&url);
        if self.visited.contains(&key) {
            return;
        }
        if self.visited.len() >= self.limits.max_pages {
            self.skipped += 1;
            return;
        }
        self.visited.insert(key);
        self.queue.push_back(url);
    }
}

pub async fn traverse(
    fetcher: Arc<dyn PageFetcher>,
    handler: Arc<dyn PageHandler>,
    start: Url,
    limits: TraversalLimits,
) -> Result<Accumulator> {
    let mut acc = Accumulator::default();
    let mut frontier = Frontier {
        visited: HashSet::new(),
        queue: VecDeque::new(),
        limits,
        skipped: 0,
    };
    frontier.visited.insert(visit_key(&start));

    // Only the initial visit is allowed to fail the whole traversal.
    let html = fetcher
        .fetch(start.as_str())
        .await
        .map_err(|e| ScraperError::extraction(start.as_str(), e.to_string()))?;
    let visit = handler.handle(&start, &html);
    acc.pages_visited += 1;
    acc.parts.extend(visit.parts);
    for link in visit.links {
        frontier.schedule(handler.as_ref(), link);
    }

    let concurrency = limits.concurrency.max(1);
    let mut in_flight: JoinSet<(Url, Result<PageVisit>)> = JoinSet::new();

    loop {
        while in_flight.len() < concurrency {
            let Some(url) = frontier.queue.pop_front() else {
                break;
            };
            let fetcher = Arc::clone(&fetcher);
            let handler = Arc::clone(&handler);
            in_flight.spawn(async move {
                let outcome = fetcher
                    .fetch(url.as_str())
                    .await
                    .map(|html| handler.handle(&url, &html));
                (url, outcome)
            });
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };
        match joined {
            Ok((url, Ok(visit))) => {
                debug!("Visited {} ({} parts, {} links)", url, visit.parts.len(), visit.links.len());
                acc.pages_visited += 1;
                acc.parts.extend(visit.parts);
                for link in visit.links {
                    frontier.schedule(handler.as_ref(), link);
                }
            }
            Ok((url, Err(e))) => {
                warn!("Failed to visit {}: {}", url, e);
                acc.page_errors += 1;
            }
            Err(e) => {
                warn!("Page visit task failed: {}", e);
                acc.page_errors += 1;
            }
        }
    }

    acc.pages_skipped = frontier.skipped;
    if acc.pages_skipped > 0 {
        warn!(
            "Page cap of {} reached, {} links not visited",
            limits.max_pages, acc.pages_skipped
        );
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::StaticPages;

    /// Follows every `href="..."` in the page; emits one part per page containing "PART".
    struct LinkHandler;

    impl PageHandler for LinkHandler {
        fn handle(&self, page_url: &Url, html: &str) -> PageVisit {
            let links = html
                .split("href=\"")
                .skip(1)
                .filter_map(|rest| rest.split('"').next())
                .filter_map(|href| page_url.join(href).ok())
                .collect();
            let parts = if html.contains("PART") {
                vec![Part::new("Test", page_url.as_str())]
            } else {
                Vec::new()
            };
            PageVisit { parts, links }
        }
    }

    fn page(links: &[&str], part: bool) -> String {
        let mut html: String = links.iter().map(|l| format!("<a href=\"{}\">x</a>", l)).collect();
        if part {
            html.push_str("PART");
        }
        html
    }

    #[test]
    fn test_first_page_link_detection() {
        let first = Url::parse("https://shop.test/c?page=1").unwrap();
        let tenth = Url::parse("https://shop.test/c?page=10").unwrap();
        let other = Url::parse("https://shop.test/c?sort=1").unwrap();
        assert!(is_first_page_link(&first));
        assert!(!is_first_page_link(&tenth));
        assert!(!is_first_page_link(&other));
    }

    #[tokio::test]
    async fn test_visits_each_page_once_and_waits_for_all() {
        let pages = Arc::new(
            StaticPages::new()
                .with_page("https://shop.test/c", page(&["/p/a", "/p/b", "/c?page=2"], false))
                .with_page("https://shop.test/c?page=2", page(&["/p/b", "/p/c", "/c?page=1"], false))
                .with_page("https://shop.test/p/a", page(&[], true))
                .with_page("https://shop.test/p/b", page(&["/p/a"], true))
                .with_page("https://shop.test/p/c", page(&[], true)),
        );
        let acc = traverse(
            pages.clone(),
            Arc::new(LinkHandler),
            Url::parse("https://shop.test/c").unwrap(),
            TraversalLimits::default(),
        )
        .await
        .unwrap();

        assert_eq!(acc.parts.len(), 3);
        assert_eq!(acc.pages_visited, 5);
        assert_eq!(acc.page_errors, 0);
        assert_eq!(pages.hits("https://shop.test/p/b"), 1);
        assert_eq!(pages.hits("https://shop.test/c?page=1"), 0);
        assert_eq!(pages.total_hits(), 5);
    }

    #[tokio::test]
    async fn test_page_errors_do_not_abort() {
        let pages = Arc::new(
            StaticPages::new()
                .with_page("https://shop.test/c", page(&["/p/a", "/p/missing"], false))
                .with_page("https://shop.test/p/a", page(&[], true)),
        );
        let acc = traverse(
            pages,
            Arc::new(LinkHandler),
            Url::parse("https://shop.test/c").unwrap(),
            TraversalLimits::default(),
        )
        .await
        .unwrap();
        assert_eq!(acc.parts.len(), 1);
        assert_eq!(acc.page_errors, 1);
    }

    #[tokio::test]
    async fn test_initial_failure_is_hard_error() {
        let pages = Arc::new(StaticPages::new());
        let err = traverse(
            pages,
            Arc::new(LinkHandler),
            Url::parse("https://shop.test/nowhere").unwrap(),
            TraversalLimits::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ScraperError::Extraction { .. }));
    }

    #[tokio::test]
    async fn test_page_cap_limits_visits() {
        let pages = Arc::new(
            StaticPages::new()
                .with_page("https://shop.test/c", page(&["/p/a", "/p/b", "/p/c"], false))
                .with_page("https://shop.test/p/a", page(&[], true))
                .with_page("https://shop.test/p/b", page(&[], true))
                .with_page("https://shop.test/p/c", page(&[], true)),
        );
        let acc = traverse(
            pages.clone(),
            Arc::new(LinkHandler),
            Url::parse("https://shop.test/c").unwrap(),
            TraversalLimits {
                max_pages: 2,
                concurrency: 1,
            },
        )
        .await
        .unwrap();
        assert_eq!(acc.pages_visited, 2);
        assert_eq!(acc.pages_skipped, 2);
        assert_eq!(pages.total_hits(), 2);
    }
}
