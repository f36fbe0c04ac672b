pub mod jenson_usa;

use crate::error::Result;
use crate::infra::PageFetcher;
use crate::pipeline::traversal::TraversalLimits;
use crate::types::Part;
use async_trait::async_trait;
use std::sync::Arc;

pub use jenson_usa::JensonUsaExtractor;

/// Site-specific rule set turning a URL into normalized parts.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Source name stamped on every part this extractor produces.
    fn source(&self) -> &'static str;

    fn can_handle(&self, url: &str) -> bool;

    /// Visit `url` and every page discovered from it. Individual page failures are
    /// logged; only a failure to start is returned as an error.
    async fn scrape(&self, url: &str) -> Result<Vec<Part>>;
}

/// Closed, ordered list of extractors. The first one that accepts a URL wins.
pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new(extractors: Vec<Box<dyn Extractor>>) -> Self {
        Self { extractors }
    }

    /// Every supported site, sharing one fetcher.
    pub fn with_defaults(fetcher: Arc<dyn PageFetcher>, limits: TraversalLimits) -> Self {
        Self::new(vec![Box::new(JensonUsaExtractor::new(fetcher, limits))])
    }

    pub fn find(&self, url: &str) -> Option<&dyn Extractor> {
        self.extractors
            .iter()
            .find(|e| e.can_handle(url))
            .map(|e| e.as_ref())
    }

    pub fn sources(&self) -> Vec<&'static str> {
        self.extractors.iter().map(|e| e.source()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::StaticPages;

    struct Fixed(&'static str, &'static str);

    #[async_trait]
    impl Extractor for Fixed {
        fn source(&self) -> &'static str {
            self.0
        }

        fn can_handle(&self, url: &str) -> bool {
            url.contains(self.1)
        }

        async fn scrape(&self, _url: &str) -> Result<Vec<Part>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_first_match_wins() {
        let registry = ExtractorRegistry::new(vec![
            Box::new(Fixed("first", "shop")),
            Box::new(Fixed("second", "shop.test")),
        ]);
        assert_eq!(registry.find("https://shop.test/x").map(|e| e.source()), Some("first"));
        assert!(registry.find("https://elsewhere.test/x").is_none());
        assert_eq!(registry.sources(), vec!["first", "second"]);
    }

    #[test]
    fn test_defaults_handle_jenson_usa_only() {
        let registry =
            ExtractorRegistry::with_defaults(Arc::new(StaticPages::new()), TraversalLimits::default());
        assert_eq!(
            registry
                .find("https://www.jensonusa.com/products/widget")
                .map(|e| e.source()),
            Some("JensonUSA")
        );
        assert!(registry.find("https://www.example.com/products/widget").is_none());
        assert!(registry.find("not a url").is_none());
    }
}
