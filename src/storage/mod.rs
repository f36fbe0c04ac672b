pub mod cache;
pub mod database;
pub mod in_memory;

use crate::error::Result;
use crate::types::Part;
use async_trait::async_trait;

pub use cache::{CachedPartReader, InMemoryCache, PartCache};
pub use database::SqlPartStore;
pub use in_memory::InMemoryPartStore;

/// Filters for `search_parts`. Every set field is a case-insensitive substring match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    /// Matched against brand, model and description
    pub query: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
}

impl SearchQuery {
    pub fn text(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Default::default()
        }
    }

    pub fn with_brand(mut self, brand: impl Into<String>) -> Self {
        self.brand = Some(brand.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    fn term(value: &Option<String>) -> Option<String> {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_lowercase)
    }

    pub(crate) fn query_term(&self) -> Option<String> {
        Self::term(&self.query)
    }

    pub(crate) fn brand_term(&self) -> Option<String> {
        Self::term(&self.brand)
    }

    pub(crate) fn category_term(&self) -> Option<String> {
        Self::term(&self.category)
    }

    pub fn matches(&self, part: &Part) -> bool {
        let contains = |haystack: &str, needle: &str| haystack.to_lowercase().contains(needle);
        if let Some(q) = self.query_term() {
            if !(contains(&part.brand, &q) || contains(&part.model, &q) || contains(&part.description, &q)) {
                return false;
            }
        }
        if let Some(b) = self.brand_term() {
            if !contains(&part.brand, &b) {
                return false;
            }
        }
        if let Some(c) = self.category_term() {
            if !contains(&part.category, &c) {
                return false;
            }
        }
        true
    }
}

/// Durable home of parts, keyed by part id.
#[async_trait]
pub trait PartStore: Send + Sync {
    /// Insert or update a part and replace its specs and images. Unset timestamps are
    /// stamped with the current time; an existing row keeps its first `created_at`.
    async fn upsert_part(&self, part: &Part) -> Result<()>;

    /// Fails with `NotFound` when no part has `id`.
    async fn get_part(&self, id: &str) -> Result<Part>;

    /// Most recently created first.
    async fn list_parts(&self, offset: usize, limit: usize) -> Result<Vec<Part>>;

    async fn search_parts(&self, query: &SearchQuery, offset: usize, limit: usize) -> Result<Vec<Part>>;
}
