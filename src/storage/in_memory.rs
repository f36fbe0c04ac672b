use super::{PartStore, SearchQuery};
use crate::error::{Result, ScraperError};
use crate::types::Part;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// In-memory part store for development and tests
#[derive(Default)]
pub struct InMemoryPartStore {
    parts: RwLock<HashMap<String, Part>>,
}

impl InMemoryPartStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.parts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.parts.read().await.is_empty()
    }

    async fn sorted(&self, query: Option<&SearchQuery>, offset: usize, limit: usize) -> Vec<Part> {
        let parts = self.parts.read().await;
        let mut matched: Vec<Part> = parts
            .values()
            .filter(|p| query.map(|q| q.matches(p)).unwrap_or(true))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        matched.into_iter().skip(offset).take(limit).collect()
    }
}

#[async_trait]
impl PartStore for InMemoryPartStore {
    async fn upsert_part(&self, part: &Part) -> Result<()> {
        let mut stored = part.clone();
        stored.stamp(Utc::now());

        let mut parts = self.parts.write().await;
        if let Some(existing) = parts.get(&stored.id) {
            stored.created_at = existing.created_at;
        }
        debug!("Upserted part {} ({} {})", stored.id, stored.brand, stored.model);
        parts.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn get_part(&self, id: &str) -> Result<Part> {
        self.parts
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ScraperError::NotFound {
                entity: "part",
                id: id.to_string(),
            })
    }

    async fn list_parts(&self, offset: usize, limit: usize) -> Result<Vec<Part>> {
        Ok(self.sorted(None, offset, limit).await)
    }

    async fn search_parts(&self, query: &SearchQuery, offset: usize, limit: usize) -> Result<Vec<Part>> {
        Ok(self.sorted(Some(query), offset, limit).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn part(url: &str, brand: &str, created_hour: u32) -> Part {
        let mut p = Part::new("JensonUSA", url);
        p.brand = brand.to_string();
        p.created_at = Some(Utc.with_ymd_and_hms(2024, 5, 1, created_hour, 0, 0).unwrap());
        p
    }

    #[tokio::test]
    async fn test_upsert_keeps_created_at_and_replaces_children() {
        let store = InMemoryPartStore::new();
        let mut first = part("https://www.jensonusa.com/products/a", "Shimano", 9);
        first.images = vec!["1".into(), "2".into(), "3".into()];
        store.upsert_part(&first).await.unwrap();

        let mut second = first.clone();
        second.created_at = Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        second.images = vec!["3".into()];
        store.upsert_part(&second).await.unwrap();

        let stored = store.get_part(&first.id).await.unwrap();
        assert_eq!(stored.created_at, first.created_at);
        assert_eq!(stored.images, vec!["3".to_string()]);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_missing_part_is_not_found() {
        let store = InMemoryPartStore::new();
        assert!(store.get_part("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_newest_first_with_paging() {
        let store = InMemoryPartStore::new();
        store.upsert_part(&part("https://www.jensonusa.com/products/a", "A", 1)).await.unwrap();
        store.upsert_part(&part("https://www.jensonusa.com/products/b", "B", 3)).await.unwrap();
        store.upsert_part(&part("https://www.jensonusa.com/products/c", "C", 2)).await.unwrap();

        let brands: Vec<String> = store
            .list_parts(0, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.brand)
            .collect();
        assert_eq!(brands, vec!["B", "C", "A"]);

        let page = store.list_parts(1, 1).await.unwrap();
        assert_eq!(page[0].brand, "C");

        let found = store
            .search_parts(&SearchQuery::default().with_brand("b"), 0, 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }
}
