use super::{PartStore, SearchQuery};
use crate::config::StorageConfig;
use crate::db::{decode_timestamp, encode_timestamp, DatabaseManager, PARTS_MIGRATION};
use crate::error::{Result, ScraperError};
use crate::types::{Part, Spec};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;
use tracing::{debug, instrument};

const PART_COLUMNS: &str = "id, brand, model, category, sub_category, price, msrp, discount, currency, \
     in_stock, rating, num_reviews, description, url, source, created_at, updated_at";

/// Unicode lower-cased copies of the searchable columns. SQLite `LIKE` only folds ASCII.
const SEARCH_COLUMNS: &str = "brand_lc, model_lc, category_lc, description_lc";

/// Part store backed by a pooled SQLite database.
#[derive(Clone)]
pub struct SqlPartStore {
    pool: SqlitePool,
}

impl SqlPartStore {
    /// Wrap an open database, creating the parts schema if missing.
    pub async fn new(db: &DatabaseManager) -> Result<Self> {
        db.run_migration("parts", PARTS_MIGRATION).await?;
        Ok(Self {
            pool: db.pool().clone(),
        })
    }

    pub async fn connect(url: &str, config: &StorageConfig) -> Result<Self> {
        let db = DatabaseManager::connect(url, config).await?;
        Self::new(&db).await
    }

    /// Load specs and images for already-fetched rows, keyed by parent id.
    async fn load_children(&self, parts: &mut [Part]) -> Result<()> {
        if parts.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = parts.iter().map(|p| p.id.clone()).collect();

        let mut specs_query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT part_id, name, value FROM part_specs WHERE part_id IN (");
        let mut separated = specs_query.separated(", ");
        for id in &ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(") ORDER BY part_id, position");
        let mut specs: HashMap<String, Vec<Spec>> = HashMap::new();
        for row in specs_query.build().fetch_all(&self.pool).await? {
            let part_id: String = row.try_get("part_id")?;
            specs
                .entry(part_id)
                .or_default()
                .push(Spec::new(row.try_get::<String, _>("name")?, row.try_get::<String, _>("value")?));
        }

        let mut images_query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT part_id, url FROM part_images WHERE part_id IN (");
        let mut separated = images_query.separated(", ");
        for id in &ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(") ORDER BY part_id, position");
        let mut images: HashMap<String, Vec<String>> = HashMap::new();
        for row in images_query.build().fetch_all(&self.pool).await? {
            let part_id: String = row.try_get("part_id")?;
            images.entry(part_id).or_default().push(row.try_get("url")?);
        }

        for part in parts.iter_mut() {
            part.specs = specs.remove(&part.id).unwrap_or_default();
            part.images = images.remove(&part.id).unwrap_or_default();
        }
        Ok(())
    }

    async fn fetch_page(&self, mut query: QueryBuilder<'_, Sqlite>, offset: usize, limit: usize) -> Result<Vec<Part>> {
        query
            .push(" ORDER BY created_at DESC, id LIMIT ")
            .push_bind(limit.min(i64::MAX as usize) as i64)
            .push(" OFFSET ")
            .push_bind(offset.min(i64::MAX as usize) as i64);

        let rows = query.build().fetch_all(&self.pool).await?;
        let mut parts = rows.iter().map(part_from_row).collect::<Result<Vec<_>>>()?;
        self.load_children(&mut parts).await?;
        Ok(parts)
    }
}

fn part_from_row(row: &SqliteRow) -> Result<Part> {
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let num_reviews: Option<i64> = row.try_get("num_reviews")?;
    Ok(Part {
        id: row.try_get("id")?,
        brand: row.try_get("brand")?,
        model: row.try_get("model")?,
        category: row.try_get("category")?,
        sub_category: row.try_get("sub_category")?,
        price: row.try_get("price")?,
        msrp: row.try_get("msrp")?,
        discount_pct: row.try_get("discount")?,
        currency: row.try_get("currency")?,
        in_stock: row.try_get("in_stock")?,
        rating: row.try_get("rating")?,
        num_reviews: num_reviews.and_then(|n| u32::try_from(n).ok()),
        description: row.try_get("description")?,
        url: row.try_get("url")?,
        source: row.try_get("source")?,
        specs: Vec::new(),
        images: Vec::new(),
        created_at: decode_timestamp(&created_at),
        updated_at: decode_timestamp(&updated_at),
    })
}

/// `%term%` with LIKE wildcards in the term escaped.
fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

#[async_trait]
impl PartStore for SqlPartStore {
    #[instrument(skip(self, part), fields(part_id = %part.id))]
    async fn upsert_part(&self, part: &Part) -> Result<()> {
        let now = Utc::now();
        let created_at = encode_timestamp(&part.created_at.unwrap_or(now));
        let updated_at = encode_timestamp(&part.updated_at.unwrap_or(now));

        // Row and both child collections change together or not at all.
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO parts ({PART_COLUMNS}, {SEARCH_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                brand = excluded.brand,
                model = excluded.model,
                category = excluded.category,
                sub_category = excluded.sub_category,
                price = excluded.price,
                msrp = excluded.msrp,
                discount = excluded.discount,
                currency = excluded.currency,
                in_stock = excluded.in_stock,
                rating = excluded.rating,
                num_reviews = excluded.num_reviews,
                description = excluded.description,
                url = excluded.url,
                source = excluded.source,
                updated_at = excluded.updated_at,
                brand_lc = excluded.brand_lc,
                model_lc = excluded.model_lc,
                category_lc = excluded.category_lc,
                description_lc = excluded.description_lc"
        ))
        .bind(&part.id)
        .bind(&part.brand)
        .bind(&part.model)
        .bind(&part.category)
        .bind(&part.sub_category)
        .bind(part.price)
        .bind(part.msrp)
        .bind(part.discount_pct)
        .bind(&part.currency)
        .bind(part.in_stock)
        .bind(part.rating)
        .bind(part.num_reviews.map(i64::from))
        .bind(&part.description)
        .bind(&part.url)
        .bind(&part.source)
        .bind(&created_at)
        .bind(&updated_at)
        .bind(part.brand.to_lowercase())
        .bind(part.model.to_lowercase())
        .bind(part.category.to_lowercase())
        .bind(part.description.to_lowercase())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM part_specs WHERE part_id = ?")
            .bind(&part.id)
            .execute(&mut *tx)
            .await?;
        for (position, spec) in part.specs.iter().enumerate() {
            sqlx::query("INSERT INTO part_specs (part_id, position, name, value) VALUES (?, ?, ?, ?)")
                .bind(&part.id)
                .bind(position as i64)
                .bind(&spec.name)
                .bind(&spec.value)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM part_images WHERE part_id = ?")
            .bind(&part.id)
            .execute(&mut *tx)
            .await?;
        for (position, image) in part.images.iter().enumerate() {
            sqlx::query("INSERT INTO part_images (part_id, position, url) VALUES (?, ?, ?)")
                .bind(&part.id)
                .bind(position as i64)
                .bind(image)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(
            "Upserted part with {} specs and {} images",
            part.specs.len(),
            part.images.len()
        );
        Ok(())
    }

    async fn get_part(&self, id: &str) -> Result<Part> {
        let row = sqlx::query(&format!("SELECT {PART_COLUMNS} FROM parts WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ScraperError::NotFound {
                entity: "part",
                id: id.to_string(),
            })?;
        let mut parts = vec![part_from_row(&row)?];
        self.load_children(&mut parts).await?;
        Ok(parts.remove(0))
    }

    async fn list_parts(&self, offset: usize, limit: usize) -> Result<Vec<Part>> {
        let query = QueryBuilder::new(format!("SELECT {PART_COLUMNS} FROM parts"));
        self.fetch_page(query, offset, limit).await
    }

    async fn search_parts(&self, search: &SearchQuery, offset: usize, limit: usize) -> Result<Vec<Part>> {
        let mut query = QueryBuilder::new(format!("SELECT {PART_COLUMNS} FROM parts WHERE 1 = 1"));
        if let Some(term) = search.query_term() {
            let pattern = like_pattern(&term);
            query
                .push(" AND (brand_lc LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR model_lc LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR description_lc LIKE ")
                .push_bind(pattern)
                .push(" ESCAPE '\\')");
        }
        if let Some(brand) = search.brand_term() {
            query
                .push(" AND brand_lc LIKE ")
                .push_bind(like_pattern(&brand))
                .push(" ESCAPE '\\'");
        }
        if let Some(category) = search.category_term() {
            query
                .push(" AND category_lc LIKE ")
                .push_bind(like_pattern(&category))
                .push(" ESCAPE '\\'");
        }
        self.fetch_page(query, offset, limit).await
    }
}
