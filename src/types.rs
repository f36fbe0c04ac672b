use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// A single specification fact about a part, e.g. `Speeds: 12`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spec {
    pub name: String,
    pub value: String,
}

impl Spec {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Normalized product record extracted from a retail site.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Part {
    pub id: String,
    pub brand: String,
    pub model: String,
    pub category: String,
    pub sub_category: String,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msrp: Option<f64>,
    #[serde(
        rename = "discount",
        alias = "discount_pct",
        skip_serializing_if = "Option::is_none"
    )]
    pub discount_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default = "default_in_stock")]
    pub in_stock: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_reviews: Option<u32>,
    pub description: String,
    pub url: String,
    pub source: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub specs: Vec<Spec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_in_stock() -> bool {
    true
}

impl Part {
    /// Empty part for `url`, with its identity already derived from source + URL.
    pub fn new(source: &str, url: &str) -> Self {
        Self {
            id: part_identity(source, url),
            url: url.to_string(),
            source: source.to_string(),
            in_stock: true,
            ..Default::default()
        }
    }

    /// Apply parsed prices. A missing price leaves `price = 0` and no currency;
    /// a non-positive MSRP counts as missing and the discount is derived only from a positive one.
    pub fn apply_pricing(&mut self, price: Option<f64>, msrp: Option<f64>, currency: &str) {
        if let Some(p) = price {
            self.price = p;
            self.currency = Some(currency.to_string());
        }
        self.msrp = msrp.filter(|m| *m > 0.0);
        self.discount_pct = self.msrp.and_then(|m| discount_pct(self.price, m));
    }

    /// Fill unset timestamps with `now`.
    pub fn stamp(&mut self, now: DateTime<Utc>) {
        self.created_at.get_or_insert(now);
        self.updated_at.get_or_insert(now);
    }
}

/// `(msrp - price) / msrp * 100`, only defined for a positive MSRP.
pub fn discount_pct(price: f64, msrp: f64) -> Option<f64> {
    if msrp > 0.0 {
        Some((msrp - price) / msrp * 100.0)
    } else {
        None
    }
}

/// Tri-state stock availability derived from free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    InStock,
    OutOfStock,
    Unknown,
}

impl StockStatus {
    pub fn from_text(text: &str) -> Self {
        let lowered = text.trim().to_lowercase();
        if lowered.is_empty() {
            StockStatus::Unknown
        } else if lowered.contains("out of stock") {
            StockStatus::OutOfStock
        } else {
            StockStatus::InStock
        }
    }

    /// Unknown counts as available; only an explicit "out of stock" marks a part unavailable.
    pub fn is_available(self) -> bool {
        self != StockStatus::OutOfStock
    }
}

static PRICE_NOISE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^0-9.\-]").expect("price pattern is valid"));

/// Parse a displayed price such as `"$1,299.99"` or `"Sale: $89.99"`.
pub fn parse_price(text: &str) -> Option<f64> {
    let cleaned = PRICE_NOISE.replace_all(text, "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|p| p.is_finite())
}

/// Brands whose names contain a space; everything else splits on the first token.
const MULTI_WORD_BRANDS: &[&str] = &[
    "Race Face",
    "Chris King",
    "Wolf Tooth",
    "Industry Nine",
    "Fox Racing Shox",
    "Fox Racing",
    "Pro Gold",
    "White Industries",
    "Box Components",
    "Paul Components",
    "Hope Technology",
    "E Thirteen",
];

/// Split a product name into `(brand, model)`.
pub fn split_brand_model(name: &str) -> (String, String) {
    let collapsed = name.split_whitespace().collect::<Vec<_>>().join(" ");
    let lowered = collapsed.to_lowercase();

    for brand in MULTI_WORD_BRANDS {
        let prefix = brand.to_lowercase();
        if lowered == prefix {
            return (collapsed, String::new());
        }
        if lowered.starts_with(&prefix) && lowered[prefix.len()..].starts_with(' ') {
            if let (Some(brand), Some(model)) =
                (collapsed.get(..prefix.len()), collapsed.get(prefix.len()..))
            {
                return (brand.to_string(), model.trim().to_string());
            }
        }
    }

    match collapsed.split_once(' ') {
        Some((brand, model)) => (brand.to_string(), model.to_string()),
        None => (collapsed, String::new()),
    }
}

/// Canonical form of a product URL: no query, no fragment, no trailing slash.
pub fn canonical_url(raw: &str) -> String {
    match Url::parse(raw.trim()) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            let path = url.path().trim_end_matches('/').to_string();
            url.set_path(&path);
            url.to_string().trim_end_matches('/').to_string()
        }
        Err(_) => raw.trim().trim_end_matches('/').to_string(),
    }
}

/// Stable identity of a part: the same source and product URL always map to the same id.
pub fn part_identity(source: &str, url: &str) -> String {
    let name = format!("{}|{}", source.to_lowercase(), canonical_url(url));
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

/// Request to scrape one URL, published by an operator or the read API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeRequest {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub source: String,
    #[serde(alias = "timestamp", default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,
}

impl ScrapeRequest {
    pub fn new(url: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url: url.into(),
            source: source.into(),
            submitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No extractor accepts the URL.
    UnsupportedSource,
    /// The site was unreachable or the traversal could not start.
    Extraction,
}

/// Structured failure carried inside a `ScrapeResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeFailure {
    pub kind: FailureKind,
    pub message: String,
    pub retryable: bool,
}

impl ScrapeFailure {
    pub fn unsupported(url: &str) -> Self {
        Self {
            kind: FailureKind::UnsupportedSource,
            message: format!("unsupported source: no extractor handles {url}"),
            retryable: false,
        }
    }

    pub fn extraction(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Extraction,
            message: message.into(),
            retryable: true,
        }
    }
}

/// Outcome of one scrape request. Always published, even when extraction failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub request_id: String,
    pub url: String,
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ScrapeFailure>,
}

impl ScrapeResult {
    pub fn success(request: &ScrapeRequest, parts: Vec<Part>) -> Self {
        Self {
            request_id: request.id.clone(),
            url: request.url.clone(),
            parts,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn failure(request: &ScrapeRequest, failure: ScrapeFailure) -> Self {
        Self {
            request_id: request.id.clone(),
            url: request.url.clone(),
            parts: Vec::new(),
            timestamp: Utc::now(),
            error: Some(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
