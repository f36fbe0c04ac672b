use crate::apis::Extractor;
use crate::constants::JENSON_USA_SOURCE;
use crate::error::{Result, ScraperError};
use crate::infra::PageFetcher;
use crate::observability::metrics;
use crate::pipeline::traversal::{traverse, PageHandler, PageVisit, TraversalLimits};
use crate::types::{parse_price, split_brand_model, Part, Spec, StockStatus};
use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};
use url::Url;

const ALLOWED_HOSTS: &[&str] = &["www.jensonusa.com", "jensonusa.com"];
const CURRENCY: &str = "USD";

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector is valid")
}

static TILE_LINKS: Lazy<Selector> =
    Lazy::new(|| selector("div.product-tile a.product-tile__image-link[href]"));
static PAGINATION_LINKS: Lazy<Selector> = Lazy::new(|| selector("a.pagination__link[href]"));
static PRODUCT_ROOT: Lazy<Selector> = Lazy::new(|| selector("div.product-details"));
static NAME: Lazy<Selector> = Lazy::new(|| selector("h1.product-details__name"));
static SALE_PRICE: Lazy<Selector> = Lazy::new(|| selector("span.product-details__price--sale"));
static PRICE: Lazy<Selector> = Lazy::new(|| selector("span.product-details__price"));
static MSRP: Lazy<Selector> = Lazy::new(|| selector("span.product-details__price--msrp"));
static STOCK: Lazy<Selector> = Lazy::new(|| selector("div.product-details__stock"));
static DESCRIPTION: Lazy<Selector> = Lazy::new(|| selector("div.product-details__description"));
static IMAGES: Lazy<Selector> = Lazy::new(|| selector("div.product-details__image img[src]"));
static SPEC_ROWS: Lazy<Selector> = Lazy::new(|| selector("table.specifications__table tr"));
static SPEC_NAME: Lazy<Selector> = Lazy::new(|| selector("td:first-child"));
static SPEC_VALUE: Lazy<Selector> = Lazy::new(|| selector("td:last-child"));
static BREADCRUMBS: Lazy<Selector> = Lazy::new(|| selector("ol.breadcrumb li"));

pub struct JensonUsaExtractor {
    fetcher: Arc<dyn PageFetcher>,
    limits: TraversalLimits,
}

impl JensonUsaExtractor {
    pub fn new(fetcher: Arc<dyn PageFetcher>, limits: TraversalLimits) -> Self {
        Self { fetcher, limits }
    }
}

fn is_allowed_host(url: &Url) -> bool {
    url.host_str()
        .map(|h| ALLOWED_HOSTS.contains(&h.to_lowercase().as_str()))
        .unwrap_or(false)
}

#[async_trait]
impl Extractor for JensonUsaExtractor {
    fn source(&self) -> &'static str {
        JENSON_USA_SOURCE
    }

    fn can_handle(&self, url: &str) -> bool {
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase))
            .map(|host| host == "jensonusa.com" || host.ends_with(".jensonusa.com"))
            .unwrap_or(false)
    }

    #[instrument(skip(self), fields(source = JENSON_USA_SOURCE))]
    async fn scrape(&self, url: &str) -> Result<Vec<Part>> {
        let start = Url::parse(url)?;
        if !is_allowed_host(&start) {
            return Err(ScraperError::extraction(
                url,
                format!("host {} is not allowed", start.host_str().unwrap_or("")),
            ));
        }

        let handler = Arc::new(JensonUsaPage {
            discover: url.contains("/categories/") || url.contains("/products/"),
        });
        let started = Instant::now();
        let acc = traverse(Arc::clone(&self.fetcher), handler, start, self.limits).await?;

        metrics::scrape::extraction_duration(JENSON_USA_SOURCE, started.elapsed().as_secs_f64());
        metrics::scrape::pages_visited(acc.pages_visited as u64);
        metrics::scrape::page_errors(acc.page_errors as u64);
        info!(
            "Extracted {} parts from {} pages ({} page errors)",
            acc.parts.len(),
            acc.pages_visited,
            acc.page_errors
        );
        Ok(acc.parts)
    }
}

/// Page rules for jensonusa.com.
struct JensonUsaPage {
    /// Follow product tiles and pagination; set from the start URL.
    discover: bool,
}

impl PageHandler for JensonUsaPage {
    fn handle(&self, page_url: &Url, html: &str) -> PageVisit {
        let document = Html::parse_document(html);
        let mut visit = PageVisit::default();

        if self.discover {
            for link in document
                .select(&TILE_LINKS)
                .chain(document.select(&PAGINATION_LINKS))
            {
                if let Some(href) = link.value().attr("href").map(str::trim) {
                    if href.is_empty() {
                        continue;
                    }
                    if let Ok(resolved) = page_url.join(href) {
                        visit.links.push(resolved);
                    }
                }
            }
        }

        if let Some(root) = document.select(&PRODUCT_ROOT).next() {
            visit.parts.push(extract_part(&document, root, page_url));
        }
        visit
    }

    fn follows(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https") && is_allowed_host(url)
    }
}

fn clean_text(element: ElementRef) -> String {
    element.text().collect::<Vec<_>>().join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_text(root: ElementRef, sel: &Selector) -> String {
    root.select(sel).next().map(clean_text).unwrap_or_default()
}

fn extract_part(document: &Html, root: ElementRef, page_url: &Url) -> Part {
    let mut part = Part::new(JENSON_USA_SOURCE, page_url.as_str());

    let (brand, model) = split_brand_model(&first_text(root, &NAME));
    part.brand = brand;
    part.model = model;

    // Crumbs under the product root win; the page-level trail is only a fallback.
    let mut crumbs: Vec<String> = root.select(&BREADCRUMBS).map(clean_text).collect();
    if crumbs.is_empty() {
        crumbs = document.select(&BREADCRUMBS).map(clean_text).collect();
    }
    for crumb in crumbs {
        if crumb.is_empty() || crumb == "Home" {
            continue;
        }
        if part.category.is_empty() {
            part.category = crumb;
        } else {
            part.sub_category = crumb;
        }
    }

    let mut price_text = first_text(root, &SALE_PRICE);
    if price_text.is_empty() {
        price_text = first_text(root, &PRICE);
    }
    part.apply_pricing(
        parse_price(&price_text),
        parse_price(&first_text(root, &MSRP)),
        CURRENCY,
    );

    part.in_stock = StockStatus::from_text(&first_text(root, &STOCK)).is_available();
    part.description = first_text(root, &DESCRIPTION);

    for img in root.select(&IMAGES) {
        let Some(src) = img.value().attr("src").map(str::trim) else {
            continue;
        };
        if src.is_empty() {
            continue;
        }
        let resolved = if src.starts_with("//") {
            format!("https:{}", src)
        } else if src.starts_with("http://") || src.starts_with("https://") {
            src.to_string()
        } else {
            match page_url.join(src) {
                Ok(u) => u.to_string(),
                Err(_) => continue,
            }
        };
        part.images.push(resolved);
    }

    for row in root.select(&SPEC_ROWS) {
        let name = first_text(row, &SPEC_NAME);
        let value = first_text(row, &SPEC_VALUE);
        if !name.is_empty() && !value.is_empty() {
            part.specs.push(Spec::new(name, value));
        }
    }

    part.stamp(Utc::now());
    part
}
