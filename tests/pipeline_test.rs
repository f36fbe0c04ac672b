use anyhow::Result;
use chrono::Utc;
use parts_finder::apis::ExtractorRegistry;
use parts_finder::channel::{Channels, MemoryBroker, Producer, SqliteLog};
use parts_finder::config::StorageConfig;
use parts_finder::db::DatabaseManager;
use parts_finder::infra::StaticPages;
use parts_finder::pipeline::traversal::TraversalLimits;
use parts_finder::pipeline::{CommitPolicy, PollSettings, Runner, RunnerSettings, RunnerStats};
use parts_finder::storage::{PartStore, SqlPartStore};
use parts_finder::types::{part_identity, ScrapeRequest, ScrapeResult};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

const PRODUCT_URL: &str = "https://www.jensonusa.com/products/shimano-xt-m8100-rear-derailleur";

fn product_page() -> String {
    r#"<html><body>
    <ol class="breadcrumb"><li>Home</li><li>Components</li><li>Drivetrain</li><li>Rear Derailleurs</li></ol>
    <div class="product-details">
      <h1 class="product-details__name">Shimano XT M8100 Rear Derailleur</h1>
      <span class="product-details__price--sale">$89.99</span>
      <span class="product-details__price">$99.99</span>
      <span class="product-details__price--msrp">$109.99</span>
      <div class="product-details__stock">In Stock</div>
      <div class="product-details__description">12-speed Shadow RD+ derailleur.</div>
      <div class="product-details__image"><img src="//cdn.jensonusa.com/xt-1.jpg"><img src="//cdn.jensonusa.com/xt-2.jpg"></div>
      <table class="specifications__table">
        <tr><td>Speeds</td><td>12</td></tr>
        <tr><td>Cage Length</td><td>Long</td></tr>
      </table>
    </div></body></html>"#
        .to_string()
}

fn settings() -> RunnerSettings {
    RunnerSettings {
        requests_topic: "scrape_requests".into(),
        results_topic: "scrape_results".into(),
        group_prefix: "bike-parts-finder".into(),
        scrape_workers: 1,
        ingest_workers: 1,
        commit_policy: CommitPolicy::Always,
        poll: PollSettings {
            poll_timeout: Duration::from_millis(20),
            empty_poll_backoff: Duration::from_millis(10),
        },
    }
}

fn registry(pages: StaticPages) -> Arc<ExtractorRegistry> {
    Arc::new(ExtractorRegistry::with_defaults(Arc::new(pages), TraversalLimits::default()))
}

fn request(id: &str, url: &str) -> ScrapeRequest {
    ScrapeRequest {
        id: id.to_string(),
        url: url.to_string(),
        source: "JensonUSA".to_string(),
        submitted_at: Utc::now(),
    }
}

async fn submit(producer: &dyn Producer, request: &ScrapeRequest) -> Result<()> {
    producer
        .publish_keyed(&request.id, &serde_json::to_vec(request)?)
        .await?;
    Ok(())
}

/// Run until `done` holds or five seconds pass, then cancel and collect the stats.
async fn run_until<F, Fut>(runner: Runner, mut done: F) -> Result<RunnerStats>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let token = CancellationToken::new();
    let handle = tokio::spawn(runner.run(token.clone()));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done().await && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    token.cancel();
    Ok(handle.await??)
}

#[tokio::test]
async fn test_product_request_is_scraped_and_stored() -> Result<()> {
    let dir = tempdir()?;
    let db = DatabaseManager::open_file(dir.path().join("parts.db"), &StorageConfig::default()).await?;
    let store = Arc::new(SqlPartStore::new(&db).await?);

    let broker = MemoryBroker::new(2);
    submit(&broker.producer("scrape_requests"), &request("r1", PRODUCT_URL)).await?;

    let runner = Runner::new(Channels::Memory(broker.clone()), settings())
        .with_scraping(registry(StaticPages::new().with_page(PRODUCT_URL, product_page())))
        .with_ingestion(store.clone());

    let part_id = part_identity("JensonUSA", PRODUCT_URL);
    let stats = run_until(runner, || {
        let store = store.clone();
        let part_id = part_id.clone();
        async move { store.get_part(&part_id).await.is_ok() }
    })
    .await?;
    assert_eq!(stats.scrape.committed, 1);

    // the published result carries the request id and the full part
    let results = broker.records("scrape_results");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].key.as_deref(), Some("r1"));
    let result: ScrapeResult = results[0].decode()?;
    assert_eq!(result.request_id, "r1");
    assert!(result.error.is_none());
    assert_eq!(result.parts.len(), 1);
    assert_eq!(result.parts[0].specs.len(), 2);
    assert_eq!(result.parts[0].images.len(), 2);

    let part = store.get_part(&part_id).await?;
    assert_eq!(part.brand, "Shimano");
    assert_eq!(part.model, "XT M8100 Rear Derailleur");
    assert_eq!(part.category, "Components");
    assert_eq!(part.sub_category, "Rear Derailleurs");
    assert_eq!(part.price, 89.99);
    assert_eq!(part.msrp, Some(109.99));
    assert!((part.discount_pct.unwrap_or_default() - 18.18).abs() < 0.01);
    assert_eq!(part.currency.as_deref(), Some("USD"));
    assert!(part.in_stock);
    assert_eq!(part.images[0], "https://cdn.jensonusa.com/xt-1.jpg");
    assert_eq!(part.specs[1].name, "Cage Length");
    Ok(())
}

#[tokio::test]
async fn test_rescraping_the_same_url_updates_one_part() -> Result<()> {
    let dir = tempdir()?;
    let db = DatabaseManager::open_file(dir.path().join("parts.db"), &StorageConfig::default()).await?;
    let store = Arc::new(SqlPartStore::new(&db).await?);

    let broker = MemoryBroker::new(1);
    let requests = broker.producer("scrape_requests");
    submit(&requests, &request("r1", PRODUCT_URL)).await?;
    submit(&requests, &request("r2", PRODUCT_URL)).await?;

    let runner = Runner::new(Channels::Memory(broker.clone()), settings())
        .with_scraping(registry(StaticPages::new().with_page(PRODUCT_URL, product_page())))
        .with_ingestion(store.clone());

    let stats = run_until(runner, || {
        let broker = broker.clone();
        async move { broker.committed("bike-parts-finder-scrape_results", "scrape_results", 0) == Some(2) }
    })
    .await?;
    assert_eq!(stats.ingest.parts_persisted, 2);

    let parts = store.list_parts(0, 10).await?;
    assert_eq!(parts.len(), 1);
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM part_specs")
        .fetch_one(db.pool())
        .await?;
    assert_eq!(count, 2);
    Ok(())
}

#[tokio::test]
async fn test_unsupported_url_over_durable_log() -> Result<()> {
    let dir = tempdir()?;
    let channel_db = DatabaseManager::open_file(dir.path().join("channel.db"), &StorageConfig::default()).await?;
    let log = SqliteLog::open(&channel_db, 2).await?;
    let parts_db = DatabaseManager::open_file(dir.path().join("parts.db"), &StorageConfig::default()).await?;
    let store = Arc::new(SqlPartStore::new(&parts_db).await?);

    submit(&log.producer("scrape_requests"), &request("r9", "https://www.example.com/products/x")).await?;

    let runner = Runner::new(Channels::Sqlite(log.clone()), settings())
        .with_scraping(registry(StaticPages::new()))
        .with_ingestion(store.clone());

    let stats = run_until(runner, || {
        let log = log.clone();
        async move {
            let mut committed = 0;
            for partition in 0..2 {
                if let Ok(Some(_)) = log
                    .committed("bike-parts-finder-scrape_results", "scrape_results", partition)
                    .await
                {
                    committed += 1;
                }
            }
            committed > 0
        }
    })
    .await?;
    assert_eq!(stats.scrape.committed, 1);
    assert_eq!(stats.ingest.committed, 1);
    assert_eq!(stats.ingest.parts_persisted, 0);
    assert!(store.list_parts(0, 10).await?.is_empty());
    Ok(())
}
