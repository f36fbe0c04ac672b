use anyhow::Context;
use clap::{Parser, Subcommand};
use parts_finder::apis::ExtractorRegistry;
use parts_finder::channel::Channels;
use parts_finder::config::{ChannelBackend, Config};
use parts_finder::infra::{HttpFetcher, RateLimiter};
use parts_finder::observability::{init_logging, install_exporter};
use parts_finder::pipeline::{Runner, RunnerSettings};
use parts_finder::storage::{CachedPartReader, InMemoryCache, PartStore, SearchQuery, SqlPartStore};
use parts_finder::types::ScrapeRequest;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "parts_finder")]
#[command(about = "Bicycle parts catalog scraper: extract, queue, ingest, search")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume scrape requests and publish scrape results
    ScrapeWorker {
        /// Overrides worker.scrape_workers
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Consume scrape results and upsert their parts
    IngestWorker {
        /// Overrides worker.ingest_workers
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Run scrape and ingest workers in one process
    Run,
    /// Publish a scrape request for a URL
    Submit {
        url: String,
        #[arg(long, default_value = "")]
        source: String,
    },
    /// Scrape a URL directly and print the parts as JSON
    Extract { url: String },
    /// Print one stored part
    Get { id: String },
    /// Search stored parts
    Search {
        #[arg(long)]
        query: Option<String>,
        #[arg(long)]
        brand: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn build_registry(config: &Config) -> anyhow::Result<Arc<ExtractorRegistry>> {
    let limiter = RateLimiter::new(config.scraper.fetch_limits());
    let fetcher = HttpFetcher::new(&config.scraper.user_agent, config.scraper.timeout(), limiter)
        .context("Failed to build HTTP client")?;
    Ok(Arc::new(ExtractorRegistry::with_defaults(
        Arc::new(fetcher),
        config.scraper.traversal_limits(),
    )))
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<SqlPartStore>> {
    let store = SqlPartStore::connect(&config.storage.database_url, &config.storage)
        .await
        .with_context(|| format!("Failed to open parts database {}", config.storage.database_url))?;
    Ok(Arc::new(store))
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested, finishing in-flight messages");
                token.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });
}

async fn run_workers(config: &Config, scrape: bool, ingest: bool) -> anyhow::Result<()> {
    let channels = Channels::from_config(config)
        .await
        .context("Failed to attach to the queue channel")?;

    let mut settings = RunnerSettings::from(config);
    if !scrape {
        settings.scrape_workers = 0;
    }
    if !ingest {
        settings.ingest_workers = 0;
    }

    let mut runner = Runner::new(channels, settings);
    if scrape {
        runner = runner.with_scraping(build_registry(config)?);
    }
    if ingest {
        runner = runner.with_ingestion(open_store(config).await?);
    }

    let token = CancellationToken::new();
    cancel_on_ctrl_c(token.clone());
    let stats = runner.run(token).await?;

    println!("\nScrape workers:");
    println!("   Messages: {}", stats.scrape.messages);
    println!("   Published: {}", stats.scrape.published);
    println!("   Committed: {}", stats.scrape.committed);
    println!("Ingest workers:");
    println!("   Messages: {}", stats.ingest.messages);
    println!("   Parts persisted: {}", stats.ingest.parts_persisted);
    println!("   Parts failed: {}", stats.ingest.parts_failed);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config))?;
    let _log_guard = init_logging(&config.logging);

    if let Some(addr) = &config.metrics.addr {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("Invalid metrics address {}", addr))?;
        install_exporter(addr);
    }

    match cli.command {
        Commands::ScrapeWorker { workers } => {
            if let Some(n) = workers {
                config.worker.scrape_workers = n;
            }
            run_workers(&config, true, false).await?;
        }
        Commands::IngestWorker { workers } => {
            if let Some(n) = workers {
                config.worker.ingest_workers = n;
            }
            run_workers(&config, false, true).await?;
        }
        Commands::Run => {
            run_workers(&config, true, true).await?;
        }
        Commands::Submit { url, source } => {
            if config.channel.backend == ChannelBackend::Memory {
                warn!("The memory channel does not outlive this process; the request will not be consumed");
            }
            let channels = Channels::from_config(&config).await?;
            let producer = channels.producer(&config.channel.requests_topic)?;
            let request = ScrapeRequest::new(url, source);
            producer
                .publish_keyed(&request.id, &serde_json::to_vec(&request)?)
                .await
                .context("Failed to publish scrape request")?;
            info!("Submitted scrape request {} for {}", request.id, request.url);
            println!("{}", request.id);
        }
        Commands::Extract { url } => {
            let registry = build_registry(&config)?;
            let extractor = registry.find(&url).with_context(|| {
                format!("No extractor handles {} (supported: {})", url, registry.sources().join(", "))
            })?;
            let parts = extractor.scrape(&url).await?;
            info!("Extracted {} parts from {}", parts.len(), url);
            println!("{}", serde_json::to_string_pretty(&parts)?);
        }
        Commands::Get { id } => {
            let store: Arc<dyn PartStore> = open_store(&config).await?;
            let reader = CachedPartReader::new(store, Arc::new(InMemoryCache::new()));
            let part = reader.get_part(&id).await?;
            println!("{}", serde_json::to_string_pretty(&part)?);
        }
        Commands::Search {
            query,
            brand,
            category,
            offset,
            limit,
        } => {
            let store = open_store(&config).await?;
            let search = SearchQuery {
                query,
                brand,
                category,
            };
            let parts = if search == SearchQuery::default() {
                store.list_parts(offset, limit).await?
            } else {
                store.search_parts(&search, offset, limit).await?
            };
            println!("{}", serde_json::to_string_pretty(&parts)?);
        }
    }

    Ok(())
}
