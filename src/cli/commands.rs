use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::cli::config::EnricherConfig;
use crate::crawler::controller::{CrawlRequest, CrawlService, FetchStack};
use crate::crawler::task::Priority;
use crate::crawler::worker::build_client;
use crate::politeness::RobotsPolicyCache;
use crate::storage::{JsonFileSink, JsonFileSource, MemorySink, ResultSink};

/// Options of the `crawl` command
#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub input: PathBuf,
    pub ids: Option<Vec<String>>,
    pub priority: Priority,
    pub respect_robots: bool,
    pub concurrency: Option<usize>,
    pub output: Option<PathBuf>,
}

/// Enrich every bookmark in the input file and wait for the queue to drain
pub async fn crawl(config_path: Option<PathBuf>, options: CrawlOptions) -> Result<()> {
    let mut config = EnricherConfig::load(config_path.as_deref())?;

    // Override configuration with command line parameters if provided
    if let Some(concurrency) = options.concurrency {
        config.queue.concurrency = concurrency;
    }
    if let Some(output) = options.output {
        config.storage.results_path = Some(output);
    }

    let sink: Arc<dyn ResultSink> = match &config.storage.results_path {
        Some(path) => Arc::new(JsonFileSink::open(path).await?),
        None => {
            warn!("No output path configured, results are kept in memory only");
            Arc::new(MemorySink::new())
        }
    };
    let source = Arc::new(JsonFileSource::new(options.input));

    let service = CrawlService::new(&config, source, sink)?;

    let progress = service.on_progress(|stats| {
        info!(
            "Progress {}%: {} running, {} pending, {} completed, {} failed",
            stats.progress, stats.running, stats.pending, stats.completed, stats.failed
        );
    });
    let errors = service.on_error(|failure| {
        warn!(
            "Giving up on {} after {} attempts: {}",
            failure.url, failure.attempts, failure.error
        );
    });

    let response = service
        .start_crawl(CrawlRequest {
            bookmark_ids: options.ids,
            priority: Some(options.priority),
            respect_robots: Some(options.respect_robots),
        })
        .await;

    if !response.success {
        bail!(response.error.unwrap_or_else(|| "crawl failed to start".to_string()));
    }

    service.wait_idle().await;
    progress.unsubscribe();
    errors.unsubscribe();

    let stats = service.statistics();
    let metrics = service.metrics().await;
    service.shutdown().await;

    println!("Enqueued: {}", response.enqueued);
    println!("Skipped (invalid URL): {}", response.skipped);
    println!("Completed: {}", stats.completed);
    println!("Failed: {}", stats.failed);
    println!("Requests: {}", metrics.total_requests);
    println!("Average duration: {}ms", metrics.average_duration_ms());
    println!("Fallback extractions: {}", metrics.fallback_extractions);
    if let Some(path) = &config.storage.results_path {
        println!("Results: {}", path.display());
    }

    Ok(())
}

/// Fetch one URL and print the result as JSON
pub async fn check(config_path: Option<PathBuf>, url: String, respect_robots: bool) -> Result<()> {
    let config = EnricherConfig::load(config_path.as_deref())?;
    let stack = FetchStack::build(&config)?;

    let result = stack.worker.fetch_url(&url, respect_robots).await;
    stack.contexts.dispose().await;

    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to serialize result")?
    );
    Ok(())
}

/// Print the robots verdict for a host
pub async fn robots(config_path: Option<PathBuf>, domain: String) -> Result<()> {
    let config = EnricherConfig::load(config_path.as_deref())?;
    let client = build_client(&config.fetch)?;
    let cache = RobotsPolicyCache::new(client, config.robots.clone());

    let domain = domain.trim().to_ascii_lowercase();
    let policy = cache.get_policy(&domain).await;

    println!("Domain: {}", domain);
    println!("Allowed: {}", policy.allowed_all);
    Ok(())
}

/// Write a default configuration file unless one already exists
pub fn init_config(config_path: Option<PathBuf>) -> Result<()> {
    let path = config_path.unwrap_or_else(EnricherConfig::default_path);

    if path.exists() {
        warn!("Configuration already exists at {}", path.display());
        println!("Configuration already exists: {}", path.display());
        return Ok(());
    }

    EnricherConfig::default().save_to_file(&path)?;
    println!("Created default configuration: {}", path.display());
    Ok(())
}

/// Show the current configuration
pub fn show_config(config_path: Option<PathBuf>) -> Result<()> {
    let config = EnricherConfig::load(config_path.as_deref())?;
    println!("{}", config.to_yaml()?);
    Ok(())
}
