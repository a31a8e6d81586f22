use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, redirect, Client, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::cli::config::FetchSettings;
use crate::crawler::task::{CrawlResult, CrawlTask, ErrorClass, MetaSource, PageMeta, StatusGroup};
use crate::parse::dispatcher::{DispatchError, Dispatcher};
use crate::parse::fallback;
use crate::politeness::{domain_of, DomainThrottle, RobotsPolicyCache};
use crate::utils::metrics::MetricsCollector;

/// Executes one attempt of a task. Implementations never fail: every outcome,
/// including errors, is described by the returned result.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &CrawlTask, cancel: CancellationToken) -> CrawlResult;
}

/// Content types whose markup is worth reading
const HTML_FAMILY: &[&str] = &["text/html", "application/xhtml+xml"];

/// Build the HTTP client used for page fetches and robots lookups
pub fn build_client(settings: &FetchSettings) -> Result<Client> {
    Client::builder()
        .user_agent(settings.user_agent.clone())
        .timeout(settings.timeout())
        .redirect(redirect::Policy::limited(settings.max_redirects))
        .build()
        .context("Failed to build HTTP client")
}

/// Fetches a page politely and extracts its metadata
pub struct FetchWorker {
    client: Client,
    settings: FetchSettings,
    throttle: Arc<DomainThrottle>,
    robots: Arc<RobotsPolicyCache>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<MetricsCollector>,
}

impl FetchWorker {
    pub fn new(
        client: Client,
        settings: FetchSettings,
        throttle: Arc<DomainThrottle>,
        robots: Arc<RobotsPolicyCache>,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            client,
            settings,
            throttle,
            robots,
            dispatcher,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Fetch a single URL outside of any queue
    pub async fn fetch_url(&self, url: &str, respect_robots: bool) -> CrawlResult {
        let task = CrawlTask::new("adhoc", url).with_respect_robots(respect_robots);
        self.run(&task, CancellationToken::new()).await
    }

    /// Run the whole sequence, returning the result and the number of body bytes read
    async fn attempt(&self, task: &CrawlTask, cancel: &CancellationToken) -> (CrawlResult, usize) {
        let url = match Url::parse(&task.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            Ok(url) => {
                let detail = format!("unsupported scheme '{}'", url.scheme());
                return (CrawlResult::failed(&task.url, ErrorClass::InvalidUrl, detail), 0);
            }
            Err(e) => {
                let result = CrawlResult::failed(&task.url, ErrorClass::InvalidUrl, e.to_string());
                return (result, 0);
            }
        };

        let Some(domain) = domain_of(&url) else {
            return (CrawlResult::failed(&task.url, ErrorClass::InvalidUrl, "URL has no host"), 0);
        };

        // Robots
        let policy = tokio::select! {
            biased;
            _ = cancel.cancelled() => return (aborted(&task.url), 0),
            policy = self.robots.get_policy(&domain) => policy,
        };

        if !policy.allowed_all && task.respect_robots {
            info!("Skipping {}: {} disallows crawling", task.url, domain);
            let mut result = CrawlResult::failed(
                &task.url,
                ErrorClass::RobotsDisallowed,
                format!("{} disallows all crawling", domain),
            );
            result.robots_allowed = false;
            return (result, 0);
        }

        // Politeness
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return (aborted(&task.url), 0),
            waited = self.throttle.await_slot(&domain) => {
                if !waited.is_zero() {
                    debug!("Waited {}ms for a slot on {}", waited.as_millis(), domain);
                }
            }
        }

        // Fetch
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return (aborted(&task.url), 0),
            response = self.client.get(url).send() => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => return (classify_error(&task.url, &e), 0),
        };

        let final_url = response.url().to_string();
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let mut result = CrawlResult {
            final_url: final_url.clone(),
            http_status: Some(status),
            status_group: StatusGroup::from_status(status),
            robots_allowed: policy.allowed_all,
            meta: PageMeta::default(),
            meta_source: MetaSource::None,
            content_type: content_type.clone(),
            error_class: None,
            error_detail: None,
            crawl_duration_ms: 0,
            crawled_at: Utc::now(),
        };

        if !is_html_family(content_type.as_deref()) {
            debug!("Not reading {}: content type {:?}", final_url, content_type);
            result.error_class = Some(ErrorClass::UnsupportedMedia);
            result.error_detail = content_type;
            return (result, 0);
        }

        if result.status_group != StatusGroup::Success {
            debug!("{} answered {}", final_url, status);
            return (result, 0);
        }

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return (aborted(&task.url), 0),
            body = read_capped(response, self.settings.max_body_bytes) => body,
        };

        let (body, truncated) = match body {
            Ok(body) => body,
            Err(e) => return (classify_error(&final_url, &e), 0),
        };

        if truncated {
            debug!("Truncated {} at {} bytes", final_url, body.len());
        }

        let html = String::from_utf8_lossy(&body);

        // Metadata
        match self.dispatcher.extract_metadata(&html, &final_url, Some(cancel)).await {
            Ok(meta) => {
                result.meta = meta;
                result.meta_source = MetaSource::Context;
            }
            Err(DispatchError::Cancelled) => return (aborted(&task.url), body.len()),
            Err(e) => {
                debug!("Falling back to local extraction for {}: {}", final_url, e);
                result.meta = fallback::extract_metadata(&html, &final_url);
                result.meta_source = MetaSource::Fallback;
            }
        }

        (result, body.len())
    }
}

#[async_trait]
impl TaskRunner for FetchWorker {
    async fn run(&self, task: &CrawlTask, cancel: CancellationToken) -> CrawlResult {
        let timer = self.metrics.start_timer();

        let (mut result, bytes) = self.attempt(task, &cancel).await;
        result.crawl_duration_ms = timer.end();
        result.crawled_at = Utc::now();

        self.metrics.record_attempt(&result, bytes).await;

        match result.error_class {
            Some(class) if class.is_retryable() => warn!(
                "Attempt {} for {} failed: {}",
                task.attempts,
                task.url,
                result.error_detail.as_deref().unwrap_or("unknown error")
            ),
            _ => debug!(
                "Crawled {} in {}ms ({})",
                task.url, result.crawl_duration_ms, result.status_group
            ),
        }

        result
    }
}

fn aborted(url: &str) -> CrawlResult {
    CrawlResult::failed(url, ErrorClass::Aborted, "cancelled")
}

fn classify_error(url: &str, error: &reqwest::Error) -> CrawlResult {
    let class = if error.is_timeout() {
        ErrorClass::Timeout
    } else if error.is_builder() {
        ErrorClass::InvalidUrl
    } else {
        ErrorClass::Network
    };

    CrawlResult::failed(url, class, error.to_string())
}

/// A missing content type is given the benefit of the doubt
fn is_html_family(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return true;
    };

    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    HTML_FAMILY.contains(&essence.as_str())
}

/// Read at most `cap` bytes of the body. The flag reports whether anything was left unread.
async fn read_capped(
    mut response: Response,
    cap: usize,
) -> Result<(Vec<u8>, bool), reqwest::Error> {
    let mut body = Vec::with_capacity(cap.min(8192));

    while let Some(chunk) = response.chunk().await? {
        let room = cap - body.len();
        if chunk.len() > room {
            body.extend_from_slice(&chunk[..room]);
            return Ok((body, true));
        }
        body.extend_from_slice(&chunk);
        if body.len() == cap {
            break;
        }
    }

    Ok((body, false))
}
