use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::crawler::task::{CrawlResult, MetaSource, StatusGroup};

/// Fetch metrics collector
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    /// In-memory metrics store
    metrics: Arc<Mutex<Metrics>>,
}

/// Metrics data structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metrics {
    /// Start time of the metrics collection
    pub start_time: DateTime<Utc>,

    /// Attempts recorded, including ones that never reached the network
    pub total_requests: usize,

    /// Attempts that ended with a 2xx response
    pub successful_requests: usize,

    /// Attempts that ended without any HTTP response
    pub failed_requests: usize,

    /// Markup bytes read across all attempts
    pub bytes_downloaded: usize,

    /// Sum and maximum of attempt durations in milliseconds
    pub total_duration_ms: u64,
    pub max_duration_ms: u64,

    /// Attempts per status group ("2xx", "error", ...)
    pub status_groups: HashMap<String, usize>,

    /// Attempts per error class ("timeout", "unsupported-media", ...)
    pub error_classes: HashMap<String, usize>,

    /// Pages whose metadata came from the fallback extractor
    pub fallback_extractions: usize,
}

impl Metrics {
    pub fn average_duration_ms(&self) -> u64 {
        if self.total_requests == 0 {
            0
        } else {
            self.total_duration_ms / self.total_requests as u64
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        let metrics = Metrics {
            start_time: Utc::now(),
            ..Default::default()
        };

        Self {
            metrics: Arc::new(Mutex::new(metrics)),
        }
    }

    /// Record the outcome of one crawl attempt
    pub async fn record_attempt(&self, result: &CrawlResult, bytes: usize) {
        let mut metrics = self.metrics.lock().await;

        metrics.total_requests += 1;
        match result.status_group {
            StatusGroup::Success => metrics.successful_requests += 1,
            StatusGroup::Error if result.http_status.is_none() => metrics.failed_requests += 1,
            _ => {}
        }

        metrics.bytes_downloaded += bytes;
        metrics.total_duration_ms += result.crawl_duration_ms;
        metrics.max_duration_ms = metrics.max_duration_ms.max(result.crawl_duration_ms);

        *metrics
            .status_groups
            .entry(result.status_group.to_string())
            .or_default() += 1;

        if let Some(class) = result.error_class {
            let name = serde_json::to_value(class)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| format!("{:?}", class));
            *metrics.error_classes.entry(name).or_default() += 1;
        }

        if result.meta_source == MetaSource::Fallback {
            metrics.fallback_extractions += 1;
        }
    }

    /// Start timing a request
    pub fn start_timer(&self) -> RequestTimer {
        RequestTimer {
            start: Instant::now(),
        }
    }

    /// Get all metrics
    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.lock().await.clone()
    }

    /// Reset metrics
    pub async fn reset(&self) {
        let mut metrics = self.metrics.lock().await;
        *metrics = Metrics {
            start_time: Utc::now(),
            ..Default::default()
        };
    }
}

/// Request timer for measuring request durations
pub struct RequestTimer {
    /// Start time of the request
    start: Instant,
}

impl RequestTimer {
    /// End timing and get the duration in milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::ErrorClass;

    #[tokio::test]
    async fn records_attempt_outcomes() {
        let collector = MetricsCollector::new();

        let mut ok = CrawlResult::failed("https://a.example/", ErrorClass::Network, "");
        ok.error_class = None;
        ok.http_status = Some(200);
        ok.status_group = StatusGroup::Success;
        ok.meta_source = MetaSource::Fallback;
        ok.crawl_duration_ms = 30;
        collector.record_attempt(&ok, 1024).await;

        let mut timeout = CrawlResult::failed("https://b.example/", ErrorClass::Timeout, "slow");
        timeout.crawl_duration_ms = 10;
        collector.record_attempt(&timeout, 0).await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.successful_requests, 1);
        assert_eq!(metrics.failed_requests, 1);
        assert_eq!(metrics.bytes_downloaded, 1024);
        assert_eq!(metrics.max_duration_ms, 30);
        assert_eq!(metrics.average_duration_ms(), 20);
        assert_eq!(metrics.status_groups["2xx"], 1);
        assert_eq!(metrics.error_classes["timeout"], 1);
        assert_eq!(metrics.fallback_extractions, 1);

        collector.reset().await;
        assert_eq!(collector.get_metrics().await.total_requests, 0);
    }
}
