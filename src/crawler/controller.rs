use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::cli::config::EnricherConfig;
use crate::crawler::progress::{ProgressPublisher, QueueStatistics, Subscription};
use crate::crawler::queue::TaskQueue;
use crate::crawler::task::{CrawlTask, Priority, TaskFailure};
use crate::crawler::worker::{build_client, FetchWorker, TaskRunner};
use crate::parse::context::{ContextHost, ParseContextManager, UnsupportedHost};
use crate::parse::dispatcher::Dispatcher;
use crate::parse::worker::WorkerThreadHost;
use crate::politeness::{DomainThrottle, RobotsPolicyCache};
use crate::storage::{BookmarkSource, ResultSink};
use crate::utils::metrics::{Metrics, MetricsCollector};

/// Parameters of a crawl run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlRequest {
    /// Restrict the run to these bookmarks; all bookmarks when absent
    pub bookmark_ids: Option<Vec<String>>,
    pub priority: Option<Priority>,
    /// Defaults to true
    pub respect_robots: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Tasks accepted by the queue
    pub enqueued: usize,
    /// Bookmarks dropped because their URL cannot be crawled
    pub skipped: usize,
}

impl CrawlResponse {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            enqueued: 0,
            skipped: 0,
        }
    }
}

/// Everything needed to fetch and enrich pages, built from one configuration
pub struct FetchStack {
    pub worker: Arc<FetchWorker>,
    pub robots: Arc<RobotsPolicyCache>,
    pub contexts: Arc<ParseContextManager>,
    pub metrics: Arc<MetricsCollector>,
}

impl FetchStack {
    /// Wire up the HTTP client, politeness layer and parse context.
    /// Must be called inside a tokio runtime.
    pub fn build(config: &EnricherConfig) -> Result<Self> {
        let client = build_client(&config.fetch)?;

        let throttle = Arc::new(DomainThrottle::from_settings(&config.throttle));
        let robots = Arc::new(RobotsPolicyCache::new(client.clone(), config.robots.clone()));

        let host: Arc<dyn ContextHost> = if config.parse_context.enabled {
            Arc::new(WorkerThreadHost::new(config.parse_context.idle_timeout()))
        } else {
            info!("Parse context disabled, using the fallback extractor only");
            Arc::new(UnsupportedHost)
        };
        let (contexts, replies) = ParseContextManager::new(host);
        let dispatcher = Arc::new(Dispatcher::new(
            contexts.clone(),
            replies,
            config.dispatch.clone(),
        ));

        let metrics = Arc::new(MetricsCollector::new());
        let worker = Arc::new(FetchWorker::new(
            client,
            config.fetch.clone(),
            throttle,
            robots.clone(),
            dispatcher,
            metrics.clone(),
        ));

        Ok(Self {
            worker,
            robots,
            contexts,
            metrics,
        })
    }
}

/// Entry point for callers: task intake, controls and progress
pub struct CrawlService {
    source: Arc<dyn BookmarkSource>,
    queue: TaskQueue,
    contexts: Option<Arc<ParseContextManager>>,
    metrics: Arc<MetricsCollector>,
}

impl CrawlService {
    /// Create a service that fetches pages over HTTP.
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: &EnricherConfig,
        source: Arc<dyn BookmarkSource>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self> {
        let stack = FetchStack::build(config)?;
        let queue = TaskQueue::new(
            config.queue.clone(),
            stack.worker,
            sink,
            ProgressPublisher::new(),
        );

        Ok(Self {
            source,
            queue,
            contexts: Some(stack.contexts),
            metrics: stack.metrics,
        })
    }

    /// Create a service around a custom runner
    pub fn with_runner(
        config: &EnricherConfig,
        source: Arc<dyn BookmarkSource>,
        sink: Arc<dyn ResultSink>,
        runner: Arc<dyn TaskRunner>,
    ) -> Self {
        Self {
            source,
            queue: TaskQueue::new(config.queue.clone(), runner, sink, ProgressPublisher::new()),
            contexts: None,
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    /// Load candidate bookmarks, queue the crawlable ones and start the queue
    pub async fn start_crawl(&self, request: CrawlRequest) -> CrawlResponse {
        let bookmarks = match self.source.list(request.bookmark_ids.clone()).await {
            Ok(bookmarks) => bookmarks,
            Err(e) => {
                warn!("Failed to load bookmarks: {:#}", e);
                return CrawlResponse::failure(format!("failed to load bookmarks: {:#}", e));
            }
        };

        let respect_robots = request.respect_robots.unwrap_or(true);
        let priority = request.priority.unwrap_or_default();

        let mut skipped = 0;
        let mut tasks = Vec::with_capacity(bookmarks.len());
        for bookmark in bookmarks {
            if !is_crawlable(&bookmark.url) {
                debug!("Skipping bookmark {} with invalid URL {}", bookmark.id, bookmark.url);
                skipped += 1;
                continue;
            }
            tasks.push(
                CrawlTask::new(bookmark.id, bookmark.url).with_respect_robots(respect_robots),
            );
        }

        if skipped > 0 {
            warn!("Skipped {} bookmarks with invalid URLs", skipped);
        }

        let candidates = tasks.len();
        let (enqueued, _) = self.queue.enqueue_counted(tasks, priority);

        self.queue.start();
        info!(
            "Queued {} of {} bookmarks at {:?} priority",
            enqueued, candidates, priority
        );

        CrawlResponse {
            success: true,
            error: None,
            enqueued,
            skipped,
        }
    }

    /// Returns false when already paused
    pub fn pause(&self) -> bool {
        self.queue.pause()
    }

    /// Returns false when not paused
    pub fn resume(&self) -> bool {
        self.queue.resume()
    }

    /// Returns false when there was nothing to cancel
    pub fn cancel(&self) -> bool {
        self.queue.cancel() > 0
    }

    pub fn on_progress(
        &self,
        callback: impl Fn(&QueueStatistics) + Send + Sync + 'static,
    ) -> Subscription {
        self.queue.publisher().on_progress(callback)
    }

    pub fn on_complete(
        &self,
        callback: impl Fn(&QueueStatistics) + Send + Sync + 'static,
    ) -> Subscription {
        self.queue.publisher().on_complete(callback)
    }

    pub fn on_error(
        &self,
        callback: impl Fn(&TaskFailure) + Send + Sync + 'static,
    ) -> Subscription {
        self.queue.publisher().on_error(callback)
    }

    pub fn get_progress(&self) -> Option<QueueStatistics> {
        self.queue.publisher().get_progress()
    }

    pub fn statistics(&self) -> QueueStatistics {
        self.queue.get_statistics()
    }

    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await
    }

    pub async fn metrics(&self) -> Metrics {
        self.metrics.get_metrics().await
    }

    /// Tear down the parse context. Queued work is left untouched.
    pub async fn shutdown(&self) {
        if let Some(contexts) = &self.contexts {
            if contexts.dispose().await {
                debug!("Parse context disposed");
            }
        }
    }
}

fn is_crawlable(url: &str) -> bool {
    match Url::parse(url) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host_str().is_some(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::{CrawlResult, ErrorClass, StatusGroup};
    use crate::storage::source::MockBookmarkSource;
    use crate::storage::{Bookmark, MemorySink};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    /// Succeeds immediately and records what it was given
    #[derive(Default)]
    struct EchoRunner {
        seen: Mutex<Vec<CrawlTask>>,
    }

    #[async_trait]
    impl TaskRunner for EchoRunner {
        async fn run(&self, task: &CrawlTask, _cancel: CancellationToken) -> CrawlResult {
            self.seen.lock().push(task.clone());
            let mut result = CrawlResult::failed(&task.url, ErrorClass::Network, "");
            result.http_status = Some(200);
            result.status_group = StatusGroup::Success;
            result.error_class = None;
            result.error_detail = None;
            result
        }
    }

    fn bookmark(id: &str, url: &str) -> Bookmark {
        Bookmark {
            id: id.to_string(),
            url: url.to_string(),
            title: None,
        }
    }

    fn service(
        source: MockBookmarkSource,
        runner: Arc<EchoRunner>,
        sink: Arc<MemorySink>,
    ) -> CrawlService {
        CrawlService::with_runner(&EnricherConfig::default(), Arc::new(source), sink, runner)
    }

    #[test]
    fn crawlable_urls() {
        assert!(is_crawlable("https://example.com/a"));
        assert!(is_crawlable("http://127.0.0.1:8080/"));
        assert!(!is_crawlable("javascript:alert(1)"));
        assert!(!is_crawlable("mailto:me@example.com"));
        assert!(!is_crawlable("example.com"));
    }

    #[tokio::test]
    async fn start_crawl_queues_valid_bookmarks() {
        let mut source = MockBookmarkSource::new();
        source
            .expect_list()
            .withf(|ids| ids.is_none())
            .times(1)
            .returning(|_| {
                Ok(vec![
                    bookmark("1", "https://a.example/"),
                    bookmark("2", "not a url"),
                    bookmark("3", "https://b.example/post"),
                ])
            });

        let runner = Arc::new(EchoRunner::default());
        let sink = Arc::new(MemorySink::new());
        let service = service(source, runner.clone(), sink.clone());

        let response = service
            .start_crawl(CrawlRequest {
                priority: Some(Priority::High),
                respect_robots: Some(false),
                ..CrawlRequest::default()
            })
            .await;
        assert!(response.success);
        assert_eq!(response.enqueued, 2);
        assert_eq!(response.skipped, 1);

        service.wait_idle().await;

        assert_eq!(sink.len(), 2);
        assert!(sink.get("3").is_some());
        let seen = runner.seen.lock();
        assert!(seen.iter().all(|task| task.priority == Priority::High && !task.respect_robots));
        assert_eq!(service.get_progress().unwrap().completed, 2);
    }

    #[tokio::test]
    async fn start_crawl_forwards_selected_ids() {
        let mut source = MockBookmarkSource::new();
        source
            .expect_list()
            .withf(|ids| ids.as_deref() == Some(&["7".to_string()][..]))
            .times(1)
            .returning(|_| Ok(vec![bookmark("7", "https://seven.example/")]));

        let sink = Arc::new(MemorySink::new());
        let service = service(source, Arc::new(EchoRunner::default()), sink.clone());

        let response = service
            .start_crawl(CrawlRequest {
                bookmark_ids: Some(vec!["7".to_string()]),
                ..CrawlRequest::default()
            })
            .await;
        assert!(response.success);

        service.wait_idle().await;
        assert!(sink.get("7").is_some());
    }

    #[tokio::test]
    async fn source_failure_is_reported() {
        let mut source = MockBookmarkSource::new();
        source
            .expect_list()
            .returning(|_| Err(anyhow::anyhow!("store locked")));

        let service = service(source, Arc::new(EchoRunner::default()), Arc::new(MemorySink::new()));
        let response = service.start_crawl(CrawlRequest::default()).await;

        assert!(!response.success);
        assert!(response.error.unwrap().contains("store locked"));
        assert!(service.get_progress().is_none());
    }

    #[tokio::test]
    async fn controls_report_no_op_transitions() {
        let service = service(
            MockBookmarkSource::new(),
            Arc::new(EchoRunner::default()),
            Arc::new(MemorySink::new()),
        );

        assert!(service.pause());
        assert!(!service.pause());
        assert!(service.resume());
        assert!(!service.resume());
        assert!(!service.cancel());
    }

    #[tokio::test]
    async fn cancel_while_paused_drops_pending_work() {
        let mut source = MockBookmarkSource::new();
        source.expect_list().returning(|_| {
            Ok(vec![
                bookmark("1", "https://a.example/"),
                bookmark("2", "https://b.example/"),
            ])
        });

        let runner = Arc::new(EchoRunner::default());
        let service = service(source, runner.clone(), Arc::new(MemorySink::new()));

        assert!(service.pause());
        let response = service.start_crawl(CrawlRequest::default()).await;
        assert_eq!(response.enqueued, 2);
        assert_eq!(service.statistics().paused, 2);

        assert!(service.cancel());
        assert_eq!(service.statistics().total, 0);
        service.wait_idle().await;
        assert!(runner.seen.lock().is_empty());
    }
}
