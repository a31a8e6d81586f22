use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use link_enricher::crawler::{CrawlRequest, CrawlService, ErrorClass, MetaSource, Priority};
use link_enricher::storage::{Bookmark, MemorySink, StaticSource};
use link_enricher::EnricherConfig;

/// Serves a small page and records when each request arrived
#[derive(Clone, Default)]
struct RecordingPage {
    arrivals: Arc<Mutex<Vec<(String, Instant)>>>,
}

impl Respond for RecordingPage {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.arrivals
            .lock()
            .push((request.url.path().to_string(), Instant::now()));

        let body = format!(
            "<html><head><title>Page {}</title>\
             <meta property=\"og:site_name\" content=\"Test Site\"></head><body></body></html>",
            request.url.path()
        );
        ResponseTemplate::new(200).set_body_raw(body, "text/html; charset=utf-8")
    }
}

async fn page_server(recorder: &RecordingPage) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/page/\d+$"))
        .respond_with(recorder.clone())
        .mount(&server)
        .await;
    server
}

fn config(concurrency: usize) -> EnricherConfig {
    let mut config = EnricherConfig::default();
    config.queue.concurrency = concurrency;
    config.robots.scheme = "http".to_string();
    config.fetch.timeout_ms = 5000;
    config
}

fn bookmark(id: &str, url: String) -> Bookmark {
    Bookmark {
        id: id.to_string(),
        url,
        title: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_host_requests_are_spaced_and_all_complete() {
    let a_pages = RecordingPage::default();
    let b_pages = RecordingPage::default();
    let a = page_server(&a_pages).await;
    let b = page_server(&b_pages).await;

    let source = Arc::new(StaticSource::new(vec![
        bookmark("a1", format!("{}/page/1", a.uri())),
        bookmark("a2", format!("{}/page/2", a.uri())),
        bookmark("b1", format!("{}/page/1", b.uri())),
    ]));
    let sink = Arc::new(MemorySink::new());
    let service = CrawlService::new(&config(2), source, sink.clone()).unwrap();

    let response = service
        .start_crawl(CrawlRequest {
            priority: Some(Priority::High),
            ..CrawlRequest::default()
        })
        .await;
    assert!(response.success);
    assert_eq!(response.enqueued, 3);

    tokio::time::timeout(Duration::from_secs(20), service.wait_idle())
        .await
        .expect("queue did not drain");

    let stats = service.statistics();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.progress, 100);

    let arrivals = a_pages.arrivals.lock();
    assert_eq!(arrivals.len(), 2);
    let gap = arrivals[1].1.duration_since(arrivals[0].1);
    // Arrival times include connection setup, which only the first request pays
    assert!(gap >= Duration::from_millis(950), "requests to one host {:?} apart", gap);
    assert_eq!(b_pages.arrivals.lock().len(), 1);

    for id in ["a1", "a2", "b1"] {
        let result = sink.get(id).expect("result stored");
        assert_eq!(result.http_status, Some(200));
        assert_eq!(result.meta.og_site_name.as_deref(), Some("Test Site"));
        assert_eq!(result.meta_source, MetaSource::Context);
    }

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disallowed_host_is_recorded_without_fetching() {
    let open_pages = RecordingPage::default();
    let closed_pages = RecordingPage::default();
    let open = page_server(&open_pages).await;
    let closed = page_server(&closed_pages).await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /\n"))
        .mount(&closed)
        .await;

    let source = Arc::new(StaticSource::new(vec![
        bookmark("open", format!("{}/page/1", open.uri())),
        bookmark("closed", format!("{}/page/1", closed.uri())),
        bookmark("broken", "not a url".to_string()),
    ]));
    let sink = Arc::new(MemorySink::new());
    let service = CrawlService::new(&config(4), source, sink.clone()).unwrap();

    let failures = Arc::new(Mutex::new(Vec::new()));
    let log = failures.clone();
    let _errors = service.on_error(move |failure| log.lock().push(failure.clone()));

    let response = service.start_crawl(CrawlRequest::default()).await;
    assert_eq!((response.enqueued, response.skipped), (2, 1));

    tokio::time::timeout(Duration::from_secs(20), service.wait_idle())
        .await
        .expect("queue did not drain");

    let closed_result = sink.get("closed").expect("result stored");
    assert!(!closed_result.robots_allowed);
    assert_eq!(closed_result.error_class, Some(ErrorClass::RobotsDisallowed));
    assert!(closed_pages.arrivals.lock().is_empty());

    assert_eq!(sink.get("open").unwrap().meta.title.as_deref(), Some("Page /page/1"));
    assert_eq!(service.statistics().completed, 2);
    assert!(failures.lock().is_empty());

    service.shutdown().await;
}
