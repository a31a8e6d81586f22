use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scheduling priority of a task. Ordering follows urgency, so `Urgent > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Lifecycle state of a task while it is owned by the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Represents a crawling task to be executed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlTask {
    /// Unique identifier of this task
    pub id: Uuid,

    /// URL to crawl
    pub url: String,

    /// Identifier of the saved item the result belongs to
    pub owner_item_id: String,

    pub priority: Priority,

    pub state: TaskState,

    /// Number of attempts started so far
    pub attempts: u32,

    pub last_error: Option<String>,

    pub enqueued_at: DateTime<Utc>,

    /// Skip the fetch when the host's robots policy disallows everything
    pub respect_robots: bool,
}

impl CrawlTask {
    pub fn new(owner_item_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            owner_item_id: owner_item_id.into(),
            priority: Priority::Normal,
            state: TaskState::Pending,
            attempts: 0,
            last_error: None,
            enqueued_at: Utc::now(),
            respect_robots: true,
        }
    }

    pub fn with_respect_robots(mut self, respect_robots: bool) -> Self {
        self.respect_robots = respect_robots;
        self
    }
}

/// Coarse classification of an HTTP outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusGroup {
    #[serde(rename = "2xx")]
    Success,
    #[serde(rename = "3xx")]
    Redirect,
    #[serde(rename = "4xx")]
    ClientError,
    #[serde(rename = "5xx")]
    ServerError,
    #[serde(rename = "error")]
    Error,
}

impl StatusGroup {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => StatusGroup::Success,
            300..=399 => StatusGroup::Redirect,
            400..=499 => StatusGroup::ClientError,
            500..=599 => StatusGroup::ServerError,
            _ => StatusGroup::Error,
        }
    }
}

impl fmt::Display for StatusGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusGroup::Success => "2xx",
            StatusGroup::Redirect => "3xx",
            StatusGroup::ClientError => "4xx",
            StatusGroup::ServerError => "5xx",
            StatusGroup::Error => "error",
        };
        f.write_str(name)
    }
}

/// Why an attempt did not produce a regular page result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    Network,
    Timeout,
    InvalidUrl,
    UnsupportedMedia,
    RobotsDisallowed,
    Aborted,
}

impl ErrorClass {
    /// Network-level failures are worth another attempt; everything else is final.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Network | ErrorClass::Timeout)
    }
}

/// Which extractor produced the page metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MetaSource {
    Context,
    Fallback,
    #[default]
    None,
}

/// Social-preview and document metadata of a page
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    pub title: Option<String>,
    pub description: Option<String>,
    pub og_title: Option<String>,
    pub og_description: Option<String>,
    pub og_image: Option<String>,
    pub og_site_name: Option<String>,
}

impl PageMeta {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.og_title.is_none()
            && self.og_description.is_none()
            && self.og_image.is_none()
            && self.og_site_name.is_none()
    }
}

/// Result of a single crawl attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlResult {
    /// URL after following redirects
    pub final_url: String,

    /// HTTP status code, absent when no response was received
    pub http_status: Option<u16>,

    pub status_group: StatusGroup,

    pub robots_allowed: bool,

    pub meta: PageMeta,

    pub meta_source: MetaSource,

    pub content_type: Option<String>,

    pub error_class: Option<ErrorClass>,

    /// Human readable detail for `error_class`
    pub error_detail: Option<String>,

    /// Wall-clock duration of the whole attempt in milliseconds
    pub crawl_duration_ms: u64,

    pub crawled_at: DateTime<Utc>,
}

impl CrawlResult {
    /// A result that carries no HTTP response, only a failure classification.
    pub fn failed(url: &str, class: ErrorClass, detail: impl Into<String>) -> Self {
        Self {
            final_url: url.to_string(),
            http_status: None,
            status_group: StatusGroup::Error,
            robots_allowed: true,
            meta: PageMeta::default(),
            meta_source: MetaSource::None,
            content_type: None,
            error_class: Some(class),
            error_detail: Some(detail.into()),
            crawl_duration_ms: 0,
            crawled_at: Utc::now(),
        }
    }

    /// Whether the queue should schedule another attempt for this outcome
    pub fn is_retryable(&self) -> bool {
        self.error_class.map_or(false, ErrorClass::is_retryable)
    }
}

/// Detail delivered to error subscribers when a task exhausts its attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub task_id: Uuid,
    pub owner_item_id: String,
    pub url: String,
    pub attempts: u32,
    pub error: String,
    pub occurred_at: DateTime<Utc>,
}
