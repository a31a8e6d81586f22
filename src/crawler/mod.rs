pub mod controller;
pub mod progress;
pub mod queue;
pub mod task;
pub mod worker;

// Re-export common types
pub use controller::{CrawlRequest, CrawlResponse, CrawlService, FetchStack};
pub use progress::{ProgressPublisher, QueueStatistics, Subscription};
pub use queue::TaskQueue;
pub use task::{
    CrawlResult, CrawlTask, ErrorClass, MetaSource, PageMeta, Priority, StatusGroup, TaskFailure,
    TaskState,
};
pub use worker::{FetchWorker, TaskRunner};
