//! Polite, single-process enrichment of saved links with live page metadata.

pub mod cli;
pub mod crawler;
pub mod parse;
pub mod politeness;
pub mod storage;
pub mod utils;

pub use cli::config::EnricherConfig;
pub use crawler::{CrawlRequest, CrawlResponse, CrawlService};
