use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::crawler::task::CrawlResult;

/// Destination for enriched results, keyed by saved-item id
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Insert or replace the result for an item. Repeating a delivery is harmless.
    async fn upsert(&self, owner_item_id: &str, result: &CrawlResult) -> Result<()>;
}

/// Keeps results in memory
#[derive(Default)]
pub struct MemorySink {
    results: parking_lot::Mutex<HashMap<String, CrawlResult>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, owner_item_id: &str) -> Option<CrawlResult> {
        self.results.lock().get(owner_item_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.lock().is_empty()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn upsert(&self, owner_item_id: &str, result: &CrawlResult) -> Result<()> {
        self.results
            .lock()
            .insert(owner_item_id.to_string(), result.clone());
        Ok(())
    }
}

/// Stores results as one JSON object keyed by item id, rewritten on every upsert
pub struct JsonFileSink {
    path: PathBuf,
    results: Mutex<BTreeMap<String, CrawlResult>>,
}

impl JsonFileSink {
    /// Open a sink, keeping results already present in the file
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let results = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .context(format!("Failed to read results file: {}", path.display()))?;
            if contents.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&contents)
                    .context(format!("Failed to parse results file: {}", path.display()))?
            }
        } else {
            BTreeMap::new()
        };

        debug!("Opened results file {} with {} entries", path.display(), results.len());
        Ok(Self {
            path,
            results: Mutex::new(results),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> usize {
        self.results.lock().await.len()
    }
}

#[async_trait]
impl ResultSink for JsonFileSink {
    async fn upsert(&self, owner_item_id: &str, result: &CrawlResult) -> Result<()> {
        let mut results = self.results.lock().await;
        results.insert(owner_item_id.to_string(), result.clone());

        let contents = serde_json::to_string_pretty(&*results)
            .context("Failed to serialize results")?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        tokio::fs::write(&self.path, contents)
            .await
            .context(format!("Failed to write results file: {}", self.path.display()))?;

        Ok(())
    }
}
