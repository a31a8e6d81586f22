use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A saved link as listed by the bookmark store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Lists candidate links for enrichment
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BookmarkSource: Send + Sync {
    /// List the given bookmarks, or all of them when `ids` is `None`
    async fn list(&self, ids: Option<Vec<String>>) -> Result<Vec<Bookmark>>;
}

fn select(bookmarks: &[Bookmark], ids: Option<Vec<String>>) -> Vec<Bookmark> {
    match ids {
        None => bookmarks.to_vec(),
        Some(ids) => bookmarks
            .iter()
            .filter(|bookmark| ids.contains(&bookmark.id))
            .cloned()
            .collect(),
    }
}

/// Fixed in-memory list
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    bookmarks: Vec<Bookmark>,
}

impl StaticSource {
    pub fn new(bookmarks: Vec<Bookmark>) -> Self {
        Self { bookmarks }
    }
}

#[async_trait]
impl BookmarkSource for StaticSource {
    async fn list(&self, ids: Option<Vec<String>>) -> Result<Vec<Bookmark>> {
        Ok(select(&self.bookmarks, ids))
    }
}

/// JSON file holding an array of `{ "id", "url", "title"? }` objects
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl BookmarkSource for JsonFileSource {
    async fn list(&self, ids: Option<Vec<String>>) -> Result<Vec<Bookmark>> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .context(format!("Failed to read bookmarks file: {}", self.path.display()))?;

        let bookmarks: Vec<Bookmark> = serde_json::from_str(&contents)
            .context(format!("Failed to parse bookmarks file: {}", self.path.display()))?;

        Ok(select(&bookmarks, ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bookmark(id: &str) -> Bookmark {
        Bookmark {
            id: id.to_string(),
            url: format!("https://example.com/{}", id),
            title: None,
        }
    }

    #[tokio::test]
    async fn static_source_filters_by_id() {
        let source = StaticSource::new(vec![bookmark("1"), bookmark("2"), bookmark("3")]);

        assert_eq!(source.list(None).await.unwrap().len(), 3);
        let picked = source.list(Some(vec!["3".to_string(), "9".to_string()])).await.unwrap();
        assert_eq!(picked, vec![bookmark("3")]);
    }

    #[tokio::test]
    async fn json_file_source_reads_array() {
        let path = std::env::temp_dir().join(format!(
            "link-enricher-bookmarks-{}.json",
            uuid::Uuid::new_v4()
        ));
        let body = r#"[
            {"id": "a", "url": "https://a.example/"},
            {"id": "b", "url": "https://b.example/", "title": "B"}
        ]"#;
        tokio::fs::write(&path, body).await.unwrap();

        let source = JsonFileSource::new(&path);
        let all = source.list(None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].title.as_deref(), Some("B"));

        tokio::fs::remove_file(&path).await.ok();
        assert!(source.list(None).await.is_err());
    }
}
