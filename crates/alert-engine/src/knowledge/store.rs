//! Read-only knowledge storage

use super::embedder::{cosine_similarity, Embedder};
use crate::models::KnowledgeEntry;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("failed to read knowledge base: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse knowledge base: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("entry {id} has {found} dimensions, expected {expected}")]
    DimensionMismatch {
        id: String,
        expected: usize,
        found: usize,
    },

    #[error("knowledge store unavailable: {0}")]
    Unavailable(String),
}

/// Similarity search over stored entries
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<KnowledgeEntry>, KnowledgeError>;

    /// Up to `limit` entries by descending cosine similarity
    async fn nearest(
        &self,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<(KnowledgeEntry, f64)>, KnowledgeError>;

    async fn count(&self) -> Result<usize, KnowledgeError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KnowledgeFile {
    Entries(Vec<KnowledgeEntry>),
    Wrapped { entries: Vec<KnowledgeEntry> },
}

/// Entries held in memory, loaded once at startup
#[derive(Debug, Default)]
pub struct InMemoryKnowledgeStore {
    entries: Vec<KnowledgeEntry>,
}

impl InMemoryKnowledgeStore {
    /// Embeds entries that arrive without a vector
    pub fn new(
        entries: Vec<KnowledgeEntry>,
        embedder: &dyn Embedder,
    ) -> Result<Self, KnowledgeError> {
        let dimensions = embedder.dimensions();
        let entries = entries
            .into_iter()
            .map(|mut entry| {
                if entry.embedding.is_empty() {
                    entry.embedding = embedder.embed(&document_text(&entry));
                } else if entry.embedding.len() != dimensions {
                    return Err(KnowledgeError::DimensionMismatch {
                        id: entry.id.clone(),
                        expected: dimensions,
                        found: entry.embedding.len(),
                    });
                }
                Ok(entry)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    /// Load a JSON file holding either a list of entries or `{"entries": [...]}`
    pub fn load_json(path: &Path, embedder: &dyn Embedder) -> Result<Self, KnowledgeError> {
        let content = std::fs::read_to_string(path)?;
        let entries = match serde_json::from_str::<KnowledgeFile>(&content)? {
            KnowledgeFile::Entries(entries) => entries,
            KnowledgeFile::Wrapped { entries } => entries,
        };
        let store = Self::new(entries, embedder)?;
        info!(path = %path.display(), entries = store.entries.len(), "Knowledge base loaded");
        Ok(store)
    }
}

/// Text an entry is embedded from
pub(crate) fn document_text(entry: &KnowledgeEntry) -> String {
    let mut text = format!("{} {}", entry.title, entry.content);
    for tag in &entry.tags {
        text.push(' ');
        text.push_str(tag);
    }
    text
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn get(&self, id: &str) -> Result<Option<KnowledgeEntry>, KnowledgeError> {
        Ok(self.entries.iter().find(|e| e.id == id).cloned())
    }

    async fn nearest(
        &self,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<(KnowledgeEntry, f64)>, KnowledgeError> {
        let mut scored: Vec<(&KnowledgeEntry, f64)> = self
            .entries
            .iter()
            .map(|entry| (entry, cosine_similarity(embedding, &entry.embedding)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        scored.truncate(limit);
        Ok(scored
            .into_iter()
            .map(|(entry, similarity)| (entry.clone(), similarity))
            .collect())
    }

    async fn count(&self) -> Result<usize, KnowledgeError> {
        Ok(self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::HashingEmbedder;
    use std::io::Write;

    const KB: &str = r#"{
        "entries": [
            {"id": "kb-1", "title": "Connection pool exhaustion", "content": "Database connection pool saturated under load", "tags": ["database"]},
            {"id": "kb-2", "title": "Disk full", "content": "Log volume filled the root disk", "tags": ["disk"]}
        ]
    }"#;

    #[tokio::test]
    async fn test_load_json_embeds_missing_vectors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(KB.as_bytes()).unwrap();

        let embedder = HashingEmbedder::default();
        let store = InMemoryKnowledgeStore::load_json(file.path(), &embedder).unwrap();
        assert_eq!(store.count().await.unwrap(), 2);

        let entry = store.get("kb-1").await.unwrap().unwrap();
        assert_eq!(entry.embedding.len(), 256);
        assert_eq!(entry.confidence, 1.0);

        let query = embedder.embed("database connection pool");
        let nearest = store.nearest(&query, 1).await.unwrap();
        assert_eq!(nearest[0].0.id, "kb-1");
    }

    #[test]
    fn test_rejects_wrong_dimensions() {
        let entry: KnowledgeEntry = serde_json::from_str(
            r#"{"id": "kb-x", "title": "t", "content": "c", "embedding": [0.1, 0.2]}"#,
        )
        .unwrap();
        let result = InMemoryKnowledgeStore::new(vec![entry], &HashingEmbedder::default());
        assert!(matches!(result, Err(KnowledgeError::DimensionMismatch { found: 2, .. })));
    }

    #[test]
    fn test_plain_list_and_malformed_file() {
        let mut list = tempfile::NamedTempFile::new().unwrap();
        list.write_all(br#"[{"id": "a", "title": "t", "content": "c"}]"#).unwrap();
        let embedder = HashingEmbedder::default();
        assert!(InMemoryKnowledgeStore::load_json(list.path(), &embedder).is_ok());

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        broken.write_all(b"not json").unwrap();
        assert!(matches!(
            InMemoryKnowledgeStore::load_json(broken.path(), &embedder),
            Err(KnowledgeError::Parse(_))
        ));
    }
}
