//! Similarity search re-ranked by label overlap

use super::embedder::Embedder;
use super::store::{KnowledgeError, KnowledgeStore};
use crate::models::{KnowledgeEntry, Labels};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntry {
    pub entry: KnowledgeEntry,
    pub similarity: f64,
    pub overlap: f64,
    pub score: f64,
}

pub struct KnowledgeRetriever {
    store: Arc<dyn KnowledgeStore>,
    embedder: Arc<dyn Embedder>,
    label_weight: f64,
    /// Candidates pulled from the store per requested result
    candidate_factor: usize,
}

impl KnowledgeRetriever {
    pub fn new(store: Arc<dyn KnowledgeStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            store,
            embedder,
            label_weight: 0.3,
            candidate_factor: 4,
        }
    }

    pub fn with_label_weight(mut self, weight: f64) -> Self {
        self.label_weight = if weight.is_finite() { weight.clamp(0.0, 1.0) } else { 0.3 };
        self
    }

    /// Up to `limit` entries for `query`, boosted when their labels or tags
    /// match the alert `context`
    pub async fn search(
        &self,
        query: &str,
        context: &Labels,
        limit: usize,
    ) -> Result<Vec<ScoredEntry>, KnowledgeError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let embedding = self.embedder.embed(query);
        let candidates = self
            .store
            .nearest(&embedding, limit.saturating_mul(self.candidate_factor))
            .await?;

        let mut ranked: Vec<ScoredEntry> = candidates
            .into_iter()
            .map(|(entry, similarity)| {
                let overlap = label_overlap(&entry, context);
                let score = (1.0 - self.label_weight) * similarity + self.label_weight * overlap;
                ScoredEntry {
                    entry,
                    similarity,
                    overlap,
                    score,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entry.id.cmp(&b.entry.id))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }
}

/// Fraction of an entry's labels and tags matched by the context
fn label_overlap(entry: &KnowledgeEntry, context: &Labels) -> f64 {
    let total = entry.labels.len() + entry.tags.len();
    if total == 0 {
        return 0.0;
    }
    let label_hits = entry
        .labels
        .iter()
        .filter(|(name, value)| context.get(*name) == Some(*value))
        .count();
    let tag_hits = entry
        .tags
        .iter()
        .filter(|tag| context.values().any(|value| value.eq_ignore_ascii_case(tag)))
        .count();
    (label_hits + tag_hits) as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{HashingEmbedder, InMemoryKnowledgeStore};

    fn entry(id: &str, title: &str, service: Option<&str>) -> KnowledgeEntry {
        let mut labels = Labels::new();
        if let Some(service) = service {
            labels.insert("service".into(), service.into());
        }
        KnowledgeEntry {
            id: id.into(),
            title: title.into(),
            content: "Restart the pods and check recent deploys".into(),
            tags: Vec::new(),
            labels,
            embedding: Vec::new(),
            confidence: 0.9,
        }
    }

    fn retriever(entries: Vec<KnowledgeEntry>) -> KnowledgeRetriever {
        let embedder = Arc::new(HashingEmbedder::default());
        let store = InMemoryKnowledgeStore::new(entries, embedder.as_ref()).unwrap();
        KnowledgeRetriever::new(Arc::new(store), embedder)
    }

    #[tokio::test]
    async fn test_label_overlap_breaks_similarity_ties() {
        let retriever = retriever(vec![
            entry("a", "High latency", Some("search")),
            entry("b", "High latency", Some("checkout")),
        ]);
        let mut context = Labels::new();
        context.insert("service".into(), "checkout".into());

        let hits = retriever.search("high latency", &context, 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].entry.id, "b");
        assert_eq!(hits[0].overlap, 1.0);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_results_are_bounded() {
        let entries = (0..10)
            .map(|i| entry(&format!("kb-{}", i), "cpu saturation", None))
            .collect();
        let retriever = retriever(entries);

        assert_eq!(retriever.search("cpu", &Labels::new(), 3).await.unwrap().len(), 3);
        assert!(retriever.search("cpu", &Labels::new(), 0).await.unwrap().is_empty());
    }

    #[test]
    fn test_overlap_counts_tags() {
        let mut kb = entry("a", "t", Some("api"));
        kb.tags = vec!["postgres".into()];
        let mut context = Labels::new();
        context.insert("service".into(), "api".into());
        assert_eq!(label_overlap(&kb, &context), 0.5);
        context.insert("db".into(), "Postgres".into());
        assert_eq!(label_overlap(&kb, &context), 1.0);
    }
}
