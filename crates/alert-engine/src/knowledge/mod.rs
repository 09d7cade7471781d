//! Knowledge base retrieval for root-cause analysis

mod embedder;
mod retriever;
mod store;

pub use embedder::{cosine_similarity, Embedder, HashingEmbedder};
pub use retriever::{KnowledgeRetriever, ScoredEntry};
pub use store::{InMemoryKnowledgeStore, KnowledgeError, KnowledgeStore};
