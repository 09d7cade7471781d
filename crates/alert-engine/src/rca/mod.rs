//! AI-assisted root-cause analysis

mod analyzer;
mod context;
mod provider;

pub use analyzer::{AnalyzerConfig, RootCauseAnalyzer};
pub use context::{context_hash, AlertDigest, AnalysisContext, ContextBuilder, KnowledgeSnippet, SeriesDigest};
pub use provider::{AiError, AiFinding, AiProvider, HttpAiProvider, ProviderConfig};
