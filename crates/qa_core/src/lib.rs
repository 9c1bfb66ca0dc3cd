pub mod config;
pub mod embed;
pub mod engine;
pub mod error;
pub mod eval;
pub mod index;
pub mod model;
pub mod retrieval;
pub mod storage;

pub use config::{
    default_build_concurrency, EngineConfig, DEFAULT_DATA_PATH, DEFAULT_EMBEDDING_DIM,
    DEFAULT_MAX_BACKUPS,
};
pub use embed::{EmbeddingProvider, HashEmbeddingProvider};
pub use engine::{QaEngine, ReloadState};
pub use error::{EngineError, Result};
pub use eval::{evaluate_cases, CaseExpectation, EvalCase, EvalOutcome, EvalSummary};
pub use index::{EmbeddingRecord, IndexGeneration};
pub use model::{
    Answer, AnswerPatch, CorpusMetadata, CorpusStats, Difficulty, Match, MatchAll, QaDocument,
    QaPair,
};
pub use retrieval::{best_match, cosine_similarity, top_k};
pub use storage::{validate_corpus, CorpusStore};
