//! 知识库：分词、分块、按领域的向量索引与持久化

pub mod chunker;
pub mod persistence;
pub mod store;
pub mod tokenizer;

pub use chunker::{Chunker, ChunkingConfig};
pub use store::{KnowledgeBase, KnowledgeDocument, ScoreKind, SearchHit, DEFAULT_DOMAINS};
