//! prorag - 하이브리드 RAG 질의 파이프라인
//!
//! BM25 키워드 검색 + 벡터 검색을 RRF로 통합하고,
//! 질의 변환(HyDE, multi-query, step-back)과 리랭크를 거쳐
//! 답변을 토큰 단위로 스트리밍합니다.

pub mod app;
pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod knowledge;
pub mod query;
pub mod rerank;
pub mod server;

#[cfg(test)]
mod testing;

// Re-exports
pub use app::{AppStats, ChunkPreview, Providers, RagApp};
pub use config::RagConfig;
pub use embedding::{EmbeddingBatch, EmbeddingProvider, OpenAiEmbedding};
pub use error::{RagError, Result};
pub use generation::{GenerationProvider, OpenAiGeneration};
pub use knowledge::{
    Bm25Index, Chunk, ChunkConfig, ChunkEngine, ChunkStrategy, InMemoryVectorStore,
    KnowledgeStore, LanceVectorStore, PageText, RetrievedChunk, VectorStore,
};
pub use query::{
    PipelineEvent, QueryOutcome, QueryPipeline, QueryRequest, QueryStrategy, SearchMode,
};
pub use rerank::{JinaReranker, Reranker};
