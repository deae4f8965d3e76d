//! Knowledge 모듈 - 청킹, 색인, 검색 결과 통합
//!
//! - Chunker: FIXED / RECURSIVE / SEMANTIC 텍스트 분할
//! - BM25: 메모리 역색인 키워드 검색 (copy-on-write 스냅샷)
//! - Vector: LanceDB 또는 메모리 벡터 검색
//! - Fusion: RRF 알고리즘으로 두 검색 결과 통합
//! - Store: SQLite 문서 / 템플릿 / 질의 로그 저장

mod bm25;
mod chunker;
mod fusion;
mod lance;
mod store;
mod vector;

// Re-exports
pub use bm25::{tokenize, Bm25Index, Bm25Params, ChunkKey, DocumentSource, IndexStats, LexicalHit};
pub use chunker::{
    Chunk, ChunkConfig, ChunkEngine, ChunkStats, ChunkStrategy, PageText,
    DEFAULT_SEMANTIC_THRESHOLD,
};
pub use fusion::{fuse, ChunkSource, RetrievedChunk, RrfParams};
pub use lance::LanceVectorStore;
pub use store::{
    DocumentRecord, DocumentStatus, KnowledgeStore, NewDocument, StoreStats,
    DEFAULT_SYSTEM_PROMPT, DEFAULT_TEMPLATE_NAME,
};
pub use vector::{cosine_similarity, InMemoryVectorStore, VectorHit, VectorPoint, VectorStore};
