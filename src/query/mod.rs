//! Query 모듈 - 질의 변환과 파이프라인 오케스트레이션
//!
//! - Types: 요청, 확정 설정, 스트리밍 이벤트, 질의 로그
//! - Transform: DIRECT / HyDE / multi-query / step-back
//! - Pipeline: 검색 → 리랭크 → 생성 → 로그 저장

mod pipeline;
mod transform;
mod types;

// Re-exports
pub use pipeline::{
    assemble_context, render_prompt, Collaborators, PipelineOptions, PreparedQuery,
    PromptTemplateStore, QueryLogSink, QueryPipeline, EVENT_BUFFER,
};
pub use transform::{QueryStrategy, QueryTransformer, Transformation};
pub use types::{
    PipelineDefaults, PipelineEvent, PipelineMetadata, PipelineSettings, PromptTemplate,
    QueryCompletion, QueryLog, QueryLogPage, QueryLogRecord, QueryLogSummary, QueryOutcome,
    QueryRequest, SearchMode, StageTimings, MAX_RERANKER_TOP_N, MAX_RETRIEVAL_TOP_K,
};
