//! 질의 파이프라인 타입
//!
//! 요청, 확정된 실행 설정, 스트리밍 이벤트, 질의 로그 레코드를 정의합니다.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use crate::knowledge::RetrievedChunk;

use super::transform::QueryStrategy;

/// 최대 검색 후보 수
pub const MAX_RETRIEVAL_TOP_K: usize = 100;
/// 최대 리랭크 결과 수
pub const MAX_RERANKER_TOP_N: usize = 50;

// ============================================================================
// Search Mode
// ============================================================================

/// 검색 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// 벡터 검색만
    Vector,
    /// BM25 키워드 검색만
    Bm25,
    /// 벡터 + BM25 RRF 통합 (기본값)
    #[default]
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vector => "vector",
            Self::Bm25 => "bm25",
            Self::Hybrid => "hybrid",
        }
    }

    pub fn uses_vectors(&self) -> bool {
        !matches!(self, Self::Bm25)
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vector" => Ok(Self::Vector),
            "bm25" => Ok(Self::Bm25),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(RagError::validation(format!(
                "unknown search mode '{}' (expected vector, bm25 or hybrid)",
                other
            ))),
        }
    }
}

// ============================================================================
// Request
// ============================================================================

/// 질의 요청 (생략된 필드는 설정 기본값 사용)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub query_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_mode: Option<SearchMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_strategy: Option<QueryStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reranker_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reranker_top_n: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_ids: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template_id: Option<i64>,
}

impl QueryRequest {
    pub fn new(query_text: impl Into<String>) -> Self {
        Self {
            query_text: query_text.into(),
            ..Default::default()
        }
    }

    /// 파이프라인 시작 전 파라미터 검증
    pub fn validate(&self) -> Result<()> {
        if self.query_text.trim().is_empty() {
            return Err(RagError::validation("queryText must not be empty"));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(RagError::validation(format!(
                    "temperature must be between 0 and 2, got {}",
                    t
                )));
            }
        }
        if let Some(k) = self.retrieval_top_k {
            if !(1..=MAX_RETRIEVAL_TOP_K).contains(&k) {
                return Err(RagError::validation(format!(
                    "retrievalTopK must be between 1 and {}, got {}",
                    MAX_RETRIEVAL_TOP_K, k
                )));
            }
        }
        if let Some(n) = self.reranker_top_n {
            if !(1..=MAX_RERANKER_TOP_N).contains(&n) {
                return Err(RagError::validation(format!(
                    "rerankerTopN must be between 1 and {}, got {}",
                    MAX_RERANKER_TOP_N, n
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Settings
// ============================================================================

/// 설정 파일에서 온 파이프라인 기본값
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDefaults {
    pub top_k: usize,
    pub reranker_top_n: usize,
    pub temperature: f64,
    pub search_mode: SearchMode,
    pub query_strategy: QueryStrategy,
    pub vector_weight: f64,
    pub reranker_enabled: bool,
}

impl Default for PipelineDefaults {
    fn default() -> Self {
        Self {
            top_k: 20,
            reranker_top_n: 5,
            temperature: 0.1,
            search_mode: SearchMode::Hybrid,
            query_strategy: QueryStrategy::Direct,
            vector_weight: 0.7,
            reranker_enabled: true,
        }
    }
}

/// 질의 1회 실행에 대해 확정된 설정 (실행 중 불변)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSettings {
    pub search_mode: SearchMode,
    pub query_strategy: QueryStrategy,
    pub reranker_enabled: bool,
    pub temperature: f64,
    pub retrieval_top_k: usize,
    pub reranker_top_n: usize,
    pub document_ids: Option<Vec<i64>>,
    pub prompt_template_id: Option<i64>,
    pub llm_model: String,
    pub vector_weight: f64,
}

impl PipelineSettings {
    /// 요청 값을 기본값 위에 병합
    ///
    /// 빈 문서 ID 목록은 필터 없음으로 취급합니다.
    pub fn resolve(request: &QueryRequest, defaults: &PipelineDefaults, llm_model: &str) -> Self {
        Self {
            search_mode: request.search_mode.unwrap_or(defaults.search_mode),
            query_strategy: request.query_strategy.unwrap_or(defaults.query_strategy),
            reranker_enabled: request.reranker_enabled.unwrap_or(defaults.reranker_enabled),
            temperature: request.temperature.unwrap_or(defaults.temperature),
            retrieval_top_k: request.retrieval_top_k.unwrap_or(defaults.top_k),
            reranker_top_n: request.reranker_top_n.unwrap_or(defaults.reranker_top_n),
            document_ids: request.document_ids.clone().filter(|ids| !ids.is_empty()),
            prompt_template_id: request.prompt_template_id,
            llm_model: llm_model.to_string(),
            vector_weight: defaults.vector_weight,
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// 단계별 소요 시간 (ms)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTimings {
    pub transformation_ms: u64,
    pub embedding_ms: u64,
    pub retrieval_ms: u64,
    pub reranking_ms: u64,
}

/// 생성 시작 전 한 번 방출되는 메타데이터
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMetadata {
    pub timings: StageTimings,
    pub retrieved_chunks: Vec<RetrievedChunk>,
    pub settings: PipelineSettings,
    pub transformed_queries: Vec<String>,
}

/// 정상 종료 결과
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryCompletion {
    pub answer_text: String,
    pub query_log_id: i64,
    pub final_cost_usd: f64,
}

/// 스트리밍 이벤트
///
/// 순서: `metadata` 1회 → `token` 0회 이상 → `done` 또는 `error` 1회
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum PipelineEvent {
    Metadata(PipelineMetadata),
    Token { token: String },
    Done(QueryCompletion),
    Error { message: String },
}

impl PipelineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Metadata(_) => "metadata",
            Self::Token { .. } => "token",
            Self::Done(_) => "done",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Error { .. })
    }
}

/// 스트림을 끝까지 소비한 결과
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub metadata: PipelineMetadata,
    pub answer_text: String,
    pub query_log_id: i64,
    pub final_cost_usd: f64,
}

// ============================================================================
// Persistence Records
// ============================================================================

/// 프롬프트 템플릿 (`{{context}}`, `{{query}}` 자리표시자)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptTemplate {
    pub id: i64,
    pub name: String,
    pub system_prompt: String,
    pub description: Option<String>,
    pub is_default: bool,
}

/// 질의 1회 실행 기록
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryLogRecord {
    pub query_text: String,
    pub answer_text: String,
    pub query_strategy: QueryStrategy,
    pub search_mode: SearchMode,
    pub reranker_enabled: bool,
    pub temperature: f64,
    pub retrieval_top_k: usize,
    pub reranker_top_n: usize,
    pub llm_model: String,
    pub prompt_template_id: Option<i64>,
    pub document_ids: Option<Vec<i64>>,
    pub transformed_queries: Vec<String>,
    pub transformation_ms: u64,
    pub embedding_ms: u64,
    pub retrieval_ms: u64,
    pub reranking_ms: u64,
    pub generation_ms: u64,
    pub total_ms: u64,
    pub embedding_tokens: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub estimated_cost_usd: f64,
    pub retrieved_chunks: Vec<RetrievedChunk>,
}

/// 저장된 질의 로그
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryLog {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: QueryLogRecord,
}

/// 질의 로그 목록 항목
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryLogSummary {
    pub id: i64,
    pub query_text: String,
    pub search_mode: SearchMode,
    pub query_strategy: QueryStrategy,
    pub total_ms: u64,
    pub estimated_cost_usd: f64,
    pub created_at: DateTime<Utc>,
}

/// 페이지 단위 질의 로그 목록
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryLogPage {
    pub items: Vec<QueryLogSummary>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

// ============================================================================
// Tests
// ============================================================================
