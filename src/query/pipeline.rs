//! 질의 파이프라인 오케스트레이터
//!
//! 변환 → 임베딩 → 검색(vector / bm25 / hybrid) → 리랭크 → 프롬프트 조립 →
//! 스트리밍 생성 → 비용 계산 → 로그 저장 순서로 한 번의 질의를 실행합니다.
//!
//! 이벤트 순서: `metadata` 1회 → `token` 0회 이상 → `done` 또는 `error` 1회
//!
//! 모든 협력자 호출은 실행 단위 `CancellationToken`과 경쟁합니다.
//! 이벤트 채널이 닫히면(클라이언트 연결 종료) 실행을 취소하고
//! 비용 계산과 로그 저장을 건너뜁니다.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::PricingConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::generation::{GenerationProvider, StreamEvent, TokenUsage};
use crate::knowledge::{
    fuse, Bm25Index, ChunkKey, LexicalHit, RetrievedChunk, RrfParams, VectorHit, VectorStore,
};
use crate::rerank::Reranker;

use super::transform::QueryTransformer;
use super::types::{
    PipelineDefaults, PipelineEvent, PipelineMetadata, PipelineSettings, PromptTemplate,
    QueryCompletion, QueryLogRecord, QueryOutcome, QueryRequest, SearchMode, StageTimings,
};

/// 이벤트 채널 버퍼 크기
pub const EVENT_BUFFER: usize = 64;

// ============================================================================
// Collaborator Traits
// ============================================================================

/// 프롬프트 템플릿 조회
#[async_trait]
pub trait PromptTemplateStore: Send + Sync {
    async fn find_template(&self, id: i64) -> anyhow::Result<Option<PromptTemplate>>;

    async fn default_template(&self) -> anyhow::Result<Option<PromptTemplate>>;
}

/// 질의 로그 저장
#[async_trait]
pub trait QueryLogSink: Send + Sync {
    /// 저장 후 로그 ID 반환
    async fn save(&self, record: &QueryLogRecord) -> anyhow::Result<i64>;
}

// ============================================================================
// Types
// ============================================================================

/// 파이프라인이 호출하는 외부 협력자
#[derive(Clone)]
pub struct Collaborators {
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub vector_store: Arc<dyn VectorStore>,
    pub lexical_index: Arc<Bm25Index>,
    pub reranker: Arc<dyn Reranker>,
    pub generator: Arc<dyn GenerationProvider>,
    pub templates: Arc<dyn PromptTemplateStore>,
    pub query_logs: Arc<dyn QueryLogSink>,
}

/// 설정에서 온 파이프라인 옵션
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub defaults: PipelineDefaults,
    pub rrf: RrfParams,
    pub pricing: PricingConfig,
    pub llm_model: String,
}

/// 검증과 템플릿 조회를 마친 질의 (스트림을 열기 전 단계)
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub run_id: Uuid,
    pub query_text: String,
    pub settings: PipelineSettings,
    pub template: PromptTemplate,
}

// ============================================================================
// QueryPipeline
// ============================================================================

pub struct QueryPipeline {
    collaborators: Collaborators,
    transformer: QueryTransformer,
    options: PipelineOptions,
}

impl QueryPipeline {
    pub fn new(collaborators: Collaborators, options: PipelineOptions) -> Self {
        let transformer = QueryTransformer::new(collaborators.generator.clone());
        Self {
            collaborators,
            transformer,
            options,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// 요청 검증 + 설정 확정 + 템플릿 조회
    ///
    /// Validation / NotFound 에러는 스트림을 열기 전에 동기적으로 반환됩니다.
    pub async fn prepare(&self, request: &QueryRequest) -> Result<PreparedQuery> {
        request.validate()?;

        let settings =
            PipelineSettings::resolve(request, &self.options.defaults, &self.options.llm_model);
        let template = self.load_template(settings.prompt_template_id).await?;

        Ok(PreparedQuery {
            run_id: Uuid::new_v4(),
            query_text: request.query_text.clone(),
            settings,
            template,
        })
    }

    /// 준비 + 실행. 실패는 모두 종료 `error` 이벤트로 변환됩니다.
    pub async fn run(
        &self,
        request: &QueryRequest,
        tx: mpsc::Sender<PipelineEvent>,
        cancel: CancellationToken,
    ) {
        match self.prepare(request).await {
            Ok(prepared) => self.stream(prepared, tx, cancel).await,
            Err(e) => {
                tracing::warn!("Query rejected: {}", e);
                let _ = tx.send(PipelineEvent::Error { message: e.to_string() }).await;
            }
        }
    }

    /// 준비된 질의를 실행하고 종료 이벤트(`done` / `error`)까지 방출
    ///
    /// 취소된 경우 아무 이벤트도 추가로 보내지 않습니다.
    pub async fn stream(
        &self,
        prepared: PreparedQuery,
        tx: mpsc::Sender<PipelineEvent>,
        cancel: CancellationToken,
    ) {
        let span = tracing::info_span!(
            "query",
            run_id = %prepared.run_id,
            mode = %prepared.settings.search_mode,
            strategy = %prepared.settings.query_strategy,
        );

        async move {
            match self.execute(&prepared, &tx, &cancel).await {
                Ok(completion) => {
                    tracing::info!(
                        "Query completed (log #{}, ${:.6})",
                        completion.query_log_id,
                        completion.final_cost_usd
                    );
                    let _ = tx.send(PipelineEvent::Done(completion)).await;
                }
                Err(RagError::Cancelled) => {
                    tracing::info!("Query cancelled");
                }
                Err(e) => {
                    tracing::error!("Query pipeline error: {}", e);
                    let _ = tx.send(PipelineEvent::Error { message: e.to_string() }).await;
                }
            }
        }
        .instrument(span)
        .await
    }

    /// 스트리밍 소비자 없이 끝까지 실행
    pub async fn run_to_completion(&self, request: &QueryRequest) -> Result<QueryOutcome> {
        let prepared = self.prepare(request).await?;
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();

        let run = async move { self.execute(&prepared, &tx, &cancel).await };
        let collect = async move {
            let mut metadata = None;
            while let Some(event) = rx.recv().await {
                if let PipelineEvent::Metadata(m) = event {
                    metadata = Some(m);
                }
            }
            metadata
        };

        let (result, metadata) = tokio::join!(run, collect);
        let completion = result?;
        let metadata = metadata
            .ok_or_else(|| RagError::Pipeline(anyhow::anyhow!("Pipeline finished without metadata")))?;

        Ok(QueryOutcome {
            metadata,
            answer_text: completion.answer_text,
            query_log_id: completion.query_log_id,
            final_cost_usd: completion.final_cost_usd,
        })
    }

    /// 메타데이터와 토큰만 방출하고 종료 정보는 반환
    pub async fn execute(
        &self,
        prepared: &PreparedQuery,
        tx: &mpsc::Sender<PipelineEvent>,
        cancel: &CancellationToken,
    ) -> Result<QueryCompletion> {
        let total_start = Instant::now();
        let settings = &prepared.settings;
        let query = prepared.query_text.as_str();
        let c = &self.collaborators;

        // 1. 질의 변환
        let stage = Instant::now();
        let transformation = until_cancelled(
            cancel,
            self.transformer
                .transform(query, settings.query_strategy, settings.temperature),
        )
        .await?
        .map_err(|e| RagError::collaborator("generation", e))?;
        let transformation_ms = elapsed_ms(stage);
        tracing::debug!(
            "{} ({} search queries)",
            transformation.description,
            transformation.search_queries.len()
        );

        // 2. 임베딩 (질의당 1회)
        let stage = Instant::now();
        let mut embedding_tokens = 0;
        let mut vectors = Vec::new();
        if settings.search_mode.uses_vectors() {
            for q in &transformation.search_queries {
                let (vector, tokens) = until_cancelled(cancel, c.embedder.embed_one(q))
                    .await?
                    .map_err(|e| RagError::collaborator("embedding", e))?;
                vectors.push(vector);
                embedding_tokens += tokens;
            }
        }
        let embedding_ms = elapsed_ms(stage);

        // 3. 검색
        let stage = Instant::now();
        let top_k = settings.retrieval_top_k;
        let document_ids = settings.document_ids.as_deref();
        let queries = &transformation.search_queries;

        let retrieved: Vec<RetrievedChunk> = match settings.search_mode {
            SearchMode::Vector => {
                let hits = until_cancelled(cancel, self.search_vector(&vectors, top_k, document_ids))
                    .await?
                    .map_err(|e| RagError::collaborator("vector store", e))?;
                hits.iter()
                    .enumerate()
                    .map(|(i, hit)| RetrievedChunk::from_vector_hit(hit, i + 1))
                    .collect()
            }
            SearchMode::Bm25 => self
                .search_lexical(queries, top_k, document_ids)
                .iter()
                .enumerate()
                .map(|(i, hit)| RetrievedChunk::from_lexical_hit(hit, i + 1))
                .collect(),
            SearchMode::Hybrid => {
                let (vector_hits, lexical_hits) = tokio::join!(
                    until_cancelled(cancel, self.search_vector(&vectors, top_k, document_ids)),
                    async { self.search_lexical(queries, top_k, document_ids) },
                );
                let vector_hits =
                    vector_hits?.map_err(|e| RagError::collaborator("vector store", e))?;
                fuse(
                    &vector_hits,
                    &lexical_hits,
                    settings.vector_weight,
                    &self.options.rrf,
                )
            }
        };
        let retrieval_ms = elapsed_ms(stage);
        tracing::debug!("Retrieved {} candidate chunks", retrieved.len());

        // 4. 리랭크
        let stage = Instant::now();
        let final_chunks = self.rerank(query, retrieved, settings, cancel).await?;
        let reranking_ms = elapsed_ms(stage);

        // 5. 메타데이터
        let timings = StageTimings {
            transformation_ms,
            embedding_ms,
            retrieval_ms,
            reranking_ms,
        };
        emit(
            tx,
            cancel,
            PipelineEvent::Metadata(PipelineMetadata {
                timings,
                retrieved_chunks: final_chunks.clone(),
                settings: settings.clone(),
                transformed_queries: transformation.search_queries.clone(),
            }),
        )
        .await?;

        // 6. 프롬프트 조립
        let context = assemble_context(&final_chunks);
        let system_prompt = render_prompt(&prepared.template.system_prompt, &context, query);

        // 7. 스트리밍 생성
        let stage = Instant::now();
        let mut stream = until_cancelled(
            cancel,
            c.generator
                .generate_stream(&system_prompt, query, settings.temperature),
        )
        .await?
        .map_err(|e| RagError::collaborator("generation", e))?;

        let mut answer_text = String::new();
        let mut usage = TokenUsage::default();
        while let Some(item) = until_cancelled(cancel, stream.next()).await? {
            match item.map_err(|e| RagError::collaborator("generation", e))? {
                StreamEvent::Token(token) => {
                    answer_text.push_str(&token);
                    emit(tx, cancel, PipelineEvent::Token { token }).await?;
                }
                StreamEvent::Usage(u) => usage = u,
            }
        }
        let generation_ms = elapsed_ms(stage);

        // 8. 비용 계산
        let prompt_tokens = transformation.prompt_tokens + usage.prompt_tokens;
        let completion_tokens = transformation.completion_tokens + usage.completion_tokens;
        let estimated_cost_usd =
            self.options
                .pricing
                .estimate(embedding_tokens, prompt_tokens, completion_tokens);

        // 9. 로그 저장
        let record = QueryLogRecord {
            query_text: query.to_string(),
            answer_text: answer_text.clone(),
            query_strategy: settings.query_strategy,
            search_mode: settings.search_mode,
            reranker_enabled: settings.reranker_enabled,
            temperature: settings.temperature,
            retrieval_top_k: settings.retrieval_top_k,
            reranker_top_n: settings.reranker_top_n,
            llm_model: settings.llm_model.clone(),
            prompt_template_id: Some(prepared.template.id),
            document_ids: settings.document_ids.clone(),
            transformed_queries: transformation.search_queries,
            transformation_ms,
            embedding_ms,
            retrieval_ms,
            reranking_ms,
            generation_ms,
            total_ms: elapsed_ms(total_start),
            embedding_tokens,
            prompt_tokens,
            completion_tokens,
            estimated_cost_usd,
            retrieved_chunks: final_chunks,
        };
        let query_log_id = until_cancelled(cancel, c.query_logs.save(&record))
            .await?
            .map_err(|e| RagError::Pipeline(e.context("Failed to save query log")))?;

        Ok(QueryCompletion {
            answer_text,
            query_log_id,
            final_cost_usd: estimated_cost_usd,
        })
    }

    // ========================================================================
    // Stages
    // ========================================================================

    async fn load_template(&self, id: Option<i64>) -> Result<PromptTemplate> {
        let templates = &self.collaborators.templates;
        match id {
            Some(id) => templates
                .find_template(id)
                .await?
                .ok_or_else(|| RagError::not_found(format!("Prompt template with ID {} not found", id))),
            None => templates
                .default_template()
                .await?
                .ok_or_else(|| RagError::not_found("No default prompt template found")),
        }
    }

    /// 질의 벡터별 검색 후 (문서, 청크) 첫 등장만 남기고 점수 내림차순 정렬
    async fn search_vector(
        &self,
        vectors: &[Vec<f32>],
        top_k: usize,
        document_ids: Option<&[i64]>,
    ) -> anyhow::Result<Vec<VectorHit>> {
        let store = &self.collaborators.vector_store;
        match vectors {
            [] => Ok(Vec::new()),
            [vector] => store.search(vector, top_k, document_ids).await,
            _ => {
                let mut seen: HashSet<ChunkKey> = HashSet::new();
                let mut merged = Vec::new();
                for vector in vectors {
                    for hit in store.search(vector, top_k, document_ids).await? {
                        if seen.insert((hit.document_id, hit.chunk_index)) {
                            merged.push(hit);
                        }
                    }
                }
                merged.sort_by(|a, b| b.score.total_cmp(&a.score));
                merged.truncate(top_k);
                Ok(merged)
            }
        }
    }

    /// 질의별 BM25 검색 후 중복 제거, 문서 필터, 점수 내림차순 정렬
    fn search_lexical(
        &self,
        queries: &[String],
        top_k: usize,
        document_ids: Option<&[i64]>,
    ) -> Vec<LexicalHit> {
        let index = &self.collaborators.lexical_index;
        let mut seen: HashSet<ChunkKey> = HashSet::new();
        let mut merged: Vec<LexicalHit> = queries
            .iter()
            .flat_map(|q| index.search(q, top_k))
            .filter(|hit| seen.insert((hit.document_id, hit.chunk_index)))
            .filter(|hit| document_ids.map_or(true, |ids| ids.contains(&hit.document_id)))
            .collect();

        merged.sort_by(|a, b| b.score.total_cmp(&a.score));
        merged.truncate(top_k);
        merged
    }

    /// 리랭커 순서대로 상위 N개, 비활성화 시 앞에서 N개
    async fn rerank(
        &self,
        query: &str,
        mut retrieved: Vec<RetrievedChunk>,
        settings: &PipelineSettings,
        cancel: &CancellationToken,
    ) -> Result<Vec<RetrievedChunk>> {
        let top_n = settings.reranker_top_n;
        if !settings.reranker_enabled || retrieved.is_empty() {
            retrieved.truncate(top_n);
            return Ok(retrieved);
        }

        let texts: Vec<String> = retrieved.iter().map(|c| c.text.clone()).collect();
        let results = until_cancelled(
            cancel,
            self.collaborators.reranker.rerank(query, &texts, top_n),
        )
        .await?
        .map_err(|e| RagError::collaborator("reranker", e))?;

        Ok(results
            .into_iter()
            .take(top_n)
            .filter_map(|r| {
                retrieved.get(r.index).cloned().map(|mut chunk| {
                    chunk.reranker_score = Some(r.relevance_score);
                    chunk
                })
            })
            .collect())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 취소 토큰과 경쟁
async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RagError::Cancelled),
        output = fut => Ok(output),
    }
}

/// 이벤트 전송. 수신 측이 닫혔으면 실행을 취소합니다.
async fn emit(
    tx: &mpsc::Sender<PipelineEvent>,
    cancel: &CancellationToken,
    event: PipelineEvent,
) -> Result<()> {
    match until_cancelled(cancel, tx.send(event)).await? {
        Ok(()) => Ok(()),
        Err(_) => {
            tracing::debug!("Event receiver closed, cancelling run");
            cancel.cancel();
            Err(RagError::Cancelled)
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// 번호가 붙은 청크 컨텍스트
///
/// `[Chunk 1 | Doc 3, Chunk 0, Page 2]` 헤더 뒤에 본문, 청크 사이는 빈 줄
pub fn assemble_context(chunks: &[RetrievedChunk]) -> String {
    chunks
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let page = c
                .page_number
                .map(|p| format!(", Page {}", p))
                .unwrap_or_default();
            format!(
                "[Chunk {} | Doc {}, Chunk {}{}]\n{}",
                i + 1,
                c.document_id,
                c.chunk_index,
                page,
                c.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// `{{context}}`, `{{query}}` 자리표시자를 각각 첫 번째 위치에서 치환
pub fn render_prompt(template: &str, context: &str, query: &str) -> String {
    template
        .replacen("{{context}}", context, 1)
        .replacen("{{query}}", query, 1)
}

// ============================================================================
// Tests
// ============================================================================
