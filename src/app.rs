//! RagApp - 저장소, 색인, 파이프라인 조립
//!
//! 문서 수집/삭제/재청킹 시 SQLite 저장소, 벡터 저장소, BM25 색인을 함께 갱신합니다.
//! BM25 색인은 이 계층이 호출하는 쪽이며, 색인은 문서 저장소를 알지 못합니다.
//!
//! 시작 시 ready 상태 문서 전체로 BM25 색인을 재구성합니다.

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;

use crate::config::{RagConfig, VectorBackend};
use crate::embedding::{EmbeddingProvider, OpenAiEmbedding};
use crate::error::{RagError, Result};
use crate::generation::{GenerationProvider, OpenAiGeneration};
use crate::knowledge::{
    Bm25Index, Chunk, ChunkConfig, ChunkEngine, ChunkStats, DocumentRecord, DocumentStatus,
    InMemoryVectorStore, IndexStats, KnowledgeStore, LanceVectorStore, NewDocument, PageText,
    StoreStats, VectorPoint, VectorStore,
};
use crate::query::{Collaborators, PipelineOptions, QueryLog, QueryLogPage, QueryPipeline};
use crate::rerank::{JinaReranker, Reranker};

// ============================================================================
// Types
// ============================================================================

/// 외부 API 협력자 (테스트에서는 가짜 구현 주입)
#[derive(Clone)]
pub struct Providers {
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub generator: Arc<dyn GenerationProvider>,
    pub reranker: Arc<dyn Reranker>,
}

impl Providers {
    /// 설정에서 OpenAI / Jina 클라이언트 생성
    pub fn from_config(config: &RagConfig) -> anyhow::Result<Self> {
        Ok(Self {
            embedder: Arc::new(OpenAiEmbedding::from_config(&config.openai)?),
            generator: Arc::new(OpenAiGeneration::from_config(&config.openai)?),
            reranker: Arc::new(JinaReranker::from_config(&config.jina)?),
        })
    }
}

/// 청킹 미리보기
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPreview {
    pub document_id: i64,
    pub config: ChunkConfig,
    pub chunks: Vec<Chunk>,
    pub stats: ChunkStats,
}

/// 전체 상태
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStats {
    pub store: StoreStats,
    pub lexical: IndexStats,
    pub vector_count: usize,
}

// ============================================================================
// RagApp
// ============================================================================

pub struct RagApp {
    config: RagConfig,
    store: Arc<KnowledgeStore>,
    vector_store: Arc<dyn VectorStore>,
    lexical_index: Arc<Bm25Index>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunk_engine: ChunkEngine,
    pipeline: Arc<QueryPipeline>,
}

impl RagApp {
    /// 설정대로 열기 (OpenAI 키 필요)
    pub async fn open(config: RagConfig) -> anyhow::Result<Self> {
        let providers = Providers::from_config(&config)?;
        let vector_store: Arc<dyn VectorStore> = match config.vector_store.backend {
            VectorBackend::Lance => Arc::new(
                LanceVectorStore::open(&config.lance_path(), config.openai.embedding_dimension)
                    .await
                    .context("Failed to open vector store")?,
            ),
            VectorBackend::Memory => {
                tracing::warn!("Using in-memory vector store; vectors are lost on exit");
                Arc::new(InMemoryVectorStore::new())
            }
        };
        Self::with_parts(config, vector_store, providers)
    }

    /// 벡터 저장소와 협력자를 지정해 조립
    pub fn with_parts(
        config: RagConfig,
        vector_store: Arc<dyn VectorStore>,
        providers: Providers,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir).context("Failed to create data directory")?;

        let chunk_engine = ChunkEngine::new(config.chunking.semantic_similarity_threshold);
        let store = Arc::new(
            KnowledgeStore::open(&config.db_path())
                .context("Failed to open knowledge store")?
                .with_chunk_engine(chunk_engine.clone()),
        );

        let lexical_index = Arc::new(Bm25Index::new(config.bm25_params()));
        let indexed = lexical_index.rebuild_from_source(store.as_ref())?;
        tracing::info!("BM25 index bootstrapped from {} ready documents", indexed);

        let collaborators = Collaborators {
            embedder: providers.embedder.clone(),
            vector_store: vector_store.clone(),
            lexical_index: lexical_index.clone(),
            reranker: providers.reranker,
            generator: providers.generator,
            templates: store.clone(),
            query_logs: store.clone(),
        };
        let options = PipelineOptions {
            defaults: config.pipeline_defaults(),
            rrf: config.rrf_params(),
            pricing: config.pricing.clone(),
            llm_model: config.openai.llm_model.clone(),
        };

        Ok(Self {
            pipeline: Arc::new(QueryPipeline::new(collaborators, options)),
            config,
            store,
            vector_store,
            lexical_index,
            embedder: providers.embedder,
            chunk_engine,
        })
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn pipeline(&self) -> Arc<QueryPipeline> {
        self.pipeline.clone()
    }

    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }

    pub fn lexical_index(&self) -> &Bm25Index {
        &self.lexical_index
    }

    // ========================================================================
    // Documents
    // ========================================================================

    /// 문서 수집: pending → processing → (청킹, 임베딩, 색인) → ready
    ///
    /// 실패하면 error 상태와 메시지를 기록한 뒤 에러를 반환합니다.
    pub async fn ingest(
        &self,
        filename: &str,
        pages: Vec<PageText>,
        chunk_config: Option<ChunkConfig>,
    ) -> Result<DocumentRecord> {
        let chunk_config = chunk_config.unwrap_or_else(|| self.config.default_chunk_config());
        chunk_config.validate()?;

        let id = self.store.create_document(&NewDocument {
            filename: filename.to_string(),
            pages,
            chunk_config,
        })?;

        self.process(id, &chunk_config).await?;
        self.document(id)
    }

    /// 청킹 설정을 바꿔 벡터와 BM25 항목을 통째로 교체
    pub async fn rechunk(&self, id: i64, chunk_config: ChunkConfig) -> Result<DocumentRecord> {
        chunk_config.validate()?;
        self.document(id)?;

        self.process(id, &chunk_config).await?;
        self.document(id)
    }

    /// 색인에 손대지 않고 청킹 결과만 확인 (ready 문서만)
    pub fn preview_chunks(&self, id: i64, chunk_config: Option<ChunkConfig>) -> Result<ChunkPreview> {
        let doc = self.document(id)?;
        ensure_ready(&doc)?;
        let config = chunk_config.unwrap_or_else(|| doc.chunk_config());
        config.validate()?;

        let pages = self.store.document_pages(id)?;
        let chunks = self.chunk_engine.chunk(&pages, &config);
        let stats = ChunkStats::from_chunks(&chunks);

        Ok(ChunkPreview {
            document_id: id,
            config,
            chunks,
            stats,
        })
    }

    /// 벡터, BM25 항목, 저장소 행 삭제
    pub async fn remove(&self, id: i64) -> Result<()> {
        self.document(id)?;

        let removed = self
            .vector_store
            .delete_by_document(id)
            .await
            .map_err(|e| RagError::collaborator("vector store", e))?;
        self.lexical_index.remove_document(id);
        self.store.delete_document(id)?;

        tracing::info!("Removed document #{} ({} vectors)", id, removed);
        Ok(())
    }

    pub fn document(&self, id: i64) -> Result<DocumentRecord> {
        self.store
            .get_document(id)?
            .ok_or_else(|| RagError::not_found(format!("Document with ID {} not found", id)))
    }

    pub fn documents(&self) -> Result<Vec<DocumentRecord>> {
        Ok(self.store.list_documents()?)
    }

    // ========================================================================
    // Query Logs
    // ========================================================================

    pub fn query_log(&self, id: i64) -> Result<QueryLog> {
        self.store
            .get_query_log(id)?
            .ok_or_else(|| RagError::not_found(format!("Query log with ID {} not found", id)))
    }

    pub fn query_logs(&self, page: usize, limit: usize) -> Result<QueryLogPage> {
        Ok(self.store.list_query_logs(page, limit)?)
    }

    pub async fn stats(&self) -> Result<AppStats> {
        Ok(AppStats {
            store: self.store.stats()?,
            lexical: self.lexical_index.stats(),
            vector_count: self
                .vector_store
                .count()
                .await
                .map_err(|e| RagError::collaborator("vector store", e))?,
        })
    }

    // ========================================================================
    // Indexing
    // ========================================================================

    async fn process(&self, id: i64, chunk_config: &ChunkConfig) -> Result<()> {
        self.store.set_status(id, DocumentStatus::Processing, None)?;

        match self.index_document(id, chunk_config).await {
            Ok(count) => {
                self.store.mark_ready(id, chunk_config, count)?;
                tracing::info!(
                    "Indexed document #{} ({} chunks, {})",
                    id,
                    count,
                    chunk_config.strategy
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!("Indexing document #{} failed: {}", id, e);
                // error 문서는 어느 검색 모드에도 남지 않음
                self.lexical_index.remove_document(id);
                if let Err(cleanup) = self.vector_store.delete_by_document(id).await {
                    tracing::warn!("Failed to drop vectors of document #{}: {:#}", id, cleanup);
                }
                self.store
                    .set_status(id, DocumentStatus::Error, Some(&e.to_string()))?;
                Err(e)
            }
        }
    }

    async fn index_document(&self, id: i64, chunk_config: &ChunkConfig) -> Result<usize> {
        let pages = self.store.document_pages(id)?;
        let chunks = self.chunk_engine.chunk(&pages, chunk_config);

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = if texts.is_empty() {
            Vec::new()
        } else {
            self.embedder
                .embed(&texts)
                .await
                .map_err(|e| RagError::collaborator("embedding", e))?
                .vectors
        };
        if embeddings.len() != chunks.len() {
            return Err(RagError::collaborator(
                "embedding",
                anyhow::anyhow!(
                    "expected {} vectors, got {}",
                    chunks.len(),
                    embeddings.len()
                ),
            ));
        }

        let points: Vec<VectorPoint> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, vector)| VectorPoint {
                document_id: id,
                chunk_index: chunk.chunk_index,
                page_number: chunk.page_number,
                chunk_strategy: chunk_config.strategy,
                text: chunk.text.clone(),
                vector,
            })
            .collect();

        self.vector_store
            .delete_by_document(id)
            .await
            .map_err(|e| RagError::collaborator("vector store", e))?;
        if !points.is_empty() {
            self.vector_store
                .upsert(&points)
                .await
                .map_err(|e| RagError::collaborator("vector store", e))?;
        }
        self.lexical_index.add_document(id, &chunks);

        Ok(chunks.len())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn ensure_ready(doc: &DocumentRecord) -> Result<()> {
    if doc.status != DocumentStatus::Ready {
        return Err(RagError::validation(format!(
            "Document #{} is not ready (status: {})",
            doc.id,
            doc.status.as_str()
        )));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{ChunkSource, ChunkStrategy};
    use crate::query::{PipelineEvent, QueryRequest, QueryStrategy, SearchMode};
    use crate::testing::{python_pages, rust_pages, Fixture, HashingEmbedder, ANSWER_TOKENS};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn fixed(size: usize) -> ChunkConfig {
        ChunkConfig::new(ChunkStrategy::Fixed, size, 0)
    }

    async fn seeded() -> (Fixture, i64, i64) {
        let fx = Fixture::new();
        let rust = fx.app.ingest("rust.pdf", rust_pages(), Some(fixed(20))).await.unwrap();
        let python = fx
            .app
            .ingest("python.pdf", python_pages(), Some(fixed(20)))
            .await
            .unwrap();
        (fx, rust.id, python.id)
    }

    fn request(query: &str, mode: SearchMode) -> QueryRequest {
        QueryRequest {
            search_mode: Some(mode),
            query_strategy: Some(QueryStrategy::Direct),
            reranker_enabled: Some(false),
            retrieval_top_k: Some(10),
            reranker_top_n: Some(3),
            ..QueryRequest::new(query)
        }
    }

    async fn collect_events(app: &RagApp, request: &QueryRequest) -> Vec<PipelineEvent> {
        let (tx, mut rx) = mpsc::channel(64);
        let pipeline = app.pipeline();
        let run = pipeline.run(request, tx, CancellationToken::new());
        let collect = async {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            events
        };
        let ((), events) = tokio::join!(run, collect);
        events
    }

    // ------------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_ingest_indexes_vectors_and_keywords() {
        let fx = Fixture::new();
        let doc = fx.app.ingest("rust.pdf", rust_pages(), Some(fixed(20))).await.unwrap();

        assert_eq!(doc.status, DocumentStatus::Ready);
        assert_eq!(doc.page_count, 3);
        assert_eq!(doc.chunk_count, 3);
        assert_eq!(doc.chunk_strategy, ChunkStrategy::Fixed);

        let stats = fx.app.stats().await.unwrap();
        assert_eq!(stats.vector_count, 3);
        assert_eq!(stats.lexical.documents, 1);
        assert_eq!(stats.lexical.total_chunks, 3);
        assert_eq!(stats.store.ready_documents, 1);

        let hits = fx.app.lexical_index().search("borrow", 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_index, 1);
        assert_eq!(hits[0].page_number, Some(2));
    }

    #[tokio::test]
    async fn test_ingest_rejects_invalid_chunk_config() {
        let fx = Fixture::new();
        let err = fx
            .app
            .ingest("bad.pdf", rust_pages(), Some(ChunkConfig::new(ChunkStrategy::Fixed, 10, 10)))
            .await
            .unwrap_err();

        assert!(matches!(err, RagError::Validation(_)));
        assert!(fx.app.documents().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ingest_failure_marks_error() {
        let fx = Fixture::with_embedder(HashingEmbedder::failing());
        let err = fx
            .app
            .ingest("rust.pdf", rust_pages(), Some(fixed(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Collaborator { service: "embedding", .. }));

        let docs = fx.app.documents().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].status, DocumentStatus::Error);
        assert!(docs[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("embedding service unavailable"));
        assert_eq!(fx.app.lexical_index().stats().documents, 0);
    }

    #[tokio::test]
    async fn test_rechunk_replaces_entries() {
        let (fx, rust_id, _) = seeded().await;
        assert_eq!(fx.app.stats().await.unwrap().vector_count, 5);

        let doc = fx.app.rechunk(rust_id, fixed(100)).await.unwrap();
        assert_eq!(doc.chunk_count, 1);
        assert_eq!(doc.chunk_size, 100);

        let stats = fx.app.stats().await.unwrap();
        assert_eq!(stats.vector_count, 3);
        assert_eq!(stats.lexical.total_chunks, 3);

        let hits = fx.app.lexical_index().search("tokio", 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_index, 0);
    }

    #[tokio::test]
    async fn test_failed_rechunk_drops_index_entries() {
        let (fx, rust_id, python_id) = seeded().await;
        fx.embedder.set_failing(true);

        let err = fx.app.rechunk(rust_id, fixed(100)).await.unwrap_err();
        assert!(matches!(err, RagError::Collaborator { service: "embedding", .. }));
        assert_eq!(fx.app.document(rust_id).unwrap().status, DocumentStatus::Error);

        assert!(!fx.app.lexical_index().contains(rust_id));
        assert!(fx.app.lexical_index().search("rust", 5).is_empty());
        assert!(fx.app.lexical_index().contains(python_id));
        assert_eq!(fx.app.stats().await.unwrap().vector_count, 2);
    }

    #[tokio::test]
    async fn test_preview_requires_ready_document() {
        let fx = Fixture::with_embedder(HashingEmbedder::failing());
        assert!(fx.app.ingest("rust.pdf", rust_pages(), Some(fixed(20))).await.is_err());
        let id = fx.app.documents().unwrap()[0].id;

        let err = fx.app.preview_chunks(id, None).unwrap_err();
        assert!(matches!(err, RagError::Validation(_)));
        assert!(err.to_string().contains("not ready (status: error)"));
    }

    #[tokio::test]
    async fn test_preview_does_not_touch_index() {
        let (fx, rust_id, _) = seeded().await;

        let preview = fx.app.preview_chunks(rust_id, Some(fixed(100))).unwrap();
        assert_eq!(preview.chunks.len(), 1);
        assert_eq!(preview.stats.count, 1);

        let stored = fx.app.preview_chunks(rust_id, None).unwrap();
        assert_eq!(stored.config, fixed(20));
        assert_eq!(stored.chunks.len(), 3);

        assert_eq!(fx.app.document(rust_id).unwrap().chunk_count, 3);
        assert_eq!(fx.app.stats().await.unwrap().lexical.total_chunks, 5);
    }

    #[tokio::test]
    async fn test_remove_document() {
        let (fx, rust_id, python_id) = seeded().await;

        fx.app.remove(rust_id).await.unwrap();

        assert!(matches!(fx.app.document(rust_id), Err(RagError::NotFound(_))));
        assert!(fx.app.lexical_index().search("rust", 5).is_empty());
        assert_eq!(fx.app.stats().await.unwrap().vector_count, 2);
        assert!(fx.app.document(python_id).is_ok());

        assert!(matches!(fx.app.remove(rust_id).await, Err(RagError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_lexical_index_bootstraps_on_open() {
        let (fx, _, _) = seeded().await;
        let fx = fx.reopen();

        let stats = fx.app.lexical_index().stats();
        assert_eq!(stats.documents, 2);
        assert_eq!(stats.total_chunks, 5);
        assert_eq!(fx.app.lexical_index().search("serde", 5).len(), 1);
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_hybrid_query_streams_in_order() {
        let (fx, rust_id, _) = seeded().await;
        let events = collect_events(&fx.app, &request("rust ownership", SearchMode::Hybrid)).await;

        assert!(matches!(events.first(), Some(PipelineEvent::Metadata(_))));
        assert!(matches!(events.last(), Some(PipelineEvent::Done(_))));
        assert_eq!(events.len(), ANSWER_TOKENS.len() + 2);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        let PipelineEvent::Metadata(metadata) = &events[0] else {
            unreachable!()
        };
        assert_eq!(metadata.retrieved_chunks.len(), 3);
        assert_eq!(metadata.transformed_queries, vec!["rust ownership".to_string()]);

        let top = &metadata.retrieved_chunks[0];
        assert_eq!((top.document_id, top.chunk_index), (rust_id, 0));
        assert_eq!(top.source, ChunkSource::Both);
        assert!(top.rrf_score.is_some());

        let tokens: String = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Token { token } => Some(token.as_str()),
                _ => None,
            })
            .collect();
        let PipelineEvent::Done(done) = events.last().unwrap() else {
            unreachable!()
        };
        assert_eq!(tokens, done.answer_text);
        assert_eq!(done.answer_text, ANSWER_TOKENS.concat());

        let log = fx.app.query_log(done.query_log_id).unwrap();
        assert_eq!(log.record.answer_text, done.answer_text);
        assert_eq!(log.record.search_mode, SearchMode::Hybrid);
        let logged: Vec<_> = log.record.retrieved_chunks.iter().map(|c| c.key()).collect();
        let streamed: Vec<_> = metadata.retrieved_chunks.iter().map(|c| c.key()).collect();
        assert_eq!(logged, streamed);
        assert_eq!(log.record.prompt_tokens, 100);
        assert_eq!(log.record.completion_tokens, 20);
        assert!(log.record.embedding_tokens > 0);
        assert!((log.record.estimated_cost_usd - done.final_cost_usd).abs() < 1e-12);

        let default_id = fx.app.store().default_prompt_template().unwrap().unwrap().id;
        assert_eq!(log.record.prompt_template_id, Some(default_id));

        let prompt = fx.generator.last_system_prompt().unwrap();
        assert!(prompt.contains(&format!("[Chunk 1 | Doc {}, Chunk 0, Page 1]\nrust ownership rule", rust_id)));
        assert!(!prompt.contains("{{context}}"));
    }

    #[tokio::test]
    async fn test_bm25_query_skips_embedding() {
        let (fx, rust_id, _) = seeded().await;
        let before = fx.embedder.calls();

        let outcome = fx
            .app
            .pipeline()
            .run_to_completion(&request("borrow checker", SearchMode::Bm25))
            .await
            .unwrap();

        assert_eq!(fx.embedder.calls(), before);
        let chunks = &outcome.metadata.retrieved_chunks;
        assert_eq!(chunks.len(), 1);
        assert_eq!((chunks[0].document_id, chunks[0].chunk_index), (rust_id, 1));
        assert_eq!(chunks[0].source, ChunkSource::Bm25);
        assert_eq!(chunks[0].bm25_rank, Some(1));
        assert_eq!(outcome.metadata.timings.embedding_ms, 0);
    }

    #[tokio::test]
    async fn test_vector_query_filters_documents() {
        let (fx, _, python_id) = seeded().await;
        let request = QueryRequest {
            document_ids: Some(vec![python_id]),
            ..request("json encoding", SearchMode::Vector)
        };

        let outcome = fx.app.pipeline().run_to_completion(&request).await.unwrap();

        let chunks = &outcome.metadata.retrieved_chunks;
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.document_id == python_id));
        assert!(chunks.iter().all(|c| c.source == ChunkSource::Vector));
        assert_eq!(chunks[0].chunk_index, 1);
        assert_eq!(chunks[0].vector_rank, Some(1));
    }

    #[tokio::test]
    async fn test_bm25_query_filters_documents() {
        let (fx, _, python_id) = seeded().await;
        let request = QueryRequest {
            document_ids: Some(vec![python_id]),
            ..request("rust python serde", SearchMode::Bm25)
        };

        let outcome = fx.app.pipeline().run_to_completion(&request).await.unwrap();

        let chunks = &outcome.metadata.retrieved_chunks;
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.document_id == python_id));
        assert!(chunks.iter().all(|c| c.source == ChunkSource::Bm25));
    }

    #[tokio::test]
    async fn test_hybrid_query_filters_documents() {
        let (fx, _, python_id) = seeded().await;
        let request = QueryRequest {
            document_ids: Some(vec![python_id]),
            ..request("rust python serde", SearchMode::Hybrid)
        };

        let outcome = fx.app.pipeline().run_to_completion(&request).await.unwrap();

        let chunks = &outcome.metadata.retrieved_chunks;
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.document_id == python_id));
        assert!(chunks.iter().all(|c| c.source == ChunkSource::Both));
    }

    #[tokio::test]
    async fn test_vector_multi_query_merges_hits() {
        let (fx, rust_id, _) = seeded().await;
        let request = QueryRequest {
            query_strategy: Some(QueryStrategy::MultiQuery),
            retrieval_top_k: Some(4),
            reranker_top_n: Some(10),
            ..request("rust ownership", SearchMode::Vector)
        };

        let outcome = fx.app.pipeline().run_to_completion(&request).await.unwrap();

        assert_eq!(outcome.metadata.transformed_queries.len(), 2);
        let chunks = &outcome.metadata.retrieved_chunks;
        assert_eq!(chunks.len(), 4);

        let keys: std::collections::HashSet<_> = chunks.iter().map(|c| c.key()).collect();
        assert_eq!(keys.len(), chunks.len());
        assert!(chunks
            .windows(2)
            .all(|w| w[0].vector_score >= w[1].vector_score));
        assert_eq!(chunks[0].key(), (rust_id, 0));
        let ranks: Vec<_> = chunks.iter().map(|c| c.vector_rank).collect();
        assert_eq!(ranks, vec![Some(1), Some(2), Some(3), Some(4)]);
    }

    #[tokio::test]
    async fn test_reranker_orders_and_limits() {
        let (fx, _, _) = seeded().await;
        let request = QueryRequest {
            reranker_enabled: Some(true),
            reranker_top_n: Some(2),
            ..request("rust ownership", SearchMode::Hybrid)
        };

        let outcome = fx.app.pipeline().run_to_completion(&request).await.unwrap();

        let chunks = &outcome.metadata.retrieved_chunks;
        assert_eq!(chunks.len(), 2);
        assert_eq!(fx.reranker.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(chunks.iter().all(|c| c.reranker_score.is_some()));
        assert!(chunks[0].reranker_score >= chunks[1].reranker_score);
    }

    #[tokio::test]
    async fn test_multi_query_transformation() {
        let (fx, _, _) = seeded().await;
        let request = QueryRequest {
            query_strategy: Some(QueryStrategy::MultiQuery),
            ..request("rust ownership", SearchMode::Hybrid)
        };

        let outcome = fx.app.pipeline().run_to_completion(&request).await.unwrap();

        let queries = &outcome.metadata.transformed_queries;
        assert_eq!(queries[0], "rust ownership");
        assert!(queries.contains(&"rust ownership rules".to_string()));

        let log = fx.app.query_log(outcome.query_log_id).unwrap();
        assert_eq!(log.record.query_strategy, QueryStrategy::MultiQuery);
        assert_eq!(log.record.prompt_tokens, 110);
        assert_eq!(log.record.completion_tokens, 25);
    }

    #[tokio::test]
    async fn test_custom_prompt_template() {
        let (fx, _, _) = seeded().await;
        let template_id = fx
            .app
            .store()
            .add_prompt_template("Terse", "Context:\n{{context}}\nQuestion: {{query}}", None, false)
            .unwrap();
        let request = QueryRequest {
            prompt_template_id: Some(template_id),
            ..request("rust ownership", SearchMode::Bm25)
        };

        let outcome = fx.app.pipeline().run_to_completion(&request).await.unwrap();

        let prompt = fx.generator.last_system_prompt().unwrap();
        assert!(prompt.starts_with("Context:\n[Chunk 1 | Doc"));
        assert!(prompt.ends_with("Question: rust ownership"));
        let log = fx.app.query_log(outcome.query_log_id).unwrap();
        assert_eq!(log.record.prompt_template_id, Some(template_id));
    }

    #[tokio::test]
    async fn test_missing_template_emits_single_error() {
        let (fx, _, _) = seeded().await;
        let request = QueryRequest {
            prompt_template_id: Some(999),
            ..request("rust", SearchMode::Hybrid)
        };

        let events = collect_events(&fx.app, &request).await;

        assert_eq!(
            events,
            vec![PipelineEvent::Error {
                message: "Prompt template with ID 999 not found".to_string()
            }]
        );
        assert_eq!(fx.app.query_logs(1, 10).unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_before_streaming() {
        let (fx, _, _) = seeded().await;
        let request = QueryRequest {
            retrieval_top_k: Some(0),
            ..request("rust", SearchMode::Hybrid)
        };

        let err = fx.app.pipeline().prepare(&request).await.unwrap_err();
        assert!(matches!(err, RagError::Validation(_)));

        let blank = fx.app.pipeline().prepare(&QueryRequest::new("   ")).await.unwrap_err();
        assert!(matches!(blank, RagError::Validation(_)));
    }

    #[tokio::test]
    async fn test_disconnected_consumer_cancels_run() {
        let (fx, _, _) = seeded().await;
        let pipeline = fx.app.pipeline();
        let prepared = pipeline
            .prepare(&request("rust ownership", SearchMode::Hybrid))
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(64);
        drop(rx);
        let cancel = CancellationToken::new();
        pipeline.stream(prepared, tx, cancel.clone()).await;

        assert!(cancel.is_cancelled());
        assert!(fx.generator.last_system_prompt().is_none());
        assert_eq!(fx.app.query_logs(1, 10).unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_query_logs_newest_first() {
        let (fx, _, _) = seeded().await;
        let pipeline = fx.app.pipeline();
        let first = pipeline
            .run_to_completion(&request("rust", SearchMode::Bm25))
            .await
            .unwrap();
        let second = pipeline
            .run_to_completion(&request("python", SearchMode::Bm25))
            .await
            .unwrap();

        let page = fx.app.query_logs(1, 1).unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, second.query_log_id);

        let page = fx.app.query_logs(2, 1).unwrap();
        assert_eq!(page.items[0].id, first.query_log_id);

        assert!(matches!(fx.app.query_log(999), Err(RagError::NotFound(_))));
    }
}
