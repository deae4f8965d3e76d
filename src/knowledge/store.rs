//! Knowledge Store - rusqlite 기반 동기 저장소
//!
//! 문서(페이지 원문 + 청킹 설정 + 상태), 프롬프트 템플릿, 질의 로그를 저장합니다.
//! 저장 위치: `<data_dir>/prorag.db`
//!
//! 렉시컬 인덱스 부트스트랩(`DocumentSource`), 프롬프트 템플릿 조회, 질의 로그 기록을
//! 이 저장소가 구현합니다.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::RagError;
use crate::query::{
    PromptTemplate, PromptTemplateStore, QueryLog, QueryLogPage, QueryLogRecord, QueryLogSink,
    QueryLogSummary,
};

use super::bm25::DocumentSource;
use super::chunker::{Chunk, ChunkConfig, ChunkEngine, ChunkStrategy, PageText};

/// 기본 프롬프트 템플릿 이름
pub const DEFAULT_TEMPLATE_NAME: &str = "Default RAG Template";

/// 기본 프롬프트 템플릿
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant answering questions based on document context.

Context:
{{context}}

Question: {{query}}

Answer based only on the provided context. If the context does not contain enough information to answer the question, say so clearly.";

// ============================================================================
// Types
// ============================================================================

/// 문서 처리 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Ready,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

impl FromStr for DocumentStatus {
    type Err = RagError;

    fn from_str(s: &str) -> std::result::Result<Self, RagError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "ready" => Ok(Self::Ready),
            "error" => Ok(Self::Error),
            other => Err(RagError::validation(format!("unknown document status '{}'", other))),
        }
    }
}

/// 저장된 문서
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub id: i64,
    pub filename: String,
    pub page_count: usize,
    pub chunk_count: usize,
    pub chunk_strategy: ChunkStrategy,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub status: DocumentStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    pub fn chunk_config(&self) -> ChunkConfig {
        ChunkConfig::new(self.chunk_strategy, self.chunk_size, self.chunk_overlap)
    }
}

/// 새 문서 입력
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub filename: String,
    pub pages: Vec<PageText>,
    pub chunk_config: ChunkConfig,
}

/// 저장소 통계
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub document_count: usize,
    pub ready_documents: usize,
    pub page_count: usize,
    pub query_log_count: usize,
    pub db_path: PathBuf,
}

// ============================================================================
// KnowledgeStore
// ============================================================================

/// SQLite 저장소
pub struct KnowledgeStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
    chunk_engine: ChunkEngine,
}

impl KnowledgeStore {
    /// 저장소 열기 (없으면 생성)
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open SQLite database")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
            chunk_engine: ChunkEngine::default(),
        };

        store.initialize()?;
        Ok(store)
    }

    /// 부트스트랩 재청킹에 사용할 엔진 지정
    pub fn with_chunk_engine(mut self, engine: ChunkEngine) -> Self {
        self.chunk_engine = engine;
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    /// 스키마 초기화 + 기본 템플릿 시드
    fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL,
                page_count INTEGER NOT NULL DEFAULT 0,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                chunk_strategy TEXT NOT NULL,
                chunk_size INTEGER NOT NULL,
                chunk_overlap INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status);

            CREATE TABLE IF NOT EXISTS document_pages (
                document_id INTEGER NOT NULL,
                page_number INTEGER NOT NULL,
                text TEXT NOT NULL,
                PRIMARY KEY (document_id, page_number)
            );

            CREATE TABLE IF NOT EXISTS prompt_templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                system_prompt TEXT NOT NULL,
                description TEXT,
                is_default INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS query_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                query_text TEXT NOT NULL,
                search_mode TEXT NOT NULL,
                query_strategy TEXT NOT NULL,
                total_ms INTEGER NOT NULL,
                estimated_cost_usd REAL NOT NULL,
                record TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create schema")?;

        let has_default: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM prompt_templates WHERE is_default = 1)",
                [],
                |row| row.get(0),
            )
            .context("Failed to check default prompt template")?;

        if !has_default {
            conn.execute(
                "INSERT INTO prompt_templates (name, system_prompt, description, is_default, created_at)
                 VALUES (?1, ?2, ?3, 1, ?4)",
                params![
                    DEFAULT_TEMPLATE_NAME,
                    DEFAULT_SYSTEM_PROMPT,
                    "Default RAG prompt template with context and query placeholders",
                    Utc::now().to_rfc3339()
                ],
            )
            .context("Failed to seed default prompt template")?;
            tracing::info!("Default prompt template seeded");
        }

        tracing::debug!("Knowledge store initialized at {:?}", self.db_path);
        Ok(())
    }

    // ========================================================================
    // Documents
    // ========================================================================

    /// 문서 + 페이지 저장 (상태: pending)
    pub fn create_document(&self, doc: &NewDocument) -> Result<i64> {
        let mut conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        let tx = conn.transaction().context("Failed to begin transaction")?;

        tx.execute(
            "INSERT INTO documents
                (filename, page_count, chunk_strategy, chunk_size, chunk_overlap, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6)",
            params![
                doc.filename,
                doc.pages.len() as i64,
                doc.chunk_config.strategy.as_str(),
                doc.chunk_config.chunk_size as i64,
                doc.chunk_config.chunk_overlap as i64,
                now
            ],
        )
        .context("Failed to insert document")?;
        let id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO document_pages (document_id, page_number, text) VALUES (?1, ?2, ?3)",
            )?;
            for page in &doc.pages {
                stmt.execute(params![id, page.page_number, page.text])
                    .context("Failed to insert document page")?;
            }
        }

        tx.commit().context("Failed to commit document")?;
        tracing::info!("Stored document: {} (id={}, pages={})", doc.filename, id, doc.pages.len());
        Ok(id)
    }

    /// 상태 변경
    pub fn set_status(&self, id: i64, status: DocumentStatus, error: Option<&str>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE documents SET status = ?1, error_message = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.as_str(), error, Utc::now().to_rfc3339(), id],
        )
        .context("Failed to update document status")?;
        Ok(())
    }

    /// 색인 완료 처리 (청킹 설정 갱신 + ready)
    pub fn mark_ready(&self, id: i64, config: &ChunkConfig, chunk_count: usize) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE documents
             SET chunk_strategy = ?1, chunk_size = ?2, chunk_overlap = ?3, chunk_count = ?4,
                 status = 'ready', error_message = NULL, updated_at = ?5
             WHERE id = ?6",
            params![
                config.strategy.as_str(),
                config.chunk_size as i64,
                config.chunk_overlap as i64,
                chunk_count as i64,
                Utc::now().to_rfc3339(),
                id
            ],
        )
        .context("Failed to mark document ready")?;
        Ok(())
    }

    pub fn get_document(&self, id: i64) -> Result<Option<DocumentRecord>> {
        let conn = self.lock()?;
        let doc = conn
            .query_row(
                &format!("SELECT {} FROM documents WHERE id = ?1", DOCUMENT_COLUMNS),
                params![id],
                row_to_document,
            )
            .optional()
            .context("Failed to load document")?;
        Ok(doc)
    }

    /// 최신순 문서 목록
    pub fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM documents ORDER BY created_at DESC, id DESC",
            DOCUMENT_COLUMNS
        ))?;
        let docs = stmt
            .query_map([], row_to_document)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list documents")?;
        Ok(docs)
    }

    /// 페이지 원문 (페이지 번호 순)
    pub fn document_pages(&self, id: i64) -> Result<Vec<PageText>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT page_number, text FROM document_pages WHERE document_id = ?1 ORDER BY page_number",
        )?;
        let pages = stmt
            .query_map(params![id], |row| {
                Ok(PageText {
                    page_number: row.get(0)?,
                    text: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load document pages")?;
        Ok(pages)
    }

    /// 문서와 페이지 삭제
    pub fn delete_document(&self, id: i64) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM document_pages WHERE document_id = ?1", params![id])?;
        let rows = tx.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
        tx.commit().context("Failed to delete document")?;
        Ok(rows > 0)
    }

    // ========================================================================
    // Prompt Templates
    // ========================================================================

    pub fn get_prompt_template(&self, id: i64) -> Result<Option<PromptTemplate>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, system_prompt, description, is_default FROM prompt_templates WHERE id = ?1",
            params![id],
            row_to_template,
        )
        .optional()
        .context("Failed to load prompt template")
    }

    pub fn default_prompt_template(&self) -> Result<Option<PromptTemplate>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, system_prompt, description, is_default FROM prompt_templates
             WHERE is_default = 1 ORDER BY id LIMIT 1",
            [],
            row_to_template,
        )
        .optional()
        .context("Failed to load default prompt template")
    }

    /// 템플릿 추가 (기본 템플릿으로 지정하면 기존 기본값 해제)
    pub fn add_prompt_template(
        &self,
        name: &str,
        system_prompt: &str,
        description: Option<&str>,
        is_default: bool,
    ) -> Result<i64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if is_default {
            tx.execute("UPDATE prompt_templates SET is_default = 0", [])?;
        }
        tx.execute(
            "INSERT INTO prompt_templates (name, system_prompt, description, is_default, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, system_prompt, description, is_default, Utc::now().to_rfc3339()],
        )
        .context("Failed to insert prompt template")?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    // ========================================================================
    // Query Logs
    // ========================================================================

    pub fn insert_query_log(&self, record: &QueryLogRecord) -> Result<i64> {
        let conn = self.lock()?;
        let json = serde_json::to_string(record).context("Failed to serialize query log")?;

        conn.execute(
            "INSERT INTO query_logs
                (query_text, search_mode, query_strategy, total_ms, estimated_cost_usd, record, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.query_text,
                record.search_mode.as_str(),
                record.query_strategy.as_str(),
                record.total_ms as i64,
                record.estimated_cost_usd,
                json,
                Utc::now().to_rfc3339()
            ],
        )
        .context("Failed to insert query log")?;

        Ok(conn.last_insert_rowid())
    }

    pub fn get_query_log(&self, id: i64) -> Result<Option<QueryLog>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, record, created_at FROM query_logs WHERE id = ?1",
            params![id],
            |row| {
                Ok(QueryLog {
                    id: row.get(0)?,
                    record: parse_json(1, row.get(1)?)?,
                    created_at: parse_datetime(row.get::<_, String>(2)?),
                })
            },
        )
        .optional()
        .context("Failed to load query log")
    }

    /// 최신순 질의 로그 (page는 1부터)
    pub fn list_query_logs(&self, page: usize, limit: usize) -> Result<QueryLogPage> {
        let page = page.max(1);
        let limit = limit.clamp(1, 100);
        let offset = i64::try_from(page.saturating_sub(1).saturating_mul(limit)).unwrap_or(i64::MAX);
        let conn = self.lock()?;

        let total: i64 = conn.query_row("SELECT COUNT(*) FROM query_logs", [], |row| row.get(0))?;

        let mut stmt = conn.prepare(
            "SELECT id, query_text, search_mode, query_strategy, total_ms, estimated_cost_usd, created_at
             FROM query_logs ORDER BY id DESC LIMIT ?1 OFFSET ?2",
        )?;
        let items = stmt
            .query_map(params![limit as i64, offset], |row| {
                Ok(QueryLogSummary {
                    id: row.get(0)?,
                    query_text: row.get(1)?,
                    search_mode: parse_column(2, row.get(2)?)?,
                    query_strategy: parse_column(3, row.get(3)?)?,
                    total_ms: row.get::<_, i64>(4)? as u64,
                    estimated_cost_usd: row.get(5)?,
                    created_at: parse_datetime(row.get::<_, String>(6)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list query logs")?;

        Ok(QueryLogPage {
            items,
            total: total as usize,
            page,
            limit,
        })
    }

    // ========================================================================
    // Stats
    // ========================================================================

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;
        let count = |sql: &str| -> Result<usize> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };

        Ok(StoreStats {
            document_count: count("SELECT COUNT(*) FROM documents")?,
            ready_documents: count("SELECT COUNT(*) FROM documents WHERE status = 'ready'")?,
            page_count: count("SELECT COUNT(*) FROM document_pages")?,
            query_log_count: count("SELECT COUNT(*) FROM query_logs")?,
            db_path: self.db_path.clone(),
        })
    }
}

// ============================================================================
// Collaborator Implementations
// ============================================================================

impl DocumentSource for KnowledgeStore {
    fn ready_document_ids(&self) -> Result<Vec<i64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id FROM documents WHERE status = 'ready' ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// 저장된 페이지를 문서의 청킹 설정으로 다시 분할
    fn document_chunks(&self, document_id: i64) -> Result<Vec<Chunk>> {
        let doc = self
            .get_document(document_id)?
            .ok_or_else(|| anyhow::anyhow!("Document #{} not found", document_id))?;
        if doc.status != DocumentStatus::Ready {
            anyhow::bail!(
                "Document #{} is not ready (status: {})",
                document_id,
                doc.status.as_str()
            );
        }

        let pages = self.document_pages(document_id)?;
        Ok(self.chunk_engine.chunk(&pages, &doc.chunk_config()))
    }
}

#[async_trait]
impl PromptTemplateStore for KnowledgeStore {
    async fn find_template(&self, id: i64) -> Result<Option<PromptTemplate>> {
        self.get_prompt_template(id)
    }

    async fn default_template(&self) -> Result<Option<PromptTemplate>> {
        self.default_prompt_template()
    }
}

#[async_trait]
impl QueryLogSink for KnowledgeStore {
    async fn save(&self, record: &QueryLogRecord) -> Result<i64> {
        self.insert_query_log(record)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

const DOCUMENT_COLUMNS: &str = "id, filename, page_count, chunk_count, chunk_strategy, chunk_size, \
     chunk_overlap, status, error_message, created_at, updated_at";

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentRecord> {
    Ok(DocumentRecord {
        id: row.get(0)?,
        filename: row.get(1)?,
        page_count: row.get::<_, i64>(2)? as usize,
        chunk_count: row.get::<_, i64>(3)? as usize,
        chunk_strategy: parse_column(4, row.get(4)?)?,
        chunk_size: row.get::<_, i64>(5)? as usize,
        chunk_overlap: row.get::<_, i64>(6)? as usize,
        status: parse_column(7, row.get(7)?)?,
        error_message: row.get(8)?,
        created_at: parse_datetime(row.get::<_, String>(9)?),
        updated_at: parse_datetime(row.get::<_, String>(10)?),
    })
}

fn row_to_template(row: &rusqlite::Row<'_>) -> rusqlite::Result<PromptTemplate> {
    Ok(PromptTemplate {
        id: row.get(0)?,
        name: row.get(1)?,
        system_prompt: row.get(2)?,
        description: row.get(3)?,
        is_default: row.get(4)?,
    })
}

/// 문자열 컬럼을 enum으로 변환
fn parse_column<T>(idx: usize, value: String) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, value: String) -> rusqlite::Result<T> {
    serde_json::from_str(&value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// RFC3339 문자열을 DateTime<Utc>로 파싱
fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ============================================================================
// Tests
// ============================================================================
