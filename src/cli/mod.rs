//! CLI 모듈
//!
//! prorag CLI 명령어 정의 및 구현

use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::app::RagApp;
use crate::config::RagConfig;
use crate::knowledge::{
    ChunkConfig, ChunkEngine, ChunkStats, ChunkStrategy, DocumentStatus, KnowledgeStore, PageText,
};
use crate::query::{PipelineEvent, QueryRequest, QueryStrategy, SearchMode, EVENT_BUFFER};

/// 페이지 구분자 (form feed)
const PAGE_SEPARATOR: char = '\u{000C}';

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "prorag")]
#[command(version, about = "하이브리드 RAG 질의 파이프라인", long_about = None)]
pub struct Cli {
    /// 설정 파일 경로 (기본: ./prorag.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// 청킹 옵션 (생략 시 설정 기본값)
#[derive(Args, Debug, Clone)]
pub struct ChunkArgs {
    /// 청킹 전략 (fixed, recursive, semantic)
    #[arg(long)]
    strategy: Option<ChunkStrategy>,

    /// 청크 크기 (문자 수)
    #[arg(long)]
    chunk_size: Option<usize>,

    /// 청크 오버랩 (문자 수)
    #[arg(long)]
    overlap: Option<usize>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// HTTP 서버 실행
    Serve {
        /// 바인드 주소 (기본: 설정값)
        #[arg(long)]
        host: Option<String>,

        /// 포트 (기본: 설정값)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// 질문하기 (답변 스트리밍)
    Query {
        /// 질문
        query: String,

        /// 검색 모드 (vector, bm25, hybrid)
        #[arg(short, long)]
        mode: Option<SearchMode>,

        /// 질의 변환 전략 (direct, hyde, multi_query, step_back)
        #[arg(short, long)]
        strategy: Option<QueryStrategy>,

        /// 리랭크 끄기
        #[arg(long)]
        no_rerank: bool,

        /// 검색 후보 수
        #[arg(long)]
        top_k: Option<usize>,

        /// 최종 청크 수
        #[arg(long)]
        top_n: Option<usize>,

        /// 생성 온도
        #[arg(short, long)]
        temperature: Option<f64>,

        /// 검색 대상 문서 ID (반복 가능)
        #[arg(short, long = "doc")]
        documents: Vec<i64>,

        /// 프롬프트 템플릿 ID
        #[arg(long)]
        template: Option<i64>,
    },

    /// 텍스트 파일 수집 (form feed로 페이지 구분)
    Ingest {
        /// 파일 경로
        file: PathBuf,

        /// 저장할 문서 이름 (기본: 파일 이름)
        #[arg(short, long)]
        name: Option<String>,

        #[command(flatten)]
        chunking: ChunkArgs,
    },

    /// 청킹 미리보기 (색인 변경 없음)
    Chunks {
        /// 문서 ID
        id: i64,

        #[command(flatten)]
        chunking: ChunkArgs,

        /// 출력할 청크 수
        #[arg(long, default_value = "5")]
        show: usize,
    },

    /// 저장된 문서 목록
    List,

    /// 문서 삭제
    Delete {
        /// 삭제할 문서 ID
        id: i64,
    },

    /// 다른 청킹 설정으로 재색인
    Rechunk {
        /// 문서 ID
        id: i64,

        #[command(flatten)]
        chunking: ChunkArgs,
    },

    /// 질의 로그 조회
    Logs {
        /// 로그 ID (지정 시 상세 출력)
        #[arg(long)]
        id: Option<i64>,

        /// 페이지 (1부터)
        #[arg(long, default_value = "1")]
        page: usize,

        /// 페이지 크기
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// 상태 확인
    Status,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => cmd_serve(config, host, port).await,
        Commands::Query {
            query,
            mode,
            strategy,
            no_rerank,
            top_k,
            top_n,
            temperature,
            documents,
            template,
        } => {
            let request = QueryRequest {
                query_text: query,
                search_mode: mode,
                query_strategy: strategy,
                reranker_enabled: no_rerank.then_some(false),
                temperature,
                retrieval_top_k: top_k,
                reranker_top_n: top_n,
                document_ids: (!documents.is_empty()).then_some(documents),
                prompt_template_id: template,
            };
            cmd_query(config, request).await
        }
        Commands::Ingest {
            file,
            name,
            chunking,
        } => cmd_ingest(config, &file, name, &chunking).await,
        Commands::Chunks { id, chunking, show } => cmd_chunks(&config, id, &chunking, show),
        Commands::List => cmd_list(&config),
        Commands::Delete { id } => cmd_delete(config, id).await,
        Commands::Rechunk { id, chunking } => cmd_rechunk(config, id, &chunking).await,
        Commands::Logs { id, page, limit } => cmd_logs(&config, id, page, limit),
        Commands::Status => cmd_status(&config),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_serve(config: RagConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", host, port))?;

    let app = Arc::new(open_app(config).await?);
    crate::server::serve(app, addr).await
}

/// 질의 명령어 (query)
///
/// 메타데이터를 먼저 출력하고 답변 토큰을 도착하는 대로 출력합니다.
async fn cmd_query(config: RagConfig, request: QueryRequest) -> Result<()> {
    let app = open_app(config).await?;
    let pipeline = app.pipeline();

    println!("[*] 질의 중: \"{}\"", request.query_text);

    let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
    let run = pipeline.run(&request, tx, CancellationToken::new());
    let print = async {
        let mut failure = None;
        while let Some(event) = rx.recv().await {
            match event {
                PipelineEvent::Metadata(meta) => {
                    println!(
                        "[OK] {} / {} | 청크 {} 건 | 변환 {}ms, 임베딩 {}ms, 검색 {}ms, 리랭크 {}ms",
                        meta.settings.search_mode,
                        meta.settings.query_strategy,
                        meta.retrieved_chunks.len(),
                        meta.timings.transformation_ms,
                        meta.timings.embedding_ms,
                        meta.timings.retrieval_ms,
                        meta.timings.reranking_ms,
                    );
                    for (i, chunk) in meta.retrieved_chunks.iter().enumerate() {
                        println!(
                            "   {}. Doc #{} / Chunk {} [{:?}] {}",
                            i + 1,
                            chunk.document_id,
                            chunk.chunk_index,
                            chunk.source,
                            truncate_text(&chunk.text, 80)
                        );
                    }
                    println!();
                }
                PipelineEvent::Token { token } => {
                    print!("{}", token);
                    let _ = std::io::stdout().flush();
                }
                PipelineEvent::Done(done) => {
                    println!();
                    println!();
                    println!(
                        "[OK] 로그 #{} | 예상 비용 ${:.6}",
                        done.query_log_id, done.final_cost_usd
                    );
                }
                PipelineEvent::Error { message } => failure = Some(message),
            }
        }
        failure
    };

    let ((), failure) = tokio::join!(run, print);
    if let Some(message) = failure {
        bail!("질의 실패: {}", message);
    }
    Ok(())
}

/// 수집 명령어 (ingest)
async fn cmd_ingest(
    config: RagConfig,
    file: &Path,
    name: Option<String>,
    chunking: &ChunkArgs,
) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("파일 읽기 실패: {}", file.display()))?;
    let pages = split_pages(&content);
    if pages.is_empty() {
        bail!("빈 파일입니다: {}", file.display());
    }

    let name = name.unwrap_or_else(|| {
        file.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string()
    });
    let chunk_config = resolve_chunking(&config, chunking, None);

    let app = open_app(config).await?;
    println!("[*] {} ({} 페이지) 청킹 및 임베딩 중...", name, pages.len());

    let doc = app.ingest(&name, pages, Some(chunk_config)).await?;
    println!("[OK] 문서가 추가되었습니다 (ID: {})", doc.id);
    println!(
        "     {} | {} 청크 (size {}, overlap {})",
        doc.chunk_strategy, doc.chunk_count, doc.chunk_size, doc.chunk_overlap
    );
    Ok(())
}

/// 청킹 미리보기 (chunks)
///
/// 저장된 페이지만 읽으므로 API 키가 필요 없습니다.
fn cmd_chunks(config: &RagConfig, id: i64, chunking: &ChunkArgs, show: usize) -> Result<()> {
    let store = open_store(config)?;
    let doc = store
        .get_document(id)?
        .ok_or_else(|| anyhow::anyhow!("ID {}인 문서를 찾을 수 없습니다", id))?;
    if doc.status != DocumentStatus::Ready {
        bail!("문서 #{}가 준비되지 않았습니다 (상태: {})", id, doc.status.as_str());
    }
    let chunk_config = resolve_chunking(config, chunking, Some(doc.chunk_config()));
    chunk_config.validate()?;

    let engine = ChunkEngine::new(config.chunking.semantic_similarity_threshold);
    let chunks = engine.chunk(&store.document_pages(id)?, &chunk_config);
    let stats = ChunkStats::from_chunks(&chunks);

    println!(
        "[OK] {} | {} 청크 | 평균 {} / 최소 {} / 최대 {} 문자 | 총 {} 문자",
        chunk_config.strategy,
        stats.count,
        stats.avg_length,
        stats.min_length,
        stats.max_length,
        stats.total_chars
    );
    for chunk in chunks.iter().take(show) {
        let page = chunk
            .page_number
            .map(|p| format!("p.{}", p))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  #{:<4} [{}] {}..{} {}",
            chunk.chunk_index,
            page,
            chunk.start_char,
            chunk.end_char,
            truncate_text(&chunk.text, 80)
        );
    }
    Ok(())
}

/// 목록 명령어 (list)
fn cmd_list(config: &RagConfig) -> Result<()> {
    let store = open_store(config)?;
    let docs = store.list_documents().context("문서 목록 조회 실패")?;

    if docs.is_empty() {
        println!("[!] 저장된 문서가 없습니다.");
        return Ok(());
    }

    println!("[OK] 저장된 문서 ({} 건):\n", docs.len());
    for doc in docs {
        println!(
            "  #{:<4} [{}] {}",
            doc.id,
            doc.status.as_str(),
            truncate_text(&doc.filename, 40)
        );
        println!(
            "        {} 페이지 | {} 청크 ({}, {}/{}) | {}",
            doc.page_count,
            doc.chunk_count,
            doc.chunk_strategy,
            doc.chunk_size,
            doc.chunk_overlap,
            doc.created_at.format("%Y-%m-%d %H:%M")
        );
        if let Some(ref message) = doc.error_message {
            println!("        에러: {}", truncate_text(message, 80));
        }
    }
    Ok(())
}

/// 삭제 명령어 (delete)
async fn cmd_delete(config: RagConfig, id: i64) -> Result<()> {
    let app = open_app(config).await?;
    app.remove(id).await?;
    println!("[OK] 문서 #{} 삭제됨", id);
    Ok(())
}

/// 재청킹 명령어 (rechunk)
async fn cmd_rechunk(config: RagConfig, id: i64, chunking: &ChunkArgs) -> Result<()> {
    let app = open_app(config).await?;
    let current = app.document(id)?.chunk_config();
    let chunk_config = resolve_chunking(app.config(), chunking, Some(current));

    println!("[*] 문서 #{} 재청킹 중 ({})...", id, chunk_config.strategy);
    let doc = app.rechunk(id, chunk_config).await?;
    println!("[OK] {} 청크로 재색인되었습니다", doc.chunk_count);
    Ok(())
}

/// 질의 로그 명령어 (logs)
fn cmd_logs(config: &RagConfig, id: Option<i64>, page: usize, limit: usize) -> Result<()> {
    let store = open_store(config)?;

    if let Some(id) = id {
        let log = store
            .get_query_log(id)?
            .ok_or_else(|| anyhow::anyhow!("ID {}인 질의 로그를 찾을 수 없습니다", id))?;
        println!("{}", serde_json::to_string_pretty(&log)?);
        return Ok(());
    }

    let logs = store.list_query_logs(page, limit)?;
    if logs.items.is_empty() {
        println!("[!] 질의 로그가 없습니다.");
        return Ok(());
    }

    println!(
        "[OK] 질의 로그 {} 건 중 {} 페이지:\n",
        logs.total, logs.page
    );
    for item in logs.items {
        println!(
            "  #{:<4} {} [{} / {}] {}ms ${:.6}",
            item.id,
            item.created_at.format("%Y-%m-%d %H:%M"),
            item.search_mode,
            item.query_strategy,
            item.total_ms,
            item.estimated_cost_usd
        );
        println!("        {}", truncate_text(&item.query_text, 70));
    }
    Ok(())
}

/// 상태 명령어 (status)
fn cmd_status(config: &RagConfig) -> Result<()> {
    println!("prorag v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("[*] 데이터 디렉토리: {}", config.data_dir.display());

    if config.openai.api_key.as_deref().is_some_and(|k| !k.is_empty()) {
        println!("[OK] OpenAI API 키: 설정됨 ({})", config.openai.llm_model);
    } else {
        println!("[!] OpenAI API 키: 미설정");
        println!("    설정: export OPENAI_API_KEY=your-key");
    }
    if config.jina.api_key.as_deref().is_some_and(|k| !k.is_empty()) {
        println!("[OK] Jina API 키: 설정됨");
    } else {
        println!("[!] Jina API 키: 미설정 (리랭크 사용 시 필요)");
    }

    match open_store(config).and_then(|store| store.stats()) {
        Ok(stats) => {
            println!(
                "[OK] 문서: {} 건 (ready {}) | 페이지: {} | 질의 로그: {} 건",
                stats.document_count, stats.ready_documents, stats.page_count, stats.query_log_count
            );
        }
        Err(e) => println!("[!] 저장소 열기 실패: {}", e),
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn load_config(path: Option<&Path>) -> Result<RagConfig> {
    match path {
        Some(path) => RagConfig::load_from(path),
        None => RagConfig::load(),
    }
}

fn open_store(config: &RagConfig) -> Result<KnowledgeStore> {
    KnowledgeStore::open(&config.db_path()).context("KnowledgeStore 열기 실패")
}

async fn open_app(config: RagConfig) -> Result<RagApp> {
    RagApp::open(config).await.context("RagApp 초기화 실패")
}

/// CLI 옵션 > 기준 설정(문서 또는 설정 기본값)
fn resolve_chunking(config: &RagConfig, args: &ChunkArgs, base: Option<ChunkConfig>) -> ChunkConfig {
    let base = base.unwrap_or_else(|| config.default_chunk_config());
    ChunkConfig::new(
        args.strategy.unwrap_or(base.strategy),
        args.chunk_size.unwrap_or(base.chunk_size),
        args.overlap.unwrap_or(base.chunk_overlap),
    )
}

/// form feed 기준으로 페이지 분할 (빈 페이지도 번호 유지)
fn split_pages(content: &str) -> Vec<PageText> {
    if content.trim().is_empty() {
        return Vec::new();
    }
    content
        .split(PAGE_SEPARATOR)
        .enumerate()
        .map(|(i, text)| PageText::new(i as u32 + 1, text))
        .collect()
}

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("hello", 10), "hello");
        assert_eq!(truncate_text("hello world", 5), "hello...");
        assert_eq!(truncate_text("hello\nworld", 20), "hello world");
        assert_eq!(truncate_text("안녕하세요 세계", 5), "안녕하세요...");
    }

    #[test]
    fn test_split_pages() {
        let pages = split_pages("first page\u{000C}second page\u{000C}\u{000C}fourth");
        assert_eq!(pages.len(), 4);
        assert_eq!(pages[0], PageText::new(1, "first page"));
        assert_eq!(pages[2].text, "");
        assert_eq!(pages[3].page_number, 4);

        assert_eq!(split_pages("no separator").len(), 1);
        assert!(split_pages("  \n ").is_empty());
    }

    #[test]
    fn test_resolve_chunking() {
        let config = RagConfig::default();
        let args = ChunkArgs {
            strategy: Some(ChunkStrategy::Semantic),
            chunk_size: None,
            overlap: Some(0),
        };
        let resolved = resolve_chunking(&config, &args, None);
        assert_eq!(resolved.strategy, ChunkStrategy::Semantic);
        assert_eq!(resolved.chunk_size, config.chunking.default_chunk_size);
        assert_eq!(resolved.chunk_overlap, 0);

        let base = ChunkConfig::new(ChunkStrategy::Fixed, 100, 10);
        let empty = ChunkArgs {
            strategy: None,
            chunk_size: None,
            overlap: None,
        };
        assert_eq!(resolve_chunking(&config, &empty, Some(base)), base);
    }

    #[test]
    fn test_cli_parses_query_flags() {
        let cli = Cli::try_parse_from([
            "prorag", "query", "what is rrf?", "--mode", "bm25", "--strategy", "step_back",
            "--no-rerank", "--doc", "1", "--doc", "3",
        ])
        .unwrap();
        match cli.command {
            Commands::Query {
                mode,
                strategy,
                no_rerank,
                documents,
                ..
            } => {
                assert_eq!(mode, Some(SearchMode::Bm25));
                assert_eq!(strategy, Some(QueryStrategy::StepBack));
                assert!(no_rerank);
                assert_eq!(documents, vec![1, 3]);
            }
            _ => panic!("expected query command"),
        }

        assert!(Cli::try_parse_from(["prorag", "query", "q", "--mode", "fuzzy"]).is_err());
    }
}
