//! 테스트용 가짜 협력자
//!
//! 외부 API 없이 `RagApp`을 조립하기 위한 결정적 구현체들입니다.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::app::{Providers, RagApp};
use crate::config::RagConfig;
use crate::embedding::{EmbeddingBatch, EmbeddingProvider};
use crate::generation::{Generation, GenerationProvider, StreamEvent, TokenStream, TokenUsage};
use crate::knowledge::{tokenize, InMemoryVectorStore, PageText};
use crate::rerank::{RerankResult, Reranker};

/// 스트리밍 답변 토큰
pub const ANSWER_TOKENS: [&str; 3] = ["Ownership ", "is ", "enforced."];

// ============================================================================
// Embedding
// ============================================================================

/// 토큰 해시 버킷 임베딩 (같은 단어를 공유하면 코사인 유사도 > 0)
#[derive(Debug, Default)]
pub struct HashingEmbedder {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

impl HashingEmbedder {
    pub const DIMENSION: usize = 256;

    pub fn failing() -> Self {
        let embedder = Self::default();
        embedder.set_failing(true);
        embedder
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; Self::DIMENSION];
        for token in tokenize(text) {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            vector[(hasher.finish() % Self::DIMENSION as u64) as usize] += 1.0;
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            bail!("embedding service unavailable");
        }
        Ok(EmbeddingBatch {
            vectors: texts.iter().map(|t| Self::vector(t)).collect(),
            token_count: texts.iter().map(|t| tokenize(t).len() as u64).sum(),
        })
    }

    fn dimension(&self) -> usize {
        Self::DIMENSION
    }

    fn model(&self) -> &str {
        "hashing-test"
    }
}

// ============================================================================
// Generation
// ============================================================================

/// 질의 변환에는 고정 텍스트, 스트리밍에는 `ANSWER_TOKENS`를 돌려주는 생성기
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    pub transform_output: String,
    pub system_prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(transform_output: &str) -> Self {
        Self {
            transform_output: transform_output.to_string(),
            system_prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn last_system_prompt(&self) -> Option<String> {
        self.system_prompts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl GenerationProvider for ScriptedGenerator {
    async fn generate(&self, _system: &str, _user: &str, _temperature: f64) -> Result<Generation> {
        Ok(Generation {
            text: self.transform_output.clone(),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
            },
        })
    }

    async fn generate_stream(
        &self,
        system_prompt: &str,
        _user: &str,
        _temperature: f64,
    ) -> Result<TokenStream> {
        self.system_prompts
            .lock()
            .unwrap()
            .push(system_prompt.to_string());

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for token in ANSWER_TOKENS {
                if tx.send(Ok(StreamEvent::Token(token.to_string()))).await.is_err() {
                    return;
                }
            }
            let _ = tx
                .send(Ok(StreamEvent::Usage(TokenUsage {
                    prompt_tokens: 100,
                    completion_tokens: 20,
                })))
                .await;
        });
        Ok(ReceiverStream::new(rx))
    }

    fn model(&self) -> &str {
        "scripted-test"
    }
}

// ============================================================================
// Reranker
// ============================================================================

/// 입력 순서를 뒤집는 리랭커
#[derive(Debug, Default)]
pub struct ReversingReranker {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Reranker for ReversingReranker {
    async fn rerank(&self, _query: &str, documents: &[String], top_n: usize) -> Result<Vec<RerankResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((0..documents.len())
            .rev()
            .take(top_n)
            .map(|index| RerankResult {
                index,
                relevance_score: (index + 1) as f64 / documents.len() as f64,
            })
            .collect())
    }
}

// ============================================================================
// Fixture
// ============================================================================

pub struct Fixture {
    pub app: Arc<RagApp>,
    pub embedder: Arc<HashingEmbedder>,
    pub generator: Arc<ScriptedGenerator>,
    pub reranker: Arc<ReversingReranker>,
    pub dir: TempDir,
}

pub fn test_config(dir: &TempDir) -> RagConfig {
    RagConfig {
        data_dir: dir.path().to_path_buf(),
        ..RagConfig::default()
    }
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_embedder(HashingEmbedder::default())
    }

    pub fn with_embedder(embedder: HashingEmbedder) -> Self {
        let dir = TempDir::new().unwrap();
        Self::open(dir, embedder)
    }

    /// 같은 데이터 디렉토리로 다시 열기 (벡터 저장소는 새로 시작)
    pub fn reopen(self) -> Self {
        let Fixture { app, dir, .. } = self;
        drop(app);
        Self::open(dir, HashingEmbedder::default())
    }

    fn open(dir: TempDir, embedder: HashingEmbedder) -> Self {
        let embedder = Arc::new(embedder);
        let generator = Arc::new(ScriptedGenerator::new("rust ownership rules"));
        let reranker = Arc::new(ReversingReranker::default());
        let providers = Providers {
            embedder: embedder.clone(),
            generator: generator.clone(),
            reranker: reranker.clone(),
        };

        let app = RagApp::with_parts(
            test_config(&dir),
            Arc::new(InMemoryVectorStore::new()),
            providers,
        )
        .unwrap();

        Self {
            app: Arc::new(app),
            embedder,
            generator,
            reranker,
            dir,
        }
    }
}

/// 19자 페이지 3개 (FIXED 20/0 설정에서 페이지당 청크 1개)
pub fn rust_pages() -> Vec<PageText> {
    vec![
        PageText::new(1, "rust ownership rule"),
        PageText::new(2, "borrow checker wins"),
        PageText::new(3, "tokio async runtime"),
    ]
}

/// 19자 페이지 2개
pub fn python_pages() -> Vec<PageText> {
    vec![
        PageText::new(1, "python garbage heap"),
        PageText::new(2, "serde json encoding"),
    ]
}
