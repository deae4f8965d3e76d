//! 임베딩 모듈 - OpenAI 호환 API를 통한 텍스트 벡터화
//!
//! 청크 색인과 질의 검색에 쓰이는 임베딩 프로바이더입니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let embedder = OpenAiEmbedding::new(api_key, base_url, "text-embedding-3-large", 3072)?;
//! let batch = embedder.embed(&["Hello, world!".to_string()]).await?;
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::OpenAiConfig;

/// 요청 1회당 최대 입력 수
pub const EMBEDDING_BATCH_SIZE: usize = 100;

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 결과 (입력 순서 유지)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddingBatch {
    pub vectors: Vec<Vec<f32>>,
    /// 과금 토큰 수
    pub token_count: u64,
}

/// 임베딩 프로바이더 트레이트
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 배치 임베딩
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch>;

    /// 단일 텍스트 임베딩
    async fn embed_one(&self, text: &str) -> Result<(Vec<f32>, u64)> {
        let batch = self.embed(&[text.to_string()]).await?;
        let vector = batch
            .vectors
            .into_iter()
            .next()
            .context("Embedding response contained no vectors")?;
        Ok((vector, batch.token_count))
    }

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 모델 이름
    fn model(&self) -> &str;
}

// ============================================================================
// OpenAI Embedding
// ============================================================================

/// OpenAI 임베딩 구현체
///
/// source: https://platform.openai.com/docs/api-reference/embeddings
#[derive(Debug, Clone)]
pub struct OpenAiEmbedding {
    api_key: String,
    base_url: String,
    model: String,
    dimension: usize,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
    #[serde(default)]
    usage: Option<EmbedUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbedData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbedUsage {
    #[serde(default)]
    total_tokens: u64,
}

/// OpenAI 에러 응답
#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl OpenAiEmbedding {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        dimension: usize,
    ) -> Result<Self> {
        if dimension == 0 {
            anyhow::bail!("Invalid embedding dimension: 0");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            dimension,
            client,
        })
    }

    /// 설정에서 생성 (API 키 필수)
    pub fn from_config(config: &OpenAiConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .context("OpenAI API key not found. Set OPENAI_API_KEY environment variable.")?;
        Self::new(
            api_key,
            &config.base_url,
            &config.embedding_model,
            config.embedding_dimension,
        )
    }

    async fn embed_chunk(&self, texts: &[String]) -> Result<EmbeddingBatch> {
        let request = EmbedRequest {
            model: &self.model,
            input: texts,
            dimensions: self.dimension,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send embedding request")?;

        let status = response.status();
        let body = response.text().await.context("Failed to read response body")?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ApiError>(&body) {
                anyhow::bail!("OpenAI embedding error ({}): {}", status, error.error.message);
            }
            anyhow::bail!("OpenAI embedding error ({}): {}", status, body);
        }

        let parsed: EmbedResponse =
            serde_json::from_str(&body).context("Failed to parse embedding response")?;
        into_batch(parsed, texts.len())
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedding {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch> {
        let mut result = EmbeddingBatch {
            vectors: Vec::with_capacity(texts.len()),
            token_count: 0,
        };

        for (i, chunk) in texts.chunks(EMBEDDING_BATCH_SIZE).enumerate() {
            tracing::debug!(
                "Embedding batch {}/{} ({} inputs)",
                i + 1,
                texts.len().div_ceil(EMBEDDING_BATCH_SIZE),
                chunk.len()
            );
            let batch = self.embed_chunk(chunk).await?;
            result.vectors.extend(batch.vectors);
            result.token_count += batch.token_count;
        }

        Ok(result)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 응답 데이터를 입력 순서(index)대로 정렬
fn into_batch(response: EmbedResponse, expected: usize) -> Result<EmbeddingBatch> {
    let mut data = response.data;
    if data.len() != expected {
        anyhow::bail!(
            "Embedding response size mismatch: expected {}, got {}",
            expected,
            data.len()
        );
    }
    data.sort_by_key(|d| d.index);

    Ok(EmbeddingBatch {
        vectors: data.into_iter().map(|d| d.embedding).collect(),
        token_count: response.usage.map(|u| u.total_tokens).unwrap_or(0),
    })
}

// ============================================================================
// Tests
// ============================================================================
