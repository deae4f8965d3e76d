//! 리랭크 모듈 - Jina Reranker API
//!
//! 검색 후보를 cross-encoder로 재정렬해 상위 N개만 남깁니다.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::JinaConfig;

// ============================================================================
// Types
// ============================================================================

/// 리랭크 결과 (관련도 내림차순)
#[derive(Debug, Clone, PartialEq)]
pub struct RerankResult {
    /// 입력 목록에서의 위치
    pub index: usize,
    pub relevance_score: f64,
}

/// 리랭커 트레이트
#[async_trait]
pub trait Reranker: Send + Sync {
    /// `documents`를 `query` 기준으로 재정렬해 최대 `top_n`개 반환
    async fn rerank(&self, query: &str, documents: &[String], top_n: usize)
        -> Result<Vec<RerankResult>>;
}

// ============================================================================
// Jina Reranker
// ============================================================================

/// Jina 리랭커 구현체
///
/// source: https://jina.ai/reranker/
#[derive(Debug, Clone)]
pub struct JinaReranker {
    /// 없으면 호출 시점에 에러
    api_key: Option<String>,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankItem>,
}

#[derive(Debug, Deserialize)]
struct RerankItem {
    index: usize,
    relevance_score: f64,
}

impl JinaReranker {
    pub fn new(
        api_key: Option<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key: api_key.filter(|k| !k.is_empty()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            client,
        })
    }

    pub fn from_config(config: &JinaConfig) -> Result<Self> {
        Self::new(config.api_key.clone(), &config.base_url, &config.model)
    }
}

#[async_trait]
impl Reranker for JinaReranker {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankResult>> {
        let api_key = self.api_key.as_deref().context(
            "JINA_API_KEY is not configured. Disable reranking or set the key.",
        )?;

        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let request = RerankRequest {
            model: &self.model,
            query,
            documents,
            top_n,
        };

        let response = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send rerank request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!("Jina rerank failed ({}): {}", status, body);
            anyhow::bail!("Jina reranker error: {}", status);
        }

        let parsed: RerankResponse = response
            .json()
            .await
            .context("Failed to parse rerank response")?;

        into_results(parsed, documents.len())
    }
}

/// 범위를 벗어난 인덱스는 거부
fn into_results(response: RerankResponse, document_count: usize) -> Result<Vec<RerankResult>> {
    response
        .results
        .into_iter()
        .map(|item| {
            if item.index >= document_count {
                anyhow::bail!(
                    "Reranker returned index {} for {} documents",
                    item.index,
                    document_count
                );
            }
            Ok(RerankResult {
                index: item.index,
                relevance_score: item.relevance_score,
            })
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
