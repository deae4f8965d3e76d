//! 질의 변환 - DIRECT / HyDE / multi-query / step-back
//!
//! 사용자 질문을 하나 이상의 검색 질의로 바꿉니다.
//! DIRECT를 제외한 전략은 생성 호출을 정확히 한 번 하며, 그 토큰 사용량을 보고합니다.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::RagError;
use crate::generation::GenerationProvider;

const HYDE_PROMPT: &str = "You are a helpful assistant. Given a question, write a detailed paragraph that would \
appear in a document answering this question. Do not include any preamble. Just write \
the hypothetical answer paragraph directly.";

const MULTI_QUERY_PROMPT: &str = "You are a helpful assistant. Given a question, generate 4 different rephrasings of the \
same question to improve search recall. Return ONLY the 4 questions, one per line, \
without numbering or bullet points.";

const STEP_BACK_PROMPT: &str = "You are a helpful assistant. Given a specific question, generate a single broader, \
more general \"step-back\" question that would help retrieve relevant background context. \
Return ONLY the step-back question, nothing else.";

// ============================================================================
// Types
// ============================================================================

/// 질의 변환 전략
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStrategy {
    /// 변환 없음 (기본값)
    #[default]
    Direct,
    /// 가상 답변 문단으로 검색
    Hyde,
    /// 원 질문 + 재서술 4개
    MultiQuery,
    /// 원 질문 + 더 넓은 배경 질문
    StepBack,
}

impl QueryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Hyde => "hyde",
            Self::MultiQuery => "multi_query",
            Self::StepBack => "step_back",
        }
    }
}

impl fmt::Display for QueryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryStrategy {
    type Err = RagError;

    fn from_str(s: &str) -> std::result::Result<Self, RagError> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "direct" => Ok(Self::Direct),
            "hyde" => Ok(Self::Hyde),
            "multi_query" => Ok(Self::MultiQuery),
            "step_back" => Ok(Self::StepBack),
            other => Err(RagError::validation(format!(
                "unknown query strategy '{}' (expected direct, hyde, multi_query or step_back)",
                other
            ))),
        }
    }
}

/// 변환 결과
#[derive(Debug, Clone, PartialEq)]
pub struct Transformation {
    /// 검색에 쓸 질의 (순서 유지, 최소 1개)
    pub search_queries: Vec<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub description: String,
}

// ============================================================================
// QueryTransformer
// ============================================================================

pub struct QueryTransformer {
    generator: Arc<dyn GenerationProvider>,
}

impl QueryTransformer {
    pub fn new(generator: Arc<dyn GenerationProvider>) -> Self {
        Self { generator }
    }

    pub async fn transform(
        &self,
        query: &str,
        strategy: QueryStrategy,
        temperature: f64,
    ) -> Result<Transformation> {
        match strategy {
            QueryStrategy::Direct => Ok(direct(query)),
            QueryStrategy::Hyde => self.hyde(query, temperature).await,
            QueryStrategy::MultiQuery => self.multi_query(query, temperature).await,
            QueryStrategy::StepBack => self.step_back(query, temperature).await,
        }
    }

    async fn hyde(&self, query: &str, temperature: f64) -> Result<Transformation> {
        let result = self.generator.generate(HYDE_PROMPT, query, temperature).await?;
        let hypothetical = result.text.trim();
        tracing::info!("HyDE generated hypothetical document ({} chars)", hypothetical.chars().count());

        // 빈 응답이면 원 질문으로 검색
        let search_query = if hypothetical.is_empty() {
            tracing::warn!("HyDE returned empty text, falling back to original query");
            query.to_string()
        } else {
            hypothetical.to_string()
        };

        Ok(Transformation {
            search_queries: vec![search_query],
            prompt_tokens: result.usage.prompt_tokens,
            completion_tokens: result.usage.completion_tokens,
            description: "HyDE: searching with hypothetical document embedding".to_string(),
        })
    }

    async fn multi_query(&self, query: &str, temperature: f64) -> Result<Transformation> {
        let result = self
            .generator
            .generate(MULTI_QUERY_PROMPT, query, temperature)
            .await?;

        let rephrasings: Vec<String> = result
            .text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        tracing::info!("Multi-query generated {} rephrasings", rephrasings.len());

        let description = format!(
            "Multi-query: searching with original + {} rephrasings",
            rephrasings.len()
        );
        let mut search_queries = Vec::with_capacity(rephrasings.len() + 1);
        search_queries.push(query.to_string());
        search_queries.extend(rephrasings);

        Ok(Transformation {
            search_queries,
            prompt_tokens: result.usage.prompt_tokens,
            completion_tokens: result.usage.completion_tokens,
            description,
        })
    }

    async fn step_back(&self, query: &str, temperature: f64) -> Result<Transformation> {
        let result = self
            .generator
            .generate(STEP_BACK_PROMPT, query, temperature)
            .await?;
        let step_back = result.text.trim();
        tracing::info!("Step-back generated: \"{}\"", step_back);

        let mut search_queries = vec![query.to_string()];
        if !step_back.is_empty() {
            search_queries.push(step_back.to_string());
        }

        Ok(Transformation {
            search_queries,
            prompt_tokens: result.usage.prompt_tokens,
            completion_tokens: result.usage.completion_tokens,
            description: "Step-back: searching with original + broader question".to_string(),
        })
    }
}

fn direct(query: &str) -> Transformation {
    Transformation {
        search_queries: vec![query.to_string()],
        prompt_tokens: 0,
        completion_tokens: 0,
        description: "Direct query: no transformation applied".to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================
