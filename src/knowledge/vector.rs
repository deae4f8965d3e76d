//! Vector Store - 벡터 검색 트레이트 및 메모리 구현
//!
//! 청크 임베딩을 저장하고 질의 벡터와 가까운 청크를 찾습니다.
//! - `LanceVectorStore`: 디스크 기반 ANN 검색 (lance.rs)
//! - `InMemoryVectorStore`: 코사인 유사도 전수 검색 (테스트, 임시 실행)

use std::sync::{PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use super::chunker::ChunkStrategy;

// ============================================================================
// Types
// ============================================================================

/// 벡터 포인트 (저장용)
#[derive(Debug, Clone, PartialEq)]
pub struct VectorPoint {
    pub document_id: i64,
    pub chunk_index: usize,
    pub page_number: Option<u32>,
    pub chunk_strategy: ChunkStrategy,
    pub text: String,
    pub vector: Vec<f32>,
}

/// 벡터 검색 결과
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorHit {
    pub document_id: i64,
    pub chunk_index: usize,
    pub page_number: Option<u32>,
    pub chunk_strategy: ChunkStrategy,
    pub text: String,
    /// 유사도 (높을수록 가까움)
    pub score: f32,
}

// ============================================================================
// VectorStore Trait
// ============================================================================

/// 벡터 저장소 공통 인터페이스
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// 포인트 저장 (같은 (문서, 청크) 키는 교체)
    async fn upsert(&self, points: &[VectorPoint]) -> Result<usize>;

    /// 유사도 내림차순 검색
    ///
    /// `document_ids`가 주어지면 해당 문서의 청크만 대상으로 합니다.
    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        document_ids: Option<&[i64]>,
    ) -> Result<Vec<VectorHit>>;

    /// 문서의 모든 포인트 삭제
    async fn delete_by_document(&self, document_id: i64) -> Result<usize>;

    /// 포인트 개수
    async fn count(&self) -> Result<usize>;
}

// ============================================================================
// InMemoryVectorStore
// ============================================================================

/// 메모리 벡터 저장소
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    points: RwLock<Vec<VectorPoint>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, points: &[VectorPoint]) -> Result<usize> {
        let mut stored = self.points.write().unwrap_or_else(PoisonError::into_inner);
        for point in points {
            stored.retain(|p| {
                !(p.document_id == point.document_id && p.chunk_index == point.chunk_index)
            });
            stored.push(point.clone());
        }
        Ok(points.len())
    }

    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        document_ids: Option<&[i64]>,
    ) -> Result<Vec<VectorHit>> {
        let stored = self.points.read().unwrap_or_else(PoisonError::into_inner);

        let mut hits: Vec<VectorHit> = stored
            .iter()
            .filter(|p| document_ids.map_or(true, |ids| ids.contains(&p.document_id)))
            .map(|p| VectorHit {
                document_id: p.document_id,
                chunk_index: p.chunk_index,
                page_number: p.page_number,
                chunk_strategy: p.chunk_strategy,
                text: p.text.clone(),
                score: cosine_similarity(vector, &p.vector),
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete_by_document(&self, document_id: i64) -> Result<usize> {
        let mut stored = self.points.write().unwrap_or_else(PoisonError::into_inner);
        let before = stored.len();
        stored.retain(|p| p.document_id != document_id);
        Ok(before - stored.len())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.points.read().unwrap_or_else(PoisonError::into_inner).len())
    }
}

// ============================================================================
// Utility Functions
// ============================================================================

/// 코사인 유사도 (-1.0 ~ 1.0)
///
/// 길이가 다르거나 영벡터가 포함되면 0.0을 반환합니다.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

// ============================================================================
// Tests
// ============================================================================
