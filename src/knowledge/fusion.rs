//! RRF (Reciprocal Rank Fusion) - 벡터 + 키워드 결과 통합
//!
//! 두 검색 결과를 점수가 아닌 순위로 통합합니다.
//! ref: https://www.elastic.co/blog/hybrid-search-rrf
//!
//! ```text
//! vector: w / (k + rank)
//! bm25:   (1 - w) / (k + rank)      (rank는 1부터)
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::bm25::{ChunkKey, LexicalHit};
use super::chunker::ChunkStrategy;
use super::vector::VectorHit;

// ============================================================================
// Types
// ============================================================================

/// 검색 결과 출처
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkSource {
    Vector,
    Bm25,
    Both,
}

/// 파이프라인 전체에서 쓰이는 청크 결과 레코드
///
/// (document_id, chunk_index)가 중복 제거 키입니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedChunk {
    pub document_id: i64,
    pub chunk_index: usize,
    pub page_number: Option<u32>,
    pub text: String,
    /// 키워드 검색에서만 나온 청크는 None
    pub chunk_strategy: Option<ChunkStrategy>,
    pub vector_rank: Option<usize>,
    pub vector_score: Option<f64>,
    pub bm25_rank: Option<usize>,
    pub bm25_score: Option<f64>,
    pub rrf_score: Option<f64>,
    pub reranker_score: Option<f64>,
    pub source: ChunkSource,
}

impl RetrievedChunk {
    pub fn key(&self) -> ChunkKey {
        (self.document_id, self.chunk_index)
    }

    /// 벡터 검색 결과 (rank는 1부터)
    pub fn from_vector_hit(hit: &VectorHit, rank: usize) -> Self {
        Self {
            document_id: hit.document_id,
            chunk_index: hit.chunk_index,
            page_number: hit.page_number,
            text: hit.text.clone(),
            chunk_strategy: Some(hit.chunk_strategy),
            vector_rank: Some(rank),
            vector_score: Some(hit.score as f64),
            bm25_rank: None,
            bm25_score: None,
            rrf_score: None,
            reranker_score: None,
            source: ChunkSource::Vector,
        }
    }

    /// 키워드 검색 결과 (rank는 1부터)
    pub fn from_lexical_hit(hit: &LexicalHit, rank: usize) -> Self {
        Self {
            document_id: hit.document_id,
            chunk_index: hit.chunk_index,
            page_number: hit.page_number,
            text: hit.text.clone(),
            chunk_strategy: None,
            vector_rank: None,
            vector_score: None,
            bm25_rank: Some(rank),
            bm25_score: Some(hit.score),
            rrf_score: None,
            reranker_score: None,
            source: ChunkSource::Bm25,
        }
    }
}

/// RRF 파라미터
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RrfParams {
    /// 순위 할인 상수
    pub k: f64,
}

impl Default for RrfParams {
    fn default() -> Self {
        Self { k: 60.0 }
    }
}

impl RrfParams {
    pub fn new(k: f64) -> Self {
        Self { k }
    }
}

// ============================================================================
// Fusion
// ============================================================================

/// 벡터/키워드 결과를 RRF로 통합
///
/// 결과는 중복 없이 rrf_score 내림차순으로 정렬됩니다.
/// 동점은 먼저 등록된 순서(벡터 결과 → 키워드 결과)를 유지합니다.
pub fn fuse(
    vector_hits: &[VectorHit],
    lexical_hits: &[LexicalHit],
    vector_weight: f64,
    params: &RrfParams,
) -> Vec<RetrievedChunk> {
    let mut fused: Vec<RetrievedChunk> = Vec::with_capacity(vector_hits.len() + lexical_hits.len());
    let mut positions: HashMap<ChunkKey, usize> = HashMap::new();

    for (i, hit) in vector_hits.iter().enumerate() {
        let rank = i + 1;
        let key = (hit.document_id, hit.chunk_index);
        if positions.contains_key(&key) {
            continue;
        }

        let mut chunk = RetrievedChunk::from_vector_hit(hit, rank);
        chunk.rrf_score = Some(vector_weight / (params.k + rank as f64));
        positions.insert(key, fused.len());
        fused.push(chunk);
    }

    let lexical_weight = 1.0 - vector_weight;
    for (i, hit) in lexical_hits.iter().enumerate() {
        let rank = i + 1;
        let contribution = lexical_weight / (params.k + rank as f64);
        let key = (hit.document_id, hit.chunk_index);

        match positions.get(&key) {
            Some(&pos) => {
                let existing = &mut fused[pos];
                if existing.bm25_rank.is_some() {
                    continue;
                }
                existing.bm25_rank = Some(rank);
                existing.bm25_score = Some(hit.score);
                existing.rrf_score = Some(existing.rrf_score.unwrap_or(0.0) + contribution);
                existing.source = ChunkSource::Both;
            }
            None => {
                let mut chunk = RetrievedChunk::from_lexical_hit(hit, rank);
                chunk.rrf_score = Some(contribution);
                positions.insert(key, fused.len());
                fused.push(chunk);
            }
        }
    }

    fused.sort_by(|a, b| {
        b.rrf_score
            .unwrap_or(0.0)
            .total_cmp(&a.rrf_score.unwrap_or(0.0))
    });
    fused
}

// ============================================================================
// Tests
// ============================================================================
