//! BM25 Lexical Index - 메모리 내 키워드 검색
//!
//! 준비 완료(ready) 문서들의 청크에 대한 역색인을 유지합니다.
//!
//! - 문서 추가/삭제 시 전체 역색인과 통계를 새 스냅샷으로 재구성
//! - 재구성된 스냅샷은 원자적으로 교체 (검색은 항상 완성된 스냅샷만 관찰)
//! - 점수: `idf(df) * tf*(k1+1) / (tf + k1*(1 - b + b*len/avg))`
//!   `idf(df) = ln(1 + (N - df + 0.5)/(df + 0.5))`

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::chunker::Chunk;

/// (문서 ID, 청크 인덱스)
pub type ChunkKey = (i64, usize);

// ============================================================================
// Types
// ============================================================================

/// BM25 튜닝 파라미터
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bm25Params {
    /// 단어 빈도 포화
    pub k1: f64,
    /// 길이 정규화
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

impl Bm25Params {
    pub fn new(k1: f64, b: f64) -> Self {
        Self { k1, b }
    }
}

/// 키워드 검색 결과
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LexicalHit {
    pub document_id: i64,
    pub chunk_index: usize,
    pub page_number: Option<u32>,
    pub text: String,
    pub score: f64,
}

/// 인덱스 통계
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub documents: usize,
    pub total_chunks: usize,
    /// 청크당 평균 토큰 수
    pub avg_chunk_length: f64,
    pub vocabulary: usize,
}

/// 렉시컬 인덱스 부트스트랩용 문서 공급자
///
/// 인덱스는 문서 저장소를 알지 못하며, 저장소 쪽이 이 트레이트를 구현합니다.
pub trait DocumentSource: Send + Sync {
    /// 상태가 ready인 문서 ID 목록
    fn ready_document_ids(&self) -> Result<Vec<i64>>;

    /// 문서의 청크 목록
    fn document_chunks(&self, document_id: i64) -> Result<Vec<Chunk>>;
}

// ============================================================================
// Snapshot
// ============================================================================

#[derive(Debug)]
struct IndexedChunk {
    chunk_index: usize,
    page_number: Option<u32>,
    text: String,
    tokens: Vec<String>,
}

impl IndexedChunk {
    fn from_chunk(chunk: &Chunk) -> Self {
        Self {
            chunk_index: chunk.chunk_index,
            page_number: chunk.page_number,
            text: chunk.text.clone(),
            tokens: tokenize(&chunk.text),
        }
    }

    fn length(&self) -> usize {
        self.tokens.len()
    }
}

/// 불변 인덱스 스냅샷
#[derive(Debug, Default)]
struct IndexSnapshot {
    documents: BTreeMap<i64, Arc<Vec<IndexedChunk>>>,
    /// term → (chunk key → tf)
    inverted: HashMap<String, HashMap<ChunkKey, u32>>,
    total_chunks: usize,
    avg_chunk_length: f64,
}

impl IndexSnapshot {
    /// 문서 집합으로부터 역색인과 통계를 전부 재구성
    fn build(documents: BTreeMap<i64, Arc<Vec<IndexedChunk>>>) -> Self {
        let mut inverted: HashMap<String, HashMap<ChunkKey, u32>> = HashMap::new();
        let mut total_chunks = 0;
        let mut total_length = 0;

        for (&document_id, chunks) in &documents {
            for chunk in chunks.iter() {
                total_chunks += 1;
                total_length += chunk.length();

                let key = (document_id, chunk.chunk_index);
                for token in &chunk.tokens {
                    *inverted
                        .entry(token.clone())
                        .or_default()
                        .entry(key)
                        .or_insert(0) += 1;
                }
            }
        }

        let avg_chunk_length = if total_chunks > 0 {
            total_length as f64 / total_chunks as f64
        } else {
            0.0
        };

        Self {
            documents,
            inverted,
            total_chunks,
            avg_chunk_length,
        }
    }

    fn idf(&self, df: usize) -> f64 {
        let n = self.total_chunks as f64;
        let df = df as f64;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    fn score(&self, key: ChunkKey, length: usize, query_tokens: &[String], params: &Bm25Params) -> f64 {
        let mut score = 0.0;

        for term in query_tokens {
            let Some(postings) = self.inverted.get(term) else {
                continue;
            };
            let Some(&tf) = postings.get(&key) else {
                continue;
            };

            let tf = tf as f64;
            let norm = 1.0 - params.b + params.b * (length as f64 / self.avg_chunk_length);
            score += self.idf(postings.len()) * (tf * (params.k1 + 1.0)) / (tf + params.k1 * norm);
        }

        score
    }
}

// ============================================================================
// Bm25Index
// ============================================================================

/// 프로세스 전역 BM25 인덱스
///
/// 쓰기는 writer 락으로 직렬화되고, 읽기는 현재 스냅샷의 `Arc`만 잡습니다.
#[derive(Debug)]
pub struct Bm25Index {
    params: Bm25Params,
    active: RwLock<Arc<IndexSnapshot>>,
    writer: Mutex<()>,
}

impl Default for Bm25Index {
    fn default() -> Self {
        Self::new(Bm25Params::default())
    }
}

impl Bm25Index {
    pub fn new(params: Bm25Params) -> Self {
        Self {
            params,
            active: RwLock::new(Arc::new(IndexSnapshot::default())),
            writer: Mutex::new(()),
        }
    }

    pub fn params(&self) -> Bm25Params {
        self.params
    }

    fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, snapshot: IndexSnapshot) {
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
    }

    /// 현재 문서 집합을 변경한 새 스냅샷을 만들어 교체
    fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut BTreeMap<i64, Arc<Vec<IndexedChunk>>>),
    {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut documents = self.snapshot().documents.clone();
        mutate(&mut documents);
        self.publish(IndexSnapshot::build(documents));
    }

    /// 문서 추가 (같은 ID가 있으면 청크 전체 교체)
    pub fn add_document(&self, document_id: i64, chunks: &[Chunk]) {
        let indexed: Vec<IndexedChunk> = chunks.iter().map(IndexedChunk::from_chunk).collect();
        self.update(|documents| {
            documents.insert(document_id, Arc::new(indexed));
        });
        tracing::info!("BM25: added document {} ({} chunks)", document_id, chunks.len());
    }

    /// 문서 삭제 (없는 ID는 무시)
    pub fn remove_document(&self, document_id: i64) {
        self.update(|documents| {
            documents.remove(&document_id);
        });
        tracing::info!("BM25: removed document {}", document_id);
    }

    /// 인덱스에 포함된 문서인지 확인
    pub fn contains(&self, document_id: i64) -> bool {
        self.snapshot().documents.contains_key(&document_id)
    }

    /// 저장소의 ready 문서 전체로 인덱스 재구성
    ///
    /// 문서 단위 실패는 경고 로그 후 건너뜁니다. 반환값은 색인된 문서 수입니다.
    pub fn rebuild_from_source(&self, source: &dyn DocumentSource) -> Result<usize> {
        let ids = source.ready_document_ids()?;
        tracing::info!("Rebuilding BM25 index from {} ready documents", ids.len());

        let mut documents = BTreeMap::new();
        for id in ids {
            match source.document_chunks(id) {
                Ok(chunks) => {
                    let indexed = chunks.iter().map(IndexedChunk::from_chunk).collect();
                    documents.insert(id, Arc::new(indexed));
                }
                Err(e) => {
                    tracing::warn!("Failed to index document {} for BM25: {:#}", id, e);
                }
            }
        }

        let indexed = documents.len();
        {
            let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            self.publish(IndexSnapshot::build(documents));
        }

        let stats = self.stats();
        tracing::info!(
            "BM25 index built: {} chunks across {} documents",
            stats.total_chunks,
            stats.documents
        );
        Ok(indexed)
    }

    /// 키워드 검색
    ///
    /// 점수 > 0인 청크만 점수 내림차순으로 최대 `top_k`개 반환합니다.
    /// 동점은 (문서 ID, 청크 순서) 순서를 유지합니다.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<LexicalHit> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() || top_k == 0 {
            return vec![];
        }

        let snapshot = self.snapshot();
        let mut hits = Vec::new();

        for (&document_id, chunks) in &snapshot.documents {
            for chunk in chunks.iter() {
                let key = (document_id, chunk.chunk_index);
                let score = snapshot.score(key, chunk.length(), &query_tokens, &self.params);
                if score > 0.0 {
                    hits.push(LexicalHit {
                        document_id,
                        chunk_index: chunk.chunk_index,
                        page_number: chunk.page_number,
                        text: chunk.text.clone(),
                        score,
                    });
                }
            }
        }

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        hits
    }

    pub fn stats(&self) -> IndexStats {
        let snapshot = self.snapshot();
        IndexStats {
            documents: snapshot.documents.len(),
            total_chunks: snapshot.total_chunks,
            avg_chunk_length: snapshot.avg_chunk_length,
            vocabulary: snapshot.inverted.len(),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 토큰화: 소문자화 후 단어 문자(영숫자, `_`)가 아닌 문자를 경계로 분리
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|token| !token.is_empty())
        .map(String::from)
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: usize, text: &str) -> Chunk {
        Chunk {
            text: text.to_string(),
            chunk_index: index,
            page_number: Some(1),
            start_char: 0,
            end_char: text.chars().count(),
        }
    }

    fn sample_index() -> Bm25Index {
        let index = Bm25Index::default();
        index.add_document(
            1,
            &[
                chunk(0, "Rust ownership and borrowing rules keep memory safe"),
                chunk(1, "The weather today is sunny with light wind"),
            ],
        );
        index.add_document(2, &[chunk(0, "Cooking pasta requires salted boiling water")]);
        index
    }

    struct FakeSource {
        failing: i64,
    }

    impl DocumentSource for FakeSource {
        fn ready_document_ids(&self) -> Result<Vec<i64>> {
            Ok(vec![1, 2, 3])
        }

        fn document_chunks(&self, document_id: i64) -> Result<Vec<Chunk>> {
            if document_id == self.failing {
                anyhow::bail!("pages missing");
            }
            Ok(vec![chunk(0, &format!("document {} about lexical search", document_id))])
        }
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("Hello, World! This is a TEST."),
            vec!["hello", "world", "this", "is", "a", "test"]
        );
        assert!(tokenize("").is_empty());
        assert!(tokenize("!!! ... ???").is_empty());
        assert_eq!(tokenize("version 2 of gpt4"), vec!["version", "2", "of", "gpt4"]);
        assert_eq!(tokenize("snake_case stays"), vec!["snake_case", "stays"]);
    }

    #[test]
    fn test_tokenize_keeps_non_ascii_letters() {
        assert_eq!(tokenize("Café au lait"), vec!["café", "au", "lait"]);
        assert_eq!(tokenize("검색 증강-생성"), vec!["검색", "증강", "생성"]);
    }

    #[test]
    fn test_search_ranks_on_topic_first() {
        let index = sample_index();
        let hits = index.search("rust memory ownership", 10);

        assert!(!hits.is_empty());
        assert_eq!(hits[0].document_id, 1);
        assert_eq!(hits[0].chunk_index, 0);
        assert!(hits[0].score > 0.0);
    }

    #[test]
    fn test_search_out_of_vocabulary() {
        let index = sample_index();
        assert!(index.search("quantum chromodynamics", 10).is_empty());
        assert!(index.search("", 10).is_empty());
        assert!(index.search("?!", 10).is_empty());
    }

    #[test]
    fn test_top_k_bounds_results() {
        let index = sample_index();
        let hits = index.search("rust weather pasta", 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(index.search("rust weather pasta", 10).len(), 3);
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn test_remove_document() {
        let index = sample_index();
        index.remove_document(1);

        assert!(index.search("rust ownership", 10).is_empty());
        assert!(!index.contains(1));
        assert_eq!(index.stats().total_chunks, 1);

        // 없는 문서 삭제는 에러가 아님
        index.remove_document(999);
        assert_eq!(index.stats().documents, 1);
    }

    #[test]
    fn test_add_document_replaces_chunks() {
        let index = sample_index();
        index.add_document(2, &[chunk(0, "Baking bread needs flour"), chunk(1, "Yeast rises")]);

        assert!(index.search("pasta", 10).is_empty());
        assert_eq!(index.search("bread", 10)[0].document_id, 2);
        assert_eq!(index.stats().total_chunks, 4);
    }

    #[test]
    fn test_score_matches_formula() {
        let index = Bm25Index::default();
        index.add_document(1, &[chunk(0, "apple apple banana"), chunk(1, "cherry")]);

        let hits = index.search("apple", 10);
        assert_eq!(hits.len(), 1);

        // N=2, df=1, tf=2, len=3, avg=2
        let idf = (1.0_f64 + (2.0 - 1.0 + 0.5) / (1.0 + 0.5)).ln();
        let norm = 1.0 - 0.75 + 0.75 * (3.0 / 2.0);
        let expected = idf * (2.0 * 2.2) / (2.0 + 1.2 * norm);
        assert!((hits[0].score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_stats_recomputed() {
        let index = Bm25Index::default();
        assert_eq!(index.stats(), IndexStats::default());

        index.add_document(1, &[chunk(0, "a b c d"), chunk(1, "e f")]);
        let stats = index.stats();
        assert_eq!(stats.total_chunks, 2);
        assert!((stats.avg_chunk_length - 3.0).abs() < 1e-9);
        assert_eq!(stats.vocabulary, 6);
    }

    #[test]
    fn test_rebuild_skips_failing_documents() {
        let index = Bm25Index::default();
        let indexed = index.rebuild_from_source(&FakeSource { failing: 2 }).unwrap();

        assert_eq!(indexed, 2);
        assert!(index.contains(1));
        assert!(!index.contains(2));
        assert!(index.contains(3));
        assert_eq!(index.search("lexical", 10).len(), 2);
    }

    #[test]
    fn test_concurrent_reads_during_writes() {
        let index = Arc::new(sample_index());
        let writers: Vec<_> = (10..20)
            .map(|id| {
                let index = index.clone();
                std::thread::spawn(move || {
                    index.add_document(id, &[chunk(0, "rust concurrency snapshot")]);
                })
            })
            .collect();

        for _ in 0..50 {
            let stats = index.stats();
            // 스냅샷은 항상 일관됨: 문서 수와 청크 수가 어긋나지 않음
            assert_eq!(stats.total_chunks, stats.documents + 1);
        }

        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(index.stats().documents, 12);
        assert_eq!(index.search("snapshot", 100).len(), 10);
    }
}
