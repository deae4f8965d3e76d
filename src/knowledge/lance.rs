//! LanceDB Vector Store - 디스크 기반 벡터 검색
//!
//! ANN (Approximate Nearest Neighbor) 검색으로 청크 임베딩을 조회합니다.
//! 임베딩 차원은 설정(`openai.embedding_dimension`)에서 결정됩니다.
//! ref: https://lancedb.github.io/lancedb/

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int32Array, Int64Array, RecordBatch,
    RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::table::Table;

use super::chunker::ChunkStrategy;
use super::vector::{VectorHit, VectorPoint, VectorStore};

/// 벡터 테이블 이름
const TABLE_NAME: &str = "chunks";

// ============================================================================
// LanceVectorStore
// ============================================================================

/// LanceDB 벡터 저장소
pub struct LanceVectorStore {
    db: Connection,
    dimension: usize,
}

impl LanceVectorStore {
    /// LanceDB 저장소 열기
    ///
    /// # Arguments
    /// * `path` - .lance 디렉토리 경로
    /// * `dimension` - 임베딩 차원
    pub async fn open(path: &Path, dimension: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create LanceDB directory")?;
            }
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid path encoding"))?;

        let db = lancedb::connect(path_str)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        Ok(Self { db, dimension })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn schema(&self) -> Schema {
        Schema::new(vec![
            Field::new("document_id", DataType::Int64, false),
            Field::new("chunk_index", DataType::Int32, false),
            Field::new("page_number", DataType::Int32, true),
            Field::new("chunk_strategy", DataType::Utf8, false),
            Field::new("text", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                false,
            ),
        ])
    }

    /// 포인트들을 Arrow RecordBatch로 변환
    fn points_to_batch(&self, points: &[VectorPoint]) -> Result<RecordBatch> {
        if let Some(bad) = points.iter().find(|p| p.vector.len() != self.dimension) {
            anyhow::bail!(
                "Embedding dimension mismatch for document {} chunk {}: expected {}, got {}",
                bad.document_id,
                bad.chunk_index,
                self.dimension,
                bad.vector.len()
            );
        }

        let document_ids: Vec<i64> = points.iter().map(|p| p.document_id).collect();
        let chunk_indices: Vec<i32> = points.iter().map(|p| p.chunk_index as i32).collect();
        let page_numbers: Vec<Option<i32>> =
            points.iter().map(|p| p.page_number.map(|n| n as i32)).collect();
        let strategies: Vec<&str> = points.iter().map(|p| p.chunk_strategy.as_str()).collect();
        let texts: Vec<&str> = points.iter().map(|p| p.text.as_str()).collect();

        let flat: Vec<f32> = points.iter().flat_map(|p| p.vector.iter().copied()).collect();
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let vectors = FixedSizeListArray::try_new(
            field,
            self.dimension as i32,
            Arc::new(Float32Array::from(flat)) as Arc<dyn Array>,
            None,
        )
        .context("Failed to create embedding array")?;

        RecordBatch::try_new(
            Arc::new(self.schema()),
            vec![
                Arc::new(Int64Array::from(document_ids)),
                Arc::new(Int32Array::from(chunk_indices)),
                Arc::new(Int32Array::from(page_numbers)),
                Arc::new(StringArray::from(strategies)),
                Arc::new(StringArray::from(texts)),
                Arc::new(vectors),
            ],
        )
        .context("Failed to create RecordBatch")
    }

    async fn table_exists(&self) -> bool {
        self.db
            .table_names()
            .execute()
            .await
            .map(|names| names.iter().any(|n| n == TABLE_NAME))
            .unwrap_or(false)
    }

    async fn open_table(&self) -> Result<Option<Table>> {
        if !self.table_exists().await {
            return Ok(None);
        }
        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .context("Failed to open vector table")?;
        Ok(Some(table))
    }
}

/// SQL IN 목록 (정수 ID만 사용)
fn id_list<T: ToString>(ids: impl IntoIterator<Item = T>) -> String {
    ids.into_iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    async fn upsert(&self, points: &[VectorPoint]) -> Result<usize> {
        if points.is_empty() {
            return Ok(0);
        }

        let batch = self.points_to_batch(points)?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        match self.open_table().await? {
            Some(table) => {
                // 같은 (문서, 청크) 키 교체
                let mut document_ids: Vec<i64> = points.iter().map(|p| p.document_id).collect();
                document_ids.sort_unstable();
                document_ids.dedup();
                for document_id in document_ids {
                    let indices = points
                        .iter()
                        .filter(|p| p.document_id == document_id)
                        .map(|p| p.chunk_index);
                    let filter = format!(
                        "document_id = {} AND chunk_index IN ({})",
                        document_id,
                        id_list(indices)
                    );
                    table
                        .delete(&filter)
                        .await
                        .context("Failed to replace existing vectors")?;
                }

                table
                    .add(batches)
                    .execute()
                    .await
                    .context("Failed to add vectors to table")?;
            }
            None => {
                self.db
                    .create_table(TABLE_NAME, batches)
                    .execute()
                    .await
                    .context("Failed to create table")?;
            }
        }

        tracing::debug!("LanceDB: upserted {} vectors", points.len());
        Ok(points.len())
    }

    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        document_ids: Option<&[i64]>,
    ) -> Result<Vec<VectorHit>> {
        if matches!(document_ids, Some(ids) if ids.is_empty()) || top_k == 0 {
            return Ok(vec![]);
        }
        let Some(table) = self.open_table().await? else {
            return Ok(vec![]);
        };

        let mut query = table
            .vector_search(vector.to_vec())
            .context("Failed to create vector search")?
            .limit(top_k);
        if let Some(ids) = document_ids {
            query = query.only_if(format!("document_id IN ({})", id_list(ids.iter())));
        }

        let stream = query
            .execute()
            .await
            .context("Failed to execute vector search")?;
        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .context("Failed to read vector search results")?;

        let mut hits = Vec::new();
        for batch in batches {
            let doc_ids = column::<Int64Array>(&batch, "document_id")?;
            let chunk_indices = column::<Int32Array>(&batch, "chunk_index")?;
            let page_numbers = column::<Int32Array>(&batch, "page_number")?;
            let strategies = column::<StringArray>(&batch, "chunk_strategy")?;
            let texts = column::<StringArray>(&batch, "text")?;
            // LanceDB가 자동 추가하는 거리 컬럼
            let distances = column::<Float32Array>(&batch, "_distance")?;

            for i in 0..batch.num_rows() {
                let page_number = (!page_numbers.is_null(i)).then(|| page_numbers.value(i) as u32);
                hits.push(VectorHit {
                    document_id: doc_ids.value(i),
                    chunk_index: chunk_indices.value(i) as usize,
                    page_number,
                    chunk_strategy: strategies.value(i).parse().unwrap_or(ChunkStrategy::Recursive),
                    text: texts.value(i).to_string(),
                    // L2 거리 → 유사도
                    score: 1.0 / (1.0 + distances.value(i)),
                });
            }
        }

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(hits)
    }

    async fn delete_by_document(&self, document_id: i64) -> Result<usize> {
        let Some(table) = self.open_table().await? else {
            return Ok(0);
        };

        let filter = format!("document_id = {}", document_id);
        let before = table
            .count_rows(Some(filter.clone()))
            .await
            .context("Failed to count vectors for document")?;
        table.delete(&filter).await.context("Failed to delete vectors")?;

        tracing::debug!("LanceDB: deleted {} vectors of document {}", before, document_id);
        Ok(before)
    }

    async fn count(&self) -> Result<usize> {
        let Some(table) = self.open_table().await? else {
            return Ok(0);
        };
        table.count_rows(None).await.context("Failed to count rows")
    }
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| anyhow::anyhow!("Missing {} column", name))
}

// ============================================================================
// Tests
// ============================================================================
