//! 설정 모듈
//!
//! figment로 설정을 병합합니다.
//! 우선순위: 기본값 < `prorag.toml` < `OPENAI_API_KEY` 등 일반 환경변수 < `PRORAG_*` 환경변수
//!
//! ```text
//! PRORAG_SERVER__PORT=8080
//! PRORAG_RETRIEVAL__DEFAULT_TOP_K=30
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::knowledge::{Bm25Params, ChunkConfig, ChunkStrategy, RrfParams};
use crate::query::{PipelineDefaults, QueryStrategy, SearchMode};

/// 기본 설정 파일 이름
pub const CONFIG_FILE: &str = "prorag.toml";

/// 환경변수 접두사
const ENV_PREFIX: &str = "PRORAG_";

// ============================================================================
// Data Directory
// ============================================================================

/// 기본 데이터 디렉토리 (~/.local/share/.prorag 등)
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".prorag")
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

/// OpenAI 호환 API (임베딩 + 생성)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub llm_model: String,
    pub max_tokens: u32,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            embedding_model: "text-embedding-3-large".to_string(),
            embedding_dimension: 3072,
            llm_model: "gpt-4o".to_string(),
            max_tokens: 4096,
        }
    }
}

/// Jina 리랭커
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JinaConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
}

impl Default for JinaConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.jina.ai/v1".to_string(),
            model: "jina-reranker-v2-base-multilingual".to_string(),
        }
    }
}

/// 벡터 저장소 백엔드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    /// LanceDB (디스크)
    #[default]
    Lance,
    /// 프로세스 메모리 (테스트, 임시 실행)
    Memory,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub backend: VectorBackend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub default_chunk_size: usize,
    pub default_chunk_overlap: usize,
    pub default_strategy: ChunkStrategy,
    pub semantic_similarity_threshold: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: 512,
            default_chunk_overlap: 50,
            default_strategy: ChunkStrategy::Recursive,
            semantic_similarity_threshold: 0.85,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_top_k: usize,
    pub default_reranker_top_n: usize,
    pub default_temperature: f64,
    pub default_search_mode: SearchMode,
    pub default_query_strategy: QueryStrategy,
    pub default_vector_weight: f64,
    pub default_reranker_enabled: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: 20,
            default_reranker_top_n: 5,
            default_temperature: 0.1,
            default_search_mode: SearchMode::Hybrid,
            default_query_strategy: QueryStrategy::Direct,
            default_vector_weight: 0.7,
            default_reranker_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bm25Config {
    pub k1: f64,
    pub b: f64,
}

impl Default for Bm25Config {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RrfConfig {
    pub k: f64,
}

impl Default for RrfConfig {
    fn default() -> Self {
        Self { k: 60.0 }
    }
}

/// 토큰 단가 (USD / 1K tokens)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub embedding_per_1k: f64,
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            embedding_per_1k: 0.00013,
            prompt_per_1k: 0.005,
            completion_per_1k: 0.015,
        }
    }
}

impl PricingConfig {
    /// 임베딩/프롬프트/완성 토큰 수로 비용 추정
    pub fn estimate(&self, embedding_tokens: u64, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (embedding_tokens as f64 / 1000.0) * self.embedding_per_1k
            + (prompt_tokens as f64 / 1000.0) * self.prompt_per_1k
            + (completion_tokens as f64 / 1000.0) * self.completion_per_1k
    }
}

// ============================================================================
// RagConfig
// ============================================================================

/// 전체 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub data_dir: PathBuf,
    pub server: ServerConfig,
    pub openai: OpenAiConfig,
    pub jina: JinaConfig,
    pub vector_store: VectorStoreConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub bm25: Bm25Config,
    pub rrf: RrfConfig,
    pub pricing: PricingConfig,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            server: ServerConfig::default(),
            openai: OpenAiConfig::default(),
            jina: JinaConfig::default(),
            vector_store: VectorStoreConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            bm25: Bm25Config::default(),
            rrf: RrfConfig::default(),
            pricing: PricingConfig::default(),
        }
    }
}

impl RagConfig {
    /// 현재 디렉토리의 `prorag.toml` + 환경변수로 로드
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// 지정한 설정 파일 + 환경변수로 로드 (파일이 없으면 무시)
    pub fn load_from(path: &Path) -> Result<Self> {
        let config: Self = Self::figment(path)
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        config.validate()?;

        tracing::debug!("Configuration loaded (data_dir: {})", config.data_dir.display());
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::raw().only(&["OPENAI_API_KEY"]).map(|_| "openai.api_key".into()))
            .merge(Env::raw().only(&["OPENAI_BASE_URL"]).map(|_| "openai.base_url".into()))
            .merge(Env::raw().only(&["JINA_API_KEY"]).map(|_| "jina.api_key".into()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// 범위를 벗어난 설정값 거부
    pub fn validate(&self) -> Result<()> {
        let weight = self.retrieval.default_vector_weight;
        if !(0.0..=1.0).contains(&weight) {
            anyhow::bail!("retrieval.default_vector_weight must be within [0, 1], got {}", weight);
        }
        if !(0.0..=2.0).contains(&self.retrieval.default_temperature) {
            anyhow::bail!(
                "retrieval.default_temperature must be within [0, 2], got {}",
                self.retrieval.default_temperature
            );
        }
        if self.retrieval.default_top_k == 0 || self.retrieval.default_reranker_top_n == 0 {
            anyhow::bail!("retrieval.default_top_k and default_reranker_top_n must be positive");
        }
        if self.bm25.k1 <= 0.0 {
            anyhow::bail!("bm25.k1 must be positive, got {}", self.bm25.k1);
        }
        if !(0.0..=1.0).contains(&self.bm25.b) {
            anyhow::bail!("bm25.b must be within [0, 1], got {}", self.bm25.b);
        }
        if self.rrf.k <= 0.0 {
            anyhow::bail!("rrf.k must be positive, got {}", self.rrf.k);
        }
        let threshold = self.chunking.semantic_similarity_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            anyhow::bail!(
                "chunking.semantic_similarity_threshold must be within [0, 1], got {}",
                threshold
            );
        }
        if self.openai.embedding_dimension == 0 {
            anyhow::bail!("openai.embedding_dimension must be positive");
        }
        self.default_chunk_config()
            .validate()
            .context("Invalid chunking defaults")?;
        Ok(())
    }

    pub fn default_chunk_config(&self) -> ChunkConfig {
        ChunkConfig::new(
            self.chunking.default_strategy,
            self.chunking.default_chunk_size,
            self.chunking.default_chunk_overlap,
        )
    }

    pub fn bm25_params(&self) -> Bm25Params {
        Bm25Params::new(self.bm25.k1, self.bm25.b)
    }

    pub fn rrf_params(&self) -> RrfParams {
        RrfParams::new(self.rrf.k)
    }

    /// 요청에서 생략된 필드에 적용할 기본값
    pub fn pipeline_defaults(&self) -> PipelineDefaults {
        PipelineDefaults {
            top_k: self.retrieval.default_top_k,
            reranker_top_n: self.retrieval.default_reranker_top_n,
            temperature: self.retrieval.default_temperature,
            search_mode: self.retrieval.default_search_mode,
            query_strategy: self.retrieval.default_query_strategy,
            vector_weight: self.retrieval.default_vector_weight,
            reranker_enabled: self.retrieval.default_reranker_enabled,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("prorag.db")
    }

    pub fn lance_path(&self) -> PathBuf {
        self.data_dir.join("vectors.lance")
    }
}

// ============================================================================
// Tests
// ============================================================================
