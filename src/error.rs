//! 에러 분류
//!
//! 질의 파이프라인의 에러 분류입니다.
//! - Validation: 파이프라인 시작 전 요청 파라미터 거부
//! - NotFound: 프롬프트 템플릿, 문서, 질의 로그 없음
//! - Collaborator: 임베딩 / 벡터 저장소 / 리랭커 / 생성 호출 실패
//! - Cancelled: 요청 단위 취소 (클라이언트 연결 종료 등)
//! - Pipeline: 그 외 실행 중 예기치 못한 실패

use thiserror::Error;

/// 파이프라인 에러
#[derive(Debug, Error)]
pub enum RagError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{service} error: {message}")]
    Collaborator {
        service: &'static str,
        message: String,
    },

    #[error("Query cancelled")]
    Cancelled,

    #[error(transparent)]
    Pipeline(#[from] anyhow::Error),
}

impl RagError {
    /// 외부 협력자 호출 실패로 분류
    ///
    /// anyhow 체인 전체를 메시지로 보존합니다.
    pub fn collaborator(service: &'static str, err: anyhow::Error) -> Self {
        Self::Collaborator {
            service,
            message: format!("{:#}", err),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

pub type Result<T> = std::result::Result<T, RagError>;
