//! HTTP 서버 - axum
//!
//! - `POST /api/query`: SSE 스트림 (`metadata` → `token`* → `done` | `error`, 이후 `data: [DONE]`)
//! - `GET /api/query-logs?page=&limit=`: 질의 로그 목록 (최신순)
//! - `GET /api/query-logs/:id`: 질의 로그 상세
//!
//! 응답 스트림이 drop되면(클라이언트 연결 종료) 실행 중인 파이프라인을 취소합니다.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{stream, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::app::RagApp;
use crate::error::RagError;
use crate::query::{PipelineEvent, QueryLog, QueryLogPage, QueryRequest, EVENT_BUFFER};

/// 목록 기본 페이지 크기
const DEFAULT_PAGE_LIMIT: usize = 20;

// ============================================================================
// Router
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    app: Arc<RagApp>,
}

pub fn router(app: Arc<RagApp>) -> Router {
    Router::new()
        .route("/api/query", post(query))
        .route("/api/query-logs", get(list_query_logs))
        .route("/api/query-logs/:id", get(get_query_log))
        .with_state(AppState { app })
}

/// Ctrl-C까지 서비스
pub async fn serve(app: Arc<RagApp>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, router(app))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await
        .context("HTTP server failed")
}

// ============================================================================
// Handlers
// ============================================================================

async fn query(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, RagError> {
    let Json(request) = payload.map_err(|e| RagError::validation(e.body_text()))?;

    let pipeline = state.app.pipeline();
    let prepared = pipeline.prepare(&request).await?;

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    tokio::spawn(async move {
        pipeline.stream(prepared, tx, cancel).await;
    });

    let events = ReceiverStream::new(rx).map(move |event| {
        // 응답 스트림과 함께 drop되어 실행을 취소
        let _guard = &guard;
        Ok(sse_event(&event))
    });
    let done = stream::once(async { Ok(Event::default().data("[DONE]")) });

    Ok(Sse::new(events.chain(done)).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
struct PageParams {
    page: Option<usize>,
    limit: Option<usize>,
}

async fn list_query_logs(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Json<QueryLogPage>, RagError> {
    let page = params.page.unwrap_or(1);
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    Ok(Json(state.app.query_logs(page, limit)?))
}

async fn get_query_log(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<QueryLog>, RagError> {
    Ok(Json(state.app.query_log(id)?))
}

// ============================================================================
// Helper Functions
// ============================================================================

/// `event: <type>` + `data: {"type": .., "data": ..}`
fn sse_event(event: &PipelineEvent) -> Event {
    let frame = Event::default().event(event.kind());
    match serde_json::to_string(event) {
        Ok(json) => frame.data(json),
        Err(e) => {
            tracing::error!("Failed to serialize {} event: {}", event.kind(), e);
            frame.data(r#"{"type":"error","data":{"message":"event serialization failed"}}"#)
        }
    }
}

fn status_of(err: &RagError) -> StatusCode {
    match err {
        RagError::Validation(_) => StatusCode::BAD_REQUEST,
        RagError::NotFound(_) => StatusCode::NOT_FOUND,
        RagError::Collaborator { .. } => StatusCode::BAD_GATEWAY,
        RagError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        RagError::Pipeline(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for RagError {
    fn into_response(self) -> Response {
        let status = status_of(&self);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(serde_json::json!({ "message": self.to_string() }))).into_response()
    }
}

// ============================================================================
// Tests
// ============================================================================
