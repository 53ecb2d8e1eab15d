//! HTTP / SSE 接口
//!
//! - GET  /health
//! - POST /api/chat                  {message, sessionId?, stream?, context?}
//! - GET  /api/chat?message=&sessionId=&stream=true   （浏览器 EventSource 只能发 GET）
//! - GET  /api/status
//! - GET  /api/sessions/:id/history
//! - DELETE /api/sessions/:id
//!
//! 流式响应一旦写出头部，之后的错误只能以 `error` 事件在流内下发。

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::Utc;
use futures_util::stream;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{TurnContext, TurnExecutor};
use crate::config::AppConfig;
use crate::core::AgentError;
use crate::gateway::{new_session_id, SessionLocks, SseConnection, ToolApprovalCorrelator};
use crate::memory::{ConversationStore, Message};
use crate::runtime::RuntimeHandle;

/// 每条 SSE 连接的帧缓冲
const SSE_BUFFER: usize = 64;

/// 组合根构造的共享服务，按引用注入各 handler
#[derive(Clone)]
pub struct AppState {
    pub executor: TurnExecutor,
    pub runtime: RuntimeHandle,
    pub store: Arc<ConversationStore>,
    pub approvals: Arc<ToolApprovalCorrelator>,
    pub locks: Arc<SessionLocks>,
    pub environment: String,
    pub heartbeat: Duration,
    /// 进程关闭时取消，所有 SSE 连接随之结束
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(cfg: &AppConfig, runtime: RuntimeHandle, shutdown: CancellationToken) -> Self {
        let store = Arc::new(ConversationStore::new());
        let approvals = Arc::new(ToolApprovalCorrelator::from_config(&cfg.approval));
        let locks = Arc::new(SessionLocks::new());
        let executor = TurnExecutor::from_config(
            cfg,
            runtime.clone(),
            store.clone(),
            approvals.clone(),
            locks.clone(),
        );
        Self {
            executor,
            runtime,
            store,
            approvals,
            locks,
            environment: cfg.app.environment.clone(),
            heartbeat: cfg.server.heartbeat_interval(),
            shutdown,
        }
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = if self.is_client_error() {
            tracing::debug!(error = %self, "Rejected invalid request");
            json!({ "error": self.to_string(), "code": self.code() })
        } else {
            tracing::error!(error = %self, code = self.code(), "Chat request failed");
            let error = if status == StatusCode::SERVICE_UNAVAILABLE {
                "Agent unavailable"
            } else {
                "Internal server error"
            };
            json!({ "error": error, "message": self.to_string(), "code": self.code() })
        };
        (status, Json(body)).into_response()
    }
}

/// 校验后的聊天请求
#[derive(Debug, Clone, PartialEq)]
struct ChatRequest {
    message: String,
    session_id: String,
    stream: bool,
    metadata: Option<Value>,
}

fn missing_message() -> AgentError {
    AgentError::InvalidInput("Message is required and must be a string".to_string())
}

impl ChatRequest {
    /// JSON 请求体：message 必须是非空字符串；sessionId 缺省时生成
    fn from_json(body: &[u8]) -> Result<Self, AgentError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|_| AgentError::InvalidInput("Request body must be valid JSON".to_string()))?;
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(missing_message)?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(new_session_id);
        Ok(Self {
            message: message.to_string(),
            session_id,
            stream: value.get("stream").and_then(Value::as_bool).unwrap_or(false),
            metadata: value.get("context").cloned(),
        })
    }

    fn from_query(params: &HashMap<String, String>) -> Result<Self, AgentError> {
        let message = params
            .get("message")
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(missing_message)?;
        let session_id = params
            .get("sessionId")
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .unwrap_or_else(new_session_id);
        Ok(Self {
            message: message.clone(),
            session_id,
            stream: params.get("stream").is_some_and(|s| s == "true"),
            metadata: None,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatResponse {
    id: String,
    content: String,
    role: &'static str,
    timestamp: String,
    session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    session_id: String,
    messages: Vec<Message>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat_post).get(chat_get))
        .route("/api/status", get(status))
        .route("/api/sessions/:id/history", get(session_history))
        .route("/api/sessions/:id", axum::routing::delete(session_clear))
        .with_state(state)
}

/// 绑定端口并服务，直到 shutdown 被取消
pub async fn serve(cfg: &AppConfig, state: AppState) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port).parse()?;
    let shutdown = state.shutdown.clone();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("flowdesk listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "environment": state.environment,
    }))
}

async fn chat_post(State(state): State<AppState>, body: Bytes) -> Result<Response, AgentError> {
    let req = ChatRequest::from_json(&body)?;
    handle_chat(state, req).await
}

async fn chat_get(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AgentError> {
    let req = ChatRequest::from_query(&params)?;
    handle_chat(state, req).await
}

async fn handle_chat(state: AppState, req: ChatRequest) -> Result<Response, AgentError> {
    let ctx = TurnContext {
        session_id: req.session_id.clone(),
        metadata: req.metadata,
    };

    if req.stream {
        let events = state
            .executor
            .run_turn_streamed(&req.session_id, &req.message, ctx)?;
        return Ok(sse_response(&state, req.session_id, events));
    }

    let result = state
        .executor
        .run_turn(&req.session_id, &req.message, ctx)
        .await?;
    Ok(Json(ChatResponse {
        id: uuid::Uuid::new_v4().to_string(),
        content: result.final_output,
        role: "assistant",
        timestamp: Utc::now().to_rfc3339(),
        session_id: req.session_id,
    })
    .into_response())
}

/// 启动连接驱动任务，把帧通道接到 Sse 响应体；客户端断开时响应体被丢弃，驱动任务随即停止
fn sse_response(
    state: &AppState,
    session_id: String,
    events: crate::agent::TurnEventStream,
) -> Response {
    let (tx, rx) = mpsc::channel::<Event>(SSE_BUFFER);
    let conn = SseConnection::new(session_id, tx, state.approvals.clone(), state.heartbeat);
    tokio::spawn(conn.run(events, state.shutdown.child_token()));

    let frames = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (Ok::<_, Infallible>(frame), rx))
    });
    Sse::new(frames).into_response()
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "runtime": {
            "state": state.runtime.state(),
            "lastHealthCheck": state.runtime.last_health_check().map(|t| t.to_rfc3339()),
        },
        "sessions": state.store.count().await,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn session_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<HistoryResponse> {
    let messages = state.store.get(&id).await;
    Json(HistoryResponse {
        session_id: id,
        messages,
    })
}

async fn session_clear(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let existed = state.store.clear(&id).await;
    state.approvals.clear(&id);
    // 进行中的轮次仍持有锁时保留，后续请求继续排队
    let lock_released = state.locks.remove(&id);
    tracing::info!(session_id = %id, existed, lock_released, "Session cleared");
    Json(json!({ "sessionId": id, "cleared": true }))
}
