//! REST + SSE endpoints.
//!
//! - `POST /api/conversations`                         — create a root node
//! - `POST /api/conversations/{node_id}/subchats`      — create a child node under it
//! - `POST /api/conversations/{node_id}/messages`      — non-streaming turn
//! - `POST /api/conversations/{node_id}/messages/stream` — SSE turn
//! - `GET  /api/conversations/{node_id}`               — node metadata
//! - `GET  /api/conversations/{node_id}/history`       — buffer contents
//! - `GET  /api/conversations/{node_id}/archive/stats` — archive record counts
//! - `DELETE /api/conversations/{node_id}`             — delete the subtree
//! - `GET  /health`                                    — liveness

use crate::SharedState;
use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::sse::{Event as SseEvent, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use canopy_core::{ContextType, Error, FollowUp, ForestError, NodeId};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::info;

pub fn api_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/conversations", post(create_conversation))
        .route(
            "/api/conversations/{node_id}/subchats",
            post(create_subchat),
        )
        .route(
            "/api/conversations/{node_id}/messages",
            post(send_message),
        )
        .route(
            "/api/conversations/{node_id}/messages/stream",
            post(send_message_stream),
        )
        .route(
            "/api/conversations/{node_id}",
            get(get_node).delete(delete_node),
        )
        .route("/api/conversations/{node_id}/history", get(get_history))
        .route(
            "/api/conversations/{node_id}/archive/stats",
            get(archive_stats),
        )
        .route("/health", get(health))
        .with_state(state)
}

// ── Request / Response types ──────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct CreateConversationRequest {
    #[serde(default)]
    title: Option<String>,
}

#[derive(Deserialize)]
struct CreateSubchatRequest {
    #[serde(default)]
    title: Option<String>,
    /// Text the user selected from the parent chat.
    #[serde(default)]
    selected_text: Option<String>,
    /// What the user wants to explore about the selection.
    #[serde(default)]
    follow_up_context: Option<String>,
    #[serde(default)]
    context_type: Option<ContextType>,
}

#[derive(Deserialize)]
struct MessageRequest {
    message: String,
    /// Skip archive retrieval for this turn.
    #[serde(default)]
    disable_rag: bool,
}

#[derive(Serialize)]
struct MessageResponse {
    response: String,
    conversation_title: Option<String>,
    usage: UsageDto,
}

#[derive(Serialize)]
struct UsageDto {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Serialize)]
struct NodeDto {
    node_id: String,
    title: String,
    parent_id: Option<String>,
    children: Vec<String>,
    path: Vec<String>,
    message_count: usize,
    created_at: String,
}

#[derive(Serialize)]
struct TurnDto {
    role: String,
    text: String,
    timestamp: String,
}

#[derive(Serialize)]
struct HistoryResponse {
    node_id: String,
    title: String,
    messages: Vec<TurnDto>,
    path: Vec<String>,
}

#[derive(Serialize)]
struct ArchiveStatsResponse {
    total_records: u64,
    conversations: Vec<NodeArchiveStatDto>,
}

#[derive(Serialize)]
struct NodeArchiveStatDto {
    node_id: String,
    records: u64,
}

#[derive(Serialize)]
struct DeleteResponse {
    deleted: usize,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

// ── Error mapping ─────────────────────────────────────────────────────────

fn error_response(err: &Error) -> Response {
    match err {
        Error::Forest(ForestError::NodeNotFound(_) | ForestError::ParentNotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: err.to_string(),
            }),
        )
            .into_response(),
        Error::Forest(ForestError::EmptyMessage) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: err.to_string(),
            }),
        )
            .into_response(),
        Error::PoolExhausted { retry_after_secs } => {
            let mut response = (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorBody {
                    error: err.to_string(),
                }),
            )
                .into_response();
            let value = HeaderValue::from_str(&retry_after_secs.to_string())
                .unwrap_or(HeaderValue::from_static("2"));
            response.headers_mut().insert(header::RETRY_AFTER, value);
            response
        }
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error: err.to_string(),
            }),
        )
            .into_response(),
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn create_conversation(
    State(state): State<SharedState>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Json<NodeDto>, Response> {
    let forest = state.orchestrator.forest();
    let node = forest.create_root(req.title).await;
    info!(node_id = %node.id(), "Conversation created via API");
    node_dto(&state, node.id()).await.map(Json)
}

async fn create_subchat(
    State(state): State<SharedState>,
    Path(parent_id): Path<String>,
    Json(req): Json<CreateSubchatRequest>,
) -> Result<Json<NodeDto>, Response> {
    let follow_up = if req.selected_text.is_some()
        || req.follow_up_context.is_some()
        || req.context_type.is_some()
    {
        Some(FollowUp {
            selected_text: req.selected_text,
            follow_up_context: req.follow_up_context,
            context_type: req.context_type.unwrap_or(ContextType::FollowUp),
        })
    } else {
        None
    };

    let forest = state.orchestrator.forest();
    let node = forest
        .create_child(&NodeId::from(&parent_id), req.title, follow_up)
        .await
        .map_err(|e| error_response(&e.into()))?;

    node_dto(&state, node.id()).await.map(Json)
}

async fn send_message(
    State(state): State<SharedState>,
    Path(node_id): Path<String>,
    Json(req): Json<MessageRequest>,
) -> Result<Json<MessageResponse>, Response> {
    let node_id = NodeId::from(&node_id);
    let outcome = state
        .orchestrator
        .send_message(&node_id, &req.message, req.disable_rag)
        .await
        .map_err(|e| error_response(&e))?;

    let title = match state.orchestrator.forest().get(&node_id).await {
        Ok(node) => Some(node.title().await),
        Err(_) => None,
    };

    Ok(Json(MessageResponse {
        response: outcome.response,
        conversation_title: title,
        usage: UsageDto {
            prompt_tokens: outcome.metrics.prompt_tokens,
            completion_tokens: outcome.metrics.completion_tokens,
            total_tokens: outcome.metrics.prompt_tokens + outcome.metrics.completion_tokens,
        },
    }))
}

async fn send_message_stream(
    State(state): State<SharedState>,
    Path(node_id): Path<String>,
    Json(req): Json<MessageRequest>,
) -> Result<Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>>, Response> {
    let node_id = NodeId::from(&node_id);
    let rx = state
        .orchestrator
        .clone()
        .send_message_stream(&node_id, &req.message, req.disable_rag)
        .await
        .map_err(|e| error_response(&e))?;

    // One JSON object per `data:` line, exactly as the orchestrator emits
    // them: token*, title?, then done | error.
    let stream = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(SseEvent::default().data(data))
    });

    Ok(Sse::new(stream))
}

async fn get_node(
    State(state): State<SharedState>,
    Path(node_id): Path<String>,
) -> Result<Json<NodeDto>, Response> {
    node_dto(&state, &NodeId::from(&node_id)).await.map(Json)
}

async fn get_history(
    State(state): State<SharedState>,
    Path(node_id): Path<String>,
) -> Result<Json<HistoryResponse>, Response> {
    let node_id = NodeId::from(&node_id);
    let forest = state.orchestrator.forest();
    let node = forest
        .get(&node_id)
        .await
        .map_err(|e| error_response(&e.into()))?;

    let messages = {
        let buffer = node.buffer().lock().await;
        buffer
            .recent(None)
            .into_iter()
            .map(|t| TurnDto {
                role: t.role.to_string(),
                text: t.text,
                timestamp: t.timestamp.to_rfc3339(),
            })
            .collect()
    };
    let path = forest
        .path_titles(&node_id)
        .await
        .map_err(|e| error_response(&e.into()))?;

    Ok(Json(HistoryResponse {
        node_id: node_id.to_string(),
        title: node.title().await,
        messages,
        path,
    }))
}

async fn delete_node(
    State(state): State<SharedState>,
    Path(node_id): Path<String>,
) -> Result<Json<DeleteResponse>, Response> {
    let deleted = state
        .orchestrator
        .forest()
        .delete(&NodeId::from(&node_id))
        .await
        .map_err(|e| error_response(&e.into()))?;

    Ok(Json(DeleteResponse { deleted }))
}

async fn archive_stats(
    State(state): State<SharedState>,
    Path(node_id): Path<String>,
) -> Result<Json<ArchiveStatsResponse>, Response> {
    // Validate the node exists so dead ids still 404 here.
    state
        .orchestrator
        .forest()
        .get(&NodeId::from(&node_id))
        .await
        .map_err(|e| error_response(&e.into()))?;

    let archive = state.orchestrator.archive();
    let total = archive
        .count()
        .await
        .map_err(|e| error_response(&e.into()))?;
    let stats = archive
        .stats()
        .await
        .map_err(|e| error_response(&e.into()))?;

    Ok(Json(ArchiveStatsResponse {
        total_records: total,
        conversations: stats
            .into_iter()
            .map(|(id, records)| NodeArchiveStatDto {
                node_id: id.to_string(),
                records,
            })
            .collect(),
    }))
}

async fn node_dto(state: &SharedState, node_id: &NodeId) -> Result<NodeDto, Response> {
    let forest = state.orchestrator.forest();
    let node = forest
        .get(node_id)
        .await
        .map_err(|e| error_response(&e.into()))?;
    let path = forest
        .path_titles(node_id)
        .await
        .map_err(|e| error_response(&e.into()))?;
    let message_count = node.buffer().lock().await.len();

    Ok(NodeDto {
        node_id: node.id().to_string(),
        title: node.title().await,
        parent_id: node.parent().map(|p| p.to_string()),
        children: node.children().await.iter().map(|c| c.to_string()).collect(),
        path,
        message_count,
        created_at: node.created_at().to_rfc3339(),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────
