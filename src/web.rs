//! HTTP surface: event callbacks from Lark, the admin API and the live SSE feed.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::admin::{Admin, InvalidInput, NotFound};
use crate::bot::Bot;
use crate::broadcast::{Broadcaster, GLOBAL_TOPIC};
use crate::platform::event::{parse_callback, InboundEvent};
use crate::store::rules::RuleDraft;
use crate::store::tasks::TaskDraft;

const DEFAULT_LOG_LIMIT: usize = 50;
const MAX_LOG_LIMIT: usize = 500;

// ── Shared state ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub bot: Arc<Bot>,
    pub admin: Arc<Admin>,
    pub broadcaster: Broadcaster,
    /// Used to detect mentions of the bot in inbound messages.
    pub bot_open_id: Option<String>,
    /// When set, callbacks carrying a different token are rejected.
    pub verification_token: Option<String>,
}

// ── Errors ─────────────────────────────────────────────────────────────────────

/// Maps admin failures onto status codes with a `{"error": ..}` body.
pub struct ApiError(anyhow::Error);

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.downcast_ref::<NotFound>().is_some() {
            StatusCode::NOT_FOUND
        } else if self.0.downcast_ref::<InvalidInput>().is_some() {
            StatusCode::BAD_REQUEST
        } else {
            warn!("Admin request failed: {:#}", self.0);
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(json!({ "error": format!("{:#}", self.0) }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

fn ok() -> serde_json::Value {
    json!({ "ok": true })
}

// ── Request types ──────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    chat_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MessagesQuery {
    #[serde(default)]
    chat_id: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct SendRequest {
    #[serde(default)]
    chat_id: String,
    #[serde(default)]
    msg_type: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct SyncRequest {
    #[serde(default)]
    open_ids: Vec<String>,
    #[serde(default)]
    force: bool,
}

// ── Router ─────────────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook/event", post(handle_event_callback))
        .route("/api/events", get(handle_sse_events))
        .route("/api/messages", get(list_messages))
        .route("/api/messages/send", post(send_message))
        .route("/api/rules", get(list_rules).post(create_rule))
        .route(
            "/api/rules/{id}",
            get(get_rule).put(update_rule).delete(delete_rule),
        )
        .route("/api/rules/{id}/toggle", post(toggle_rule))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route(
            "/api/tasks/{id}",
            get(get_task).put(update_task).delete(delete_task),
        )
        .route("/api/tasks/{id}/toggle", post(toggle_task))
        .route("/api/tasks/{id}/run", post(run_task))
        .route("/api/users", get(list_users))
        .route("/api/users/sync", post(sync_users))
        .route("/api/users/{open_id}", get(get_user))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(state: AppState, port: u16, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;
    Ok(())
}

// ── Event callback ─────────────────────────────────────────────────────────────

/// POST /webhook/event: acknowledge at once, process in the background.
async fn handle_event_callback(State(state): State<AppState>, body: Bytes) -> Response {
    let callback = match parse_callback(&body, state.bot_open_id.as_deref()) {
        Ok(callback) => callback,
        Err(e) => {
            warn!("Rejected event callback: {:#}", e);
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": format!("{:#}", e) })))
                .into_response();
        }
    };

    if let Some(expected) = state.verification_token.as_deref().filter(|t| !t.is_empty()) {
        if callback.token.as_deref() != Some(expected) {
            warn!("Event callback with invalid verification token");
            return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid token" })))
                .into_response();
        }
    }

    match callback.event {
        InboundEvent::UrlVerification { challenge } => {
            return Json(json!({ "challenge": challenge })).into_response();
        }
        InboundEvent::Message(msg) => {
            let bot = Arc::clone(&state.bot);
            tokio::spawn(async move {
                bot.on_message(msg).await;
            });
        }
        InboundEvent::Recalled {
            message_id,
            chat_id,
        } => {
            let bot = Arc::clone(&state.bot);
            tokio::spawn(async move {
                bot.on_recall(&message_id, &chat_id).await;
            });
        }
        InboundEvent::Ignored { event_type } => {
            debug!("Ignoring event type {}", event_type);
        }
    }

    Json(json!({ "code": 0 })).into_response()
}

// ── Live feed ──────────────────────────────────────────────────────────────────

/// GET /api/events: SSE stream of broadcast events for one chat, or all of them.
async fn handle_sse_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let topic = query.chat_id.unwrap_or_else(|| GLOBAL_TOPIC.to_string());
    // Dropping the stream when the client disconnects unsubscribes.
    let subscription = state.broadcaster.subscribe(&topic);
    debug!(
        "SSE client joined '{}' ({} listening)",
        topic,
        state.broadcaster.subscriber_count(&topic)
    );
    let stream = subscription.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok::<_, Infallible>(Event::default().data(data))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// GET /api/messages: recent message history.
async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT);
    let chat_id = query.chat_id.filter(|c| !c.is_empty());
    state
        .admin
        .store()
        .recent_logs(chat_id.as_deref(), limit)
        .await
        .map(Json)
        .map_err(ApiError::from)
}

/// POST /api/messages/send: ad-hoc message, logged and broadcast like any other send.
async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendRequest>,
) -> ApiResult<serde_json::Value> {
    let message_id = state
        .admin
        .send_message(&request.chat_id, &request.msg_type, &request.content)
        .await?;
    Ok(Json(json!({ "message_id": message_id })))
}

// ── Rules ──────────────────────────────────────────────────────────────────────

async fn list_rules(State(state): State<AppState>) -> impl IntoResponse {
    state.admin.list_rules().await.map(Json).map_err(ApiError::from)
}

async fn get_rule(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    state.admin.get_rule(id).await.map(Json).map_err(ApiError::from)
}

async fn create_rule(
    State(state): State<AppState>,
    Json(draft): Json<RuleDraft>,
) -> impl IntoResponse {
    state
        .admin
        .create_rule(&draft)
        .await
        .map(|rule| (StatusCode::CREATED, Json(rule)))
        .map_err(ApiError::from)
}

async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(draft): Json<RuleDraft>,
) -> ApiResult<serde_json::Value> {
    state.admin.update_rule(id, &draft).await?;
    Ok(Json(ok()))
}

async fn delete_rule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    state.admin.delete_rule(id).await?;
    Ok(Json(ok()))
}

async fn toggle_rule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    state.admin.toggle_rule(id).await?;
    Ok(Json(ok()))
}

// ── Tasks ──────────────────────────────────────────────────────────────────────

async fn list_tasks(State(state): State<AppState>) -> impl IntoResponse {
    state.admin.list_tasks().await.map(Json).map_err(ApiError::from)
}

async fn get_task(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    state.admin.get_task(id).await.map(Json).map_err(ApiError::from)
}

async fn create_task(
    State(state): State<AppState>,
    Json(draft): Json<TaskDraft>,
) -> impl IntoResponse {
    state
        .admin
        .create_task(&draft)
        .await
        .map(|entry| (StatusCode::CREATED, Json(entry)))
        .map_err(ApiError::from)
}

async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(draft): Json<TaskDraft>,
) -> impl IntoResponse {
    state
        .admin
        .update_task(id, &draft)
        .await
        .map(Json)
        .map_err(ApiError::from)
}

async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    state.admin.delete_task(id).await?;
    Ok(Json(ok()))
}

async fn toggle_task(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    state
        .admin
        .toggle_task(id)
        .await
        .map(Json)
        .map_err(ApiError::from)
}

async fn run_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    let message_id = state.admin.run_task(id).await?;
    Ok(Json(json!({ "message_id": message_id })))
}

// ── Users ──────────────────────────────────────────────────────────────────────

/// POST /api/users/sync: an empty id list refreshes every known user.
async fn sync_users(
    State(state): State<AppState>,
    Json(request): Json<SyncRequest>,
) -> impl IntoResponse {
    let result = if request.open_ids.is_empty() {
        state.admin.sync_all_users().await
    } else {
        state.admin.sync_users(request.open_ids, request.force).await
    };
    result.map(Json).map_err(ApiError::from)
}

async fn list_users(State(state): State<AppState>) -> impl IntoResponse {
    state.admin.list_users().await.map(Json).map_err(ApiError::from)
}

async fn get_user(
    State(state): State<AppState>,
    Path(open_id): Path<String>,
) -> impl IntoResponse {
    state
        .admin
        .get_user(&open_id)
        .await
        .map(Json)
        .map_err(ApiError::from)
}

// ── Tests ──────────────────────────────────────────────────────────────────────
