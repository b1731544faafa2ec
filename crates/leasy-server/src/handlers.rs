//! REST handlers for the reliable path: conversations, messages, users and
//! unread markers. The live push never originates here; senders publish
//! their confirmed payloads over the socket once these handlers succeed.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use leasy_core::ids::{ConversationId, UserId};
use leasy_core::wire::ChatPayload;
use leasy_store::conversations::ConversationRepo;
use leasy_store::users::UserRepo;
use leasy_store::{Database, StoreError};
use leasy_telemetry::MetricsRecorder;

use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;
use crate::server::ServerConfig;

/// Shared state available to all handlers and socket tasks.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<MessageRouter>,
    pub metrics: Option<Arc<MetricsRecorder>>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn users(&self) -> UserRepo {
        UserRepo::new(self.db.clone())
    }

    pub fn conversations(&self) -> ConversationRepo {
        ConversationRepo::new(self.db.clone())
    }
}

/// JSON error response with the original status conventions: 400 for bad
/// input, 404 for unknown entities, 409 for conflicts, 500 otherwise.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

// ── Conversations ──

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub host_id: String,
    pub applicant_id: String,
}

pub async fn create_conversation(
    State(state): State<AppState>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.host_id.is_empty() {
        return Err(ApiError::bad_request(
            "one party of the conversation (the host) was not specified",
        ));
    }
    if req.applicant_id.is_empty() {
        return Err(ApiError::bad_request(
            "one party of the conversation (the applicant) was not specified",
        ));
    }

    let repo = state.conversations();
    let row = repo.create_or_fetch(
        &UserId::from_raw(req.host_id),
        &UserId::from_raw(req.applicant_id),
    )?;
    let view = repo.get(&row.id)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "conversation ready",
            "conversation": view,
        })),
    ))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state
        .conversations()
        .get(&ConversationId::from_raw(conversation_id))?;
    Ok(Json(json!({ "conversation": view })))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let views = state
        .conversations()
        .list_for_participant(&UserId::from_raw(user_id))?;
    Ok(Json(json!({ "conversations": views })))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .conversations()
        .delete(&ConversationId::from_raw(conversation_id))?;
    Ok(Json(json!({ "message": "conversation deleted" })))
}

// ── Messages ──

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub sender_id: String,
    pub recipient_id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
}

/// Persist a message. Returns the stored row including its assigned
/// timestamp; the caller publishes the confirmed payload over its live
/// connection only after this succeeds.
pub async fn send_message(
    State(state): State<AppState>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.sender_id.is_empty() {
        return Err(ApiError::bad_request(
            "the sender of the message was not specified",
        ));
    }
    if req.recipient_id.is_empty() {
        return Err(ApiError::bad_request(
            "the recipient of the message was not specified",
        ));
    }

    let payload = ChatPayload {
        sender: UserId::from_raw(req.sender_id),
        recipient: UserId::from_raw(req.recipient_id),
        text: req.text,
        file: req.file,
    };

    let row = state.conversations().append_message(&payload)?;
    if let Some(metrics) = &state.metrics {
        metrics.counter_inc("messages.persisted", &[], 1);
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "message created and appended",
            "new_message": row,
        })),
    ))
}

// ── Users & unread markers ──

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub firstname: String,
    pub lastname: String,
    #[serde(default)]
    pub profile_picture: Option<String>,
}

pub async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let identity =
        state
            .users()
            .create(&req.firstname, &req.lastname, req.profile_picture.as_deref())?;
    Ok((StatusCode::CREATED, Json(json!({ "user": identity }))))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let profile = state.users().profile(&UserId::from_raw(user_id))?;
    Ok(Json(json!({ "user": profile })))
}

#[derive(Debug, Deserialize)]
pub struct UnreadRequest {
    pub sender_id: String,
    pub recipient_id: String,
}

pub async fn add_unread(
    State(state): State<AppState>,
    Json(req): Json<UnreadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.sender_id.is_empty() {
        return Err(ApiError::bad_request(
            "sender of the unread message not specified",
        ));
    }
    if req.recipient_id.is_empty() {
        return Err(ApiError::bad_request(
            "recipient of the unread message not specified",
        ));
    }
    state.users().add_unread(
        &UserId::from_raw(req.recipient_id),
        &UserId::from_raw(req.sender_id),
    )?;
    Ok(Json(json!({ "message": "unread marker added" })))
}

pub async fn remove_unread(
    State(state): State<AppState>,
    Json(req): Json<UnreadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.sender_id.is_empty() {
        return Err(ApiError::bad_request(
            "sender of the unread message not specified",
        ));
    }
    if req.recipient_id.is_empty() {
        return Err(ApiError::bad_request(
            "recipient of the unread message not specified",
        ));
    }
    state.users().remove_unread(
        &UserId::from_raw(req.recipient_id),
        &UserId::from_raw(req.sender_id),
    )?;
    Ok(Json(json!({ "message": "unread marker removed" })))
}

// ── Health ──

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "connections": state.registry.count(),
    }))
}
