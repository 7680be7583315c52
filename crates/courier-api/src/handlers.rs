//! Ingress request handlers.
//!
//! The ingress never exposes internal error wording: binding failures echo
//! the rejection message, store failures answer with a generic body.

use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use courier_core::models::Message;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::AppState;

/// Deadline for store calls made on behalf of a request.
const STORE_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Request body for message intake.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    /// Recipient address.
    pub to: String,
    /// Message payload.
    pub content: String,
}

/// Response body for accepted messages.
#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    /// Always `"Accepted"`.
    pub message: String,
    /// The 24-hex id assigned to the message.
    #[serde(rename = "messageId")]
    pub message_id: String,
}

/// Response body for message listings.
#[derive(Debug, Serialize)]
pub struct ListMessagesResponse {
    /// All message records with their current status.
    pub messages: Vec<Message>,
}

/// Uniform error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Binding message or a generic description.
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: message.into() })).into_response()
}

/// Accepts a message for delivery.
#[instrument(name = "send_message", skip_all)]
pub async fn send_message(
    State(state): State<AppState>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text());
        },
    };

    if request.to.trim().is_empty() || request.content.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "to and content are required");
    }

    let message = Message::new(request.to, request.content, Utc::now());

    let stored =
        tokio::time::timeout(STORE_CALL_TIMEOUT, state.repository.create(&message)).await;
    match stored {
        Ok(Ok(())) => {
            info!(message_id = %message.id, "message accepted");
            (
                StatusCode::OK,
                Json(SendMessageResponse {
                    message: "Accepted".to_string(),
                    message_id: message.id.to_hex(),
                }),
            )
                .into_response()
        },
        Ok(Err(err)) => {
            error!(error = %err, "failed to store message");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to store message")
        },
        Err(_) => {
            error!("store call timed out");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to store message")
        },
    }
}

/// Lists all messages with their current status.
#[instrument(name = "list_messages", skip_all)]
pub async fn list_messages(State(state): State<AppState>) -> Response {
    let listed = tokio::time::timeout(STORE_CALL_TIMEOUT, state.repository.list()).await;
    match listed {
        Ok(Ok(messages)) => {
            (StatusCode::OK, Json(ListMessagesResponse { messages })).into_response()
        },
        Ok(Err(err)) => {
            error!(error = %err, "failed to list messages");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to list messages")
        },
        Err(_) => {
            error!("store call timed out");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to list messages")
        },
    }
}

/// Starts the producer scheduler (idempotent).
#[instrument(name = "start_scheduler", skip_all)]
pub async fn start_scheduler(State(state): State<AppState>) -> Response {
    state.scheduler.start().await;
    (StatusCode::OK, Json(serde_json::json!({ "status": "scheduler started" }))).into_response()
}

/// Stops the producer scheduler (idempotent).
#[instrument(name = "stop_scheduler", skip_all)]
pub async fn stop_scheduler(State(state): State<AppState>) -> Response {
    state.scheduler.stop().await;
    (StatusCode::OK, Json(serde_json::json!({ "status": "scheduler stopped" }))).into_response()
}

/// Reports aggregate dependency health.
#[instrument(name = "status", skip_all)]
pub async fn status(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(state.health.check().await)).into_response()
}
