//! Ingress router construction and serving.
//!
//! All `/api/v1` routes sit behind the try-mode rate limiter; a request
//! that finds the bucket empty is answered 429 without waiting. Tracing
//! and a request timeout wrap the whole router.

use std::{net::SocketAddr, time::Duration};

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::{handlers, AppState};

/// Request timeout applied to the whole router.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates the `/api/v1` router with middleware.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/messages", post(handlers::send_message).get(handlers::list_messages))
        .route("/scheduler/start", post(handlers::start_scheduler))
        .route("/scheduler/stop", post(handlers::stop_scheduler))
        .route("/status", get(handlers::status))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
}

/// Answers 429 without waiting when the ingress bucket is empty.
async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if state.limiter.try_acquire() {
        next.run(request).await
    } else {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({ "error": "Rate limit exceeded" })),
        )
            .into_response()
    }
}

/// Serves the ingress API until cancelled.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound.
pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "ingress API started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("ingress API stopped");
    Ok(())
}
