//! HTTP front door: turns `POST /publish` into one request-reply exchange.
//!
//! - `POST /publish` `{"message": ...}`: 200 with the reply body.
//! - 400 on an undecodable body, 408 on timeout, 503 while shutting down,
//!   502 on a correlation mismatch, 500 on any other broker failure.
//!   Error bodies are `{"message": ...}`.
//! - `GET /health`: 200 `ok`.

use crate::broker::Broker;
use crate::correlator::ReplyCorrelator;
use crate::error::{Error, Result};
use crate::model::ReplyOutcome;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct AppState<B: Broker> {
    pub correlator: ReplyCorrelator<B>,
    pub request_timeout: Duration,
}

impl<B: Broker> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            correlator: self.correlator.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

pub fn router<B: Broker>(state: AppState<B>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/publish", post(publish::<B>))
        .with_state(state)
}

/// Serve `router` until `shutdown` is cancelled, then let in-flight
/// requests finish.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "http front door listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("http front door stopped");
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn publish<B: Broker>(State(state): State<AppState<B>>, body: Bytes) -> Response {
    match state
        .correlator
        .send_raw(&body, state.request_timeout)
        .await
    {
        Ok(ReplyOutcome::Replied(reply)) => (StatusCode::OK, axum::Json(reply)).into_response(),
        Ok(ReplyOutcome::TimedOut { .. }) => {
            error_response(StatusCode::REQUEST_TIMEOUT, "request timeout")
        }
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                error!("publish failed: {e}");
            }
            error_response(status, &e.to_string())
        }
    }
}

fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::Decode(_) => StatusCode::BAD_REQUEST,
        Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        Error::CorrelationMismatch { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, axum::Json(json!({ "message": message }))).into_response()
}
