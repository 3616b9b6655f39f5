//! Operator-facing HTTP surface.

use std::future::Future;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

use crate::error::{ArmError, StopError};
use crate::fleet::Fleet;
use crate::metrics;
use crate::session::ArmRequest;

pub fn build_router(fleet: Fleet) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/metrics", get(render_metrics))
        .route("/nodes", get(list_nodes))
        .route("/session", get(session_status))
        .route("/session/arm", post(arm_session))
        .route("/session/stop", post(stop_session))
        .route("/session/abort", post(abort_session))
        .with_state(fleet)
}

pub async fn serve<F>(fleet: Fleet, listener: TcpListener, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(target = "fleet::http", addr = %addr, "control surface listening");
    }
    axum::serve(listener, build_router(fleet))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health_check() -> &'static str {
    "ok"
}

async fn render_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

async fn list_nodes(State(fleet): State<Fleet>) -> impl IntoResponse {
    Json(fleet.registry_snapshot().await)
}

async fn session_status(State(fleet): State<Fleet>) -> Response {
    match fleet.session_status().await {
        Some(session) => Json(session).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no_session", "message": "no session has been armed" })),
        )
            .into_response(),
    }
}

async fn arm_session(State(fleet): State<Fleet>, Json(request): Json<ArmRequest>) -> Result<Response, ApiError> {
    let report = fleet.arm(request).await?;
    Ok(Json(report).into_response())
}

async fn stop_session(State(fleet): State<Fleet>) -> Result<Response, ApiError> {
    let outcome = fleet.stop().await?;
    Ok(Json(outcome).into_response())
}

async fn abort_session(State(fleet): State<Fleet>) -> Result<Response, ApiError> {
    let outcome = fleet.abort().await?;
    Ok(Json(outcome).into_response())
}

#[derive(Debug)]
pub enum ApiError {
    Arm(ArmError),
    Stop(StopError),
}

impl From<ArmError> for ApiError {
    fn from(err: ArmError) -> Self {
        ApiError::Arm(err)
    }
}

impl From<StopError> for ApiError {
    fn from(err: StopError) -> Self {
        ApiError::Stop(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, detail) = match &self {
            ApiError::Arm(err) => {
                let status = match err {
                    ArmError::EmptyRequest => StatusCode::BAD_REQUEST,
                    ArmError::SessionActive { .. } => StatusCode::CONFLICT,
                    ArmError::QuorumNotMet { .. }
                    | ArmError::NoEligibleNodes { .. }
                    | ArmError::Aborted { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    ArmError::CoordinatorClosed => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, err.to_string(), serde_json::to_value(err))
            }
            ApiError::Stop(err) => {
                let status = match err {
                    StopError::NoActiveSession => StatusCode::CONFLICT,
                    StopError::CoordinatorClosed => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, err.to_string(), serde_json::to_value(err))
            }
        };
        let mut body = detail.unwrap_or_else(|_| json!({}));
        if let Some(fields) = body.as_object_mut() {
            fields.insert("message".into(), message.into());
        }
        (status, Json(body)).into_response()
    }
}
