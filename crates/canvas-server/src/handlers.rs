use axum::{
    Json,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use canvas_authz::RefresherStats;
use canvas_cache::CacheSnapshot;
use canvas_core::validate_id;
use serde::Serialize;
use serde_json::json;

use crate::metrics;
use crate::server::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
pub struct AuthzSnapshot {
    pub cache: CacheSnapshot,
    pub refresher: RefresherStats,
}

#[derive(Serialize)]
struct InvalidateResponse {
    subject_id: String,
    removed: usize,
}

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    if state.runtime.is_closed() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse { status: "closed" }),
        );
    }
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    metrics::publish_snapshot(&state.runtime.cache().metrics_snapshot());
    match metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed",
        )
            .into_response(),
    }
}

pub async fn snapshot(State(state): State<AppState>) -> Json<AuthzSnapshot> {
    Json(AuthzSnapshot {
        cache: state.runtime.cache().metrics_snapshot(),
        refresher: state.runtime.refresher().stats(),
    })
}

pub async fn invalidate_subject(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
) -> Response {
    if let Err(e) = validate_id("subject", &subject_id) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response();
    }
    let removed = state.runtime.evaluator().invalidate_for_subject(&subject_id);
    tracing::info!(subject_id = %subject_id, removed, "subject invalidated via admin API");
    (
        StatusCode::OK,
        Json(InvalidateResponse {
            subject_id,
            removed,
        }),
    )
        .into_response()
}
