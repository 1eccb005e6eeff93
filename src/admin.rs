//! Admin HTTP surface: status banner and the reset-metrics endpoint.
//!
//! Grounded on `metrics_reset_server.py::MetricsResetHandler`, rebuilt on
//! `axum` (the web framework the teacher's `api` module already depends on)
//! rather than the original's bare `http.server` thread, since the rest of
//! this allocator is already async/tokio.

use crate::monitor::Monitor;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub const DEFAULT_ADMIN_PORT: u16 = 60000;

#[derive(Clone)]
struct AdminState {
    monitor: Arc<Monitor>,
}

pub fn build_router(monitor: Arc<Monitor>) -> Router {
    let state = AdminState { monitor };
    Router::new()
        .route("/", get(status))
        .route("/reset_metrics", post(reset_metrics))
        .with_state(state)
}

async fn status() -> Json<serde_json::Value> {
    // Literal strings preserved from `metrics_reset_server.py::do_GET` so a
    // caller scripted against the original's response body keeps working.
    Json(json!({
        "status": "ok",
        "message": "Metrics reset API is running",
        "usage": "Send a POST request to /reset_metrics with app_id parameter"
    }))
}

#[derive(Debug, Deserialize, Default)]
struct ResetQuery {
    app_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ResetBody {
    app_id: Option<serde_json::Value>,
}

async fn reset_metrics(
    State(state): State<AdminState>,
    Query(query): Query<ResetQuery>,
    body: Option<Json<ResetBody>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let raw = query
        .app_id
        .or_else(|| body.and_then(|b| b.0.app_id).map(|v| v.to_string()));

    let Some(raw) = raw else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "error", "message": "missing app_id parameter"})),
        );
    };

    let app_id: u32 = match raw.trim_matches('"').parse() {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "error", "message": "app_id must be an integer"})),
            );
        }
    };

    if state.monitor.reset_metrics_for_app(app_id) {
        (StatusCode::OK, Json(json!({"status": "ok", "app_id": app_id})))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "error", "message": "unknown app_id"})),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_body_matches_the_original_literal_strings() {
        let Json(body) = status().await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["message"], "Metrics reset API is running");
        assert_eq!(body["usage"], "Send a POST request to /reset_metrics with app_id parameter");
    }

    #[tokio::test]
    async fn reset_unknown_app_returns_404() {
        let monitor = Arc::new(Monitor::new([1], 60.0));
        let state = AdminState { monitor };
        let (status, _) = reset_metrics(State(state), Query(ResetQuery { app_id: Some("99".into()) }), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reset_missing_app_id_returns_400() {
        let monitor = Arc::new(Monitor::new([1], 60.0));
        let state = AdminState { monitor };
        let (status, _) = reset_metrics(State(state), Query(ResetQuery::default()), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn reset_known_app_returns_200() {
        let monitor = Arc::new(Monitor::new([1], 60.0));
        let state = AdminState { monitor };
        let (status, _) = reset_metrics(State(state), Query(ResetQuery { app_id: Some("1".into()) }), None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
