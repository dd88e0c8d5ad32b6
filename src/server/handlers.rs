use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::graph::Graph;
use crate::server::state::AppState;
use crate::submit::SubmitError;

/// Body returned by `POST /scheduler`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerResponse {
    pub status: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl SchedulerResponse {
    pub fn ok(message: impl Into<String>, url: String) -> Self {
        Self {
            status: "ok".to_string(),
            message: message.into(),
            url: Some(url),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
            url: None,
        }
    }
}

fn error_response(err: &SubmitError) -> (StatusCode, Json<SchedulerResponse>) {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(SchedulerResponse::error(err.public_message())))
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

/// Scheduler status endpoint
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let in_flight = state
        .in_flight
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    Json(SchedulerStatus {
        in_flight_submissions: state.in_flight_count(),
        in_flight,
    })
}

#[derive(Serialize)]
struct SchedulerStatus {
    in_flight_submissions: usize,
    in_flight: Vec<crate::server::state::InFlight>,
}

pub async fn scheduler_info() -> impl IntoResponse {
    Json(serde_json::json!({"title": "Operation not supported."}))
}

/// Submit a pipeline graph
pub async fn submit_pipeline(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    // Client correlation id, for logs only
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let graph = match Graph::from_json(&body) {
        Ok(graph) => graph,
        Err(e) => {
            warn!(request = %request_id, error = %e, "rejected malformed graph");
            return error_response(&SubmitError::MalformedGraph(e));
        }
    };

    let tracked = state.track(graph.pipeline_name());
    let submission_id = tracked.id();
    info!(
        request = %request_id,
        submission = %submission_id,
        pipeline = %graph.pipeline_name(),
        nodes = graph.nodes().len(),
        "submission received"
    );

    // The submission outlives a dropped request only long enough to notice
    // the cancellation and clean up.
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();
    let scheduler = state.scheduler.clone();
    let task = tokio::spawn(async move { scheduler.submit(&graph, cancel).await });

    match task.await {
        Ok(Ok(outcome)) => (
            StatusCode::OK,
            Json(SchedulerResponse::ok(
                format!("Pipeline {} submitted", outcome.pipeline_name),
                outcome.url,
            )),
        ),
        Ok(Err(e)) => {
            error!(
                request = %request_id,
                submission = %submission_id,
                kind = e.kind(),
                error = %e,
                "submission failed"
            );
            error_response(&e)
        }
        Err(e) => {
            error!(
                request = %request_id,
                submission = %submission_id,
                error = %e,
                "submission task failed"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(SchedulerResponse::error("Submission aborted")),
            )
        }
    }
}

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/scheduler", get(scheduler_info).post(submit_pipeline))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::engine::mock::MockEngine;
    use crate::storage::mock::MockStore;
    use crate::submit::Scheduler;
    use axum::{body::Body, http::Request};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn create_test_app(dir: &TempDir, engine: Arc<MockEngine>) -> Router {
        let nb_dir = dir.path().join("notebooks");
        std::fs::create_dir_all(&nb_dir).unwrap();
        for name in ["load", "train"] {
            std::fs::write(nb_dir.join(format!("{}.ipynb", name)), "{}").unwrap();
        }

        let mut settings = Settings::default();
        settings.packaging.source_root = nb_dir;
        settings.packaging.work_dir = dir.path().join("work");
        let scheduler = Scheduler::new(settings, Arc::new(MockStore::new()), engine);
        create_router(AppState::new(scheduler))
    }

    fn post(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/scheduler")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn payload(links_from_b_to_a: bool) -> serde_json::Value {
        let load_links = if links_from_b_to_a {
            serde_json::json!([{"links": [{"node_id_ref": "B"}]}])
        } else {
            serde_json::json!([])
        };
        serde_json::json!({
            "pipeline_name": "churn",
            "pipeline_data": {"nodes": [
                {"id": "A", "inputs": load_links,
                 "app_data": {"notebook": "load.ipynb", "docker_image": "python:3.11"}},
                {"id": "B", "inputs": [{"links": [{"node_id_ref": "A"}]}],
                 "app_data": {"notebook": "train.ipynb", "docker_image": "python:3.11"}}
            ]}
        })
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let dir = TempDir::new().unwrap();
        let app = create_test_app(&dir, Arc::new(MockEngine::new()));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let dir = TempDir::new().unwrap();
        let app = create_test_app(&dir, Arc::new(MockEngine::new()));

        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = read_json(response).await;
        assert_eq!(body["in_flight_submissions"], 0);
    }

    #[tokio::test]
    async fn test_get_scheduler_is_not_supported() {
        let dir = TempDir::new().unwrap();
        let app = create_test_app(&dir, Arc::new(MockEngine::new()));

        let response = app
            .oneshot(Request::builder().uri("/scheduler").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = read_json(response).await;
        assert_eq!(body, serde_json::json!({"title": "Operation not supported."}));
    }

    #[tokio::test]
    async fn test_submit_pipeline() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MockEngine::new());
        let app = create_test_app(&dir, engine.clone());

        let response = app.oneshot(post(payload(false))).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: SchedulerResponse = read_json(response).await;
        assert_eq!(body.status, "ok");
        assert!(body.url.unwrap().contains("/#/runs/details/"));
        assert_eq!(engine.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_graph_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MockEngine::new());
        let app = create_test_app(&dir, engine.clone());

        let mut body = payload(false);
        body["pipeline_data"]["nodes"][1]["inputs"][0]["links"][0]["node_id_ref"] =
            serde_json::json!("X");
        let response = app.oneshot(post(body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: SchedulerResponse = read_json(response).await;
        assert_eq!(body.status, "error");
        assert!(body.message.contains("X"));
        assert!(body.url.is_none());
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_json_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let app = create_test_app(&dir, Arc::new(MockEngine::new()));

        let request = Request::builder()
            .method("POST")
            .uri("/scheduler")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cyclic_graph_is_unprocessable() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MockEngine::new());
        let app = create_test_app(&dir, engine.clone());

        let response = app.oneshot(post(payload(true))).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: SchedulerResponse = read_json(response).await;
        assert_eq!(body.status, "error");
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_notebook_outside_source_root_is_bad_request() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("private.ipynb"), "{}").unwrap();
        let engine = Arc::new(MockEngine::new());
        let app = create_test_app(&dir, engine.clone());

        let mut body = payload(false);
        body["pipeline_data"]["nodes"][1]["app_data"]["notebook"] =
            serde_json::json!("../private.ipynb");
        let response = app.oneshot(post(body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: SchedulerResponse = read_json(response).await;
        assert!(body.message.contains("outside the source root"));
        assert!(engine.calls().is_empty());
    }
}
