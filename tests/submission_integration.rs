//! End-to-end submission tests against thin HTTP servers
//!
//! A fake S3 endpoint and a fake Kubeflow Pipelines API run in-process; the
//! scheduler talks to them through the real `S3Store` and `KfpClient`.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{Request, StatusCode};
use axum::routing::{head, post, put};
use axum::{Json, Router};
use dashmap::{DashMap, DashSet};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use nbpipe::config::{Secret, Settings};
use nbpipe::graph::Graph;
use nbpipe::server::{create_router, AppState, SchedulerResponse};
use nbpipe::submit::{Scheduler, SubmitError};

/// Shared state of the fake services
#[derive(Clone, Default)]
struct Backend {
    buckets: Arc<DashSet<String>>,
    objects: Arc<DashMap<String, Vec<u8>>>,
    /// Object keys with this prefix are answered with a 500
    fail_prefix: Arc<Mutex<Option<String>>>,
    /// Delay applied to every object upload
    upload_delay: Arc<Mutex<Duration>>,
    kfp_calls: Arc<Mutex<Vec<String>>>,
    workflows: Arc<Mutex<Vec<String>>>,
}

impl Backend {
    fn kfp_calls(&self) -> Vec<String> {
        self.kfp_calls.lock().unwrap().clone()
    }
}

async fn head_bucket(State(b): State<Backend>, UrlPath(bucket): UrlPath<String>) -> StatusCode {
    if b.buckets.contains(&bucket) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn put_bucket(State(b): State<Backend>, UrlPath(bucket): UrlPath<String>) -> StatusCode {
    b.buckets.insert(bucket);
    StatusCode::OK
}

async fn put_object(
    State(b): State<Backend>,
    UrlPath((bucket, key)): UrlPath<(String, String)>,
    body: Bytes,
) -> (StatusCode, String) {
    let delay = *b.upload_delay.lock().unwrap();
    tokio::time::sleep(delay).await;

    let failing = b.fail_prefix.lock().unwrap().clone();
    if matches!(failing, Some(ref prefix) if key.starts_with(prefix.as_str())) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "<Error><Code>InternalError</Code></Error>".to_string(),
        );
    }
    if !b.buckets.contains(&bucket) {
        return (
            StatusCode::NOT_FOUND,
            "<Error><Code>NoSuchBucket</Code></Error>".to_string(),
        );
    }
    b.objects.insert(key, body.to_vec());
    (StatusCode::OK, String::new())
}

async fn upload_pipeline(
    State(b): State<Backend>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Json<Value> {
    let name = query.get("name").cloned().unwrap_or_default();
    b.kfp_calls.lock().unwrap().push(format!("upload:{}", name));
    b.workflows
        .lock()
        .unwrap()
        .push(String::from_utf8_lossy(&body).into_owned());
    Json(json!({"id": "pipeline-1", "name": name}))
}

async fn create_experiment(State(b): State<Backend>, Json(body): Json<Value>) -> Json<Value> {
    let name = body["name"].as_str().unwrap_or_default().to_string();
    b.kfp_calls.lock().unwrap().push(format!("experiment:{}", name));
    Json(json!({"id": "experiment-1", "name": name}))
}

async fn create_run(State(b): State<Backend>, Json(body): Json<Value>) -> Json<Value> {
    b.kfp_calls.lock().unwrap().push(format!(
        "run:{}:{}",
        body["pipeline_spec"]["pipeline_id"].as_str().unwrap_or_default(),
        body["resource_references"][0]["key"]["id"]
            .as_str()
            .unwrap_or_default()
    ));
    Json(json!({"run": {"id": "run-1", "name": body["name"]}}))
}

/// Start both fake services on ephemeral ports
async fn spawn_backend() -> (String, String, Backend) {
    let backend = Backend::default();

    let s3 = Router::new()
        .route("/{bucket}", head(head_bucket).put(put_bucket))
        .route("/{bucket}/{key}", put(put_object))
        .with_state(backend.clone());
    let kfp = Router::new()
        .route("/apis/v1beta1/pipelines/upload", post(upload_pipeline))
        .route("/apis/v1beta1/experiments", post(create_experiment))
        .route("/apis/v1beta1/runs", post(create_run))
        .with_state(backend.clone());

    let mut urls = Vec::new();
    for app in [s3, kfp] {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        urls.push(format!("http://{}", listener.local_addr().unwrap()));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
    }
    let kfp_url = urls.pop().unwrap();
    let s3_url = urls.pop().unwrap();
    (s3_url, kfp_url, backend)
}

/// Notebook tree with `load`, `train` and `report` notebooks side by side
fn notebook_tree() -> TempDir {
    let dir = TempDir::new().unwrap();
    let nb = dir.path().join("notebooks");
    std::fs::create_dir_all(nb.join("data")).unwrap();
    std::fs::write(nb.join("data/input.csv"), "a,b\n1,2\n").unwrap();
    for name in ["load", "train", "report"] {
        std::fs::write(nb.join(format!("{}.ipynb", name)), "{\"cells\": []}").unwrap();
    }
    dir
}

fn settings(dir: &Path, s3_url: &str, kfp_url: &str) -> Settings {
    let mut settings = Settings::default();
    settings.storage.endpoint = s3_url.to_string();
    settings.storage.access_key = Secret::new("minio");
    settings.storage.secret_key = Secret::new("minio123");
    settings.storage.bucket = "notebooks".to_string();
    settings.storage.timeout_secs = 1;
    settings.engine.url = kfp_url.to_string();
    settings.packaging.source_root = dir.join("notebooks");
    settings.packaging.work_dir = dir.join("work");
    settings.packaging.max_concurrent_uploads = 2;
    settings
}

/// `load` feeds `train`; both feed `report`
fn payload() -> Value {
    let node = |id: &str, notebook: &str, links: &[&str]| {
        let links: Vec<Value> = links.iter().map(|l| json!({"node_id_ref": l})).collect();
        json!({
            "id": id,
            "inputs": [{"links": links}],
            "app_data": {"notebook": notebook, "docker_image": "jupyter/scipy-notebook"}
        })
    };
    json!({
        "pipeline_name": "churn",
        "pipeline_data": {"nodes": [
            node("A", "load.ipynb", &[]),
            node("B", "train.ipynb", &["A"]),
            node("C", "report.ipynb", &["A", "B"]),
        ]}
    })
}

fn graph() -> Graph {
    Graph::from_json(&payload().to_string()).unwrap()
}

fn tar_entries(archive: &[u8]) -> Vec<String> {
    let mut decoded = Vec::new();
    flate2::read::GzDecoder::new(archive)
        .read_to_end(&mut decoded)
        .unwrap();
    let mut tar = tar::Archive::new(decoded.as_slice());
    tar.entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect()
}

#[tokio::test]
async fn test_submission_end_to_end() {
    let (s3_url, kfp_url, backend) = spawn_backend().await;
    let dir = notebook_tree();
    let scheduler = Scheduler::from_settings(settings(dir.path(), &s3_url, &kfp_url)).unwrap();

    let outcome = scheduler
        .submit(&graph(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.run_id, "run-1");
    assert_eq!(outcome.url, format!("{}/#/runs/details/run-1", kfp_url));

    // One archive per node, each rooted at a directory named after its key
    assert!(backend.buckets.contains("notebooks"));
    assert_eq!(backend.objects.len(), 3);
    for entry in backend.objects.iter() {
        let key = entry.key();
        assert!(key.starts_with("churn-") && key.ends_with(".tar.gz"));
        let entries = tar_entries(entry.value());
        assert!(entries.iter().all(|p| p.starts_with(key.as_str())));
        assert!(entries.contains(&format!("{}/data/input.csv", key)));
    }

    let calls = backend.kfp_calls();
    assert_eq!(
        calls,
        vec![
            format!("upload:{}", outcome.pipeline_name),
            format!("experiment:{}", outcome.pipeline_name),
            "run:pipeline-1:experiment-1".to_string(),
        ]
    );

    // The uploaded workflow downloads exactly the archives that were stored
    let workflow = backend.workflows.lock().unwrap()[0].clone();
    for entry in backend.objects.iter() {
        assert!(workflow.contains(entry.key().as_str()));
    }
    assert!(workflow.contains("--strip-components=1"));
    assert!(workflow.contains("secretKeyRef"));
    assert!(!workflow.contains("minio123"));

    // The per-submission work directory is gone
    let leftovers = std::fs::read_dir(dir.path().join("work")).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_failed_upload_submits_nothing() {
    let (s3_url, kfp_url, backend) = spawn_backend().await;
    *backend.fail_prefix.lock().unwrap() = Some("churn-train-".to_string());
    let dir = notebook_tree();
    let scheduler = Scheduler::from_settings(settings(dir.path(), &s3_url, &kfp_url)).unwrap();

    let err = scheduler
        .submit(&graph(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SubmitError::Storage(_)));
    assert_eq!(err.status_code(), 502);
    assert!(backend.kfp_calls().is_empty());
}

#[tokio::test]
async fn test_slow_storage_times_out() {
    let (s3_url, kfp_url, backend) = spawn_backend().await;
    *backend.upload_delay.lock().unwrap() = Duration::from_secs(3);
    let dir = notebook_tree();
    let scheduler = Scheduler::from_settings(settings(dir.path(), &s3_url, &kfp_url)).unwrap();

    let err = scheduler
        .submit(&graph(), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), 504);
    assert!(backend.kfp_calls().is_empty());
}

#[tokio::test]
async fn test_cancelled_submission_submits_nothing() {
    let (s3_url, kfp_url, backend) = spawn_backend().await;
    let dir = notebook_tree();
    let scheduler = Scheduler::from_settings(settings(dir.path(), &s3_url, &kfp_url)).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = scheduler.submit(&graph(), cancel).await.unwrap_err();

    assert!(matches!(err, SubmitError::Cancelled));
    assert!(backend.objects.is_empty());
    assert!(backend.kfp_calls().is_empty());
}

#[tokio::test]
async fn test_http_submission_round_trip() {
    let (s3_url, kfp_url, backend) = spawn_backend().await;
    let dir = notebook_tree();
    let scheduler = Scheduler::from_settings(settings(dir.path(), &s3_url, &kfp_url)).unwrap();
    let app = create_router(AppState::new(scheduler));

    let request = Request::builder()
        .method("POST")
        .uri("/scheduler")
        .header("content-type", "application/json")
        .body(Body::from(payload().to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: SchedulerResponse = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body.status, "ok");
    assert_eq!(body.url, Some(format!("{}/#/runs/details/run-1", kfp_url)));
    assert_eq!(backend.kfp_calls().len(), 3);
}

#[tokio::test]
async fn test_http_cycle_is_rejected() {
    let (s3_url, kfp_url, backend) = spawn_backend().await;
    let dir = notebook_tree();
    let scheduler = Scheduler::from_settings(settings(dir.path(), &s3_url, &kfp_url)).unwrap();
    let app = create_router(AppState::new(scheduler));

    let mut cyclic = payload();
    cyclic["pipeline_data"]["nodes"][0]["inputs"][0]["links"] = json!([{"node_id_ref": "C"}]);
    let request = Request::builder()
        .method("POST")
        .uri("/scheduler")
        .body(Body::from(cyclic.to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(backend.kfp_calls().is_empty());
    assert!(backend.buckets.is_empty());
    assert!(backend.objects.is_empty());
}

#[tokio::test]
async fn test_concurrent_submissions_keep_their_archives() {
    let (s3_url, kfp_url, backend) = spawn_backend().await;
    let dir = notebook_tree();
    let scheduler = Scheduler::from_settings(settings(dir.path(), &s3_url, &kfp_url)).unwrap();
    let graph = graph();

    let (a, b) = tokio::join!(
        scheduler.submit(&graph, CancellationToken::new()),
        scheduler.submit(&graph, CancellationToken::new()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a.pipeline_name, b.pipeline_name);
    assert_eq!(backend.objects.len(), 6);
}
