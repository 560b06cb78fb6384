//! Route tests against the in-memory substrate.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use modelgrid_api::{ApiState, Credentials, build_router};
use modelgrid_backends::MemoryBackend;
use modelgrid_core::{BackendKind, FsModelRepository};
use modelgrid_rollout::{Aggregator, LifecycleCoordinator, RolloutPolicy};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

struct TestApp {
    _dir: TempDir,
    backend: Arc<MemoryBackend>,
    router: Router,
    creds: Credentials,
}

fn app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let bundle = dir.path().join("iris").join("1");
    std::fs::create_dir_all(&bundle).unwrap();
    std::fs::write(
        bundle.join("bentoml.yml"),
        "env:\n  python_version: '3.8.10'\n  pip_packages: []\n",
    )
    .unwrap();

    let backend = Arc::new(MemoryBackend::new(BackendKind::Container));
    let coordinator = LifecycleCoordinator::new(
        "bentoml",
        backend.clone(),
        Arc::new(FsModelRepository::new(dir.path())),
        backend.clone(),
        RolloutPolicy::default(),
    );
    let creds = Credentials::new("user", "pw");
    let state = ApiState::new(Aggregator::new().with_runtime(backend.clone()))
        .with_coordinator(Arc::new(coordinator))
        .with_credentials(Some(creds.clone()));

    TestApp {
        _dir: dir,
        backend,
        router: build_router(state),
        creds,
    }
}

fn post(path: &str, body: Value, auth: Option<&Credentials>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json");
    if let Some(creds) = auth {
        builder = builder.header(header::AUTHORIZATION, creds.header_value());
    }
    builder.body(Body::from(serde_json::to_vec(&body).unwrap())).unwrap()
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn iris(port: u16) -> Value {
    json!({"name": "iris", "version": "1", "stage": "Staging", "args": {"port": port}})
}

#[tokio::test]
async fn healthz_is_open() {
    let app = app();
    let (status, body) = send(&app.router, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], "ok");
}

#[tokio::test]
async fn start_requires_credentials() {
    let app = app();
    let (status, _) = send(&app.router, post("/start", iris(5001), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let wrong = Credentials::new("user", "nope");
    let (status, _) = send(&app.router, post("/start", iris(5001), Some(&wrong))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(app.backend.instances().is_empty());
}

#[tokio::test]
async fn start_then_list_then_stop() {
    let app = app();

    let (status, body) = send(&app.router, post("/start", iris(5001), Some(&app.creds))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["port"], 5001);
    assert!(
        body["data"]["deployment_name"]
            .as_str()
            .unwrap()
            .starts_with("bentoml_iris_staging_")
    );

    let (status, body) = send(&app.router, get("/running")).await;
    assert_eq!(status, StatusCode::OK);
    let containers = body["data"]["container"].as_array().unwrap();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0]["version"], "1");
    assert_eq!(containers[0]["stage"], "staging");

    let stop = json!({"name": "iris", "version": "1", "stage": "Staging"});
    let (status, _) = send(&app.router, post("/stop", stop.clone(), Some(&app.creds))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&app.router, post("/stop", stop, Some(&app.creds))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn bad_input_is_a_client_error() {
    let app = app();

    let bad_stage = json!({"name": "iris", "version": "1", "stage": "qa"});
    let (status, _) = send(&app.router, post("/start", bad_stage, Some(&app.creds))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let missing = json!({"name": "iris", "version": "7", "stage": "Staging"});
    let (status, _) = send(&app.router, post("/start", missing, Some(&app.creds))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let unconfigured =
        json!({"name": "iris", "version": "1", "stage": "Staging", "backend": "session"});
    let (status, body) = send(&app.router, post("/start", unconfigured, Some(&app.creds))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("session"));
}

#[tokio::test]
async fn occupied_port_is_a_gateway_error() {
    let app = app();
    app.backend.occupy_port(5001);
    let (status, _) = send(&app.router, post("/start", iris(5001), Some(&app.creds))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn health_failure_carries_the_log_tail() {
    let app = app();
    app.backend.inject_unhealthy("1");

    let (status, body) = send(&app.router, post("/start", iris(5001), Some(&app.creds))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["logs"].as_str().unwrap().contains("Traceback"));
    assert!(body.get("intervention_required").is_none());
    assert!(app.backend.instances().is_empty());
}
