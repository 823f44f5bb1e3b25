// ABOUTME: Router-level tests driving every endpoint through tower's oneshot
// ABOUTME: Uses the in-memory runtime so no container engine is needed

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use dockformer_api::{create_router, ApiConfig, AppState};
use dockformer_reconciler::{
    LogStreamer, LogStreamerConfig, Reconciler, ReconcilerConfig, RetryPolicy,
};
use dockformer_runtime::MemoryRuntime;
use futures::StreamExt;
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const BOUNDARY: &str = "dockformer-test-boundary";

const WEB_AND_DB: &str = "containers:
  - name: web
    image: nginx:latest
    ports: \"8080:80\"
  - name: db
    image: \"postgres:14\"
";

struct TestApp {
    runtime: MemoryRuntime,
    reconciler: Arc<Reconciler>,
    router: Router,
}

fn setup() -> TestApp {
    let runtime = MemoryRuntime::new();
    let reconciler = Arc::new(Reconciler::new(
        Arc::new(runtime.clone()),
        ReconcilerConfig {
            retry: RetryPolicy::none(),
            ..ReconcilerConfig::default()
        },
    ));
    let streamer = LogStreamer::new(
        &reconciler,
        LogStreamerConfig {
            default_tail: 100,
            backlog: 100,
        },
    );
    let config = ApiConfig {
        max_manifest_bytes: 4096,
        max_streams_per_ip: 1,
    };
    let router = create_router(AppState::new(Arc::clone(&reconciler), streamer, config));
    TestApp {
        runtime,
        reconciler,
        router,
    }
}

fn upload_request(file_name: &str, content: &str) -> Request<Body> {
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"yamlFile\"; filename=\"{f}\"\r\nContent-Type: application/x-yaml\r\n\r\n{c}\r\n--{b}--\r\n",
        b = BOUNDARY,
        f = file_name,
        c = content
    );
    Request::builder()
        .method(Method::POST)
        .uri("/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

fn request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = setup();
    let (status, body) = send(&app, request(Method::GET, "/api/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "dockformer");
    assert_eq!(body["runtime"], "memory");
    assert_eq!(body["generation"], 0);
}

#[tokio::test]
async fn test_upload_creates_containers() {
    let app = setup();
    let (status, body) = send(&app, upload_request("stack.yaml", WEB_AND_DB)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["generation"], 1);
    assert_eq!(body["created"], serde_json::json!(["web", "db"]));
    assert_eq!(body["failed"], serde_json::json!([]));

    let (status, list) = send(&app, request(Method::GET, "/api/containers")).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = list
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["Name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["db", "web"]);
    assert_eq!(list[1]["Status"], "running");
    assert_eq!(list[1]["Ports"], "8080:80");
}

#[tokio::test]
async fn test_upload_rejects_duplicate_names() {
    let app = setup();
    let yaml = "containers:\n  - name: cache\n    image: \"redis:7\"\n  - name: cache\n    image: memcached\n";
    let (status, body) = send(&app, upload_request("stack.yml", yaml)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert_eq!(body["field"], "name");
    assert!(body["error"].as_str().unwrap().contains("duplicate"));
    // Nothing was accepted
    assert_eq!(app.reconciler.current_generation().await, 0);
}

#[tokio::test]
async fn test_upload_rejects_non_yaml_file() {
    let app = setup();
    let (status, body) = send(&app, upload_request("stack.json", WEB_AND_DB)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("YAML"));
}

#[tokio::test]
async fn test_upload_rejects_oversized_manifest() {
    let app = setup();
    let mut yaml = String::from("containers: []\n");
    yaml.push_str(&"# padding\n".repeat(500));
    let (status, _) = send(&app, upload_request("big.yaml", &yaml)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_partial_failure_is_multi_status() {
    let app = setup();
    app.runtime.fail_image("postgres:14", "manifest unknown");

    let (status, body) = send(&app, upload_request("stack.yaml", WEB_AND_DB)).await;
    assert_eq!(status, StatusCode::MULTI_STATUS);
    assert_eq!(body["created"], serde_json::json!(["web"]));
    assert_eq!(body["failed"][0]["name"], "db");
    assert_eq!(body["failed"][0]["action"], "create");
}

#[tokio::test]
async fn test_unavailable_runtime_is_503_and_list_is_stale() {
    let app = setup();
    send(&app, upload_request("stack.yaml", WEB_AND_DB)).await;

    app.runtime.set_unavailable(Some("daemon stopped".to_string()));
    let (status, body) = send(&app, request(Method::POST, "/api/reconcile")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "RUNTIME_UNAVAILABLE");

    let response = app
        .router
        .clone()
        .oneshot(request(Method::GET, "/api/containers"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-dockformer-stale").unwrap(),
        "true"
    );
}

#[tokio::test]
async fn test_lifecycle_routes() {
    let app = setup();
    send(&app, upload_request("stack.yaml", WEB_AND_DB)).await;

    let (status, body) = send(&app, request(Method::POST, "/api/containers/web/stop")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Container stopped successfully");
    assert_eq!(body["container"]["Status"], "stopped");

    let id = body["container"]["ID"].as_str().unwrap().to_string();
    let (status, body) = send(
        &app,
        request(Method::POST, &format!("/api/containers/{}/start", id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["container"]["Status"], "running");

    let (status, _) = send(&app, request(Method::POST, "/api/containers/web/restart")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, request(Method::DELETE, "/api/containers/db")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["container"]["Name"], "db");

    let (status, body) = send(&app, request(Method::GET, "/api/containers/db")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_unknown_container_is_404() {
    let app = setup();
    for (method, uri) in [
        (Method::GET, "/api/containers/ghost"),
        (Method::DELETE, "/api/containers/ghost"),
        (Method::POST, "/api/containers/ghost/restart"),
        (Method::GET, "/api/containers/ghost/logs"),
    ] {
        let (status, _) = send(&app, request(method, uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
    }
}

#[tokio::test]
async fn test_runtime_failure_is_500_with_context() {
    let app = setup();
    send(&app, upload_request("stack.yaml", WEB_AND_DB)).await;
    app.runtime.fail_operation("restart", "cgroup error");

    let (status, body) = send(&app, request(Method::POST, "/api/containers/web/restart")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["container"], "web");
    assert_eq!(body["action"], "restart");
    assert!(body["error"].as_str().unwrap().contains("cgroup error"));
}

#[tokio::test]
async fn test_logs_snapshot() {
    let app = setup();
    send(&app, upload_request("stack.yaml", WEB_AND_DB)).await;
    app.runtime.emit_log("web", "GET /index.html 200").unwrap();

    let (status, body) = send(&app, request(Method::GET, "/api/containers/web/logs?tail=1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["logs"], "GET /index.html 200\n");
    assert_eq!(body["container"]["Name"], "web");
}

#[tokio::test]
async fn test_manifest_endpoint() {
    let app = setup();
    let (status, body) = send(&app, request(Method::GET, "/api/manifest")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NO_MANIFEST");

    send(&app, upload_request("stack.yaml", WEB_AND_DB)).await;
    let (status, body) = send(&app, request(Method::GET, "/api/manifest")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["generation"], 1);
    assert_eq!(body["containers"][0]["name"], "web");
    assert_eq!(body["digest"].as_str().unwrap().len(), 64);
}

#[tokio::test]
async fn test_reconcile_without_manifest_is_404() {
    let app = setup();
    let (status, _) = send(&app, request(Method::POST, "/api/reconcile")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_log_stream_sends_events_and_limits_clients() {
    let app = setup();
    send(&app, upload_request("stack.yaml", WEB_AND_DB)).await;

    let response = app
        .router
        .clone()
        .oneshot(request(Method::GET, "/api/containers/web/logs/stream"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/event-stream"
    );

    // One stream per client in this configuration
    let (status, body) = send(&app, request(Method::GET, "/api/containers/web/logs/stream")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "STREAM_LIMIT_EXCEEDED");

    let mut frames = response.into_body().into_data_stream();
    let mut received = String::new();
    while !received.contains("web started") {
        let frame = tokio::time::timeout(Duration::from_secs(1), frames.next())
            .await
            .expect("timed out waiting for log event")
            .expect("stream ended early")
            .unwrap();
        received.push_str(&String::from_utf8_lossy(&frame));
    }
    assert!(received.contains("event: log"));

    drop(frames);
    // The slot is released once the response body is gone
    let (status, _) = send(&app, request(Method::GET, "/api/containers/ghost/logs/stream")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
