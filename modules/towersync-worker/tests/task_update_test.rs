//! Status-callback contract tests against a local capture server.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::patch;
use axum::Router;
use serde_json::Value;

use towersync_models::RepoStats;
use towersync_worker::{MessageHeaders, TaskOutput, TaskUpdater};

#[derive(Debug, Clone)]
struct Captured {
    identity: Option<String>,
    request_id: Option<String>,
    content_type: Option<String>,
    body: Value,
}

#[derive(Clone)]
struct Capture {
    requests: Arc<Mutex<Vec<Captured>>>,
    respond_with: StatusCode,
}

async fn capture_task(
    State(capture): State<Capture>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let header = |name: &str| {
        headers
            .get(name)
            .map(|v| v.to_str().unwrap_or_default().to_string())
    };
    capture.requests.lock().unwrap().push(Captured {
        identity: header("x-rh-identity"),
        request_id: header("x-rh-insights-request-id"),
        content_type: header("content-type"),
        body: serde_json::from_str(&body).unwrap(),
    });
    capture.respond_with
}

async fn start_capture_server(respond_with: StatusCode) -> (String, Capture) {
    let capture = Capture {
        requests: Arc::new(Mutex::new(Vec::new())),
        respond_with,
    };
    let router = Router::new()
        .route("/task", patch(capture_task))
        .with_state(capture.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}/task"), capture)
}

fn headers_with_identity() -> MessageHeaders {
    MessageHeaders {
        identity: Some("ZW5jb2RlZA==".to_string()),
        request_id: Some("req-42".to_string()),
        event_type: None,
    }
}

#[tokio::test]
async fn success_payload_carries_stats_and_headers() {
    let (url, capture) = start_capture_server(StatusCode::NO_CONTENT).await;
    let task = TaskUpdater::new(reqwest::Client::new(), url, headers_with_identity());

    let mut stats = BTreeMap::new();
    stats.insert(
        "service_offerings",
        RepoStats {
            adds: 1,
            updates: 0,
            deletes: 0,
        },
    );
    task.update("completed", "ok", "Success", Some(TaskOutput::Stats(stats)))
        .await
        .unwrap();

    let requests = capture.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let req = &requests[0];
    assert_eq!(req.identity.as_deref(), Some("ZW5jb2RlZA=="));
    assert_eq!(req.request_id.as_deref(), Some("req-42"));
    assert_eq!(req.content_type.as_deref(), Some("application/json"));
    assert_eq!(req.body["state"], "completed");
    assert_eq!(req.body["status"], "ok");
    assert_eq!(req.body["message"], "Success");
    assert_eq!(
        req.body["output"]["stats"]["service_offerings"]["adds"],
        serde_json::json!(1)
    );
}

#[tokio::test]
async fn error_payload_carries_error_list() {
    let (url, capture) = start_capture_server(StatusCode::NO_CONTENT).await;
    let task = TaskUpdater::new(reqwest::Client::new(), url, headers_with_identity());

    task.update(
        "completed",
        "error",
        "boom",
        Some(TaskOutput::Errors(vec!["boom".to_string()])),
    )
    .await
    .unwrap();

    let requests = capture.requests.lock().unwrap();
    assert_eq!(requests[0].body["output"]["errors"], serde_json::json!(["boom"]));
}

#[tokio::test]
async fn missing_identity_aborts_without_a_request() {
    let (url, capture) = start_capture_server(StatusCode::NO_CONTENT).await;
    let task = TaskUpdater::new(
        reqwest::Client::new(),
        url,
        MessageHeaders {
            identity: None,
            request_id: None,
            event_type: None,
        },
    );

    let err = task.update("running", "ok", "m", None).await.unwrap_err();
    assert!(err.to_string().contains("x-rh-identity is not set"));
    assert!(capture.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn non_204_response_is_an_error() {
    let (url, _capture) = start_capture_server(StatusCode::BAD_REQUEST).await;
    let task = TaskUpdater::new(reqwest::Client::new(), url, headers_with_identity());

    let err = task.update("running", "ok", "m", None).await.unwrap_err();
    assert!(err
        .to_string()
        .contains("Invalid HTTP status code from task update 400"));
}
