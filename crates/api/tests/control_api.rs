// HTTP tests for the control API
// Run with: cargo test -p blockflow-api --test control_api
// Uses the in-memory store and a manual clock; no database required.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use blockflow_api::ApiConfig;
use blockflow_engine::clock::ManualClock;
use blockflow_engine::{Engine, InMemoryExecutionStore, WorkerPool, WorkerPoolConfig};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

struct TestApp {
    router: Router,
    pool: WorkerPool,
}

impl TestApp {
    fn new() -> Self {
        let engine = Engine::builder(Arc::new(InMemoryExecutionStore::new()))
            .with_clock(Arc::new(ManualClock::starting_now()))
            .build();
        let pool = WorkerPool::new(
            engine.clone(),
            WorkerPoolConfig::from_engine(engine.config()).with_worker_id("test-worker"),
        );
        let router = blockflow_api::app(engine, &ApiConfig::default());

        Self { router, pool }
    }

    async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.send_raw(method, uri, body.map(|b| b.to_string())).await
    }

    /// Send `body` verbatim with a JSON content type
    async fn send_raw(&self, method: Method, uri: &str, body: Option<String>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                request = request.header("content-type", "application/json");
                Body::from(body)
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    /// Register the approval workflow and trigger it; returns the execution id
    async fn start_approval(&self) -> String {
        let workflow_id = Uuid::now_v7();
        let (status, _) = self
            .send(
                Method::PUT,
                &format!("/api/workflows/{workflow_id}"),
                Some(json!({
                    "name": "approval",
                    "nodes": [
                        {"id": "approve", "block_type": "manual_approval"},
                        {"id": "t", "block_type": "transform"}
                    ],
                    "edges": [{"from": "approve", "to": "t"}]
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, execution) = self
            .send(
                Method::POST,
                &format!("/api/workflows/{workflow_id}/executions"),
                Some(json!({"input": {"amount": 5}})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(execution["status"], "pending");
        execution["id"].as_str().unwrap().to_string()
    }

    async fn process(&self) {
        self.pool.process_next().await.unwrap().expect("queued item");
    }
}

#[tokio::test]
async fn test_health() {
    let app = TestApp::new();
    let (status, body) = app.send(Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_invalid_workflow_is_rejected() {
    let app = TestApp::new();
    let (status, body) = app
        .send(
            Method::PUT,
            &format!("/api/workflows/{}", Uuid::now_v7()),
            Some(json!({
                "name": "loop",
                "nodes": [
                    {"id": "a", "block_type": "transform"},
                    {"id": "b", "block_type": "transform"}
                ],
                "edges": [{"from": "a", "to": "b"}, {"from": "b", "to": "a"}]
            })),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("cycle"));
}

#[tokio::test]
async fn test_trigger_unknown_workflow_is_not_found() {
    let app = TestApp::new();
    let (status, body) = app
        .send(
            Method::POST,
            &format!("/api/workflows/{}/executions", Uuid::now_v7()),
            Some(json!({})),
        )
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_snapshot_and_resume_round_trip() {
    let app = TestApp::new();
    let id = app.start_approval().await;
    app.process().await;

    let (status, execution) = app.send(Method::GET, &format!("/api/executions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(execution["status"], "paused");

    let (status, snapshot) = app
        .send(Method::GET, &format!("/api/executions/{id}/node-snapshot/approve"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["data"], json!({"amount": 5}));

    let (status, _) = app
        .send(
            Method::POST,
            &format!("/api/executions/{id}/resume"),
            Some(json!({"nodeId": "approve", "resumeData": [1, 2, 3]})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .send(
            Method::POST,
            &format!("/api/executions/{id}/resume"),
            Some(json!({"nodeId": "approve", "resumeData": {"approved": true}})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resumed"], true);
    assert_eq!(body["execution"]["status"], "running");

    let (status, body) = app
        .send(
            Method::POST,
            &format!("/api/executions/{id}/resume"),
            Some(json!({"nodeId": "approve", "resumeData": {"approved": true}})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resumed"], false);

    app.process().await;
    let (_, execution) = app.send(Method::GET, &format!("/api/executions/{id}"), None).await;
    assert_eq!(execution["status"], "completed");
    assert_eq!(
        execution["output"],
        json!({"t": {"approve": {"amount": 5, "approved": true}}})
    );

    let (status, nodes) = app
        .send(Method::GET, &format!("/api/executions/{id}/nodes"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(nodes["data"].as_array().unwrap().len(), 2);

    // Finished executions cannot be cancelled
    let (status, _) = app
        .send(Method::POST, &format!("/api/executions/{id}/cancel"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_malformed_control_bodies_are_rejected() {
    let app = TestApp::new();
    let id = app.start_approval().await;
    app.process().await;

    let (status, body) = app
        .send_raw(
            Method::POST,
            &format!("/api/executions/{id}/resume"),
            Some(r#"{"resumeData": {"amount": 99}, "nodeId": "approve""#.to_string()),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (_, execution) = app.send(Method::GET, &format!("/api/executions/{id}"), None).await;
    assert_eq!(execution["status"], "paused");
    let (_, snapshot) = app
        .send(Method::GET, &format!("/api/executions/{id}/node-snapshot/approve"), None)
        .await;
    assert_eq!(snapshot["data"], json!({"amount": 5}));

    let (status, _) = app
        .send_raw(
            Method::POST,
            &format!("/api/executions/{id}/cancel"),
            Some(r#"{"reason": "#.to_string()),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (_, execution) = app.send(Method::GET, &format!("/api/executions/{id}"), None).await;
    assert_eq!(execution["status"], "paused");

    // No body at all still means "use the defaults"
    let (status, body) = app
        .send(Method::POST, &format!("/api/executions/{id}/resume"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resumed"], true);
}

#[tokio::test]
async fn test_resume_without_pause_is_not_found() {
    let app = TestApp::new();
    let id = app.start_approval().await;

    let (status, body) = app
        .send(
            Method::POST,
            &format!("/api/executions/{id}/resume"),
            Some(json!({"resumeData": null})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("no pause record"));
}

#[tokio::test]
async fn test_pause_requires_running_execution() {
    let app = TestApp::new();
    let id = app.start_approval().await;

    // Still pending: nothing has advanced it yet
    let (status, _) = app
        .send(
            Method::POST,
            &format!("/api/executions/{id}/pause"),
            Some(json!({"reason": "maintenance"})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = app
        .send(
            Method::POST,
            &format!("/api/executions/{}/pause", Uuid::now_v7()),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_paused_execution() {
    let app = TestApp::new();
    let id = app.start_approval().await;
    app.process().await;

    let (status, execution) = app
        .send(
            Method::POST,
            &format!("/api/executions/{id}/cancel"),
            Some(json!({"reason": "rejected by finance"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(execution["status"], "failed");
    assert_eq!(execution["error"], "cancelled: rejected by finance");

    let (status, _) = app
        .send(Method::POST, &format!("/api/executions/{id}/cancel"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_retry_unknown_node_is_not_found() {
    let app = TestApp::new();
    let id = app.start_approval().await;
    app.process().await;

    let (status, _) = app
        .send(
            Method::POST,
            &format!("/api/executions/{id}/retry"),
            Some(json!({"nodeId": "missing"})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Paused is not failed
    let (status, _) = app
        .send(
            Method::POST,
            &format!("/api/executions/{id}/retry"),
            Some(json!({"nodeId": "approve"})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_dead_letters_and_circuits() {
    let app = TestApp::new();

    let (status, body) = app
        .send(Method::GET, "/api/queue/dead-letters?limit=10", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));

    let (status, _) = app
        .send(
            Method::POST,
            &format!("/api/queue/dead-letters/{}/requeue", Uuid::now_v7()),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, circuit) = app.send(Method::GET, "/api/circuits/smtp", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(circuit["state"], "closed");

    let (status, circuit) = app.send(Method::POST, "/api/circuits/smtp/reset", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(circuit["failure_count"], 0);
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let app = TestApp::new();
    let (status, doc) = app.send(Method::GET, "/api-doc/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["info"]["title"], "Blockflow API");
}
