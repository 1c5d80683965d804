//! Shared harness for HTTP integration tests: a router wired to a
//! recording mock of the resume transport.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use stagegate::AppState;
use stagegate_config::Config;
use stagegate_worker::{ResumeRequest, ResumeTransport, WorkerError};
use tower::ServiceExt;

pub const TEST_TOKEN: &str = "test-webhook-token";

pub struct MockTransport {
    pub calls: Mutex<Vec<ResumeRequest>>,
    pub fail: bool,
}

impl MockTransport {
    pub fn calls(&self) -> Vec<ResumeRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResumeTransport for MockTransport {
    async fn resume(&self, request: &ResumeRequest) -> Result<(), WorkerError> {
        self.calls.lock().unwrap().push(request.clone());
        if self.fail {
            Err(WorkerError::Exhausted {
                attempts: 5,
                last_error: "connection refused".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

pub fn app(fail_resume: bool) -> (Router, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport {
        calls: Mutex::new(Vec::new()),
        fail: fail_resume,
    });
    let state = AppState::with_transport(
        &Config::default(),
        transport.clone(),
        Some(TEST_TOKEN.to_string()),
    );
    (stagegate::router(state), transport)
}

/// Send one request and decode the JSON response body (empty bodies come
/// back as `Value::Null`).
pub async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    bearer: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

/// POST /runs and return the new run id.
pub async fn create_run(app: &Router) -> String {
    let (status, body) = send(app, "POST", "/runs", None, None).await;
    assert_eq!(status, StatusCode::CREATED);
    body["runId"].as_str().unwrap().to_string()
}

/// Deliver a worker event with the valid token.
pub async fn deliver(app: &Router, event: Value) -> (StatusCode, Value) {
    send(app, "POST", "/webhook", Some(TEST_TOKEN), Some(event)).await
}
