#![allow(dead_code)]
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use realmwatch_devkit::TestHarness;
use realmwatch_kernel::config::UserConf;
use realmwatch_kernel::health::HealthTracker;
use realmwatch_kernel::http::{build_router, AppState};
use realmwatch_kernel::visibility::CallerDirectory;
use serde_json::Value;
use std::sync::Arc;
use tower::util::ServiceExt;

pub const ADMIN_KEY: &str = "admin-key";
pub const SCOPED_KEY: &str = "scoped-key";

pub struct TestContext {
    pub harness: TestHarness,
    pub app: axum::Router,
}

/// Router complet : une clé admin et une clé limitée au realm "Scoped" (sans sous-realms)
pub fn build_test_context() -> TestContext {
    let harness = TestHarness::new();
    let users = vec![UserConf {
        name: "scoped".into(),
        api_key: SCOPED_KEY.into(),
        realm: Some("Scoped".into()),
        sub_realm: false,
        admin: false,
    }];
    let state = AppState {
        kernel: harness.kernel.clone(),
        callers: Arc::new(CallerDirectory::new(&users, Some(ADMIN_KEY.into()))),
        health_tracker: HealthTracker::new(harness.kernel.store.clone()),
    };
    let app = build_router(state);
    TestContext { harness, app }
}

pub async fn request_json(
    app: &axum::Router,
    method: &str,
    uri: &str,
    key: Option<&str>,
    if_match: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = key {
        builder = builder.header("x-api-key", key);
    }
    if let Some(etag) = if_match {
        builder = builder.header("If-Match", etag);
    }
    let req = match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request should build");

    let resp = app.clone().oneshot(req).await.expect("request should be handled");
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body should read");
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice::<Value>(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, json)
}

pub async fn get(app: &axum::Router, uri: &str, key: &str) -> (StatusCode, Value) {
    request_json(app, "GET", uri, Some(key), None, None).await
}
