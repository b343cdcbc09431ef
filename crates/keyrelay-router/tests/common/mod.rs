#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;

use keyrelay_core::{AppState, CliArgs, bootstrap_with_store};
use keyrelay_storage::{MemoryConfigStore, PersistedConfig};

pub const ADMIN_KEY: &str = "admin";

pub struct Harness {
    pub app: Router,
    pub state: Arc<AppState>,
    pub persist: Arc<MemoryConfigStore>,
}

pub async fn harness(doc: PersistedConfig) -> Harness {
    let persist = Arc::new(MemoryConfigStore::new(PersistedConfig::default()));
    let args = CliArgs {
        admin_key: Some(ADMIN_KEY.to_string()),
        ..Default::default()
    };
    let state = bootstrap_with_store(args, persist.clone(), doc)
        .await
        .unwrap()
        .state;
    Harness {
        app: keyrelay_router::app_router(state.clone()),
        state,
        persist,
    }
}

impl Harness {
    pub async fn admin(&self, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(format!("/v0/management{path}"))
            .header("x-management-key", ADMIN_KEY);
        self.send(req, body).await
    }

    pub async fn client(&self, method: Method, path: &str, key: &str, body: Option<Value>) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("authorization", format!("Bearer {key}"));
        self.send(req, body).await
    }

    pub async fn send(
        &self,
        builder: axum::http::request::Builder,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let req = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = self.app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }
}
