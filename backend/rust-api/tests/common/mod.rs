#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use codeplayground_api::{
    config::{CompletionConfig, Config, StorageBackend},
    create_router,
    middlewares::auth::{JwtClaims, JwtService},
    models::submission::{Submission, SubmissionFields},
    services::{
        completion_service::{CompletionError, CompletionRequest, CompletionService, CompletionStream},
        submission_store::{InMemorySubmissionStore, StoreError, SubmissionStore},
        submit_lock::LocalSubmitLocks,
        AppState,
    },
};
use futures::stream::{self, StreamExt};
use http_body_util::BodyExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tower::ServiceExt;

pub const JWT_SECRET: &str = "test-secret";

pub fn test_config() -> Config {
    Config {
        mongo_uri: String::new(),
        mongo_database: "codeplayground_test".to_string(),
        redis_uri: String::new(),
        jwt_secret: JWT_SECRET.to_string(),
        bind_addr: "127.0.0.1:0".to_string(),
        storage: StorageBackend::Memory,
        completion: CompletionConfig {
            api_url: "http://completion.invalid/v1".to_string(),
            api_key: "test-key".to_string(),
            model: "test-model".to_string(),
            timeout_secs: 5,
        },
    }
}

/// In-memory store that counts every call made to it.
#[derive(Default)]
pub struct CountingStore {
    pub inner: InMemorySubmissionStore,
    calls: AtomicUsize,
}

impl CountingStore {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubmissionStore for CountingStore {
    async fn list(&self, user_id: &str) -> Result<Vec<Submission>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.list(user_id).await
    }

    async fn create(&self, fields: SubmissionFields) -> Result<Submission, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.create(fields).await
    }

    async fn update(&self, id: &str, fields: SubmissionFields) -> Result<Submission, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.update(id, fields).await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(id).await
    }
}

pub enum Reply {
    Chunks(Vec<&'static str>),
    Fail,
}

/// Completion provider that plays back queued replies. When gated, every
/// stream waits for `open_gate` before producing anything.
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<Reply>>,
    gate: Option<Arc<Semaphore>>,
    calls: AtomicUsize,
}

impl ScriptedCompletion {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn gated(replies: Vec<Reply>) -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::new(replies)
        }
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn stream(&self, _request: CompletionRequest) -> Result<CompletionStream, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Chunks(vec!["// fine\n", "{ passed: true }"]));

        let items: Vec<Result<String, CompletionError>> = match reply {
            Reply::Chunks(chunks) => chunks.into_iter().map(|c| Ok(c.to_string())).collect(),
            Reply::Fail => vec![Ok("// half an ans".to_string()), Err(CompletionError::Truncated)],
        };

        let gate = self.gate.clone();
        let wait = stream::once(async move {
            if let Some(gate) = gate {
                let _permit = gate.acquire().await;
            }
        })
        .filter_map(|_| async { None::<Result<String, CompletionError>> });

        Ok(wait.chain(stream::iter(items)).boxed())
    }
}

pub struct TestApp {
    pub router: Router,
    pub store: Arc<CountingStore>,
    pub completions: Arc<ScriptedCompletion>,
}

pub fn create_test_app(completions: ScriptedCompletion) -> TestApp {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let store = Arc::new(CountingStore::default());
    let completions = Arc::new(completions);
    let state = Arc::new(AppState::from_parts(
        test_config(),
        store.clone(),
        completions.clone(),
        Arc::new(LocalSubmitLocks::default()),
    ));

    TestApp {
        router: create_router(state),
        store,
        completions,
    }
}

pub fn token_for(user_id: &str) -> String {
    JwtService::new(JWT_SECRET)
        .generate_token(&JwtClaims::for_user(user_id, 3600))
        .unwrap()
}

pub async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    user_id: Option<&str>,
    body: Option<serde_json::Value>,
) -> (StatusCode, String) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user_id) = user_id {
        builder = builder.header("authorization", format!("Bearer {}", token_for(user_id)));
    }
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

/// Splits an SSE body into `(event name, JSON data)` pairs, skipping
/// keep-alive comments.
pub fn sse_events(body: &str) -> Vec<(String, serde_json::Value)> {
    body.split("\n\n")
        .filter_map(|frame| {
            let mut name = None;
            let mut data = None;
            for line in frame.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    name = Some(rest.trim().to_string());
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data = Some(rest.trim().to_string());
                }
            }
            let data = serde_json::from_str(&data?).ok()?;
            Some((name?, data))
        })
        .collect()
}

/// The last event of a grading stream.
pub fn terminal_event(body: &str) -> (String, serde_json::Value) {
    sse_events(body)
        .pop()
        .unwrap_or_else(|| panic!("no SSE events in body: {}", body))
}
