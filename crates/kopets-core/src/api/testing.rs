//! In-memory server used by the API tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use super::auth::{TokenPair, REFRESH_PATH};
use super::transport::{HttpRequest, HttpResponse, Transport};
use super::ApiError;

pub(crate) const BASE_URL: &str = "http://kopets.test/api";

/// Path that fails at the transport level
pub(crate) const OFFLINE_PATH: &str = "offline/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Call {
    pub path: String,
    pub bearer: Option<String>,
}

enum RefreshReply {
    Tokens(TokenPair),
    Fail(u16, String),
    Unreachable,
}

/// Accepts exactly one bearer token; everything else is a 401.
pub(crate) struct FakeServer {
    valid_token: Mutex<String>,
    canned: Mutex<HashMap<String, (u16, String)>>,
    bodies: Mutex<HashMap<String, Value>>,
    always_unauthorized: Mutex<HashSet<String>>,
    held: Mutex<HashMap<String, Arc<Notify>>>,
    refresh_reply: Mutex<RefreshReply>,
    refresh_gate: Mutex<Option<Arc<Notify>>>,
    refresh_calls: AtomicUsize,
    refresh_tokens_seen: Mutex<Vec<String>>,
    calls: Mutex<Vec<Call>>,
}

impl FakeServer {
    /// The refresh endpoint mints `valid_token` without rotating the refresh token
    pub fn new(valid_token: &str) -> Self {
        Self {
            valid_token: Mutex::new(valid_token.to_string()),
            canned: Mutex::new(HashMap::new()),
            bodies: Mutex::new(HashMap::new()),
            always_unauthorized: Mutex::new(HashSet::new()),
            held: Mutex::new(HashMap::new()),
            refresh_reply: Mutex::new(RefreshReply::Tokens(TokenPair {
                access: valid_token.to_string(),
                refresh: None,
            })),
            refresh_gate: Mutex::new(None),
            refresh_calls: AtomicUsize::new(0),
            refresh_tokens_seen: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fixed reply for a path, regardless of credentials
    pub fn respond(&self, path: &str, status: u16, body: &str) {
        self.canned
            .lock()
            .unwrap()
            .insert(path.to_string(), (status, body.to_string()));
    }

    pub fn rotate_refresh_token(&self, refresh: &str) {
        let access = self.valid_token.lock().unwrap().clone();
        *self.refresh_reply.lock().unwrap() = RefreshReply::Tokens(TokenPair {
            access,
            refresh: Some(refresh.to_string()),
        });
    }

    pub fn fail_refresh(&self, status: u16, body: &str) {
        *self.refresh_reply.lock().unwrap() = RefreshReply::Fail(status, body.to_string());
    }

    /// Refresh calls fail at the transport level
    pub fn refresh_unreachable(&self) {
        *self.refresh_reply.lock().unwrap() = RefreshReply::Unreachable;
    }

    /// Path answers 401 even to the valid token
    pub fn reject_always(&self, path: &str) {
        self.always_unauthorized.lock().unwrap().insert(path.to_string());
    }

    /// Make refresh calls wait until `release_refresh`
    pub fn gate_refresh(&self) {
        *self.refresh_gate.lock().unwrap() = Some(Arc::new(Notify::new()));
    }

    pub fn release_refresh(&self) {
        if let Some(gate) = self.refresh_gate.lock().unwrap().as_ref() {
            gate.notify_one();
        }
    }

    /// Hold the next response for `path` until the returned handle is
    /// notified. The call is recorded before it is held.
    pub fn hold(&self, path: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.held
            .lock()
            .unwrap()
            .insert(path.to_string(), notify.clone());
        notify
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_tokens_seen(&self) -> Vec<String> {
        self.refresh_tokens_seen.lock().unwrap().clone()
    }

    /// Non-refresh calls in the order they reached the server
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.path == path).collect()
    }

    pub fn last_body(&self, path: &str) -> Option<Value> {
        self.bodies.lock().unwrap().get(path).cloned()
    }

    fn path_of(url: &str) -> String {
        url.strip_prefix(BASE_URL)
            .unwrap_or(url)
            .trim_start_matches('/')
            .to_string()
    }

    fn refresh_response(&self) -> Result<HttpResponse, ApiError> {
        match &*self.refresh_reply.lock().unwrap() {
            RefreshReply::Tokens(pair) => Ok(HttpResponse::new(
                200,
                serde_json::to_string(pair).unwrap(),
            )),
            RefreshReply::Fail(status, body) => Ok(HttpResponse::new(*status, body.clone())),
            RefreshReply::Unreachable => Err(ApiError::Network("connection refused".to_string())),
        }
    }
}

#[async_trait]
impl Transport for FakeServer {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let path = Self::path_of(&request.url);
        if let Some(ref body) = request.body {
            self.bodies.lock().unwrap().insert(path.clone(), body.clone());
        }

        if path == REFRESH_PATH {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = request
                .body
                .as_ref()
                .and_then(|b| b["refresh"].as_str())
            {
                self.refresh_tokens_seen.lock().unwrap().push(token.to_string());
            }
            let gate = self.refresh_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            return self.refresh_response();
        }

        self.calls.lock().unwrap().push(Call {
            path: path.clone(),
            bearer: request.bearer.clone(),
        });

        let canned = self.canned.lock().unwrap().get(&path).cloned();
        if let Some((status, body)) = canned {
            return Ok(HttpResponse::new(status, body));
        }

        if path == OFFLINE_PATH {
            return Err(ApiError::Network("connection refused".to_string()));
        }

        let held = self.held.lock().unwrap().remove(&path);
        if let Some(held) = held {
            held.notified().await;
        }

        let valid = self.valid_token.lock().unwrap().clone();
        let authorized = request.bearer.as_deref() == Some(valid.as_str())
            && !self.always_unauthorized.lock().unwrap().contains(&path);

        if authorized {
            Ok(HttpResponse::new(
                200,
                json!({ "path": path, "bearer": request.bearer }).to_string(),
            ))
        } else {
            Ok(HttpResponse::new(
                401,
                r#"{"detail": "Given token not valid for any token type", "code": "token_not_valid"}"#,
            ))
        }
    }
}

/// Poll until `condition` holds, failing the test after a few seconds
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}
