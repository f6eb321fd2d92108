#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

use scan_console::config::ConsoleConfig;
use scan_console::credential::{Credential, CredentialStore, MemoryCredentialStore};
use scan_console::gateway::{ApiRequest, ApiResponse, Transport, TransportError};
use scan_console::Console;

/// One scripted answer, optionally delayed.
#[derive(Debug, Clone)]
pub struct Reply {
    delay: Duration,
    outcome: Result<(StatusCode, Value), String>,
}

impl Reply {
    pub fn ok(body: Value) -> Self {
        Self::status(StatusCode::OK, body)
    }

    pub fn status(status: StatusCode, body: Value) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Ok((status, body)),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Err("connection refused".into()),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// In-memory backend: per-route reply queues, every request recorded.
/// The last reply of a queue repeats; unscripted routes answer 404.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<ApiRequest>>,
}

fn route_key(method: &Method, path: &str) -> String {
    format!("{method} {path}")
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace the replies for `method path`.
    pub fn script(&self, method: Method, path: &str, replies: Vec<Reply>) {
        self.routes
            .lock()
            .unwrap()
            .insert(route_key(&method, path), replies.into());
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, method: Method, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method && r.path() == path)
            .count()
    }

    pub fn last(&self, method: Method, path: &str) -> Option<ApiRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.method == method && r.path() == path)
            .cloned()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let key = route_key(&request.method, &request.path());
        self.requests.lock().unwrap().push(request);
        let reply = {
            let mut routes = self.routes.lock().unwrap();
            match routes.get_mut(&key) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        }
        .unwrap_or_else(|| Reply::status(StatusCode::NOT_FOUND, json!({"error": "Not found"})));

        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        match reply.outcome {
            Ok((status, body)) => Ok(ApiResponse::json(status, &body)),
            Err(e) => Err(TransportError(e)),
        }
    }
}

pub fn valid() -> Reply {
    Reply::ok(json!({"valid": true}))
}

pub fn invalid() -> Reply {
    Reply::status(
        StatusCode::UNAUTHORIZED,
        json!({"valid": false, "error": "Invalid password"}),
    )
}

pub fn status(is_scanning: bool, progress: f64, devices_found: u64) -> Reply {
    Reply::ok(json!({
        "is_scanning": is_scanning,
        "progress": progress,
        "current_phase": if is_scanning { "port_scan" } else { "complete" },
        "devices_found": devices_found,
        "estimated_time_remaining": if is_scanning { Some(30) } else { None },
    }))
}

pub fn log_entries(messages: &[(&str, &str)]) -> Reply {
    let entries: Vec<Value> = messages
        .iter()
        .enumerate()
        .map(|(i, (level, message))| {
            json!({
                "timestamp": format!("2026-10-17T10:00:{:02}Z", i),
                "level": level,
                "message": message,
            })
        })
        .collect();
    Reply::ok(Value::Array(entries))
}

/// Console over `transport` with the default 2s cadences.
pub fn console_with(transport: Arc<ScriptedTransport>, store: Arc<dyn CredentialStore>) -> Console {
    Console::new(&ConsoleConfig::default(), transport, store)
}

/// Console that is already logged in with `secret`.
pub async fn logged_in(transport: &Arc<ScriptedTransport>, secret: &str) -> Console {
    transport.script(Method::POST, "/api/auth", vec![valid()]);
    let console = console_with(transport.clone(), Arc::new(MemoryCredentialStore::new()));
    console
        .session
        .login(Credential::new(secret))
        .await
        .expect("login");
    console
}
