//! Request gateway: every remote call goes through [`Gateway`], which attaches
//! the current credential and folds the outcome into a tagged [`Failure`].

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::config::{ConfigError, ConsoleConfig};
use crate::credential::{Credential, CredentialView};
use crate::types::{
    AiStatus, Device, DeviceDetails, LogEntry, LogLevel, NetworkInterface, PasswordUpdated,
    Report, ReportDetails, ScanParams, ScanResults, ScanStarted, ScanStatus, ScanStopped, Settings,
    Vulnerability,
};

/// Header carrying the raw secret on authenticated calls.
pub const AUTH_HEADER: &str = "X-Auth-Password";

/// Used when a rejected response carries no message of its own.
pub const GENERIC_FAILURE: &str = "Request failed";

/// Outcome of a call that did not produce the expected payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    /// No response obtainable; the backend is presumed down.
    #[error("{0}")]
    Connection(String),
    /// The backend answered but rejected the operation.
    #[error("{0}")]
    Application(String),
    /// Caller-side misuse caught before any network call.
    #[error("{0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Connection,
    Application,
    Validation,
}

impl Failure {
    pub fn kind(&self) -> FailureKind {
        match self {
            Failure::Connection(_) => FailureKind::Connection,
            Failure::Application(_) => FailureKind::Application,
            Failure::Validation(_) => FailureKind::Validation,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Failure::Connection(m) | Failure::Application(m) | Failure::Validation(m) => m,
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Failure::Connection(_))
    }
}

/// A request as handed to a [`Transport`].
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Unencoded path segments, e.g. `["api", "devices", "10.0.0.1"]`.
    pub segments: Vec<String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub credential: Option<Credential>,
}

impl ApiRequest {
    /// Unencoded path, for matching and diagnostics.
    pub fn path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn json(status: StatusCode, body: &Value) -> Self {
        Self {
            status,
            body: body.to_string().into_bytes(),
        }
    }
}

/// No response could be obtained.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Moves one request to the backend and back. Implementations do not retry.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// HTTP transport over reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
}

impl HttpTransport {
    pub fn new(config: &ConsoleConfig) -> Result<Self, ConfigError> {
        let base = config.api_base()?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self { client, base })
    }

    fn url_for(&self, request: &ApiRequest) -> Result<Url, TransportError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError(format!("base url cannot carry a path: {}", self.base)))?
            .pop_if_empty()
            .extend(&request.segments);
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&request.query);
        }
        Ok(url)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = self.url_for(&request)?;
        let mut builder = self.client.request(request.method.clone(), url);
        if let Some(credential) = &request.credential {
            builder = builder.header(AUTH_HEADER, credential.expose());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        Ok(ApiResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// One logical call: method, path, optional query and JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    method: Method,
    segments: Vec<String>,
    query: Vec<(String, String)>,
    body: Option<Value>,
}

impl Call {
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            segments: path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: &str) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: &str) -> Self {
        Self::new(Method::PUT, path)
    }

    /// Append one path segment verbatim; the transport percent-encodes it.
    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json<B: Serialize>(mut self, body: &B) -> Result<Self, Failure> {
        let value = serde_json::to_value(body)
            .map_err(|e| Failure::Validation(format!("unserializable request body: {e}")))?;
        self.body = Some(value);
        Ok(self)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
}

/// Folds a response into the payload or an `Application` failure.
///
/// Non-2xx responses use the body's `error` field when present.
pub fn decode_envelope<T: DeserializeOwned>(response: &ApiResponse) -> Result<T, Failure> {
    if !response.status.is_success() {
        return Err(Failure::Application(rejection_message(&response.body)));
    }
    serde_json::from_slice(&response.body)
        .map_err(|e| Failure::Application(format!("malformed response: {e}")))
}

fn rejection_message(body: &[u8]) -> String {
    serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| GENERIC_FAILURE.to_string())
}

/// Answer of the authenticate call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthVerdict {
    pub valid: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    password: &'a str,
}

#[derive(Serialize)]
struct PasswordChange<'a> {
    old_password: &'a str,
    new_password: &'a str,
}

/// Uniform entry point for remote calls. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    transport: Arc<dyn Transport>,
    credential: CredentialView,
}

impl Gateway {
    pub fn new(transport: Arc<dyn Transport>, credential: CredentialView) -> Self {
        Self {
            transport,
            credential,
        }
    }

    /// Issue a structured call and decode its payload.
    pub async fn call<T: DeserializeOwned>(&self, call: Call) -> Result<T, Failure> {
        let response = self.send(call).await?;
        decode_envelope(&response)
    }

    /// Binary variant: raw bytes, or `None` when the payload is unavailable
    /// for any reason.
    pub async fn download(&self, call: Call) -> Option<Vec<u8>> {
        match self.send(call).await {
            Ok(response) if response.status.is_success() => Some(response.body),
            Ok(response) => {
                tracing::debug!(status = %response.status, "download rejected");
                None
            }
            Err(failure) => {
                tracing::debug!(error = %failure, "download failed");
                None
            }
        }
    }

    async fn send(&self, call: Call) -> Result<ApiResponse, Failure> {
        let request = ApiRequest {
            method: call.method,
            segments: call.segments,
            query: call.query,
            body: call.body,
            credential: self.credential.current(),
        };
        let path = request.path();
        let method = request.method.clone();
        match self.transport.send(request).await {
            Ok(response) => {
                tracing::trace!(%method, %path, status = %response.status, "call settled");
                Ok(response)
            }
            Err(e) => {
                tracing::debug!(%method, %path, error = %e, "transport failure");
                Err(Failure::Connection(e.0))
            }
        }
    }

    pub async fn authenticate(&self, candidate: &Credential) -> Result<AuthVerdict, Failure> {
        self.call(Call::post("api/auth").json(&AuthRequest {
            password: candidate.expose(),
        })?)
        .await
    }

    pub async fn interfaces(&self) -> Result<Vec<NetworkInterface>, Failure> {
        self.call(Call::get("api/interfaces")).await
    }

    pub async fn start_scan(&self, params: &ScanParams) -> Result<ScanStarted, Failure> {
        self.call(Call::post("api/scan/start").json(params)?).await
    }

    pub async fn scan_status(&self) -> Result<ScanStatus, Failure> {
        self.call(Call::get("api/scan/status")).await
    }

    pub async fn scan_results(&self) -> Result<ScanResults, Failure> {
        self.call(Call::get("api/scan/results")).await
    }

    pub async fn stop_scan(&self) -> Result<ScanStopped, Failure> {
        self.call(Call::post("api/scan/stop")).await
    }

    pub async fn devices(&self) -> Result<Vec<Device>, Failure> {
        self.call(Call::get("api/devices")).await
    }

    pub async fn device(&self, ip: &str) -> Result<DeviceDetails, Failure> {
        self.call(Call::get("api/devices").segment(ip)).await
    }

    pub async fn vulnerabilities(&self) -> Result<Vec<Vulnerability>, Failure> {
        self.call(Call::get("api/vulnerabilities")).await
    }

    pub async fn reports(&self) -> Result<Vec<Report>, Failure> {
        self.call(Call::get("api/reports")).await
    }

    pub async fn report(&self, id: &str) -> Result<ReportDetails, Failure> {
        self.call(Call::get("api/reports").segment(id)).await
    }

    pub async fn download_report(&self, id: &str) -> Option<Vec<u8>> {
        self.download(Call::get("api/reports").segment(id).segment("download"))
            .await
    }

    /// `None` requests every level.
    pub async fn logs(&self, level: Option<LogLevel>) -> Result<Vec<LogEntry>, Failure> {
        let mut call = Call::get("api/logs");
        if let Some(level) = level {
            call = call.query("level", level.as_str());
        }
        self.call(call).await
    }

    pub async fn ai_status(&self) -> Result<AiStatus, Failure> {
        self.call(Call::get("api/ai/status")).await
    }

    pub async fn settings(&self) -> Result<Settings, Failure> {
        self.call(Call::get("api/settings")).await
    }

    pub async fn update_settings(&self, changes: &Settings) -> Result<Settings, Failure> {
        self.call(Call::put("api/settings").json(changes)?).await
    }

    pub async fn update_password(
        &self,
        old: &Credential,
        new: &Credential,
    ) -> Result<PasswordUpdated, Failure> {
        self.call(Call::post("api/settings/password").json(&PasswordChange {
            old_password: old.expose(),
            new_password: new.expose(),
        })?)
        .await
    }
}
