use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use thiserror::Error;
use url::Url;

/// Storage key: the credential file's name inside the config directory.
pub const CREDENTIAL_KEY: &str = "scanner_password";

pub const DEFAULT_API_URL: &str = "http://localhost:5000";

/// Runtime configuration for the console.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleConfig {
    /// Backend base URL; `/api/...` paths are appended to it.
    pub api_url: String,
    pub credential_path: PathBuf,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub scan_poll_interval: Duration,
    pub log_poll_interval: Duration,
    /// Rows from the bottom within which the log viewport keeps following.
    pub scroll_threshold: usize,
    /// Keep the stored credential when the startup check cannot reach the backend.
    pub keep_credential_on_unreachable: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            credential_path: default_credential_path(),
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
            scan_poll_interval: Duration::from_secs(2),
            log_poll_interval: Duration::from_secs(2),
            scroll_threshold: 2,
            keep_credential_on_unreachable: true,
        }
    }
}

impl ConsoleConfig {
    /// Parsed and validated base URL.
    pub fn api_base(&self) -> Result<Url, ConfigError> {
        validate_api_url(&self.api_url)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid api url: {0}")]
    InvalidApiUrl(String),
    #[error("cannot build http client: {0}")]
    HttpClient(String),
}

/// Accepts `http`/`https` URLs that can carry a path. A missing scheme is read
/// as `http://`.
pub fn validate_api_url(raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let url = Url::parse(&with_scheme)
        .map_err(|e| ConfigError::InvalidApiUrl(format!("{raw}: {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::InvalidApiUrl(format!(
            "{raw}: scheme must be http or https"
        )));
    }
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(ConfigError::InvalidApiUrl(format!("{raw}: missing host")));
    }
    Ok(url)
}

/// `<config dir>/scan-console/scanner_password`, or the working directory when
/// the platform has no config directory.
pub fn default_credential_path() -> PathBuf {
    ProjectDirs::from("", "", "scan-console")
        .map(|dirs| dirs.config_dir().join(CREDENTIAL_KEY))
        .unwrap_or_else(|| PathBuf::from(CREDENTIAL_KEY))
}
