//! Library crate for scan-console: client-side coordination for an operator
//! console over a remote network security scanner.
//!
//! - [`gateway`]: uniform request envelope and typed endpoint catalog.
//! - [`auth`]: credential lifecycle and session state.
//! - [`scan`]: scan start/stop and progress tracking by polling.
//! - [`logs`]: bounded, filterable view over the remote log.
pub mod auth;
pub mod config;
pub mod credential;
pub mod gateway;
pub mod logs;
pub mod periodic;
pub mod ports;
pub mod scan;
pub mod target;
pub mod types;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::auth::AuthSession;
use crate::config::{ConfigError, ConsoleConfig};
use crate::credential::{credential_cell, CredentialStore, FileCredentialStore};
use crate::gateway::{Gateway, HttpTransport, Transport};
use crate::logs::LogConsumer;
use crate::scan::{ScanController, ScanNotice};

/// Rows shown by a log viewport unless the front end says otherwise.
pub const DEFAULT_VIEWPORT_ROWS: usize = 30;

/// The three stateful components sharing one gateway. Only the session
/// writes the credential; the others see it through the gateway.
pub struct Console {
    pub gateway: Gateway,
    pub session: AuthSession,
    pub scans: ScanController,
    pub scan_notices: mpsc::UnboundedReceiver<ScanNotice>,
    pub logs: LogConsumer,
}

impl Console {
    /// Wire the components over an arbitrary transport and store.
    pub fn new(
        config: &ConsoleConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        let (writer, view) = credential_cell();
        let gateway = Gateway::new(transport, view);
        let session = AuthSession::new(
            gateway.clone(),
            writer,
            store,
            config.keep_credential_on_unreachable,
        );
        let (scans, scan_notices) = ScanController::new(gateway.clone(), config.scan_poll_interval);
        let logs = LogConsumer::new(
            gateway.clone(),
            config.log_poll_interval,
            DEFAULT_VIEWPORT_ROWS,
            config.scroll_threshold,
        );
        Self {
            gateway,
            session,
            scans,
            scan_notices,
            logs,
        }
    }

    /// HTTP transport and file-backed credential storage, per `config`.
    pub fn from_config(config: &ConsoleConfig) -> Result<Self, ConfigError> {
        let transport = Arc::new(HttpTransport::new(config)?);
        let store = Arc::new(FileCredentialStore::new(config.credential_path.clone()));
        Ok(Self::new(config, transport, store))
    }
}
