//! Operator credential: the secret value, its durable storage, and the
//! single-writer cell through which the gateway reads it.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::watch;

/// Opaque operator secret. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Raw secret, for the wire only.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("credential storage i/o failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("credential storage unavailable: {0}")]
    Unavailable(String),
}

/// Durable client-side storage for the credential, keyed by a single
/// well-known name.
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when nothing is stored.
    fn load(&self) -> Result<Option<Credential>, StoreError>;

    fn save(&self, credential: &Credential) -> Result<(), StoreError>;

    /// Idempotent: succeeds when nothing is stored.
    fn clear(&self) -> Result<(), StoreError>;
}

/// Stores the credential as the sole content of one file.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<Credential>, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => {
                let value = raw.trim_end_matches(['\r', '\n']);
                if value.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(Credential::new(value)))
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| self.io_err(e))?;
        }
        write_private(&self.path, credential.expose().as_bytes()).map_err(|e| self.io_err(e))
    }

    fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    fs::write(path, contents)
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    slot: Mutex<Option<Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(credential: Credential) -> Self {
        Self {
            slot: Mutex::new(Some(credential)),
        }
    }

    pub fn current(&self) -> Option<Credential> {
        self.slot.lock().ok().and_then(|guard| guard.clone())
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<Credential>, StoreError> {
        let guard = self
            .slot
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".into()))?;
        Ok(guard.clone())
    }

    fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        let mut guard = self
            .slot
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".into()))?;
        *guard = Some(credential.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut guard = self
            .slot
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".into()))?;
        *guard = None;
        Ok(())
    }
}

/// Create the credential cell: one writer (owned by the auth session) and any
/// number of read-only views (held by the gateway).
pub fn credential_cell() -> (CredentialWriter, CredentialView) {
    let (tx, rx) = watch::channel(None);
    (CredentialWriter { tx }, CredentialView { rx })
}

/// Exclusive write side of the credential cell. Not `Clone`.
#[derive(Debug)]
pub struct CredentialWriter {
    tx: watch::Sender<Option<Credential>>,
}

impl CredentialWriter {
    pub fn publish(&self, credential: Credential) {
        self.tx.send_replace(Some(credential));
    }

    pub fn revoke(&self) {
        self.tx.send_replace(None);
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn view(&self) -> CredentialView {
        CredentialView {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read-only view of the confirmed credential.
#[derive(Debug, Clone)]
pub struct CredentialView {
    rx: watch::Receiver<Option<Credential>>,
}

impl CredentialView {
    pub fn current(&self) -> Option<Credential> {
        self.rx.borrow().clone()
    }
}
