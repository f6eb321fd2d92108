//! Auth session: owns the credential from acquisition to invalidation.
//!
//! State is published on a `watch` channel so a UI can observe it. The
//! confirmed credential is published to the gateway through the
//! [`CredentialWriter`] only while the session is `Authenticated`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::credential::{Credential, CredentialStore, CredentialWriter, StoreError};
use crate::gateway::{AuthVerdict, Failure, Gateway};

/// Surfaced when the backend cannot be reached during login.
pub const UNREACHABLE_MESSAGE: &str = "Scanner service unreachable. Is the scanner running?";

/// Surfaced when the backend answers `valid: false` without its own message.
pub const INVALID_PASSWORD: &str = "Invalid password";

/// Returned to a login call whose result lost to a newer attempt or a logout.
pub const SUPERSEDED: &str = "login superseded by a newer attempt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Startup check not run yet.
    Unknown,
    Checking,
    Authenticated,
    Unauthenticated,
}

/// What a UI observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSnapshot {
    pub state: AuthState,
    pub loading: bool,
    pub last_error: Option<String>,
}

impl AuthSnapshot {
    pub fn authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }
}

impl Default for AuthSnapshot {
    fn default() -> Self {
        Self {
            state: AuthState::Unknown,
            loading: false,
            last_error: None,
        }
    }
}

/// How a login call's outcome changes the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginResolution {
    Accept,
    Reject(Failure),
}

pub fn resolve_login(outcome: &Result<AuthVerdict, Failure>) -> LoginResolution {
    match outcome {
        Ok(verdict) if verdict.valid => LoginResolution::Accept,
        Ok(verdict) => LoginResolution::Reject(Failure::Application(
            verdict
                .error
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| INVALID_PASSWORD.to_string()),
        )),
        Err(Failure::Connection(_)) => {
            LoginResolution::Reject(Failure::Connection(UNREACHABLE_MESSAGE.to_string()))
        }
        Err(other) => LoginResolution::Reject(other.clone()),
    }
}

/// How the startup check of a stored credential changes the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupResolution {
    Accept,
    /// Rejected: drop the stored credential.
    Discard,
    /// Backend unreachable: keep the stored credential for a later revalidation.
    Retain,
}

pub fn resolve_startup(
    outcome: &Result<AuthVerdict, Failure>,
    keep_on_unreachable: bool,
) -> StartupResolution {
    match outcome {
        Ok(verdict) if verdict.valid => StartupResolution::Accept,
        Err(Failure::Connection(_)) if keep_on_unreachable => StartupResolution::Retain,
        _ => StartupResolution::Discard,
    }
}

pub struct AuthSession {
    gateway: Gateway,
    store: Arc<dyn CredentialStore>,
    writer: CredentialWriter,
    state: watch::Sender<AuthSnapshot>,
    attempts: AtomicU64,
    /// Serializes store writes against the attempt counter.
    persist: Mutex<()>,
    keep_on_unreachable: bool,
}

impl AuthSession {
    pub fn new(
        gateway: Gateway,
        writer: CredentialWriter,
        store: Arc<dyn CredentialStore>,
        keep_on_unreachable: bool,
    ) -> Self {
        let (state, _) = watch::channel(AuthSnapshot::default());
        Self {
            gateway,
            store,
            writer,
            state,
            attempts: AtomicU64::new(0),
            persist: Mutex::new(()),
            keep_on_unreachable,
        }
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.state.subscribe()
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Startup check. Runs once; later calls return the current state.
    pub async fn bootstrap(&self) -> AuthState {
        let current = self.snapshot().state;
        if current != AuthState::Unknown {
            return current;
        }
        self.check_stored().await
    }

    /// Re-run the startup check against a credential kept after an
    /// unreachable startup. No-op unless `Unauthenticated`.
    pub async fn revalidate(&self) -> AuthState {
        let current = self.snapshot().state;
        if current != AuthState::Unauthenticated {
            return current;
        }
        self.check_stored().await
    }

    async fn check_stored(&self) -> AuthState {
        let attempt = self.next_attempt();
        self.state.send_modify(|s| {
            s.state = AuthState::Checking;
            s.loading = true;
        });

        let stored = match self.store.load() {
            Ok(stored) => stored.filter(|c| !c.is_blank()),
            Err(e) => {
                tracing::warn!(error = %e, "cannot read stored credential");
                None
            }
        };
        let Some(candidate) = stored else {
            self.state.send_modify(|s| {
                if self.is_current(attempt) {
                    s.state = AuthState::Unauthenticated;
                    s.loading = false;
                }
            });
            return self.snapshot().state;
        };

        let outcome = self.gateway.authenticate(&candidate).await;
        let resolution = resolve_startup(&outcome, self.keep_on_unreachable);
        if resolution == StartupResolution::Discard
            && self.persist_if_current(attempt, |store| store.clear())
        {
            tracing::info!("stored credential rejected; cleared");
        }
        self.state.send_modify(|s| {
            if !self.is_current(attempt) {
                return;
            }
            s.loading = false;
            match resolution {
                StartupResolution::Accept => {
                    self.writer.publish(candidate);
                    s.state = AuthState::Authenticated;
                    s.last_error = None;
                    tracing::info!("stored credential confirmed");
                }
                StartupResolution::Discard => {
                    self.writer.revoke();
                    s.state = AuthState::Unauthenticated;
                }
                StartupResolution::Retain => {
                    self.writer.revoke();
                    s.state = AuthState::Unauthenticated;
                    s.last_error = Some(UNREACHABLE_MESSAGE.to_string());
                    tracing::info!("backend unreachable at startup; stored credential kept");
                }
            }
        });
        self.snapshot().state
    }

    /// Authenticate with `candidate`. Only valid while no session is
    /// established or being checked. Overlapping calls are tolerated: the
    /// most recent call's result is applied and earlier ones get
    /// `Failure::Validation(SUPERSEDED)`.
    pub async fn login(&self, candidate: Credential) -> Result<(), Failure> {
        match self.snapshot().state {
            AuthState::Authenticated => {
                return Err(Failure::Validation("already authenticated".into()));
            }
            AuthState::Checking => {
                return Err(Failure::Validation(
                    "stored credential is still being checked".into(),
                ));
            }
            AuthState::Unknown | AuthState::Unauthenticated => {}
        }
        if candidate.is_blank() {
            let failure = Failure::Validation("password must not be empty".into());
            self.state.send_modify(|s| {
                s.last_error = Some(failure.message().to_string());
            });
            return Err(failure);
        }
        let attempt = self.next_attempt();
        self.state.send_modify(|s| {
            s.loading = true;
            s.last_error = None;
        });

        let outcome = self.gateway.authenticate(&candidate).await;
        let resolution = resolve_login(&outcome);
        if resolution == LoginResolution::Accept {
            self.persist_if_current(attempt, |store| store.save(&candidate));
        }
        let mut applied = false;
        self.state.send_modify(|s| {
            if !self.is_current(attempt) {
                return;
            }
            applied = true;
            s.loading = false;
            match &resolution {
                LoginResolution::Accept => {
                    self.writer.publish(candidate.clone());
                    s.state = AuthState::Authenticated;
                    s.last_error = None;
                    tracing::info!("login accepted");
                }
                LoginResolution::Reject(failure) => {
                    self.writer.revoke();
                    s.state = AuthState::Unauthenticated;
                    s.last_error = Some(failure.message().to_string());
                    tracing::info!(kind = ?failure.kind(), "login rejected");
                }
            }
        });

        if !applied {
            return Err(Failure::Validation(SUPERSEDED.into()));
        }
        match resolution {
            LoginResolution::Accept => Ok(()),
            LoginResolution::Reject(failure) => Err(failure),
        }
    }

    /// Forget the credential locally. No network call; any login still in
    /// flight is discarded when it settles.
    pub fn logout(&self) {
        self.next_attempt();
        self.forget_stored();
        self.state.send_modify(|s| {
            self.writer.revoke();
            s.state = AuthState::Unauthenticated;
            s.loading = false;
            s.last_error = None;
        });
        tracing::info!("logged out");
    }

    /// Change the backend password and keep the session on the new one.
    pub async fn change_password(&self, old: Credential, new: Credential) -> Result<(), Failure> {
        if self.snapshot().state != AuthState::Authenticated {
            return Err(Failure::Validation("not authenticated".into()));
        }
        if new.is_blank() || old.is_blank() {
            return Err(Failure::Validation(
                "both current and new password are required".into(),
            ));
        }
        let attempt = self.attempts.load(Ordering::SeqCst);
        let updated = self.gateway.update_password(&old, &new).await?;
        if !updated.updated {
            return Err(Failure::Application("Password was not updated".into()));
        }
        self.persist_if_current(attempt, |store| store.save(&new));
        let mut kept = false;
        self.state.send_modify(|s| {
            if s.state != AuthState::Authenticated || !self.is_current(attempt) {
                return;
            }
            kept = true;
            self.writer.publish(new.clone());
        });
        if kept {
            tracing::info!("password updated");
        }
        Ok(())
    }

    fn next_attempt(&self) -> u64 {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.attempts.load(Ordering::SeqCst) == attempt
    }

    fn forget_stored(&self) {
        let _guard = self.persist.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = self.store.clear() {
            tracing::warn!(error = %e, "cannot clear stored credential");
        }
    }

    /// Run `op` on the store unless `attempt` was overtaken. Called outside
    /// `send_modify`; the state channel's lock is never held across store I/O.
    fn persist_if_current(
        &self,
        attempt: u64,
        op: impl FnOnce(&dyn CredentialStore) -> Result<(), StoreError>,
    ) -> bool {
        let _guard = self.persist.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_current(attempt) {
            return false;
        }
        match op(self.store.as_ref()) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "credential storage failed; session lasts until exit");
                false
            }
        }
    }
}
