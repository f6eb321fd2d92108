mod common;

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use reqwest::Method;
use serde_json::json;
use tokio::sync::watch;

use common::{console_with, invalid, logged_in, valid, Reply, ScriptedTransport};
use scan_console::auth::{AuthSnapshot, AuthState, SUPERSEDED, UNREACHABLE_MESSAGE};
use scan_console::credential::{Credential, CredentialStore, MemoryCredentialStore, StoreError};
use scan_console::gateway::{Failure, FailureKind};

#[tokio::test]
async fn wrong_password_is_rejected_with_backend_message() {
    let transport = ScriptedTransport::new();
    transport.script(Method::POST, "/api/auth", vec![invalid()]);
    let store = Arc::new(MemoryCredentialStore::new());
    let console = console_with(transport.clone(), store.clone());

    let err = console
        .session
        .login(Credential::new("nope"))
        .await
        .unwrap_err();

    assert_eq!(err, Failure::Application("Invalid password".into()));
    let snap = console.session.snapshot();
    assert_eq!(snap.state, AuthState::Unauthenticated);
    assert_eq!(snap.last_error.as_deref(), Some("Invalid password"));
    assert!(!snap.loading);
    assert!(store.current().is_none());

    let sent = transport.last(Method::POST, "/api/auth").unwrap();
    assert_eq!(sent.body, Some(json!({"password": "nope"})));
}

#[tokio::test]
async fn blank_password_never_reaches_the_backend() {
    let transport = ScriptedTransport::new();
    let console = console_with(transport.clone(), Arc::new(MemoryCredentialStore::new()));

    let err = console
        .session
        .login(Credential::new("   "))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Validation);
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn successful_login_persists_and_attaches_credential() {
    let transport = ScriptedTransport::new();
    transport.script(Method::POST, "/api/auth", vec![valid()]);
    transport.script(Method::GET, "/api/devices", vec![Reply::ok(json!([]))]);
    let store = Arc::new(MemoryCredentialStore::new());
    let console = console_with(transport.clone(), store.clone());

    console
        .session
        .login(Credential::new("hunter2"))
        .await
        .unwrap();
    assert!(console.session.snapshot().authenticated());
    assert_eq!(store.current(), Some(Credential::new("hunter2")));

    console.gateway.devices().await.unwrap();
    let sent = transport.last(Method::GET, "/api/devices").unwrap();
    assert_eq!(sent.credential, Some(Credential::new("hunter2")));
}

#[tokio::test]
async fn startup_rejection_clears_stored_credential() {
    let transport = ScriptedTransport::new();
    transport.script(Method::POST, "/api/auth", vec![invalid()]);
    let store = Arc::new(MemoryCredentialStore::with(Credential::new("stale")));
    let console = console_with(transport.clone(), store.clone());

    assert_eq!(console.session.bootstrap().await, AuthState::Unauthenticated);
    assert!(store.current().is_none());
    assert_eq!(transport.count(Method::POST, "/api/auth"), 1);

    // Bootstrap runs once.
    assert_eq!(console.session.bootstrap().await, AuthState::Unauthenticated);
    assert_eq!(transport.count(Method::POST, "/api/auth"), 1);
}

#[tokio::test]
async fn startup_without_stored_credential_makes_no_call() {
    let transport = ScriptedTransport::new();
    let console = console_with(transport.clone(), Arc::new(MemoryCredentialStore::new()));

    assert_eq!(console.session.bootstrap().await, AuthState::Unauthenticated);
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn unreachable_startup_keeps_credential_for_revalidation() {
    let transport = ScriptedTransport::new();
    transport.script(Method::POST, "/api/auth", vec![Reply::unreachable()]);
    let store = Arc::new(MemoryCredentialStore::with(Credential::new("kept")));
    let console = console_with(transport.clone(), store.clone());

    assert_eq!(console.session.bootstrap().await, AuthState::Unauthenticated);
    assert_eq!(store.current(), Some(Credential::new("kept")));
    assert_eq!(
        console.session.snapshot().last_error.as_deref(),
        Some(UNREACHABLE_MESSAGE)
    );

    transport.script(Method::POST, "/api/auth", vec![valid()]);
    assert_eq!(console.session.revalidate().await, AuthState::Authenticated);
    assert_eq!(console.session.snapshot().last_error, None);
}

#[tokio::test]
async fn unreachable_login_reports_service_unreachable() {
    let transport = ScriptedTransport::new();
    transport.script(Method::POST, "/api/auth", vec![Reply::unreachable()]);
    let console = console_with(transport, Arc::new(MemoryCredentialStore::new()));

    let err = console
        .session
        .login(Credential::new("hunter2"))
        .await
        .unwrap_err();
    assert!(err.is_connection());
    assert_eq!(err.message(), UNREACHABLE_MESSAGE);
}

#[tokio::test]
async fn logout_forgets_everything_without_a_network_call() {
    let transport = ScriptedTransport::new();
    transport.script(Method::GET, "/api/devices", vec![Reply::ok(json!([]))]);
    let console = logged_in(&transport, "hunter2").await;
    let calls_before = transport.requests().len();

    console.session.logout();

    assert_eq!(transport.requests().len(), calls_before);
    let snap = console.session.snapshot();
    assert_eq!(snap.state, AuthState::Unauthenticated);
    assert_eq!(snap.last_error, None);

    console.gateway.devices().await.unwrap();
    let sent = transport.last(Method::GET, "/api/devices").unwrap();
    assert_eq!(sent.credential, None);
}

#[tokio::test]
async fn logout_empties_storage() {
    let transport = ScriptedTransport::new();
    transport.script(Method::POST, "/api/auth", vec![valid()]);
    let store = Arc::new(MemoryCredentialStore::new());
    let console = console_with(transport, store.clone());

    console.session.login(Credential::new("hunter2")).await.unwrap();
    assert!(store.current().is_some());
    console.session.logout();
    assert!(store.current().is_none());
}

#[tokio::test(start_paused = true)]
async fn overlapping_logins_resolve_to_the_latest() {
    let transport = ScriptedTransport::new();
    transport.script(
        Method::POST,
        "/api/auth",
        vec![invalid().after(Duration::from_secs(1)), valid()],
    );
    let store = Arc::new(MemoryCredentialStore::new());
    let console = console_with(transport.clone(), store.clone());

    let (first, second) = tokio::join!(
        console.session.login(Credential::new("first")),
        console.session.login(Credential::new("second")),
    );

    assert_eq!(first, Err(Failure::Validation(SUPERSEDED.into())));
    assert_eq!(second, Ok(()));
    let snap = console.session.snapshot();
    assert_eq!(snap.state, AuthState::Authenticated);
    assert_eq!(snap.last_error, None);
    assert_eq!(store.current(), Some(Credential::new("second")));
}

#[tokio::test(start_paused = true)]
async fn logout_discards_login_in_flight() {
    let transport = ScriptedTransport::new();
    transport.script(
        Method::POST,
        "/api/auth",
        vec![valid().after(Duration::from_secs(1))],
    );
    let store = Arc::new(MemoryCredentialStore::new());
    let console = console_with(transport, store.clone());

    let (login, _) = tokio::join!(console.session.login(Credential::new("late")), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        console.session.logout();
    });

    assert_eq!(login, Err(Failure::Validation(SUPERSEDED.into())));
    assert_eq!(console.session.snapshot().state, AuthState::Unauthenticated);
    assert!(store.current().is_none());
}

#[tokio::test(start_paused = true)]
async fn login_during_startup_check_is_rejected_and_check_completes() {
    let transport = ScriptedTransport::new();
    transport.script(
        Method::POST,
        "/api/auth",
        vec![valid().after(Duration::from_secs(1))],
    );
    let store = Arc::new(MemoryCredentialStore::with(Credential::new("stored")));
    let console = console_with(transport.clone(), store.clone());

    let (state, (blank, other)) = tokio::join!(console.session.bootstrap(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(console.session.snapshot().state, AuthState::Checking);
        let blank = console.session.login(Credential::new("  ")).await;
        let other = console.session.login(Credential::new("other")).await;
        (blank, other)
    });

    assert_eq!(blank.unwrap_err().kind(), FailureKind::Validation);
    assert_eq!(other.unwrap_err().kind(), FailureKind::Validation);
    assert_eq!(state, AuthState::Authenticated);
    let snap = console.session.snapshot();
    assert_eq!(snap.state, AuthState::Authenticated);
    assert!(!snap.loading);
    assert_eq!(transport.count(Method::POST, "/api/auth"), 1);
    assert_eq!(store.current(), Some(Credential::new("stored")));
}

#[tokio::test(start_paused = true)]
async fn blank_login_does_not_cancel_login_in_flight() {
    let transport = ScriptedTransport::new();
    transport.script(
        Method::POST,
        "/api/auth",
        vec![valid().after(Duration::from_secs(1))],
    );
    let console = console_with(transport, Arc::new(MemoryCredentialStore::new()));

    let (first, blank) = tokio::join!(console.session.login(Credential::new("hunter2")), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        console.session.login(Credential::new("")).await
    });

    assert_eq!(blank.unwrap_err().kind(), FailureKind::Validation);
    assert_eq!(first, Ok(()));
    assert_eq!(console.session.snapshot().state, AuthState::Authenticated);
}

/// Store that checks, on every save, whether the session state can still be
/// read from another thread.
struct ObservingStore {
    inner: MemoryCredentialStore,
    observer: OnceLock<watch::Receiver<AuthSnapshot>>,
    readable_during_save: Mutex<Vec<bool>>,
}

impl CredentialStore for ObservingStore {
    fn load(&self) -> Result<Option<Credential>, StoreError> {
        self.inner.load()
    }

    fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        if let Some(rx) = self.observer.get() {
            let rx = rx.clone();
            let (tx, done) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let _ = tx.send(rx.borrow().state);
            });
            let readable = done.recv_timeout(Duration::from_millis(500)).is_ok();
            self.readable_during_save.lock().unwrap().push(readable);
        }
        self.inner.save(credential)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.inner.clear()
    }
}

#[tokio::test]
async fn session_state_stays_readable_while_persisting() {
    let transport = ScriptedTransport::new();
    transport.script(Method::POST, "/api/auth", vec![valid()]);
    transport.script(
        Method::POST,
        "/api/settings/password",
        vec![Reply::ok(json!({"updated": true}))],
    );
    let store = Arc::new(ObservingStore {
        inner: MemoryCredentialStore::new(),
        observer: OnceLock::new(),
        readable_during_save: Mutex::new(Vec::new()),
    });
    let console = console_with(transport, store.clone());
    let _ = store.observer.set(console.session.subscribe());

    console.session.login(Credential::new("old")).await.unwrap();
    console
        .session
        .change_password(Credential::new("old"), Credential::new("new"))
        .await
        .unwrap();

    assert_eq!(*store.readable_during_save.lock().unwrap(), vec![true, true]);
    assert_eq!(store.inner.current(), Some(Credential::new("new")));
}

#[tokio::test]
async fn change_password_switches_the_session_credential() {
    let transport = ScriptedTransport::new();
    transport.script(
        Method::POST,
        "/api/settings/password",
        vec![Reply::ok(json!({"updated": true}))],
    );
    transport.script(Method::GET, "/api/settings", vec![Reply::ok(json!({}))]);
    transport.script(Method::POST, "/api/auth", vec![valid()]);
    let store = Arc::new(MemoryCredentialStore::new());
    let console = console_with(transport.clone(), store.clone());
    console.session.login(Credential::new("old")).await.unwrap();

    console
        .session
        .change_password(Credential::new("old"), Credential::new("new"))
        .await
        .unwrap();

    let sent = transport
        .last(Method::POST, "/api/settings/password")
        .unwrap();
    assert_eq!(
        sent.body,
        Some(json!({"old_password": "old", "new_password": "new"}))
    );
    assert_eq!(store.current(), Some(Credential::new("new")));

    console.gateway.settings().await.unwrap();
    let sent = transport.last(Method::GET, "/api/settings").unwrap();
    assert_eq!(sent.credential, Some(Credential::new("new")));
}

#[tokio::test]
async fn change_password_requires_a_session() {
    let transport = ScriptedTransport::new();
    let console = console_with(transport.clone(), Arc::new(MemoryCredentialStore::new()));

    let err = console
        .session
        .change_password(Credential::new("a"), Credential::new("b"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Validation);
    assert!(transport.requests().is_empty());
}
