// src/core/session.rs

//! The authenticated session that owns the real-time channel.
//!
//! `CredentialStore` holds the current bearer credential and publishes every
//! login and logout; `SessionGuard` watches it and keeps the
//! `ConnectionManager` in step: a credential means "be connected with it", no
//! credential means "tear everything down".

use crate::core::SightwireError;
use crate::core::connection::{ConnectionManager, Subscriber};
use anyhow::{Context, Result};
use std::any::Any;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// An opaque bearer credential. Its `Debug` output never shows the token.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionCredential(Arc<str>);

impl SessionCredential {
    /// Wraps a token. Surrounding whitespace and a leading `Bearer ` are
    /// stripped; an empty token is rejected.
    pub fn new(token: impl AsRef<str>) -> Result<Self, SightwireError> {
        let token = token.as_ref().trim();
        let token = match token.strip_prefix("Bearer") {
            Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => rest.trim(),
            _ => token,
        };
        if token.is_empty() {
            return Err(SightwireError::InvalidCredential(
                "credential is empty".into(),
            ));
        }
        if token.chars().any(char::is_whitespace) {
            return Err(SightwireError::InvalidCredential(
                "credential contains whitespace".into(),
            ));
        }
        Ok(Self(Arc::from(token)))
    }

    /// The raw token, for the transport only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionCredential(<redacted>)")
    }
}

/// Reads the initial credential: the environment variable wins, then the first
/// non-empty line of the file. `Ok(None)` when neither provides one.
pub fn load_credential(env_var: &str, file: Option<&Path>) -> Result<Option<SessionCredential>> {
    if let Ok(value) = std::env::var(env_var) {
        if !value.trim().is_empty() {
            let credential = SessionCredential::new(&value)
                .with_context(|| format!("Invalid credential in ${env_var}"))?;
            return Ok(Some(credential));
        }
    }

    let Some(path) = file else {
        return Ok(None);
    };
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read credential file '{}'", path.display()))?;
    match contents.lines().map(str::trim).find(|l| !l.is_empty()) {
        Some(line) => {
            let credential = SessionCredential::new(line)
                .with_context(|| format!("Invalid credential in '{}'", path.display()))?;
            Ok(Some(credential))
        }
        None => Ok(None),
    }
}

/// Holds the current credential and notifies watchers when it changes.
#[derive(Debug)]
pub struct CredentialStore {
    tx: watch::Sender<Option<SessionCredential>>,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CredentialStore {
    pub fn new(initial: Option<SessionCredential>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Validates and stores a new credential.
    pub fn login(&self, token: impl AsRef<str>) -> Result<(), SightwireError> {
        let credential = SessionCredential::new(token)?;
        self.set(Some(credential));
        Ok(())
    }

    pub fn logout(&self) {
        self.set(None);
    }

    /// Replaces the credential. Watchers are only woken by an actual change.
    pub fn set(&self, credential: Option<SessionCredential>) {
        self.tx.send_if_modified(|current| {
            if *current == credential {
                return false;
            }
            *current = credential;
            true
        });
    }

    pub fn current(&self) -> Option<SessionCredential> {
        self.tx.borrow().clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn watch(&self) -> watch::Receiver<Option<SessionCredential>> {
        self.tx.subscribe()
    }
}

type LoginHook = Box<dyn FnMut(&Subscriber) -> Box<dyn Any + Send> + Send>;

/// Keeps the channel in step with the session: connects on login, reconnects
/// with the new credential when it changes, tears down on logout.
///
/// An optional login hook attaches consumers when a session starts. What it
/// returns is kept until the session ends and dropped just before teardown,
/// so consumers never outlive the session they subscribed in.
pub struct SessionGuard {
    credentials: watch::Receiver<Option<SessionCredential>>,
    manager: Arc<ConnectionManager>,
    on_login: Option<LoginHook>,
    attached: Option<Box<dyn Any + Send>>,
}

impl SessionGuard {
    pub fn new(store: &CredentialStore, manager: Arc<ConnectionManager>) -> Self {
        Self {
            credentials: store.watch(),
            manager,
            on_login: None,
            attached: None,
        }
    }

    /// Runs `hook` each time a session starts.
    pub fn on_login<F, T>(mut self, mut hook: F) -> Self
    where
        F: FnMut(&Subscriber) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.on_login = Some(Box::new(move |subscriber| Box::new(hook(subscriber))));
        self
    }

    /// Runs until `shutdown_rx` fires or the store goes away. The channel is
    /// torn down on the way out.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Session guard started.");
        let initial = self.credentials.borrow_and_update().clone();
        self.apply(initial);

        loop {
            tokio::select! {
                changed = self.credentials.changed() => {
                    if changed.is_err() {
                        warn!("Credential store dropped; ending the session.");
                        break;
                    }
                    let credential = self.credentials.borrow_and_update().clone();
                    self.apply(credential);
                }
                _ = shutdown_rx.recv() => {
                    info!("Session guard received shutdown signal.");
                    break;
                }
            }
        }

        self.end_session();
        info!("Session guard stopped.");
    }

    fn apply(&mut self, credential: Option<SessionCredential>) {
        match credential {
            Some(credential) => {
                let handle = self.manager.ensure_connection(&credential);
                debug!("Session is using connection #{}.", handle.id());
                if self.attached.is_none() {
                    if let Some(hook) = self.on_login.as_mut() {
                        self.attached = Some(hook(&self.manager.subscriber()));
                    }
                }
            }
            None => {
                info!("No credential; tearing down the real-time channel.");
                self.end_session();
            }
        }
    }

    fn end_session(&mut self) {
        self.attached.take();
        self.manager.teardown();
    }
}
