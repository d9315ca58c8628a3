// src/core/connection/mod.rs

//! The shared real-time channel: at most one physical hub connection per
//! authenticated session, shared by every consumer.
//!
//! `ConnectionManager` owns the subscription registry and the current
//! `ConnectionHandle`. `ensure_connection` is idempotent for an unchanged
//! credential, so any number of consumers can ask for the channel and still
//! share a single connection. `teardown` stops the connection and clears every
//! subscription; nothing registered before a logout is ever invoked after it.

use crate::config::Config;
use crate::core::SightwireError;
use crate::core::protocol::HubMessage;
use crate::core::registry::{SubscriptionGuard, SubscriptionRegistry, SubscriptionToken};
use crate::core::session::SessionCredential;
use crate::core::transport::Transport;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info};

pub mod backoff;
pub mod state;
pub mod subscriber;
mod worker;

pub use backoff::{Backoff, ReconnectPolicy};
pub use state::{ConnectionState, ConnectionStats, ConnectionStatsSnapshot};
pub use subscriber::Subscriber;

use state::HandleShared;
use worker::ConnectionWorker;

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

/// Tunables for every connection the manager opens.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// How often a ping is sent on an otherwise quiet connection.
    pub keepalive_interval: Duration,
    /// A connection that receives nothing for this long is considered lost.
    pub server_timeout: Duration,
    /// Capacity of the outbound message queue.
    pub outbound_buffer: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl From<&Config> for ConnectionSettings {
    fn from(config: &Config) -> Self {
        Self {
            keepalive_interval: config.hub.keepalive_interval,
            server_timeout: config.hub.server_timeout,
            outbound_buffer: config.hub.outbound_buffer,
            reconnect: ReconnectPolicy::from(&config.reconnect),
        }
    }
}

/// A reference to the live logical connection. Clones share it.
///
/// The handle cannot stop the connection; only the manager can.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    shared: Arc<HandleShared>,
    shutdown_tx: broadcast::Sender<()>,
    outbound_tx: mpsc::Sender<HubMessage>,
    /// Flips to `true` when the worker task has exited.
    exited: watch::Receiver<bool>,
}

impl ConnectionHandle {
    /// Process-unique id of this logical connection.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The state of this connection. A replaced or torn-down handle reports
    /// `Disconnected`.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// `true` until the handle is stopped or its worker gives up.
    pub fn is_live(&self) -> bool {
        !self.shared.is_cancelled() && !self.shared.is_finished()
    }

    /// The most recent error the worker observed, if any.
    pub fn last_error(&self) -> Option<SightwireError> {
        self.shared.last_error()
    }

    pub fn credential(&self) -> &SessionCredential {
        &self.shared.credential
    }

    /// Queues a fire-and-forget invocation. Fails with `NotConnected` unless
    /// the connection is currently up.
    pub fn send(&self, target: &str, arguments: Vec<Value>) -> Result<(), SightwireError> {
        if self.state() != ConnectionState::Connected {
            return Err(SightwireError::NotConnected);
        }
        self.outbound_tx
            .try_send(HubMessage::invocation(target, arguments))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    SightwireError::Internal("outbound queue is full".into())
                }
                mpsc::error::TrySendError::Closed(_) => SightwireError::NotConnected,
            })
    }

    /// Waits for the worker task to exit. Every clone of the handle waits
    /// for the same exit.
    pub async fn stopped(&self) {
        let mut exited = self.exited.clone();
        // A dropped sender means the task is gone as well.
        let _ = exited.wait_for(|exited| *exited).await;
    }

    fn stop(&self) {
        self.shared.cancel();
        let _ = self.shutdown_tx.send(());
    }

}

/// Owns the shared channel for one authenticated session.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    registry: Arc<SubscriptionRegistry>,
    settings: ConnectionSettings,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    stats: Arc<ConnectionStats>,
    current: Mutex<Option<ConnectionHandle>>,
    next_handle_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, settings: ConnectionSettings) -> Self {
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            registry: Arc::new(SubscriptionRegistry::new()),
            settings,
            state_tx: Arc::new(state_tx),
            stats: Arc::new(ConnectionStats::default()),
            current: Mutex::new(None),
            next_handle_id: AtomicU64::new(1),
        }
    }

    /// Returns the live connection for `credential`, creating it if needed.
    ///
    /// - Same credential, live handle: the same handle is returned unchanged,
    ///   even while it is waiting out a backoff. Retries are paced by the
    ///   reconnect policy alone, however often this is called.
    /// - No handle, a handle whose worker gave up, or a different credential:
    ///   the old handle is stopped and a new one started. Subscriptions are
    ///   kept and apply to the new connection.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn ensure_connection(&self, credential: &SessionCredential) -> ConnectionHandle {
        let mut current = self.current.lock();
        if let Some(handle) = current.as_ref() {
            if handle.credential() == credential && handle.is_live() {
                debug!("Reusing connection #{} ({}).", handle.id(), handle.state());
                return handle.clone();
            }
            let reason = if handle.credential() != credential {
                "credential changed"
            } else {
                "worker stopped"
            };
            info!("Replacing connection #{} ({reason}).", handle.id());
            handle.stop();
        }

        let handle = self.spawn_handle(credential.clone());
        *current = Some(handle.clone());
        handle
    }

    fn spawn_handle(&self, credential: SessionCredential) -> ConnectionHandle {
        let id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(HandleShared::new(
            id,
            credential,
            self.state_tx.clone(),
            self.stats.clone(),
        ));
        shared.set_state(ConnectionState::Connecting);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.settings.outbound_buffer.max(1));
        let worker = ConnectionWorker::new(
            shared.clone(),
            self.transport.clone(),
            self.registry.clone(),
            &self.settings,
        );
        let (exited_tx, exited) = watch::channel(false);
        tokio::spawn(async move {
            worker.run(shutdown_rx, outbound_rx).await;
            exited_tx.send_replace(true);
        });
        info!("Starting connection #{id}.");

        ConnectionHandle {
            shared,
            shutdown_tx,
            outbound_tx,
            exited,
        }
    }

    /// Stops the connection and removes every subscription. Idempotent.
    ///
    /// Blocks until a handler call already in progress on another thread has
    /// returned; no handler runs for the stopped connection afterwards.
    pub fn teardown(&self) {
        let previous = self.current.lock().take();
        if let Some(handle) = &previous {
            info!("Tearing down connection #{}.", handle.id());
            handle.stop();
        }
        // Wait out a handler already running for the stopped handle.
        self.registry.fence();
        let removed = self.registry.clear();
        self.state_tx.send_replace(ConnectionState::Disconnected);
        if previous.is_some() || removed > 0 {
            info!("Real-time channel torn down; {removed} subscription(s) cleared.");
        }
    }

    /// Stops the connection like [`teardown`](Self::teardown) and waits for
    /// its worker to exit.
    pub async fn shutdown(&self) {
        let previous = self.current.lock().clone();
        self.teardown();
        if let Some(handle) = previous {
            handle.stopped().await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// The current handle, if any.
    pub fn current(&self) -> Option<ConnectionHandle> {
        self.current.lock().clone()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// A consumer-facing view of the channel: subscribe and observe state,
    /// without the power to connect or tear down.
    pub fn subscriber(&self) -> Subscriber {
        Subscriber::new(self.registry.clone(), self.state_tx.subscribe())
    }

    /// Registers `handler` for `event`. Allowed at any time, connected or not.
    pub fn subscribe<F>(&self, event: impl Into<String>, handler: F) -> SubscriptionToken
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.subscribe(event, handler)
    }

    pub fn subscribe_guarded<F>(&self, event: impl Into<String>, handler: F) -> SubscriptionGuard
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.subscribe_guarded(event, handler)
    }

    pub fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        self.registry.unsubscribe(token)
    }

    /// Sends a fire-and-forget invocation on the current connection.
    pub fn send(&self, target: &str, arguments: Vec<Value>) -> Result<(), SightwireError> {
        match self.current() {
            Some(handle) => handle.send(target, arguments),
            None => Err(SightwireError::NotConnected),
        }
    }

    pub fn stats(&self) -> ConnectionStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.current.get_mut().take() {
            handle.stop();
        }
    }
}
