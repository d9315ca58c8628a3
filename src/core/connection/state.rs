// src/core/connection/state.rs

//! Connection state and the bookkeeping shared between a handle and its worker.

use crate::core::SightwireError;
use crate::core::registry::DispatchOutcome;
use crate::core::session::SessionCredential;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use strum_macros::{AsRefStr, Display};
use tokio::sync::watch;

/// The observable state of the shared channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Counters for the whole session, across connection handles.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    connections_opened: AtomicU64,
    reconnects: AtomicU64,
    connect_failures: AtomicU64,
    events_dispatched: AtomicU64,
    handler_failures: AtomicU64,
}

/// A point-in-time copy of `ConnectionStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStatsSnapshot {
    pub connections_opened: u64,
    pub reconnects: u64,
    pub connect_failures: u64,
    pub events_dispatched: u64,
    pub handler_failures: u64,
}

impl ConnectionStats {
    pub(crate) fn record_connected(&self, is_reconnect: bool) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        if is_reconnect {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatch(&self, outcome: DispatchOutcome) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
        self.handler_failures
            .fetch_add(outcome.failed as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionStatsSnapshot {
        ConnectionStatsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

/// State shared by one `ConnectionHandle` and its worker task.
///
/// The state channel belongs to the manager and outlives individual handles.
/// Once a handle is cancelled its worker can no longer write to it: the
/// cancellation flag is flipped and checked under the channel's own lock, so a
/// late `Connected` from a stopped worker cannot overwrite a teardown.
#[derive(Debug)]
pub(crate) struct HandleShared {
    pub id: u64,
    pub credential: SessionCredential,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    cancelled: AtomicBool,
    finished: AtomicBool,
    last_error: Mutex<Option<SightwireError>>,
    pub stats: Arc<ConnectionStats>,
}

impl HandleShared {
    pub fn new(
        id: u64,
        credential: SessionCredential,
        state_tx: Arc<watch::Sender<ConnectionState>>,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        Self {
            id,
            credential,
            state_tx,
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            last_error: Mutex::new(None),
            stats,
        }
    }

    /// Publishes `state` unless the handle has been cancelled. Returns `false`
    /// when the write was refused.
    pub fn set_state(&self, state: ConnectionState) -> bool {
        let mut applied = false;
        self.state_tx.send_if_modified(|current| {
            if self.cancelled.load(Ordering::SeqCst) {
                return false;
            }
            applied = true;
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        applied
    }

    /// The state as seen through this handle. A cancelled handle is always
    /// `Disconnected`, whatever its successor is doing.
    pub fn state(&self) -> ConnectionState {
        if self.is_cancelled() {
            ConnectionState::Disconnected
        } else {
            *self.state_tx.borrow()
        }
    }

    pub fn cancel(&self) {
        self.state_tx.send_if_modified(|_| {
            self.cancelled.store(true, Ordering::SeqCst);
            false
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn record_error(&self, error: SightwireError) {
        *self.last_error.lock() = Some(error);
    }

    pub fn last_error(&self) -> Option<SightwireError> {
        self.last_error.lock().clone()
    }
}
