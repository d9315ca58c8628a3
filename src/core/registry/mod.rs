// src/core/registry/mod.rs

//! The subscription registry: routes named inbound events to the handlers
//! registered for them.
//!
//! The registry is plain data owned by the session, not by any physical
//! connection. Connections come and go during reconnection while the
//! registered entries stay put, so consumers never have to re-subscribe.
//!
//! Every handler call runs under a shared read of the dispatch gate.
//! [`fence`](SubscriptionRegistry::fence) takes the gate for write, so once it
//! returns no handler is mid-call, and a dispatch that re-checks its liveness
//! under the gate sees any cancellation made before the fence.

use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, warn};

pub mod guard;

pub use guard::SubscriptionGuard;

/// A consumer callback. It runs on the dispatch task, so it must return
/// quickly and hand any slow work off (channel, `Notify`, spawned task).
pub type EventHandler = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// Ids are process-wide and never reused, so a token kept past a teardown can
/// never match an entry registered by a later session.
static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// How many dispatches are running handlers on this thread.
    static DISPATCH_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as running handlers until dropped, panics included.
struct DispatchScope;

impl DispatchScope {
    fn enter() -> Self {
        DISPATCH_DEPTH.with(|depth| depth.set(depth.get() + 1));
        DispatchScope
    }

    fn active() -> bool {
        DISPATCH_DEPTH.with(|depth| depth.get() > 0)
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        DISPATCH_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Identifies exactly one registered handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionToken {
    event: String,
    id: u64,
}

impl SubscriptionToken {
    /// The event name the handler was registered for.
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// The result of fanning one event out to its handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Handlers that returned `Ok`.
    pub delivered: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

/// Maps an event name to its handlers, kept in registration order.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: DashMap<String, IndexMap<u64, EventHandler>>,
    gate: RwLock<()>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("events", &self.entries.len())
            .field("handlers", &self.len())
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers `handler` for `event`. Valid whether or not a connection is
    /// live; delivery starts once one is.
    pub fn subscribe<F>(&self, event: impl Into<String>, handler: F) -> SubscriptionToken
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let event = event.into();
        let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
        self.entries
            .entry(event.clone())
            .or_default()
            .insert(id, Arc::new(handler));
        debug!("Registered handler #{} for '{}'.", id, event);
        SubscriptionToken { event, id }
    }

    /// Like [`subscribe`](Self::subscribe), but the registration is removed
    /// when the returned guard is dropped.
    pub fn subscribe_guarded<F>(
        self: &Arc<Self>,
        event: impl Into<String>,
        handler: F,
    ) -> SubscriptionGuard
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let token = self.subscribe(event, handler);
        SubscriptionGuard::new(Arc::downgrade(self), token)
    }

    /// Removes exactly the handler identified by `token`. Other handlers for
    /// the same event are untouched. Calling it again is a no-op.
    ///
    /// Returns `true` if a handler was removed.
    pub fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        let removed = match self.entries.get_mut(token.event()) {
            Some(mut handlers) => handlers.shift_remove(&token.id).is_some(),
            None => false,
        };
        if removed {
            // Drop the name once its last handler is gone.
            self.entries
                .remove_if(token.event(), |_, handlers| handlers.is_empty());
            debug!("Removed handler #{} for '{}'.", token.id, token.event);
        }
        removed
    }

    /// Delivers `payload` to every handler registered for `event`.
    ///
    /// The handler list is snapshotted first and the handlers run outside of
    /// the map lock, so a handler may itself subscribe or unsubscribe. An error
    /// or panic in one handler is logged and does not stop the others.
    pub fn dispatch(&self, event: &str, payload: &Value) -> DispatchOutcome {
        self.dispatch_while(event, payload, || true)
    }

    /// Like [`dispatch`](Self::dispatch), but `live` is checked under the
    /// dispatch gate before each handler and the fan-out stops as soon as it
    /// returns `false`.
    pub fn dispatch_while(
        &self,
        event: &str,
        payload: &Value,
        live: impl Fn() -> bool,
    ) -> DispatchOutcome {
        let handlers: Vec<(u64, EventHandler)> = match self.entries.get(event) {
            Some(handlers) => handlers
                .iter()
                .map(|(id, handler)| (*id, Arc::clone(handler)))
                .collect(),
            None => {
                debug!("No handlers registered for '{}'.", event);
                return DispatchOutcome::default();
            }
        };

        let _scope = DispatchScope::enter();
        let mut outcome = DispatchOutcome::default();
        for (id, handler) in handlers {
            let _gate = self.gate.read_recursive();
            if !live() {
                debug!("Dispatch of '{}' stopped before handler #{}.", event, id);
                break;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => outcome.delivered += 1,
                Ok(Err(e)) => {
                    warn!("Handler #{} for '{}' failed: {:#}", id, event, e);
                    outcome.failed += 1;
                }
                Err(panic_payload) => {
                    error!(
                        "Handler #{} for '{}' panicked: {}",
                        id,
                        event,
                        panic_message(&*panic_payload)
                    );
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    /// Waits until no handler call is in progress on another thread.
    ///
    /// Called from inside a handler it returns at once; the calling handler is
    /// the only one in progress on its thread and the rest of its dispatch
    /// re-checks liveness before every call.
    pub fn fence(&self) {
        if DispatchScope::active() {
            return;
        }
        drop(self.gate.write());
    }

    /// Removes every registration. Returns how many handlers were dropped.
    pub fn clear(&self) -> usize {
        let removed = self.len();
        self.entries.clear();
        removed
    }

    /// The number of handlers registered for `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        self.entries.get(event).map_or(0, |handlers| handlers.len())
    }

    /// The total number of registered handlers.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Event names that currently have at least one handler.
    pub fn event_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
