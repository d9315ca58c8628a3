// src/core/connection/subscriber.rs

//! The view of the channel handed to consumers.

use super::state::ConnectionState;
use crate::core::registry::{SubscriptionGuard, SubscriptionRegistry, SubscriptionToken};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;

/// Lets a consumer register handlers and follow the connection state. Cheap
/// to clone; every clone talks to the same session.
#[derive(Clone, Debug)]
pub struct Subscriber {
    registry: Arc<SubscriptionRegistry>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl Subscriber {
    pub(crate) fn new(
        registry: Arc<SubscriptionRegistry>,
        state_rx: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self { registry, state_rx }
    }

    pub fn subscribe<F>(&self, event: impl Into<String>, handler: F) -> SubscriptionToken
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.subscribe(event, handler)
    }

    /// Registers `handler` for as long as the returned guard lives.
    pub fn subscribe_guarded<F>(&self, event: impl Into<String>, handler: F) -> SubscriptionGuard
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.subscribe_guarded(event, handler)
    }

    pub fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        self.registry.unsubscribe(token)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Waits until the channel reaches `state`. Returns `false` if the session
    /// went away first.
    pub async fn wait_for(&self, state: ConnectionState) -> bool {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|s| *s == state).await.is_ok()
    }
}
