// src/core/registry/guard.rs

//! Defines `SubscriptionGuard`, an RAII guard for a single registration.

use super::{SubscriptionRegistry, SubscriptionToken};
use std::sync::Weak;
use tracing::debug;

/// Unsubscribes its handler when dropped, so a consumer that goes away can
/// never leave a stale handler behind.
///
/// The guard holds the registry weakly; it does not keep a torn-down session
/// alive.
#[derive(Debug)]
pub struct SubscriptionGuard {
    registry: Weak<SubscriptionRegistry>,
    token: Option<SubscriptionToken>,
}

impl SubscriptionGuard {
    pub(crate) fn new(registry: Weak<SubscriptionRegistry>, token: SubscriptionToken) -> Self {
        Self {
            registry,
            token: Some(token),
        }
    }

    /// The token of the guarded registration.
    pub fn token(&self) -> Option<&SubscriptionToken> {
        self.token.as_ref()
    }

    /// Unsubscribes now instead of at drop time.
    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        match self.registry.upgrade() {
            Some(registry) => {
                registry.unsubscribe(&token);
            }
            None => debug!(
                "Registry for '{}' is gone; nothing to unsubscribe.",
                token.event()
            ),
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.release();
    }
}
