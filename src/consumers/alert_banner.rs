// src/consumers/alert_banner.rs

//! The global urgent-alert banner.

use crate::core::connection::Subscriber;
use crate::core::events::HubEvent;
use crate::core::registry::SubscriptionGuard;
use anyhow::{anyhow, bail};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, warn};

/// An urgent alert, ready to be shown.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub message: String,
    pub received_at: DateTime<Utc>,
}

/// Forwards every `ReceiveUrgentAlert` to `sink`. The handler never blocks:
/// when the sink is full the alert is dropped with a warning.
#[derive(Debug)]
pub struct AlertBanner {
    guard: SubscriptionGuard,
}

impl AlertBanner {
    pub fn attach(subscriber: &Subscriber, sink: mpsc::Sender<Alert>) -> Self {
        let guard = subscriber.subscribe_guarded(HubEvent::UrgentAlert.name(), move |payload| {
            let message = alert_text(payload)?;
            info!("Urgent alert received: {message}");
            let alert = Alert {
                message,
                received_at: Utc::now(),
            };
            match sink.try_send(alert) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(alert)) => {
                    warn!("Alert queue is full; dropping '{}'.", alert.message);
                    Ok(())
                }
                Err(TrySendError::Closed(_)) => Err(anyhow!("alert receiver has gone away")),
            }
        });
        Self { guard }
    }

    /// Stops listening now.
    pub fn detach(self) {
        self.guard.cancel();
    }
}

/// The hub sends the alert as a bare string; anything else is shown as JSON.
fn alert_text(payload: &Value) -> anyhow::Result<String> {
    match payload {
        Value::String(text) if !text.trim().is_empty() => Ok(text.clone()),
        Value::String(_) | Value::Null => bail!("urgent alert without a message"),
        other => Ok(other.to_string()),
    }
}
