// src/consumers/dashboard_refresh.rs

//! Reloads dashboard data when a submitted report finishes processing.

use crate::core::connection::Subscriber;
use crate::core::events::{HubEvent, ReportStatusUpdate, decode_payload};
use crate::core::registry::SubscriptionGuard;
use anyhow::Context;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Signals a reload whenever a report reaches a terminal status. Several
/// updates arriving before the reload runs collapse into one wake-up.
#[derive(Debug)]
pub struct DashboardRefresh {
    reload: Arc<Notify>,
    requested: Arc<AtomicU64>,
    guard: SubscriptionGuard,
}

impl DashboardRefresh {
    pub fn attach(subscriber: &Subscriber) -> Self {
        Self::with_signal(subscriber, Arc::new(Notify::new()))
    }

    /// Like [`attach`](Self::attach), but wakes a `Notify` owned by the
    /// caller, so one reload task can outlive several sessions.
    pub fn with_signal(subscriber: &Subscriber, reload: Arc<Notify>) -> Self {
        let requested = Arc::new(AtomicU64::new(0));

        let (notify, counter) = (reload.clone(), requested.clone());
        let guard =
            subscriber.subscribe_guarded(HubEvent::ReportStatusChanged.name(), move |payload| {
                let update: ReportStatusUpdate =
                    decode_payload(payload).context("malformed report status payload")?;
                if !update.status.is_terminal() {
                    debug!("Report #{} is still {:?}.", update.report_id, update.status);
                    return Ok(());
                }
                info!(
                    "Report #{} finished as {:?}; reloading dashboard.",
                    update.report_id, update.status
                );
                counter.fetch_add(1, Ordering::Relaxed);
                notify.notify_one();
                Ok(())
            });

        Self {
            reload,
            requested,
            guard,
        }
    }

    /// Waits for the next reload request.
    pub async fn reload_requested(&self) {
        self.reload.notified().await;
    }

    pub fn reload_signal(&self) -> Arc<Notify> {
        self.reload.clone()
    }

    /// Reloads requested since the consumer was attached.
    pub fn reloads_requested(&self) -> u64 {
        self.requested.load(Ordering::Relaxed)
    }

    pub fn detach(self) {
        self.guard.cancel();
    }
}
