// src/core/connection/worker.rs

//! Implements the task that owns one physical hub connection.
//!
//! The worker connects, dispatches inbound invocations to the registry, keeps
//! the session alive with pings, and reconnects with exponential backoff when
//! the connection is lost. It stops on shutdown, on a non-retriable error, on a
//! server close that forbids reconnecting, or when its attempt budget runs out.

use super::ConnectionSettings;
use super::backoff::Backoff;
use super::state::{ConnectionState, HandleShared};
use crate::core::SightwireError;
use crate::core::protocol::{HubMessage, invocation_payload};
use crate::core::registry::SubscriptionRegistry;
use crate::core::transport::{Transport, TransportSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How a connected cycle ended.
enum CycleEnd {
    /// The handle was stopped.
    Shutdown,
    /// The connection dropped; try again.
    Lost(SightwireError),
    /// The hub does not want us back.
    Refused(SightwireError),
}

pub(crate) struct ConnectionWorker {
    shared: Arc<HandleShared>,
    transport: Arc<dyn Transport>,
    registry: Arc<SubscriptionRegistry>,
    backoff: Backoff,
    keepalive_interval: Duration,
    server_timeout: Duration,
}

impl ConnectionWorker {
    pub fn new(
        shared: Arc<HandleShared>,
        transport: Arc<dyn Transport>,
        registry: Arc<SubscriptionRegistry>,
        settings: &ConnectionSettings,
    ) -> Self {
        Self {
            shared,
            transport,
            registry,
            backoff: Backoff::new(settings.reconnect.clone()),
            keepalive_interval: settings.keepalive_interval,
            server_timeout: settings.server_timeout,
        }
    }

    /// The main run loop. Connection attempts and backoff waits can both be
    /// interrupted by `shutdown_rx`.
    pub async fn run(
        mut self,
        mut shutdown_rx: broadcast::Receiver<()>,
        mut outbound_rx: mpsc::Receiver<HubMessage>,
    ) {
        let id = self.shared.id;
        info!("Connection worker #{id} started.");
        // Set after the first loss: backoff after a loss is reported as
        // `Connecting`, backoff before the first success as `Disconnected`.
        let mut has_been_connected = false;

        loop {
            if self.shared.is_cancelled() {
                break;
            }
            self.shared.set_state(ConnectionState::Connecting);

            let attempt = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Connection worker #{id} shutting down during connect.");
                    break;
                }
                result = self.transport.connect(&self.shared.credential) => result,
            };

            match attempt {
                Ok(mut session) => {
                    if !self.shared.set_state(ConnectionState::Connected) {
                        // Stopped while the attempt was in flight.
                        session.close().await;
                        break;
                    }
                    self.backoff.reset();
                    self.shared.stats.record_connected(has_been_connected);
                    if has_been_connected {
                        info!("Connection #{id} re-established.");
                    } else {
                        info!("Connection #{id} established.");
                    }
                    has_been_connected = true;

                    match self
                        .drive(&mut *session, &mut shutdown_rx, &mut outbound_rx)
                        .await
                    {
                        CycleEnd::Shutdown => break,
                        CycleEnd::Lost(e) => {
                            warn!("Connection #{id} lost: {e}. Reconnecting...");
                            self.shared.record_error(e);
                            self.shared.set_state(ConnectionState::Connecting);
                        }
                        CycleEnd::Refused(e) => {
                            warn!("Connection #{id} closed by the hub without reconnect: {e}");
                            self.shared.record_error(e);
                            break;
                        }
                    }
                }
                Err(e) => {
                    self.shared.stats.record_connect_failure();
                    if !e.is_retriable() {
                        error!("Connection #{id} failed and will not be retried: {e}");
                        self.shared.record_error(e);
                        break;
                    }
                    let failures = self.backoff.record_failure();
                    warn!("Connection attempt {failures} for #{id} failed: {e}");
                    self.shared.record_error(e);
                    if !has_been_connected {
                        self.shared.set_state(ConnectionState::Disconnected);
                    }
                    if self.backoff.is_exhausted() {
                        error!("Connection #{id} giving up after {failures} failed attempts.");
                        break;
                    }
                }
            }

            let wait_time = self.backoff.next_delay();
            info!("Connection #{id} will retry in {wait_time:?}");
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Connection worker #{id} shutting down during backoff.");
                    break;
                }
                _ = tokio::time::sleep(wait_time) => {}
            }
        }

        self.shared.mark_finished();
        self.shared.set_state(ConnectionState::Disconnected);
        info!("Connection worker #{id} stopped.");
    }

    /// Pumps one connected session until it ends.
    async fn drive(
        &self,
        session: &mut dyn TransportSession,
        shutdown_rx: &mut broadcast::Receiver<()>,
        outbound_rx: &mut mpsc::Receiver<HubMessage>,
    ) -> CycleEnd {
        let mut keepalive = tokio::time::interval_at(
            Instant::now() + self.keepalive_interval,
            self.keepalive_interval,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let idle = tokio::time::sleep(self.server_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    session.close().await;
                    return CycleEnd::Shutdown;
                }
                inbound = session.recv() => {
                    idle.as_mut().reset(Instant::now() + self.server_timeout);
                    match inbound {
                        Some(Ok(message)) => {
                            if let Some(end) = self.handle_message(message) {
                                session.close().await;
                                return end;
                            }
                        }
                        Some(Err(SightwireError::MalformedMessage(reason))) => {
                            warn!("Connection #{} skipped a malformed record: {reason}", self.shared.id);
                        }
                        Some(Err(e)) => return CycleEnd::Lost(e),
                        None => {
                            return CycleEnd::Lost(SightwireError::Transport(
                                "connection closed by the hub".into(),
                            ));
                        }
                    }
                }
                Some(message) = outbound_rx.recv() => {
                    if let Err(e) = session.send(message).await {
                        return CycleEnd::Lost(e);
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = session.send(HubMessage::Ping).await {
                        return CycleEnd::Lost(e);
                    }
                }
                _ = &mut idle => {
                    return CycleEnd::Lost(SightwireError::Timeout(format!(
                        "no message from the hub for {:?}",
                        self.server_timeout
                    )));
                }
            }
        }
    }

    fn handle_message(&self, message: HubMessage) -> Option<CycleEnd> {
        match message {
            HubMessage::Invocation {
                target, arguments, ..
            } => {
                // A stopped handle must never reach consumers.
                if self.shared.is_cancelled() {
                    debug!("Dropping '{target}' received after the handle was stopped.");
                    return Some(CycleEnd::Shutdown);
                }
                let payload = invocation_payload(arguments);
                let outcome = self
                    .registry
                    .dispatch_while(&target, &payload, || !self.shared.is_cancelled());
                self.shared.stats.record_dispatch(outcome);
                None
            }
            HubMessage::Ping => None,
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                let reason = error.unwrap_or_else(|| "no reason given".to_string());
                let e = SightwireError::ClosedByServer(reason);
                Some(if allow_reconnect {
                    CycleEnd::Lost(e)
                } else {
                    CycleEnd::Refused(e)
                })
            }
            other => {
                debug!("Ignoring hub message: {other:?}");
                None
            }
        }
    }
}
