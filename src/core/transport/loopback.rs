// src/core/transport/loopback.rs

//! An in-process transport whose "hub" is driven by a `LoopbackController`.
//!
//! Used by the test-suite and the benchmarks to exercise the connection worker
//! without a network: the controller can push messages, drop the live session,
//! refuse connection attempts, and count what the worker did.

use super::{Transport, TransportSession};
use crate::core::SightwireError;
use crate::core::protocol::HubMessage;
use crate::core::session::SessionCredential;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

/// What the controller feeds into the live session.
enum PeerSignal {
    Message(HubMessage),
    /// Ends the session; `Some` surfaces as a transport error, `None` as a clean close.
    End(Option<SightwireError>),
}

struct LivePeer {
    session_id: u64,
    inbound: mpsc::UnboundedSender<PeerSignal>,
}

#[derive(Default)]
struct LoopbackInner {
    attempts: AtomicUsize,
    opened: AtomicUsize,
    live_count: AtomicUsize,
    peak_live: AtomicUsize,
    next_session_id: AtomicU64,
    /// When set, the hub stops answering pings.
    silent: AtomicBool,
    refuse_next: Mutex<VecDeque<SightwireError>>,
    refuse_all: Mutex<Option<SightwireError>>,
    connect_delay: Mutex<Option<Duration>>,
    live: Mutex<Option<LivePeer>>,
    credentials: Mutex<Vec<SessionCredential>>,
    sent: Mutex<Vec<HubMessage>>,
    changed: Notify,
}

/// Creates a connected transport/controller pair.
pub fn loopback() -> (LoopbackTransport, LoopbackController) {
    let inner = Arc::new(LoopbackInner::default());
    (
        LoopbackTransport {
            inner: inner.clone(),
        },
        LoopbackController { inner },
    )
}

/// The `Transport` half, handed to the `ConnectionManager`.
#[derive(Clone)]
pub struct LoopbackTransport {
    inner: Arc<LoopbackInner>,
}

/// The hub half, kept by the test.
#[derive(Clone)]
pub struct LoopbackController {
    inner: Arc<LoopbackInner>,
}

impl LoopbackController {
    /// Connection attempts made so far, failed ones included.
    pub fn connect_attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Sessions successfully opened so far.
    pub fn sessions_opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    /// Sessions currently open.
    pub fn live_sessions(&self) -> usize {
        self.inner.live_count.load(Ordering::SeqCst)
    }

    /// The largest number of sessions that were ever open at the same time.
    pub fn peak_live_sessions(&self) -> usize {
        self.inner.peak_live.load(Ordering::SeqCst)
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.lock().is_some()
    }

    /// Credentials presented by each attempt, in order.
    pub fn credentials_seen(&self) -> Vec<SessionCredential> {
        self.inner.credentials.lock().clone()
    }

    /// Messages the client wrote, in order.
    pub fn sent(&self) -> Vec<HubMessage> {
        self.inner.sent.lock().clone()
    }

    /// Refuses the next connection attempt with `error`. Queued refusals are
    /// consumed one per attempt.
    pub fn refuse_next(&self, error: SightwireError) {
        self.inner.refuse_next.lock().push_back(error);
    }

    /// Refuses every attempt with `error` until `accept_all` is called.
    pub fn refuse_all(&self, error: SightwireError) {
        *self.inner.refuse_all.lock() = Some(error);
    }

    pub fn accept_all(&self) {
        *self.inner.refuse_all.lock() = None;
    }

    /// Makes every connection attempt take `delay` before it resolves.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.inner.connect_delay.lock() = delay;
    }

    /// Stops answering the client's pings, so the connection goes quiet.
    pub fn go_silent(&self) {
        self.inner.silent.store(true, Ordering::SeqCst);
    }

    pub fn answer_pings(&self) {
        self.inner.silent.store(false, Ordering::SeqCst);
    }

    /// Delivers `message` to the live session. Returns `false` when there is none.
    pub fn push(&self, message: HubMessage) -> bool {
        self.signal(PeerSignal::Message(message))
    }

    /// Pushes an invocation of `target` carrying a single argument.
    pub fn push_event(&self, target: &str, payload: Value) -> bool {
        self.push(HubMessage::invocation(target, vec![payload]))
    }

    /// Breaks the live session as if the network had failed.
    pub fn drop_connection(&self) -> bool {
        let ended = self.signal(PeerSignal::End(Some(SightwireError::Transport(
            "connection reset by peer".into(),
        ))));
        self.inner.live.lock().take();
        ended
    }

    /// Ends the live session cleanly from the hub side.
    pub fn close_connection(&self) -> bool {
        let ended = self.signal(PeerSignal::End(None));
        self.inner.live.lock().take();
        ended
    }

    /// Waits until at least `count` sessions have been opened.
    pub async fn wait_for_sessions(&self, count: usize) {
        self.wait_until(|c| c.sessions_opened() >= count).await;
    }

    /// Waits until at least `count` connection attempts have been made.
    pub async fn wait_for_attempts(&self, count: usize) {
        self.wait_until(|c| c.connect_attempts() >= count).await;
    }

    /// Waits until no session is open.
    pub async fn wait_until_idle(&self) {
        self.wait_until(|c| c.live_sessions() == 0).await;
    }

    async fn wait_until(&self, ready: impl Fn(&Self) -> bool) {
        loop {
            let changed = self.inner.changed.notified();
            if ready(self) {
                return;
            }
            changed.await;
        }
    }

    fn signal(&self, signal: PeerSignal) -> bool {
        match self.inner.live.lock().as_ref() {
            Some(peer) => peer.inbound.send(signal).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(
        &self,
        credential: &SessionCredential,
    ) -> Result<Box<dyn TransportSession>, SightwireError> {
        let delay = *self.inner.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        self.inner.credentials.lock().push(credential.clone());

        let refusal = self
            .inner
            .refuse_next
            .lock()
            .pop_front()
            .or_else(|| self.inner.refuse_all.lock().clone());
        if let Some(error) = refusal {
            self.inner.changed.notify_waiters();
            return Err(error);
        }

        let session_id = self.inner.next_session_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.live.lock() = Some(LivePeer {
            session_id,
            inbound: tx.clone(),
        });
        let live = self.inner.live_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak_live.fetch_max(live, Ordering::SeqCst);
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        self.inner.changed.notify_waiters();

        Ok(Box::new(LoopbackSession {
            session_id,
            inbound: rx,
            echo: tx,
            inner: self.inner.clone(),
        }))
    }
}

struct LoopbackSession {
    session_id: u64,
    inbound: mpsc::UnboundedReceiver<PeerSignal>,
    echo: mpsc::UnboundedSender<PeerSignal>,
    inner: Arc<LoopbackInner>,
}

#[async_trait]
impl TransportSession for LoopbackSession {
    async fn recv(&mut self) -> Option<Result<HubMessage, SightwireError>> {
        match self.inbound.recv().await {
            Some(PeerSignal::Message(message)) => Some(Ok(message)),
            Some(PeerSignal::End(Some(error))) => Some(Err(error)),
            Some(PeerSignal::End(None)) | None => None,
        }
    }

    async fn send(&mut self, message: HubMessage) -> Result<(), SightwireError> {
        // The hub pings back, like a real one does on its own schedule.
        if message == HubMessage::Ping && !self.inner.silent.load(Ordering::SeqCst) {
            let _ = self.echo.send(PeerSignal::Message(HubMessage::Ping));
        }
        self.inner.sent.lock().push(message);
        Ok(())
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

impl Drop for LoopbackSession {
    fn drop(&mut self) {
        {
            let mut live = self.inner.live.lock();
            if live.as_ref().is_some_and(|p| p.session_id == self.session_id) {
                live.take();
            }
        }
        self.inner.live_count.fetch_sub(1, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
    }
}
