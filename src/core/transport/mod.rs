// src/core/transport/mod.rs

//! The seam between the connection worker and the wire.
//!
//! A `Transport` knows how to open an authenticated hub session; a
//! `TransportSession` exchanges hub messages over it. The worker only ever
//! talks to these traits, which keeps reconnection and dispatch independent of
//! WebSockets and lets the test-suite drive the worker in-process.

use crate::core::SightwireError;
use crate::core::protocol::HubMessage;
use crate::core::session::SessionCredential;
use async_trait::async_trait;

pub mod loopback;
pub mod websocket;

pub use loopback::{LoopbackController, LoopbackTransport, loopback};
pub use websocket::WebSocketTransport;

/// Opens sessions to the hub.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a session authenticated with `credential`. The hub handshake is
    /// complete when this returns `Ok`.
    async fn connect(
        &self,
        credential: &SessionCredential,
    ) -> Result<Box<dyn TransportSession>, SightwireError>;
}

/// One open session with the hub.
#[async_trait]
pub trait TransportSession: Send {
    /// Waits for the next message. `None` means the peer closed the session.
    /// Must be cancel-safe: a message is never lost when the future is dropped.
    async fn recv(&mut self) -> Option<Result<HubMessage, SightwireError>>;

    /// Writes one message.
    async fn send(&mut self, message: HubMessage) -> Result<(), SightwireError>;

    /// Closes the session politely. Errors are ignored; the session is gone
    /// either way.
    async fn close(&mut self);
}
