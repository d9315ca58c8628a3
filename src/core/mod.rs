// src/core/mod.rs

//! The core of the real-time channel: wire protocol, transports, the
//! subscription registry, and the connection manager that ties them together.

pub mod connection;
pub mod errors;
pub mod events;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

pub use connection::{ConnectionHandle, ConnectionManager, ConnectionState, Subscriber};
pub use errors::SightwireError;
pub use session::{CredentialStore, SessionCredential, SessionGuard};
