// src/core/errors.rs

//! Defines the primary error type for the real-time channel.

use std::sync::Arc;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// The main error enum, representing every failure the channel can observe.
/// `std::io::Error` is wrapped in an `Arc` so the error stays cheaply cloneable;
/// the last error of a connection is stored and handed out to observers.
#[derive(Error, Debug, Clone)]
pub enum SightwireError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication rejected: {0}")]
    Authentication(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// One record could not be parsed. The record is consumed; the stream
    /// around it is intact.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Connection closed by server: {0}")]
    ClosedByServer(String),

    #[error("No live connection")]
    NotConnected,

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SightwireError {
    /// Returns `true` when retrying the same operation later can succeed.
    /// Authentication failures are surfaced once and never retried; refreshing
    /// a credential is the session owner's job.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            SightwireError::Authentication(_)
                | SightwireError::InvalidCredential(_)
                | SightwireError::InvalidEndpoint(_)
        )
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for SightwireError {
    fn from(e: std::io::Error) -> Self {
        SightwireError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for SightwireError {
    fn from(e: serde_json::Error) -> Self {
        SightwireError::Protocol(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<url::ParseError> for SightwireError {
    fn from(e: url::ParseError) -> Self {
        SightwireError::InvalidEndpoint(e.to_string())
    }
}

impl From<tungstenite::Error> for SightwireError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::Io(io) => SightwireError::Io(Arc::new(io)),
            tungstenite::Error::Http(response) => match response.status().as_u16() {
                401 | 403 => SightwireError::Authentication(format!(
                    "hub refused the upgrade with HTTP {}",
                    response.status()
                )),
                code => SightwireError::Transport(format!("hub upgrade failed with HTTP {code}")),
            },
            other => SightwireError::Transport(other.to_string()),
        }
    }
}
