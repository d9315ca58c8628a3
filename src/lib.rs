// src/lib.rs

pub mod config;
pub mod consumers;
pub mod core;

// Re-export
pub use crate::core::{
    ConnectionManager, ConnectionState, CredentialStore, SessionCredential, SightwireError,
};
