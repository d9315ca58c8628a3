// src/core/protocol/mod.rs

pub mod hub_message;
pub use hub_message::{
    HandshakeRequest, HandshakeResponse, HubMessage, HubProtocolCodec, RECORD_SEPARATOR,
    invocation_payload,
};
