// src/config.rs

//! Manages client configuration: loading, defaults, and validation.

use crate::core::connection::backoff::{
    DEFAULT_MAX_JITTER, DEFAULT_MAX_RECONNECT_DELAY, MIN_RECONNECT_DELAY,
};
use crate::core::connection::{
    DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_OUTBOUND_BUFFER, DEFAULT_SERVER_TIMEOUT,
};
use crate::core::transport::websocket::normalize_endpoint;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Where the hub lives and how to talk to it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HubConfig {
    /// `http(s)://` or `ws(s)://` URL of the hub endpoint.
    #[serde(default = "default_hub_url")]
    pub url: String,
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_keepalive_interval")]
    pub keepalive_interval: Duration,
    /// A connection silent for longer than this is treated as lost.
    #[serde(with = "humantime_serde", default = "default_server_timeout")]
    pub server_timeout: Duration,
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: default_hub_url(),
            connect_timeout: default_connect_timeout(),
            handshake_timeout: default_handshake_timeout(),
            keepalive_interval: default_keepalive_interval(),
            server_timeout: default_server_timeout(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

fn default_hub_url() -> String {
    "ws://localhost:7002/hubs/surveillance".to_string()
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_handshake_timeout() -> Duration {
    Duration::from_secs(15)
}
fn default_keepalive_interval() -> Duration {
    DEFAULT_KEEPALIVE_INTERVAL
}
fn default_server_timeout() -> Duration {
    DEFAULT_SERVER_TIMEOUT
}
fn default_outbound_buffer() -> usize {
    DEFAULT_OUTBOUND_BUFFER
}

/// Reconnect pacing.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReconnectConfig {
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
    #[serde(with = "humantime_serde", default = "default_max_jitter")]
    pub max_jitter: Duration,
    /// Consecutive failed attempts before giving up. `0` retries forever.
    #[serde(default)]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            max_jitter: default_max_jitter(),
            max_attempts: 0,
        }
    }
}

fn default_initial_delay() -> Duration {
    MIN_RECONNECT_DELAY
}
fn default_max_delay() -> Duration {
    DEFAULT_MAX_RECONNECT_DELAY
}
fn default_max_jitter() -> Duration {
    DEFAULT_MAX_JITTER
}

/// Where the initial credential comes from.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionConfig {
    /// Environment variable holding the bearer token. Checked first.
    #[serde(default = "default_credential_env")]
    pub credential_env: String,
    /// File whose first non-empty line is the bearer token.
    #[serde(default)]
    pub credential_file: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credential_env: default_credential_env(),
            credential_file: None,
        }
    }
}

fn default_credential_env() -> String {
    "SIGHTWIRE_TOKEN".to_string()
}

/// Settings for the dashboard consumers run by the binary.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConsumersConfig {
    /// Capacity of the urgent-alert queue.
    #[serde(default = "default_alert_buffer")]
    pub alert_buffer: usize,
    /// Subject whose sightings are followed. No feed when unset.
    #[serde(default)]
    pub feed_subject: Option<i64>,
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,
}

impl Default for ConsumersConfig {
    fn default() -> Self {
        Self {
            alert_buffer: default_alert_buffer(),
            feed_subject: None,
            feed_capacity: default_feed_capacity(),
        }
    }
}

fn default_alert_buffer() -> usize {
    64
}
fn default_feed_capacity() -> usize {
    50
}

/// The complete client configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub consumers: ConsumersConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            hub: HubConfig::default(),
            reconnect: ReconnectConfig::default(),
            session: SessionConfig::default(),
            consumers: ConsumersConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid configuration in '{path}'"))
    }

    /// Parses and validates a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.log_level.trim().is_empty() {
            return Err(anyhow!("log_level cannot be empty"));
        }

        normalize_endpoint(&self.hub.url).map_err(|e| anyhow!("hub.url is invalid: {e}"))?;
        if self.hub.connect_timeout.is_zero() {
            return Err(anyhow!("hub.connect_timeout cannot be 0"));
        }
        if self.hub.handshake_timeout.is_zero() {
            return Err(anyhow!("hub.handshake_timeout cannot be 0"));
        }
        if self.hub.keepalive_interval.is_zero() {
            return Err(anyhow!("hub.keepalive_interval cannot be 0"));
        }
        if self.hub.server_timeout <= self.hub.keepalive_interval {
            return Err(anyhow!(
                "hub.server_timeout ({:?}) must be longer than hub.keepalive_interval ({:?})",
                self.hub.server_timeout,
                self.hub.keepalive_interval
            ));
        }
        if self.hub.outbound_buffer == 0 {
            return Err(anyhow!("hub.outbound_buffer cannot be 0"));
        }

        if self.reconnect.initial_delay < MIN_RECONNECT_DELAY {
            return Err(anyhow!(
                "reconnect.initial_delay cannot be shorter than {MIN_RECONNECT_DELAY:?}"
            ));
        }
        if self.reconnect.max_delay < self.reconnect.initial_delay {
            return Err(anyhow!(
                "reconnect.max_delay cannot be shorter than reconnect.initial_delay"
            ));
        }

        if self.session.credential_env.trim().is_empty() {
            return Err(anyhow!("session.credential_env cannot be empty"));
        }

        if self.consumers.alert_buffer == 0 {
            return Err(anyhow!("consumers.alert_buffer cannot be 0"));
        }
        if self.consumers.feed_capacity == 0 {
            return Err(anyhow!("consumers.feed_capacity cannot be 0"));
        }
        Ok(())
    }
}
