// src/main.rs

//! Command-line client: keeps one real-time channel to the surveillance hub
//! open for the logged-in session and prints what the dashboard would show.
//!
//! Reads commands from stdin:
//! `login <token>`, `logout`, `status`, `quit`.

use anyhow::Result;
use sightwire::config::Config;
use sightwire::consumers::{Alert, AlertBanner, DashboardRefresh, SightingFeed};
use sightwire::core::connection::{ConnectionManager, ConnectionSettings, Subscriber};
use sightwire::core::events::Sighting;
use sightwire::core::session::{CredentialStore, SessionGuard, load_credential};
use sightwire::core::transport::WebSocketTransport;
use std::env;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Notify, broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, prelude::*};

/// The consumers attached for one logged-in session.
struct Dashboard {
    _alerts: AlertBanner,
    _feed: Option<SightingFeed>,
    _refresh: DashboardRefresh,
}

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("sightwire version {VERSION}");
        return Ok(());
    }

    // Defaults to "config.toml"; a missing default file means built-in defaults.
    let explicit_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());
    let config_path = explicit_path.unwrap_or("config.toml");
    let config = if explicit_path.is_none() && !Path::new(config_path).exists() {
        Config::default()
    } else {
        match Config::from_file(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
                std::process::exit(1);
            }
        }
    };

    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::registry()
        .with(EnvFilter::new(log_level))
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();

    info!("sightwire {VERSION} starting; hub at {}", config.hub.url);

    if let Err(e) = run(config).await {
        error!("Runtime error: {e:#}");
        return Err(e);
    }
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let transport = WebSocketTransport::from_config(&config.hub)?;
    let manager = Arc::new(ConnectionManager::new(
        Arc::new(transport),
        ConnectionSettings::from(&config),
    ));

    let initial = load_credential(
        &config.session.credential_env,
        config.session.credential_file.as_deref().map(Path::new),
    )?;
    if initial.is_none() {
        warn!("No credential configured; type `login <token>` to connect.");
    }
    let store = CredentialStore::new(initial);

    let (alert_tx, alert_rx) = mpsc::channel(config.consumers.alert_buffer);
    let (sighting_tx, sighting_rx) = mpsc::channel(config.consumers.feed_capacity);
    let reload = Arc::new(Notify::new());
    tokio::spawn(print_alerts(alert_rx));
    tokio::spawn(print_sightings(sighting_rx));
    tokio::spawn(print_reloads(reload.clone()));

    let consumers = config.consumers.clone();
    let guard = SessionGuard::new(&store, manager.clone()).on_login(move |subscriber: &Subscriber| {
        Dashboard {
            _alerts: AlertBanner::attach(subscriber, alert_tx.clone()),
            _feed: consumers.feed_subject.map(|subject| {
                SightingFeed::attach(
                    subscriber,
                    subject,
                    consumers.feed_capacity,
                    Some(sighting_tx.clone()),
                )
            }),
            _refresh: DashboardRefresh::with_signal(subscriber, reload.clone()),
        }
    });

    let (shutdown_tx, _) = broadcast::channel(1);
    let guard_task = tokio::spawn(guard.run(shutdown_tx.subscribe()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C; shutting down.");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_command(line.trim(), &store, &manager) {
                    break;
                }
            }
        }
    }

    let _ = shutdown_tx.send(());
    if let Err(e) = guard_task.await {
        error!("Session guard task failed: {e}");
    }
    manager.shutdown().await;
    info!("Goodbye.");
    Ok(())
}

/// Applies one stdin command. Returns `false` to quit.
fn handle_command(line: &str, store: &CredentialStore, manager: &ConnectionManager) -> bool {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("login") => match parts.next() {
            Some(token) => {
                if let Err(e) = store.login(token) {
                    warn!("Login rejected: {e}");
                }
            }
            None => warn!("Usage: login <token>"),
        },
        Some("logout") => store.logout(),
        Some("status") => {
            let stats = manager.stats();
            let last_error = manager
                .current()
                .and_then(|h| h.last_error())
                .map(|e| e.to_string())
                .unwrap_or_else(|| "none".to_string());
            info!(
                "state={} logged_in={} subscriptions={} opened={} reconnects={} events={} handler_failures={} last_error={}",
                manager.state(),
                store.is_logged_in(),
                manager.registry().len(),
                stats.connections_opened,
                stats.reconnects,
                stats.events_dispatched,
                stats.handler_failures,
                last_error
            );
        }
        Some("quit") | Some("exit") => return false,
        Some(other) => warn!("Unknown command '{other}'."),
        None => {}
    }
    true
}

async fn print_alerts(mut rx: mpsc::Receiver<Alert>) {
    while let Some(alert) = rx.recv().await {
        println!("[URGENT {}] {}", alert.received_at.format("%H:%M:%S"), alert.message);
    }
}

async fn print_sightings(mut rx: mpsc::Receiver<Sighting>) {
    while let Some(s) = rx.recv().await {
        println!(
            "[SIGHTING #{}] subject {} at ({:.5}, {:.5}) by {}: {}",
            s.id, s.subject_id, s.lat, s.lng, s.reported_by, s.details
        );
    }
}

async fn print_reloads(reload: Arc<Notify>) {
    loop {
        reload.notified().await;
        println!("[DASHBOARD] report finished; reloading.");
    }
}
