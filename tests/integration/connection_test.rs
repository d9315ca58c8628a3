// tests/integration/connection_test.rs

//! Integration tests for the shared connection: idempotent ensure, delivery,
//! unsubscribe isolation, teardown, credential replacement, and sends.

use super::test_helpers::{TestContext, credential, eventually, settle};
use serde_json::{Value, json};
use sightwire::core::SightwireError;
use sightwire::core::connection::ConnectionState;
use sightwire::core::protocol::HubMessage;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

type Seen = Arc<parking_lot::Mutex<Vec<Value>>>;

fn recorder() -> (
    Seen,
    impl Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
) {
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |payload: &Value| {
        sink.lock().push(payload.clone());
        Ok(())
    })
}

// ===== ensure_connection =====

#[tokio::test]
async fn test_ensure_connection_is_idempotent() {
    let ctx = TestContext::new();

    let first = ctx.connect().await;
    let second = ctx.manager.ensure_connection(&ctx.credential);
    let third = ctx.manager.ensure_connection(&ctx.credential);

    assert_eq!(first.id(), second.id());
    assert_eq!(first.id(), third.id());
    settle().await;
    assert_eq!(ctx.hub.sessions_opened(), 1);
    assert_eq!(ctx.hub.peak_live_sessions(), 1);
}

#[tokio::test]
async fn test_concurrent_ensure_connection_shares_one_connection() {
    let ctx = TestContext::new();

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let manager = ctx.manager.clone();
        let credential = ctx.credential.clone();
        tasks.push(tokio::spawn(async move {
            manager.ensure_connection(&credential).id()
        }));
    }
    let mut ids = HashSet::new();
    for task in tasks {
        ids.insert(task.await.unwrap());
    }

    assert_eq!(ids.len(), 1);
    ctx.wait_for_state(ConnectionState::Connected).await;
    settle().await;
    assert_eq!(ctx.hub.sessions_opened(), 1);
    assert_eq!(ctx.hub.peak_live_sessions(), 1);
}

#[tokio::test]
async fn test_state_is_connecting_right_after_ensure() {
    let ctx = TestContext::new();
    assert_eq!(ctx.manager.state(), ConnectionState::Disconnected);

    let handle = ctx.manager.ensure_connection(&ctx.credential);

    assert_eq!(handle.state(), ConnectionState::Connecting);
    ctx.wait_for_state(ConnectionState::Connected).await;
    assert_eq!(handle.state(), ConnectionState::Connected);
    assert!(handle.is_live());
}

// ===== Delivery =====

#[tokio::test]
async fn test_subscription_before_connect_receives_events() {
    let ctx = TestContext::new();
    let (seen, handler) = recorder();
    ctx.manager.subscribe("ReceiveUrgentAlert", handler);

    ctx.connect().await;
    assert!(ctx.hub.push_event("ReceiveUrgentAlert", json!("Armed suspect at Pier 4")));

    eventually("alert delivery", || seen.lock().len() == 1).await;
    assert_eq!(seen.lock()[0], json!("Armed suspect at Pier 4"));
}

#[tokio::test]
async fn test_events_route_by_name() {
    let ctx = TestContext::new();
    let (alerts, alert_handler) = recorder();
    let (locations, location_handler) = recorder();
    ctx.manager.subscribe("ReceiveUrgentAlert", alert_handler);
    ctx.manager.subscribe("ReceiveLocation", location_handler);
    ctx.connect().await;

    ctx.hub.push_event("ReceiveLocation", json!({"id": 1}));
    ctx.hub.push_event("SomethingElse", json!(null));
    ctx.hub.push_event("ReceiveLocation", json!({"id": 2}));

    eventually("two locations", || locations.lock().len() == 2).await;
    settle().await;
    assert!(alerts.lock().is_empty());
    assert_eq!(locations.lock()[1], json!({"id": 2}));
}

#[tokio::test]
async fn test_invocation_arguments_are_collapsed() {
    let ctx = TestContext::new();
    let (seen, handler) = recorder();
    ctx.manager.subscribe("Multi", handler);
    ctx.connect().await;

    ctx.hub.push(HubMessage::invocation("Multi", vec![]));
    ctx.hub.push(HubMessage::invocation("Multi", vec![json!(1), json!("two")]));

    eventually("both invocations", || seen.lock().len() == 2).await;
    let seen = seen.lock();
    assert_eq!(seen[0], Value::Null);
    assert_eq!(seen[1], json!([1, "two"]));
}

#[tokio::test]
async fn test_unsubscribe_leaves_other_handlers_untouched() {
    let ctx = TestContext::new();
    let (first, first_handler) = recorder();
    let (second, second_handler) = recorder();
    let token = ctx.manager.subscribe("ReceiveUrgentAlert", first_handler);
    ctx.manager.subscribe("ReceiveUrgentAlert", second_handler);
    ctx.connect().await;

    assert!(ctx.manager.unsubscribe(&token));
    assert!(!ctx.manager.unsubscribe(&token));
    ctx.hub.push_event("ReceiveUrgentAlert", json!("evacuate"));

    eventually("second handler", || second.lock().len() == 1).await;
    settle().await;
    assert!(first.lock().is_empty());
}

#[tokio::test]
async fn test_failing_handlers_do_not_block_others() {
    let ctx = TestContext::new();
    let delivered = Arc::new(AtomicUsize::new(0));
    ctx.manager
        .subscribe("ReceiveUrgentAlert", |_| Err(anyhow::anyhow!("consumer broke")));
    ctx.manager
        .subscribe("ReceiveUrgentAlert", |_| panic!("consumer exploded"));
    let counter = delivered.clone();
    ctx.manager.subscribe("ReceiveUrgentAlert", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    ctx.connect().await;

    ctx.hub.push_event("ReceiveUrgentAlert", json!("one"));
    ctx.hub.push_event("ReceiveUrgentAlert", json!("two"));

    eventually("both alerts", || delivered.load(Ordering::SeqCst) == 2).await;
    let stats = ctx.manager.stats();
    assert_eq!(stats.events_dispatched, 2);
    assert_eq!(stats.handler_failures, 4);
    assert_eq!(ctx.manager.state(), ConnectionState::Connected);
}

// ===== Teardown =====

#[tokio::test]
async fn test_teardown_closes_connection_and_clears_subscriptions() {
    let ctx = TestContext::new();
    let (seen, handler) = recorder();
    ctx.manager.subscribe("ReceiveUrgentAlert", handler);
    let handle = ctx.connect().await;

    ctx.manager.teardown();

    assert_eq!(ctx.manager.state(), ConnectionState::Disconnected);
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    assert!(!handle.is_live());
    assert!(ctx.manager.registry().is_empty());
    assert!(ctx.manager.current().is_none());

    handle.stopped().await;
    assert_eq!(ctx.hub.live_sessions(), 0);
    assert!(!ctx.hub.push_event("ReceiveUrgentAlert", json!("too late")));
    settle().await;
    assert!(seen.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_handler_runs_after_teardown_returns_mid_dispatch() {
    let ctx = TestContext::new();
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let torn_down = Arc::new(AtomicBool::new(false));
    let late_calls = Arc::new(AtomicUsize::new(0));

    let (s, f) = (started.clone(), finished.clone());
    ctx.manager.subscribe("E", move |_| {
        s.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(300));
        f.store(true, Ordering::SeqCst);
        Ok(())
    });
    let (t, late) = (torn_down.clone(), late_calls.clone());
    ctx.manager.subscribe("E", move |_| {
        if t.load(Ordering::SeqCst) {
            late.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    });
    ctx.connect().await;

    assert!(ctx.hub.push_event("E", json!(1)));
    eventually("first handler running", || started.load(Ordering::SeqCst)).await;

    ctx.manager.teardown();
    torn_down.store(true, Ordering::SeqCst);

    // The in-flight call finished before teardown returned.
    assert!(finished.load(Ordering::SeqCst));
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(late_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handler_may_tear_down_the_channel() {
    let ctx = TestContext::new();
    let later = Arc::new(AtomicUsize::new(0));
    let manager = Arc::downgrade(&ctx.manager);
    ctx.manager.subscribe("ForceLogout", move |_| {
        if let Some(manager) = manager.upgrade() {
            manager.teardown();
        }
        Ok(())
    });
    let counter = later.clone();
    ctx.manager.subscribe("ForceLogout", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let handle = ctx.connect().await;

    assert!(ctx.hub.push_event("ForceLogout", Value::Null));

    tokio::time::timeout(Duration::from_secs(5), handle.stopped())
        .await
        .expect("teardown from a handler must not deadlock");
    assert_eq!(ctx.manager.state(), ConnectionState::Disconnected);
    assert!(ctx.manager.registry().is_empty());
    assert_eq!(later.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_every_handle_clone_waits_for_worker_exit() {
    let ctx = TestContext::new();
    let handle = ctx.connect().await;
    let other = handle.clone();

    assert!(
        tokio::time::timeout(Duration::from_millis(50), other.stopped())
            .await
            .is_err()
    );

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let handle = handle.clone();
            tokio::spawn(async move { handle.stopped().await })
        })
        .collect();
    ctx.manager.teardown();

    for waiter in waiters {
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }
    other.stopped().await;
    handle.stopped().await;
    assert_eq!(ctx.hub.live_sessions(), 0);
}

#[tokio::test]
async fn test_teardown_is_idempotent() {
    let ctx = TestContext::new();
    ctx.connect().await;

    ctx.manager.teardown();
    ctx.manager.teardown();

    assert_eq!(ctx.manager.state(), ConnectionState::Disconnected);
    ctx.manager.teardown();
    assert!(ctx.manager.registry().is_empty());
}

#[tokio::test]
async fn test_ensure_after_teardown_starts_fresh() {
    let ctx = TestContext::new();
    let first = ctx.connect().await;
    ctx.manager.teardown();
    first.stopped().await;

    let second = ctx.connect().await;

    assert_ne!(first.id(), second.id());
    assert_eq!(ctx.hub.sessions_opened(), 2);
    assert_eq!(ctx.hub.live_sessions(), 1);
}

// ===== Credential changes =====

#[tokio::test]
async fn test_new_credential_replaces_connection_and_keeps_subscriptions() {
    let ctx = TestContext::new();
    let (seen, handler) = recorder();
    ctx.manager.subscribe("ReceiveUrgentAlert", handler);
    let old = ctx.connect().await;

    let fresh = credential("token-beta");
    let new = ctx.manager.ensure_connection(&fresh);
    assert_ne!(old.id(), new.id());
    assert!(!old.is_live());
    assert_eq!(old.state(), ConnectionState::Disconnected);

    ctx.wait_for_sessions(2).await;
    ctx.wait_for_state(ConnectionState::Connected).await;
    old.stopped().await;
    assert_eq!(ctx.hub.live_sessions(), 1);
    assert_eq!(ctx.hub.credentials_seen(), vec![ctx.credential.clone(), fresh]);

    ctx.hub.push_event("ReceiveUrgentAlert", json!("after rotation"));
    eventually("delivery on new connection", || seen.lock().len() == 1).await;
}

// ===== Sending =====

#[tokio::test]
async fn test_send_requires_live_connection() {
    let ctx = TestContext::new();

    let err = ctx.manager.send("JoinGroup", vec![json!("detectives")]).unwrap_err();
    assert!(matches!(err, SightwireError::NotConnected));

    ctx.connect().await;
    ctx.manager.send("JoinGroup", vec![json!("detectives")]).unwrap();

    eventually("outbound invocation", || {
        ctx.hub
            .sent()
            .contains(&HubMessage::invocation("JoinGroup", vec![json!("detectives")]))
    })
    .await;
}

// ===== Server close =====

#[tokio::test]
async fn test_close_without_reconnect_stops_worker() {
    let ctx = TestContext::new();
    let handle = ctx.connect().await;

    ctx.hub.push(HubMessage::Close {
        error: Some("server shutting down".into()),
        allow_reconnect: false,
    });

    ctx.wait_for_state(ConnectionState::Disconnected).await;
    assert!(!handle.is_live());
    assert!(matches!(
        handle.last_error(),
        Some(SightwireError::ClosedByServer(reason)) if reason == "server shutting down"
    ));

    let replacement = ctx.manager.ensure_connection(&ctx.credential);
    assert_ne!(replacement.id(), handle.id());
    ctx.wait_for_state(ConnectionState::Connected).await;
}
