// tests/integration/consumers_test.rs

//! Integration tests for the dashboard consumers: alert banner, sighting feed
//! and dashboard refresh, driven through the loopback hub.

use super::test_helpers::{TestContext, WAIT, eventually, settle, sighting_json};
use serde_json::json;
use sightwire::consumers::{AlertBanner, DashboardRefresh, SightingFeed};
use sightwire::core::events::{HubEvent, Sighting};
use tokio::sync::mpsc;

// ===== Alert banner =====

#[tokio::test]
async fn test_alert_banner_forwards_alerts() {
    let ctx = TestContext::new();
    let (tx, mut rx) = mpsc::channel(4);
    let _banner = AlertBanner::attach(&ctx.subscriber(), tx);
    ctx.connect().await;

    ctx.hub
        .push_event(HubEvent::UrgentAlert.name(), json!("Armed robbery on 5th Ave"));

    let alert = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(alert.message, "Armed robbery on 5th Ave");
}

#[tokio::test]
async fn test_alert_banner_drops_when_queue_is_full() {
    let ctx = TestContext::new();
    let (tx, mut rx) = mpsc::channel(1);
    let _banner = AlertBanner::attach(&ctx.subscriber(), tx);
    ctx.connect().await;

    for i in 0..3 {
        ctx.hub
            .push_event(HubEvent::UrgentAlert.name(), json!(format!("alert {i}")));
    }
    eventually("all alerts dispatched", || ctx.manager.stats().events_dispatched == 3).await;

    assert_eq!(rx.recv().await.unwrap().message, "alert 0");
    assert!(rx.try_recv().is_err());
    assert_eq!(ctx.manager.stats().handler_failures, 0);
}

#[tokio::test]
async fn test_alert_banner_rejects_empty_alert() {
    let ctx = TestContext::new();
    let (tx, mut rx) = mpsc::channel(4);
    let _banner = AlertBanner::attach(&ctx.subscriber(), tx);
    ctx.connect().await;

    ctx.hub.push_event(HubEvent::UrgentAlert.name(), json!(null));
    eventually("failure recorded", || ctx.manager.stats().handler_failures == 1).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_detached_banner_stops_listening() {
    let ctx = TestContext::new();
    let (tx, mut rx) = mpsc::channel(4);
    let banner = AlertBanner::attach(&ctx.subscriber(), tx);
    ctx.connect().await;

    banner.detach();
    assert!(ctx.manager.registry().is_empty());

    ctx.hub.push_event(HubEvent::UrgentAlert.name(), json!("nobody hears this"));
    settle().await;
    assert!(rx.try_recv().is_err());
}

// ===== Sighting feed =====

#[tokio::test]
async fn test_feed_keeps_only_followed_subject_newest_first() {
    let ctx = TestContext::new();
    let feed = SightingFeed::attach(&ctx.subscriber(), 7, 10, None);
    ctx.connect().await;

    ctx.hub.push_event("ReceiveLocation", sighting_json(1, 7));
    ctx.hub.push_event("ReceiveLocation", sighting_json(2, 8));
    ctx.hub.push_event("ReceiveLocation", sighting_json(3, 7));

    eventually("three sightings dispatched", || {
        ctx.manager.stats().events_dispatched == 3
    })
    .await;
    let ids: Vec<i64> = feed.snapshot().iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![3, 1]);
    assert_eq!(feed.highlighted(), Some(3));

    feed.clear_highlight();
    assert_eq!(feed.highlighted(), None);
}

#[tokio::test]
async fn test_feed_respects_capacity_and_forwards_updates() {
    let ctx = TestContext::new();
    let (tx, mut rx) = mpsc::channel(16);
    let feed = SightingFeed::attach(&ctx.subscriber(), 7, 2, Some(tx));
    ctx.connect().await;

    for id in 1..=4 {
        ctx.hub.push_event("ReceiveLocation", sighting_json(id, 7));
    }

    eventually("feed filled", || feed.latest().map(|s| s.id) == Some(4)).await;
    let ids: Vec<i64> = feed.snapshot().iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![4, 3]);
    for id in 1..=4 {
        assert_eq!(rx.recv().await.unwrap().id, id);
    }
}

#[tokio::test]
async fn test_feed_accepts_legacy_subject_field() {
    let ctx = TestContext::new();
    let feed = SightingFeed::attach(&ctx.subscriber(), 42, 10, None);
    ctx.connect().await;

    ctx.hub.push_event(
        "ReceiveLocation",
        json!({
            "id": 9,
            "lat": 51.5,
            "lng": -0.12,
            "details": "near the station",
            "reportedBy": "citizen",
            "timestamp": "2024-05-01T08:30:00Z",
            "wantedPersonId": 42,
            "fileUrl": "/uploads/9.jpg",
        }),
    );

    eventually("legacy sighting", || feed.len() == 1).await;
    let sighting = feed.latest().unwrap();
    assert_eq!(sighting.subject_id, 42);
    assert_eq!(sighting.file_url.as_deref(), Some("/uploads/9.jpg"));
}

#[tokio::test]
async fn test_feed_seed_keeps_live_sightings_in_front() {
    let ctx = TestContext::new();
    let feed = SightingFeed::attach(&ctx.subscriber(), 7, 3, None);
    ctx.connect().await;
    ctx.hub.push_event("ReceiveLocation", sighting_json(10, 7));
    eventually("live sighting", || feed.len() == 1).await;

    let history: Vec<Sighting> = [9, 10, 8, 7, 6]
        .into_iter()
        .map(|id| serde_json::from_value(sighting_json(id, 7)).unwrap())
        .collect();
    feed.seed(history);

    let ids: Vec<i64> = feed.snapshot().iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![10, 9, 8]);
}

#[tokio::test]
async fn test_malformed_sighting_counts_as_handler_failure() {
    let ctx = TestContext::new();
    let feed = SightingFeed::attach(&ctx.subscriber(), 7, 10, None);
    ctx.connect().await;

    ctx.hub.push_event("ReceiveLocation", json!({"id": "not a number"}));

    eventually("failure recorded", || ctx.manager.stats().handler_failures == 1).await;
    assert!(feed.is_empty());
}

// ===== Dashboard refresh =====

#[tokio::test]
async fn test_refresh_fires_only_on_terminal_status() {
    let ctx = TestContext::new();
    let refresh = DashboardRefresh::attach(&ctx.subscriber());
    ctx.connect().await;

    ctx.hub
        .push_event("ReportStatusChanged", json!({"reportId": 5, "status": 0}));
    eventually("pending dispatched", || ctx.manager.stats().events_dispatched == 1).await;
    assert_eq!(refresh.reloads_requested(), 0);
    let mut reload = tokio_test::task::spawn(refresh.reload_requested());
    tokio_test::assert_pending!(reload.poll());
    drop(reload);

    ctx.hub
        .push_event("ReportStatusChanged", json!({"reportId": 5, "status": 1}));
    tokio::time::timeout(WAIT, refresh.reload_requested())
        .await
        .expect("completed report should trigger a reload");
    assert_eq!(refresh.reloads_requested(), 1);

    ctx.hub.push_event(
        "ReportStatusChanged",
        json!({"reportId": 6, "status": "Failed"}),
    );
    eventually("failed report", || refresh.reloads_requested() == 2).await;
}
