// tests/property/registry_test.rs

//! Property-based tests for the subscription registry: unsubscribing any
//! subset of handlers leaves exactly the others receiving events.

use proptest::prelude::*;
use serde_json::json;
use sightwire::core::registry::SubscriptionRegistry;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        max_shrink_iters: 500,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_unsubscribe_isolation(
        subscriptions in prop::collection::vec(0usize..4, 1..40),
        removal_mask in prop::collection::vec(any::<bool>(), 40),
    ) {
        let events = ["ReceiveUrgentAlert", "ReceiveLocation", "ReportStatusChanged", "Other"];
        let registry = SubscriptionRegistry::new();
        let mut handlers = Vec::new();

        for event_index in &subscriptions {
            let hits = Arc::new(AtomicUsize::new(0));
            let counter = hits.clone();
            let token = registry.subscribe(events[*event_index], move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            handlers.push((*event_index, token, hits));
        }

        let mut removed = BTreeSet::new();
        for (i, (_, token, _)) in handlers.iter().enumerate() {
            if removal_mask[i] {
                prop_assert!(registry.unsubscribe(token));
                removed.insert(i);
            }
        }

        for event in events {
            registry.dispatch(event, &json!({"probe": true}));
        }

        for (i, (event_index, _, hits)) in handlers.iter().enumerate() {
            let expected = if removed.contains(&i) { 0 } else { 1 };
            prop_assert_eq!(
                hits.load(Ordering::SeqCst),
                expected,
                "handler {} on {}", i, events[*event_index]
            );
        }
        prop_assert_eq!(registry.len(), handlers.len() - removed.len());
        for (index, event) in events.iter().enumerate() {
            let remaining = handlers
                .iter()
                .enumerate()
                .filter(|(i, (e, _, _))| *e == index && !removed.contains(i))
                .count();
            prop_assert_eq!(registry.handler_count(event), remaining);
        }
    }

    #[test]
    fn test_dispatch_preserves_registration_order(count in 1usize..30) {
        let registry = SubscriptionRegistry::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for n in 0..count {
            let order = order.clone();
            registry.subscribe("ReceiveLocation", move |_| {
                order.lock().push(n);
                Ok(())
            });
        }

        let outcome = registry.dispatch("ReceiveLocation", &json!(null));

        prop_assert_eq!(outcome.delivered, count);
        prop_assert_eq!(order.lock().clone(), (0..count).collect::<Vec<_>>());
    }
}
