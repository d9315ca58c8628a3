// src/consumers/sighting_feed.rs

//! The live sighting feed of a subject's profile page.
//!
//! Sightings for the followed subject are kept newest first, up to a fixed
//! capacity, and the latest one is marked as highlighted. Sightings for other
//! subjects are ignored.

use crate::core::connection::Subscriber;
use crate::core::events::{HubEvent, Sighting, decode_payload};
use crate::core::registry::SubscriptionGuard;
use anyhow::Context;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug)]
struct FeedState {
    sightings: VecDeque<Sighting>,
    highlighted: Option<i64>,
    capacity: usize,
}

impl FeedState {
    fn push(&mut self, sighting: Sighting) {
        self.highlighted = Some(sighting.id);
        self.sightings.retain(|s| s.id != sighting.id);
        self.sightings.push_front(sighting);
        self.sightings.truncate(self.capacity);
    }
}

#[derive(Debug)]
pub struct SightingFeed {
    subject_id: i64,
    state: Arc<Mutex<FeedState>>,
    guard: SubscriptionGuard,
}

impl SightingFeed {
    /// Follows `subject_id`. Matching sightings are also forwarded to
    /// `updates` when given, e.g. to re-center a map.
    pub fn attach(
        subscriber: &Subscriber,
        subject_id: i64,
        capacity: usize,
        updates: Option<mpsc::Sender<Sighting>>,
    ) -> Self {
        let state = Arc::new(Mutex::new(FeedState {
            sightings: VecDeque::new(),
            highlighted: None,
            capacity: capacity.max(1),
        }));

        let feed_state = state.clone();
        let guard = subscriber.subscribe_guarded(HubEvent::NewLocation.name(), move |payload| {
            let sighting: Sighting =
                decode_payload(payload).context("malformed sighting payload")?;
            if sighting.subject_id != subject_id {
                debug!(
                    "Ignoring sighting #{} for subject {}.",
                    sighting.id, sighting.subject_id
                );
                return Ok(());
            }
            if let Some(tx) = &updates {
                if tx.try_send(sighting.clone()).is_err() {
                    warn!("Sighting update for #{} not forwarded.", sighting.id);
                }
            }
            feed_state.lock().push(sighting);
            Ok(())
        });

        Self {
            subject_id,
            state,
            guard,
        }
    }

    pub fn subject_id(&self) -> i64 {
        self.subject_id
    }

    /// Loads previously fetched history. Live sightings already in the feed
    /// stay in front.
    pub fn seed(&self, history: impl IntoIterator<Item = Sighting>) {
        let mut state = self.state.lock();
        let capacity = state.capacity;
        for sighting in history {
            if sighting.subject_id != self.subject_id
                || state.sightings.iter().any(|s| s.id == sighting.id)
            {
                continue;
            }
            if state.sightings.len() >= capacity {
                break;
            }
            state.sightings.push_back(sighting);
        }
    }

    /// The feed, newest first.
    pub fn snapshot(&self) -> Vec<Sighting> {
        self.state.lock().sightings.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<Sighting> {
        self.state.lock().sightings.front().cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().sightings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id of the sighting currently highlighted, if any.
    pub fn highlighted(&self) -> Option<i64> {
        self.state.lock().highlighted
    }

    pub fn clear_highlight(&self) {
        self.state.lock().highlighted = None;
    }

    /// Stops following the subject now.
    pub fn detach(self) {
        self.guard.cancel();
    }
}
