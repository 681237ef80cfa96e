//! Renewal sweep
//!
//! Periodically extends grants that are about to expire. Extensions run
//! detached, so one slow upstream call never delays the next tick or the
//! other feeds. A feed with an extension still outstanding is skipped.

use crate::registry::FeedRegistry;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

pub struct RenewalSweep {
    registry: Arc<FeedRegistry>,
    margin: Duration,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Clears a feed's in-flight mark when its extension task ends, even if aborted
struct InFlight {
    id: String,
    set: Arc<Mutex<HashSet<String>>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

impl RenewalSweep {
    pub fn new(registry: Arc<FeedRegistry>, margin: Duration) -> Self {
        Self {
            registry,
            margin,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Start an extension for every streaming feed inside `margin` of expiry
    /// that is not already being extended. Returns the started extensions.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        let mut started = Vec::new();
        for supervisor in self.registry.supervisors() {
            let snapshot = supervisor.snapshot();
            if !snapshot.status.is_streaming() || !snapshot.expiring_at(now, self.margin) {
                continue;
            }
            if !self.in_flight.lock().insert(snapshot.id.clone()) {
                tracing::debug!("Extension for {} still outstanding, skipping", snapshot.id);
                continue;
            }

            tracing::debug!("Grant for {} expires at {:?}, extending", snapshot.id, snapshot.expires_at);
            let guard = InFlight {
                id: snapshot.id,
                set: self.in_flight.clone(),
            };
            started.push(tokio::spawn(async move {
                supervisor.extend().await;
                drop(guard);
            }));
        }
        started
    }

    /// Feeds with an extension outstanding
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Run [`tick`](Self::tick) every `period`
    pub fn spawn(self, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let started = self.tick(Utc::now()).len();
                if started > 0 {
                    tracing::info!("Renewal sweep extending {} feed(s)", started);
                }
            }
        })
    }
}
