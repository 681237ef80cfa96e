//! Status sweep
//!
//! Publishes the settings view and the per-feed status map on a fixed
//! period, and immediately whenever a feed changes or a refresh is asked for.

use crate::feed::FeedEvent;
use crate::registry::FeedRegistry;
use crate::settings::SettingsStore;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

/// One outbound status message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum StatusBroadcast {
    /// Public settings view
    Status(Value),
    /// Camera id to status string
    Processes(BTreeMap<String, String>),
}

pub struct StatusSweep {
    registry: Arc<FeedRegistry>,
    settings: Arc<dyn SettingsStore>,
    out: broadcast::Sender<StatusBroadcast>,
    refresh: Arc<Notify>,
}

impl StatusSweep {
    pub fn new(
        registry: Arc<FeedRegistry>,
        settings: Arc<dyn SettingsStore>,
        out: broadcast::Sender<StatusBroadcast>,
        refresh: Arc<Notify>,
    ) -> Self {
        Self {
            registry,
            settings,
            out,
            refresh,
        }
    }

    /// Current `{id: status}` projection
    pub fn processes(&self) -> BTreeMap<String, String> {
        self.registry
            .snapshots()
            .into_iter()
            .map(|snapshot| (snapshot.id, snapshot.status.to_string()))
            .collect()
    }

    /// Publish one round. A settings read failure skips only the settings message.
    pub async fn tick(&self) {
        match self.settings.load().await {
            Ok(settings) => {
                let _ = self.out.send(StatusBroadcast::Status(settings.public_view()));
            }
            Err(e) => tracing::warn!("Status sweep could not read settings: {}", e),
        }
        let _ = self.out.send(StatusBroadcast::Processes(self.processes()));
    }

    pub fn spawn(self, period: Duration, mut events: broadcast::Receiver<FeedEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut events_open = true;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.refresh.notified() => {}
                    event = events.recv(), if events_open => match event {
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => events_open = false,
                    },
                }
                self.tick().await;
            }
        })
    }
}
