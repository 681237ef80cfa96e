//! Feed status notifications
//!
//! Forwards every feed status change to an external pub/sub notifier.

pub mod mqtt;

pub use mqtt::MqttNotifier;

use crate::feed::FeedEvent;
use crate::settings::MqttSettings;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Event name used for feed status changes
pub const FEED_STATUS_EVENT: &str = "feed-status";

/// Outbound pub/sub channel
#[async_trait]
pub trait StatusNotifier: Send + Sync {
    /// Publish `args` under `event`. Never fails the caller.
    async fn publish(&self, event: &str, args: Vec<Value>);

    /// Apply new broker settings, reconnecting as needed
    async fn reconfigure(&self, _settings: &MqttSettings) {}
}

/// Notifier that drops everything
pub struct NoopNotifier;

#[async_trait]
impl StatusNotifier for NoopNotifier {
    async fn publish(&self, _event: &str, _args: Vec<Value>) {}
}

/// Relay feed events to `notifier` until the event channel closes
pub fn spawn_forwarder(
    mut events: broadcast::Receiver<FeedEvent>,
    notifier: Arc<dyn StatusNotifier>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let args = vec![json!({
                        "feed": event.feed,
                        "path": event.path,
                        "status": event.status,
                    })];
                    notifier.publish(FEED_STATUS_EVENT, args).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Notifier skipped {} feed events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{FeedStatus, Transport};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        published: Mutex<Vec<(String, Vec<Value>)>>,
    }

    #[async_trait]
    impl StatusNotifier for Recorder {
        async fn publish(&self, event: &str, args: Vec<Value>) {
            self.published.lock().push((event.to_string(), args));
        }
    }

    #[tokio::test]
    async fn test_forwarder_publishes_feed_status() {
        let (tx, rx) = broadcast::channel(8);
        let recorder = Arc::new(Recorder::default());
        let handle = spawn_forwarder(rx, recorder.clone());

        tx.send(FeedEvent {
            feed: "cam-1".to_string(),
            path: "/cam-1".to_string(),
            status: FeedStatus::RetryingGrant(Transport::Primary),
        })
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        let published = recorder.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "feed-status");
        assert_eq!(
            published[0].1,
            vec![json!({ "feed": "cam-1", "path": "/cam-1", "status": "Retrying RTSP" })]
        );
    }
}
