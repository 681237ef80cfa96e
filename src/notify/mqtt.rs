//! MQTT notifier

use super::StatusNotifier;
use crate::settings::MqttSettings;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const TOPIC_PREFIX: &str = "nest-rtsp";
const DEFAULT_PORT: u16 = 1883;

struct Connection {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
}

/// Publishes `{from, event, args}` JSON to `nest-rtsp/<event>`
pub struct MqttNotifier {
    client_id: String,
    connection: Mutex<Option<Connection>>,
}

impl MqttNotifier {
    pub fn new() -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            client_id: format!("{}_{}", TOPIC_PREFIX, &suffix[..10]),
            connection: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    async fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            let _ = connection.client.disconnect().await;
            connection.event_loop.abort();
            tracing::info!("Disconnected from MQTT broker");
        }
    }

    fn connect(&self, settings: &MqttSettings) -> Connection {
        let (host, port) = parse_broker(&settings.host);
        let mut options = MqttOptions::new(self.client_id.clone(), host.clone(), port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_session(true);
        if !settings.user.is_empty() {
            options.set_credentials(settings.user.clone(), settings.password.clone());
        }

        let (client, mut event_loop) = AsyncClient::new(options, 10);
        let online_client = client.clone();
        let from = self.client_id.clone();
        let event_loop = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!("Connected to MQTT broker at {}:{}", host, port);
                        let payload = envelope(&from, "online", vec![Value::Bool(true)]);
                        if let Err(e) = online_client
                            .try_publish(topic("online"), QoS::AtLeastOnce, false, payload)
                        {
                            tracing::warn!("Failed to queue MQTT online message: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("MQTT connection error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Connection { client, event_loop }
    }
}

impl Default for MqttNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusNotifier for MqttNotifier {
    async fn publish(&self, event: &str, args: Vec<Value>) {
        let guard = self.connection.lock().await;
        let Some(connection) = guard.as_ref() else {
            return;
        };
        let payload = envelope(&self.client_id, event, args);
        if let Err(e) = connection
            .client
            .publish(topic(event), QoS::AtLeastOnce, false, payload)
            .await
        {
            tracing::warn!("Failed to publish MQTT {}: {}", event, e);
        }
    }

    async fn reconfigure(&self, settings: &MqttSettings) {
        self.disconnect().await;
        if !settings.enabled || settings.host.trim().is_empty() {
            tracing::debug!("MQTT notifications disabled");
            return;
        }
        let connection = self.connect(settings);
        *self.connection.lock().await = Some(connection);
    }
}

fn topic(event: &str) -> String {
    format!("{}/{}", TOPIC_PREFIX, event)
}

fn envelope(from: &str, event: &str, args: Vec<Value>) -> Vec<u8> {
    json!({ "from": from, "event": event, "args": args })
        .to_string()
        .into_bytes()
}

/// Split `host[:port]`, tolerating an `mqtt://` scheme
fn parse_broker(raw: &str) -> (String, u16) {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .strip_prefix("mqtt://")
        .or_else(|| trimmed.strip_prefix("tcp://"))
        .unwrap_or(trimmed)
        .trim_end_matches('/');
    match without_scheme.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (without_scheme.to_string(), DEFAULT_PORT),
        },
        None => (without_scheme.to_string(), DEFAULT_PORT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broker() {
        assert_eq!(parse_broker("broker.local"), ("broker.local".to_string(), 1883));
        assert_eq!(parse_broker("10.0.0.2:1884"), ("10.0.0.2".to_string(), 1884));
        assert_eq!(parse_broker("mqtt://broker:8883/"), ("broker".to_string(), 8883));
    }

    #[test]
    fn test_envelope_shape() {
        let payload = envelope("nest-rtsp_abc", "feed-status", vec![json!({ "feed": "cam" })]);
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(
            value,
            json!({ "from": "nest-rtsp_abc", "event": "feed-status", "args": [{ "feed": "cam" }] })
        );
        assert_eq!(topic("feed-status"), "nest-rtsp/feed-status");
    }

    #[tokio::test]
    async fn test_disabled_settings_stay_disconnected() {
        let notifier = MqttNotifier::new();
        assert!(notifier.client_id().starts_with("nest-rtsp_"));
        notifier.reconfigure(&MqttSettings::default()).await;
        assert!(!notifier.is_connected().await);
        // Publishing without a connection is a no-op
        notifier.publish("feed-status", Vec::new()).await;
    }
}
