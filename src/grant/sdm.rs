//! Google Smart Device Management grant provider

use super::{Capabilities, GrantError, GrantExtension, GrantPayload, GrantProvider};
use crate::config::SdmSettings;
use crate::settings::SettingsStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const LIVE_STREAM_TRAIT: &str = "sdm.devices.traits.CameraLiveStream";
const GENERATE_RTSP: &str = "sdm.devices.commands.CameraLiveStream.GenerateRtspStream";
const EXTEND_RTSP: &str = "sdm.devices.commands.CameraLiveStream.ExtendRtspStream";
const STOP_RTSP: &str = "sdm.devices.commands.CameraLiveStream.StopRtspStream";

/// Grant provider backed by the SDM REST API
pub struct SdmGrantProvider {
    http: Client,
    api_base: String,
    enterprise_project_id: Option<String>,
    settings: Arc<dyn SettingsStore>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamResults {
    #[serde(default)]
    stream_urls: Option<StreamUrls>,
    #[serde(default)]
    stream_extension_token: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamUrls {
    #[serde(default)]
    rtsp_url: Option<String>,
}

impl SdmGrantProvider {
    pub fn new(sdm: &SdmSettings, settings: Arc<dyn SettingsStore>) -> Result<Self, GrantError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| GrantError::Request(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_base: sdm.api_base.trim_end_matches('/').to_string(),
            enterprise_project_id: sdm.enterprise_project_id.clone(),
            settings,
        })
    }

    async fn access_token(&self) -> Result<String, GrantError> {
        let settings = self
            .settings
            .load()
            .await
            .map_err(|e| GrantError::Request(e.to_string()))?;
        settings
            .access_token()
            .map(str::to_string)
            .ok_or(GrantError::Unauthenticated)
    }

    async fn get(&self, path: &str) -> Result<Value, GrantError> {
        let token = self.access_token().await?;
        let url = format!("{}/{}", self.api_base, path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| GrantError::Request(format!("failed to reach device API: {}", e)))?;
        read_response(response).await
    }

    async fn execute(&self, camera_id: &str, command: &str, params: Value) -> Result<Value, GrantError> {
        let token = self.access_token().await?;
        let url = format!("{}/{}:executeCommand", self.api_base, camera_id);
        tracing::debug!("Executing {} on {}", command, camera_id);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&json!({ "command": command, "params": params }))
            .send()
            .await
            .map_err(|e| GrantError::Request(format!("failed to reach device API: {}", e)))?;
        let body = read_response(response).await?;
        Ok(body.get("results").cloned().unwrap_or(Value::Null))
    }
}

async fn read_response(response: reqwest::Response) -> Result<Value, GrantError> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(classify_failure(status, &body));
    }
    serde_json::from_str(&body)
        .map_err(|e| GrantError::Request(format!("unreadable device API response: {}", e)))
}

/// Map an unsuccessful response to a grant error.
fn classify_failure(status: StatusCode, body: &str) -> GrantError {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let message = parsed
        .pointer("/error/message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.chars().take(200).collect());
    let upstream_status = parsed.pointer("/error/status").and_then(Value::as_str);

    if status == StatusCode::TOO_MANY_REQUESTS || upstream_status == Some("RESOURCE_EXHAUSTED") {
        return GrantError::RateLimited(message);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return GrantError::Unauthenticated;
    }
    GrantError::Request(format!("HTTP {}: {}", status.as_u16(), message))
}

fn capabilities_from_device(device: &Value) -> Result<Capabilities, GrantError> {
    let protocols = device
        .pointer(&format!("/traits/{}/supportedProtocols", LIVE_STREAM_TRAIT))
        .and_then(Value::as_array)
        .ok_or_else(|| GrantError::Request("device does not expose live streaming".to_string()))?;
    let has = |name: &str| protocols.iter().any(|p| p.as_str() == Some(name));
    Ok(Capabilities {
        supports_primary: has("RTSP"),
        supports_fallback: has("WEB_RTC"),
    })
}

fn parse_results(results: Value) -> Result<StreamResults, GrantError> {
    serde_json::from_value(results).map_err(|e| GrantError::Malformed(e.to_string()))
}

#[async_trait]
impl GrantProvider for SdmGrantProvider {
    async fn capabilities(&self, camera_id: &str) -> Result<Capabilities, GrantError> {
        let device = self.get(camera_id).await?;
        capabilities_from_device(&device)
    }

    async fn generate(&self, camera_id: &str) -> Result<GrantPayload, GrantError> {
        let results = parse_results(self.execute(camera_id, GENERATE_RTSP, json!({})).await?)?;
        Ok(GrantPayload {
            media_url: results.stream_urls.and_then(|urls| urls.rtsp_url),
            expires_at: results.expires_at,
            continuation_token: results.stream_extension_token,
        })
    }

    async fn extend(&self, camera_id: &str, token: &str) -> Result<GrantExtension, GrantError> {
        let params = json!({ "streamExtensionToken": token });
        let results = parse_results(self.execute(camera_id, EXTEND_RTSP, params).await?)?;
        Ok(GrantExtension {
            expires_at: results.expires_at,
            continuation_token: results.stream_extension_token,
        })
    }

    async fn revoke(&self, camera_id: &str, token: &str) -> Result<(), GrantError> {
        let params = json!({ "streamExtensionToken": token });
        self.execute(camera_id, STOP_RTSP, params).await?;
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<Value>, GrantError> {
        let project = self
            .enterprise_project_id
            .as_deref()
            .ok_or_else(|| GrantError::Request("no device access project configured".to_string()))?;
        let body = self.get(&format!("enterprises/{}/devices", project)).await?;
        let devices = body
            .get("devices")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(devices
            .into_iter()
            .filter(|device| device.pointer(&format!("/traits/{}", LIVE_STREAM_TRAIT)).is_some())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_from_protocol_list() {
        let device = json!({
            "name": "enterprises/p/devices/cam-1",
            "traits": {
                "sdm.devices.traits.CameraLiveStream": {
                    "supportedProtocols": ["WEB_RTC"]
                }
            }
        });
        let caps = capabilities_from_device(&device).unwrap();
        assert!(!caps.supports_primary);
        assert!(caps.supports_fallback);
    }

    #[test]
    fn test_device_without_live_stream_trait() {
        let device = json!({ "traits": {} });
        assert!(capabilities_from_device(&device).is_err());
    }

    #[test]
    fn test_too_many_requests_is_rate_limited() {
        let err = classify_failure(StatusCode::TOO_MANY_REQUESTS, "");
        assert!(err.is_rate_limited());

        let body = r#"{"error":{"code":429,"message":"Quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#;
        let err = classify_failure(StatusCode::BAD_REQUEST, body);
        assert_eq!(err, GrantError::RateLimited("Quota exceeded".to_string()));
    }

    #[test]
    fn test_other_failures_keep_upstream_message() {
        let body = r#"{"error":{"code":500,"message":"Backend error","status":"INTERNAL"}}"#;
        let err = classify_failure(StatusCode::INTERNAL_SERVER_ERROR, body);
        assert_eq!(err.to_string(), "Device API request failed: HTTP 500: Backend error");
        assert!(!err.is_rate_limited());
        assert_eq!(
            classify_failure(StatusCode::UNAUTHORIZED, "{}"),
            GrantError::Unauthenticated
        );
    }

    #[test]
    fn test_generate_results_with_missing_fields() {
        let results = parse_results(json!({
            "streamExtensionToken": "ext",
            "expiresAt": "2026-01-01T00:05:00.000Z"
        }))
        .unwrap();
        assert!(results.stream_urls.is_none());
        assert_eq!(results.stream_extension_token.as_deref(), Some("ext"));
        assert!(results.expires_at.is_some());
    }
}
