//! Settings and account commands

use super::{CommandContext, CommandError};
use crate::grant::GrantError;
use crate::settings::{MqttSettings, GOOGLE_ACCESS_TOKENS, MQTT_SETTINGS, RTSP_MAP, RTSP_PATHS};
use crate::utils::AppResult;
use serde_json::{json, Value};
use std::collections::HashMap;

pub fn ping() -> Value {
    Value::String("pong".to_string())
}

/// Ask the status sweep to publish now
pub fn refresh(ctx: &CommandContext) -> Value {
    ctx.refresh.notify_one();
    Value::Bool(true)
}

/// Forget the upstream API tokens
pub async fn logout(ctx: &CommandContext) -> AppResult<Value> {
    ctx.settings.delete(GOOGLE_ACCESS_TOKENS).await?;
    tracing::info!("Signed out of the device API");
    ctx.refresh.notify_one();
    Ok(Value::Bool(true))
}

pub async fn save_rtsp_map(ctx: &CommandContext, map: Value) -> AppResult<Value> {
    ctx.settings.set(RTSP_MAP, map).await?;
    ctx.refresh.notify_one();
    Ok(Value::Bool(true))
}

/// Store camera mount paths. Running feeds keep their path until restarted.
pub async fn save_rtsp_paths(ctx: &CommandContext, paths: HashMap<String, String>) -> AppResult<Value> {
    ctx.settings.set(RTSP_PATHS, json!(paths)).await?;
    ctx.refresh.notify_one();
    Ok(Value::Bool(true))
}

/// Store broker settings and reconnect the notifier
pub async fn save_mqtt(ctx: &CommandContext, mqtt: MqttSettings) -> AppResult<Value> {
    ctx.settings.set(MQTT_SETTINGS, serde_json::to_value(&mqtt)?).await?;
    ctx.notifier.reconfigure(&mqtt).await;
    ctx.refresh.notify_one();
    Ok(Value::Bool(true))
}

/// Cameras with live streaming. An authorization failure clears the stored tokens.
pub async fn list_devices(ctx: &CommandContext) -> AppResult<Value> {
    match ctx.grants.list_devices().await {
        Ok(devices) => Ok(Value::Array(devices)),
        Err(GrantError::Unauthenticated) => {
            tracing::warn!("Device API rejected stored credentials, signing out");
            ctx.settings.delete(GOOGLE_ACCESS_TOKENS).await?;
            ctx.refresh.notify_one();
            Err(CommandError::Failed(GrantError::Unauthenticated.to_string()).into())
        }
        Err(e) => Err(e.into()),
    }
}
