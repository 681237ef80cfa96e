//! Feed commands

use super::{CommandContext, CommandError};
use crate::mount::resolve_mount_path;
use crate::settings::RTSPS_SNAPSHOT;
use crate::utils::AppResult;
use serde_json::{json, Value};

/// Register and start a feed, then persist the running set.
pub async fn start_feed(ctx: &CommandContext, id: &str) -> AppResult<Value> {
    let result = launch(ctx, id).await?;
    persist_snapshot(ctx).await?;
    Ok(result)
}

/// Stop a feed, unregister it, then persist the running set.
pub async fn stop_feed(ctx: &CommandContext, id: &str) -> AppResult<Value> {
    let supervisor = ctx.registry.get(id).map_err(CommandError::from)?;
    supervisor.stop().await;
    ctx.registry.remove(id);
    persist_snapshot(ctx).await?;
    Ok(Value::Bool(true))
}

pub async fn restart_feed(ctx: &CommandContext, id: &str) -> AppResult<Value> {
    let supervisor = ctx.registry.get(id).map_err(CommandError::from)?;
    let status = supervisor.restart().await;
    Ok(json!({ "id": id, "path": supervisor.snapshot().path, "status": status }))
}

/// Start every feed recorded in the snapshot. Failures are logged and skipped.
pub async fn restore_snapshot(ctx: &CommandContext) -> AppResult<usize> {
    let settings = ctx.settings.load().await?;
    let mut restored = 0;
    for id in &settings.rtsps_snapshot {
        match launch(ctx, id).await {
            Ok(_) => restored += 1,
            Err(e) => tracing::warn!("Could not restore feed {}: {}", id, e),
        }
    }
    persist_snapshot(ctx).await?;
    Ok(restored)
}

/// Stop and unregister every feed, leaving the snapshot untouched.
pub async fn stop_all(ctx: &CommandContext) {
    for supervisor in ctx.registry.supervisors() {
        supervisor.stop().await;
        ctx.registry.remove(supervisor.id());
    }
}

async fn launch(ctx: &CommandContext, id: &str) -> AppResult<Value> {
    let settings = ctx.settings.load().await?;
    let path = resolve_mount_path(id, settings.rtsp_paths.get(id).map(String::as_str));
    let supervisor = ctx.registry.create(id, &path).map_err(CommandError::from)?;
    let status = supervisor.start().await;
    tracing::info!("Feed {} at {}: {}", id, path, status);
    Ok(json!({ "id": id, "path": path, "status": status }))
}

async fn persist_snapshot(ctx: &CommandContext) -> AppResult<()> {
    ctx.settings
        .set(RTSPS_SNAPSHOT, json!(ctx.registry.ids()))
        .await?;
    ctx.refresh.notify_one();
    Ok(())
}
