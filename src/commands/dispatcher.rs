//! Command dispatch

use super::{feed, settings, Command, CommandContext};
use crate::utils::AppResult;
use serde_json::Value;

/// Run one parsed command
pub async fn dispatch(ctx: &CommandContext, command: Command) -> AppResult<Value> {
    tracing::debug!("Dispatching {:?}", command);
    match command {
        Command::Ping => Ok(settings::ping()),
        Command::Refresh => Ok(settings::refresh(ctx)),
        Command::Logout => settings::logout(ctx).await,
        Command::ListDevices => settings::list_devices(ctx).await,
        Command::SaveRtspMap(map) => settings::save_rtsp_map(ctx, map).await,
        Command::SaveRtspPaths(paths) => settings::save_rtsp_paths(ctx, paths).await,
        Command::SaveMqtt(mqtt) => settings::save_mqtt(ctx, mqtt).await,
        Command::StartFeed(id) => feed::start_feed(ctx, &id).await,
        Command::StopFeed(id) => feed::stop_feed(ctx, &id).await,
        Command::RestartFeed(id) => feed::restart_feed(ctx, &id).await,
    }
}
