//! Request/reply command bus
//!
//! Each request runs on its own task so a slow feed start cannot hold up
//! other callers. A request that outlives its timeout is answered with a
//! timeout error; its late result is discarded.

use super::{dispatch, Command, CommandContext, CommandError};
use crate::utils::{AppError, ErrorResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Inbound `{id, cmd, args}` message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub id: String,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<Value>,
    /// Per-request timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Outbound reply correlated by `id`: `{id, result}` or `{id, message, code}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl CommandReply {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            message: None,
            code: None,
        }
    }

    pub fn err(id: impl Into<String>, error: AppError) -> Self {
        let ErrorResponse { code, message } = error.into();
        Self {
            id: id.into(),
            result: None,
            message: Some(message),
            code: Some(code),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.message.is_none()
    }
}

#[derive(Clone)]
pub struct CommandBus {
    ctx: Arc<CommandContext>,
    default_timeout: Duration,
}

impl CommandBus {
    pub fn new(ctx: Arc<CommandContext>, default_timeout: Duration) -> Self {
        Self { ctx, default_timeout }
    }

    pub fn context(&self) -> &Arc<CommandContext> {
        &self.ctx
    }

    /// Parse, dispatch and answer one request
    pub async fn handle(&self, request: CommandRequest) -> CommandReply {
        let CommandRequest { id, cmd, args, timeout } = request;
        let limit = timeout.map(Duration::from_millis).unwrap_or(self.default_timeout);

        let ctx = self.ctx.clone();
        let name = cmd.clone();
        let task = tokio::spawn(async move {
            let command = Command::parse(&name, &args)?;
            dispatch(&ctx, command).await
        });

        match tokio::time::timeout(limit, task).await {
            Ok(Ok(Ok(result))) => CommandReply::ok(id, result),
            Ok(Ok(Err(e))) => {
                tracing::debug!("Command {} ({}) failed: {}", cmd, id, e);
                CommandReply::err(id, e)
            }
            Ok(Err(join_error)) => {
                tracing::error!("Command {} ({}) panicked: {}", cmd, id, join_error);
                CommandReply::err(id, CommandError::Failed(join_error.to_string()).into())
            }
            Err(_) => {
                tracing::warn!("Command {} ({}) timed out after {:?}", cmd, id, limit);
                CommandReply::err(id, CommandError::Timeout.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NoopNotifier;
    use crate::registry::FeedRegistry;
    use crate::settings::{SettingsStore, SqliteSettingsStore};
    use crate::testing::{deps, FakeGrants, FakeTranscoder};
    use serde_json::json;
    use tokio::sync::Notify;

    fn bus_with(grants: Arc<FakeGrants>, timeout: Duration) -> (CommandBus, Arc<SqliteSettingsStore>) {
        let settings = Arc::new(SqliteSettingsStore::open_in_memory().unwrap());
        let registry = Arc::new(FeedRegistry::new(deps(
            grants.clone(),
            Arc::new(FakeTranscoder::default()),
            None,
        )));
        let ctx = CommandContext {
            registry,
            settings: settings.clone(),
            grants,
            notifier: Arc::new(NoopNotifier),
            refresh: Arc::new(Notify::new()),
        };
        (CommandBus::new(Arc::new(ctx), timeout), settings)
    }

    fn request(id: &str, cmd: &str, args: Vec<Value>) -> CommandRequest {
        CommandRequest {
            id: id.to_string(),
            cmd: cmd.to_string(),
            args,
            timeout: None,
        }
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let (bus, _) = bus_with(Arc::new(FakeGrants::primary()), Duration::from_secs(5));
        let reply = bus.handle(request("1", "ping", vec![])).await;
        assert_eq!(reply, CommandReply::ok("1", json!("pong")));
    }

    #[tokio::test]
    async fn test_unknown_command_reply_carries_code() {
        let (bus, _) = bus_with(Arc::new(FakeGrants::primary()), Duration::from_secs(5));
        let reply = bus.handle(request("7", "launchMissiles", vec![])).await;
        assert!(!reply.is_ok());
        assert_eq!(reply.code.as_deref(), Some("UNKNOWN_COMMAND"));
        assert_eq!(reply.message.as_deref(), Some("No such command launchMissiles"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_persist_snapshot() {
        let (bus, settings) = bus_with(Arc::new(FakeGrants::primary()), Duration::from_secs(30));

        let reply = bus.handle(request("1", "startFeed", vec![json!("cam-1")])).await;
        assert!(reply.is_ok(), "{:?}", reply);
        let result = reply.result.unwrap();
        assert_eq!(result["path"], "/cam-1");
        assert_eq!(result["status"], "PID 1000");
        assert_eq!(settings.load().await.unwrap().rtsps_snapshot, vec!["cam-1".to_string()]);

        let reply = bus.handle(request("2", "stopFeed", vec![json!("cam-1")])).await;
        assert!(reply.is_ok(), "{:?}", reply);
        assert!(settings.load().await.unwrap().rtsps_snapshot.is_empty());
        assert!(bus.context().registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_missing_feed() {
        let (bus, _) = bus_with(Arc::new(FakeGrants::primary()), Duration::from_secs(5));
        let reply = bus.handle(request("3", "stopFeed", vec![json!("ghost")])).await;
        assert_eq!(reply.message.as_deref(), Some("No such stream"));
        assert_eq!(reply.code.as_deref(), Some("NOT_FOUND"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_command_times_out() {
        let grants = Arc::new(FakeGrants::primary());
        grants.hold_generate();
        let (bus, _) = bus_with(grants, Duration::from_secs(30));

        let mut slow = request("9", "startFeed", vec![json!("cam-slow")]);
        slow.timeout = Some(500);
        let reply = bus.handle(slow).await;
        assert_eq!(reply.code.as_deref(), Some("TIMEOUT"));
        assert_eq!(reply.message.as_deref(), Some("Request timed out"));
    }
}
