//! Command handlers
//!
//! Inbound `{id, cmd, args}` requests are parsed into a [`Command`] and
//! dispatched to the feed registry or the settings store.

pub mod bus;
pub mod dispatcher;
pub mod feed;
pub mod settings;

pub use bus::{CommandBus, CommandReply, CommandRequest};
pub use dispatcher::dispatch;

use crate::grant::GrantProvider;
use crate::notify::StatusNotifier;
use crate::registry::{FeedRegistry, RegistryError};
use crate::settings::{MqttSettings, SettingsStore};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;

/// Command failures reported back to the caller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Stream Already Exists")]
    AlreadyExists(String),

    #[error("No such stream")]
    NotFound(String),

    #[error("No such command {0}")]
    Unknown(String),

    #[error("Invalid arguments for {command}: {reason}")]
    InvalidArgs { command: String, reason: String },

    #[error("Request timed out")]
    Timeout,

    #[error("{0}")]
    Failed(String),
}

impl CommandError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyExists(_) => "COMMAND_CONFLICT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unknown(_) => "UNKNOWN_COMMAND",
            Self::InvalidArgs { .. } => "INVALID_ARGS",
            Self::Timeout => "TIMEOUT",
            Self::Failed(_) => "COMMAND_FAILED",
        }
    }
}

impl From<RegistryError> for CommandError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::AlreadyExists(id) => Self::AlreadyExists(id),
            RegistryError::NotFound(id) => Self::NotFound(id),
        }
    }
}

/// Every command the daemon understands
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    Refresh,
    Logout,
    ListDevices,
    SaveRtspMap(Value),
    SaveRtspPaths(HashMap<String, String>),
    SaveMqtt(MqttSettings),
    StartFeed(String),
    StopFeed(String),
    RestartFeed(String),
}

impl Command {
    /// Parse a wire command name plus positional arguments
    pub fn parse(cmd: &str, args: &[Value]) -> Result<Self, CommandError> {
        match cmd {
            "ping" => Ok(Self::Ping),
            "refresh" => Ok(Self::Refresh),
            "logout" => Ok(Self::Logout),
            "listDevices" => Ok(Self::ListDevices),
            "saveRTSP" => Ok(Self::SaveRtspMap(arg(cmd, args, 0)?)),
            "saveRTSPPath" => Ok(Self::SaveRtspPaths(arg(cmd, args, 0)?)),
            "saveMQTT" => Ok(Self::SaveMqtt(arg(cmd, args, 0)?)),
            "startFeed" | "startRTSP" => Ok(Self::StartFeed(arg(cmd, args, 0)?)),
            "stopFeed" | "stopRTSP" => Ok(Self::StopFeed(arg(cmd, args, 0)?)),
            "restartFeed" | "restartRTSP" => Ok(Self::RestartFeed(arg(cmd, args, 0)?)),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

fn arg<T: DeserializeOwned>(command: &str, args: &[Value], index: usize) -> Result<T, CommandError> {
    let value = args.get(index).cloned().ok_or_else(|| CommandError::InvalidArgs {
        command: command.to_string(),
        reason: format!("missing argument {}", index),
    })?;
    serde_json::from_value(value).map_err(|e| CommandError::InvalidArgs {
        command: command.to_string(),
        reason: e.to_string(),
    })
}

/// Everything a command handler may touch
pub struct CommandContext {
    pub registry: Arc<FeedRegistry>,
    pub settings: Arc<dyn SettingsStore>,
    pub grants: Arc<dyn GrantProvider>,
    pub notifier: Arc<dyn StatusNotifier>,
    /// Wakes the status sweep for an immediate publish
    pub refresh: Arc<Notify>,
}
