//! Error types and handling
//!
//! Common error types used across the daemon.

use crate::bridge::BridgeError;
use crate::commands::CommandError;
use crate::grant::GrantError;
use crate::settings::SettingsError;
use crate::transcoder::TranscodeError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Grant error: {0}")]
    Grant(#[from] GrantError),

    #[error("Transcoder error: {0}")]
    Transcoder(#[from] TranscodeError),

    #[error("Capture bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("{0}")]
    Command(#[from] CommandError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Error payload sent back over the command bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        let code = match &error {
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Settings(_) => "SETTINGS_ERROR",
            AppError::Grant(_) => "GRANT_ERROR",
            AppError::Transcoder(_) => "TRANSCODER_ERROR",
            AppError::Bridge(_) => "BRIDGE_ERROR",
            AppError::Command(e) => e.code(),
            AppError::Config(_) => "CONFIG_ERROR",
        };

        ErrorResponse {
            code: code.to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
