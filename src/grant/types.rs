//! Grant types
//!
//! A grant is the time-limited authorization plus media URL the upstream
//! device API issues for one live-stream session.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Substring that marks a failure as upstream rate limiting.
pub const RATE_LIMIT_MARKER: &str = "Rate limited";

/// Grant provider errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GrantError {
    /// Upstream refused because of quota; display text carries the marker.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Not signed in to the device API")]
    Unauthenticated,

    #[error("Device API request failed: {0}")]
    Request(String),

    #[error("Malformed grant: {0}")]
    Malformed(String),
}

impl GrantError {
    /// Whether this failure gets the long backoff.
    ///
    /// Matching is done on the rendered reason so that upstream messages
    /// mentioning the marker are classified the same way as typed errors.
    pub fn is_rate_limited(&self) -> bool {
        self.to_string().contains(RATE_LIMIT_MARKER)
    }
}

/// Live-stream protocols a device supports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Direct RTSP grants
    pub supports_primary: bool,
    /// Browser-negotiated stream, reached through the capture bridge
    pub supports_fallback: bool,
}

/// Raw grant as returned by the provider; any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantPayload {
    pub media_url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub continuation_token: Option<String>,
}

/// Fields returned by a successful extension
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantExtension {
    pub expires_at: Option<DateTime<Utc>>,
    pub continuation_token: Option<String>,
}

/// A validated grant held by a feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    pub media_url: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing)]
    pub continuation_token: Option<String>,
}

impl Grant {
    /// Validate a provider payload. Missing expiry or media URL is malformed.
    pub fn from_payload(payload: GrantPayload) -> Result<Self, GrantError> {
        let media_url = payload
            .media_url
            .filter(|url| !url.is_empty())
            .ok_or_else(|| GrantError::Malformed("missing media URL".to_string()))?;
        let expires_at = payload
            .expires_at
            .ok_or_else(|| GrantError::Malformed("missing expiry".to_string()))?;
        Ok(Self {
            media_url,
            expires_at,
            continuation_token: payload.continuation_token,
        })
    }

    /// Grant with a locally chosen lifetime, used by the capture bridge.
    pub fn synthetic(media_url: String, lifetime: Duration) -> Self {
        Self {
            media_url,
            expires_at: Utc::now() + to_chrono(lifetime),
            continuation_token: None,
        }
    }

    /// Merge an extension in place. Fields absent from the extension keep
    /// their current value; a missing expiry is rejected.
    pub fn merge(&mut self, extension: GrantExtension) -> Result<(), GrantError> {
        let expires_at = extension
            .expires_at
            .ok_or_else(|| GrantError::Malformed("extension without expiry".to_string()))?;
        self.expires_at = expires_at;
        if let Some(token) = extension.continuation_token {
            self.continuation_token = Some(token);
        }
        Ok(())
    }

    /// True once `now` is within `margin` of the expiry.
    pub fn expiring_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now >= self.expires_at - to_chrono(margin)
    }
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(365))
}
