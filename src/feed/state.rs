//! Feed state
//!
//! Defines the feed status machine and the snapshot observers read.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// How a feed reaches its upstream media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Direct RTSP grant
    Primary,
    /// Browser-negotiated stream via the capture bridge
    Bridged,
}

impl Transport {
    /// Protocol name shown in status strings
    pub fn label(&self) -> &'static str {
        match self {
            Self::Primary => "RTSP",
            Self::Bridged => "WebRTC",
        }
    }
}

/// Lifecycle status of a feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    Initializing,
    FetchingGrant(Transport),
    RateLimited(Transport),
    RetryingGrant(Transport),
    Streaming { pid: u32 },
    /// Between a crash (or restart request) and the next fetch
    Restarting,
    Stalled,
    Unsupported,
    Failed,
    Stopping,
}

impl FeedStatus {
    /// Statuses a pending `start()` keeps waiting through
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Initializing | Self::FetchingGrant(_) | Self::Restarting
        )
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming { .. })
    }
}

impl Default for FeedStatus {
    fn default() -> Self {
        Self::Initializing
    }
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => f.write_str("Initializing"),
            Self::FetchingGrant(t) => write!(f, "Fetching {}", t.label()),
            Self::RateLimited(t) => write!(f, "{} Rate Limited", t.label()),
            Self::RetryingGrant(t) => write!(f, "Retrying {}", t.label()),
            Self::Streaming { pid } => write!(f, "PID {}", pid),
            Self::Restarting => f.write_str("Restarting"),
            Self::Stalled => f.write_str("Stalled"),
            Self::Unsupported => f.write_str("Unsupported - No Stream"),
            Self::Failed => f.write_str("Failed"),
            Self::Stopping => f.write_str("Stopping"),
        }
    }
}

impl Serialize for FeedStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Point-in-time view of one feed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSnapshot {
    pub id: String,
    pub path: String,
    pub transport: Option<Transport>,
    pub status: FeedStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

impl FeedSnapshot {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            transport: None,
            status: FeedStatus::Initializing,
            expires_at: None,
            retry_count: 0,
        }
    }

    /// A grant is held and `now` is within `margin` of its expiry
    pub fn expiring_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let margin = ChronoDuration::from_std(margin).unwrap_or_else(|_| ChronoDuration::zero());
        self.expires_at
            .map(|expires_at| now >= expires_at - margin)
            .unwrap_or(false)
    }
}

/// "Updated" signal emitted on every status change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedEvent {
    pub feed: String,
    pub path: String,
    pub status: FeedStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(FeedStatus::FetchingGrant(Transport::Primary).to_string(), "Fetching RTSP");
        assert_eq!(FeedStatus::RateLimited(Transport::Primary).to_string(), "RTSP Rate Limited");
        assert_eq!(FeedStatus::RetryingGrant(Transport::Bridged).to_string(), "Retrying WebRTC");
        assert_eq!(FeedStatus::Streaming { pid: 4242 }.to_string(), "PID 4242");
        assert_eq!(FeedStatus::Unsupported.to_string(), "Unsupported - No Stream");
    }

    #[test]
    fn test_status_serializes_as_display_string() {
        let json = serde_json::to_string(&FeedStatus::Streaming { pid: 7 }).unwrap();
        assert_eq!(json, "\"PID 7\"");
    }

    #[test]
    fn test_expiring_requires_grant() {
        let mut snapshot = FeedSnapshot::new("cam", "/cam");
        let now = Utc::now();
        assert!(!snapshot.expiring_at(now, Duration::from_secs(60)));

        snapshot.expires_at = Some(now + ChronoDuration::seconds(30));
        assert!(snapshot.expiring_at(now, Duration::from_secs(60)));
        snapshot.expires_at = Some(now + ChronoDuration::minutes(5));
        assert!(!snapshot.expiring_at(now, Duration::from_secs(60)));
    }
}
