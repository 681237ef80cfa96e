//! Per-camera feed supervision
//!
//! A feed bridges one camera's upstream stream grant to a local RTSP mount:
//! it chooses a transport, fetches a grant, runs the transcoder, and keeps
//! the grant alive until stopped.

pub mod policy;
pub mod state;
pub mod supervisor;

pub use policy::{ExitAction, RetryPolicy};
pub use state::{FeedEvent, FeedSnapshot, FeedStatus, Transport};
pub use supervisor::{FeedSupervisor, SupervisorDeps, BRIDGE_GRANT_LIFETIME};
