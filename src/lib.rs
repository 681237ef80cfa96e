//! nest-rtsp - keeps cloud-granted camera streams at stable local RTSP mounts.
//!
//! Each camera is a feed run by its own supervisor task. The supervisor
//! obtains a time-limited stream grant, runs a transcoder that republishes the
//! upstream media to a local mount, renews the grant before it expires, and
//! recovers from crashes within a bounded budget.

pub mod app;
pub mod bridge;
pub mod commands;
pub mod config;
pub mod feed;
pub mod grant;
pub mod mount;
pub mod notify;
pub mod registry;
pub mod server;
pub mod settings;
pub mod sweep;
pub mod transcoder;
pub mod utils;

#[cfg(test)]
mod testing;

pub use app::App;
pub use config::Config;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber (`RUST_LOG` overrides the default filter)
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nest_rtsp=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
