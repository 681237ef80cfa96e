//! Transcoder process management
//!
//! A transcoder reads one upstream source and republishes it to a local RTSP
//! mount. Each running transcoder is an OS process the feed supervisor owns.

pub mod ffmpeg;

pub use ffmpeg::FfmpegTranscoder;

use async_trait::async_trait;
use thiserror::Error;

/// Transcoder errors
#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("Failed to start transcoder: {0}")]
    Spawn(String),

    #[error("Transcoder signal failed: {0}")]
    Signal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Upstream source kind; decides how the stream is republished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscodeSource {
    /// Upstream RTSP(S) URL, copied without re-encoding
    Primary(String),
    /// Local MJPEG URL served by the capture bridge, encoded to H.264
    Bridged(String),
}

impl TranscodeSource {
    pub fn url(&self) -> &str {
        match self {
            Self::Primary(url) | Self::Bridged(url) => url,
        }
    }
}

/// One transcoder launch request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeJob {
    /// Feed the process belongs to, for logging
    pub feed_id: String,
    pub source: TranscodeSource,
    /// Local mount path, always starting with `/`
    pub mount_path: String,
}

/// How a transcoder process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
}

/// Starts transcoder processes
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn spawn(&self, job: &TranscodeJob) -> Result<Box<dyn TranscoderProcess>, TranscodeError>;
}

/// Handle to one running transcoder
#[async_trait]
pub trait TranscoderProcess: Send {
    /// OS process id, if still known
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to exit. Must be cancel safe.
    async fn wait(&mut self) -> Result<ProcessExit, TranscodeError>;

    /// Ask the process to shut down cleanly
    fn interrupt(&mut self) -> Result<(), TranscodeError>;

    /// Terminate the process immediately
    fn kill(&mut self) -> Result<(), TranscodeError>;
}
