//! Capture bridge
//!
//! Fallback path for cameras that only offer a browser-negotiated stream.
//! A capture engine renders the stream into a frame sink, the sink is served
//! as loopback motion-JPEG, and the transcoder reads that URL like any other
//! source.

pub mod engine;
pub mod frames;
pub mod mjpeg;

pub use engine::{CaptureEngine, CaptureHandle, CommandCaptureEngine};
pub use frames::{blank_frame, FrameSink, JpegSplitter};
pub use mjpeg::MjpegServer;

use crate::config::BridgeSettings;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Capture bridge errors
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Capture engine error: {0}")]
    Engine(String),

    #[error("Frame sink error: {0}")]
    Sink(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opens bridge sessions for feeds
#[async_trait]
pub trait CaptureBridge: Send + Sync {
    async fn open(&self, feed_id: &str) -> Result<Box<dyn BridgeSession>, BridgeError>;
}

/// Resources backing one bridged feed
#[async_trait]
pub trait BridgeSession: Send {
    /// Local media URL to hand to the transcoder
    fn sink_url(&self) -> String;

    /// Flips to `false` when the capture engine stops producing frames
    fn liveness(&self) -> watch::Receiver<bool>;

    /// Release every resource held by the session
    async fn close(&mut self);
}

/// Bridge built from a capture engine, a frame sink and an MJPEG server
pub struct LocalCaptureBridge {
    engine: Arc<dyn CaptureEngine>,
    settings: BridgeSettings,
}

impl LocalCaptureBridge {
    pub fn new(engine: Arc<dyn CaptureEngine>, settings: BridgeSettings) -> Self {
        Self { engine, settings }
    }
}

#[async_trait]
impl CaptureBridge for LocalCaptureBridge {
    async fn open(&self, feed_id: &str) -> Result<Box<dyn BridgeSession>, BridgeError> {
        let sink = FrameSink::new(blank_frame(self.settings.width, self.settings.height)?);
        let ticker = sink.spawn_ticker(self.settings.fps);

        let server = match MjpegServer::start(sink.clone()).await {
            Ok(server) => server,
            Err(e) => {
                ticker.abort();
                return Err(e);
            }
        };

        let capture = match self.engine.start(feed_id, sink).await {
            Ok(capture) => capture,
            Err(e) => {
                ticker.abort();
                server.shutdown();
                return Err(e);
            }
        };

        tracing::info!("Capture bridge for {} serving {}", feed_id, server.url());
        Ok(Box::new(LocalBridgeSession {
            server,
            ticker,
            capture,
        }))
    }
}

struct LocalBridgeSession {
    server: MjpegServer,
    ticker: JoinHandle<()>,
    capture: Box<dyn CaptureHandle>,
}

#[async_trait]
impl BridgeSession for LocalBridgeSession {
    fn sink_url(&self) -> String {
        self.server.url()
    }

    fn liveness(&self) -> watch::Receiver<bool> {
        self.capture.liveness()
    }

    async fn close(&mut self) {
        self.capture.stop().await;
        self.ticker.abort();
        self.server.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;

    struct StaticEngine {
        started: Mutex<Vec<String>>,
    }

    struct StaticCapture {
        alive: watch::Sender<bool>,
    }

    #[async_trait]
    impl CaptureHandle for StaticCapture {
        fn liveness(&self) -> watch::Receiver<bool> {
            self.alive.subscribe()
        }

        async fn stop(&mut self) {
            let _ = self.alive.send(false);
        }
    }

    #[async_trait]
    impl CaptureEngine for StaticEngine {
        async fn start(&self, feed_id: &str, sink: FrameSink) -> Result<Box<dyn CaptureHandle>, BridgeError> {
            self.started.lock().push(feed_id.to_string());
            sink.push(Bytes::from_static(b"\xFF\xD8cap\xFF\xD9"));
            let (alive, _) = watch::channel(true);
            Ok(Box::new(StaticCapture { alive }))
        }
    }

    fn settings() -> BridgeSettings {
        BridgeSettings {
            capture_command: Vec::new(),
            fps: 7,
            width: 32,
            height: 24,
        }
    }

    #[tokio::test]
    async fn test_open_serves_loopback_url_and_close_stops_capture() {
        let engine = Arc::new(StaticEngine {
            started: Mutex::new(Vec::new()),
        });
        let bridge = LocalCaptureBridge::new(engine.clone(), settings());

        let mut session = bridge.open("cam-3").await.unwrap();
        assert!(session.sink_url().starts_with("http://127.0.0.1:"));
        assert_eq!(engine.started.lock().as_slice(), ["cam-3".to_string()]);

        let liveness = session.liveness();
        assert!(*liveness.borrow());
        session.close().await;
        assert!(!*liveness.borrow());
    }
}
