//! Capture engines
//!
//! An engine renders the fallback stream for one camera and pushes JPEG
//! frames into a [`FrameSink`].

use super::frames::{FrameSink, JpegSplitter};
use super::BridgeError;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Placeholder in the capture command replaced by the camera id
pub const FEED_PLACEHOLDER: &str = "{feed}";

/// Starts capture sessions
#[async_trait]
pub trait CaptureEngine: Send + Sync {
    async fn start(&self, feed_id: &str, sink: FrameSink) -> Result<Box<dyn CaptureHandle>, BridgeError>;
}

/// One running capture session
#[async_trait]
pub trait CaptureHandle: Send {
    /// `true` while frames may still arrive
    fn liveness(&self) -> watch::Receiver<bool>;

    async fn stop(&mut self);
}

/// Engine that runs an external command writing concatenated JPEGs to stdout
#[derive(Debug, Clone)]
pub struct CommandCaptureEngine {
    command: Vec<String>,
}

impl CommandCaptureEngine {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    fn argv(&self, feed_id: &str) -> Result<(String, Vec<String>), BridgeError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| BridgeError::Engine("no capture command configured".to_string()))?;
        let args = args
            .iter()
            .map(|arg| arg.replace(FEED_PLACEHOLDER, feed_id))
            .collect();
        Ok((program.clone(), args))
    }
}

#[async_trait]
impl CaptureEngine for CommandCaptureEngine {
    async fn start(&self, feed_id: &str, sink: FrameSink) -> Result<Box<dyn CaptureHandle>, BridgeError> {
        let (program, args) = self.argv(feed_id)?;
        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::Engine(format!("failed to start {}: {}", program, e)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Engine("capture stdout unavailable".to_string()))?;

        let (alive_tx, alive_rx) = watch::channel(true);
        let feed = feed_id.to_string();
        let reader = tokio::spawn(async move {
            let mut splitter = JpegSplitter::new();
            let mut buf = vec![0u8; 64 * 1024];
            let mut frames = 0u64;
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        for frame in splitter.push(&buf[..n]) {
                            frames += 1;
                            sink.push(frame);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(feed = %feed, "Capture read failed: {}", e);
                        break;
                    }
                }
            }
            tracing::info!(feed = %feed, "Capture ended after {} frames", frames);
            let _ = alive_tx.send(false);
        });

        tracing::info!("Capture started for {} with pid {:?}", feed_id, child.id());
        Ok(Box::new(CommandCapture {
            child,
            reader,
            alive: alive_rx,
        }))
    }
}

struct CommandCapture {
    child: Child,
    reader: JoinHandle<()>,
    alive: watch::Receiver<bool>,
}

#[async_trait]
impl CaptureHandle for CommandCapture {
    fn liveness(&self) -> watch::Receiver<bool> {
        self.alive.clone()
    }

    async fn stop(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!("Capture process already gone: {}", e);
        }
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_feed_placeholder_substitution() {
        let engine = CommandCaptureEngine::new(vec![
            "capture".to_string(),
            "--camera".to_string(),
            "{feed}".to_string(),
        ]);
        let (program, args) = engine.argv("enterprises/p/devices/cam-1").unwrap();
        assert_eq!(program, "capture");
        assert_eq!(args, vec!["--camera", "enterprises/p/devices/cam-1"]);
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let engine = CommandCaptureEngine::new(Vec::new());
        let sink = FrameSink::new(Bytes::new());
        assert!(matches!(
            engine.start("cam", sink).await,
            Err(BridgeError::Engine(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_frames_reach_sink_and_liveness_drops() {
        let engine = CommandCaptureEngine::new(vec![
            "printf".to_string(),
            "\\377\\330frame\\377\\331".to_string(),
        ]);
        let sink = FrameSink::new(Bytes::from_static(b"blank"));
        let handle = engine.start("cam", sink.clone()).await.unwrap();

        let mut alive = handle.liveness();
        while *alive.borrow() {
            alive.changed().await.unwrap();
        }
        assert_eq!(&sink.latest()[..], b"\xFF\xD8frame\xFF\xD9");
    }
}
