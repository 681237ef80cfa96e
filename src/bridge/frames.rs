//! Frame sink and JPEG stream splitting
//!
//! The sink keeps the most recent captured frame and re-emits it to every
//! subscriber at a fixed rate, so downstream consumers see a steady frame
//! cadence even when the capture engine delivers frames irregularly.

use super::BridgeError;
use bytes::{Buf, Bytes, BytesMut};
use image::{DynamicImage, ImageFormat, RgbImage};
use parking_lot::RwLock;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Upper bound on buffered bytes while waiting for an end-of-image marker
const MAX_PENDING: usize = 16 * 1024 * 1024;

/// Encode a black JPEG of the given size
pub fn blank_frame(width: u32, height: u32) -> Result<Bytes, BridgeError> {
    let image = DynamicImage::ImageRgb8(RgbImage::new(width.max(1), height.max(1)));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Jpeg)
        .map_err(|e| BridgeError::Sink(format!("failed to encode blank frame: {}", e)))?;
    Ok(Bytes::from(out.into_inner()))
}

/// Latest-frame holder with a fixed-rate broadcast
#[derive(Clone)]
pub struct FrameSink {
    latest: Arc<RwLock<Bytes>>,
    tx: broadcast::Sender<Bytes>,
}

impl FrameSink {
    /// Create a sink that starts out showing `initial`
    pub fn new(initial: Bytes) -> Self {
        let (tx, _) = broadcast::channel(4);
        Self {
            latest: Arc::new(RwLock::new(initial)),
            tx,
        }
    }

    /// Replace the current frame
    pub fn push(&self, frame: Bytes) {
        *self.latest.write() = frame;
    }

    /// Current frame
    pub fn latest(&self) -> Bytes {
        self.latest.read().clone()
    }

    /// Receive the re-emitted frames
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.tx.subscribe()
    }

    /// Start re-emitting the latest frame `fps` times per second
    pub fn spawn_ticker(&self, fps: u32) -> JoinHandle<()> {
        let sink = self.clone();
        let period = Duration::from_secs_f64(1.0 / f64::from(fps.max(1)));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                // No receivers is fine; clients come and go.
                let _ = sink.tx.send(sink.latest());
            }
        })
    }
}

/// Splits a byte stream of concatenated JPEG images into frames
#[derive(Default)]
pub struct JpegSplitter {
    pending: BytesMut,
}

impl JpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every frame it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find(&self.pending, &SOI, 0) else {
                // Keep a trailing 0xFF that may begin the next marker
                let keep = usize::from(self.pending.last() == Some(&0xFF));
                let drop = self.pending.len() - keep;
                self.pending.advance(drop);
                break;
            };
            self.pending.advance(start);

            match find(&self.pending, &EOI, SOI.len()) {
                Some(end) => {
                    frames.push(self.pending.split_to(end + EOI.len()).freeze());
                }
                None => {
                    if self.pending.len() > MAX_PENDING {
                        tracing::warn!("Dropping {} bytes without end-of-image marker", self.pending.len());
                        self.pending.clear();
                    }
                    break;
                }
            }
        }

        frames
    }
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut data = SOI.to_vec();
        data.extend_from_slice(body);
        data.extend_from_slice(&EOI);
        data
    }

    #[test]
    fn test_splits_concatenated_frames() {
        let mut stream = jpeg(b"one");
        stream.extend(jpeg(b"two"));
        let frames = JpegSplitter::new().push(&stream);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &jpeg(b"one")[..]);
        assert_eq!(&frames[1][..], &jpeg(b"two")[..]);
    }

    #[test]
    fn test_frame_across_chunks_and_leading_garbage() {
        let frame = jpeg(b"payload");
        let mut splitter = JpegSplitter::new();
        let mut first = b"noise".to_vec();
        first.extend_from_slice(&frame[..4]);
        assert!(splitter.push(&first).is_empty());
        let frames = splitter.push(&frame[4..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &frame[..]);
    }

    #[test]
    fn test_marker_split_between_chunks() {
        let frame = jpeg(b"x");
        let mut splitter = JpegSplitter::new();
        // Chunk ends right after the 0xFF of the start marker
        assert!(splitter.push(&[0x00, 0xFF]).is_empty());
        let frames = splitter.push(&frame[1..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &frame[..]);
    }

    #[test]
    fn test_blank_frame_is_jpeg() {
        let frame = blank_frame(64, 48).unwrap();
        assert_eq!(&frame[..2], &SOI);
        assert_eq!(&frame[frame.len() - 2..], &EOI);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_reemits_latest_frame() {
        let sink = FrameSink::new(Bytes::from_static(b"blank"));
        let mut rx = sink.subscribe();
        let ticker = sink.spawn_ticker(10);

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"blank"));
        sink.push(Bytes::from_static(b"frame-1"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"frame-1"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"frame-1"));
        ticker.abort();
    }
}
