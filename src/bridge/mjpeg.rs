//! Loopback motion-JPEG HTTP server
//!
//! Serves a [`FrameSink`] as `multipart/x-mixed-replace` so the transcoder can
//! read it like any other HTTP source.

use super::frames::FrameSink;
use super::BridgeError;
use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::{BufMut, Bytes, BytesMut};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

const BOUNDARY: &str = "mjpegframe";
const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=mjpegframe";
const CLIENT_QUEUE: usize = 4;

#[derive(Clone)]
struct MjpegState {
    sink: FrameSink,
    shutdown: watch::Receiver<bool>,
}

/// A running MJPEG server bound to an ephemeral loopback port
pub struct MjpegServer {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    serve_task: JoinHandle<()>,
}

impl MjpegServer {
    /// Bind to `127.0.0.1:0` and start serving `sink`
    pub async fn start(sink: FrameSink) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let app = Router::new()
            .route("/", get(stream_frames))
            .with_state(MjpegState {
                sink,
                shutdown: shutdown_rx.clone(),
            });

        let serve_task = tokio::spawn(async move {
            let mut signal = shutdown_rx;
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = signal.wait_for(|stopped| *stopped).await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "MJPEG server error");
            }
        });

        tracing::debug!(addr = %addr, "MJPEG server listening");
        Ok(Self {
            addr,
            shutdown,
            serve_task,
        })
    }

    /// URL the transcoder should read from
    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting clients and end every open stream
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

impl Drop for MjpegServer {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        if !self.serve_task.is_finished() {
            tracing::debug!(addr = %self.addr, "MJPEG server draining clients");
        }
    }
}

/// GET / - the latest frame immediately, then every frame the sink emits
async fn stream_frames(State(state): State<MjpegState>) -> impl IntoResponse {
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(CLIENT_QUEUE);
    let MjpegState { sink, mut shutdown } = state;

    tokio::spawn(async move {
        let mut frames = sink.subscribe();
        if tx.send(Ok(part(&sink.latest()))).await.is_err() {
            return;
        }
        loop {
            let frame = tokio::select! {
                _ = shutdown.wait_for(|stopped| *stopped) => break,
                frame = frames.recv() => frame,
            };
            match frame {
                Ok(frame) => {
                    if tx.send(Ok(part(&frame))).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    (
        [
            (header::CONTENT_TYPE, CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store"),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
}

/// One multipart section carrying `frame`
fn part(frame: &[u8]) -> Bytes {
    let head = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        frame.len()
    );
    let mut buf = BytesMut::with_capacity(head.len() + frame.len() + 2);
    buf.put_slice(head.as_bytes());
    buf.put_slice(frame);
    buf.put_slice(b"\r\n");
    buf.freeze()
}
