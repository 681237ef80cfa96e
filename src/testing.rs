//! In-crate fakes for unit tests

use crate::bridge::{BridgeError, BridgeSession, CaptureBridge};
use crate::config::Config;
use crate::feed::SupervisorDeps;
use crate::grant::{Capabilities, GrantError, GrantExtension, GrantPayload, GrantProvider};
use crate::mount::MountTable;
use crate::transcoder::{ProcessExit, TranscodeError, TranscodeJob, Transcoder, TranscoderProcess};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

pub fn valid_payload() -> GrantPayload {
    GrantPayload {
        media_url: Some("rtsps://upstream.example/live?auth=token".to_string()),
        expires_at: Some(Utc::now() + ChronoDuration::minutes(5)),
        continuation_token: Some("ext-token".to_string()),
    }
}

pub struct FakeGrants {
    pub capabilities: Mutex<Result<Capabilities, GrantError>>,
    pub generate_queue: Mutex<VecDeque<Result<GrantPayload, GrantError>>>,
    pub extend_queue: Mutex<VecDeque<Result<GrantExtension, GrantError>>>,
    pub generate_calls: Mutex<Vec<String>>,
    pub extend_calls: Mutex<Vec<String>>,
    pub revoke_calls: Mutex<Vec<String>>,
    hold: AtomicBool,
    held_extends: Mutex<HashSet<String>>,
}

impl FakeGrants {
    pub fn with_capabilities(supports_primary: bool, supports_fallback: bool) -> Self {
        Self {
            capabilities: Mutex::new(Ok(Capabilities {
                supports_primary,
                supports_fallback,
            })),
            generate_queue: Mutex::new(VecDeque::new()),
            extend_queue: Mutex::new(VecDeque::new()),
            generate_calls: Mutex::new(Vec::new()),
            extend_calls: Mutex::new(Vec::new()),
            revoke_calls: Mutex::new(Vec::new()),
            hold: AtomicBool::new(false),
            held_extends: Mutex::new(HashSet::new()),
        }
    }

    pub fn primary() -> Self {
        Self::with_capabilities(true, false)
    }

    pub fn queue_generate(&self, result: Result<GrantPayload, GrantError>) {
        self.generate_queue.lock().push_back(result);
    }

    pub fn queue_extend(&self, result: Result<GrantExtension, GrantError>) {
        self.extend_queue.lock().push_back(result);
    }

    /// Make every later generate call hang
    pub fn hold_generate(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    /// Make every later extend call for `camera_id` hang
    pub fn hold_extend_for(&self, camera_id: &str) {
        self.held_extends.lock().insert(camera_id.to_string());
    }

    pub fn generate_count(&self) -> usize {
        self.generate_calls.lock().len()
    }
}

#[async_trait]
impl GrantProvider for FakeGrants {
    async fn capabilities(&self, _camera_id: &str) -> Result<Capabilities, GrantError> {
        self.capabilities.lock().clone()
    }

    async fn generate(&self, camera_id: &str) -> Result<GrantPayload, GrantError> {
        self.generate_calls.lock().push(camera_id.to_string());
        if self.hold.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        self.generate_queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(valid_payload()))
    }

    async fn extend(&self, camera_id: &str, token: &str) -> Result<GrantExtension, GrantError> {
        self.extend_calls.lock().push(token.to_string());
        let held = self.held_extends.lock().contains(camera_id);
        if held {
            return std::future::pending().await;
        }
        self.extend_queue.lock().pop_front().unwrap_or_else(|| {
            Ok(GrantExtension {
                expires_at: Some(Utc::now() + ChronoDuration::minutes(10)),
                continuation_token: Some("ext-token-2".to_string()),
            })
        })
    }

    async fn revoke(&self, _camera_id: &str, token: &str) -> Result<(), GrantError> {
        self.revoke_calls.lock().push(token.to_string());
        Ok(())
    }
}

/// Transcoder whose processes run until told to exit
#[derive(Default)]
pub struct FakeTranscoder {
    pub jobs: Mutex<Vec<TranscodeJob>>,
    exits: Mutex<Vec<watch::Sender<Option<Option<i32>>>>>,
    next_pid: AtomicU32,
    pub fail_spawn: AtomicBool,
}

impl FakeTranscoder {
    pub fn spawn_count(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Processes that have not exited yet
    pub fn live_count(&self) -> usize {
        self.exits
            .lock()
            .iter()
            .filter(|exit| exit.borrow().is_none())
            .count()
    }

    /// Make the most recent process exit with `code`
    pub fn exit_latest(&self, code: Option<i32>) {
        if let Some(exit) = self.exits.lock().last() {
            exit.send_replace(Some(code));
        }
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn spawn(&self, job: &TranscodeJob) -> Result<Box<dyn TranscoderProcess>, TranscodeError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(TranscodeError::Spawn("fake spawn failure".to_string()));
        }
        self.jobs.lock().push(job.clone());
        let (tx, rx) = watch::channel(None);
        self.exits.lock().push(tx.clone());
        let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeProcess { pid, exit: tx, rx }))
    }
}

struct FakeProcess {
    pid: u32,
    exit: watch::Sender<Option<Option<i32>>>,
    rx: watch::Receiver<Option<Option<i32>>>,
}

#[async_trait]
impl TranscoderProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> Result<ProcessExit, TranscodeError> {
        loop {
            if let Some(code) = *self.rx.borrow() {
                return Ok(ProcessExit { code });
            }
            if self.rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    fn interrupt(&mut self) -> Result<(), TranscodeError> {
        // ffmpeg exits with 255 on SIGINT
        self.exit.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(Some(255));
                true
            } else {
                false
            }
        });
        Ok(())
    }

    fn kill(&mut self) -> Result<(), TranscodeError> {
        self.exit.send_replace(Some(None));
        Ok(())
    }
}

/// Bridge whose sessions stay alive until closed or failed
#[derive(Default)]
pub struct FakeBridge {
    pub opened: Mutex<Vec<String>>,
    pub closed: Arc<AtomicU32>,
    alive: Mutex<Vec<watch::Sender<bool>>>,
}

impl FakeBridge {
    /// Simulate the capture engine dying for the latest session
    pub fn fail_latest(&self) {
        if let Some(alive) = self.alive.lock().last() {
            alive.send_replace(false);
        }
    }
}

#[async_trait]
impl CaptureBridge for FakeBridge {
    async fn open(&self, feed_id: &str) -> Result<Box<dyn BridgeSession>, BridgeError> {
        self.opened.lock().push(feed_id.to_string());
        let (tx, _) = watch::channel(true);
        self.alive.lock().push(tx.clone());
        Ok(Box::new(FakeSession {
            url: format!("http://127.0.0.1:9/{}", feed_id),
            alive: tx,
            closed: self.closed.clone(),
        }))
    }
}

struct FakeSession {
    url: String,
    alive: watch::Sender<bool>,
    closed: Arc<AtomicU32>,
}

#[async_trait]
impl BridgeSession for FakeSession {
    fn sink_url(&self) -> String {
        self.url.clone()
    }

    fn liveness(&self) -> watch::Receiver<bool> {
        self.alive.subscribe()
    }

    async fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn deps(
    grants: Arc<FakeGrants>,
    transcoder: Arc<FakeTranscoder>,
    bridge: Option<Arc<FakeBridge>>,
) -> SupervisorDeps {
    let (events, _) = broadcast::channel(64);
    SupervisorDeps {
        grants,
        transcoder,
        bridge: bridge.map(|bridge| bridge as Arc<dyn CaptureBridge>),
        mounts: Arc::new(MountTable::new()),
        events,
        settings: Config::default().supervisor,
        stop_grace: Duration::from_secs(1),
    }
}

pub fn idle_deps() -> SupervisorDeps {
    deps(
        Arc::new(FakeGrants::primary()),
        Arc::new(FakeTranscoder::default()),
        None,
    )
}
