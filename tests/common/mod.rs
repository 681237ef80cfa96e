#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch, Notify};

use nest_rtsp::commands::{CommandBus, CommandContext};
use nest_rtsp::feed::SupervisorDeps;
use nest_rtsp::grant::{Capabilities, GrantError, GrantExtension, GrantPayload, GrantProvider};
use nest_rtsp::mount::MountTable;
use nest_rtsp::notify::NoopNotifier;
use nest_rtsp::registry::FeedRegistry;
use nest_rtsp::settings::SqliteSettingsStore;
use nest_rtsp::transcoder::{ProcessExit, TranscodeError, TranscodeJob, Transcoder, TranscoderProcess};
use nest_rtsp::Config;

/// Upstream that grants every camera a five minute primary stream
#[derive(Default)]
pub struct StaticGrants {
    pub generated: Mutex<Vec<String>>,
    pub revoked: Mutex<Vec<String>>,
}

#[async_trait]
impl GrantProvider for StaticGrants {
    async fn capabilities(&self, _camera_id: &str) -> Result<Capabilities, GrantError> {
        Ok(Capabilities {
            supports_primary: true,
            supports_fallback: false,
        })
    }

    async fn generate(&self, camera_id: &str) -> Result<GrantPayload, GrantError> {
        self.generated.lock().push(camera_id.to_string());
        Ok(GrantPayload {
            media_url: Some(format!("rtsps://upstream.example/{}?auth=abc", camera_id)),
            expires_at: Some(Utc::now() + chrono::Duration::minutes(5)),
            continuation_token: Some(format!("{}-token", camera_id)),
        })
    }

    async fn extend(&self, _camera_id: &str, token: &str) -> Result<GrantExtension, GrantError> {
        Ok(GrantExtension {
            expires_at: Some(Utc::now() + chrono::Duration::minutes(5)),
            continuation_token: Some(token.to_string()),
        })
    }

    async fn revoke(&self, _camera_id: &str, token: &str) -> Result<(), GrantError> {
        self.revoked.lock().push(token.to_string());
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<Value>, GrantError> {
        Ok(vec![json!({ "name": "enterprises/p/devices/cam-1" })])
    }
}

/// Transcoder whose processes run until interrupted
#[derive(Default)]
pub struct IdleTranscoder {
    next_pid: AtomicU32,
    pub jobs: Mutex<Vec<TranscodeJob>>,
}

#[async_trait]
impl Transcoder for IdleTranscoder {
    async fn spawn(&self, job: &TranscodeJob) -> Result<Box<dyn TranscoderProcess>, TranscodeError> {
        self.jobs.lock().push(job.clone());
        let (exit, _) = watch::channel(None);
        Ok(Box::new(IdleProcess {
            pid: 4000 + self.next_pid.fetch_add(1, Ordering::SeqCst),
            exit,
        }))
    }
}

struct IdleProcess {
    pid: u32,
    exit: watch::Sender<Option<i32>>,
}

#[async_trait]
impl TranscoderProcess for IdleProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> Result<ProcessExit, TranscodeError> {
        let mut rx = self.exit.subscribe();
        let code = *rx.wait_for(Option::is_some).await.map_err(|_| {
            TranscodeError::Spawn("exit channel closed".to_string())
        })?;
        Ok(ProcessExit { code })
    }

    fn interrupt(&mut self) -> Result<(), TranscodeError> {
        self.exit.send_replace(Some(255));
        Ok(())
    }

    fn kill(&mut self) -> Result<(), TranscodeError> {
        self.exit.send_replace(Some(137));
        Ok(())
    }
}

pub struct Harness {
    pub bus: CommandBus,
    pub ctx: Arc<CommandContext>,
    pub settings: Arc<SqliteSettingsStore>,
    pub grants: Arc<StaticGrants>,
    pub transcoder: Arc<IdleTranscoder>,
}

pub fn harness_with(settings: SqliteSettingsStore) -> Harness {
    let settings = Arc::new(settings);
    let grants = Arc::new(StaticGrants::default());
    let transcoder = Arc::new(IdleTranscoder::default());
    let (events, _) = broadcast::channel(64);

    let registry = Arc::new(FeedRegistry::new(SupervisorDeps {
        grants: grants.clone(),
        transcoder: transcoder.clone(),
        bridge: None,
        mounts: Arc::new(MountTable::new()),
        events,
        settings: Config::default().supervisor,
        stop_grace: Duration::from_secs(1),
    }));

    let ctx = Arc::new(CommandContext {
        registry,
        settings: settings.clone(),
        grants: grants.clone(),
        notifier: Arc::new(NoopNotifier),
        refresh: Arc::new(Notify::new()),
    });

    Harness {
        bus: CommandBus::new(ctx.clone(), Duration::from_secs(10)),
        ctx,
        settings,
        grants,
        transcoder,
    }
}

pub fn harness() -> Harness {
    harness_with(SqliteSettingsStore::open_in_memory().expect("in-memory settings"))
}
