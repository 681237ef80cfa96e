//! Daemon wiring
//!
//! Builds every collaborator from [`Config`], restores the feeds that were
//! running at the last snapshot and serves the control socket until shutdown.

use crate::bridge::{CaptureBridge, CommandCaptureEngine, LocalCaptureBridge};
use crate::commands::{feed, CommandBus, CommandContext};
use crate::config::Config;
use crate::feed::SupervisorDeps;
use crate::grant::{GrantProvider, SdmGrantProvider};
use crate::mount::MountTable;
use crate::notify::{spawn_forwarder, MqttNotifier, StatusNotifier};
use crate::registry::FeedRegistry;
use crate::server::ControlServer;
use crate::settings::{SettingsStore, SqliteSettingsStore};
use crate::sweep::{RenewalSweep, StatusBroadcast, StatusSweep};
use crate::transcoder::FfmpegTranscoder;
use crate::utils::AppResult;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const STATUS_CHANNEL_CAPACITY: usize = 64;

pub struct App {
    ctx: Arc<CommandContext>,
    server: ControlServer,
    tasks: Vec<JoinHandle<()>>,
}

impl App {
    /// Construct the daemon and start its background sweeps
    pub async fn build(config: Config) -> AppResult<Self> {
        tracing::info!("Starting nest-rtsp v{}", env!("CARGO_PKG_VERSION"));

        let settings: Arc<dyn SettingsStore> = Arc::new(SqliteSettingsStore::open(&config.db_path)?);
        tracing::info!("Settings database at {}", config.db_path.display());

        let grants: Arc<dyn GrantProvider> = Arc::new(SdmGrantProvider::new(&config.sdm, settings.clone())?);
        let transcoder = Arc::new(FfmpegTranscoder::new(
            config.transcoder.ffmpeg.clone(),
            config.rtsp_server_port,
        ));
        let bridge: Option<Arc<dyn CaptureBridge>> = if config.bridge.capture_command.is_empty() {
            tracing::info!("No capture command configured, fallback transport disabled");
            None
        } else {
            let engine = Arc::new(CommandCaptureEngine::new(config.bridge.capture_command.clone()));
            Some(Arc::new(LocalCaptureBridge::new(engine, config.bridge.clone())))
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let registry = Arc::new(FeedRegistry::new(SupervisorDeps {
            grants: grants.clone(),
            transcoder,
            bridge,
            mounts: Arc::new(MountTable::new()),
            events: events.clone(),
            settings: config.supervisor.clone(),
            stop_grace: config.transcoder.stop_grace,
        }));

        let mqtt = MqttNotifier::new();
        tracing::debug!("MQTT client id {}", mqtt.client_id());
        let notifier: Arc<dyn StatusNotifier> = Arc::new(mqtt);
        notifier.reconfigure(&settings.load().await?.mqtt_settings).await;

        let refresh = Arc::new(Notify::new());
        let (status, _) = broadcast::channel::<StatusBroadcast>(STATUS_CHANNEL_CAPACITY);

        let tasks = vec![
            spawn_forwarder(events.subscribe(), notifier.clone()),
            StatusSweep::new(registry.clone(), settings.clone(), status.clone(), refresh.clone())
                .spawn(config.sweeps.status_period, events.subscribe()),
            RenewalSweep::new(registry.clone(), config.supervisor.expiry_margin)
                .spawn(config.sweeps.renewal_period),
        ];

        let ctx = Arc::new(CommandContext {
            registry,
            settings,
            grants,
            notifier,
            refresh,
        });
        let bus = CommandBus::new(ctx.clone(), config.control.request_timeout);
        let server = ControlServer::bind(&config.control.addr, bus, status).await?;

        Ok(Self { ctx, server, tasks })
    }

    pub fn control_addr(&self) -> AppResult<SocketAddr> {
        self.server.local_addr()
    }

    /// Restore the snapshot, serve until `shutdown`, then stop every feed.
    pub async fn run_until<F>(self, shutdown: F) -> AppResult<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let restore_ctx = self.ctx.clone();
        let restore = tokio::spawn(async move {
            match feed::restore_snapshot(&restore_ctx).await {
                Ok(count) => tracing::info!("Restored {} feed(s) from snapshot", count),
                Err(e) => tracing::error!("Snapshot restore failed: {}", e),
            }
        });

        self.server.run_until(shutdown).await;

        restore.abort();
        tracing::info!("Stopping {} feed(s)", self.ctx.registry.len());
        feed::stop_all(&self.ctx).await;
        for task in &self.tasks {
            task.abort();
        }
        Ok(())
    }
}
