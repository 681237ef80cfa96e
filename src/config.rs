//! Daemon configuration
//!
//! Values come from an optional TOML file, then `NEST_RTSP_*` environment
//! overrides, then validation.

use crate::utils::error::{AppError, AppResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DB_PATH: &str = "persistent/nest-rtsp.sqlite";
const DEFAULT_RTSP_SERVER_PORT: u16 = 8554;
const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:3001";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_FFMPEG: &str = "ffmpeg";
const DEFAULT_STOP_GRACE_SECS: u64 = 10;
const DEFAULT_BRIDGE_FPS: u32 = 7;
const DEFAULT_BRIDGE_WIDTH: u32 = 1920;
const DEFAULT_BRIDGE_HEIGHT: u32 = 1080;
const DEFAULT_SHORT_BACKOFF_SECS: u64 = 5;
const DEFAULT_RATE_LIMIT_BACKOFF_SECS: u64 = 60;
const DEFAULT_MAX_RESTARTS: u32 = 3;
const DEFAULT_INTENTIONAL_EXIT_CODES: [i32; 1] = [255];
const DEFAULT_EXPIRY_MARGIN_SECS: u64 = 60;
const DEFAULT_CRASH_RESET_SECS: u64 = 300;
const DEFAULT_RENEWAL_PERIOD_SECS: u64 = 30;
const DEFAULT_STATUS_PERIOD_MS: u64 = 1_000;
const DEFAULT_SDM_API_BASE: &str = "https://smartdevicemanagement.googleapis.com/v1";

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    database: Option<DatabaseConfigFile>,
    rtsp: Option<RtspConfigFile>,
    control: Option<ControlConfigFile>,
    transcoder: Option<TranscoderConfigFile>,
    bridge: Option<BridgeConfigFile>,
    supervisor: Option<SupervisorConfigFile>,
    sweeps: Option<SweepConfigFile>,
    sdm: Option<SdmConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DatabaseConfigFile {
    path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct RtspConfigFile {
    server_port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
struct ControlConfigFile {
    addr: Option<String>,
    request_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TranscoderConfigFile {
    ffmpeg: Option<String>,
    stop_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct BridgeConfigFile {
    capture_command: Option<Vec<String>>,
    fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SupervisorConfigFile {
    short_backoff_secs: Option<u64>,
    rate_limit_backoff_secs: Option<u64>,
    max_restarts: Option<u32>,
    intentional_exit_codes: Option<Vec<i32>>,
    expiry_margin_secs: Option<u64>,
    crash_reset_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SweepConfigFile {
    renewal_period_secs: Option<u64>,
    status_period_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SdmConfigFile {
    api_base: Option<String>,
    enterprise_project_id: Option<String>,
}

/// Fully resolved daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub rtsp_server_port: u16,
    pub control: ControlSettings,
    pub transcoder: TranscoderSettings,
    pub bridge: BridgeSettings,
    pub supervisor: SupervisorSettings,
    pub sweeps: SweepSettings,
    pub sdm: SdmSettings,
}

#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub addr: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TranscoderSettings {
    pub ffmpeg: String,
    pub stop_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// External capture command; empty disables the fallback transport.
    pub capture_command: Vec<String>,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub short_backoff: Duration,
    pub rate_limit_backoff: Duration,
    pub max_restarts: u32,
    pub intentional_exit_codes: Vec<i32>,
    pub expiry_margin: Duration,
    pub crash_reset_after: Duration,
}

#[derive(Debug, Clone)]
pub struct SweepSettings {
    pub renewal_period: Duration,
    pub status_period: Duration,
}

#[derive(Debug, Clone)]
pub struct SdmSettings {
    pub api_base: String,
    pub enterprise_project_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        // Defaults never fail validation.
        Self::from_file(ConfigFile::default())
    }
}

impl Config {
    /// Load configuration from `path` (or `NEST_RTSP_CONFIG`), then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let env_path = std::env::var("NEST_RTSP_CONFIG").ok().map(PathBuf::from);
        let file_cfg = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Some(read_config_file(&path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse configuration from a TOML string without touching the environment.
    pub fn from_toml(raw: &str) -> AppResult<Self> {
        let file: ConfigFile =
            toml::from_str(raw).map_err(|e| AppError::Config(format!("invalid config: {}", e)))?;
        let cfg = Self::from_file(file);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ConfigFile) -> Self {
        let db_path = file
            .database
            .and_then(|db| db.path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));
        let rtsp_server_port = file
            .rtsp
            .and_then(|rtsp| rtsp.server_port)
            .unwrap_or(DEFAULT_RTSP_SERVER_PORT);

        let control = file.control.unwrap_or_default();
        let control = ControlSettings {
            addr: control
                .addr
                .unwrap_or_else(|| DEFAULT_CONTROL_ADDR.to_string()),
            request_timeout: Duration::from_millis(
                control
                    .request_timeout_ms
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
            ),
        };

        let transcoder = file.transcoder.unwrap_or_default();
        let transcoder = TranscoderSettings {
            ffmpeg: transcoder
                .ffmpeg
                .unwrap_or_else(|| DEFAULT_FFMPEG.to_string()),
            stop_grace: Duration::from_secs(
                transcoder.stop_grace_secs.unwrap_or(DEFAULT_STOP_GRACE_SECS),
            ),
        };

        let bridge = file.bridge.unwrap_or_default();
        let bridge = BridgeSettings {
            capture_command: bridge.capture_command.unwrap_or_default(),
            fps: bridge.fps.unwrap_or(DEFAULT_BRIDGE_FPS),
            width: bridge.width.unwrap_or(DEFAULT_BRIDGE_WIDTH),
            height: bridge.height.unwrap_or(DEFAULT_BRIDGE_HEIGHT),
        };

        let supervisor = file.supervisor.unwrap_or_default();
        let supervisor = SupervisorSettings {
            short_backoff: Duration::from_secs(
                supervisor
                    .short_backoff_secs
                    .unwrap_or(DEFAULT_SHORT_BACKOFF_SECS),
            ),
            rate_limit_backoff: Duration::from_secs(
                supervisor
                    .rate_limit_backoff_secs
                    .unwrap_or(DEFAULT_RATE_LIMIT_BACKOFF_SECS),
            ),
            max_restarts: supervisor.max_restarts.unwrap_or(DEFAULT_MAX_RESTARTS),
            intentional_exit_codes: supervisor
                .intentional_exit_codes
                .unwrap_or_else(|| DEFAULT_INTENTIONAL_EXIT_CODES.to_vec()),
            expiry_margin: Duration::from_secs(
                supervisor
                    .expiry_margin_secs
                    .unwrap_or(DEFAULT_EXPIRY_MARGIN_SECS),
            ),
            crash_reset_after: Duration::from_secs(
                supervisor.crash_reset_secs.unwrap_or(DEFAULT_CRASH_RESET_SECS),
            ),
        };

        let sweeps = file.sweeps.unwrap_or_default();
        let sweeps = SweepSettings {
            renewal_period: Duration::from_secs(
                sweeps
                    .renewal_period_secs
                    .unwrap_or(DEFAULT_RENEWAL_PERIOD_SECS),
            ),
            status_period: Duration::from_millis(
                sweeps.status_period_ms.unwrap_or(DEFAULT_STATUS_PERIOD_MS),
            ),
        };

        let sdm = file.sdm.unwrap_or_default();
        let sdm = SdmSettings {
            api_base: sdm
                .api_base
                .unwrap_or_else(|| DEFAULT_SDM_API_BASE.to_string()),
            enterprise_project_id: sdm.enterprise_project_id,
        };

        Self {
            db_path,
            rtsp_server_port,
            control,
            transcoder,
            bridge,
            supervisor,
            sweeps,
            sdm,
        }
    }

    fn apply_env(&mut self) -> AppResult<()> {
        if let Ok(path) = std::env::var("NEST_RTSP_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = PathBuf::from(path);
            }
        }
        if let Ok(addr) = std::env::var("NEST_RTSP_CONTROL_ADDR") {
            if !addr.trim().is_empty() {
                self.control.addr = addr;
            }
        }
        if let Ok(port) = std::env::var("NEST_RTSP_SERVER_PORT") {
            self.rtsp_server_port = port.trim().parse().map_err(|_| {
                AppError::Config("NEST_RTSP_SERVER_PORT must be a port number".to_string())
            })?;
        }
        if let Ok(ffmpeg) = std::env::var("NEST_RTSP_FFMPEG") {
            if !ffmpeg.trim().is_empty() {
                self.transcoder.ffmpeg = ffmpeg;
            }
        }
        if let Ok(project) = std::env::var("GA_SDM_PID") {
            if !project.trim().is_empty() {
                self.sdm.enterprise_project_id = Some(project);
            }
        }
        Ok(())
    }

    fn validate(&self) -> AppResult<()> {
        let policy = &self.supervisor;
        if policy.short_backoff.is_zero() {
            return Err(AppError::Config(
                "supervisor.short_backoff_secs must be greater than zero".to_string(),
            ));
        }
        if policy.rate_limit_backoff <= policy.short_backoff {
            return Err(AppError::Config(
                "supervisor.rate_limit_backoff_secs must be longer than short_backoff_secs"
                    .to_string(),
            ));
        }
        if self.sweeps.renewal_period >= policy.expiry_margin {
            return Err(AppError::Config(
                "sweeps.renewal_period_secs must be shorter than supervisor.expiry_margin_secs"
                    .to_string(),
            ));
        }
        if self.sweeps.status_period.is_zero() {
            return Err(AppError::Config(
                "sweeps.status_period_ms must be greater than zero".to_string(),
            ));
        }
        if self.bridge.fps == 0 {
            return Err(AppError::Config("bridge.fps must be greater than zero".to_string()));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> AppResult<ConfigFile> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        AppError::Config(format!("failed to read config file {}: {}", path.display(), e))
    })?;
    toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("invalid config file {}: {}", path.display(), e)))
}
