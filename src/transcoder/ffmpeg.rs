//! FFmpeg transcoder
//!
//! Spawns one `ffmpeg` per feed that reads the upstream source and pushes it
//! to the local RTSP server over UDP.

use super::{ProcessExit, TranscodeError, TranscodeJob, TranscodeSource, Transcoder, TranscoderProcess};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

/// Transcoder backed by the `ffmpeg` binary
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    binary: String,
    server_port: u16,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<String>, server_port: u16) -> Self {
        Self {
            binary: binary.into(),
            server_port,
        }
    }

    /// Local RTSP publish URL for a mount path
    pub fn target_url(&self, mount_path: &str) -> String {
        format!("rtsp://127.0.0.1:{}{}", self.server_port, mount_path)
    }

    /// Full argument list (without the binary) for a job
    pub fn build_args(&self, job: &TranscodeJob) -> Vec<String> {
        let mut args: Vec<String> = ["-loglevel", "warning", "-re", "-avoid_negative_ts", "make_zero"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        if let TranscodeSource::Bridged(_) = job.source {
            // Low-latency input flags for the MJPEG feed
            args.extend(
                [
                    "-fflags",
                    "nobuffer",
                    "-flags",
                    "low_delay",
                    "-strict",
                    "experimental",
                    "-fflags",
                    "+genpts+discardcorrupt",
                    "-use_wallclock_as_timestamps",
                    "1",
                ]
                .iter()
                .map(|s| s.to_string()),
            );
        }

        args.push("-i".to_string());
        args.push(job.source.url().to_string());

        args.extend(
            [
                "-f",
                "rtsp",
                "-hide_banner",
                "-avoid_negative_ts",
                "make_zero",
                "-fflags",
                "+genpts+discardcorrupt",
                "-rtsp_transport",
                "udp",
                "-use_wallclock_as_timestamps",
                "1",
                "-vsync",
                "0",
                "-enc_time_base",
                "-1",
                "-err_detect",
                "ignore_err",
            ]
            .iter()
            .map(|s| s.to_string()),
        );

        match job.source {
            TranscodeSource::Primary(_) => {
                args.extend(["-c", "copy"].iter().map(|s| s.to_string()));
            }
            TranscodeSource::Bridged(_) => {
                args.extend(["-c:v", "libx264", "-an"].iter().map(|s| s.to_string()));
            }
        }

        args.push(self.target_url(&job.mount_path));
        args
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn spawn(&self, job: &TranscodeJob) -> Result<Box<dyn TranscoderProcess>, TranscodeError> {
        let args = self.build_args(job);
        tracing::debug!("Starting {} for {}: {:?}", self.binary, job.feed_id, args);

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TranscodeError::Spawn(format!("{}: {}", self.binary, e)))?;

        if let Some(stderr) = child.stderr.take() {
            let feed_id = job.feed_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(feed = %feed_id, "ffmpeg: {}", line);
                }
            });
        }

        let pid = child.id();
        tracing::info!("Transcoder for {} started with pid {:?}", job.feed_id, pid);
        Ok(Box::new(FfmpegProcess { child, pid }))
    }
}

struct FfmpegProcess {
    child: Child,
    pid: Option<u32>,
}

#[async_trait]
impl TranscoderProcess for FfmpegProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&mut self) -> Result<ProcessExit, TranscodeError> {
        let status = self.child.wait().await?;
        Ok(ProcessExit {
            code: status.code(),
        })
    }

    fn interrupt(&mut self) -> Result<(), TranscodeError> {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SAFETY: plain signal delivery to a child we spawned.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
            if rc == 0 {
                return Ok(());
            }
            return Err(TranscodeError::Signal(std::io::Error::last_os_error().to_string()));
        }
        self.kill()
    }

    fn kill(&mut self) -> Result<(), TranscodeError> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already reaped
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(TranscodeError::Signal(e.to_string())),
        }
    }
}
