use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, Quality};
use crate::errors::{Result, TimelapseError};
use crate::process::{EngineProcess, ProcessRegistry};
use crate::utils::redact_url;

/// Continuous motion-JPEG output of a live transcode.
pub struct LiveStream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Owning guard of the producing process; `None` for in-process sources.
    pub process: Option<EngineProcess>,
}

/// Operations the capture core needs from the external media engine.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn available(&self) -> bool;

    async fn grab_one_frame(&self, source_url: &str, output_path: &Path, quality: Quality) -> Result<()>;

    async fn probe_connectivity(&self, source_url: &str, timeout: Duration) -> Result<()>;

    async fn assemble_video(&self, frame_pattern: &Path, output_path: &Path, fps: u32, quality: Quality) -> Result<()>;

    async fn open_live_stream(&self, source_url: &str, target_fps: u32, target_scale: &str, jpeg_quality: u8) -> Result<LiveStream>;
}

/// Registry label of single-frame grab processes.
pub const GRAB_LABEL: &str = "ffmpeg-grab";

pub struct FfmpegEngine {
    config: EngineConfig,
    registry: ProcessRegistry,
}

impl FfmpegEngine {
    pub fn new(config: EngineConfig, registry: ProcessRegistry) -> Self {
        Self { config, registry }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin"]);
        cmd
    }

    fn input_args<'a>(&'a self, source_url: &'a str) -> Vec<&'a str> {
        if source_url.starts_with("rtsp://") || source_url.starts_with("rtsps://") {
            vec!["-rtsp_transport", &self.config.rtsp_transport, "-i", source_url]
        } else {
            vec!["-i", source_url]
        }
    }

    /// Run one engine command to completion. With a `limit`, the process is
    /// killed and reaped once it runs longer than that.
    async fn run(&self, cmd: &mut Command, label: &str, limit: Option<Duration>) -> Result<()> {
        cmd.stdout(Stdio::null()).stderr(Stdio::piped());
        let mut process = EngineProcess::spawn(cmd, label, &self.registry)?;
        process.capture_stderr();

        if let Some(limit) = limit {
            let waited = tokio::time::timeout(limit, process.wait()).await;
            match waited {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    process.terminate().await;
                    return Err(TimelapseError::engine(format!(
                        "{} did not finish within {:?}",
                        label, limit
                    )));
                }
            }
        }

        let (status, stderr) = process.finish().await?;
        if !status.success() {
            return Err(TimelapseError::engine(format!(
                "{} exited with {}: {}",
                label,
                status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaEngine for FfmpegEngine {
    async fn available(&self) -> bool {
        let status = Command::new(&self.config.binary)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) if status.success() => true,
            Ok(status) => {
                warn!("'{} -version' exited with {}", self.config.binary, status);
                false
            }
            Err(e) => {
                warn!("'{}' is not installed or not in PATH: {}", self.config.binary, e);
                false
            }
        }
    }

    async fn grab_one_frame(&self, source_url: &str, output_path: &Path, quality: Quality) -> Result<()> {
        let qscale = quality.jpeg_qscale().to_string();
        let output = output_path.to_string_lossy();

        let mut cmd = self.command();
        cmd.args(self.input_args(source_url));
        cmd.args(["-frames:v", "1", "-q:v", &qscale, "-y", output.as_ref()]);

        let limit = Duration::from_secs(self.config.grab_timeout_secs);
        if let Err(e) = self.run(&mut cmd, GRAB_LABEL, Some(limit)).await {
            // A killed grab can leave a truncated JPEG behind.
            if let Err(remove_err) = tokio::fs::remove_file(output_path).await {
                if remove_err.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove partial frame {}: {}", output_path.display(), remove_err);
                }
            }
            return Err(TimelapseError::grab_failed(e.to_string()));
        }
        Ok(())
    }

    async fn probe_connectivity(&self, source_url: &str, timeout: Duration) -> Result<()> {
        info!("Probing {} (timeout {:?})", redact_url(source_url), timeout);

        let mut cmd = self.command();
        cmd.args(self.input_args(source_url));
        cmd.args(["-frames:v", "1", "-f", "null", "-"]);
        cmd.stdout(Stdio::null()).stderr(Stdio::piped());

        let mut process = EngineProcess::spawn(&mut cmd, "ffmpeg-probe", &self.registry)?;
        process.capture_stderr();

        let waited = tokio::time::timeout(timeout, process.wait()).await;
        match waited {
            Ok(Ok(status)) if status.success() => {
                process.terminate().await;
                debug!("Probe of {} succeeded", redact_url(source_url));
                Ok(())
            }
            Ok(Ok(status)) => {
                let stderr = process.finish().await.map(|(_, stderr)| stderr).unwrap_or_default();
                Err(TimelapseError::source_unreachable(format!(
                    "cannot read a frame from {} ({}): {}",
                    redact_url(source_url),
                    status,
                    stderr.trim()
                )))
            }
            Ok(Err(e)) => {
                process.terminate().await;
                Err(TimelapseError::source_unreachable(e.to_string()))
            }
            Err(_) => {
                error!("Timeout probing {} ({:?})", redact_url(source_url), timeout);
                process.terminate().await;
                Err(TimelapseError::source_unreachable(format!(
                    "no frame from {} within {} seconds",
                    redact_url(source_url),
                    timeout.as_secs()
                )))
            }
        }
    }

    async fn assemble_video(&self, frame_pattern: &Path, output_path: &Path, fps: u32, quality: Quality) -> Result<()> {
        let fps = fps.to_string();
        let crf = quality.crf().to_string();
        let pattern = frame_pattern.to_string_lossy();
        let output = output_path.to_string_lossy();

        let mut cmd = self.command();
        cmd.args([
            "-framerate", &fps,
            "-start_number", "0",
            "-i", pattern.as_ref(),
            "-c:v", "libx264",
            "-pix_fmt", "yuv420p",
            "-crf", &crf,
            "-y",
            output.as_ref(),
        ]);

        self.run(&mut cmd, "ffmpeg-assemble", None)
            .await
            .map_err(|e| TimelapseError::assembly_failed(e.to_string()))
    }

    async fn open_live_stream(&self, source_url: &str, target_fps: u32, target_scale: &str, jpeg_quality: u8) -> Result<LiveStream> {
        let fps = target_fps.to_string();
        let quality = jpeg_quality.to_string();
        let scale = format!("scale={}", target_scale);

        let mut cmd = self.command();
        cmd.args(self.input_args(source_url));
        cmd.args([
            "-f", "mjpeg",
            "-q:v", &quality,
            "-r", &fps,
            "-vf", &scale,
            "-an",
            "-",
        ]);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut process = EngineProcess::spawn(&mut cmd, "ffmpeg-preview", &self.registry)?;
        process.log_stderr();
        let stdout = process
            .take_stdout()
            .ok_or_else(|| TimelapseError::engine("Failed to get FFmpeg stdout"))?;

        info!(
            "Live preview started for {} ({} fps, scale {})",
            redact_url(source_url),
            target_fps,
            target_scale
        );

        Ok(LiveStream {
            reader: Box::new(stdout),
            process: Some(process),
        })
    }
}
