use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::info;

use crate::errors::{Result, TimelapseError};

const DEFAULT_VIDEO_FPS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub preview: PreviewConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_allow_origin: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_frames_directory")]
    pub frames_directory: PathBuf,
    #[serde(default = "default_output_directory")]
    pub output_directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_binary")]
    pub binary: String,
    #[serde(default = "default_rtsp_transport")]
    pub rtsp_transport: String,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_grab_timeout_secs")]
    pub grab_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewConfig {
    pub default_url: Option<String>,
    #[serde(default = "default_preview_framerate")]
    pub framerate: u32,
    #[serde(default = "default_preview_scale")]
    pub scale: String,        // -vf scale (e.g. "640:-1")
    #[serde(default = "default_preview_quality")]
    pub quality: u8,          // -q:v, 2-31, lower is better
    #[serde(default = "default_chunk_read_size")]
    pub chunk_read_size: usize,
    #[serde(default = "default_buffer_ceiling")]
    pub buffer_ceiling: usize,
    #[serde(default = "default_resync_window")]
    pub resync_window: usize,
}

fn default_frames_directory() -> PathBuf { PathBuf::from("frames") }
fn default_output_directory() -> PathBuf { PathBuf::from("output") }
fn default_engine_binary() -> String { "ffmpeg".to_string() }
fn default_rtsp_transport() -> String { "tcp".to_string() }
fn default_probe_timeout_secs() -> u64 { 10 }
fn default_grab_timeout_secs() -> u64 { 30 }
fn default_preview_framerate() -> u32 { 5 }
fn default_preview_scale() -> String { "640:-1".to_string() }
fn default_preview_quality() -> u8 { 3 }
fn default_chunk_read_size() -> usize { 4096 }
fn default_buffer_ceiling() -> usize { 1024 * 1024 } // 1MB
fn default_resync_window() -> usize { 4096 }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            frames_directory: default_frames_directory(),
            output_directory: default_output_directory(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: default_engine_binary(),
            rtsp_transport: default_rtsp_transport(),
            probe_timeout_secs: default_probe_timeout_secs(),
            grab_timeout_secs: default_grab_timeout_secs(),
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            default_url: None,
            framerate: default_preview_framerate(),
            scale: default_preview_scale(),
            quality: default_preview_quality(),
            chunk_read_size: default_chunk_read_size(),
            buffer_ceiling: default_buffer_ceiling(),
            resync_window: default_resync_window(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                cors_allow_origin: Some("*".to_string()),
            },
            storage: StorageConfig::default(),
            engine: EngineConfig::default(),
            preview: PreviewConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = if path.ends_with(".json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };

        if config.preview.resync_window >= config.preview.buffer_ceiling {
            return Err(TimelapseError::config(format!(
                "preview.resync_window ({}) must be smaller than preview.buffer_ceiling ({})",
                config.preview.resync_window, config.preview.buffer_ceiling
            )));
        }

        info!("Loaded configuration from {}", path);
        Ok(config)
    }
}

/// Output quality tier shared by frame grabs and video assembly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    High,
    #[default]
    Medium,
    Low,
}

impl Quality {
    /// libx264 constant rate factor; lower keeps more detail.
    pub fn crf(self) -> u8 {
        match self {
            Quality::High => 18,
            Quality::Medium => 23,
            Quality::Low => 28,
        }
    }

    /// JPEG q-scale for single frame grabs (2-31, lower is better).
    pub fn jpeg_qscale(self) -> u8 {
        match self {
            Quality::High => 2,
            Quality::Medium => 4,
            Quality::Low => 6,
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Quality::High => write!(f, "high"),
            Quality::Medium => write!(f, "medium"),
            Quality::Low => write!(f, "low"),
        }
    }
}

/// Per-session capture request, as posted by the web UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfig {
    #[serde(rename = "rtspUrl", alias = "url")]
    pub url: String,
    pub interval: i64,
    #[serde(default)]
    pub fps: i64,
    #[serde(default)]
    pub quality: Quality,
    #[serde(default)]
    pub cleanup_frames: bool,
}

impl CaptureConfig {
    pub fn new(url: impl Into<String>, interval: i64) -> Self {
        Self {
            url: url.into(),
            interval,
            fps: DEFAULT_VIDEO_FPS,
            quality: Quality::default(),
            cleanup_frames: false,
        }
    }

    /// Check the request and normalize defaults. Nothing is touched on failure.
    pub fn validate(mut self) -> Result<Self> {
        if self.url.trim().is_empty() {
            return Err(TimelapseError::invalid_config("RTSP URL is required"));
        }
        if self.interval < 1 {
            return Err(TimelapseError::invalid_config(format!(
                "Capture interval must be at least 1 second (got {})",
                self.interval
            )));
        }
        if self.fps <= 0 {
            self.fps = DEFAULT_VIDEO_FPS;
        }
        if u32::try_from(self.fps).is_err() {
            return Err(TimelapseError::invalid_config(format!(
                "Video fps out of range (got {})",
                self.fps
            )));
        }
        Ok(self)
    }
}
