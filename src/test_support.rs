use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::config::Quality;
use crate::engine::{LiveStream, MediaEngine};
use crate::errors::{Result, TimelapseError};

/// Encode a small solid-colour JPEG.
pub fn test_jpeg(width: u32, height: u32, shade: u8) -> Vec<u8> {
    use image::{ImageBuffer, Rgb};

    let img = ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([shade, (x % 256) as u8, (y % 256) as u8])
    });
    let mut jpeg_data = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg_data, 80);
    img.write_with_encoder(encoder).expect("Failed to encode JPEG");
    jpeg_data
}

/// Write an executable stand-in for ffmpeg into `dir`. It answers the
/// version check and connectivity probes, and hangs on everything else.
#[cfg(unix)]
pub fn stalling_engine_script(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("stalling-ffmpeg");
    std::fs::write(
        &path,
        "#!/bin/sh\nfor arg in \"$@\"; do\n  case \"$arg\" in\n    -version|null) exit 0 ;;\n  esac\ndone\nexec sleep 1000\n",
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{}_{}", prefix, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssembleCall {
    pub frame_pattern: PathBuf,
    pub output_path: PathBuf,
    pub fps: u32,
    pub quality: Quality,
}

/// In-process media engine for unit tests.
#[derive(Default)]
pub struct FakeEngine {
    pub unavailable: AtomicBool,
    pub probe_fails: AtomicBool,
    pub probe_hangs: AtomicBool,
    pub assemble_fails: AtomicBool,
    /// Grabs write a truncated file and never return.
    pub grab_hangs: AtomicBool,
    /// Number of upcoming grabs that fail.
    pub failing_grabs: AtomicUsize,
    pub probes: AtomicUsize,
    pub grabs: Mutex<Vec<(PathBuf, bool)>>,
    pub assembled: Mutex<Vec<AssembleCall>>,
    live: Mutex<Option<Box<dyn AsyncRead + Send + Unpin>>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_live_stream(&self, reader: impl AsyncRead + Send + Unpin + 'static) {
        *self.live.lock().unwrap() = Some(Box::new(reader));
    }

    pub fn successful_grabs(&self) -> Vec<PathBuf> {
        self.grabs
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, ok)| *ok)
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub fn grab_attempts(&self) -> Vec<PathBuf> {
        self.grabs.lock().unwrap().iter().map(|(path, _)| path.clone()).collect()
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    async fn grab_one_frame(&self, _source_url: &str, output_path: &Path, quality: Quality) -> Result<()> {
        let fail = self
            .failing_grabs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if self.grab_hangs.load(Ordering::SeqCst) {
            self.grabs.lock().unwrap().push((output_path.to_path_buf(), false));
            tokio::fs::write(output_path, b"\xFF\xD8partial").await?;
            std::future::pending::<()>().await;
        }
        self.grabs.lock().unwrap().push((output_path.to_path_buf(), !fail));
        if fail {
            return Err(TimelapseError::grab_failed("connection reset by peer"));
        }
        tokio::fs::write(output_path, test_jpeg(8, 8, quality.jpeg_qscale())).await?;
        Ok(())
    }

    async fn probe_connectivity(&self, source_url: &str, timeout: Duration) -> Result<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.probe_hangs.load(Ordering::SeqCst) {
            tokio::time::sleep(timeout).await;
            return Err(TimelapseError::source_unreachable(format!("no frame from {}", source_url)));
        }
        if self.probe_fails.load(Ordering::SeqCst) {
            return Err(TimelapseError::source_unreachable(format!("connection refused: {}", source_url)));
        }
        Ok(())
    }

    async fn assemble_video(&self, frame_pattern: &Path, output_path: &Path, fps: u32, quality: Quality) -> Result<()> {
        self.assembled.lock().unwrap().push(AssembleCall {
            frame_pattern: frame_pattern.to_path_buf(),
            output_path: output_path.to_path_buf(),
            fps,
            quality,
        });
        if self.assemble_fails.load(Ordering::SeqCst) {
            return Err(TimelapseError::assembly_failed("encoder exited with 1"));
        }
        tokio::fs::write(output_path, b"fake mp4").await?;
        Ok(())
    }

    async fn open_live_stream(&self, _source_url: &str, _target_fps: u32, _target_scale: &str, _jpeg_quality: u8) -> Result<LiveStream> {
        let reader = self
            .live
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| TimelapseError::engine("no live stream configured"))?;
        Ok(LiveStream { reader, process: None })
    }
}
