use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::engine::MediaEngine;
use crate::errors::{Result, TimelapseError};
use crate::session::SessionSnapshot;
use crate::utils::{format_elapsed, reserve_unique_file, timestamp_slug};

const FRAME_PREFIX: &str = "frame_";
const FRAME_EXTENSION: &str = ".jpg";
/// printf-style input pattern understood by the engine's image2 demuxer.
pub const FRAME_PATTERN: &str = "frame_%05d.jpg";

pub fn frame_file_name(sequence: u64) -> String {
    format!("{}{:05}{}", FRAME_PREFIX, sequence, FRAME_EXTENSION)
}

fn is_frame_file(name: &str) -> bool {
    name.starts_with(FRAME_PREFIX) && name.ends_with(FRAME_EXTENSION)
}

#[derive(Clone)]
pub struct VideoAssembler {
    engine: Arc<dyn MediaEngine>,
    output_dir: PathBuf,
}

impl VideoAssembler {
    pub fn new(engine: Arc<dyn MediaEngine>, output_dir: PathBuf) -> Self {
        Self { engine, output_dir }
    }

    /// Encode the session's frames into one video. Frames are purged
    /// afterwards only if the session asked for it and encoding succeeded.
    pub async fn assemble(&self, snapshot: &SessionSnapshot) -> Result<PathBuf> {
        info!("Generating timelapse video from {}", snapshot.frames_dir.display());

        if snapshot.frame_count == 0 {
            return Err(TimelapseError::assembly_failed("no frames were captured"));
        }
        let frames = list_frame_files(&snapshot.frames_dir).await?;
        if frames.is_empty() {
            return Err(TimelapseError::assembly_failed(format!(
                "no frame files found in {}",
                snapshot.frames_dir.display()
            )));
        }

        let fps = u32::try_from(snapshot.config.fps).map_err(|_| {
            TimelapseError::invalid_config(format!("Video fps out of range (got {})", snapshot.config.fps))
        })?;

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let stem = format!("timelapse_{}", timestamp_slug(&snapshot.start_time));
        let output = reserve_unique_file(&self.output_dir, &stem, "mp4")?;

        let pattern = snapshot.frames_dir.join(FRAME_PATTERN);
        if let Err(e) = self
            .engine
            .assemble_video(&pattern, &output, fps, snapshot.config.quality)
            .await
        {
            if let Err(remove_err) = tokio::fs::remove_file(&output).await {
                warn!("Failed to remove partial output {}: {}", output.display(), remove_err);
            }
            return Err(e);
        }

        info!("Timelapse video created: {}", output.display());
        info!(
            "Total frames: {}, fps: {}, quality: {}, capture duration: {}",
            snapshot.frame_count,
            fps,
            snapshot.config.quality,
            format_elapsed(snapshot.capture_duration)
        );

        if snapshot.config.cleanup_frames {
            purge_frames(&snapshot.frames_dir).await;
        } else {
            debug!("Keeping {} frame files in {}", frames.len(), snapshot.frames_dir.display());
        }

        Ok(output)
    }

    /// Run assembly and log the outcome; errors never reach a caller.
    pub async fn assemble_and_log(&self, snapshot: &SessionSnapshot) -> Option<PathBuf> {
        match self.assemble(snapshot).await {
            Ok(path) => Some(path),
            Err(e) => {
                error!("Error generating timelapse: {}", e);
                None
            }
        }
    }
}

async fn list_frame_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut frames = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            if is_frame_file(name) {
                frames.push(entry.path());
            }
        }
    }
    frames.sort();
    Ok(frames)
}

/// Remove captured frames and, once empty, their directory.
pub async fn purge_frames(dir: &Path) -> usize {
    let frames = match list_frame_files(dir).await {
        Ok(frames) => frames,
        Err(e) => {
            error!("Error finding frames to clean up in {}: {}", dir.display(), e);
            return 0;
        }
    };

    let mut removed = 0;
    for file in &frames {
        match tokio::fs::remove_file(file).await {
            Ok(()) => removed += 1,
            Err(e) => error!("Error removing frame {}: {}", file.display(), e),
        }
    }
    if let Err(e) = tokio::fs::remove_dir(dir).await {
        debug!("Frames directory {} kept: {}", dir.display(), e);
    }

    info!("Cleaned up {} frame files", removed);
    removed
}
