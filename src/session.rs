use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::assembler::{frame_file_name, VideoAssembler};
use crate::config::CaptureConfig;
use crate::engine::{MediaEngine, GRAB_LABEL};
use crate::errors::{Result, TimelapseError};
use crate::process::{ProcessInfo, ProcessRegistry};
use crate::scheduler;
use crate::utils::{create_unique_dir, format_elapsed, redact_url, timestamp_slug};

#[derive(Debug, Clone, Copy, Default)]
struct SessionState {
    running: bool,
    frame_count: u64,
}

/// One start-to-stop capture run.
pub struct CaptureSession {
    pub config: CaptureConfig,
    pub start_time: DateTime<Local>,
    pub frames_dir: PathBuf,
    started_at: Instant,
    state: RwLock<SessionState>,
    cancel: CancellationToken,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
}

/// Frozen view of a stopped session, handed to the assembler.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub config: CaptureConfig,
    pub start_time: DateTime<Local>,
    pub frames_dir: PathBuf,
    pub frame_count: u64,
    pub capture_duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub running: bool,
    pub frame_count: u64,
    pub duration: String,
}

impl SessionStatus {
    pub fn idle() -> Self {
        Self {
            running: false,
            frame_count: 0,
            duration: "0s".to_string(),
        }
    }
}

impl CaptureSession {
    pub fn new(config: CaptureConfig, start_time: DateTime<Local>, frames_dir: PathBuf) -> Self {
        Self {
            config,
            start_time,
            frames_dir,
            started_at: Instant::now(),
            state: RwLock::new(SessionState { running: true, frame_count: 0 }),
            cancel: CancellationToken::new(),
            scheduler_task: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state.read().await.running
    }

    pub async fn frame_count(&self) -> u64 {
        self.state.read().await.frame_count
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn frame_path(&self, sequence: u64) -> PathBuf {
        self.frames_dir.join(frame_file_name(sequence))
    }

    pub(crate) async fn record_frame(&self) {
        let mut state = self.state.write().await;
        state.frame_count += 1;
    }

    /// Flip `running` off. Only the first caller gets `true`.
    async fn mark_stopped(&self) -> bool {
        let mut state = self.state.write().await;
        if !state.running {
            return false;
        }
        state.running = false;
        true
    }

    async fn attach_scheduler(&self, handle: JoinHandle<()>) {
        *self.scheduler_task.lock().await = Some(handle);
    }

    /// Wait for the capture task. Past `limit` the task is aborted, which
    /// drops and kills any grab still in flight.
    async fn join_scheduler(&self, limit: Duration) {
        let handle = self.scheduler_task.lock().await.take();
        let Some(mut handle) = handle else {
            return;
        };
        let joined = tokio::time::timeout(limit, &mut handle).await;
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Capture task ended abnormally: {}", e),
            Err(_) => {
                warn!("Capture task still busy after {:?}, aborting it", limit);
                handle.abort();
                let _ = handle.await;
                let partial = self.frame_path(self.frame_count().await);
                if tokio::fs::remove_file(&partial).await.is_ok() {
                    debug!("Removed unfinished frame {}", partial.display());
                }
            }
        }
    }

    async fn status(&self) -> SessionStatus {
        let state = *self.state.read().await;
        if !state.running {
            return SessionStatus::idle();
        }
        SessionStatus {
            running: true,
            frame_count: state.frame_count,
            duration: format_elapsed(self.started_at.elapsed()),
        }
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            config: self.config.clone(),
            start_time: self.start_time,
            frames_dir: self.frames_dir.clone(),
            frame_count: self.frame_count().await,
            capture_duration: self.started_at.elapsed(),
        }
    }
}

// How long stop waits for an in-flight grab before abandoning it.
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(35);

/// Owner of the single capture session. Cloning shares the same session slot.
#[derive(Clone)]
pub struct SessionManager {
    engine: Arc<dyn MediaEngine>,
    assembler: VideoAssembler,
    registry: ProcessRegistry,
    frames_root: PathBuf,
    probe_timeout: Duration,
    stop_grace: Duration,
    current: Arc<RwLock<Option<Arc<CaptureSession>>>>,
    // Serializes start() so two callers cannot both pass the running check.
    start_lock: Arc<Mutex<()>>,
    assembly_task: Arc<Mutex<Option<JoinHandle<Option<PathBuf>>>>>,
}

impl SessionManager {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        registry: ProcessRegistry,
        frames_root: PathBuf,
        output_dir: PathBuf,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            assembler: VideoAssembler::new(engine.clone(), output_dir),
            engine,
            registry,
            frames_root,
            probe_timeout,
            stop_grace: DEFAULT_STOP_GRACE,
            current: Arc::new(RwLock::new(None)),
            start_lock: Arc::new(Mutex::new(())),
            assembly_task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub async fn start(&self, config: CaptureConfig) -> Result<()> {
        let config = config.validate()?;
        let _start_guard = self.start_lock.lock().await;

        if self.current_running().await.is_some() {
            return Err(TimelapseError::AlreadyRunning);
        }

        if !self.engine.available().await {
            return Err(TimelapseError::engine_unavailable(
                "ffmpeg is not installed or not in PATH",
            ));
        }

        self.engine
            .probe_connectivity(&config.url, self.probe_timeout)
            .await
            .map_err(|e| match e {
                TimelapseError::SourceUnreachable { .. } => e,
                other => TimelapseError::source_unreachable(other.to_string()),
            })?;

        let start_time = Local::now();
        let frames_dir = create_unique_dir(&self.frames_root, &timestamp_slug(&start_time))?;
        let period = Duration::from_secs(config.interval as u64);
        let source = redact_url(&config.url);

        let session = Arc::new(CaptureSession::new(config, start_time, frames_dir));
        let handle = tokio::spawn(scheduler::run(session.clone(), self.engine.clone(), period));
        session.attach_scheduler(handle).await;

        *self.current.write().await = Some(session);

        info!("Started capture: URL={}, Interval={}s", source, period.as_secs());
        Ok(())
    }

    /// Stop the running session and schedule video assembly in the background.
    pub async fn stop(&self) -> Result<()> {
        let session = self
            .current
            .read()
            .await
            .clone()
            .ok_or(TimelapseError::NoActiveSession)?;

        if !session.mark_stopped().await {
            return Err(TimelapseError::NoActiveSession);
        }
        session.cancel.cancel();
        info!("Stopped capture, generating timelapse video...");

        let assembler = self.assembler.clone();
        let grace = self.stop_grace;
        let handle = tokio::spawn(async move {
            session.join_scheduler(grace).await;
            let snapshot = session.snapshot().await;
            assembler.assemble_and_log(&snapshot).await
        });
        *self.assembly_task.lock().await = Some(handle);

        Ok(())
    }

    pub async fn status(&self) -> SessionStatus {
        let session = self.current.read().await.clone();
        match session {
            Some(session) => session.status().await,
            None => SessionStatus::idle(),
        }
    }

    /// Wait for the most recent assembly, if any, and return its output.
    pub async fn wait_for_assembly(&self) -> Option<PathBuf> {
        let handle = self.assembly_task.lock().await.take()?;
        match handle.await {
            Ok(output) => output,
            Err(e) => {
                error!("Assembly task ended abnormally: {}", e);
                None
            }
        }
    }

    pub fn engine_processes(&self) -> Vec<ProcessInfo> {
        self.registry.list()
    }

    pub fn kill_all_engines(&self) -> usize {
        self.registry.kill_all()
    }

    /// Stop any running capture, kill its in-flight grab, let its video
    /// finish, then kill whatever engine processes remain.
    pub async fn shutdown(&self) {
        match self.stop().await {
            Ok(()) => info!("Stopped running capture for shutdown"),
            Err(TimelapseError::NoActiveSession) => {}
            Err(e) => warn!("Failed to stop capture on shutdown: {}", e),
        }
        let grabs = self.registry.kill_labelled(GRAB_LABEL);
        if grabs > 0 {
            info!("Killed {} in-flight frame grabs", grabs);
        }
        if let Some(output) = self.wait_for_assembly().await {
            info!("Final timelapse written to {}", output.display());
        }
        let killed = self.kill_all_engines();
        if killed > 0 {
            info!("Killed {} engine processes on shutdown", killed);
        }
    }

    async fn current_running(&self) -> Option<Arc<CaptureSession>> {
        let session = self.current.read().await.clone()?;
        if session.is_running().await {
            Some(session)
        } else {
            None
        }
    }
}
