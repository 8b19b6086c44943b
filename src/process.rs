use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{Result, TimelapseError};

#[derive(Debug, Clone)]
struct RegisteredProcess {
    label: String,
    pid: Option<u32>,
    kill_switch: CancellationToken,
}

/// Summary of a live engine process, for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub id: u64,
    pub label: String,
    pub pid: Option<u32>,
}

/// Every live engine child, each with a kill switch its owner listens on.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    processes: Arc<Mutex<HashMap<u64, RegisteredProcess>>>,
    next_id: Arc<AtomicU64>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, label: &str, pid: Option<u32>) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kill_switch = CancellationToken::new();
        let entry = RegisteredProcess {
            label: label.to_string(),
            pid,
            kill_switch: kill_switch.clone(),
        };
        if let Ok(mut processes) = self.processes.lock() {
            processes.insert(id, entry);
        }
        (id, kill_switch)
    }

    fn deregister(&self, id: u64) {
        if let Ok(mut processes) = self.processes.lock() {
            processes.remove(&id);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.processes.lock().map(|p| p.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self) -> Vec<ProcessInfo> {
        let processes = match self.processes.lock() {
            Ok(processes) => processes,
            Err(_) => return Vec::new(),
        };
        let mut list: Vec<ProcessInfo> = processes
            .iter()
            .map(|(id, p)| ProcessInfo { id: *id, label: p.label.clone(), pid: p.pid })
            .collect();
        list.sort_by_key(|p| p.id);
        list
    }

    /// Signal every registered process to terminate. Each owner observes its
    /// kill switch, kills the child and reaps it.
    pub fn kill_all(&self) -> usize {
        self.kill_where(|_| true)
    }

    /// Like [`ProcessRegistry::kill_all`], restricted to processes spawned
    /// under `label`.
    pub fn kill_labelled(&self, label: &str) -> usize {
        self.kill_where(|p| p.label == label)
    }

    fn kill_where(&self, matches: impl Fn(&RegisteredProcess) -> bool) -> usize {
        let switches: Vec<(String, CancellationToken)> = match self.processes.lock() {
            Ok(processes) => processes
                .values()
                .filter(|p| matches(p))
                .map(|p| (p.label.clone(), p.kill_switch.clone()))
                .collect(),
            Err(_) => return 0,
        };
        for (label, switch) in &switches {
            info!("Killing engine process '{}'", label);
            switch.cancel();
        }
        switches.len()
    }
}

/// Scoped owner of one engine child process.
///
/// Dropping the guard issues a kill (the child is also spawned with
/// `kill_on_drop`), so early returns and cancelled futures never leave
/// orphans. Prefer [`EngineProcess::terminate`] where the caller can await,
/// since it also reaps the child.
pub struct EngineProcess {
    id: u64,
    label: String,
    child: Child,
    kill_switch: CancellationToken,
    registry: ProcessRegistry,
    stderr_task: Option<JoinHandle<String>>,
}

impl EngineProcess {
    pub fn spawn(command: &mut Command, label: impl Into<String>, registry: &ProcessRegistry) -> Result<Self> {
        let label = label.into();
        let child = command
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TimelapseError::engine(format!("Failed to spawn {}: {}", label, e)))?;

        let (id, kill_switch) = registry.register(&label, child.id());
        debug!("Spawned engine process '{}' (pid {:?})", label, child.id());

        Ok(Self {
            id,
            label,
            child,
            kill_switch,
            registry: registry.clone(),
            stderr_task: None,
        })
    }

    pub fn kill_switch(&self) -> CancellationToken {
        self.kill_switch.clone()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Collect stderr in the background so the pipe never fills up.
    pub fn capture_stderr(&mut self) {
        if let Some(stderr) = self.child.stderr.take() {
            self.stderr_task = Some(tokio::spawn(read_to_string(stderr)));
        }
    }

    /// Forward stderr lines to the debug log instead of buffering them.
    pub fn log_stderr(&mut self) {
        if let Some(stderr) = self.child.stderr.take() {
            let label = self.label.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        debug!("[{}] {}", label, line);
                    }
                }
            });
        }
    }

    /// Wait for the child to exit, killing it early if the registry kill
    /// switch fires.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        tokio::select! {
            status = self.child.wait() => Ok(status?),
            _ = self.kill_switch.cancelled() => {
                warn!("Engine process '{}' killed on request", self.label);
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
                Err(TimelapseError::engine(format!("{} was killed", self.label)))
            }
        }
    }

    /// Run to completion and return the exit status with collected stderr.
    pub async fn finish(mut self) -> Result<(ExitStatus, String)> {
        let status = self.wait().await;
        let stderr = self.take_captured_stderr().await;
        self.registry.deregister(self.id);
        Ok((status?, stderr))
    }

    /// Kill the child, reap it and release its registry slot.
    pub async fn terminate(mut self) {
        if let Ok(None) = self.child.try_wait() {
            debug!("Terminating engine process '{}'", self.label);
            let _ = self.child.start_kill();
        }
        if let Err(e) = self.child.wait().await {
            warn!("Failed to reap engine process '{}': {}", self.label, e);
        }
        self.registry.deregister(self.id);
    }

    async fn take_captured_stderr(&mut self) -> String {
        match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        }
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.start_kill();
        }
        self.registry.deregister(self.id);
    }
}

async fn read_to_string(mut stderr: ChildStderr) -> String {
    let mut buf = Vec::new();
    let _ = stderr.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sleeper() -> Command {
        let mut cmd = Command::new("sleep");
        cmd.arg("30").stdout(Stdio::null()).stderr(Stdio::null());
        cmd
    }

    #[tokio::test]
    async fn test_terminate_releases_registry_slot() {
        let registry = ProcessRegistry::new();
        let process = EngineProcess::spawn(&mut sleeper(), "sleep", &registry).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.list()[0].label, "sleep");

        process.terminate().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_drop_releases_registry_slot() {
        let registry = ProcessRegistry::new();
        {
            let _process = EngineProcess::spawn(&mut sleeper(), "sleep", &registry).unwrap();
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_kill_all_interrupts_wait() {
        let registry = ProcessRegistry::new();
        let mut process = EngineProcess::spawn(&mut sleeper(), "sleep", &registry).unwrap();

        let killer = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(killer.kill_all(), 1);
        });

        let result = tokio::time::timeout(Duration::from_secs(5), process.wait()).await.unwrap();
        assert!(matches!(result, Err(TimelapseError::Engine { .. })));
        process.terminate().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_kill_labelled_spares_other_processes() {
        let registry = ProcessRegistry::new();
        let mut grab = EngineProcess::spawn(&mut sleeper(), "grab", &registry).unwrap();
        let assemble = EngineProcess::spawn(&mut sleeper(), "assemble", &registry).unwrap();

        assert_eq!(registry.kill_labelled("grab"), 1);
        let result = tokio::time::timeout(Duration::from_secs(5), grab.wait()).await.unwrap();
        assert!(matches!(result, Err(TimelapseError::Engine { .. })));
        assert!(!assemble.kill_switch().is_cancelled());

        grab.terminate().await;
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.list()[0].label, "assemble");
        assemble.terminate().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_finish_collects_stderr() {
        let registry = ProcessRegistry::new();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo broken >&2; exit 3"])
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let mut process = EngineProcess::spawn(&mut cmd, "sh", &registry).unwrap();
        process.capture_stderr();

        let (status, stderr) = process.finish().await.unwrap();
        assert_eq!(status.code(), Some(3));
        assert_eq!(stderr.trim(), "broken");
        assert!(registry.is_empty());
    }
}
