//! Owned VMM process.
//!
//! When the orchestrator is given a VMM binary it launches one process per
//! instance with `--api-sock <path>` and waits for the control socket to
//! accept connections before configuration starts.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use vmorch_shared::errors::{VmorchError, VmorchResult};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct VmmLaunch {
    pub binary: PathBuf,
    pub socket_path: PathBuf,
    pub args: Vec<String>,
    /// Receives the VMM's stdout and stderr. Discarded when unset.
    pub log_path: Option<PathBuf>,
    pub ready_timeout: Duration,
}

#[derive(Debug)]
pub struct VmmProcess {
    child: Child,
    pid: Option<u32>,
    socket_path: PathBuf,
}

impl VmmProcess {
    /// Spawn the VMM and wait for its control socket.
    ///
    /// A stale socket file from an earlier run is removed first. The
    /// process is killed if it does not become ready in time.
    pub async fn spawn(launch: &VmmLaunch) -> VmorchResult<Self> {
        match std::fs::remove_file(&launch.socket_path) {
            Ok(()) => tracing::debug!(
                socket = %launch.socket_path.display(),
                "Removed stale control socket"
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(VmorchError::Process(format!(
                    "Failed to remove stale socket {}: {}",
                    launch.socket_path.display(),
                    e
                )));
            }
        }

        let mut cmd = Command::new(&launch.binary);
        cmd.arg("--api-sock")
            .arg(&launch.socket_path)
            .args(&launch.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        match &launch.log_path {
            Some(path) => {
                let log = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                cmd.stdout(log.try_clone()?).stderr(log);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = cmd.spawn().map_err(|e| {
            let err_msg = format!(
                "Failed to spawn VMM at {}: {}",
                launch.binary.display(),
                e
            );
            tracing::error!("{}", err_msg);
            VmorchError::Process(err_msg)
        })?;

        let pid = child.id();
        tracing::info!(
            pid = ?pid,
            binary = %launch.binary.display(),
            socket = %launch.socket_path.display(),
            "VMM process spawned"
        );

        let mut process = Self {
            child,
            pid,
            socket_path: launch.socket_path.clone(),
        };

        if let Err(e) = process.wait_ready(launch.ready_timeout).await {
            process.stop().await;
            return Err(e);
        }
        Ok(process)
    }

    async fn wait_ready(&mut self, timeout: Duration) -> VmorchResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Err(VmorchError::Process(format!(
                    "VMM exited before its control socket was ready: {}",
                    status
                )));
            }
            if probe_socket(&self.socket_path).await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(VmorchError::Process(format!(
                    "VMM control socket {} not ready after {:?}",
                    self.socket_path.display(),
                    timeout
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// False once the process has exited.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Kill and reap the process, then remove its socket.
    pub async fn stop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.child.kill().await {
                tracing::warn!(pid = ?self.pid, error = %e, "Failed to kill VMM process");
            }
        }
        let _ = std::fs::remove_file(&self.socket_path);
        tracing::debug!(pid = ?self.pid, "VMM process stopped");
    }
}

#[cfg(unix)]
async fn probe_socket(path: &Path) -> bool {
    tokio::net::UnixStream::connect(path).await.is_ok()
}

#[cfg(not(unix))]
async fn probe_socket(_path: &Path) -> bool {
    false
}
