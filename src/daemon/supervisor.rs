//! Lifecycle of the external VPN daemon process.
//!
//! `Stopped -> Starting -> Running -> Stopped`. Launch failures surface from
//! [`Supervisor::start`]; a process that exits later is noticed by a watcher
//! task which moves the state back to `Stopped`. Restart policy belongs to the
//! caller.

use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use super::files::{ensure_directory_exists, write_with_mode};
use super::template::{
    generate_config, generate_credentials, generate_profile, DaemonConfigParams, CONFIG_FILE_NAME,
    PROFILE_FILE_NAME,
};
use crate::config::ServerConfig;
use crate::error::{EdgeError, EdgeResult};
use crate::store::Store;
use crate::validation::validate_username;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
}

#[derive(Debug, Default)]
struct Process {
    pid: Option<u32>,
    /// Bumped on every start and stop so a stale watcher cannot touch a newer run
    generation: u64,
}

struct Shared {
    process: Mutex<Process>,
    state_tx: watch::Sender<DaemonState>,
}

impl Shared {
    fn set_state(&self, state: DaemonState) {
        self.state_tx.send_replace(state);
    }
}

/// How long `stop` waits for the daemon to exit after SIGINT.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period after SIGKILL before the watcher is given up on.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Owns the one daemon process.
pub struct Supervisor {
    config: ServerConfig,
    store: Store,
    shared: Arc<Shared>,
    stop_timeout: Duration,
}

impl Supervisor {
    pub fn new(config: ServerConfig, store: Store) -> Self {
        let (state_tx, _) = watch::channel(DaemonState::Stopped);
        Self {
            config,
            store,
            shared: Arc::new(Shared {
                process: Mutex::new(Process::default()),
                state_tx,
            }),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn state(&self) -> DaemonState {
        *self.shared.state_tx.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<DaemonState> {
        self.shared.state_tx.subscribe()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.shared.process.lock().await.pid
    }

    pub fn config_path(&self) -> PathBuf {
        self.config.daemon.config_dir.join(CONFIG_FILE_NAME)
    }

    /// Regenerate configuration and credentials from current policy and
    /// launch the daemon.
    pub async fn start(&self) -> EdgeResult<u32> {
        let mut process = self.shared.process.lock().await;
        if self.state() != DaemonState::Stopped {
            return Err(EdgeError::AlreadyRunning);
        }

        self.shared.set_state(DaemonState::Starting);
        match self.launch(&mut process).await {
            Ok(pid) => {
                self.shared.set_state(DaemonState::Running);
                info!("{} started (pid {})", self.config.daemon.binary, pid);
                Ok(pid)
            }
            Err(e) => {
                self.shared.set_state(DaemonState::Stopped);
                error!("Failed to start {}: {}", self.config.daemon.binary, e);
                Err(e)
            }
        }
    }

    /// Interrupt the running daemon and wait until it has exited.
    ///
    /// A daemon still alive after the stop timeout is killed. `Stopped` is
    /// only reported once the process is gone, so a following `start` never
    /// overlaps the old instance.
    pub async fn stop(&self) -> EdgeResult<()> {
        let pid = {
            let process = self.shared.process.lock().await;
            match (self.state(), process.pid) {
                (DaemonState::Running, Some(pid)) => pid,
                _ => return Err(EdgeError::NotRunning),
            }
        };
        let mut state_rx = self.subscribe();

        send_signal(pid, libc::SIGINT)?;
        info!("Sent interrupt to {} (pid {})", self.config.daemon.binary, pid);
        if wait_stopped(&mut state_rx, self.stop_timeout).await {
            return Ok(());
        }

        warn!(
            "{} (pid {}) still running after {:?}, killing it",
            self.config.daemon.binary, pid, self.stop_timeout
        );
        send_signal(pid, libc::SIGKILL)?;
        if wait_stopped(&mut state_rx, KILL_GRACE).await {
            return Ok(());
        }

        let mut process = self.shared.process.lock().await;
        if process.pid == Some(pid) {
            error!("Lost track of {} (pid {})", self.config.daemon.binary, pid);
            process.pid = None;
            process.generation += 1;
            self.shared.set_state(DaemonState::Stopped);
        }
        Ok(())
    }

    /// Write every file the daemon reads at startup. Returns the config path.
    pub async fn prepare(&self) -> EdgeResult<PathBuf> {
        let daemon = &self.config.daemon;
        for dir in [&daemon.config_dir, &daemon.run_dir, &daemon.chroot_dir] {
            ensure_directory_exists(dir).await?;
        }

        let mut policy = self.config.clone();
        policy.apply_overrides(&self.store.settings().await?);
        let params = DaemonConfigParams::from_config(&policy);

        let config_path = self.config_path();
        write_with_mode(&config_path, &generate_config(&params)?, 0o644).await?;
        write_with_mode(
            &daemon.config_dir.join(PROFILE_FILE_NAME),
            &generate_profile(),
            0o644,
        )
        .await?;

        let credentials = self.store.enabled_credentials().await?;
        let accepted: Vec<(&str, &str)> = credentials
            .iter()
            .filter(|c| match validate_username(&c.username) {
                Ok(()) if !c.password_hash.contains(|ch: char| ch == '\n' || ch == ':') => true,
                _ => {
                    warn!("Leaving {:?} out of the credential file", c.username);
                    false
                }
            })
            .map(|c| (c.username.as_str(), c.password_hash.as_str()))
            .collect();
        write_with_mode(&daemon.credential_file, &generate_credentials(accepted.iter().copied()), 0o600)
            .await?;

        info!(
            "Wrote {:?} and {} credential(s) to {:?}",
            config_path,
            accepted.len(),
            daemon.credential_file
        );
        Ok(config_path)
    }

    async fn launch(&self, process: &mut Process) -> EdgeResult<u32> {
        let config_path = self.prepare().await?;
        let config_arg = config_path.to_string_lossy();
        let args: Vec<String> = self
            .config
            .daemon
            .args
            .iter()
            .map(|a| a.replace("{config}", &config_arg))
            .collect();

        let mut child = Command::new(&self.config.daemon.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                EdgeError::SubprocessLaunchFailed(format!("{}: {}", self.config.daemon.binary, e))
            })?;

        let pid = child.id().ok_or_else(|| {
            EdgeError::SubprocessLaunchFailed("process exited before reporting a pid".to_string())
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, "stderr"));
        }

        process.generation += 1;
        process.pid = Some(pid);
        let generation = process.generation;

        let shared = self.shared.clone();
        let binary = self.config.daemon.binary.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let mut process = shared.process.lock().await;
            match status {
                Ok(status) => warn!("{} (pid {}) exited: {}", binary, pid, status),
                Err(e) => warn!("{} (pid {}) could not be awaited: {}", binary, pid, e),
            }
            if process.generation == generation {
                process.pid = None;
                shared.set_state(DaemonState::Stopped);
            }
        });

        Ok(pid)
    }
}

fn send_signal(pid: u32, signal: libc::c_int) -> EdgeResult<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| EdgeError::InvalidParameter(format!("pid {} out of range", pid)))?;
    // SAFETY: kill(2) has no memory-safety preconditions
    if unsafe { libc::kill(pid, signal) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    // Already gone; the watcher reports the exit
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err.into())
}

async fn wait_stopped(state_rx: &mut watch::Receiver<DaemonState>, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, state_rx.wait_for(|s| *s == DaemonState::Stopped)).await,
        Ok(Ok(_))
    )
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, stream: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(stream, "[daemon] {}", line),
            Ok(None) => break,
            Err(e) => {
                warn!(stream, "Stopped reading daemon output: {}", e);
                break;
            }
        }
    }
}
