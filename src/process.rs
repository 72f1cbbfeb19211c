//! Spawn plans and the process launcher.
//!
//! A [`ProcessHandle`] owns exactly one child process. A waiter task owns the
//! `Child` itself and publishes the typed [`ProcessState`] through a watch
//! channel; output observers scan stdout/stderr for bind failures so callers can
//! stop waiting on a process that will never become healthy.

use crate::config::ServiceConfig;
use crate::error::{Result, WardenError};
use crate::service::ServiceKind;
use parking_lot::Mutex;
use regex::RegexSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// How long to wait for the waiter task to reap a force-killed process
const FORCE_KILL_WAIT: Duration = Duration::from_secs(2);

const BIND_FAILURE_PATTERNS: &[&str] = &[
    r"(?i)address already in use",
    r"(?i)eaddrinuse",
    r"(?i)(failed to|could not|cannot|unable to) bind",
    r"(?i)error binding",
    r"(?i)port \S+ is already (in use|allocated)",
    r"(?i)only one usage of each socket address",
];

/// Everything needed to launch a service process
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

impl SpawnPlan {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Command line for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Decides how a service binary is launched.
///
/// Returning `None` means no viable launch method exists on this machine.
pub trait SpawnPlanResolver: Send + Sync {
    fn resolve(&self, kind: ServiceKind, config: &ServiceConfig, data_dir: &Path)
        -> Option<SpawnPlan>;
}

/// Resolver that launches the configured command found on PATH
#[derive(Debug, Default, Clone)]
pub struct ConfiguredSpawnResolver;

impl ConfiguredSpawnResolver {
    fn substitute(template: &str, config: &ServiceConfig, data_dir: &Path) -> String {
        template
            .replace("{host}", &config.host)
            .replace("{port}", &config.port.to_string())
            .replace("{data_dir}", &data_dir.to_string_lossy())
    }
}

impl SpawnPlanResolver for ConfiguredSpawnResolver {
    fn resolve(
        &self,
        kind: ServiceKind,
        config: &ServiceConfig,
        data_dir: &Path,
    ) -> Option<SpawnPlan> {
        let command = config.command.as_deref()?;
        let program = match which::which(command) {
            Ok(path) => path,
            Err(e) => {
                debug!("No launch method for {}: {} ({})", kind, command, e);
                return None;
            }
        };

        let env = config
            .env
            .iter()
            .filter_map(|entry| match entry.split_once('=') {
                Some((key, value)) => Some((
                    key.trim().to_string(),
                    Self::substitute(value, config, data_dir),
                )),
                None => {
                    warn!("Ignoring malformed env entry for {}: {}", kind, entry);
                    None
                }
            })
            .collect();

        Some(SpawnPlan {
            program,
            args: config
                .args
                .iter()
                .map(|arg| Self::substitute(arg, config, data_dir))
                .collect(),
            env,
            working_dir: config.working_dir.as_ref().map(PathBuf::from),
        })
    }
}

/// Observed state of a launched process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    ExitedSuccess,
    ExitedFailure(Option<i32>),
    /// Exited after reporting that it could not start, e.g. a bind failure
    SpawnFailed(String),
}

impl ProcessState {
    pub fn has_exited(&self) -> bool {
        !matches!(self, ProcessState::Running)
    }
}

/// Signals the launcher can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Standard termination request (SIGTERM)
    Terminate,
    /// Forced kill (SIGKILL, or a process-tree kill on Windows)
    Kill,
}

/// How a process left during shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running
    NotRunning,
    AlreadyExited,
    Graceful,
    Forced,
    /// Still alive after the forced kill
    Unresponsive,
}

/// Invoked once when the process exits while listeners are attached
pub type ExitObserver = Arc<dyn Fn(&ProcessState) + Send + Sync>;

/// Handle to one launched service process
pub struct ProcessHandle {
    service: ServiceKind,
    pid: Option<u32>,
    state: watch::Receiver<ProcessState>,
    early_failure: Arc<Mutex<Option<String>>>,
    listeners_attached: Arc<AtomicBool>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("service", &self.service)
            .field("pid", &self.pid)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

/// Start a process from a spawn plan and attach output and exit observers
pub fn launch(
    service: ServiceKind,
    plan: &SpawnPlan,
    on_exit: Option<ExitObserver>,
) -> Result<ProcessHandle> {
    let matcher = RegexSet::new(BIND_FAILURE_PATTERNS)
        .map_err(|e| WardenError::system(format!("invalid bind failure pattern: {}", e)))?;

    info!("Launching {}: {}", service, plan.display());

    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args)
        .envs(plan.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &plan.working_dir {
        cmd.current_dir(dir);
    }

    // Own process group so the whole tree can be signalled at once
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| WardenError::spawn(service, format!("{}: {}", plan.display(), e)))?;

    let pid = child.id();
    let early_failure = Arc::new(Mutex::new(None));
    let listeners_attached = Arc::new(AtomicBool::new(true));
    let (state_tx, state_rx) = watch::channel(ProcessState::Running);
    let (kill_tx, kill_rx) = oneshot::channel::<()>();

    if let Some(stdout) = child.stdout.take() {
        spawn_output_observer(service, "stdout", stdout, matcher.clone(), Arc::clone(&early_failure));
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_output_observer(service, "stderr", stderr, matcher, Arc::clone(&early_failure));
    }

    let waiter_failure = Arc::clone(&early_failure);
    let waiter_listeners = Arc::clone(&listeners_attached);
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => {
                // Explicit kill request, or the handle was dropped
                if let Err(e) = child.start_kill() {
                    debug!("{} kill request failed: {}", service, e);
                }
                child.wait().await
            }
        };

        let state = match status {
            Ok(status) if status.success() => ProcessState::ExitedSuccess,
            Ok(status) => match waiter_failure.lock().clone() {
                Some(reason) => ProcessState::SpawnFailed(reason),
                None => ProcessState::ExitedFailure(status.code()),
            },
            Err(e) => {
                error!("Failed to wait for {} process: {}", service, e);
                ProcessState::ExitedFailure(None)
            }
        };

        info!("{} process (pid {:?}) exited: {:?}", service, pid, state);
        let _ = state_tx.send(state.clone());

        if waiter_listeners.load(Ordering::SeqCst) {
            if let Some(on_exit) = on_exit {
                on_exit(&state);
            }
        }
    });

    Ok(ProcessHandle {
        service,
        pid,
        state: state_rx,
        early_failure,
        listeners_attached,
        kill_tx: Mutex::new(Some(kill_tx)),
    })
}

fn spawn_output_observer<R>(
    service: ServiceKind,
    stream: &'static str,
    reader: R,
    matcher: RegexSet,
    early_failure: Arc<Mutex<Option<String>>>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("{} {}: {}", service, stream, line);

            if matcher.is_match(&line) {
                let mut failure = early_failure.lock();
                if failure.is_none() {
                    warn!("{} reported a bind failure: {}", service, line);
                    *failure = Some(line.trim().to_string());
                }
            }
        }
    });
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.state.borrow().has_exited()
    }

    pub fn early_failure_reason(&self) -> Option<String> {
        self.early_failure.lock().clone()
    }

    /// Stop the exit observer from firing; used before a deliberate stop
    pub fn detach_listeners(&self) {
        self.listeners_attached.store(false, Ordering::SeqCst);
    }

    /// Wait until the process has exited; `false` if `limit` elapsed first
    pub async fn wait_for_exit(&self, limit: Duration) -> bool {
        let mut state = self.state.clone();
        let exited = match timeout(limit, state.wait_for(|s| s.has_exited())).await {
            Ok(_) => true,
            Err(_) => false,
        };
        exited
    }

    /// Deliver a signal to the process (and its process group on Unix)
    pub fn terminate(&self, signal: Signal) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }

        let Some(pid) = self.pid else {
            return Ok(());
        };

        let result = send_signal(pid, signal);

        if signal == Signal::Kill {
            if let Some(kill_tx) = self.kill_tx.lock().take() {
                let _ = kill_tx.send(());
            }
        }

        result.map_err(|e| {
            WardenError::system(format!(
                "failed to signal {} (pid {}): {}",
                self.service, pid, e
            ))
        })
    }

    /// Graceful stop: detach, SIGTERM, wait `grace`, then force kill
    pub async fn shutdown(&self, grace: Duration) -> StopOutcome {
        self.detach_listeners();

        if self.has_exited() {
            return StopOutcome::AlreadyExited;
        }

        if let Err(e) = self.terminate(Signal::Terminate) {
            warn!("{}", e);
        }

        if self.wait_for_exit(grace).await {
            info!("{} stopped gracefully", self.service);
            return StopOutcome::Graceful;
        }

        warn!(
            "{} did not exit within {:?}, forcing termination",
            self.service, grace
        );
        if let Err(e) = self.terminate(Signal::Kill) {
            warn!("{}", e);
        }

        if self.wait_for_exit(FORCE_KILL_WAIT).await {
            StopOutcome::Forced
        } else {
            error!(
                "{} (pid {:?}) still running after forced termination",
                self.service, self.pid
            );
            StopOutcome::Unresponsive
        }
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> std::io::Result<()> {
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pid = pid as libc::pid_t;

    // Negative pid addresses the process group created at launch
    let rc = unsafe { libc::kill(-pid, sig) };
    if rc == 0 {
        return Ok(());
    }

    let rc = unsafe { libc::kill(pid, sig) };
    if rc == 0 {
        Ok(())
    } else {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            // Already gone
            Ok(())
        } else {
            Err(err)
        }
    }
}

#[cfg(windows)]
fn send_signal(pid: u32, signal: Signal) -> std::io::Result<()> {
    let mut cmd = std::process::Command::new("taskkill");
    cmd.arg("/PID").arg(pid.to_string()).arg("/T");
    if signal == Signal::Kill {
        cmd.arg("/F");
    }
    let output = cmd.output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}
