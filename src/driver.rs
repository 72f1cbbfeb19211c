//! Per-service driver seam.
//!
//! The starter, the health monitor and the shutdown coordinator only talk to a
//! service through [`ServiceDriver`]. [`ManagedService`] is the production
//! implementation: it owns the configuration, the probe, the spawn-plan resolver
//! and at most one [`ProcessHandle`].

use crate::backoff::poll_interval;
use crate::config::{ServiceConfig, WardenConfig};
use crate::error::{Result, WardenError};
use crate::events::{EventBus, WardenEvent};
use crate::probe::{port_in_use, HealthProbe, HttpHealthProbe};
use crate::process::{
    launch, ConfiguredSpawnResolver, ExitObserver, ProcessHandle, ProcessState,
    SpawnPlanResolver, StopOutcome,
};
use crate::service::{Health, RunStatus, ServiceKind, StatusRegistry};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const PORT_CHECK_TIMEOUT: Duration = Duration::from_millis(500);

/// Result of asking a driver to bring its service up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Something already answers health checks; nothing was spawned
    AlreadyServing,
    Spawned { pid: Option<u32> },
    /// No launch method exists on this machine
    Unavailable(String),
}

/// Why a freshly spawned process will not become healthy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnFailure {
    /// The process reported that its port is taken
    BindConflict(String),
    /// The process exited before answering a health check
    Exited(ProcessState),
}

#[async_trait]
pub trait ServiceDriver: Send + Sync {
    fn kind(&self) -> ServiceKind;

    /// Probes a configured external server instead of a local process
    fn is_external(&self) -> bool;

    /// One health classification of the service
    async fn probe(&self) -> bool;

    /// Spawn the service unless something already serves it
    async fn launch(&self) -> Result<LaunchOutcome>;

    /// Early failure of the owned process, if any
    fn spawn_failure(&self) -> Option<SpawnFailure>;

    /// Stop the owned process, if any
    async fn stop(&self, grace: Duration) -> StopOutcome;

    /// Whether a live process is owned
    fn has_process(&self) -> bool;
}

/// Poll `driver` on the adaptive schedule until it is healthy or `limit` elapses
pub async fn await_healthy(driver: &dyn ServiceDriver, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    let mut poll = 0;

    loop {
        if driver.probe().await {
            return true;
        }

        if let Some(SpawnFailure::Exited(state)) = driver.spawn_failure() {
            debug!("{} exited while waiting for health: {:?}", driver.kind(), state);
            return false;
        }

        let now = Instant::now();
        if now >= deadline {
            return false;
        }

        sleep(poll_interval(poll).min(deadline - now)).await;
        poll += 1;
    }
}

/// Production driver for one service slot
pub struct ManagedService {
    kind: ServiceKind,
    config: ServiceConfig,
    data_dir: PathBuf,
    grace: Duration,
    probe: Arc<dyn HealthProbe>,
    resolver: Arc<dyn SpawnPlanResolver>,
    registry: Arc<StatusRegistry>,
    events: EventBus,
    process: Mutex<Option<Arc<ProcessHandle>>>,
}

impl ManagedService {
    pub fn new(
        kind: ServiceKind,
        config: &WardenConfig,
        registry: Arc<StatusRegistry>,
        events: EventBus,
    ) -> Result<Self> {
        let service = config.service(kind).clone();
        let probe = HttpHealthProbe::new(
            service.base_url(),
            service.health_paths.clone(),
            config.health.probe_timeout(),
            config.health.probe_retries,
        )?;

        Ok(Self {
            kind,
            config: service,
            data_dir: config.data_dir(),
            grace: config.grace_period(),
            probe: Arc::new(probe),
            resolver: Arc::new(ConfiguredSpawnResolver),
            registry,
            events,
            process: Mutex::new(None),
        })
    }

    /// Replace the health probe
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Replace the spawn-plan resolver
    pub fn with_resolver(mut self, resolver: Arc<dyn SpawnPlanResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    fn current_process(&self) -> Option<Arc<ProcessHandle>> {
        self.process.lock().clone()
    }

    fn exit_observer(&self) -> ExitObserver {
        let kind = self.kind;
        let registry = Arc::clone(&self.registry);
        let events = self.events.clone();

        Arc::new(move |state: &ProcessState| {
            let status = registry.update(kind, |s| {
                if s.status == RunStatus::Running {
                    s.health = Health::Unhealthy;
                }
                // Terminal statuses already account for the missing process
                if !s.status.is_unavailable() {
                    s.status = RunStatus::Stopped;
                }
                s.pid = None;
                s.last_error = Some(format!("process exited: {:?}", state));
                s.clone()
            });
            events.publish(WardenEvent::status_changed(
                kind,
                &status,
                format!("process exited: {:?}", state),
            ));
        })
    }
}

#[async_trait]
impl ServiceDriver for ManagedService {
    fn kind(&self) -> ServiceKind {
        self.kind
    }

    fn is_external(&self) -> bool {
        self.config.is_external()
    }

    async fn probe(&self) -> bool {
        self.probe.check().await
    }

    async fn launch(&self) -> Result<LaunchOutcome> {
        if self.config.is_external() {
            return if self.probe.check().await {
                Ok(LaunchOutcome::AlreadyServing)
            } else {
                Err(WardenError::ExternalUnreachable {
                    service: self.kind,
                    url: self.config.base_url(),
                })
            };
        }

        // Never own more than one process per slot
        let previous = self.process.lock().take();
        if let Some(previous) = previous {
            if !previous.has_exited() {
                info!("Stopping previous {} process before relaunch", self.kind);
                previous.shutdown(self.grace).await;
            }
        }

        if port_in_use(&self.config.host, self.config.port, PORT_CHECK_TIMEOUT).await {
            if self.probe.check().await {
                info!(
                    "{} port {} is served by a healthy instance, not spawning",
                    self.kind, self.config.port
                );
                return Ok(LaunchOutcome::AlreadyServing);
            }
            return Err(WardenError::PortConflict {
                service: self.kind,
                port: self.config.port,
            });
        }

        let Some(plan) = self
            .resolver
            .resolve(self.kind, &self.config, &self.data_dir)
        else {
            let command = self.config.command.as_deref().unwrap_or("<none>");
            return Ok(LaunchOutcome::Unavailable(format!(
                "no launch method for {} (command `{}` not found)",
                self.kind, command
            )));
        };

        if let Err(e) = tokio::fs::create_dir_all(&self.data_dir).await {
            warn!(
                "Could not create data directory {}: {}",
                self.data_dir.display(),
                e
            );
        }

        let handle = Arc::new(launch(self.kind, &plan, Some(self.exit_observer()))?);
        let pid = handle.pid();
        *self.process.lock() = Some(handle);
        self.registry.update(self.kind, |s| s.pid = pid);

        Ok(LaunchOutcome::Spawned { pid })
    }

    fn spawn_failure(&self) -> Option<SpawnFailure> {
        let handle = self.current_process()?;

        if let Some(reason) = handle.early_failure_reason() {
            return Some(SpawnFailure::BindConflict(reason));
        }

        if handle.has_exited() {
            Some(SpawnFailure::Exited(handle.state()))
        } else {
            None
        }
    }

    async fn stop(&self, grace: Duration) -> StopOutcome {
        let handle = self.process.lock().take();
        let Some(handle) = handle else {
            return StopOutcome::NotRunning;
        };

        let outcome = handle.shutdown(grace).await;
        debug!("{} stop outcome: {:?}", self.kind, outcome);
        self.registry.update(self.kind, |s| s.pid = None);
        outcome
    }

    fn has_process(&self) -> bool {
        let mut process = self.process.lock();
        match process.as_ref() {
            Some(handle) if handle.has_exited() => {
                *process = None;
                false
            }
            Some(_) => true,
            None => false,
        }
    }
}
