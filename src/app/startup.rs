use super::types::{StartupReport, StartupState};
use super::Supervisor;
use crate::error::{Result, WardenError};
use crate::events::StartupPhase;
use crate::preflight::{run_preflight, PreflightReport};
use crate::service::{Health, RunStatus, ServiceKind};
use crate::starter::{ServiceStartResult, ServiceStarter};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What the timed part of startup managed to produce before it finished or was cut off
#[derive(Default)]
struct SequenceOutput {
    preflight: Mutex<Option<PreflightReport>>,
    results: Mutex<BTreeMap<ServiceKind, ServiceStartResult>>,
    fatal: Mutex<Option<WardenError>>,
}

impl Supervisor {
    /// Bring every enabled service up under the overall startup timeout.
    ///
    /// Optional services that cannot be started put the host into degraded
    /// mode. Only an exhausted required service, or a timeout that leaves no
    /// service usable, is returned as an error.
    pub async fn start(&self) -> Result<StartupReport> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let overall = self.config.overall_timeout();

        let abandon = CancellationToken::new();
        *self.abandon.lock() = abandon.clone();

        info!("Starting dependent services (run {})", run_id);
        self.registry.clear_errors();
        self.set_lifecycle(StartupState::InProgress, StartupPhase::Preflight);

        let output = SequenceOutput::default();
        let timed_out = match timeout(overall, self.run_sequence(&abandon, &output)).await {
            Ok(()) => false,
            Err(_) => {
                error!("Startup did not complete within {:?}, abandoning", overall);
                abandon.cancel();
                self.mark_timed_out(overall);
                true
            }
        };

        let degraded = self.degrade().await;

        let preflight = output.preflight.lock().take().unwrap_or_default();
        let mut services = std::mem::take(&mut *output.results.lock());
        let snapshot = self.registry.snapshot();
        for (kind, status) in &snapshot {
            services.entry(*kind).or_insert_with(|| {
                let error = status
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "startup timed out".to_string());
                ServiceStartResult::fallback(*kind, status.attempts, error)
            });
        }

        if let Some(fatal) = output.fatal.lock().take() {
            error!("Startup failed: {}", fatal);
            self.set_lifecycle(StartupState::Failed, StartupPhase::Failed);
            self.progress(StartupPhase::Failed, fatal.to_string(), 100);
            return Err(fatal);
        }

        let usable = snapshot.values().any(|s| s.status == RunStatus::Running);
        if timed_out && !usable {
            self.set_lifecycle(StartupState::Failed, StartupPhase::Failed);
            self.progress(StartupPhase::Failed, "Startup timed out", 100);
            return Err(WardenError::StartupTimeout { timeout: overall });
        }

        let supervised = snapshot
            .values()
            .any(|s| s.status == RunStatus::Running || s.circuit_breaker_tripped);
        if supervised {
            self.monitor.start();
            self.progress(StartupPhase::Monitoring, "Health monitor active", 98);
        }

        let (state, message) = if degraded {
            (StartupState::Degraded, "Startup complete in degraded mode")
        } else {
            (StartupState::Completed, "Startup complete")
        };
        self.set_lifecycle(state, StartupPhase::Complete);
        self.progress(StartupPhase::Complete, message, 100);

        let report = StartupReport {
            run_id,
            preflight,
            services,
            degraded,
            timed_out,
            elapsed: started.elapsed(),
        };
        info!(
            "{} ({}/{} services running, {:?})",
            message,
            report.running_count(),
            report.services.len(),
            report.elapsed
        );
        Ok(report)
    }

    /// The part of startup bounded by the overall timeout
    async fn run_sequence(&self, abandon: &CancellationToken, output: &SequenceOutput) {
        self.progress(StartupPhase::Preflight, "Running pre-flight checks", 5);
        let preflight = run_preflight(&self.config).await;
        for check in preflight.failures() {
            self.registry
                .push_error(format!("preflight {}: {}", check.name, check.message));
        }
        *output.preflight.lock() = Some(preflight);

        let mut enabled = Vec::new();
        for (kind, driver) in &self.drivers {
            if self.config.service(*kind).disabled {
                info!("{} is disabled by configuration", kind);
                self.registry.update(*kind, |s| {
                    s.status = RunStatus::Disabled;
                    s.health = Health::Unknown;
                });
                output
                    .results
                    .lock()
                    .insert(*kind, ServiceStartResult::disabled(*kind));
            } else {
                enabled.push(Arc::clone(driver));
            }
        }

        self.progress(
            StartupPhase::Starting,
            format!("Starting {} service(s)", enabled.len()),
            20,
        );

        let starter = ServiceStarter::new(
            Arc::clone(&self.registry),
            self.events.clone(),
            abandon.clone(),
        );
        let policy = self.config.retry_policy();

        let handles: Vec<_> = enabled
            .iter()
            .map(|driver| {
                let starter = starter.clone();
                let policy = policy.clone();
                let driver = Arc::clone(driver);
                let kind = driver.kind();
                let handle =
                    tokio::spawn(async move { starter.start(driver.as_ref(), &policy).await });
                (kind, handle)
            })
            .collect();

        for (kind, handle) in handles {
            let result = match handle.await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    let attempts = self.registry.get(kind).attempts;
                    let result = ServiceStartResult::fallback(kind, attempts, e.to_string());
                    if e.is_fatal() {
                        output.fatal.lock().get_or_insert(e);
                    }
                    result
                }
                Err(e) => {
                    error!("Starter task for {} failed: {}", kind, e);
                    self.registry
                        .update(kind, |s| s.mark_failed("starter task failed"));
                    ServiceStartResult::fallback(kind, self.registry.get(kind).attempts, e.to_string())
                }
            };
            output.results.lock().insert(kind, result);
        }

        let running = enabled
            .iter()
            .filter(|d| self.registry.get(d.kind()).status == RunStatus::Running)
            .count();
        let message = if enabled.is_empty() {
            "All services disabled".to_string()
        } else if running == enabled.len() {
            "All services healthy".to_string()
        } else if running == 0 {
            "All services failed".to_string()
        } else {
            format!("Partial startup: {}/{} services healthy", running, enabled.len())
        };
        self.progress(StartupPhase::Starting, message, 90);
    }

    fn mark_timed_out(&self, overall: std::time::Duration) {
        for kind in ServiceKind::ALL {
            let timed_out = self.registry.update(kind, |s| {
                // A process that exited mid-startup leaves the slot stopped
                if matches!(
                    s.status,
                    RunStatus::Starting | RunStatus::NotStarted | RunStatus::Stopped
                ) {
                    s.mark_failed("startup timed out");
                    true
                } else {
                    false
                }
            });
            if timed_out {
                self.registry
                    .push_error(format!("{}: startup timed out after {:?}", kind, overall));
            }
        }
    }

    /// Record every unavailable service as missing and stop what it left behind.
    ///
    /// Returns whether degraded mode is in effect.
    async fn degrade(&self) -> bool {
        let unavailable: Vec<ServiceKind> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|(_, s)| s.status.is_unavailable())
            .map(|(kind, _)| kind)
            .collect();

        if unavailable.is_empty() {
            return false;
        }

        self.set_phase(StartupPhase::Degrading);
        let state = self.registry.with_degraded_mode(|degraded| {
            for kind in &unavailable {
                degraded.add_missing(*kind);
            }
            degraded.clone()
        });

        for limitation in &state.limitations {
            warn!("Degraded mode: {}", limitation);
        }

        let stops = unavailable
            .iter()
            .filter_map(|kind| self.drivers.get(kind))
            .filter(|driver| driver.has_process())
            .map(|driver| driver.stop(self.config.grace_period()));
        join_all(stops).await;

        self.progress(
            StartupPhase::Degrading,
            format!("Continuing without {} service(s)", state.missing_services.len()),
            95,
        );
        state.enabled
    }
}
