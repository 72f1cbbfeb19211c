//! Bounded-retry service start: probe, launch, verify.

use crate::backoff::{poll_interval, RetryPolicy};
use crate::driver::{LaunchOutcome, ServiceDriver, SpawnFailure};
use crate::error::{Result, WardenError};
use crate::events::{EventBus, StartupPhase, WardenEvent};
use crate::service::{Health, RunStatus, ServiceKind, StatusRegistry};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Grace given to the losing process after a bind conflict
const BIND_CONFLICT_STOP_GRACE: Duration = Duration::from_secs(1);

/// Grace given to a process spawned by an abandoned attempt
const ABANDONED_STOP_GRACE: Duration = Duration::from_secs(2);

/// Outcome of one service start
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStartResult {
    pub service: ServiceKind,
    pub success: bool,
    pub already_running: bool,
    pub external: bool,
    /// The host should continue without this service
    pub fallback_mode: bool,
    pub error: Option<String>,
    pub attempts: u32,
}

impl ServiceStartResult {
    fn started(service: ServiceKind, attempts: u32, already_running: bool, external: bool) -> Self {
        Self {
            service,
            success: true,
            already_running,
            external,
            fallback_mode: false,
            error: None,
            attempts,
        }
    }

    /// Unsuccessful start; the host continues without the service
    pub fn fallback(service: ServiceKind, attempts: u32, error: impl Into<String>) -> Self {
        Self {
            service,
            success: false,
            already_running: false,
            external: false,
            fallback_mode: true,
            error: Some(error.into()),
            attempts,
        }
    }

    /// Result for a service skipped by configuration
    pub fn disabled(service: ServiceKind) -> Self {
        Self::fallback(service, 0, "disabled by configuration")
    }
}

enum Verification {
    Healthy { external: bool },
    Failed(WardenError),
}

/// Runs the start sequence for one service at a time
#[derive(Clone)]
pub struct ServiceStarter {
    registry: Arc<StatusRegistry>,
    events: EventBus,
    abandon: CancellationToken,
}

impl ServiceStarter {
    pub fn new(registry: Arc<StatusRegistry>, events: EventBus, abandon: CancellationToken) -> Self {
        Self {
            registry,
            events,
            abandon,
        }
    }

    /// Bring one service up with bounded retries.
    ///
    /// Only a required service that exhausts its attempts produces an error;
    /// every other failure is recorded and returned as a fallback result.
    pub async fn start(
        &self,
        driver: &dyn ServiceDriver,
        policy: &RetryPolicy,
    ) -> Result<ServiceStartResult> {
        let kind = driver.kind();
        let max_attempts = policy.max_retries.max(1);
        let mut last_error: Option<String> = None;
        let mut attempts = 0;

        if self.abandon.is_cancelled() {
            return Ok(self.abandoned(driver, attempts).await);
        }

        self.registry.update(kind, |s| {
            s.status = RunStatus::Starting;
            s.health = Health::Unknown;
            s.attempts = 0;
            s.last_error = None;
        });

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = policy.delay_before(attempt);
                debug!("Waiting {:?} before starting {} again", delay, kind);
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = self.abandon.cancelled() => {}
                }
            }

            if self.abandon.is_cancelled() {
                return Ok(self.abandoned(driver, attempts).await);
            }

            attempts = attempt + 1;
            self.registry.update(kind, |s| {
                s.status = RunStatus::Starting;
                s.attempts = attempts;
            });
            self.report(
                kind,
                format!("Starting {} (attempt {}/{})", kind, attempts, max_attempts),
                attempt,
                max_attempts,
            );

            if driver.probe().await {
                info!("{} is already running", kind);
                let external = driver.is_external();
                return Ok(self.succeed(driver, attempts, true, external).await);
            }

            if self.abandon.is_cancelled() {
                return Ok(self.abandoned(driver, attempts).await);
            }

            let error = match driver.launch().await {
                Ok(LaunchOutcome::AlreadyServing) => {
                    info!("{} is served by an existing instance", kind);
                    return Ok(self.succeed(driver, attempts, true, true).await);
                }
                Ok(LaunchOutcome::Unavailable(reason)) => {
                    return self.unavailable(driver, attempts, reason);
                }
                Ok(LaunchOutcome::Spawned { pid }) => {
                    debug!("{} spawned with pid {:?}, verifying health", kind, pid);
                    match self.verify(driver, policy).await {
                        Verification::Healthy { external } => {
                            info!("{} is healthy after {} attempt(s)", kind, attempts);
                            return Ok(self.succeed(driver, attempts, external, external).await);
                        }
                        Verification::Failed(e) => e,
                    }
                }
                Err(e) => e,
            };

            warn!(
                "Attempt {}/{} to start {} failed: {}",
                attempts, max_attempts, kind, error
            );
            let message = error.to_string();
            self.registry
                .update(kind, |s| s.last_error = Some(message.clone()));
            last_error = Some(message);
        }

        if self.abandon.is_cancelled() {
            return Ok(self.abandoned(driver, attempts).await);
        }

        let error = last_error.unwrap_or_else(|| "no start attempt was made".to_string());
        self.fail(driver, attempts, error)
    }

    async fn succeed(
        &self,
        driver: &dyn ServiceDriver,
        attempts: u32,
        already_running: bool,
        external: bool,
    ) -> ServiceStartResult {
        // The orchestrator has already degraded this service; do not contradict it
        if self.abandon.is_cancelled() {
            return self.abandoned(driver, attempts).await;
        }

        self.registry
            .update(driver.kind(), |s| s.mark_running(external));
        ServiceStartResult::started(driver.kind(), attempts, already_running, external)
    }

    /// Finish a dangling attempt after the overall startup timeout
    async fn abandoned(&self, driver: &dyn ServiceDriver, attempts: u32) -> ServiceStartResult {
        let kind = driver.kind();
        info!("Startup abandoned, giving up on {}", kind);

        if driver.has_process() {
            driver.stop(ABANDONED_STOP_GRACE).await;
        }

        self.registry.update(kind, |s| {
            if matches!(
                s.status,
                RunStatus::Starting | RunStatus::NotStarted | RunStatus::Stopped
            ) {
                s.mark_failed("startup timed out");
            }
        });

        ServiceStartResult::fallback(kind, attempts, "startup abandoned")
    }

    /// Poll the new process until it answers, exits, or the verify window ends
    async fn verify(&self, driver: &dyn ServiceDriver, policy: &RetryPolicy) -> Verification {
        let kind = driver.kind();
        let deadline = Instant::now() + policy.verify_timeout;
        let mut poll = 0;

        loop {
            if driver.probe().await {
                return Verification::Healthy { external: false };
            }

            match driver.spawn_failure() {
                Some(SpawnFailure::BindConflict(reason)) => {
                    return self.bind_conflict_grace(driver, policy, reason).await;
                }
                Some(SpawnFailure::Exited(state)) => {
                    return Verification::Failed(WardenError::spawn(
                        kind,
                        format!("exited before becoming healthy ({:?})", state),
                    ));
                }
                None => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Verification::Failed(WardenError::VerifyTimeout {
                    service: kind,
                    timeout: policy.verify_timeout,
                });
            }

            tokio::select! {
                _ = sleep(poll_interval(poll).min(deadline - now)) => {}
                _ = self.abandon.cancelled() => {
                    return Verification::Failed(WardenError::system(format!(
                        "startup abandoned while verifying {}",
                        kind
                    )));
                }
            }
            poll += 1;
        }
    }

    /// Another instance may have won the port; give it a bounded window to answer
    async fn bind_conflict_grace(
        &self,
        driver: &dyn ServiceDriver,
        policy: &RetryPolicy,
        reason: String,
    ) -> Verification {
        let kind = driver.kind();
        warn!(
            "{} could not bind its port ({}), probing for {:?}",
            kind, reason, policy.bind_conflict_grace
        );

        let deadline = Instant::now() + policy.bind_conflict_grace;
        let mut poll = 0;

        loop {
            if driver.probe().await {
                info!("{} is served by another process, adopting it", kind);
                driver.stop(BIND_CONFLICT_STOP_GRACE).await;
                return Verification::Healthy { external: true };
            }

            let now = Instant::now();
            if now >= deadline {
                driver.stop(BIND_CONFLICT_STOP_GRACE).await;
                return Verification::Failed(WardenError::spawn(kind, reason));
            }

            sleep(poll_interval(poll).min(deadline - now)).await;
            poll += 1;
        }
    }

    fn unavailable(
        &self,
        driver: &dyn ServiceDriver,
        attempts: u32,
        reason: String,
    ) -> Result<ServiceStartResult> {
        let kind = driver.kind();
        warn!("{} cannot be launched: {}", kind, reason);

        let required = self.registry.update(kind, |s| {
            s.status = RunStatus::Disabled;
            s.health = Health::MissingDependency;
            s.last_error = Some(reason.clone());
            s.required
        });
        self.registry.push_error(format!("{}: {}", kind, reason));

        if required {
            return Err(WardenError::RequiredServiceFailed {
                service: kind,
                attempts,
            });
        }
        Ok(ServiceStartResult::fallback(kind, attempts, reason))
    }

    fn fail(
        &self,
        driver: &dyn ServiceDriver,
        attempts: u32,
        error: String,
    ) -> Result<ServiceStartResult> {
        let kind = driver.kind();
        error!("{} failed to start after {} attempt(s): {}", kind, attempts, error);

        let required = self.registry.update(kind, |s| {
            s.mark_failed(error.clone());
            s.required
        });
        self.registry.push_error(format!("{}: {}", kind, error));
        self.report(kind, format!("{} failed to start", kind), attempts, attempts);

        if required {
            return Err(WardenError::RequiredServiceFailed {
                service: kind,
                attempts,
            });
        }
        Ok(ServiceStartResult::fallback(kind, attempts, error))
    }

    fn report(&self, kind: ServiceKind, message: String, attempt: u32, max_attempts: u32) {
        // Starting occupies the 20-80% band of overall progress
        let percent = 20 + (60 * attempt / max_attempts.max(1)).min(60) as u8;
        self.events.publish(WardenEvent::progress(
            StartupPhase::Starting,
            message,
            percent,
            &self.registry,
            Some(kind.to_string()),
        ));
    }
}
