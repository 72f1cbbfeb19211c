//! Continuous health monitoring with circuit-breaker driven recovery.

use crate::config::WardenConfig;
use crate::driver::{await_healthy, LaunchOutcome, ServiceDriver};
use crate::error::{Result, WardenError};
use crate::events::{EventBus, WardenEvent};
use crate::recovery::{CircuitBreaker, ProbeDecision, RecoveryOutcome};
use crate::service::{Health, RunStatus, ServiceKind, ServiceStatus, StatusRegistry};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Per-service restart locks shared by the monitor and manual recovery
#[derive(Debug)]
pub struct RestartLocks {
    locks: BTreeMap<ServiceKind, Arc<AsyncMutex<()>>>,
}

impl Default for RestartLocks {
    fn default() -> Self {
        Self {
            locks: ServiceKind::ALL
                .iter()
                .map(|kind| (*kind, Arc::new(AsyncMutex::new(()))))
                .collect(),
        }
    }
}

impl RestartLocks {
    /// Take the lock without waiting; `None` means a restart is in flight
    pub fn try_acquire(&self, kind: ServiceKind) -> Option<OwnedMutexGuard<()>> {
        self.locks
            .get(&kind)
            .and_then(|lock| Arc::clone(lock).try_lock_owned().ok())
    }

    pub fn is_locked(&self, kind: ServiceKind) -> bool {
        self.locks
            .get(&kind)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}

struct Holder {
    generation: u64,
    acquired: Instant,
}

/// Single-flight guard for monitoring cycles with a stuck-holder watchdog
pub struct CycleGuard {
    holder: parking_lot::Mutex<Option<Holder>>,
    generations: AtomicU64,
    stuck_ceiling: Duration,
}

impl CycleGuard {
    pub fn new(stuck_ceiling: Duration) -> Self {
        Self {
            holder: parking_lot::Mutex::new(None),
            generations: AtomicU64::new(0),
            stuck_ceiling,
        }
    }

    /// Acquire for a new cycle, force-releasing a holder stuck past the ceiling
    pub fn try_acquire(&self) -> Option<CyclePermit<'_>> {
        let mut holder = self.holder.lock();

        if let Some(current) = holder.as_ref() {
            let held = current.acquired.elapsed();
            if held < self.stuck_ceiling {
                return None;
            }
            warn!(
                "Health cycle {} held the guard for {:?}, force-releasing",
                current.generation, held
            );
        }

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        *holder = Some(Holder {
            generation,
            acquired: Instant::now(),
        });

        Some(CyclePermit {
            guard: self,
            generation,
        })
    }

    /// Release only if `generation` still holds the guard
    fn release(&self, generation: u64) -> bool {
        let mut holder = self.holder.lock();
        match holder.as_ref() {
            Some(current) if current.generation == generation => {
                *holder = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_held(&self) -> bool {
        self.holder.lock().is_some()
    }
}

/// Held for the duration of one cycle; releases on drop
pub struct CyclePermit<'a> {
    guard: &'a CycleGuard,
    generation: u64,
}

impl CyclePermit<'_> {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for CyclePermit<'_> {
    fn drop(&mut self) {
        if !self.guard.release(self.generation) {
            debug!(
                "Health cycle {} finished after its guard was force-released",
                self.generation
            );
        }
    }
}

/// What one monitoring cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub generation: Option<u64>,
    /// Another cycle held the guard
    pub skipped: bool,
    /// Probes that did not answer within the cycle ceiling; counted as failures
    pub timed_out: Vec<ServiceKind>,
    pub probed: Vec<ServiceKind>,
    pub restarted: Vec<ServiceKind>,
    pub recovery_attempted: Vec<ServiceKind>,
}

/// How a relaunch attempt ended
enum Relaunch {
    Verified { external: bool },
    Failed,
    /// The monitor was stopped before the service could be verified
    Cancelled,
}

/// Services the monitor probes: running, or exited unexpectedly
fn is_supervised(status: &ServiceStatus) -> bool {
    match status.status {
        RunStatus::Running => true,
        RunStatus::Stopped => status.health == Health::Unhealthy,
        _ => false,
    }
}

struct MonitorInner {
    drivers: Vec<Arc<dyn ServiceDriver>>,
    registry: Arc<StatusRegistry>,
    events: EventBus,
    breaker: CircuitBreaker,
    interval: Duration,
    cycle_ceiling: Duration,
    verify_timeout: Duration,
    grace: Duration,
    guard: CycleGuard,
    locks: Arc<RestartLocks>,
}

/// Recurring single-flight health checks over every driver
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
    running: parking_lot::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HealthMonitor {
    pub fn new(
        config: &WardenConfig,
        drivers: Vec<Arc<dyn ServiceDriver>>,
        registry: Arc<StatusRegistry>,
        events: EventBus,
        locks: Arc<RestartLocks>,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                drivers,
                registry,
                events,
                breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
                interval: config.health.interval(),
                cycle_ceiling: config.health.cycle_ceiling(),
                verify_timeout: config.retry_policy().verify_timeout,
                grace: config.grace_period(),
                guard: CycleGuard::new(config.health.stuck_cycle_ceiling()),
                locks,
            }),
            running: parking_lot::Mutex::new(None),
        }
    }

    /// Start the recurring timer; the first cycle runs one interval from now
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            debug!("Health monitor already running");
            return;
        }

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let inner = Arc::clone(&self.inner);
        let period = inner.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut cycles = JoinSet::new();

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let inner = Arc::clone(&inner);
                        let cycle_token = loop_token.child_token();
                        cycles.spawn(async move { inner.cycle(&cycle_token).await });
                    }
                    Some(finished) = cycles.join_next(), if !cycles.is_empty() => {
                        if let Err(e) = finished {
                            warn!("Health cycle task failed: {}", e);
                        }
                    }
                }
            }

            // Cycles see the cancelled token; none may outlive stop()
            while let Some(finished) = cycles.join_next().await {
                if let Err(e) = finished {
                    warn!("Health cycle task failed: {}", e);
                }
            }

            debug!("Health monitor loop exited");
        });

        *running = Some((token, handle));
        info!("Health monitor started (interval {:?})", period);
    }

    /// Cancel the timer and wait for the loop and any in-flight cycle
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some((token, handle)) = running else {
            return;
        };

        token.cancel();
        if let Err(e) = handle.await {
            warn!("Health monitor loop ended abnormally: {}", e);
        }
        info!("Health monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Run one cycle now, subject to the single-flight guard
    pub async fn run_cycle(&self) -> CycleReport {
        self.inner.cycle(&CancellationToken::new()).await
    }

    /// Reset the breaker and restart immediately, bypassing the recovery window
    pub async fn force_recovery(&self, kind: ServiceKind) -> Result<bool> {
        self.inner.force_recovery(kind).await
    }
}

impl MonitorInner {
    fn driver(&self, kind: ServiceKind) -> Option<&Arc<dyn ServiceDriver>> {
        self.drivers.iter().find(|d| d.kind() == kind)
    }

    async fn cycle(&self, cancel: &CancellationToken) -> CycleReport {
        let Some(permit) = self.guard.try_acquire() else {
            debug!("Previous health cycle still running, skipping");
            return CycleReport {
                skipped: true,
                ..Default::default()
            };
        };

        let mut report = CycleReport {
            generation: Some(permit.generation()),
            ..Default::default()
        };
        let started = Instant::now();

        let candidates: Vec<&Arc<dyn ServiceDriver>> = self
            .drivers
            .iter()
            .filter(|d| {
                is_supervised(&self.registry.get(d.kind())) && !self.locks.is_locked(d.kind())
            })
            .collect();
        report.probed = candidates.iter().map(|d| d.kind()).collect();

        let probes = join_all(candidates.iter().map(|d| async move {
            match timeout(self.cycle_ceiling, d.probe()).await {
                Ok(healthy) => (d.kind(), Some(healthy)),
                Err(_) => (d.kind(), None),
            }
        }));

        let results = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Health monitor stopping, abandoning probes");
                return report;
            }
            results = probes => results,
        };

        let mut restarts = Vec::new();
        for (kind, healthy) in results {
            let healthy = healthy.unwrap_or_else(|| {
                warn!(
                    "{} health probe did not answer within {:?}",
                    kind, self.cycle_ceiling
                );
                report.timed_out.push(kind);
                false
            });
            if self.record_probe(kind, healthy) == Some(ProbeDecision::RestartRequested) {
                restarts.push(kind);
            }
        }

        let due: Vec<ServiceKind> = self
            .drivers
            .iter()
            .map(|d| d.kind())
            .filter(|kind| self.breaker.recovery_due(&self.registry.get(*kind), started))
            .collect();

        if cancel.is_cancelled() {
            debug!("Health monitor stopping, skipping restart actions");
            return report;
        }

        let restart_actions = join_all(restarts.iter().map(|kind| self.restart(*kind, cancel)));
        let recovery_actions = join_all(due.iter().map(|kind| self.recover(*kind, cancel)));
        let (restarted, recovered) = futures::join!(restart_actions, recovery_actions);

        report.restarted = restarted.into_iter().flatten().collect();
        report.recovery_attempted = recovered.into_iter().flatten().collect();

        trace!(
            "Health cycle {} finished in {:?}",
            permit.generation(),
            started.elapsed()
        );
        report
    }

    /// Feed one probe result into the breaker
    fn record_probe(&self, kind: ServiceKind, healthy: bool) -> Option<ProbeDecision> {
        let (decision, changed, status) = self.registry.update(kind, |s| {
            // The slot may have been tripped or stopped while probing
            if !is_supervised(s) {
                return (None, false, s.clone());
            }

            let before = (s.status, s.health);
            let decision = self.breaker.on_probe(s, healthy);
            if healthy && s.status == RunStatus::Stopped {
                s.status = RunStatus::Running;
            }
            (Some(decision), before != (s.status, s.health), s.clone())
        });

        match decision {
            Some(ProbeDecision::Failing { consecutive }) => {
                debug!("{} health check failed ({} in a row)", kind, consecutive);
            }
            Some(ProbeDecision::RestartRequested) => {
                warn!(
                    "{} failed {} health checks in a row, requesting restart",
                    kind, status.consecutive_failures
                );
            }
            _ => {}
        }

        if changed {
            let details = if healthy { "health check passed" } else { "health check failed" };
            self.events
                .publish(WardenEvent::status_changed(kind, &status, details));
        }

        decision
    }

    async fn restart(&self, kind: ServiceKind, cancel: &CancellationToken) -> Option<ServiceKind> {
        let driver = self.driver(kind)?;
        let Some(_lock) = self.locks.try_acquire(kind) else {
            debug!("Restart of {} already in progress, skipping", kind);
            return None;
        };

        let status = self.registry.update(kind, |s| {
            self.breaker.dispatch_restart(s);
            s.clone()
        });
        info!(
            "Restarting {} (restart {} of {})",
            kind,
            status.restart_count,
            self.breaker.config().trip_threshold
        );
        self.events
            .publish(WardenEvent::status_changed(kind, &status, "restarting"));

        let result = match self.restart_and_verify(driver.as_ref(), cancel).await {
            Relaunch::Verified { external } => Some(external),
            Relaunch::Failed => None,
            Relaunch::Cancelled => {
                debug!("Restart of {} abandoned, monitor stopping", kind);
                return None;
            }
        };

        let (tripped, status) = self.registry.update(kind, |s| {
            if let Some(external) = result {
                s.external = external;
            }
            let tripped = self
                .breaker
                .after_restart(kind, s, result.is_some(), Instant::now());
            (tripped, s.clone())
        });

        if tripped {
            self.registry
                .with_degraded_mode(|degraded| degraded.add_missing(kind));
            driver.stop(self.grace).await;
        }

        let details = match (result.is_some(), tripped) {
            (_, true) => "circuit breaker tripped",
            (true, false) => "restart verified",
            (false, false) => "restart failed",
        };
        self.events
            .publish(WardenEvent::status_changed(kind, &status, details));

        Some(kind)
    }

    async fn recover(&self, kind: ServiceKind, cancel: &CancellationToken) -> Option<ServiceKind> {
        let driver = self.driver(kind)?;
        let Some(_lock) = self.locks.try_acquire(kind) else {
            debug!("Recovery of {} already in progress, skipping", kind);
            return None;
        };

        // A forced recovery may have closed the breaker in the meantime
        if !self
            .breaker
            .recovery_due(&self.registry.get(kind), Instant::now())
        {
            return None;
        }

        info!("Recovery window elapsed, attempting to recover {}", kind);
        let result = match self.restart_and_verify(driver.as_ref(), cancel).await {
            Relaunch::Verified { external } => Some(external),
            Relaunch::Failed => None,
            Relaunch::Cancelled => {
                debug!("Recovery of {} abandoned, monitor stopping", kind);
                return None;
            }
        };

        let (outcome, status) = self.registry.update(kind, |s| {
            let outcome = self
                .breaker
                .on_recovery_result(kind, s, result.is_some(), Instant::now());
            if let Some(external) = result {
                s.external = external;
            }
            (outcome, s.clone())
        });

        let details = match outcome {
            RecoveryOutcome::Recovered => {
                self.registry
                    .with_degraded_mode(|degraded| degraded.remove_missing(kind));
                "recovered".to_string()
            }
            RecoveryOutcome::Retripped { next_window } => {
                driver.stop(self.grace).await;
                format!("recovery failed, next attempt in {:?}", next_window)
            }
            RecoveryOutcome::Exhausted => {
                driver.stop(self.grace).await;
                "recovery attempts exhausted".to_string()
            }
        };
        self.events
            .publish(WardenEvent::status_changed(kind, &status, details));

        Some(kind)
    }

    /// Relaunch and verify; no process is launched once `cancel` fires
    async fn restart_and_verify(
        &self,
        driver: &dyn ServiceDriver,
        cancel: &CancellationToken,
    ) -> Relaunch {
        let kind = driver.kind();

        let answering = tokio::select! {
            _ = cancel.cancelled() => return Relaunch::Cancelled,
            answering = timeout(self.cycle_ceiling, driver.probe()) => answering.unwrap_or(false),
        };
        if answering {
            info!("{} answers health checks again, no restart needed", kind);
            return Relaunch::Verified {
                external: driver.is_external() || !driver.has_process(),
            };
        }

        if cancel.is_cancelled() {
            return Relaunch::Cancelled;
        }

        match driver.launch().await {
            Ok(LaunchOutcome::AlreadyServing) => Relaunch::Verified { external: true },
            Ok(LaunchOutcome::Spawned { pid }) => {
                debug!("{} relaunched with pid {:?}", kind, pid);
                let healthy = tokio::select! {
                    _ = cancel.cancelled() => return Relaunch::Cancelled,
                    healthy = await_healthy(driver, self.verify_timeout) => healthy,
                };
                if healthy {
                    Relaunch::Verified {
                        external: driver.is_external(),
                    }
                } else {
                    warn!(
                        "{} did not become healthy within {:?} after restart",
                        kind, self.verify_timeout
                    );
                    Relaunch::Failed
                }
            }
            Ok(LaunchOutcome::Unavailable(reason)) => {
                warn!("{} cannot be relaunched: {}", kind, reason);
                Relaunch::Failed
            }
            Err(e) => {
                warn!("{} relaunch failed: {}", kind, e);
                Relaunch::Failed
            }
        }
    }

    async fn force_recovery(&self, kind: ServiceKind) -> Result<bool> {
        let driver = self
            .driver(kind)
            .ok_or_else(|| WardenError::UnknownService(kind.to_string()))?;
        let _lock = self
            .locks
            .try_acquire(kind)
            .ok_or(WardenError::RestartInProgress { service: kind })?;

        info!("Forcing recovery of {}", kind);
        self.registry.update(kind, |s| self.breaker.reset(s));

        // Host-initiated; stopping the monitor does not cancel it
        let result = match self
            .restart_and_verify(driver.as_ref(), &CancellationToken::new())
            .await
        {
            Relaunch::Verified { external } => Some(external),
            Relaunch::Failed | Relaunch::Cancelled => None,
        };

        let status = self.registry.update(kind, |s| {
            match result {
                Some(external) => s.mark_running(external),
                None => s.mark_failed("forced recovery did not produce a healthy service"),
            }
            s.clone()
        });

        if result.is_some() {
            self.registry
                .with_degraded_mode(|degraded| degraded.remove_missing(kind));
        } else {
            self.registry
                .with_degraded_mode(|degraded| degraded.add_missing(kind));
            driver.stop(self.grace).await;
        }

        let details = if result.is_some() {
            "forced recovery succeeded"
        } else {
            "forced recovery failed"
        };
        self.events
            .publish(WardenEvent::status_changed(kind, &status, details));

        Ok(result.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDriver;

    struct Harness {
        monitor: HealthMonitor,
        driver: Arc<FakeDriver>,
        registry: Arc<StatusRegistry>,
        locks: Arc<RestartLocks>,
    }

    fn harness(driver: FakeDriver) -> Harness {
        let mut config = WardenConfig::default();
        config.startup.verify_timeout_secs = 2;

        let driver = Arc::new(driver);
        let registry = Arc::new(StatusRegistry::new(|_| false));
        let locks = Arc::new(RestartLocks::default());
        registry.update(driver.kind(), |s| s.mark_running(false));

        let monitor = HealthMonitor::new(
            &config,
            vec![driver.clone() as Arc<dyn ServiceDriver>],
            Arc::clone(&registry),
            EventBus::new(64),
            Arc::clone(&locks),
        );

        Harness {
            monitor,
            driver,
            registry,
            locks,
        }
    }

    fn trip(h: &Harness) {
        let breaker = CircuitBreaker::new(Default::default());
        h.registry.update(ServiceKind::VectorStore, |s| {
            s.restart_count = 5;
            breaker.trip(ServiceKind::VectorStore, s, Instant::now());
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_triggers_exactly_one_restart() {
        let h = harness(FakeDriver::new(ServiceKind::VectorStore).heal_on_launch());

        for expected in 1..=2 {
            let report = h.monitor.run_cycle().await;
            assert!(report.restarted.is_empty());
            assert_eq!(
                h.registry.get(ServiceKind::VectorStore).consecutive_failures,
                expected
            );
        }

        let report = h.monitor.run_cycle().await;
        assert_eq!(report.restarted, vec![ServiceKind::VectorStore]);
        assert_eq!(h.driver.launches(), 1);

        let status = h.registry.get(ServiceKind::VectorStore);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.restart_count, 1);
        assert_eq!(status.health, Health::Healthy);
        assert_eq!(status.status, RunStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trip_stops_routine_probing() {
        let h = harness(FakeDriver::new(ServiceKind::VectorStore));
        h.registry.update(ServiceKind::VectorStore, |s| {
            s.restart_count = 4;
            s.consecutive_failures = 2;
        });

        let report = h.monitor.run_cycle().await;
        assert_eq!(report.restarted, vec![ServiceKind::VectorStore]);

        let status = h.registry.get(ServiceKind::VectorStore);
        assert_eq!(status.status, RunStatus::PermanentlyFailed);
        assert_eq!(status.health, Health::PermanentlyFailed);
        assert!(status.circuit_breaker_tripped);
        assert_eq!(status.restart_count, 5);
        assert_eq!(h.driver.stops(), 1);
        assert!(h
            .registry
            .degraded_mode()
            .unwrap()
            .is_missing(ServiceKind::VectorStore));

        let probes = h.driver.probes();
        let report = h.monitor.run_cycle().await;
        assert!(report.probed.is_empty());
        assert!(report.recovery_attempted.is_empty());
        assert_eq!(h.driver.probes(), probes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_waits_for_window() {
        let h = harness(FakeDriver::new(ServiceKind::VectorStore).heal_on_launch());
        trip(&h);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(h.monitor.run_cycle().await.recovery_attempted.is_empty());
        assert_eq!(h.driver.launches(), 0);

        tokio::time::advance(Duration::from_secs(30)).await;
        let report = h.monitor.run_cycle().await;
        assert_eq!(report.recovery_attempted, vec![ServiceKind::VectorStore]);

        let status = h.registry.get(ServiceKind::VectorStore);
        assert_eq!(status.status, RunStatus::Running);
        assert!(!status.circuit_breaker_tripped);
        assert_eq!(status.restart_count, 0);
        assert_eq!(status.recovery_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_recoveries_double_then_exhaust() {
        let h = harness(FakeDriver::new(ServiceKind::VectorStore));
        trip(&h);

        let mut window = Duration::from_secs(60);
        for attempt in 1..=5 {
            tokio::time::advance(window - Duration::from_secs(1)).await;
            assert!(h.monitor.run_cycle().await.recovery_attempted.is_empty());

            tokio::time::advance(Duration::from_secs(1)).await;
            let report = h.monitor.run_cycle().await;
            assert_eq!(report.recovery_attempted, vec![ServiceKind::VectorStore]);
            assert_eq!(h.driver.launches(), attempt);
            window *= 2;
        }

        let status = h.registry.get(ServiceKind::VectorStore);
        assert!(status.recovery_exhausted);
        assert_eq!(status.status, RunStatus::PermanentlyFailed);

        tokio::time::advance(Duration::from_secs(100_000)).await;
        assert!(h.monitor.run_cycle().await.recovery_attempted.is_empty());
        assert_eq!(h.driver.launches(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_probes_count_as_failures() {
        let h = harness(
            FakeDriver::new(ServiceKind::VectorStore).probe_delay(Duration::from_secs(10)),
        );

        for expected in 1..=2 {
            let report = h.monitor.run_cycle().await;
            assert_eq!(report.timed_out, vec![ServiceKind::VectorStore]);
            assert!(report.restarted.is_empty());
            assert_eq!(
                h.registry.get(ServiceKind::VectorStore).consecutive_failures,
                expected
            );
        }

        let report = h.monitor.run_cycle().await;
        assert_eq!(report.timed_out, vec![ServiceKind::VectorStore]);
        assert_eq!(report.restarted, vec![ServiceKind::VectorStore]);
        assert_eq!(h.driver.launches(), 1);

        let status = h.registry.get(ServiceKind::VectorStore);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.restart_count, 1);
        assert!(!status.circuit_breaker_tripped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verified_restart_reaching_threshold_trips() {
        let h = harness(FakeDriver::new(ServiceKind::VectorStore).heal_on_launch());
        h.registry.update(ServiceKind::VectorStore, |s| {
            s.restart_count = 4;
            s.consecutive_failures = 2;
        });

        let report = h.monitor.run_cycle().await;
        assert_eq!(report.restarted, vec![ServiceKind::VectorStore]);
        assert_eq!(h.driver.launches(), 1);

        let status = h.registry.get(ServiceKind::VectorStore);
        assert_eq!(status.restart_count, 5);
        assert_eq!(status.status, RunStatus::PermanentlyFailed);
        assert!(status.circuit_breaker_tripped);
        assert_eq!(h.driver.stops(), 1);
        assert!(!h.driver.has_process());
        assert!(h
            .registry
            .degraded_mode()
            .unwrap()
            .is_missing(ServiceKind::VectorStore));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_inflight_restart() {
        let h = harness(
            FakeDriver::new(ServiceKind::VectorStore)
                .probe_delay(Duration::from_secs(3))
                .heal_on_launch(),
        );
        h.registry
            .update(ServiceKind::VectorStore, |s| s.consecutive_failures = 2);

        h.monitor.start();

        // The cycle at 60s fails its probe at 63s and re-probes before relaunching
        tokio::time::sleep(Duration::from_secs(64)).await;
        assert_eq!(h.registry.get(ServiceKind::VectorStore).restart_count, 1);
        assert!(h.locks.is_locked(ServiceKind::VectorStore));

        h.monitor.stop().await;
        assert!(!h.locks.is_locked(ServiceKind::VectorStore));
        assert_eq!(h.driver.launches(), 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.driver.launches(), 0);
        assert!(!h.driver.has_process());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_force_recovery_enters_degraded_mode() {
        let h = harness(FakeDriver::new(ServiceKind::VectorStore));

        assert!(!h.monitor.force_recovery(ServiceKind::VectorStore).await.unwrap());
        assert_eq!(h.driver.launches(), 1);
        assert!(!h.driver.has_process());

        let status = h.registry.get(ServiceKind::VectorStore);
        assert_eq!(status.status, RunStatus::Failed);
        let degraded = h.registry.degraded_mode().unwrap();
        assert!(degraded.enabled);
        assert!(degraded.is_missing(ServiceKind::VectorStore));
        assert!(!degraded.limitations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarting_service_is_not_probed() {
        let h = harness(FakeDriver::new(ServiceKind::VectorStore));
        let _held = h.locks.try_acquire(ServiceKind::VectorStore).unwrap();

        let report = h.monitor.run_cycle().await;
        assert!(report.probed.is_empty());
        assert_eq!(h.driver.probes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_recovery_respects_restart_lock() {
        let h = harness(FakeDriver::new(ServiceKind::VectorStore).heal_on_launch());
        trip(&h);

        let held = h.locks.try_acquire(ServiceKind::VectorStore).unwrap();
        assert!(matches!(
            h.monitor.force_recovery(ServiceKind::VectorStore).await,
            Err(WardenError::RestartInProgress { .. })
        ));
        drop(held);

        assert!(h.monitor.force_recovery(ServiceKind::VectorStore).await.unwrap());
        let status = h.registry.get(ServiceKind::VectorStore);
        assert_eq!(status.status, RunStatus::Running);
        assert!(!status.circuit_breaker_tripped);
        assert_eq!(status.restart_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_guard_force_releases_stuck_holder() {
        let guard = CycleGuard::new(Duration::from_secs(5));

        let first = guard.try_acquire().unwrap();
        assert!(guard.try_acquire().is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        let second = guard.try_acquire().unwrap();
        assert!(second.generation() > first.generation());

        // The stale holder must not release its successor
        drop(first);
        assert!(guard.is_held());
        drop(second);
        assert!(!guard.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_runs_cycles_until_stopped() {
        let h = harness(FakeDriver::new(ServiceKind::VectorStore).healthy(true));

        h.monitor.start();
        assert!(h.monitor.is_running());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(h.driver.probes(), 1);

        h.monitor.stop().await;
        assert!(!h.monitor.is_running());

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(h.driver.probes(), 1);
    }
}
