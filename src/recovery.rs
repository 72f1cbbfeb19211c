use crate::backoff::backoff_delay;
use crate::config::CircuitBreakerConfig;
use crate::service::{Health, RunStatus, ServiceKind, ServiceStatus};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Outcome of feeding one probe result into the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeDecision {
    Healthy,
    /// Unhealthy, but below the restart threshold
    Failing { consecutive: u32 },
    /// Threshold reached; exactly one restart should be dispatched
    RestartRequested,
}

/// Outcome of a recovery attempt on a tripped breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recovered,
    /// Recovery failed; the next attempt waits `next_window`
    Retripped { next_window: Duration },
    /// Recovery attempts used up for this run
    Exhausted,
}

/// Failure-counting state machine over a [`ServiceStatus`].
///
/// Pure bookkeeping: callers own the probing, launching and locking, and feed
/// the results back in.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Record a routine probe result
    pub fn on_probe(&self, status: &mut ServiceStatus, healthy: bool) -> ProbeDecision {
        status.last_checked = Some(Utc::now());

        if healthy {
            status.consecutive_failures = 0;
            status.health = Health::Healthy;
            return ProbeDecision::Healthy;
        }

        status.consecutive_failures += 1;
        status.health = Health::Unhealthy;

        if status.consecutive_failures >= self.config.consecutive_failure_threshold {
            ProbeDecision::RestartRequested
        } else {
            ProbeDecision::Failing {
                consecutive: status.consecutive_failures,
            }
        }
    }

    /// Count a restart at dispatch time, whatever its outcome
    pub fn dispatch_restart(&self, status: &mut ServiceStatus) {
        status.consecutive_failures = 0;
        status.restart_count += 1;
    }

    /// Record the result of a dispatched restart; returns `true` if the breaker tripped.
    ///
    /// Reaching the trip threshold opens the breaker even when this restart verified.
    pub fn after_restart(
        &self,
        kind: ServiceKind,
        status: &mut ServiceStatus,
        verified: bool,
        now: Instant,
    ) -> bool {
        if verified {
            status.status = RunStatus::Running;
            status.health = Health::Healthy;
            status.last_error = None;
        } else {
            status.health = Health::Unhealthy;
        }

        if status.restart_count >= self.config.trip_threshold {
            self.trip(kind, status, now);
            return true;
        }

        if verified {
            info!(
                "{} restarted successfully (restart {} of {})",
                kind, status.restart_count, self.config.trip_threshold
            );
        } else {
            warn!(
                "{} restart did not verify (restart {} of {})",
                kind, status.restart_count, self.config.trip_threshold
            );
        }
        false
    }

    /// Open the breaker: no routine probing or restarts until recovery
    pub fn trip(&self, kind: ServiceKind, status: &mut ServiceStatus, now: Instant) {
        status.status = RunStatus::PermanentlyFailed;
        status.health = Health::PermanentlyFailed;
        status.circuit_breaker_tripped = true;
        status.circuit_breaker_tripped_at = Some(Utc::now());
        status.tripped_instant = Some(now);

        error!(
            "Circuit breaker tripped for {} after {} restarts; next recovery check in {:?}",
            kind,
            status.restart_count,
            self.recovery_window(status.recovery_attempts)
        );
    }

    /// `window * 2^attempts`, uncapped
    pub fn recovery_window(&self, attempts: u32) -> Duration {
        backoff_delay(attempts, self.config.recovery_window(), Duration::MAX)
    }

    /// Whether a tripped service's recovery window has elapsed
    pub fn recovery_due(&self, status: &ServiceStatus, now: Instant) -> bool {
        if !status.circuit_breaker_tripped || status.recovery_exhausted {
            return false;
        }

        match status.tripped_instant {
            Some(tripped) => {
                now.saturating_duration_since(tripped)
                    >= self.recovery_window(status.recovery_attempts)
            }
            None => true,
        }
    }

    /// Record the result of a recovery attempt
    pub fn on_recovery_result(
        &self,
        kind: ServiceKind,
        status: &mut ServiceStatus,
        verified: bool,
        now: Instant,
    ) -> RecoveryOutcome {
        if verified {
            self.reset(status);
            status.status = RunStatus::Running;
            status.health = Health::Healthy;
            status.last_error = None;
            info!("{} recovered, circuit breaker closed", kind);
            return RecoveryOutcome::Recovered;
        }

        status.recovery_attempts += 1;

        if status.recovery_attempts >= self.config.max_recovery_attempts {
            status.recovery_exhausted = true;
            error!(
                "{} recovery exhausted after {} attempts; disabled until the supervisor restarts",
                kind, status.recovery_attempts
            );
            return RecoveryOutcome::Exhausted;
        }

        status.circuit_breaker_tripped_at = Some(Utc::now());
        status.tripped_instant = Some(now);
        let next_window = self.recovery_window(status.recovery_attempts);
        warn!(
            "{} recovery attempt {} of {} failed, next check in {:?}",
            kind, status.recovery_attempts, self.config.max_recovery_attempts, next_window
        );

        RecoveryOutcome::Retripped { next_window }
    }

    /// Clear the breaker and every failure counter
    pub fn reset(&self, status: &mut ServiceStatus) {
        status.consecutive_failures = 0;
        status.restart_count = 0;
        status.recovery_attempts = 0;
        status.circuit_breaker_tripped = false;
        status.circuit_breaker_tripped_at = None;
        status.tripped_instant = None;
        status.recovery_exhausted = false;
    }
}

/// Reduced-functionality mode the host reads through the status snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DegradedModeState {
    pub enabled: bool,
    pub missing_services: BTreeSet<ServiceKind>,
    pub limitations: Vec<String>,
}

impl DegradedModeState {
    /// Record a missing service; limitations are only added once per service
    pub fn add_missing(&mut self, kind: ServiceKind) {
        if self.missing_services.insert(kind) {
            self.limitations
                .extend(limitations_for(kind).iter().map(|s| s.to_string()));
        }
        self.enabled = !self.missing_services.is_empty();
    }

    /// Forget a service that became available again
    pub fn remove_missing(&mut self, kind: ServiceKind) {
        if self.missing_services.remove(&kind) {
            self.limitations = self
                .missing_services
                .iter()
                .flat_map(|missing| limitations_for(*missing).iter())
                .map(|s| s.to_string())
                .collect();
        }
        self.enabled = !self.missing_services.is_empty();
    }

    pub fn is_missing(&self, kind: ServiceKind) -> bool {
        self.missing_services.contains(&kind)
    }
}

/// Features the host loses without a service
pub fn limitations_for(kind: ServiceKind) -> &'static [&'static str] {
    match kind {
        ServiceKind::VectorStore => &[
            "Semantic search over saved content is unavailable",
            "New content is not indexed for retrieval",
        ],
        ServiceKind::LlmRuntime => &[
            "AI text generation and chat are unavailable",
            "Suggestions fall back to non-AI heuristics",
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig::default())
    }

    fn running() -> ServiceStatus {
        let mut status = ServiceStatus::new(false);
        status.mark_running(false);
        status
    }

    #[test]
    fn test_threshold_requests_single_restart() {
        let breaker = breaker();
        let mut status = running();

        assert_eq!(
            breaker.on_probe(&mut status, false),
            ProbeDecision::Failing { consecutive: 1 }
        );
        assert_eq!(
            breaker.on_probe(&mut status, false),
            ProbeDecision::Failing { consecutive: 2 }
        );
        assert_eq!(
            breaker.on_probe(&mut status, false),
            ProbeDecision::RestartRequested
        );

        breaker.dispatch_restart(&mut status);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.restart_count, 1);

        // A healthy probe clears the streak
        breaker.on_probe(&mut status, false);
        assert_eq!(breaker.on_probe(&mut status, true), ProbeDecision::Healthy);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.health, Health::Healthy);
    }

    #[test]
    fn test_trip_after_restart_threshold() {
        let breaker = breaker();
        let mut status = running();
        let now = Instant::now();

        for _ in 0..4 {
            breaker.dispatch_restart(&mut status);
            assert!(!breaker.after_restart(ServiceKind::LlmRuntime, &mut status, false, now));
        }
        assert_eq!(status.status, RunStatus::Running);

        breaker.dispatch_restart(&mut status);
        assert!(breaker.after_restart(ServiceKind::LlmRuntime, &mut status, false, now));
        assert_eq!(status.status, RunStatus::PermanentlyFailed);
        assert_eq!(status.health, Health::PermanentlyFailed);
        assert!(status.circuit_breaker_tripped);
        assert!(status.circuit_breaker_tripped_at.is_some());
    }

    #[test]
    fn test_verified_restart_below_threshold_stays_closed() {
        let breaker = breaker();
        let mut status = running();
        status.restart_count = 3;
        status.health = Health::Unhealthy;

        breaker.dispatch_restart(&mut status);
        assert!(!breaker.after_restart(
            ServiceKind::VectorStore,
            &mut status,
            true,
            Instant::now()
        ));
        assert!(!status.circuit_breaker_tripped);
        assert_eq!(status.health, Health::Healthy);
        assert_eq!(status.restart_count, 4);
    }

    #[test]
    fn test_verified_restart_at_threshold_trips() {
        let breaker = breaker();
        let mut status = running();
        status.restart_count = 4;

        breaker.dispatch_restart(&mut status);
        assert!(breaker.after_restart(
            ServiceKind::VectorStore,
            &mut status,
            true,
            Instant::now()
        ));
        assert_eq!(status.status, RunStatus::PermanentlyFailed);
        assert_eq!(status.health, Health::PermanentlyFailed);
        assert!(status.circuit_breaker_tripped);
    }

    #[test]
    fn test_recovery_windows_double_until_exhausted() {
        let breaker = breaker();
        let mut status = running();
        let start = Instant::now();
        breaker.trip(ServiceKind::VectorStore, &mut status, start);

        assert!(!breaker.recovery_due(&status, start + Duration::from_secs(59)));
        assert!(breaker.recovery_due(&status, start + Duration::from_secs(60)));

        let mut now = start + Duration::from_secs(60);
        let mut expected = Duration::from_secs(120);
        for attempt in 1..5 {
            let outcome = breaker.on_recovery_result(ServiceKind::VectorStore, &mut status, false, now);
            assert_eq!(outcome, RecoveryOutcome::Retripped { next_window: expected });
            assert_eq!(status.recovery_attempts, attempt);

            assert!(!breaker.recovery_due(&status, now + expected - Duration::from_secs(1)));
            now += expected;
            assert!(breaker.recovery_due(&status, now));
            expected *= 2;
        }

        let outcome = breaker.on_recovery_result(ServiceKind::VectorStore, &mut status, false, now);
        assert_eq!(outcome, RecoveryOutcome::Exhausted);
        assert!(status.recovery_exhausted);
        assert_eq!(status.status, RunStatus::PermanentlyFailed);
        assert!(!breaker.recovery_due(&status, now + Duration::from_secs(100_000)));
    }

    #[test]
    fn test_successful_recovery_resets_counters() {
        let breaker = breaker();
        let mut status = running();
        let now = Instant::now();
        status.restart_count = 5;
        status.recovery_attempts = 2;
        breaker.trip(ServiceKind::LlmRuntime, &mut status, now);

        let outcome = breaker.on_recovery_result(ServiceKind::LlmRuntime, &mut status, true, now);
        assert_eq!(outcome, RecoveryOutcome::Recovered);
        assert_eq!(status.status, RunStatus::Running);
        assert_eq!(status.restart_count, 0);
        assert_eq!(status.recovery_attempts, 0);
        assert!(!status.circuit_breaker_tripped);
        assert!(status.tripped_instant.is_none());
    }

    #[test]
    fn test_degraded_mode_tracks_missing_services() {
        let mut degraded = DegradedModeState::default();
        assert!(!degraded.enabled);
        assert!(degraded.limitations.is_empty());

        degraded.add_missing(ServiceKind::LlmRuntime);
        degraded.add_missing(ServiceKind::LlmRuntime);
        assert!(degraded.enabled);
        assert!(degraded.is_missing(ServiceKind::LlmRuntime));
        assert!(!degraded.is_missing(ServiceKind::VectorStore));
        assert_eq!(
            degraded.limitations.len(),
            limitations_for(ServiceKind::LlmRuntime).len()
        );

        degraded.add_missing(ServiceKind::VectorStore);
        degraded.remove_missing(ServiceKind::LlmRuntime);
        assert!(degraded.enabled);
        assert_eq!(
            degraded.limitations.len(),
            limitations_for(ServiceKind::VectorStore).len()
        );

        degraded.remove_missing(ServiceKind::VectorStore);
        assert!(!degraded.enabled);
        assert!(degraded.limitations.is_empty());
    }
}
