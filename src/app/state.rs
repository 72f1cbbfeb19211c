use super::types::{StartupState, StatusSnapshot};
use super::Supervisor;
use crate::error::Result;
use crate::events::{StartupPhase, WardenEvent};
use crate::service::ServiceKind;
use tracing::debug;

impl Supervisor {
    /// Update lifecycle state and phase
    pub(super) fn set_lifecycle(&self, state: StartupState, phase: StartupPhase) {
        *self.lifecycle.write() = (state, phase);
        debug!("Supervisor state changed to: {:?} ({:?})", state, phase);
    }

    pub(super) fn set_phase(&self, phase: StartupPhase) {
        self.lifecycle.write().1 = phase;
    }

    pub(super) fn progress(&self, phase: StartupPhase, message: impl Into<String>, percent: u8) {
        self.set_phase(phase);
        self.events.publish(WardenEvent::progress(
            phase,
            message,
            percent,
            &self.registry,
            None,
        ));
    }

    pub fn startup_state(&self) -> StartupState {
        self.lifecycle.read().0
    }

    /// Pollable snapshot of every service, the error list and degraded mode
    pub fn get_service_status(&self) -> StatusSnapshot {
        let (startup_state, phase) = *self.lifecycle.read();
        let degraded_mode = self.registry.degraded_mode();

        StatusSnapshot {
            startup_state,
            phase,
            services: self.registry.snapshot(),
            errors: self.registry.errors(),
            degraded: degraded_mode.as_ref().map(|d| d.enabled).unwrap_or(false),
            degraded_mode,
        }
    }

    /// Reset the breaker and restart `kind` now, under its restart lock
    pub async fn force_recovery(&self, kind: ServiceKind) -> Result<bool> {
        let recovered = self.monitor.force_recovery(kind).await?;

        if recovered {
            // Monitoring resumes for a service that came back
            if !matches!(
                self.startup_state(),
                StartupState::ShuttingDown | StartupState::Stopped
            ) {
                self.monitor.start();
            }
        }

        Ok(recovered)
    }
}
