use super::types::StartupState;
use super::Supervisor;
use crate::events::StartupPhase;
use crate::process::StopOutcome;
use crate::service::{Health, RunStatus};
use futures::future::join_all;
use tracing::{info, warn};

impl Supervisor {
    /// Stop monitoring and every owned process; safe to call more than once
    pub async fn shutdown(&self) {
        if self.startup_state() == StartupState::Stopped {
            info!("Supervisor already stopped");
            return;
        }

        info!("Beginning graceful shutdown");
        self.set_lifecycle(StartupState::ShuttingDown, StartupPhase::ShuttingDown);

        // Starters still running past an abandoned startup must not spawn again
        self.abandon.lock().cancel();
        self.monitor.stop().await;

        let grace = self.config.grace_period();
        let stops = self.drivers.values().map(|driver| async move {
            let kind = driver.kind();
            let outcome = driver.stop(grace).await;
            (kind, outcome)
        });

        for (kind, outcome) in join_all(stops).await {
            match outcome {
                StopOutcome::NotRunning => {}
                StopOutcome::AlreadyExited => info!("{} had already exited", kind),
                StopOutcome::Graceful => info!("{} stopped", kind),
                StopOutcome::Forced => warn!("{} ignored SIGTERM and was killed", kind),
                StopOutcome::Unresponsive => {
                    warn!("{} did not exit after being killed", kind)
                }
            }
        }

        for kind in self.drivers.keys() {
            self.registry.update(*kind, |s| {
                s.status = RunStatus::Stopped;
                s.health = Health::Unknown;
                s.pid = None;
            });
        }

        self.set_lifecycle(StartupState::Stopped, StartupPhase::Stopped);
        self.progress(StartupPhase::Stopped, "All services stopped", 100);
        info!("Graceful shutdown complete");
    }
}
