pub mod app;
pub mod backoff;
pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod health;
pub mod preflight;
pub mod probe;
pub mod process;
pub mod recovery;
pub mod service;
pub mod starter;

#[cfg(test)]
mod testing;

pub use app::{ShutdownReason, StartupReport, StartupState, StatusSnapshot, Supervisor};
pub use backoff::{backoff_delay, RetryPolicy};
pub use config::WardenConfig;
pub use driver::{LaunchOutcome, ManagedService, ServiceDriver, SpawnFailure};
pub use error::{EventBusError, Result, WardenError};
pub use events::{EventBus, EventFilter, EventReceiver, StartupPhase, WardenEvent};
pub use health::{CycleReport, HealthMonitor};
pub use preflight::{PreflightCheck, PreflightReport};
pub use probe::{HealthProbe, HttpHealthProbe};
pub use process::{ProcessState, SpawnPlan, SpawnPlanResolver, StopOutcome};
pub use recovery::{CircuitBreaker, DegradedModeState};
pub use service::{Health, RunStatus, ServiceKind, ServiceStatus, StatusRegistry};
pub use starter::ServiceStartResult;
