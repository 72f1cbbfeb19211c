use crate::events::StartupPhase;
use crate::preflight::PreflightReport;
use crate::recovery::DegradedModeState;
use crate::service::{ServiceKind, ServiceStatus};
use crate::starter::ServiceStartResult;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Supervisor lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupState {
    NotStarted,
    InProgress,
    Completed,
    Degraded,
    Failed,
    ShuttingDown,
    Stopped,
}

/// System shutdown reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(String),
}

/// Summary of one startup sequence
#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    pub run_id: Uuid,
    pub preflight: PreflightReport,
    pub services: BTreeMap<ServiceKind, ServiceStartResult>,
    pub degraded: bool,
    /// The overall startup timeout fired
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl StartupReport {
    pub fn running_count(&self) -> usize {
        self.services.values().filter(|r| r.success).count()
    }
}

/// Pollable view of the supervisor for the host
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub startup_state: StartupState,
    pub phase: StartupPhase,
    pub services: BTreeMap<ServiceKind, ServiceStatus>,
    pub errors: Vec<String>,
    pub degraded: bool,
    pub degraded_mode: Option<DegradedModeState>,
}
