//! Service identities and the shared status registry.

use crate::error::WardenError;
use crate::recovery::DegradedModeState;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tokio::time::Instant;
use tracing::debug;

/// The two supervised service slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    VectorStore,
    LlmRuntime,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 2] = [ServiceKind::VectorStore, ServiceKind::LlmRuntime];

    pub fn name(&self) -> &'static str {
        match self {
            ServiceKind::VectorStore => "vector-store",
            ServiceKind::LlmRuntime => "llm-runtime",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ServiceKind {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "vector-store" | "vectorstore" | "vector" => Ok(ServiceKind::VectorStore),
            "llm-runtime" | "llmruntime" | "llm" => Ok(ServiceKind::LlmRuntime),
            other => Err(WardenError::UnknownService(other.to_string())),
        }
    }
}

/// Lifecycle status of a service slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Starting,
    Running,
    Stopped,
    Failed,
    Disabled,
    PermanentlyFailed,
}

impl RunStatus {
    /// Terminal statuses that put the host into degraded mode
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            RunStatus::Failed | RunStatus::PermanentlyFailed | RunStatus::Disabled
        )
    }
}

/// Last known health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Unknown,
    Healthy,
    Unhealthy,
    Degraded,
    MissingDependency,
    PermanentlyFailed,
}

/// Supervision state of one service slot
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub status: RunStatus,
    pub health: Health,
    pub required: bool,
    pub attempts: u32,
    pub consecutive_failures: u32,
    pub restart_count: u32,
    pub recovery_attempts: u32,
    pub circuit_breaker_tripped: bool,
    pub circuit_breaker_tripped_at: Option<DateTime<Utc>>,
    /// Recovery gave up for the rest of this run
    pub recovery_exhausted: bool,
    pub external: bool,
    pub pid: Option<u32>,
    pub last_error: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
    /// Monotonic twin of `circuit_breaker_tripped_at` used for window arithmetic
    #[serde(skip)]
    pub tripped_instant: Option<Instant>,
}

impl ServiceStatus {
    pub fn new(required: bool) -> Self {
        Self {
            status: RunStatus::NotStarted,
            health: Health::Unknown,
            required,
            attempts: 0,
            consecutive_failures: 0,
            restart_count: 0,
            recovery_attempts: 0,
            circuit_breaker_tripped: false,
            circuit_breaker_tripped_at: None,
            recovery_exhausted: false,
            external: false,
            pid: None,
            last_error: None,
            last_checked: None,
            tripped_instant: None,
        }
    }

    pub fn mark_running(&mut self, external: bool) {
        self.status = RunStatus::Running;
        self.health = Health::Healthy;
        self.external = external;
        self.last_error = None;
        self.last_checked = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.health = Health::Unhealthy;
        self.last_error = Some(error.into());
    }
}

/// Process-scoped context shared by the starter, the health monitor and the
/// shutdown coordinator.
///
/// Every accessor takes the lock for the duration of one closure; the lock is
/// never held across an await point.
pub struct StatusRegistry {
    services: RwLock<BTreeMap<ServiceKind, ServiceStatus>>,
    errors: RwLock<Vec<String>>,
    degraded: RwLock<Option<DegradedModeState>>,
}

impl StatusRegistry {
    pub fn new(required: impl Fn(ServiceKind) -> bool) -> Self {
        let services = ServiceKind::ALL
            .iter()
            .map(|kind| (*kind, ServiceStatus::new(required(*kind))))
            .collect();

        Self {
            services: RwLock::new(services),
            errors: RwLock::new(Vec::new()),
            degraded: RwLock::new(None),
        }
    }

    /// Copy of a single service status
    pub fn get(&self, kind: ServiceKind) -> ServiceStatus {
        self.services
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| ServiceStatus::new(false))
    }

    /// Mutate one service status under the write lock
    pub fn update<R>(&self, kind: ServiceKind, f: impl FnOnce(&mut ServiceStatus) -> R) -> R {
        let mut services = self.services.write();
        let status = services
            .entry(kind)
            .or_insert_with(|| ServiceStatus::new(false));
        let result = f(status);
        debug!(
            "{} status now {:?}/{:?}",
            kind, status.status, status.health
        );
        result
    }

    /// Copy of every service status
    pub fn snapshot(&self) -> BTreeMap<ServiceKind, ServiceStatus> {
        self.services.read().clone()
    }

    pub fn push_error(&self, error: impl Into<String>) {
        self.errors.write().push(error.into());
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.read().clone()
    }

    pub fn clear_errors(&self) {
        self.errors.write().clear();
    }

    /// Degraded-mode state, if any required-but-unmet condition has occurred
    pub fn degraded_mode(&self) -> Option<DegradedModeState> {
        self.degraded.read().clone()
    }

    /// Mutate the degraded-mode state, creating it on first use
    pub fn with_degraded_mode<R>(&self, f: impl FnOnce(&mut DegradedModeState) -> R) -> R {
        let mut degraded = self.degraded.write();
        f(degraded.get_or_insert_with(DegradedModeState::default))
    }
}
