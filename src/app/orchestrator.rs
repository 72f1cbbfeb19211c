use super::types::{ShutdownReason, StartupState};
use crate::config::WardenConfig;
use crate::driver::{ManagedService, ServiceDriver};
use crate::error::Result;
use crate::events::{EventBus, EventFilter, EventReceiver, StartupPhase};
use crate::health::{HealthMonitor, RestartLocks};
use crate::service::{ServiceKind, StatusRegistry};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

const EVENT_BUS_CAPACITY: usize = 256;

/// Supervises the vector store and the LLM runtime for one host process
pub struct Supervisor {
    pub(super) config: WardenConfig,
    pub(super) registry: Arc<StatusRegistry>,
    pub(super) events: EventBus,
    pub(super) drivers: BTreeMap<ServiceKind, Arc<dyn ServiceDriver>>,
    pub(super) monitor: HealthMonitor,

    // Lifecycle management
    pub(super) lifecycle: RwLock<(StartupState, StartupPhase)>,
    pub(super) abandon: Mutex<CancellationToken>,
    pub(super) shutdown_sender: Option<oneshot::Sender<ShutdownReason>>,
    pub(super) shutdown_receiver: Option<oneshot::Receiver<ShutdownReason>>,
}

impl Supervisor {
    /// Create a supervisor that launches services as configured
    pub fn new(config: WardenConfig) -> Result<Self> {
        let registry = Arc::new(StatusRegistry::new(|kind| config.service(kind).required));
        let events = EventBus::new(EVENT_BUS_CAPACITY);

        let mut drivers: Vec<Arc<dyn ServiceDriver>> = Vec::new();
        for kind in ServiceKind::ALL {
            drivers.push(Arc::new(ManagedService::new(
                kind,
                &config,
                Arc::clone(&registry),
                events.clone(),
            )?));
        }

        Ok(Self::assemble(config, registry, events, drivers))
    }

    /// Create a supervisor over caller-provided drivers
    pub fn with_drivers(config: WardenConfig, drivers: Vec<Arc<dyn ServiceDriver>>) -> Self {
        let registry = Arc::new(StatusRegistry::new(|kind| config.service(kind).required));
        let events = EventBus::new(EVENT_BUS_CAPACITY);
        Self::assemble(config, registry, events, drivers)
    }

    fn assemble(
        config: WardenConfig,
        registry: Arc<StatusRegistry>,
        events: EventBus,
        drivers: Vec<Arc<dyn ServiceDriver>>,
    ) -> Self {
        let locks = Arc::new(RestartLocks::default());
        let monitor = HealthMonitor::new(
            &config,
            drivers.clone(),
            Arc::clone(&registry),
            events.clone(),
            locks,
        );
        let drivers = drivers.into_iter().map(|d| (d.kind(), d)).collect();
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();

        Self {
            config,
            registry,
            events,
            drivers,
            monitor,
            lifecycle: RwLock::new((StartupState::NotStarted, StartupPhase::Idle)),
            abandon: Mutex::new(CancellationToken::new()),
            shutdown_sender: Some(shutdown_sender),
            shutdown_receiver: Some(shutdown_receiver),
        }
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    /// Receive every progress and status event
    pub fn subscribe(&self) -> EventReceiver {
        self.subscribe_filtered(EventFilter::All, "host")
    }

    pub fn subscribe_filtered(&self, filter: EventFilter, name: &str) -> EventReceiver {
        EventReceiver::new(self.events.subscribe(), filter, name)
    }

    /// Health monitor, for hosts that drive cycles themselves
    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }
}
