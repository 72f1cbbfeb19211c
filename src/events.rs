use crate::error::EventBusError;
use crate::service::{Health, RunStatus, ServiceKind, ServiceStatus, StatusRegistry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Coarse startup phases reported to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupPhase {
    Idle,
    Preflight,
    Starting,
    Monitoring,
    Degrading,
    Complete,
    Failed,
    ShuttingDown,
    Stopped,
}

/// Notifications published by the supervisor
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WardenEvent {
    /// Startup progress with a snapshot of every service
    Progress {
        phase: StartupPhase,
        message: String,
        /// 0-100
        percent: u8,
        services: BTreeMap<ServiceKind, ServiceStatus>,
        errors: Vec<String>,
        details: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A service changed status or health outside of the startup sequence
    StatusChanged {
        service: ServiceKind,
        status: RunStatus,
        health: Health,
        details: String,
        timestamp: DateTime<Utc>,
    },
}

impl WardenEvent {
    /// Progress event carrying the current registry contents
    pub fn progress(
        phase: StartupPhase,
        message: impl Into<String>,
        percent: u8,
        registry: &StatusRegistry,
        details: Option<String>,
    ) -> Self {
        WardenEvent::Progress {
            phase,
            message: message.into(),
            percent: percent.min(100),
            services: registry.snapshot(),
            errors: registry.errors(),
            details,
            timestamp: Utc::now(),
        }
    }

    pub fn status_changed(service: ServiceKind, status: &ServiceStatus, details: impl Into<String>) -> Self {
        WardenEvent::StatusChanged {
            service,
            status: status.status,
            health: status.health,
            details: details.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            WardenEvent::Progress { timestamp, .. } => *timestamp,
            WardenEvent::StatusChanged { timestamp, .. } => *timestamp,
        }
    }

    /// Human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            WardenEvent::Progress {
                phase,
                message,
                percent,
                ..
            } => format!("[{:?} {}%] {}", phase, percent, message),
            WardenEvent::StatusChanged {
                service,
                status,
                health,
                details,
                ..
            } => format!("{} is {:?}/{:?}: {}", service, status, health, details),
        }
    }

    /// Event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            WardenEvent::Progress { .. } => "progress",
            WardenEvent::StatusChanged { .. } => "status_changed",
        }
    }
}

/// Fire-and-forget broadcast bus for progress and status notifications
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WardenEvent>,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WardenEvent> {
        self.sender.subscribe()
    }

    /// Publish to every subscriber; never blocks and never fails the caller.
    ///
    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: WardenEvent) -> usize {
        match &event {
            WardenEvent::StatusChanged {
                status: RunStatus::PermanentlyFailed | RunStatus::Failed,
                ..
            } => warn!("{}", event.description()),
            WardenEvent::StatusChanged { .. } => info!("{}", event.description()),
            WardenEvent::Progress { .. } => debug!("{}", event.description()),
        }

        // No subscribers is not an error for progress reporting
        self.sender.send(event).unwrap_or(0)
    }
}

/// Event filter for selective event handling
#[derive(Debug, Clone)]
pub enum EventFilter {
    All,
    /// Accept only specific event types
    EventTypes(Vec<&'static str>),
    /// Accept status changes of specific services
    Services(Vec<ServiceKind>),
    Custom(fn(&WardenEvent) -> bool),
}

impl EventFilter {
    pub fn matches(&self, event: &WardenEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::EventTypes(types) => types.contains(&event.event_type()),
            EventFilter::Services(services) => match event {
                WardenEvent::StatusChanged { service, .. } => services.contains(service),
                WardenEvent::Progress { .. } => false,
            },
            EventFilter::Custom(filter_fn) => filter_fn(event),
        }
    }
}

/// Named, filtered subscription handed to the host
pub struct EventReceiver {
    receiver: broadcast::Receiver<WardenEvent>,
    filter: EventFilter,
    name: String,
}

impl EventReceiver {
    pub fn new(
        receiver: broadcast::Receiver<WardenEvent>,
        filter: EventFilter,
        name: impl Into<String>,
    ) -> Self {
        Self {
            receiver,
            filter,
            name: name.into(),
        }
    }

    /// Receive the next event that passes the filter
    pub async fn recv(&mut self) -> Result<WardenEvent, EventBusError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Receiver '{}' lagged behind by {} events", self.name, n);
                    return Err(EventBusError::Lagged { skipped: n });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed for receiver '{}'", self.name);
                    return Err(EventBusError::ChannelClosed);
                }
            }
        }
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<Option<WardenEvent>, EventBusError> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Ok(Some(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("Receiver '{}' lagged behind by {} events", self.name, n);
                    return Err(EventBusError::Lagged { skipped: n });
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
            }
        }
    }
}
