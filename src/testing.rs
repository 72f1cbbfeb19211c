//! Scriptable driver used by starter, monitor and supervisor tests.

use crate::driver::{LaunchOutcome, ServiceDriver, SpawnFailure};
use crate::error::Result;
use crate::process::StopOutcome;
use crate::service::ServiceKind;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub struct FakeDriver {
    kind: ServiceKind,
    external: bool,
    healthy: AtomicBool,
    heal_on_launch: AtomicBool,
    probe_script: Mutex<VecDeque<bool>>,
    launch_script: Mutex<VecDeque<Result<LaunchOutcome>>>,
    spawn_failure: Mutex<Option<SpawnFailure>>,
    probe_delay: Mutex<Duration>,
    process: AtomicBool,
    probes: AtomicUsize,
    launches: AtomicUsize,
    stops: AtomicUsize,
}

impl FakeDriver {
    pub fn new(kind: ServiceKind) -> Self {
        Self {
            kind,
            external: false,
            healthy: AtomicBool::new(false),
            heal_on_launch: AtomicBool::new(false),
            probe_script: Mutex::new(VecDeque::new()),
            launch_script: Mutex::new(VecDeque::new()),
            spawn_failure: Mutex::new(None),
            probe_delay: Mutex::new(Duration::ZERO),
            process: AtomicBool::new(false),
            probes: AtomicUsize::new(0),
            launches: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn external(mut self) -> Self {
        self.external = true;
        self
    }

    pub fn healthy(self, healthy: bool) -> Self {
        self.set_healthy(healthy);
        self
    }

    /// Probes turn healthy once a process is spawned
    pub fn heal_on_launch(self) -> Self {
        self.heal_on_launch.store(true, Ordering::SeqCst);
        self
    }

    /// Results returned by the next probes before falling back to `healthy`
    pub fn probe_script(self, results: &[bool]) -> Self {
        self.probe_script.lock().extend(results.iter().copied());
        self
    }

    pub fn launch_script(self, outcomes: Vec<Result<LaunchOutcome>>) -> Self {
        self.launch_script.lock().extend(outcomes);
        self
    }

    pub fn with_spawn_failure(self, failure: SpawnFailure) -> Self {
        *self.spawn_failure.lock() = Some(failure);
        self
    }

    pub fn probe_delay(self, delay: Duration) -> Self {
        self.set_probe_delay(delay);
        self
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock() = delay;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceDriver for FakeDriver {
    fn kind(&self) -> ServiceKind {
        self.kind
    }

    fn is_external(&self) -> bool {
        self.external
    }

    async fn probe(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.probe_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.probe_script.lock().pop_front();
        scripted.unwrap_or_else(|| self.healthy.load(Ordering::SeqCst))
    }

    async fn launch(&self) -> Result<LaunchOutcome> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let scripted = self.launch_script.lock().pop_front();
        let outcome = scripted.unwrap_or(Ok(LaunchOutcome::Spawned { pid: Some(4242) }));

        if let Ok(LaunchOutcome::Spawned { .. }) = &outcome {
            self.process.store(true, Ordering::SeqCst);
            if self.heal_on_launch.load(Ordering::SeqCst) {
                self.set_healthy(true);
            }
        }
        outcome
    }

    fn spawn_failure(&self) -> Option<SpawnFailure> {
        if self.process.load(Ordering::SeqCst) {
            self.spawn_failure.lock().clone()
        } else {
            None
        }
    }

    async fn stop(&self, _grace: Duration) -> StopOutcome {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.process.swap(false, Ordering::SeqCst) {
            StopOutcome::Graceful
        } else {
            StopOutcome::NotRunning
        }
    }

    fn has_process(&self) -> bool {
        self.process.load(Ordering::SeqCst)
    }
}
