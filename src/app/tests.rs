use super::*;
use crate::config::WardenConfig;
use crate::driver::{LaunchOutcome, ServiceDriver};
use crate::error::WardenError;
use crate::events::{StartupPhase, WardenEvent};
use crate::service::{Health, RunStatus, ServiceKind};
use crate::testing::FakeDriver;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn create_test_config(dir: &TempDir) -> WardenConfig {
    let mut config = WardenConfig::default();
    config.preflight.data_dir = dir.path().join("data").to_string_lossy().to_string();
    config.preflight.interpreter = None;
    config.startup.verify_timeout_secs = 1;
    config
}

fn supervisor(config: WardenConfig, drivers: &[Arc<FakeDriver>]) -> Supervisor {
    let drivers = drivers
        .iter()
        .map(|d| Arc::clone(d) as Arc<dyn ServiceDriver>)
        .collect();
    Supervisor::with_drivers(config, drivers)
}

fn fakes(vector: FakeDriver, llm: FakeDriver) -> [Arc<FakeDriver>; 2] {
    [Arc::new(vector), Arc::new(llm)]
}

#[tokio::test(start_paused = true)]
async fn test_all_services_healthy() {
    let dir = TempDir::new().unwrap();
    let drivers = fakes(
        FakeDriver::new(ServiceKind::VectorStore).heal_on_launch(),
        FakeDriver::new(ServiceKind::LlmRuntime).heal_on_launch(),
    );
    let warden = supervisor(create_test_config(&dir), &drivers);

    let report = warden.start().await.unwrap();

    assert!(!report.degraded);
    assert!(!report.timed_out);
    assert_eq!(report.running_count(), 2);
    assert!(report.preflight.data_dir_writable);
    assert_eq!(warden.startup_state(), StartupState::Completed);
    assert!(warden.monitor().is_running());
    for driver in &drivers {
        assert_eq!(driver.launches(), 1);
    }

    let status = warden.get_service_status();
    assert!(!status.degraded);
    assert!(status.degraded_mode.is_none());
    assert_eq!(status.phase, StartupPhase::Complete);

    warden.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_external_service_already_running_is_adopted() {
    let dir = TempDir::new().unwrap();
    let drivers = fakes(
        FakeDriver::new(ServiceKind::VectorStore)
            .external()
            .healthy(true),
        FakeDriver::new(ServiceKind::LlmRuntime).heal_on_launch(),
    );
    let warden = supervisor(create_test_config(&dir), &drivers);

    let report = warden.start().await.unwrap();

    let vector = &report.services[&ServiceKind::VectorStore];
    assert!(vector.success && vector.already_running && vector.external);
    assert_eq!(drivers[0].launches(), 0);
    assert!(warden.get_service_status().services[&ServiceKind::VectorStore].external);
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_optional_service_degrades() {
    let dir = TempDir::new().unwrap();
    let drivers = fakes(
        FakeDriver::new(ServiceKind::VectorStore).heal_on_launch(),
        FakeDriver::new(ServiceKind::LlmRuntime).launch_script(vec![Ok(
            LaunchOutcome::Unavailable("ollama not found on PATH".to_string()),
        )]),
    );
    let warden = supervisor(create_test_config(&dir), &drivers);

    let report = warden.start().await.unwrap();

    assert!(report.degraded);
    assert_eq!(warden.startup_state(), StartupState::Degraded);
    assert!(report.services[&ServiceKind::VectorStore].success);
    assert!(report.services[&ServiceKind::LlmRuntime].fallback_mode);

    let status = warden.get_service_status();
    assert!(status.degraded);
    let degraded = status.degraded_mode.unwrap();
    assert!(degraded.enabled);
    assert!(degraded.is_missing(ServiceKind::LlmRuntime));
    assert!(!degraded.is_missing(ServiceKind::VectorStore));
    assert!(!degraded.limitations.is_empty());
    assert_eq!(
        status.services[&ServiceKind::LlmRuntime].status,
        RunStatus::Disabled
    );
    assert!(status.errors.iter().any(|e| e.contains("ollama not found")));
}

#[tokio::test(start_paused = true)]
async fn test_disabled_service_is_never_started() {
    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(&dir);
    config.services.vector_store.disabled = true;
    let drivers = fakes(
        FakeDriver::new(ServiceKind::VectorStore).heal_on_launch(),
        FakeDriver::new(ServiceKind::LlmRuntime).heal_on_launch(),
    );
    let warden = supervisor(config, &drivers);

    let report = warden.start().await.unwrap();

    assert_eq!(drivers[0].probes(), 0);
    assert_eq!(drivers[0].launches(), 0);
    let vector = &report.services[&ServiceKind::VectorStore];
    assert!(!vector.success);
    assert_eq!(vector.attempts, 0);
    assert!(report.degraded);
    assert!(report.preflight.checks.iter().all(|c| c.name != "vector-store_port"));
}

#[tokio::test(start_paused = true)]
async fn test_required_failure_degrades_then_errors() {
    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(&dir);
    config.services.llm_runtime.required = true;
    config.startup.max_retries = 2;
    let drivers = fakes(
        FakeDriver::new(ServiceKind::VectorStore).heal_on_launch(),
        FakeDriver::new(ServiceKind::LlmRuntime),
    );
    let warden = supervisor(config, &drivers);

    let result = warden.start().await;

    assert!(matches!(
        result,
        Err(WardenError::RequiredServiceFailed {
            service: ServiceKind::LlmRuntime,
            attempts: 2
        })
    ));
    assert_eq!(warden.startup_state(), StartupState::Failed);

    let status = warden.get_service_status();
    assert!(status.degraded);
    assert!(status
        .degraded_mode
        .unwrap()
        .is_missing(ServiceKind::LlmRuntime));
    // The failed process was cleaned up during degradation
    assert!(!drivers[1].has_process());
    assert!(drivers[1].stops() >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_overall_timeout_returns_degraded_result() {
    let dir = TempDir::new().unwrap();
    let drivers = fakes(
        FakeDriver::new(ServiceKind::VectorStore).heal_on_launch(),
        FakeDriver::new(ServiceKind::LlmRuntime).probe_delay(Duration::from_secs(70)),
    );
    let warden = supervisor(create_test_config(&dir), &drivers);

    let report = warden.start().await.unwrap();

    assert!(report.timed_out);
    assert!(report.degraded);
    assert!(report.elapsed >= Duration::from_secs(60));
    assert!(report.elapsed < Duration::from_secs(61));
    assert_eq!(warden.startup_state(), StartupState::Degraded);

    let status = warden.get_service_status();
    let llm = &status.services[&ServiceKind::LlmRuntime];
    assert_eq!(llm.status, RunStatus::Failed);
    assert_eq!(llm.last_error.as_deref(), Some("startup timed out"));
    assert_eq!(
        status.services[&ServiceKind::VectorStore].status,
        RunStatus::Running
    );
    assert_eq!(
        report.services[&ServiceKind::LlmRuntime].error.as_deref(),
        Some("startup timed out")
    );
}

#[tokio::test(start_paused = true)]
async fn test_overall_timeout_with_nothing_usable_is_fatal() {
    let dir = TempDir::new().unwrap();
    let drivers = fakes(
        FakeDriver::new(ServiceKind::VectorStore).probe_delay(Duration::from_secs(70)),
        FakeDriver::new(ServiceKind::LlmRuntime).probe_delay(Duration::from_secs(70)),
    );
    let warden = supervisor(create_test_config(&dir), &drivers);

    let result = warden.start().await;

    assert!(matches!(result, Err(WardenError::StartupTimeout { .. })));
    assert_eq!(warden.startup_state(), StartupState::Failed);
    assert!(!warden.monitor().is_running());
}

#[tokio::test(start_paused = true)]
async fn test_progress_reported_to_subscribers() {
    let dir = TempDir::new().unwrap();
    let drivers = fakes(
        FakeDriver::new(ServiceKind::VectorStore).heal_on_launch(),
        FakeDriver::new(ServiceKind::LlmRuntime).heal_on_launch(),
    );
    let warden = supervisor(create_test_config(&dir), &drivers);
    let mut receiver = warden.subscribe();

    warden.start().await.unwrap();

    let mut progress = Vec::new();
    while let Ok(Some(event)) = receiver.try_recv() {
        if let WardenEvent::Progress { phase, percent, .. } = event {
            progress.push((phase, percent));
        }
    }

    assert_eq!(progress.first(), Some(&(StartupPhase::Preflight, 5)));
    assert!(progress.contains(&(StartupPhase::Monitoring, 98)));
    assert_eq!(progress.last(), Some(&(StartupPhase::Complete, 100)));
    assert!(progress.windows(2).all(|w| w[0].1 <= w[1].1));
}

#[tokio::test(start_paused = true)]
async fn test_force_recovery_clears_degraded_mode() {
    let dir = TempDir::new().unwrap();
    let drivers = fakes(
        FakeDriver::new(ServiceKind::VectorStore).heal_on_launch(),
        FakeDriver::new(ServiceKind::LlmRuntime).heal_on_launch(),
    );
    let warden = supervisor(create_test_config(&dir), &drivers);
    warden.start().await.unwrap();

    warden.registry.update(ServiceKind::VectorStore, |s| {
        s.status = RunStatus::PermanentlyFailed;
        s.health = Health::PermanentlyFailed;
        s.circuit_breaker_tripped = true;
        s.restart_count = 5;
    });
    warden
        .registry
        .with_degraded_mode(|d| d.add_missing(ServiceKind::VectorStore));

    assert!(warden.force_recovery(ServiceKind::VectorStore).await.unwrap());

    let status = warden.get_service_status();
    let vector = &status.services[&ServiceKind::VectorStore];
    assert_eq!(vector.status, RunStatus::Running);
    assert!(!vector.circuit_breaker_tripped);
    assert_eq!(vector.restart_count, 0);
    assert!(!status.degraded);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_every_driver_once() {
    let dir = TempDir::new().unwrap();
    let drivers = fakes(
        FakeDriver::new(ServiceKind::VectorStore).heal_on_launch(),
        FakeDriver::new(ServiceKind::LlmRuntime).heal_on_launch(),
    );
    let warden = supervisor(create_test_config(&dir), &drivers);
    warden.start().await.unwrap();

    warden.shutdown().await;
    warden.shutdown().await;

    assert_eq!(warden.startup_state(), StartupState::Stopped);
    assert!(!warden.monitor().is_running());
    for driver in &drivers {
        assert_eq!(driver.stops(), 1);
        assert!(!driver.has_process());
    }
    for status in warden.get_service_status().services.values() {
        assert_eq!(status.status, RunStatus::Stopped);
        assert_eq!(status.health, Health::Unknown);
        assert!(status.pid.is_none());
    }
}

#[tokio::test]
async fn test_shutdown_before_start() {
    let dir = TempDir::new().unwrap();
    let drivers = fakes(
        FakeDriver::new(ServiceKind::VectorStore),
        FakeDriver::new(ServiceKind::LlmRuntime),
    );
    let warden = supervisor(create_test_config(&dir), &drivers);

    warden.shutdown().await;

    assert_eq!(warden.startup_state(), StartupState::Stopped);
    assert_eq!(drivers[0].launches(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_restart_leaves_no_process() {
    let dir = TempDir::new().unwrap();
    let drivers = fakes(
        FakeDriver::new(ServiceKind::VectorStore).heal_on_launch(),
        FakeDriver::new(ServiceKind::LlmRuntime).heal_on_launch(),
    );
    let warden = supervisor(create_test_config(&dir), &drivers);
    warden.start().await.unwrap();
    assert_eq!(drivers[0].launches(), 1);

    // The vector store hangs and is one failure away from a restart
    drivers[0].set_healthy(false);
    drivers[0].set_probe_delay(Duration::from_secs(3));
    warden
        .registry
        .update(ServiceKind::VectorStore, |s| s.consecutive_failures = 2);

    // Next cycle fires at 60s, fails at 63s, then re-probes before relaunching
    tokio::time::sleep(Duration::from_secs(64)).await;
    assert_eq!(
        warden.get_service_status().services[&ServiceKind::VectorStore].restart_count,
        1
    );

    warden.shutdown().await;
    assert_eq!(drivers[0].launches(), 1);
    assert!(!drivers[0].has_process());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(drivers[0].launches(), 1);
    assert!(!drivers[0].has_process());
    assert_eq!(
        warden.get_service_status().services[&ServiceKind::VectorStore].status,
        RunStatus::Stopped
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_force_recovery_of_running_service_degrades() {
    let dir = TempDir::new().unwrap();
    let drivers = fakes(
        FakeDriver::new(ServiceKind::VectorStore).heal_on_launch(),
        FakeDriver::new(ServiceKind::LlmRuntime)
            .heal_on_launch()
            .launch_script(vec![
                Ok(LaunchOutcome::Spawned { pid: Some(7) }),
                Ok(LaunchOutcome::Unavailable(
                    "ollama not found on PATH".to_string(),
                )),
            ]),
    );
    let warden = supervisor(create_test_config(&dir), &drivers);
    let report = warden.start().await.unwrap();
    assert!(!report.degraded);

    drivers[1].set_healthy(false);

    assert!(!warden.force_recovery(ServiceKind::LlmRuntime).await.unwrap());

    let status = warden.get_service_status();
    assert_eq!(
        status.services[&ServiceKind::LlmRuntime].status,
        RunStatus::Failed
    );
    assert!(status.degraded);
    assert!(status
        .degraded_mode
        .unwrap()
        .is_missing(ServiceKind::LlmRuntime));
    assert_eq!(drivers[1].launches(), 2);
    assert!(!drivers[1].has_process());
}
