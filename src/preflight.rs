//! Non-fatal environment checks run before any service is started.

use crate::config::WardenConfig;
use crate::probe::port_in_use;
use crate::service::ServiceKind;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const PORT_CHECK_TIMEOUT: Duration = Duration::from_millis(500);
const WRITE_PROBE_FILE: &str = ".warden-write-check";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreflightCheck {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

/// Everything pre-flight found out; failures are recorded, never raised
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PreflightReport {
    pub checks: Vec<PreflightCheck>,
    pub data_dir_writable: bool,
    pub interpreter: Option<PathBuf>,
    /// Ports that already accept connections before anything was spawned
    pub occupied_ports: BTreeMap<ServiceKind, u16>,
}

impl PreflightReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &PreflightCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }

    fn record(&mut self, name: impl Into<String>, passed: bool, message: impl Into<String>) {
        let check = PreflightCheck {
            name: name.into(),
            passed,
            message: message.into(),
        };
        if check.passed {
            info!("Pre-flight {}: {}", check.name, check.message);
        } else {
            warn!("Pre-flight {} failed: {}", check.name, check.message);
        }
        self.checks.push(check);
    }
}

/// Run every pre-flight check against `config`
pub async fn run_preflight(config: &WardenConfig) -> PreflightReport {
    let mut report = PreflightReport::default();

    let data_dir = config.data_dir();
    match check_data_dir(&data_dir).await {
        Ok(()) => {
            report.data_dir_writable = true;
            report.record(
                "data_dir",
                true,
                format!("{} is writable", data_dir.display()),
            );
        }
        Err(e) => report.record(
            "data_dir",
            false,
            format!("{} is not writable: {}", data_dir.display(), e),
        ),
    }

    if let Some(interpreter) = &config.preflight.interpreter {
        match which::which(interpreter) {
            Ok(path) => {
                report.record(
                    "interpreter",
                    true,
                    format!("{} found at {}", interpreter, path.display()),
                );
                report.interpreter = Some(path);
            }
            Err(e) => report.record(
                "interpreter",
                false,
                format!("{} not found on PATH: {}", interpreter, e),
            ),
        }
    }

    for kind in ServiceKind::ALL {
        let service = config.service(kind);
        if service.disabled || service.is_external() {
            continue;
        }

        let name = format!("{}_port", kind);
        if port_in_use(&service.host, service.port, PORT_CHECK_TIMEOUT).await {
            report.occupied_ports.insert(kind, service.port);
            report.record(
                name,
                true,
                format!("{}:{} is occupied", service.host, service.port),
            );
        } else {
            report.record(
                name,
                true,
                format!("{}:{} is free", service.host, service.port),
            );
        }
    }

    report
}

async fn check_data_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let probe = dir.join(WRITE_PROBE_FILE);
    tokio::fs::write(&probe, b"ok").await?;
    tokio::fs::remove_file(&probe).await
}
