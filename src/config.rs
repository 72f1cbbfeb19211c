use crate::backoff::RetryPolicy;
use crate::probe::worst_case_duration;
use crate::service::ServiceKind;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WardenConfig {
    pub startup: StartupConfig,
    pub health: HealthConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub shutdown: ShutdownConfig,
    pub preflight: PreflightConfig,
    pub services: ServicesConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StartupConfig {
    /// Upper bound for the whole startup sequence in seconds
    #[serde(default = "default_overall_timeout")]
    pub overall_timeout_secs: u64,

    /// Start attempts per service
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff between attempts
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay between attempts
    #[serde(default = "default_delay_cap_ms")]
    pub delay_cap_ms: u64,

    /// Time a spawned process gets to answer its health check
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_secs: u64,

    /// Extra probing window after a bind conflict is reported
    #[serde(default = "default_bind_conflict_grace_ms")]
    pub bind_conflict_grace_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct HealthConfig {
    /// Seconds between monitoring cycles
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// Upper bound for the probe phase of one cycle
    #[serde(default = "default_cycle_ceiling")]
    pub cycle_ceiling_secs: u64,

    /// A cycle holding the guard longer than this is force-released
    #[serde(default = "default_stuck_cycle_ceiling")]
    pub stuck_cycle_ceiling_secs: u64,

    /// Per-request health probe timeout
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Extra tries inside a single probe before it counts as failed
    #[serde(default = "default_probe_retries")]
    pub probe_retries: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failed probes in a row before a restart is requested
    #[serde(default = "default_consecutive_failure_threshold")]
    pub consecutive_failure_threshold: u32,

    /// Restarts before the breaker trips
    #[serde(default = "default_trip_threshold")]
    pub trip_threshold: u32,

    /// Base recovery window, doubled after every failed recovery
    #[serde(default = "default_recovery_window")]
    pub recovery_window_secs: u64,

    /// Recovery attempts before the service is disabled for this run
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ShutdownConfig {
    /// Time a process gets to exit after SIGTERM before it is killed
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PreflightConfig {
    /// Directory services write their data into
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Interpreter the vector store needs on PATH
    #[serde(default = "default_interpreter")]
    pub interpreter: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ServicesConfig {
    pub vector_store: ServiceConfig,
    pub llm_runtime: ServiceConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Skip the service entirely
    #[serde(default)]
    pub disabled: bool,

    /// Abort startup if the service cannot be started
    #[serde(default)]
    pub required: bool,

    pub host: String,

    pub port: u16,

    /// Probe this server instead of spawning one locally
    #[serde(default)]
    pub external_url: Option<String>,

    /// Candidate health paths, tried in order
    pub health_paths: Vec<String>,

    /// Executable to launch; looked up on PATH
    #[serde(default)]
    pub command: Option<String>,

    /// Arguments; `{host}`, `{port}` and `{data_dir}` are substituted
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub working_dir: Option<String>,

    /// Extra environment as `KEY=value`; placeholders are substituted in values
    #[serde(default)]
    pub env: Vec<String>,
}

impl ServiceConfig {
    /// Base URL health probes are issued against
    pub fn base_url(&self) -> String {
        match &self.external_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }

    pub fn is_external(&self) -> bool {
        self.external_url.is_some()
    }

    fn vector_store_default() -> Self {
        Self {
            disabled: false,
            required: false,
            host: "127.0.0.1".to_string(),
            port: 8000,
            external_url: None,
            health_paths: vec![
                "/api/v2/heartbeat".to_string(),
                "/api/v1/heartbeat".to_string(),
            ],
            command: Some("chroma".to_string()),
            args: vec![
                "run".to_string(),
                "--path".to_string(),
                "{data_dir}/vector-store".to_string(),
                "--host".to_string(),
                "{host}".to_string(),
                "--port".to_string(),
                "{port}".to_string(),
            ],
            working_dir: None,
            env: Vec::new(),
        }
    }

    fn llm_runtime_default() -> Self {
        Self {
            disabled: false,
            required: false,
            host: "127.0.0.1".to_string(),
            port: 11434,
            external_url: None,
            health_paths: vec!["/api/version".to_string(), "/api/tags".to_string()],
            command: Some("ollama".to_string()),
            args: vec!["serve".to_string()],
            working_dir: None,
            env: vec!["OLLAMA_HOST={host}:{port}".to_string()],
        }
    }
}

impl WardenConfig {
    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let mut builder = Config::builder()
            .set_default("startup.overall_timeout_secs", default_overall_timeout() as i64)?
            .set_default("startup.max_retries", default_max_retries() as i64)?
            .set_default("startup.base_delay_ms", default_base_delay_ms() as i64)?
            .set_default("startup.delay_cap_ms", default_delay_cap_ms() as i64)?
            .set_default("startup.verify_timeout_secs", default_verify_timeout() as i64)?
            .set_default(
                "startup.bind_conflict_grace_ms",
                default_bind_conflict_grace_ms() as i64,
            )?
            .set_default("health.interval_secs", default_health_interval() as i64)?
            .set_default("health.cycle_ceiling_secs", default_cycle_ceiling() as i64)?
            .set_default(
                "health.stuck_cycle_ceiling_secs",
                default_stuck_cycle_ceiling() as i64,
            )?
            .set_default("health.probe_timeout_ms", default_probe_timeout_ms() as i64)?
            .set_default("health.probe_retries", default_probe_retries() as i64)?
            .set_default(
                "circuit_breaker.consecutive_failure_threshold",
                default_consecutive_failure_threshold() as i64,
            )?
            .set_default(
                "circuit_breaker.trip_threshold",
                default_trip_threshold() as i64,
            )?
            .set_default(
                "circuit_breaker.recovery_window_secs",
                default_recovery_window() as i64,
            )?
            .set_default(
                "circuit_breaker.max_recovery_attempts",
                default_max_recovery_attempts() as i64,
            )?
            .set_default("shutdown.grace_period_secs", default_grace_period() as i64)?
            .set_default("preflight.data_dir", default_data_dir())?;

        for (key, service) in [
            ("vector_store", ServiceConfig::vector_store_default()),
            ("llm_runtime", ServiceConfig::llm_runtime_default()),
        ] {
            let prefix = format!("services.{}", key);
            builder = builder
                .set_default(format!("{}.host", prefix), service.host)?
                .set_default(format!("{}.port", prefix), service.port as i64)?
                .set_default(format!("{}.health_paths", prefix), service.health_paths)?
                .set_default(format!("{}.args", prefix), service.args)?
                .set_default(format!("{}.env", prefix), service.env)?;
            if let Some(command) = service.command {
                builder = builder.set_default(format!("{}.command", prefix), command)?;
            }
        }

        let settings = builder
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Add environment variables with WARDEN_ prefix, e.g. WARDEN_SERVICES__LLM_RUNTIME__PORT
            .add_source(
                Environment::with_prefix("WARDEN")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: WardenConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.startup.overall_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "Startup overall_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.startup.max_retries == 0 {
            return Err(ConfigError::Message(
                "Startup max_retries must be greater than 0".to_string(),
            ));
        }

        if self.startup.verify_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "Startup verify_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.health.interval_secs == 0 {
            return Err(ConfigError::Message(
                "Health interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.health.cycle_ceiling_secs == 0 || self.health.stuck_cycle_ceiling_secs == 0 {
            return Err(ConfigError::Message(
                "Health cycle_ceiling_secs and stuck_cycle_ceiling_secs must be greater than 0"
                    .to_string(),
            ));
        }

        if self.health.probe_timeout_ms == 0 || self.health.probe_timeout_ms > 5000 {
            return Err(ConfigError::Message(
                "Health probe_timeout_ms must be between 1 and 5000".to_string(),
            ));
        }

        if self.circuit_breaker.consecutive_failure_threshold == 0
            || self.circuit_breaker.trip_threshold == 0
            || self.circuit_breaker.max_recovery_attempts == 0
        {
            return Err(ConfigError::Message(
                "Circuit breaker thresholds must be greater than 0".to_string(),
            ));
        }

        for kind in ServiceKind::ALL {
            let service = self.service(kind);
            if service.health_paths.is_empty() {
                return Err(ConfigError::Message(format!(
                    "Service {} needs at least one health path",
                    kind
                )));
            }
            let budget = worst_case_duration(
                service.health_paths.len(),
                self.health.probe_timeout(),
                self.health.probe_retries,
            );
            if budget > self.health.cycle_ceiling() {
                return Err(ConfigError::Message(format!(
                    "Health probe for {} can take up to {:?}, longer than cycle_ceiling_secs ({})",
                    kind, budget, self.health.cycle_ceiling_secs
                )));
            }
            if service.port == 0 && !service.is_external() {
                return Err(ConfigError::Message(format!(
                    "Service {} port must be greater than 0",
                    kind
                )));
            }
        }

        Ok(())
    }

    /// Configuration of one service slot
    pub fn service(&self, kind: ServiceKind) -> &ServiceConfig {
        match kind {
            ServiceKind::VectorStore => &self.services.vector_store,
            ServiceKind::LlmRuntime => &self.services.llm_runtime,
        }
    }

    pub fn service_mut(&mut self, kind: ServiceKind) -> &mut ServiceConfig {
        match kind {
            ServiceKind::VectorStore => &mut self.services.vector_store,
            ServiceKind::LlmRuntime => &mut self.services.llm_runtime,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.startup.max_retries,
            base_delay: Duration::from_millis(self.startup.base_delay_ms),
            delay_cap: Duration::from_millis(self.startup.delay_cap_ms),
            verify_timeout: Duration::from_secs(self.startup.verify_timeout_secs),
            bind_conflict_grace: Duration::from_millis(self.startup.bind_conflict_grace_ms),
        }
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_secs(self.startup.overall_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown.grace_period_secs)
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.preflight.data_dir)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn cycle_ceiling(&self) -> Duration {
        Duration::from_secs(self.cycle_ceiling_secs)
    }

    pub fn stuck_cycle_ceiling(&self) -> Duration {
        Duration::from_secs(self.stuck_cycle_ceiling_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_window(&self) -> Duration {
        Duration::from_secs(self.recovery_window_secs)
    }
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            startup: StartupConfig {
                overall_timeout_secs: default_overall_timeout(),
                max_retries: default_max_retries(),
                base_delay_ms: default_base_delay_ms(),
                delay_cap_ms: default_delay_cap_ms(),
                verify_timeout_secs: default_verify_timeout(),
                bind_conflict_grace_ms: default_bind_conflict_grace_ms(),
            },
            health: HealthConfig {
                interval_secs: default_health_interval(),
                cycle_ceiling_secs: default_cycle_ceiling(),
                stuck_cycle_ceiling_secs: default_stuck_cycle_ceiling(),
                probe_timeout_ms: default_probe_timeout_ms(),
                probe_retries: default_probe_retries(),
            },
            circuit_breaker: CircuitBreakerConfig {
                consecutive_failure_threshold: default_consecutive_failure_threshold(),
                trip_threshold: default_trip_threshold(),
                recovery_window_secs: default_recovery_window(),
                max_recovery_attempts: default_max_recovery_attempts(),
            },
            shutdown: ShutdownConfig {
                grace_period_secs: default_grace_period(),
            },
            preflight: PreflightConfig {
                data_dir: default_data_dir(),
                interpreter: default_interpreter(),
            },
            services: ServicesConfig {
                vector_store: ServiceConfig::vector_store_default(),
                llm_runtime: ServiceConfig::llm_runtime_default(),
            },
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        WardenConfig::default().circuit_breaker
    }
}

// Default value functions
fn default_overall_timeout() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_delay_cap_ms() -> u64 {
    10_000
}
fn default_verify_timeout() -> u64 {
    30
}
fn default_bind_conflict_grace_ms() -> u64 {
    2000
}

fn default_health_interval() -> u64 {
    60
}
fn default_cycle_ceiling() -> u64 {
    5
}
fn default_stuck_cycle_ceiling() -> u64 {
    5
}
fn default_probe_timeout_ms() -> u64 {
    1000
}
fn default_probe_retries() -> u32 {
    1
}

fn default_consecutive_failure_threshold() -> u32 {
    3
}
fn default_trip_threshold() -> u32 {
    5
}
fn default_recovery_window() -> u64 {
    60
}
fn default_max_recovery_attempts() -> u32 {
    5
}

fn default_grace_period() -> u64 {
    5
}

fn default_data_dir() -> String {
    "./warden-data".to_string()
}
fn default_interpreter() -> Option<String> {
    Some("python3".to_string())
}
