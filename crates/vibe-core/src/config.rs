//! Orchestrator configuration, loaded the way `copilot-core::config` loads
//! `AppConfig`: a struct-of-structs deserialized from the `config` crate
//! with environment overrides layered on top of hard defaults.

use config::{Config, ConfigError as ExternalConfigError, Environment};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{OrchestratorError, OrchestratorResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub rdd: RddConfig,
    pub scheduler: SchedulerConfig,
    pub timeout: TimeoutConfig,
    pub automation: AutomationConfig,
    #[serde(default)]
    pub llm_mapping: HashMap<String, String>,
    #[serde(default = "default_project_root")]
    pub project_root: String,
}

impl OrchestratorConfig {
    /// Load configuration from the process environment, using the `VIBE`
    /// prefix (`VIBE_RDD_MAX_SUB_TASKS`, `VIBE_RDD_EPIC_TIME_LIMIT`,
    /// `VIBE_PROJECT_ROOT`, ...) the way `AppConfig::load_from_env` reads
    /// `APP__*`. Unset variables fall back to the defaults below.
    pub fn load() -> OrchestratorResult<Self> {
        Self::load_from_env("VIBE")
    }

    /// The generic layer accepts any `__`-separated override
    /// (`VIBE__SCHEDULER__MAX_CONCURRENT_TASKS=16`), matching how
    /// `AppConfig::load_from_env` reads `APP__DATABASE__MAX_CONNECTIONS`.
    /// The three variables the design calls out by exact name
    /// (`VIBE_RDD_MAX_SUB_TASKS`, `VIBE_RDD_EPIC_TIME_LIMIT`,
    /// `VIBE_PROJECT_ROOT`) use a single underscore and are layered in
    /// explicitly afterwards so they take precedence over the generic
    /// source and over the hard defaults below.
    pub fn load_from_env(prefix: &str) -> OrchestratorResult<Self> {
        let builder = Config::builder()
            .set_default("rdd.max_depth", 5)
            .map_err(config_err)?
            .set_default("rdd.max_sub_tasks", 20)
            .map_err(config_err)?
            .set_default("rdd.min_confidence", 0.6)
            .map_err(config_err)?
            .set_default("rdd.enable_parallel_decomposition", true)
            .map_err(config_err)?
            .set_default("rdd.epic_time_limit_minutes", 240)
            .map_err(config_err)?
            .set_default("scheduler.max_concurrent_tasks", 8)
            .map_err(config_err)?
            .set_default("scheduler.max_cpu_cores", 4.0)
            .map_err(config_err)?
            .set_default("scheduler.max_memory_mb", 8192.0)
            .map_err(config_err)?
            .set_default("scheduler.algorithm", "hybrid_optimal")
            .map_err(config_err)?
            .set_default("timeout.base_timeout_ms", 30_000)
            .map_err(config_err)?
            .set_default("timeout.max_timeout_ms", 600_000)
            .map_err(config_err)?
            .set_default("timeout.backoff_factor", 2.0)
            .map_err(config_err)?
            .set_default("timeout.max_retries", 3)
            .map_err(config_err)?
            .set_default("automation.tick_interval_ms", 5_000)
            .map_err(config_err)?
            .set_default("automation.stuck_threshold_ms", 900_000)
            .map_err(config_err)?
            .set_default("project_root", default_project_root())
            .map_err(config_err)?
            .add_source(
                Environment::with_prefix(prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_err)?;

        let mut config: OrchestratorConfig = builder.try_deserialize().map_err(config_err)?;

        if let Ok(raw) = std::env::var(format!("{prefix}_RDD_MAX_SUB_TASKS")) {
            match raw.parse::<u32>() {
                Ok(v) => config.rdd.max_sub_tasks = v,
                Err(_) => tracing::warn!(
                    value = %raw,
                    "ignoring unparseable {prefix}_RDD_MAX_SUB_TASKS override"
                ),
            }
        }
        if let Ok(raw) = std::env::var(format!("{prefix}_RDD_EPIC_TIME_LIMIT")) {
            match raw.parse::<u32>() {
                Ok(v) => config.rdd.epic_time_limit_minutes = v,
                Err(_) => tracing::warn!(
                    value = %raw,
                    "ignoring unparseable {prefix}_RDD_EPIC_TIME_LIMIT override"
                ),
            }
        }
        if let Ok(raw) = std::env::var(format!("{prefix}_PROJECT_ROOT")) {
            config.project_root = raw;
        }

        Ok(config)
    }
}

fn config_err(e: ExternalConfigError) -> OrchestratorError {
    OrchestratorError::config_error(e.to_string())
}

fn default_project_root() -> String {
    ".".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RddConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_max_sub_tasks")]
    pub max_sub_tasks: u32,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_enable_parallel")]
    pub enable_parallel_decomposition: bool,
    #[serde(default = "default_epic_time_limit")]
    pub epic_time_limit_minutes: u32,
}

impl RddConfig {
    pub fn with_max_sub_tasks(mut self, max_sub_tasks: u32) -> Self {
        self.max_sub_tasks = max_sub_tasks;
        self
    }

    pub fn with_epic_time_limit_minutes(mut self, minutes: u32) -> Self {
        self.epic_time_limit_minutes = minutes;
        self
    }
}

impl Default for RddConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_sub_tasks: default_max_sub_tasks(),
            min_confidence: default_min_confidence(),
            enable_parallel_decomposition: default_enable_parallel(),
            epic_time_limit_minutes: default_epic_time_limit(),
        }
    }
}

fn default_max_depth() -> u32 {
    5
}
fn default_max_sub_tasks() -> u32 {
    20
}
fn default_min_confidence() -> f64 {
    0.6
}
fn default_enable_parallel() -> bool {
    true
}
fn default_epic_time_limit() -> u32 {
    240
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: u32,
    #[serde(default = "default_max_cpu_cores")]
    pub max_cpu_cores: f64,
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: f64,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
}

impl SchedulerConfig {
    pub fn with_max_concurrent_tasks(mut self, max: u32) -> Self {
        self.max_concurrent_tasks = max;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_cpu_cores: default_max_cpu_cores(),
            max_memory_mb: default_max_memory_mb(),
            algorithm: default_algorithm(),
        }
    }
}

fn default_max_concurrent_tasks() -> u32 {
    8
}
fn default_max_cpu_cores() -> f64 {
    4.0
}
fn default_max_memory_mb() -> f64 {
    8192.0
}
fn default_algorithm() -> String {
    "hybrid_optimal".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_base_timeout_ms")]
    pub base_timeout_ms: u64,
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl TimeoutConfig {
    pub fn with_base_timeout_ms(mut self, ms: u64) -> Self {
        self.base_timeout_ms = ms;
        self
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            base_timeout_ms: default_base_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            backoff_factor: default_backoff_factor(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_base_timeout_ms() -> u64 {
    30_000
}
fn default_max_timeout_ms() -> u64 {
    600_000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_stuck_threshold_ms")]
    pub stuck_threshold_ms: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            stuck_threshold_ms: default_stuck_threshold_ms(),
        }
    }
}

fn default_tick_interval_ms() -> u64 {
    5_000
}
fn default_stuck_threshold_ms() -> u64 {
    900_000
}
