//! Configuration loading and validation.
//!
//! The agent reads a single `config.toml`. Every section uses
//! `#[serde(default)]` so a minimal or empty file is valid. Environment
//! variables (`FLEET_AGENT_*`) override file values; file values override
//! defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    /// Policy store location and polling.
    #[serde(default)]
    pub variables: VariablesConfig,

    /// Top-level supervisor GC timing.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Per-application reconcile timing.
    #[serde(default)]
    pub application: ApplicationConfig,

    /// Container engine settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Log output location.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Policy store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct VariablesConfig {
    /// Directory holding the policy files. Defaults to `~/.fleet-agent/variables`.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// How often a blocked accessor re-checks whether its field has loaded.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for VariablesConfig {
    fn default() -> Self {
        Self {
            dir: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl VariablesConfig {
    /// Accessor polling interval as a [`Duration`], never zero.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Timing and limits for the top-level supervisor's background loops.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Period of both the application-supervisor GC and the container GC.
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,

    /// Maximum concurrent stop/remove workers per container GC cycle.
    #[serde(default = "default_container_gc_concurrency")]
    pub container_gc_concurrency: usize,

    /// Deadline applied to each upstream status/state report.
    #[serde(default = "default_report_timeout_secs")]
    pub report_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            gc_interval_ms: default_gc_interval_ms(),
            container_gc_concurrency: default_container_gc_concurrency(),
            report_timeout_secs: default_report_timeout_secs(),
        }
    }
}

impl SupervisorConfig {
    /// GC period as a [`Duration`]. Zero is raised to one millisecond.
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms.max(1))
    }

    /// Report deadline as a [`Duration`]. Zero is raised to one second.
    pub fn report_timeout(&self) -> Duration {
        Duration::from_secs(self.report_timeout_secs.max(1))
    }
}

/// Per-application supervisor settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationConfig {
    /// Period of the reconcile loop when no new release arrives.
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: default_reconcile_interval_ms(),
        }
    }
}

impl ApplicationConfig {
    /// Reconcile period as a [`Duration`], never zero.
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms.max(1))
    }
}

/// Container engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Grace period given to a container before it is killed on stop.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Directory for rotated JSON logs. Defaults to `~/.fleet-agent/logs`.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Filter directives used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// How often the JSON log file rolls over.
    #[serde(default)]
    pub rotation: LogRotation,

    /// Rotated files to keep; unset keeps every file.
    #[serde(default = "default_max_log_files")]
    pub max_files: Option<usize>,

    /// Mirror human-readable output to stderr.
    #[serde(default = "default_console")]
    pub console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            level: default_log_level(),
            rotation: LogRotation::default(),
            max_files: default_max_log_files(),
            console: default_console(),
        }
    }
}

/// Log file rollover period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    /// New file every minute.
    Minutely,
    /// New file every hour.
    Hourly,
    /// New file every day.
    #[default]
    Daily,
    /// A single file.
    Never,
}

impl AgentConfig {
    /// Parse a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or a value is out of range.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        let config: AgentConfig = toml::from_str(toml_str).context("failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the background loops cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.supervisor.gc_interval_ms > 0,
            "supervisor.gc_interval_ms must be greater than zero"
        );
        anyhow::ensure!(
            self.supervisor.container_gc_concurrency > 0,
            "supervisor.container_gc_concurrency must be greater than zero"
        );
        anyhow::ensure!(
            self.variables.poll_interval_ms > 0,
            "variables.poll_interval_ms must be greater than zero"
        );
        anyhow::ensure!(
            self.application.reconcile_interval_ms > 0,
            "application.reconcile_interval_ms must be greater than zero"
        );
        anyhow::ensure!(
            self.supervisor.report_timeout_secs > 0,
            "supervisor.report_timeout_secs must be greater than zero"
        );
        anyhow::ensure!(
            self.logging.max_files != Some(0),
            "logging.max_files must be greater than zero when set"
        );
        Ok(())
    }

    /// Apply environment overrides (env > config > defaults).
    ///
    /// Takes a resolver function so tests need not touch the process
    /// environment. Unparsable values are logged and ignored.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("FLEET_AGENT_VARIABLES_DIR") {
            self.variables.dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env("FLEET_AGENT_LOG_DIR") {
            self.logging.dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env("FLEET_AGENT_LOG_LEVEL") {
            self.logging.level = v;
        }
        override_number(&env, "FLEET_AGENT_GC_INTERVAL_MS", &mut self.supervisor.gc_interval_ms);
        override_number(
            &env,
            "FLEET_AGENT_CONTAINER_GC_CONCURRENCY",
            &mut self.supervisor.container_gc_concurrency,
        );
        override_number(
            &env,
            "FLEET_AGENT_RECONCILE_INTERVAL_MS",
            &mut self.application.reconcile_interval_ms,
        );
        override_number(
            &env,
            "FLEET_AGENT_STOP_TIMEOUT_SECS",
            &mut self.engine.stop_timeout_secs,
        );
    }

    /// Resolve the policy directory, falling back to `~/.fleet-agent/variables`.
    ///
    /// # Errors
    ///
    /// Returns an error if no directory is configured and the home directory
    /// cannot be determined.
    pub fn variables_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.variables.dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(config_dir()?.join("variables")),
        }
    }

    /// Resolve the log directory, falling back to `~/.fleet-agent/logs`.
    ///
    /// # Errors
    ///
    /// Returns an error if no directory is configured and the home directory
    /// cannot be determined.
    pub fn logs_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.logging.dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(config_dir()?.join("logs")),
        }
    }
}

fn override_number<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    target: &mut T,
) {
    if let Some(v) = env(key) {
        match v.parse() {
            Ok(n) => *target = n,
            Err(_) => tracing::warn!(var = key, value = %v, "ignoring invalid env override"),
        }
    }
}

/// Load and validate the agent config from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or validated.
pub fn load_config(path: &Path) -> anyhow::Result<AgentConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    AgentConfig::from_toml(&contents)
        .with_context(|| format!("invalid config at {}", path.display()))
}

/// Load the config at `path` if it exists, otherwise the defaults, then apply
/// process environment overrides.
///
/// # Errors
///
/// Returns an error if an existing file is invalid or the result fails
/// validation after overrides.
pub fn load_or_default(path: &Path) -> anyhow::Result<AgentConfig> {
    let mut config = if path.exists() {
        load_config(path)?
    } else {
        tracing::info!(path = %path.display(), "no config file found, using defaults");
        AgentConfig::default()
    };
    config.apply_overrides(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Resolve the default config directory (`~/.fleet-agent/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".fleet-agent"))
}

// Default value functions for serde.

fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_gc_interval_ms() -> u64 {
    5_000
}
fn default_container_gc_concurrency() -> usize {
    8
}
fn default_report_timeout_secs() -> u64 {
    10
}
fn default_reconcile_interval_ms() -> u64 {
    5_000
}
fn default_stop_timeout_secs() -> u32 {
    10
}
fn default_log_level() -> String {
    "info".to_owned()
}
fn default_max_log_files() -> Option<usize> {
    Some(14)
}
fn default_console() -> bool {
    true
}
