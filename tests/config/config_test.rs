//! Coverage for config file loading and path resolution.

use std::path::PathBuf;
use std::time::Duration;

use fleet_agent::config::{
    load_config, load_or_default, AgentConfig, ApplicationConfig, LogRotation, SupervisorConfig,
    VariablesConfig,
};

#[test]
fn default_supervisor_values() {
    let supervisor = SupervisorConfig::default();
    assert_eq!(supervisor.gc_interval_ms, 5_000);
    assert_eq!(supervisor.container_gc_concurrency, 8);
    assert_eq!(supervisor.report_timeout(), Duration::from_secs(10));
}

#[test]
fn full_config_file_parses() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[variables]
dir = "/var/lib/fleet-agent/policy"
poll_interval_ms = 250

[supervisor]
gc_interval_ms = 2000
container_gc_concurrency = 3
report_timeout_secs = 4

[application]
reconcile_interval_ms = 1500

[engine]
stop_timeout_secs = 30

[logging]
dir = "/var/log/fleet-agent"
level = "fleet_agent=debug"
rotation = "hourly"
max_files = 48
console = false
"#,
    )
    .expect("config should write");

    let config = load_config(&path).expect("config should load");
    assert_eq!(
        config.variables_dir().expect("dir configured"),
        PathBuf::from("/var/lib/fleet-agent/policy")
    );
    assert_eq!(config.variables.poll_interval(), Duration::from_millis(250));
    assert_eq!(config.supervisor.gc_interval(), Duration::from_secs(2));
    assert_eq!(config.supervisor.container_gc_concurrency, 3);
    assert_eq!(config.application.reconcile_interval(), Duration::from_millis(1500));
    assert_eq!(config.engine.stop_timeout_secs, 30);
    assert_eq!(
        config.logs_dir().expect("dir configured"),
        PathBuf::from("/var/log/fleet-agent")
    );
    assert_eq!(config.logging.level, "fleet_agent=debug");
    assert_eq!(config.logging.rotation, LogRotation::Hourly);
    assert_eq!(config.logging.max_files, Some(48));
    assert!(!config.logging.console);
}

#[test]
fn missing_file_is_an_error_for_load_config() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let result = load_config(&tmp.path().join("absent.toml"));
    assert!(result.is_err());
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let config = load_or_default(&tmp.path().join("absent.toml")).expect("defaults should load");
    assert!(config.supervisor.container_gc_concurrency > 0);
}

#[test]
fn zero_interval_is_rejected() {
    let result = AgentConfig::from_toml("[application]\nreconcile_interval_ms = 0\n");
    let err = result.expect_err("zero interval must be rejected");
    assert!(format!("{err:#}").contains("reconcile_interval_ms"));
}

#[test]
fn unknown_toml_is_rejected() {
    assert!(AgentConfig::from_toml("[supervisor\n").is_err());
}

#[test]
fn default_dirs_live_under_the_config_dir() {
    let config = AgentConfig::default();
    let variables = config.variables_dir().expect("home should resolve");
    let logs = config.logs_dir().expect("home should resolve");
    assert!(variables.ends_with(".fleet-agent/variables"));
    assert!(logs.ends_with(".fleet-agent/logs"));
}

#[test]
fn zero_report_timeout_is_rejected() {
    let result = AgentConfig::from_toml("[supervisor]\nreport_timeout_secs = 0\n");
    let err = result.expect_err("zero report timeout must be rejected");
    assert!(format!("{err:#}").contains("report_timeout_secs"));
}

#[test]
fn zero_max_log_files_is_rejected() {
    assert!(AgentConfig::from_toml("[logging]\nmax_files = 0\n").is_err());
}

#[test]
fn logging_defaults_rotate_daily_to_console() {
    let config = AgentConfig::default();
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.logging.rotation, LogRotation::Daily);
    assert_eq!(config.logging.max_files, Some(14));
    assert!(config.logging.console);
}

#[test]
fn zero_periods_never_reach_the_timers() {
    let supervisor = SupervisorConfig {
        gc_interval_ms: 0,
        container_gc_concurrency: 1,
        report_timeout_secs: 0,
    };
    assert_eq!(supervisor.gc_interval(), Duration::from_millis(1));
    assert_eq!(supervisor.report_timeout(), Duration::from_secs(1));

    let variables = VariablesConfig {
        dir: None,
        poll_interval_ms: 0,
    };
    assert_eq!(variables.poll_interval(), Duration::from_millis(1));

    let application = ApplicationConfig {
        reconcile_interval_ms: 0,
    };
    assert_eq!(application.reconcile_interval(), Duration::from_millis(1));
}
