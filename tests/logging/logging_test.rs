//! Tests for `src/logging.rs`.

use fleet_agent::config::{LogRotation, LoggingConfig};
use fleet_agent::logging::LoggingGuard;

#[test]
fn logging_guard_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<LoggingGuard>();
}

#[test]
fn init_daemon_creates_logs_dir() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let logs_dir = tmp.path().join("logs");
    assert!(!logs_dir.exists());

    let config = LoggingConfig {
        rotation: LogRotation::Never,
        console: false,
        ..LoggingConfig::default()
    };
    // Only one global subscriber can be installed per process, so the
    // result is not asserted; the directory is created either way.
    let _result = fleet_agent::logging::init_daemon(&logs_dir, &config);
    assert!(logs_dir.exists(), "logs directory should be created");
}

#[test]
fn init_cli_is_idempotent() {
    fleet_agent::logging::init_cli("debug");
    fleet_agent::logging::init_cli("not a = valid [filter");
}
