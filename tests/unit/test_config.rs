//! Unit tests for configuration loading
//!
//! Tests cover:
//! - Loading TOML files from disk
//! - Validation errors and their exit codes
//! - Wiring the engine and controller from configuration

use flowheal::config::Config;
use flowheal::errors::{get_exit_code, EXIT_CONFIG_ERROR};
use flowheal::observability::telemetry::LogFormat;
use flowheal::FlowhealError;
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_from_explicit_path() {
    let file = write_config(
        r#"
        [healing]
        max_attempts_per_strategy = 4
        base_delay_ms = 250

        [circuit_breaker]
        failure_threshold = 2
        open_timeout_ms = 5000

        [execution]
        decision_timeout_ms = 1000
        retain_terminal = 10

        [logging]
        level = "flowheal=debug"
        format = "compact"
        "#,
    );

    let config = Config::load(file.path().to_str()).unwrap();
    assert_eq!(config.healing.max_attempts_per_strategy, 4);
    assert_eq!(config.healing.base_delay_ms, 250);
    assert_eq!(config.circuit_breaker.failure_threshold, 2);
    assert_eq!(config.execution.decision_timeout_ms, 1000);
    assert_eq!(config.execution.retain_terminal, 10);
    assert_eq!(config.logging.level, "flowheal=debug");
    assert_eq!(config.logging.format, LogFormat::Compact);
    // Untouched sections keep their defaults.
    assert_eq!(config.patterns.confidence_threshold, 0.8);
    assert_eq!(config.escalation.timeout_secs, 300);
}

#[test]
fn test_invalid_values_fail_with_config_exit_code() {
    let file = write_config(
        r#"
        [circuit_breaker]
        failure_threshold = 0
        "#,
    );

    let err = Config::load(file.path().to_str()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FlowhealError>(),
        Some(FlowhealError::Config(_))
    ));
    assert_eq!(get_exit_code(&err), EXIT_CONFIG_ERROR);
}

#[test]
fn test_malformed_toml_is_an_error() {
    let file = write_config("[healing\nmax_attempts_per_strategy = ");
    let err = Config::load(file.path().to_str()).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to parse config"));
}

#[test]
fn test_unknown_keys_are_ignored() {
    let file = write_config(
        r#"
        [healing]
        max_attempts_per_strategy = 2
        legacy_mode = true
        "#,
    );
    let config = Config::load(file.path().to_str()).unwrap();
    assert_eq!(config.healing.max_attempts_per_strategy, 2);
}

#[test]
fn test_overrides_win_over_file() {
    let file = write_config(
        r#"
        [circuit_breaker]
        failure_threshold = 2
        "#,
    );
    let mut config = Config::from_file(file.path()).unwrap();
    config.apply_overrides(|key| match key {
        "FLOWHEAL_FAILURE_THRESHOLD" => Some("9".to_string()),
        "FLOWHEAL_DECISION_TIMEOUT_MS" => Some(" 1500 ".to_string()),
        _ => None,
    });
    assert_eq!(config.circuit_breaker.failure_threshold, 9);
    assert_eq!(config.execution.decision_timeout_ms, 1500);
    assert!(config.validate().is_ok());
}

#[test]
fn test_engine_from_config_applies_limits() {
    let mut config = Config::default();
    config.healing.max_attempts_per_strategy = 1;
    config.patterns.min_observations = 1;
    let engine = config.healing_engine();
    assert_eq!(engine.config().max_attempts_per_strategy, 1);
    assert_eq!(engine.patterns().config().min_observations, 1);
}
