//! Configuration Management
//!
//! Loads flowheal configuration from TOML files.
//! Configuration includes:
//! - Healing limits and backoff
//! - Circuit breaker thresholds
//! - Pattern learning tunables
//! - Escalation and decision timeouts
//! - Logging level and format
//!
//! Every field has a default, so an empty file is a valid configuration.

use crate::errors::FlowhealError;
use crate::execution::ExecutionConfig;
use crate::observability::telemetry::LogFormat;
use crate::self_healing::{
    EscalationCoordinator, HealingConfig, HealingStrategyEngine, PatternConfig,
    PatternLearningStore,
};
use crate::supervision::{CircuitBreakerConfig, CircuitBreakerRegistry};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const CONFIG_FILE_NAME: &str = "flowheal.toml";
const ENV_PREFIX: &str = "FLOWHEAL_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// How long the engine waits for an escalation answer
    #[serde(default = "default_escalation_timeout")]
    pub timeout_secs: u64,
    /// Queue depth of the escalation subscriber channel
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

fn default_escalation_timeout() -> u64 {
    300
}
fn default_subscriber_capacity() -> usize {
    16
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_escalation_timeout(),
            subscriber_capacity: default_subscriber_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. `info` or `flowheal=debug`
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub healing: HealingConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub patterns: PatternConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load from `path`, or from `./flowheal.toml`, or from
    /// `~/.config/flowheal/config.toml`, falling back to defaults. `FLOWHEAL_*`
    /// environment variables override file values.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None => {
                let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME)];
                if let Some(home) = dirs::home_dir() {
                    candidates.push(home.join(".config/flowheal/config.toml"));
                }

                let mut loaded = None;
                for candidate in &candidates {
                    if candidate.is_file() {
                        loaded = Some(Self::from_file(candidate)?);
                        break;
                    }
                }
                loaded.unwrap_or_else(|| {
                    debug!("No config file found, using defaults");
                    Self::default()
                })
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Apply `FLOWHEAL_*` overrides. Unparseable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(level) = var("LOG") {
            self.logging.level = level;
        }
        if let Some(format) = var("LOG_FORMAT") {
            match format.to_lowercase().as_str() {
                "json" => self.logging.format = LogFormat::Json,
                "compact" => self.logging.format = LogFormat::Compact,
                _ => {}
            }
        }
        set_parsed(&mut self.healing.max_attempts_per_strategy, var("MAX_ATTEMPTS"));
        set_parsed(&mut self.healing.max_total_attempts, var("MAX_TOTAL_ATTEMPTS"));
        set_parsed(&mut self.healing.base_delay_ms, var("BASE_DELAY_MS"));
        set_parsed(&mut self.healing.max_delay_ms, var("MAX_DELAY_MS"));
        set_parsed(&mut self.healing.attempt_timeout_ms, var("ATTEMPT_TIMEOUT_MS"));
        set_parsed(&mut self.circuit_breaker.failure_threshold, var("FAILURE_THRESHOLD"));
        set_parsed(&mut self.circuit_breaker.open_timeout_ms, var("OPEN_TIMEOUT_MS"));
        set_parsed(&mut self.patterns.confidence_threshold, var("CONFIDENCE_THRESHOLD"));
        set_parsed(&mut self.escalation.timeout_secs, var("ESCALATION_TIMEOUT_SECS"));
        set_parsed(&mut self.execution.decision_timeout_ms, var("DECISION_TIMEOUT_MS"));
    }

    pub fn validate(&self) -> std::result::Result<(), FlowhealError> {
        let healing = &self.healing;
        if healing.max_attempts_per_strategy == 0 {
            return Err(invalid("healing.max_attempts_per_strategy must be at least 1"));
        }
        if healing.max_total_attempts < healing.max_attempts_per_strategy {
            return Err(invalid(
                "healing.max_total_attempts must not be below max_attempts_per_strategy",
            ));
        }
        if healing.base_delay_ms > healing.max_delay_ms {
            return Err(invalid("healing.base_delay_ms must not exceed max_delay_ms"));
        }
        if !(0.0..=1.0).contains(&healing.jitter_fraction) {
            return Err(invalid("healing.jitter_fraction must be between 0 and 1"));
        }
        if healing.attempt_timeout_ms == 0 {
            return Err(invalid("healing.attempt_timeout_ms must be positive"));
        }

        let breaker = &self.circuit_breaker;
        if breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold must be at least 1"));
        }
        if breaker.backoff_multiplier < 1.0 {
            return Err(invalid("circuit_breaker.backoff_multiplier must be at least 1.0"));
        }
        if breaker.open_timeout_ms > breaker.max_open_timeout_ms {
            return Err(invalid(
                "circuit_breaker.open_timeout_ms must not exceed max_open_timeout_ms",
            ));
        }

        let patterns = &self.patterns;
        for (name, value) in [
            ("confidence_threshold", patterns.confidence_threshold),
            ("initial_confidence", patterns.initial_confidence),
            ("learning_rate", patterns.learning_rate),
            ("confidence_floor", patterns.confidence_floor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(&format!("patterns.{} must be between 0 and 1", name)));
            }
        }
        if patterns.confidence_floor > patterns.initial_confidence {
            return Err(invalid("patterns.confidence_floor must not exceed initial_confidence"));
        }

        if self.escalation.timeout_secs == 0 {
            return Err(invalid("escalation.timeout_secs must be positive"));
        }
        if self.execution.decision_timeout_ms == 0 {
            return Err(invalid("execution.decision_timeout_ms must be positive"));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Engine wired with breakers, pattern store and escalation coordinator
    /// built from this configuration.
    pub fn healing_engine(&self) -> HealingStrategyEngine {
        HealingStrategyEngine::new(self.healing.clone())
            .with_circuit_breakers(CircuitBreakerRegistry::new(self.circuit_breaker))
            .with_patterns(Arc::new(PatternLearningStore::new(self.patterns.clone())))
            .with_escalation(Arc::new(EscalationCoordinator::new(Duration::from_secs(
                self.escalation.timeout_secs,
            ))))
    }
}

fn set_parsed<T: FromStr>(target: &mut T, value: Option<String>) {
    if let Some(parsed) = value.and_then(|v| v.trim().parse().ok()) {
        *target = parsed;
    }
}

fn invalid(message: &str) -> FlowhealError {
    FlowhealError::Config(message.to_string())
}
