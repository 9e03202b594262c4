//! Failure containment: per-tool circuit breakers and backoff scheduling.

use crate::clock::JitterSource;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod circuit_breaker;

pub use circuit_breaker::{
    CallPermit, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerSnapshot,
    CircuitRejection, CircuitState, PermitKind,
};

/// Exponential backoff with symmetric jitter.
///
/// `delay(n) = min(max_delay, base * 2^n) * (1 + jitter_fraction * s)` where
/// `s` is drawn from the injected [`JitterSource`] in `-1.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_fraction: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_fraction: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered delay for the zero-based `attempt`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = 2u64
            .checked_pow(attempt)
            .and_then(|m| self.base_delay_ms.checked_mul(m))
            .unwrap_or(u64::MAX);
        Duration::from_millis(exp.min(self.max_delay_ms))
    }

    pub fn delay(&self, attempt: u32, jitter: &dyn JitterSource) -> Duration {
        let capped = self.base_delay(attempt).as_millis() as f64;
        let fraction = self.jitter_fraction.clamp(0.0, 1.0);
        let factor = 1.0 + fraction * jitter.sample().clamp(-1.0, 1.0);
        Duration::from_millis((capped * factor).round().max(0.0) as u64)
    }
}
