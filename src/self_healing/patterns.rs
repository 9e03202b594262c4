//! Pattern learning
//!
//! Remembers which strategy resolved an `(error_signature, tool_id)` pair and
//! how confident we are in it. A confident pattern lets the engine skip
//! classification and go straight to the strategy that worked before.
//!
//! Confidence follows a simple reinforcement rule:
//!
//! ```text
//! success:  c' = c + rate * (1 - c)
//! failure:  c' = max(floor, c - rate * c)
//! ```
//!
//! The floor keeps a bad pattern from disappearing entirely, so a strategy
//! that starts working again can be re-learned.

use super::HealingStrategy;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Tunables for pattern learning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Minimum confidence for a pattern to short-circuit classification
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_initial_confidence")]
    pub initial_confidence: f64,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,
    /// Observations required before a pattern is trusted
    #[serde(default = "default_min_observations")]
    pub min_observations: u32,
    #[serde(default = "default_max_patterns")]
    pub max_patterns: usize,
}

fn default_confidence_threshold() -> f64 {
    0.8
}
fn default_initial_confidence() -> f64 {
    0.5
}
fn default_learning_rate() -> f64 {
    0.2
}
fn default_confidence_floor() -> f64 {
    0.1
}
fn default_min_observations() -> u32 {
    3
}
fn default_max_patterns() -> usize {
    1000
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            initial_confidence: default_initial_confidence(),
            learning_rate: default_learning_rate(),
            confidence_floor: default_confidence_floor(),
            min_observations: default_min_observations(),
            max_patterns: default_max_patterns(),
        }
    }
}

/// A learned association between an error and the strategy that fixed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub id: String,
    pub error_signature: String,
    pub tool_id: String,
    pub strategy: HealingStrategy,
    pub confidence_score: f64,
    pub observation_count: u32,
    pub success_count: u32,
    pub failure_count: u32,
    pub last_seen: DateTime<Utc>,
}

type PatternKey = (String, String);

/// Concurrent store of learned patterns.
///
/// Reads take a shared lock; updates are last-writer-wins per key.
pub struct PatternLearningStore {
    config: PatternConfig,
    patterns: RwLock<HashMap<PatternKey, ErrorPattern>>,
    lookups: AtomicU64,
    hits: AtomicU64,
}

impl PatternLearningStore {
    pub fn new(config: PatternConfig) -> Self {
        Self {
            config,
            patterns: RwLock::new(HashMap::new()),
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PatternConfig {
        &self.config
    }

    /// Return the pattern for this pair if it is trusted enough to act on.
    pub fn lookup(&self, signature: &str, tool_id: &str) -> Option<ErrorPattern> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let key = (signature.to_string(), tool_id.to_string());
        let found = self
            .patterns
            .read()
            .get(&key)
            .filter(|p| self.is_trusted(p))
            .cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Stored pattern regardless of confidence. Does not count as a lookup.
    pub fn get(&self, signature: &str, tool_id: &str) -> Option<ErrorPattern> {
        let key = (signature.to_string(), tool_id.to_string());
        self.patterns.read().get(&key).cloned()
    }

    fn is_trusted(&self, pattern: &ErrorPattern) -> bool {
        pattern.confidence_score >= self.config.confidence_threshold
            && pattern.observation_count >= self.config.min_observations
    }

    /// Reinforce or weaken the pattern for this pair.
    ///
    /// A failure with no stored pattern teaches nothing and is dropped. A
    /// success with a different strategy weakens the stored one and replaces
    /// it once its confidence falls below the initial value.
    pub fn record_outcome(
        &self,
        signature: &str,
        tool_id: &str,
        strategy: HealingStrategy,
        success: bool,
        now: DateTime<Utc>,
    ) -> Option<ErrorPattern> {
        let key = (signature.to_string(), tool_id.to_string());
        let rate = self.config.learning_rate.clamp(0.0, 1.0);
        let floor = self.config.confidence_floor;
        let mut patterns = self.patterns.write();

        let updated = match patterns.get_mut(&key) {
            Some(pattern) => {
                pattern.observation_count = pattern.observation_count.saturating_add(1);
                pattern.last_seen = now;

                if pattern.strategy == strategy {
                    if success {
                        pattern.success_count = pattern.success_count.saturating_add(1);
                        pattern.confidence_score += rate * (1.0 - pattern.confidence_score);
                    } else {
                        pattern.failure_count = pattern.failure_count.saturating_add(1);
                        pattern.confidence_score =
                            (pattern.confidence_score - rate * pattern.confidence_score).max(floor);
                    }
                } else if success {
                    pattern.confidence_score =
                        (pattern.confidence_score - rate * pattern.confidence_score).max(floor);
                    if pattern.confidence_score < self.config.initial_confidence {
                        debug!(
                            tool_id = %tool_id,
                            old_strategy = %pattern.strategy,
                            new_strategy = %strategy,
                            "Pattern strategy replaced"
                        );
                        pattern.strategy = strategy;
                        pattern.confidence_score = self.config.initial_confidence;
                        pattern.observation_count = 1;
                        pattern.success_count = 1;
                        pattern.failure_count = 0;
                    }
                }
                pattern.clone()
            }
            None => {
                if !success {
                    return None;
                }
                let initial = self.config.initial_confidence;
                let pattern = ErrorPattern {
                    id: pattern_id(signature, tool_id),
                    error_signature: signature.to_string(),
                    tool_id: tool_id.to_string(),
                    strategy,
                    confidence_score: initial + rate * (1.0 - initial),
                    observation_count: 1,
                    success_count: 1,
                    failure_count: 0,
                    last_seen: now,
                };
                patterns.insert(key, pattern.clone());
                evict_oldest(&mut patterns, self.config.max_patterns);
                pattern
            }
        };

        debug!(
            pattern_id = %updated.id,
            strategy = %updated.strategy,
            confidence = updated.confidence_score,
            "Pattern updated"
        );
        Some(updated)
    }

    /// All patterns, most confident first.
    pub fn patterns(&self) -> Vec<ErrorPattern> {
        let mut all: Vec<_> = self.patterns.read().values().cloned().collect();
        all.sort_by(|a, b| {
            b.confidence_score
                .partial_cmp(&a.confidence_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        all
    }

    pub fn len(&self) -> usize {
        self.patterns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.patterns.write().clear();
    }

    pub fn patterns_learned(&self) -> u64 {
        self.len() as u64
    }

    /// Fraction of lookups that returned a trusted pattern.
    pub fn match_rate(&self) -> f64 {
        let lookups = self.lookups.load(Ordering::Relaxed);
        if lookups == 0 {
            return 0.0;
        }
        self.hits.load(Ordering::Relaxed) as f64 / lookups as f64
    }
}

impl Default for PatternLearningStore {
    fn default() -> Self {
        Self::new(PatternConfig::default())
    }
}

fn pattern_id(signature: &str, tool_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool_id.as_bytes());
    hasher.update(b"|");
    hasher.update(signature.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
    format!("pat-{}", hex)
}

fn evict_oldest(patterns: &mut HashMap<PatternKey, ErrorPattern>, max: usize) {
    while patterns.len() > max.max(1) {
        let oldest = patterns
            .iter()
            .min_by_key(|(_, p)| p.last_seen)
            .map(|(k, _)| k.clone());
        match oldest {
            Some(key) => {
                patterns.remove(&key);
            }
            None => break,
        }
    }
}
