//! Ensemble Configuration
//!
//! Every threshold the consensus engine consults, collected into one struct
//! that is validated once at construction and passed explicitly through the
//! call chain. Stored in TOML format.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration, caught before any ensemble run.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A ratio-valued field fell outside [0.0, 1.0].
    #[error("{field} must be in [0.0, 1.0], got {value}")]
    OutOfRange {
        /// Offending field name
        field: &'static str,
        /// Value found
        value: f32,
    },
    /// The unanimity boost would lift any result past the review floor.
    #[error(
        "confidence_boost ({boost}) must stay below min_digit_confidence ({floor}); \
         the review floor would be unreachable"
    )]
    BoostSwampsFloor {
        /// Configured boost
        boost: f32,
        /// Configured review floor
        floor: f32,
    },
    /// A timeout was configured as zero.
    #[error("{field} must be non-zero")]
    ZeroTimeout {
        /// Offending field name
        field: &'static str,
    },
    /// The per-call deadline exceeds the whole-run deadline.
    #[error("per_call_timeout_ms ({per_call}) exceeds overall_timeout_ms ({overall})")]
    TimeoutOrder {
        /// Per-provider deadline in milliseconds
        per_call: u64,
        /// Whole-run deadline in milliseconds
        overall: u64,
    },
    /// The positional bar is stricter than the fallback bar.
    #[error(
        "min_positional_similarity ({positional}) exceeds fallback_similarity_threshold \
         ({fallback}); the positional pass is meant to be the lower bar"
    )]
    SimilarityOrder {
        /// Positional-pass threshold
        positional: f32,
        /// Fallback-pass threshold
        fallback: f32,
    },
    /// Failed to read or parse a config file.
    #[error("failed to load config: {message}")]
    Load {
        /// What went wrong
        message: String,
    },
}

/// Thresholds and deadlines for one ensemble.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    /// Minimum final confidence for unattended acceptance
    #[serde(default = "defaults::min_digit_confidence")]
    pub min_digit_confidence: f32,
    /// Minimum fraction of positions with provider agreement
    #[serde(default = "defaults::min_agreement_ratio")]
    pub min_agreement_ratio: f32,
    /// Confidence added when every provider agrees on a character
    #[serde(default = "defaults::confidence_boost")]
    pub confidence_boost: f32,
    /// Maximum tolerated fraction of conflicted positions
    #[serde(default = "defaults::max_conflict_ratio")]
    pub max_conflict_ratio: f32,
    /// Margin below which two candidate confidences are too close to call
    #[serde(default = "defaults::ambiguity_threshold")]
    pub ambiguity_threshold: f32,
    /// Allow a confident single record to win a length-mismatched group
    #[serde(default = "defaults::allow_low_confidence_override")]
    pub allow_low_confidence_override: bool,
    /// Deadline per provider call, in milliseconds
    #[serde(default = "defaults::per_call_timeout_ms")]
    pub per_call_timeout_ms: u64,
    /// Deadline for the whole provider fan-out, in milliseconds
    #[serde(default = "defaults::overall_timeout_ms")]
    pub overall_timeout_ms: u64,
    /// Similarity bar for the positional pairing pass
    #[serde(default = "defaults::min_positional_similarity")]
    pub min_positional_similarity: f32,
    /// Similarity bar for the fallback pairing pass
    #[serde(default = "defaults::fallback_similarity_threshold")]
    pub fallback_similarity_threshold: f32,
    /// How far from the expected index the fallback pass searches
    #[serde(default = "defaults::search_window")]
    pub search_window: usize,
}

mod defaults {
    pub fn min_digit_confidence() -> f32 {
        0.58
    }
    pub fn min_agreement_ratio() -> f32 {
        0.60
    }
    pub fn confidence_boost() -> f32 {
        0.03
    }
    pub fn max_conflict_ratio() -> f32 {
        0.40
    }
    pub fn ambiguity_threshold() -> f32 {
        0.10
    }
    pub fn allow_low_confidence_override() -> bool {
        true
    }
    pub fn per_call_timeout_ms() -> u64 {
        15_000
    }
    pub fn overall_timeout_ms() -> u64 {
        30_000
    }
    pub fn min_positional_similarity() -> f32 {
        0.30
    }
    pub fn fallback_similarity_threshold() -> f32 {
        0.50
    }
    pub fn search_window() -> usize {
        2
    }
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            min_digit_confidence: defaults::min_digit_confidence(),
            min_agreement_ratio: defaults::min_agreement_ratio(),
            confidence_boost: defaults::confidence_boost(),
            max_conflict_ratio: defaults::max_conflict_ratio(),
            ambiguity_threshold: defaults::ambiguity_threshold(),
            allow_low_confidence_override: defaults::allow_low_confidence_override(),
            per_call_timeout_ms: defaults::per_call_timeout_ms(),
            overall_timeout_ms: defaults::overall_timeout_ms(),
            min_positional_similarity: defaults::min_positional_similarity(),
            fallback_similarity_threshold: defaults::fallback_similarity_threshold(),
            search_window: defaults::search_window(),
        }
    }
}

impl EnsembleConfig {
    /// Check every field range and cross-field constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ratios = [
            ("min_digit_confidence", self.min_digit_confidence),
            ("min_agreement_ratio", self.min_agreement_ratio),
            ("confidence_boost", self.confidence_boost),
            ("max_conflict_ratio", self.max_conflict_ratio),
            ("ambiguity_threshold", self.ambiguity_threshold),
            ("min_positional_similarity", self.min_positional_similarity),
            (
                "fallback_similarity_threshold",
                self.fallback_similarity_threshold,
            ),
        ];
        for (field, value) in ratios {
            if !(0.0..=1.0).contains(&value) || value.is_nan() {
                return Err(ConfigError::OutOfRange { field, value });
            }
        }

        if self.confidence_boost >= self.min_digit_confidence {
            return Err(ConfigError::BoostSwampsFloor {
                boost: self.confidence_boost,
                floor: self.min_digit_confidence,
            });
        }

        if self.per_call_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout {
                field: "per_call_timeout_ms",
            });
        }
        if self.overall_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout {
                field: "overall_timeout_ms",
            });
        }
        if self.per_call_timeout_ms > self.overall_timeout_ms {
            return Err(ConfigError::TimeoutOrder {
                per_call: self.per_call_timeout_ms,
                overall: self.overall_timeout_ms,
            });
        }

        if self.min_positional_similarity > self.fallback_similarity_threshold {
            return Err(ConfigError::SimilarityOrder {
                positional: self.min_positional_similarity,
                fallback: self.fallback_similarity_threshold,
            });
        }

        Ok(())
    }

    /// Deadline per provider call.
    pub fn per_call_timeout(&self) -> Duration {
        Duration::from_millis(self.per_call_timeout_ms)
    }

    /// Deadline for the whole provider fan-out.
    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_timeout_ms)
    }
}

/// Load and validate a configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<EnsembleConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
        message: format!("{}: {}", path.display(), e),
    })?;
    let config: EnsembleConfig = toml::from_str(&content).map_err(|e| ConfigError::Load {
        message: format!("{}: {}", path.display(), e),
    })?;
    config.validate()?;
    Ok(config)
}

/// Save a configuration to a TOML file.
pub fn save_config(config: &EnsembleConfig, path: &Path) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config).map_err(|e| ConfigError::Load {
        message: e.to_string(),
    })?;
    std::fs::write(path, content).map_err(|e| ConfigError::Load {
        message: format!("{}: {}", path.display(), e),
    })?;
    Ok(())
}
