//! Bounded confidence score
//!
//! Providers report raw floats; everything downstream of the combiner works
//! with values guaranteed to sit in [0.0, 1.0].

use serde::{Deserialize, Serialize};
use std::fmt;

/// A confidence score guaranteed to be in the range [0.0, 1.0].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Confidence(f32);

impl Confidence {
    /// The lowest possible confidence.
    pub const MIN: Self = Self(0.0);
    /// The highest possible confidence.
    pub const MAX: Self = Self(1.0);

    /// Create a confidence score, returning `None` if out of range or NaN.
    pub fn new(value: f32) -> Option<Self> {
        if (0.0..=1.0).contains(&value) && !value.is_nan() {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Create a confidence score, clamping to [0.0, 1.0]. NaN becomes 0.0.
    pub fn saturating(value: f32) -> Self {
        if value.is_nan() {
            Self(0.0)
        } else {
            Self(value.clamp(0.0, 1.0))
        }
    }

    /// Get the inner value.
    pub fn value(self) -> f32 {
        self.0
    }

    /// Whether this score clears the given threshold.
    pub fn meets(self, threshold: f32) -> bool {
        self.0 >= threshold
    }

    /// Whether this score and another are within `margin` of each other.
    pub fn within(self, other: Self, margin: f32) -> bool {
        (self.0 - other.0).abs() < margin
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}%", self.0 * 100.0)
    }
}

impl From<Confidence> for f32 {
    fn from(confidence: Confidence) -> Self {
        confidence.0
    }
}
