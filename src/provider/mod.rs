//! OCR provider boundary
//!
//! Everything the consensus engine knows about an OCR provider lives here.
//! A provider is a black box: it receives a preprocessed image and returns
//! the digit records it detected, each with per-character confidences where
//! the backend supports them. Network calls, auth and image encoding are the
//! provider client's problem, not ours.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Identifies one OCR provider within an ensemble run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    /// Create a provider id from a backend name (e.g. "cloud-vision").
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Opaque handle to a preprocessed scan, ready for provider consumption.
///
/// The consensus engine never inspects the pixels; the preprocessing
/// collaborator produces this and the providers consume it.
#[derive(Debug, Clone, Default)]
pub struct PreprocessedImage {
    /// Raw RGBA pixel data
    pub data: Vec<u8>,
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
}

impl PreprocessedImage {
    /// Wrap already-preprocessed RGBA data.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
        }
    }

    /// Load an image file into a provider-consumable handle.
    pub fn from_path(path: &Path) -> Result<Self, image::ImageError> {
        let img = image::open(path)?.to_rgba8();
        let (width, height) = img.dimensions();
        Ok(Self {
            data: img.into_raw(),
            width,
            height,
        })
    }

    /// Get image dimensions as (width, height).
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// One provider's detection of one logical record: a digit string with its
/// confidence scores and the row position the provider saw it at.
///
/// Immutable once created; consumed by pairing and combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    /// Detected digit string
    pub text: String,
    /// Per-character confidence scores, same length as `text`; empty when
    /// the backend only reports record-level confidence
    #[serde(default)]
    pub char_confidences: Vec<f32>,
    /// Whole-record confidence (0.0 - 1.0)
    pub overall_confidence: f32,
    /// Row position as detected by this provider
    pub position_index: usize,
}

impl ExtractedRecord {
    /// Create a record with per-character confidences.
    pub fn new(
        text: impl Into<String>,
        char_confidences: Vec<f32>,
        overall_confidence: f32,
        position_index: usize,
    ) -> Self {
        Self {
            text: text.into(),
            char_confidences,
            overall_confidence,
            position_index,
        }
    }

    /// Create a record from a backend that only reports record-level confidence.
    pub fn without_char_confidences(
        text: impl Into<String>,
        overall_confidence: f32,
        position_index: usize,
    ) -> Self {
        Self::new(text, Vec::new(), overall_confidence, position_index)
    }

    /// Number of detected characters.
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    /// Whether the provider detected an empty string for this row.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Whether per-character confidences are present and aligned with the text.
    pub fn has_char_confidences(&self) -> bool {
        !self.char_confidences.is_empty() && self.char_confidences.len() == self.len()
    }

    /// Confidence for the character at `index`.
    ///
    /// Falls back to the record-level confidence when the backend did not
    /// supply aligned per-character scores.
    pub fn char_confidence(&self, index: usize) -> f32 {
        if self.has_char_confidences() {
            self.char_confidences[index]
        } else {
            self.overall_confidence
        }
    }
}

/// Per-provider failure. Captured per provider during a run; never aborts
/// the ensemble unless every provider fails.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network-level failure reaching the provider.
    #[error("network failure: {message}")]
    Network {
        /// Transport-level detail
        message: String,
    },
    /// The provider call exceeded its deadline.
    #[error("provider call exceeded {limit:?}")]
    Timeout {
        /// The deadline that was exceeded
        limit: Duration,
    },
    /// The provider rejected our credentials.
    #[error("authentication rejected: {message}")]
    Auth {
        /// Provider-reported detail
        message: String,
    },
    /// The provider's quota for this account is exhausted.
    #[error("provider quota exceeded")]
    QuotaExceeded,
    /// The provider answered with something we could not interpret.
    #[error("malformed provider response: {message}")]
    InvalidResponse {
        /// What was wrong with the response
        message: String,
    },
    /// The provider task itself fell over (panic or runtime failure).
    #[error("provider task failed: {message}")]
    Internal {
        /// Join-level detail
        message: String,
    },
}

/// An external OCR engine.
///
/// Implementations wrap real backends (cloud vision APIs, local models);
/// tests and the replay CLI supply canned ones. Retry policy belongs to the
/// implementation, not to the ensemble.
#[async_trait]
pub trait OcrProvider: Send + Sync {
    /// Stable identity of this provider.
    fn id(&self) -> ProviderId;

    /// Run OCR on a preprocessed image, returning one record per detected row.
    async fn extract(&self, image: &PreprocessedImage)
        -> Result<Vec<ExtractedRecord>, ProviderError>;
}
