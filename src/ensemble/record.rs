//! Pairing and consensus record types
//!
//! Intermediate and output shapes of an ensemble run: records tagged with
//! their originating provider, cross-provider groups, and the fused result
//! handed back to the caller.

use serde::{Deserialize, Serialize};

use super::confidence::Confidence;
use crate::provider::{ExtractedRecord, ProviderId};

/// How a group of records was matched across providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingMethod {
    /// Matched by shared list position
    Positional,
    /// Matched by text similarity inside the search window
    Similarity,
    /// Never matched; carried through as a single-source leftover
    Fallback,
}

/// Provider agreement at one character position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigitAgreement {
    /// Every participating provider reported the same character
    Unanimous,
    /// A strict majority agreed
    Majority,
    /// No majority; the highest-confidence candidate won
    Conflict,
}

/// A record tagged with the provider that produced it.
#[derive(Debug, Clone)]
pub struct SourcedRecord {
    /// Originating provider
    pub provider: ProviderId,
    /// The detection itself
    pub record: ExtractedRecord,
}

/// Records from distinct providers believed to represent the same logical
/// row. Built by pairing, consumed once by the combiner.
#[derive(Debug, Clone)]
pub struct PairedGroup {
    /// Member records, one per participating provider
    pub members: Vec<SourcedRecord>,
    /// How the group was matched
    pub method: PairingMethod,
    /// Worst pairwise text similarity inside the group, when similarity was
    /// consulted
    pub similarity: Option<f32>,
}

impl PairedGroup {
    /// Row position of the group, taken from its first member.
    pub fn position_index(&self) -> usize {
        self.members
            .first()
            .map(|m| m.record.position_index)
            .unwrap_or(0)
    }

    /// Providers contributing to this group.
    pub fn providers(&self) -> Vec<ProviderId> {
        self.members.iter().map(|m| m.provider.clone()).collect()
    }
}

/// The fused, confidence-scored result for one logical row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRecord {
    /// The fused digit string
    pub final_text: String,
    /// Aggregate confidence in the fused string
    pub final_confidence: Confidence,
    /// Provider agreement at each character position; empty when
    /// per-position comparison was not possible (single-source results and
    /// length-mismatched groups)
    pub per_digit_agreement: Vec<DigitAgreement>,
    /// True when the result is not trustworthy enough to auto-accept
    pub needs_review: bool,
    /// Providers that contributed to this result
    pub providers: Vec<ProviderId>,
    /// Row position in the original scan
    pub position_index: usize,
    /// How the underlying records were paired
    pub pairing: PairingMethod,
}

impl ConsensusRecord {
    /// Fraction of positions where providers agreed (unanimous or majority).
    pub fn agreement_ratio(&self) -> f32 {
        if self.per_digit_agreement.is_empty() {
            return 1.0;
        }
        let agreed = self
            .per_digit_agreement
            .iter()
            .filter(|a| !matches!(a, DigitAgreement::Conflict))
            .count();
        agreed as f32 / self.per_digit_agreement.len() as f32
    }

    /// Fraction of positions where providers conflicted.
    pub fn conflict_ratio(&self) -> f32 {
        if self.per_digit_agreement.is_empty() {
            return 0.0;
        }
        let conflicts = self
            .per_digit_agreement
            .iter()
            .filter(|a| matches!(a, DigitAgreement::Conflict))
            .count();
        conflicts as f32 / self.per_digit_agreement.len() as f32
    }
}
