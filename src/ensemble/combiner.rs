//! Digit-level combination
//!
//! Fuses one paired group into a single consensus record by voting per
//! character position, weighting votes by confidence and consulting the
//! confusion model when providers disagree. Disagreement is not a failure
//! here: every data-quality problem comes out as a lowered confidence and a
//! `needs_review` flag, never as an error.

use super::confidence::Confidence;
use super::confusion::ConfusionModel;
use super::record::{ConsensusRecord, DigitAgreement, PairedGroup, PairingMethod, SourcedRecord};
use super::EnsembleError;
use crate::config::EnsembleConfig;

/// How hard the conflict ratio drags on the record-level confidence.
const CONFLICT_DAMPING: f32 = 0.5;

/// One character's supporters during a position vote.
struct Tally {
    ch: char,
    total: f32,
    count: usize,
}

impl Tally {
    fn mean(&self) -> f32 {
        self.total / self.count as f32
    }
}

/// Fuses paired groups into consensus records.
#[derive(Debug, Clone)]
pub struct DigitLevelCombiner {
    config: EnsembleConfig,
    confusion: ConfusionModel,
}

impl DigitLevelCombiner {
    /// Build a combiner from validated configuration and a confusion table.
    pub fn new(config: EnsembleConfig, confusion: ConfusionModel) -> Self {
        Self { config, confusion }
    }

    /// Fuse one paired group into a consensus record.
    ///
    /// Errors only on an empty group; every data-quality concern is folded
    /// into `needs_review` and the final confidence.
    pub fn combine(&self, group: &PairedGroup) -> Result<ConsensusRecord, EnsembleError> {
        match group.members.len() {
            0 => Err(EnsembleError::EmptyGroup),
            1 => Ok(self.single_source(&group.members[0], group.method, false)),
            _ => {
                let first_len = group.members[0].record.len();
                let lengths_match = group.members.iter().all(|m| m.record.len() == first_len);
                if lengths_match {
                    Ok(self.combine_equal_length(group, first_len))
                } else {
                    Ok(self.select_best_record(group))
                }
            }
        }
    }

    /// Wrap a record that has no cross-provider corroboration.
    ///
    /// Used for every record of a lone surviving provider (degraded mode,
    /// review driven only by the confidence floor) and for pairing leftovers
    /// (`force_review` set: an uncorroborated row in a multi-provider run is
    /// never auto-accepted).
    pub fn single_source(
        &self,
        sourced: &SourcedRecord,
        pairing: PairingMethod,
        force_review: bool,
    ) -> ConsensusRecord {
        let confidence = Confidence::saturating(sourced.record.overall_confidence);
        ConsensusRecord {
            final_text: sourced.record.text.clone(),
            final_confidence: confidence,
            per_digit_agreement: Vec::new(),
            needs_review: force_review || !confidence.meets(self.config.min_digit_confidence),
            providers: vec![sourced.provider.clone()],
            position_index: sourced.record.position_index,
            pairing,
        }
    }

    /// Length-mismatch policy: no per-character alignment is attempted; the
    /// record with the highest overall confidence wins outright and the
    /// result is flagged unless the winner clears the floor by a wide margin.
    fn select_best_record(&self, group: &PairedGroup) -> ConsensusRecord {
        let mut confidences: Vec<f32> = group
            .members
            .iter()
            .map(|m| m.record.overall_confidence)
            .collect();
        confidences.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        let best_confidence = confidences[0];
        let runner_up = confidences[1];

        let best = group
            .members
            .iter()
            .max_by(|a, b| {
                a.record
                    .overall_confidence
                    .partial_cmp(&b.record.overall_confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("group has at least two members");

        let wide_margin =
            best_confidence > self.config.min_digit_confidence + self.config.ambiguity_threshold;
        let too_close = best_confidence - runner_up < self.config.ambiguity_threshold;
        let needs_review =
            !(self.config.allow_low_confidence_override && wide_margin) || too_close;

        ConsensusRecord {
            final_text: best.record.text.clone(),
            final_confidence: Confidence::saturating(best_confidence),
            per_digit_agreement: Vec::new(),
            needs_review,
            providers: group.providers(),
            position_index: group.position_index(),
            pairing: group.method,
        }
    }

    /// Per-position voting over records of equal length.
    fn combine_equal_length(&self, group: &PairedGroup, len: usize) -> ConsensusRecord {
        if len == 0 {
            // Every provider saw an empty row. Nothing to vote on.
            return ConsensusRecord {
                final_text: String::new(),
                final_confidence: Confidence::MIN,
                per_digit_agreement: Vec::new(),
                needs_review: true,
                providers: group.providers(),
                position_index: group.position_index(),
                pairing: group.method,
            };
        }

        let member_chars: Vec<Vec<char>> = group
            .members
            .iter()
            .map(|m| m.record.text.chars().collect())
            .collect();
        let voters = group.members.len();

        let mut final_text = String::with_capacity(len);
        let mut agreement = Vec::with_capacity(len);
        let mut position_confidences = Vec::with_capacity(len);
        let mut conflicts = 0usize;
        let mut ambiguous = false;

        for i in 0..len {
            let mut tallies: Vec<Tally> = Vec::with_capacity(voters);
            for (member, chars) in group.members.iter().zip(&member_chars) {
                let ch = chars[i];
                let confidence = member.record.char_confidence(i).clamp(0.0, 1.0);
                match tallies.iter_mut().find(|t| t.ch == ch) {
                    Some(tally) => {
                        tally.total += confidence;
                        tally.count += 1;
                    }
                    None => tallies.push(Tally {
                        ch,
                        total: confidence,
                        count: 1,
                    }),
                }
            }

            if tallies.len() == 1 {
                // Unanimity: accept and reward.
                let tally = &tallies[0];
                final_text.push(tally.ch);
                position_confidences
                    .push((tally.mean() + self.config.confidence_boost).min(1.0));
                agreement.push(DigitAgreement::Unanimous);
                continue;
            }

            if let Some(majority) = tallies.iter().find(|t| t.count * 2 > voters) {
                // Strict majority: accept the majority character at the
                // agreeing providers' average confidence, no boost.
                final_text.push(majority.ch);
                position_confidences.push(majority.mean());
                agreement.push(DigitAgreement::Majority);
                continue;
            }

            // No majority. Highest-confidence candidate wins; known
            // confusable losers stay in as down-weighted competition
            // instead of being discarded.
            tallies.sort_by(|a, b| {
                b.total
                    .partial_cmp(&a.total)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.count.cmp(&a.count))
                    .then(a.ch.cmp(&b.ch))
            });
            let winner = &tallies[0];
            let base = winner.mean();

            let mut competition = 0.0f32;
            let mut best_loser = 0.0f32;
            for loser in &tallies[1..] {
                let loser_mean = loser.mean();
                best_loser = best_loser.max(loser_mean);
                if let Some(weight) = self.confusion.weight(winner.ch, loser.ch) {
                    competition += weight * loser_mean;
                }
            }

            let confidence = if base + competition > 0.0 {
                base * base / (base + competition)
            } else {
                0.0
            };

            if base - best_loser < self.config.ambiguity_threshold {
                ambiguous = true;
            }

            final_text.push(winner.ch);
            position_confidences.push(confidence);
            agreement.push(DigitAgreement::Conflict);
            conflicts += 1;
        }

        let mean: f32 = position_confidences.iter().sum::<f32>() / len as f32;
        let conflict_ratio = conflicts as f32 / len as f32;
        let agreement_ratio = (len - conflicts) as f32 / len as f32;
        let final_confidence =
            Confidence::saturating(mean * (1.0 - CONFLICT_DAMPING * conflict_ratio));

        let needs_review = !final_confidence.meets(self.config.min_digit_confidence)
            || conflict_ratio > self.config.max_conflict_ratio
            || agreement_ratio < self.config.min_agreement_ratio
            || ambiguous;

        ConsensusRecord {
            final_text,
            final_confidence,
            per_digit_agreement: agreement,
            needs_review,
            providers: group.providers(),
            position_index: group.position_index(),
            pairing: group.method,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ExtractedRecord, ProviderId};

    fn sourced(provider: &str, text: &str, confidences: Vec<f32>, overall: f32) -> SourcedRecord {
        SourcedRecord {
            provider: ProviderId::new(provider),
            record: ExtractedRecord::new(text, confidences, overall, 0),
        }
    }

    fn group(members: Vec<SourcedRecord>) -> PairedGroup {
        PairedGroup {
            members,
            method: PairingMethod::Positional,
            similarity: Some(0.9),
        }
    }

    fn combiner() -> DigitLevelCombiner {
        DigitLevelCombiner::new(EnsembleConfig::default(), ConfusionModel::handwritten_digits())
    }

    #[test]
    fn test_unanimous_providers_boost_confidence() {
        // Scenario A: three providers fully agree at >= 0.9 everywhere.
        let g = group(vec![
            sourced("a", "1234567890", vec![0.90; 10], 0.90),
            sourced("b", "1234567890", vec![0.92; 10], 0.92),
            sourced("c", "1234567890", vec![0.95; 10], 0.95),
        ]);
        let result = combiner().combine(&g).unwrap();

        assert_eq!(result.final_text, "1234567890");
        assert!(!result.needs_review);
        assert!(result
            .per_digit_agreement
            .iter()
            .all(|a| *a == DigitAgreement::Unanimous));
        // Boosted above the weakest input.
        assert!(result.final_confidence.value() > 0.90);
    }

    #[test]
    fn test_majority_wins_position() {
        // Scenario B: 2-of-3 say '1' at position 0.
        let g = group(vec![
            sourced("a", "1036221525", vec![0.9; 10], 0.9),
            sourced("b", "7036221525", vec![0.9; 10], 0.9),
            sourced("c", "1036221525", vec![0.9; 10], 0.9),
        ]);
        let result = combiner().combine(&g).unwrap();

        assert_eq!(result.final_text, "1036221525");
        assert_eq!(result.per_digit_agreement[0], DigitAgreement::Majority);
        assert!(result.per_digit_agreement[1..]
            .iter()
            .all(|a| *a == DigitAgreement::Unanimous));
    }

    #[test]
    fn test_length_mismatch_picks_highest_confidence() {
        // Scenario C: different lengths, modest winner confidence.
        let g = group(vec![
            sourced("a", "123456", vec![], 0.60),
            sourced("b", "1234567", vec![], 0.85),
        ]);
        let result = combiner().combine(&g).unwrap();

        assert_eq!(result.final_text, "1234567");
        assert!(result.per_digit_agreement.is_empty());
        // 0.85 clears the floor by a wide margin and the gap to 0.60 is not
        // too close to call, so the override applies.
        assert!(!result.needs_review);
    }

    #[test]
    fn test_length_mismatch_flags_weak_winner() {
        let g = group(vec![
            sourced("a", "123456", vec![], 0.40),
            sourced("b", "1234567", vec![], 0.62),
        ]);
        let result = combiner().combine(&g).unwrap();

        assert_eq!(result.final_text, "1234567");
        // 0.62 does not exceed 0.58 + 0.10.
        assert!(result.needs_review);
    }

    #[test]
    fn test_length_mismatch_flags_too_close_to_call() {
        let g = group(vec![
            sourced("a", "123456", vec![], 0.88),
            sourced("b", "1234567", vec![], 0.90),
        ]);
        let result = combiner().combine(&g).unwrap();

        // Both candidates are strong but within the ambiguity margin.
        assert!(result.needs_review);
    }

    #[test]
    fn test_length_mismatch_respects_override_switch() {
        let config = EnsembleConfig {
            allow_low_confidence_override: false,
            ..Default::default()
        };
        let combiner = DigitLevelCombiner::new(config, ConfusionModel::handwritten_digits());
        let g = group(vec![
            sourced("a", "123456", vec![], 0.50),
            sourced("b", "1234567", vec![], 0.95),
        ]);
        let result = combiner.combine(&g).unwrap();

        assert!(result.needs_review);
    }

    #[test]
    fn test_three_way_conflict_takes_highest_confidence() {
        // Scenario D: '1' / '2' / '5' at position 0 share no confusion pair.
        let g = group(vec![
            sourced("a", "1036", vec![0.95, 0.9, 0.9, 0.9], 0.9),
            sourced("b", "2036", vec![0.60, 0.9, 0.9, 0.9], 0.9),
            sourced("c", "5036", vec![0.50, 0.9, 0.9, 0.9], 0.9),
        ]);
        let result = combiner().combine(&g).unwrap();

        assert_eq!(result.final_text, "1036");
        assert_eq!(result.per_digit_agreement[0], DigitAgreement::Conflict);
        assert!((result.conflict_ratio() - 0.25).abs() < 0.001);
    }

    #[test]
    fn test_confusable_disagreement_scores_below_unknown_disagreement() {
        // Two providers, 1 vs 7 (confusable) against 1 vs 2 (not).
        let confusable = group(vec![
            sourced("a", "1", vec![0.9], 0.9),
            sourced("b", "7", vec![0.6], 0.6),
        ]);
        let unknown = group(vec![
            sourced("a", "1", vec![0.9], 0.9),
            sourced("b", "2", vec![0.6], 0.6),
        ]);
        let c = combiner();
        let confusable_result = c.combine(&confusable).unwrap();
        let unknown_result = c.combine(&unknown).unwrap();

        assert_eq!(confusable_result.final_text, "1");
        assert_eq!(unknown_result.final_text, "1");
        // The known confusion keeps the losing vote in play, dragging the
        // winner's confidence down further than an unexplained disagreement.
        assert!(
            confusable_result.final_confidence.value()
                < unknown_result.final_confidence.value()
        );
    }

    #[test]
    fn test_close_conflict_forces_review() {
        let g = group(vec![
            sourced("a", "1234", vec![0.80, 0.9, 0.9, 0.9], 0.9),
            sourced("b", "2234", vec![0.78, 0.9, 0.9, 0.9], 0.9),
        ]);
        let result = combiner().combine(&g).unwrap();

        // 0.80 vs 0.78 is too close to call at the default margin.
        assert!(result.needs_review);
    }

    #[test]
    fn test_confidence_monotonic_in_agreement() {
        let c = combiner();
        let unanimous = c
            .combine(&group(vec![
                sourced("a", "5", vec![0.8], 0.8),
                sourced("b", "5", vec![0.8], 0.8),
                sourced("c", "5", vec![0.8], 0.8),
            ]))
            .unwrap();
        let majority = c
            .combine(&group(vec![
                sourced("a", "5", vec![0.8], 0.8),
                sourced("b", "5", vec![0.8], 0.8),
                sourced("c", "2", vec![0.8], 0.8),
            ]))
            .unwrap();
        let conflict = c
            .combine(&group(vec![
                sourced("a", "5", vec![0.8], 0.8),
                sourced("b", "2", vec![0.8], 0.8),
            ]))
            .unwrap();

        assert!(unanimous.final_confidence >= majority.final_confidence);
        assert!(majority.final_confidence >= conflict.final_confidence);
    }

    #[test]
    fn test_combine_is_deterministic() {
        let g = group(vec![
            sourced("a", "1036221525", vec![0.9; 10], 0.9),
            sourced("b", "7036221575", vec![0.7; 10], 0.7),
            sourced("c", "1036221525", vec![0.8; 10], 0.8),
        ]);
        let c = combiner();
        let first = c.combine(&g).unwrap();
        let second = c.combine(&g).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_record_level_confidence_falls_back_when_no_char_scores() {
        let g = group(vec![
            sourced("a", "55", vec![], 0.9),
            sourced("b", "55", vec![], 0.7),
        ]);
        let result = combiner().combine(&g).unwrap();

        // Mean of the record-level confidences plus the unanimity boost.
        let expected = (0.9 + 0.7) / 2.0 + 0.03;
        assert!((result.final_confidence.value() - expected).abs() < 0.001);
    }

    #[test]
    fn test_empty_group_is_an_error() {
        let g = PairedGroup {
            members: vec![],
            method: PairingMethod::Positional,
            similarity: None,
        };
        assert!(matches!(
            combiner().combine(&g),
            Err(EnsembleError::EmptyGroup)
        ));
    }

    #[test]
    fn test_all_empty_rows_flagged() {
        let g = group(vec![
            sourced("a", "", vec![], 0.9),
            sourced("b", "", vec![], 0.9),
        ]);
        let result = combiner().combine(&g).unwrap();
        assert_eq!(result.final_text, "");
        assert!(result.needs_review);
    }

    #[test]
    fn test_high_conflict_ratio_flags_review() {
        // Half the positions conflict with confident, well-separated votes:
        // the conflict ratio alone must trip the flag.
        let g = group(vec![
            sourced("a", "1212", vec![0.95, 0.95, 0.95, 0.95], 0.95),
            sourced("b", "1255", vec![0.95, 0.95, 0.40, 0.40], 0.95),
        ]);
        let result = combiner().combine(&g).unwrap();

        assert_eq!(result.final_text, "1212");
        assert!((result.conflict_ratio() - 0.5).abs() < 0.001);
        assert!(result.needs_review);
    }

    #[test]
    fn test_single_source_wrap() {
        let c = combiner();
        let strong = c.single_source(
            &sourced("a", "1234", vec![], 0.9),
            PairingMethod::Fallback,
            false,
        );
        assert!(!strong.needs_review);
        assert_eq!(strong.providers, vec![ProviderId::new("a")]);

        let weak = c.single_source(
            &sourced("a", "1234", vec![], 0.3),
            PairingMethod::Fallback,
            false,
        );
        assert!(weak.needs_review);

        let leftover = c.single_source(
            &sourced("a", "1234", vec![], 0.99),
            PairingMethod::Fallback,
            true,
        );
        assert!(leftover.needs_review);
    }
}
