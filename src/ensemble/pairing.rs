//! Cross-provider record pairing
//!
//! Providers may detect a different number of rows for the same scan, and
//! may disagree about what a row says. Pairing decides which records from
//! different providers describe the same logical row, in two passes: a
//! positional pass for cleanly aligned scans, then a similarity fallback
//! that searches a bounded window around the expected index. Whatever is
//! still unmatched becomes a leftover for the orchestrator to flag.

use strsim::normalized_levenshtein;
use tracing::debug;

use super::record::{PairedGroup, PairingMethod, SourcedRecord};
use crate::config::EnsembleConfig;
use crate::provider::{ExtractedRecord, ProviderId};

/// Result of pairing one run's surviving provider outputs.
#[derive(Debug)]
pub struct PairingOutcome {
    /// Matched groups, 2-3 records each from distinct providers
    pub groups: Vec<PairedGroup>,
    /// Records no other provider corroborated
    pub leftovers: Vec<SourcedRecord>,
}

/// Hybrid positional + similarity pairing.
#[derive(Debug, Clone)]
pub struct RecordPairingStrategy {
    min_positional_similarity: f32,
    fallback_similarity_threshold: f32,
    search_window: usize,
}

impl RecordPairingStrategy {
    /// Build a strategy from the ensemble configuration.
    pub fn from_config(config: &EnsembleConfig) -> Self {
        Self {
            min_positional_similarity: config.min_positional_similarity,
            fallback_similarity_threshold: config.fallback_similarity_threshold,
            search_window: config.search_window,
        }
    }

    /// Pair per-provider record lists into cross-provider groups.
    ///
    /// Requires at least two provider lists; the orchestrator short-circuits
    /// the single-survivor case before pairing.
    pub fn pair(&self, per_provider: &[(ProviderId, Vec<ExtractedRecord>)]) -> PairingOutcome {
        // Slots are consumed as records get matched.
        let mut slots: Vec<(ProviderId, Vec<Option<ExtractedRecord>>)> = per_provider
            .iter()
            .map(|(id, records)| (id.clone(), records.iter().cloned().map(Some).collect()))
            .collect();

        let mut groups = Vec::new();
        self.positional_pass(&mut slots, &mut groups);
        self.similarity_pass(&mut slots, &mut groups);

        let leftovers: Vec<SourcedRecord> = slots
            .into_iter()
            .flat_map(|(provider, records)| {
                records
                    .into_iter()
                    .flatten()
                    .map(move |record| SourcedRecord {
                        provider: provider.clone(),
                        record,
                    })
            })
            .collect();

        debug!(
            groups = groups.len(),
            leftovers = leftovers.len(),
            "pairing complete"
        );

        PairingOutcome { groups, leftovers }
    }

    /// Pass 1: pair by shared list position. Positions are expected to be
    /// aligned for clean scans, so the similarity bar is deliberately low.
    fn positional_pass(
        &self,
        slots: &mut [(ProviderId, Vec<Option<ExtractedRecord>>)],
        groups: &mut Vec<PairedGroup>,
    ) {
        let min_len = slots.iter().map(|(_, s)| s.len()).min().unwrap_or(0);

        for i in 0..min_len {
            let texts: Vec<&str> = slots
                .iter()
                .filter_map(|(_, s)| s[i].as_ref().map(|r| r.text.as_str()))
                .collect();
            if texts.len() < slots.len() {
                continue;
            }

            let similarity = min_pairwise_similarity(&texts);
            if similarity <= self.min_positional_similarity {
                continue;
            }

            let members: Vec<SourcedRecord> = slots
                .iter_mut()
                .map(|(provider, s)| SourcedRecord {
                    provider: provider.clone(),
                    record: s[i].take().expect("candidate presence checked above"),
                })
                .collect();

            groups.push(PairedGroup {
                members,
                method: PairingMethod::Positional,
                similarity: Some(similarity),
            });
        }
    }

    /// Pass 2: for rows the positional pass left behind, search a bounded
    /// window around the expected index in each other provider's list for
    /// the best text match. Each provider takes a turn as anchor so a row
    /// missed by an earlier provider can still pair among the later ones.
    fn similarity_pass(
        &self,
        slots: &mut [(ProviderId, Vec<Option<ExtractedRecord>>)],
        groups: &mut Vec<PairedGroup>,
    ) {
        let provider_count = slots.len();

        for anchor_idx in 0..provider_count {
            for i in 0..slots[anchor_idx].1.len() {
                let Some(anchor_text) = slots[anchor_idx].1[i].as_ref().map(|r| r.text.clone())
                else {
                    continue;
                };

                // (provider index, slot index, similarity) of the best match
                // per other provider.
                let mut matches: Vec<(usize, usize, f32)> = Vec::new();
                for other_idx in 0..provider_count {
                    if other_idx == anchor_idx {
                        continue;
                    }
                    if let Some(best) =
                        self.best_window_match(&anchor_text, i, &slots[other_idx].1)
                    {
                        matches.push((other_idx, best.0, best.1));
                    }
                }

                if matches.is_empty() {
                    continue;
                }

                let anchor_record = slots[anchor_idx].1[i].take().expect("anchor checked above");
                let similarity = matches
                    .iter()
                    .map(|&(_, _, s)| s)
                    .fold(f32::INFINITY, f32::min);

                let mut members = vec![SourcedRecord {
                    provider: slots[anchor_idx].0.clone(),
                    record: anchor_record,
                }];
                for (other_idx, slot_idx, _) in matches {
                    let (provider, records) = &mut slots[other_idx];
                    members.push(SourcedRecord {
                        provider: provider.clone(),
                        record: records[slot_idx]
                            .take()
                            .expect("match taken from live slot"),
                    });
                }

                groups.push(PairedGroup {
                    members,
                    method: PairingMethod::Similarity,
                    similarity: Some(similarity),
                });
            }
        }
    }

    /// Best acceptable match for `text` within ±`search_window` of `expected`
    /// in another provider's remaining records. Ties on similarity go to the
    /// candidate closest to the expected index.
    fn best_window_match(
        &self,
        text: &str,
        expected: usize,
        candidates: &[Option<ExtractedRecord>],
    ) -> Option<(usize, f32)> {
        let lo = expected.saturating_sub(self.search_window);
        let hi = (expected + self.search_window).min(candidates.len().saturating_sub(1));

        let mut best: Option<(usize, f32)> = None;
        for (j, candidate) in candidates.iter().enumerate().take(hi + 1).skip(lo) {
            let Some(candidate) = candidate else { continue };
            let similarity = text_similarity(text, &candidate.text);
            if similarity < self.fallback_similarity_threshold {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_j, best_sim)) => {
                    similarity > best_sim
                        || (similarity == best_sim
                            && expected.abs_diff(j) < expected.abs_diff(best_j))
                }
            };
            if better {
                best = Some((j, similarity));
            }
        }
        best
    }
}

/// Normalized edit-distance similarity between two detected strings.
pub fn text_similarity(a: &str, b: &str) -> f32 {
    normalized_levenshtein(a, b) as f32
}

/// Worst pairwise similarity among a set of candidate texts.
fn min_pairwise_similarity(texts: &[&str]) -> f32 {
    let mut min = 1.0f32;
    for (idx, a) in texts.iter().enumerate() {
        for b in texts.iter().skip(idx + 1) {
            min = min.min(text_similarity(a, b));
        }
    }
    min
}
