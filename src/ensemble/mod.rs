//! Multi-provider OCR consensus engine
//!
//! Runs 2-3 OCR providers concurrently over one preprocessed scan, pairs
//! each provider's detected rows with their counterparts from the other
//! providers, and fuses every paired group into a single digit string with
//! an aggregate confidence and a review flag. Provider disagreement is the
//! expected case here, not a fault: uncertainty comes back as data.

pub mod combiner;
pub mod confidence;
pub mod confusion;
pub mod events;
pub mod pairing;
pub mod record;
pub mod runner;

use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, EnsembleConfig};
use crate::provider::{ExtractedRecord, OcrProvider, PreprocessedImage, ProviderError, ProviderId};

pub use combiner::DigitLevelCombiner;
pub use confidence::Confidence;
pub use confusion::ConfusionModel;
pub use events::{EnsembleEvent, EnsembleObserver, NoopObserver, TracingObserver};
pub use pairing::{PairingOutcome, RecordPairingStrategy};
pub use record::{ConsensusRecord, DigitAgreement, PairedGroup, PairingMethod, SourcedRecord};
pub use runner::{ParallelProviderRunner, ProviderOutcome};

/// Failures that abort an ensemble run.
///
/// A single provider failing is not among them; that surfaces as a
/// per-provider outcome and the run degrades instead.
#[derive(Debug, Error)]
pub enum EnsembleError {
    /// Every provider failed; no result can be produced.
    #[error("all providers failed")]
    AllProvidersFailed {
        /// What each provider reported
        failures: Vec<(ProviderId, ProviderError)>,
    },
    /// The caller cancelled the run; partial results were discarded.
    #[error("ensemble run cancelled")]
    Cancelled,
    /// A paired group with no members reached the combiner.
    #[error("cannot combine an empty paired group")]
    EmptyGroup,
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Top-level consensus engine.
///
/// Owns the validated configuration and the collaborating stages; one
/// instance serves many runs.
pub struct DigitEnsemble {
    config: EnsembleConfig,
    runner: ParallelProviderRunner,
    pairing: RecordPairingStrategy,
    combiner: DigitLevelCombiner,
    observer: Arc<dyn EnsembleObserver>,
}

impl DigitEnsemble {
    /// Create an engine with the default confusion table and a
    /// tracing-backed observer. Fails fast on invalid configuration.
    pub fn new(config: EnsembleConfig) -> Result<Self, ConfigError> {
        Self::with_observer(config, Arc::new(TracingObserver))
    }

    /// Create an engine with a custom observer.
    pub fn with_observer(
        config: EnsembleConfig,
        observer: Arc<dyn EnsembleObserver>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            runner: ParallelProviderRunner::from_config(&config),
            pairing: RecordPairingStrategy::from_config(&config),
            combiner: DigitLevelCombiner::new(config.clone(), ConfusionModel::handwritten_digits()),
            config,
            observer,
        })
    }

    /// Replace the confusion table.
    pub fn with_confusion_model(mut self, confusion: ConfusionModel) -> Self {
        self.combiner = DigitLevelCombiner::new(self.config.clone(), confusion);
        self
    }

    /// Run the full pipeline: providers, pairing, digit-level combination.
    ///
    /// `expected_rows` is the number of rows the form should carry; pass 0
    /// when unknown. It only drives diagnostics, never filtering.
    pub async fn combine(
        &self,
        image: PreprocessedImage,
        providers: &[Arc<dyn OcrProvider>],
        expected_rows: usize,
    ) -> Result<Vec<ConsensusRecord>, EnsembleError> {
        self.combine_with_cancellation(image, providers, expected_rows, &CancellationToken::new())
            .await
    }

    /// Like [`combine`](Self::combine), with caller-controlled cancellation.
    /// Cancelling aborts in-flight provider calls and discards partial
    /// results.
    pub async fn combine_with_cancellation(
        &self,
        image: PreprocessedImage,
        providers: &[Arc<dyn OcrProvider>],
        expected_rows: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ConsensusRecord>, EnsembleError> {
        let outcomes = self.runner.run(Arc::new(image), providers, cancel).await?;

        let mut surviving: Vec<(ProviderId, Vec<ExtractedRecord>)> = Vec::new();
        for (id, result) in outcomes {
            match result {
                Ok(records) => {
                    self.observer.observe(&EnsembleEvent::ProviderSucceeded {
                        provider: id.clone(),
                        records: records.len(),
                    });
                    if expected_rows > 0 && records.len() != expected_rows {
                        self.observer.observe(&EnsembleEvent::RowCountMismatch {
                            provider: id.clone(),
                            detected: records.len(),
                            expected: expected_rows,
                        });
                    }
                    surviving.push((id, records));
                }
                Err(error) => {
                    self.observer.observe(&EnsembleEvent::ProviderFailed {
                        provider: id,
                        reason: error.to_string(),
                    });
                }
            }
        }

        let mut results = if surviving.len() == 1 {
            self.wrap_single_survivor(&surviving[0])
        } else {
            self.pair_and_combine(&surviving)?
        };

        results.sort_by_key(|r| r.position_index);
        self.emit_run_totals(&results);
        Ok(results)
    }

    /// Degraded mode: one surviving provider, nothing to vote on. Review is
    /// driven only by the confidence floor.
    fn wrap_single_survivor(
        &self,
        (id, records): &(ProviderId, Vec<ExtractedRecord>),
    ) -> Vec<ConsensusRecord> {
        self.observer.observe(&EnsembleEvent::DegradedMode {
            provider: id.clone(),
        });
        records
            .iter()
            .map(|record| {
                let sourced = SourcedRecord {
                    provider: id.clone(),
                    record: record.clone(),
                };
                self.combiner
                    .single_source(&sourced, PairingMethod::Fallback, false)
            })
            .collect()
    }

    /// Full consensus path: pair across providers, fuse each group, carry
    /// leftovers through flagged for review.
    fn pair_and_combine(
        &self,
        surviving: &[(ProviderId, Vec<ExtractedRecord>)],
    ) -> Result<Vec<ConsensusRecord>, EnsembleError> {
        let outcome = self.pairing.pair(surviving);
        let mut results = Vec::with_capacity(outcome.groups.len() + outcome.leftovers.len());

        for group in &outcome.groups {
            self.observer.observe(&EnsembleEvent::GroupPaired {
                position: group.position_index(),
                method: group.method,
                similarity: group.similarity,
                providers: group.members.len(),
            });
            results.push(self.combiner.combine(group)?);
        }

        for leftover in &outcome.leftovers {
            self.observer.observe(&EnsembleEvent::LeftoverRecord {
                provider: leftover.provider.clone(),
                position: leftover.record.position_index,
            });
            results.push(
                self.combiner
                    .single_source(leftover, PairingMethod::Fallback, true),
            );
        }

        Ok(results)
    }

    fn emit_run_totals(&self, results: &[ConsensusRecord]) {
        let mut unanimous = 0;
        let mut majority = 0;
        let mut conflicts = 0;
        for result in results {
            for agreement in &result.per_digit_agreement {
                match agreement {
                    DigitAgreement::Unanimous => unanimous += 1,
                    DigitAgreement::Majority => majority += 1,
                    DigitAgreement::Conflict => conflicts += 1,
                }
            }
        }
        let flagged = results.iter().filter(|r| r.needs_review).count();
        self.observer.observe(&EnsembleEvent::RunCompleted {
            records: results.len(),
            unanimous,
            majority,
            conflicts,
            flagged,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    enum Behavior {
        Succeed(Vec<ExtractedRecord>),
        Fail,
        Hang,
    }

    struct FakeProvider {
        name: &'static str,
        behavior: Behavior,
    }

    #[async_trait]
    impl OcrProvider for FakeProvider {
        fn id(&self) -> ProviderId {
            ProviderId::new(self.name)
        }

        async fn extract(
            &self,
            _image: &PreprocessedImage,
        ) -> Result<Vec<ExtractedRecord>, ProviderError> {
            match &self.behavior {
                Behavior::Succeed(records) => Ok(records.clone()),
                Behavior::Fail => Err(ProviderError::QuotaExceeded),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(vec![])
                }
            }
        }
    }

    fn provider(name: &'static str, behavior: Behavior) -> Arc<dyn OcrProvider> {
        Arc::new(FakeProvider { name, behavior })
    }

    fn rows(texts: &[&str], confidence: f32) -> Vec<ExtractedRecord> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| ExtractedRecord::without_char_confidences(*t, confidence, i))
            .collect()
    }

    /// Observer that records event names for assertions.
    #[derive(Default)]
    struct CollectingObserver {
        seen: Mutex<Vec<&'static str>>,
    }

    impl CollectingObserver {
        fn names(&self) -> Vec<&'static str> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl EnsembleObserver for CollectingObserver {
        fn observe(&self, event: &EnsembleEvent) {
            let name = match event {
                EnsembleEvent::ProviderSucceeded { .. } => "provider_succeeded",
                EnsembleEvent::ProviderFailed { .. } => "provider_failed",
                EnsembleEvent::RowCountMismatch { .. } => "row_count_mismatch",
                EnsembleEvent::DegradedMode { .. } => "degraded_mode",
                EnsembleEvent::GroupPaired { .. } => "group_paired",
                EnsembleEvent::LeftoverRecord { .. } => "leftover_record",
                EnsembleEvent::RunCompleted { .. } => "run_completed",
            };
            self.seen.lock().unwrap().push(name);
        }
    }

    fn ensemble() -> DigitEnsemble {
        DigitEnsemble::with_observer(EnsembleConfig::default(), Arc::new(NoopObserver)).unwrap()
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let config = EnsembleConfig {
            max_conflict_ratio: 3.0,
            ..Default::default()
        };
        assert!(DigitEnsemble::new(config).is_err());
    }

    #[tokio::test]
    async fn test_three_agreeing_providers() {
        let providers = vec![
            provider("a", Behavior::Succeed(rows(&["1234567890"], 0.92))),
            provider("b", Behavior::Succeed(rows(&["1234567890"], 0.90))),
            provider("c", Behavior::Succeed(rows(&["1234567890"], 0.95))),
        ];
        let results = ensemble()
            .combine(PreprocessedImage::default(), &providers, 1)
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].final_text, "1234567890");
        assert!(!results[0].needs_review);
        assert_eq!(results[0].providers.len(), 3);
    }

    #[tokio::test]
    async fn test_one_failure_degrades_gracefully() {
        // Two survive out of three; consensus still runs.
        let providers = vec![
            provider("a", Behavior::Succeed(rows(&["555444"], 0.9))),
            provider("b", Behavior::Fail),
            provider("c", Behavior::Succeed(rows(&["555444"], 0.9))),
        ];
        let results = ensemble()
            .combine(PreprocessedImage::default(), &providers, 1)
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].final_text, "555444");
        assert_eq!(results[0].providers.len(), 2);
        assert!(!results[0]
            .providers
            .contains(&ProviderId::new("b")));
    }

    #[tokio::test]
    async fn test_single_survivor_skips_voting() {
        let providers = vec![
            provider("a", Behavior::Succeed(rows(&["111111", "222222"], 0.9))),
            provider("b", Behavior::Fail),
        ];
        let observer = Arc::new(CollectingObserver::default());
        let engine =
            DigitEnsemble::with_observer(EnsembleConfig::default(), observer.clone()).unwrap();
        let results = engine
            .combine(PreprocessedImage::default(), &providers, 2)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.per_digit_agreement.is_empty()));
        // Strong single-source records pass on the confidence floor alone.
        assert!(results.iter().all(|r| !r.needs_review));
        assert!(observer.names().contains(&"degraded_mode"));
        assert!(!observer.names().contains(&"group_paired"));
    }

    #[tokio::test]
    async fn test_weak_single_survivor_is_flagged() {
        let providers = vec![
            provider("a", Behavior::Succeed(rows(&["111111"], 0.4))),
            provider("b", Behavior::Fail),
        ];
        let results = ensemble()
            .combine(PreprocessedImage::default(), &providers, 1)
            .await
            .unwrap();

        assert!(results[0].needs_review);
    }

    #[tokio::test]
    async fn test_all_failures_surface_as_error() {
        let providers = vec![provider("a", Behavior::Fail), provider("b", Behavior::Fail)];
        let error = ensemble()
            .combine(PreprocessedImage::default(), &providers, 1)
            .await
            .unwrap_err();

        assert!(matches!(error, EnsembleError::AllProvidersFailed { .. }));
    }

    #[tokio::test]
    async fn test_leftovers_are_flagged_and_ordered() {
        // Provider b saw an extra final row nobody else saw.
        let providers = vec![
            provider("a", Behavior::Succeed(rows(&["111111", "222222"], 0.9))),
            provider(
                "b",
                Behavior::Succeed(rows(&["111111", "222222", "999999"], 0.99)),
            ),
        ];
        let results = ensemble()
            .combine(PreprocessedImage::default(), &providers, 2)
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        // Ordered by original position; the uncorroborated row comes last.
        assert_eq!(results[2].final_text, "999999");
        assert!(results[2].needs_review);
        assert_eq!(results[2].pairing, PairingMethod::Fallback);
        assert!(!results[0].needs_review);
        assert!(!results[1].needs_review);
    }

    #[tokio::test]
    async fn test_row_count_mismatch_is_observed() {
        let providers = vec![
            provider("a", Behavior::Succeed(rows(&["111111"], 0.9))),
            provider("b", Behavior::Succeed(rows(&["111111"], 0.9))),
        ];
        let observer = Arc::new(CollectingObserver::default());
        let engine =
            DigitEnsemble::with_observer(EnsembleConfig::default(), observer.clone()).unwrap();
        engine
            .combine(PreprocessedImage::default(), &providers, 4)
            .await
            .unwrap();

        assert!(observer.names().contains(&"row_count_mismatch"));
        assert!(observer.names().contains(&"run_completed"));
    }

    #[tokio::test]
    async fn test_cancellation_propagates() {
        let providers = vec![
            provider("a", Behavior::Hang),
            provider("b", Behavior::Hang),
        ];
        let cancel = CancellationToken::new();
        let engine = ensemble();
        let run = engine.combine_with_cancellation(
            PreprocessedImage::default(),
            &providers,
            1,
            &cancel,
        );
        let trigger = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        };

        let (result, _) = tokio::join!(run, trigger);
        assert!(matches!(result, Err(EnsembleError::Cancelled)));
    }

    #[tokio::test]
    async fn test_identical_runs_yield_identical_results() {
        let providers = vec![
            provider("a", Behavior::Succeed(rows(&["1036221525"], 0.9))),
            provider("b", Behavior::Succeed(rows(&["7036221525"], 0.7))),
            provider("c", Behavior::Succeed(rows(&["1036221525"], 0.8))),
        ];
        let engine = ensemble();
        let first = engine
            .combine(PreprocessedImage::default(), &providers, 1)
            .await
            .unwrap();
        let second = engine
            .combine(PreprocessedImage::default(), &providers, 1)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0].final_text, "1036221525");
    }
}
