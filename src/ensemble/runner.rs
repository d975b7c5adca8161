//! Parallel provider fan-out
//!
//! Invokes every provider concurrently, one tokio task each, with a deadline
//! per call and a deadline for the whole fan-out. A provider failing or
//! timing out is an outcome, not an error; the run itself only fails when
//! nobody answered or the caller cancelled.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::EnsembleError;
use crate::config::EnsembleConfig;
use crate::provider::{
    ExtractedRecord, OcrProvider, PreprocessedImage, ProviderError, ProviderId,
};

/// One provider's outcome within a run.
pub type ProviderOutcome = (ProviderId, Result<Vec<ExtractedRecord>, ProviderError>);

/// Runs 2-3 provider calls concurrently and gathers their outcomes.
#[derive(Debug, Clone)]
pub struct ParallelProviderRunner {
    per_call_timeout: Duration,
    overall_timeout: Duration,
}

impl ParallelProviderRunner {
    /// Build a runner with explicit deadlines.
    pub fn new(per_call_timeout: Duration, overall_timeout: Duration) -> Self {
        Self {
            per_call_timeout,
            overall_timeout,
        }
    }

    /// Build a runner from the ensemble configuration.
    pub fn from_config(config: &EnsembleConfig) -> Self {
        Self::new(config.per_call_timeout(), config.overall_timeout())
    }

    /// Invoke every provider on the image and collect per-provider outcomes.
    ///
    /// Outcomes preserve the caller's provider order. Cancellation aborts
    /// all in-flight calls and discards anything already collected; partial
    /// results are never reused.
    pub async fn run(
        &self,
        image: Arc<PreprocessedImage>,
        providers: &[Arc<dyn OcrProvider>],
        cancel: &CancellationToken,
    ) -> Result<Vec<ProviderOutcome>, EnsembleError> {
        if providers.is_empty() {
            return Err(EnsembleError::AllProvidersFailed {
                failures: Vec::new(),
            });
        }

        let started = tokio::time::Instant::now();

        let mut handles = Vec::with_capacity(providers.len());
        for provider in providers {
            let provider = Arc::clone(provider);
            let image = Arc::clone(&image);
            let per_call = self.per_call_timeout;
            let id = provider.id();
            let handle = tokio::spawn(async move {
                match timeout(per_call, provider.extract(&image)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout { limit: per_call }),
                }
            });
            handles.push((id, handle));
        }

        let mut outcomes: Vec<ProviderOutcome> = Vec::with_capacity(handles.len());
        let mut remaining_handles = handles.into_iter();
        while let Some((id, mut handle)) = remaining_handles.next() {
            let remaining = self.overall_timeout.saturating_sub(started.elapsed());
            tokio::select! {
                _ = cancel.cancelled() => {
                    handle.abort();
                    for (_, pending) in remaining_handles {
                        pending.abort();
                    }
                    return Err(EnsembleError::Cancelled);
                }
                joined = timeout(remaining, &mut handle) => {
                    let result = match joined {
                        Ok(Ok(result)) => result,
                        Ok(Err(join_error)) => Err(ProviderError::Internal {
                            message: join_error.to_string(),
                        }),
                        Err(_) => {
                            // Whole-run deadline elapsed while this provider
                            // was still working.
                            handle.abort();
                            Err(ProviderError::Timeout {
                                limit: self.overall_timeout,
                            })
                        }
                    };
                    debug!(provider = %id, ok = result.is_ok(), "provider outcome");
                    outcomes.push((id, result));
                }
            }
        }

        if outcomes.iter().all(|(_, result)| result.is_err()) {
            let failures = outcomes
                .into_iter()
                .map(|(id, result)| (id, result.expect_err("checked all-failed above")))
                .collect();
            return Err(EnsembleError::AllProvidersFailed { failures });
        }

        Ok(outcomes)
    }
}
