//! Ensemble diagnostic events
//!
//! Structured events describing how a run went, emitted through an observer
//! collaborator instead of being interleaved with control flow. The default
//! observer forwards to `tracing`; tests plug in a no-op or a collector.

use tracing::{debug, info, warn};

use super::record::PairingMethod;
use crate::provider::ProviderId;

/// Diagnostic events emitted during an ensemble run.
#[derive(Debug, Clone)]
pub enum EnsembleEvent {
    /// A provider returned records
    ProviderSucceeded {
        provider: ProviderId,
        records: usize,
    },
    /// A provider failed; the run continues without it
    ProviderFailed {
        provider: ProviderId,
        reason: String,
    },
    /// A provider detected a different number of rows than the form should have
    RowCountMismatch {
        provider: ProviderId,
        detected: usize,
        expected: usize,
    },
    /// Only one provider survived; pairing and voting are skipped
    DegradedMode { provider: ProviderId },
    /// A cross-provider group was formed
    GroupPaired {
        position: usize,
        method: PairingMethod,
        similarity: Option<f32>,
        providers: usize,
    },
    /// A record no other provider corroborated
    LeftoverRecord {
        provider: ProviderId,
        position: usize,
    },
    /// Totals for the finished run
    RunCompleted {
        records: usize,
        unanimous: usize,
        majority: usize,
        conflicts: usize,
        flagged: usize,
    },
}

/// Receives diagnostic events from the orchestrator.
pub trait EnsembleObserver: Send + Sync {
    /// Handle one event.
    fn observe(&self, event: &EnsembleEvent);
}

/// Observer that discards everything. Useful in tests.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl EnsembleObserver for NoopObserver {
    fn observe(&self, _event: &EnsembleEvent) {}
}

/// Default observer: forwards events to the `tracing` subscriber.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl EnsembleObserver for TracingObserver {
    fn observe(&self, event: &EnsembleEvent) {
        match event {
            EnsembleEvent::ProviderSucceeded { provider, records } => {
                debug!(%provider, records, "provider succeeded");
            }
            EnsembleEvent::ProviderFailed { provider, reason } => {
                warn!(%provider, %reason, "provider failed; continuing without it");
            }
            EnsembleEvent::RowCountMismatch {
                provider,
                detected,
                expected,
            } => {
                warn!(%provider, detected, expected, "row count mismatch");
            }
            EnsembleEvent::DegradedMode { provider } => {
                warn!(%provider, "single surviving provider; skipping consensus voting");
            }
            EnsembleEvent::GroupPaired {
                position,
                method,
                similarity,
                providers,
            } => {
                debug!(position, ?method, ?similarity, providers, "group paired");
            }
            EnsembleEvent::LeftoverRecord { provider, position } => {
                debug!(%provider, position, "unpaired record carried as leftover");
            }
            EnsembleEvent::RunCompleted {
                records,
                unanimous,
                majority,
                conflicts,
                flagged,
            } => {
                info!(
                    records,
                    unanimous, majority, conflicts, flagged, "ensemble run complete"
                );
            }
        }
    }
}
