//! digit-ensemble - Multi-provider OCR consensus for handwritten digits
//!
//! Digitizes handwritten identification numbers from scanned forms by
//! running several independent OCR providers over the same image and fusing
//! their outputs digit by digit. Providers disagree on handwriting all the
//! time; this crate turns that disagreement into a single ranked result per
//! detected row, with a confidence score and a flag saying whether the
//! result is trustworthy enough to accept without human review.
//!
//! The provider clients themselves (network, auth, image encoding) live
//! outside this crate; anything implementing [`provider::OcrProvider`] can
//! participate in an ensemble.

pub mod config;
pub mod ensemble;
pub mod provider;

pub use config::{load_config, save_config, ConfigError, EnsembleConfig};
pub use ensemble::{
    Confidence, ConfusionModel, ConsensusRecord, DigitAgreement, DigitEnsemble, EnsembleError,
    EnsembleEvent, EnsembleObserver, NoopObserver, PairingMethod, TracingObserver,
};
pub use provider::{
    ExtractedRecord, OcrProvider, PreprocessedImage, ProviderError, ProviderId,
};
