//! digit-ensemble replay tool
//!
//! Feeds recorded OCR provider outputs through the full consensus engine
//! and prints the fused results. The records file is a JSON map from
//! provider name to that provider's detected rows, captured from a real
//! run; replaying it exercises pairing and digit-level voting without any
//! network access.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use digit_ensemble::{
    load_config, DigitEnsemble, EnsembleConfig, ExtractedRecord, OcrProvider, PreprocessedImage,
    ProviderError, ProviderId,
};

/// Replay recorded OCR provider outputs through the consensus engine
#[derive(Parser, Debug)]
#[command(name = "digit-ensemble")]
#[command(about = "Fuse recorded multi-provider OCR outputs into consensus results")]
struct Args {
    /// JSON file mapping provider names to their recorded records
    #[arg(short, long)]
    records: PathBuf,

    /// Config file (TOML); defaults to the platform config dir, then built-ins
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Expected number of rows on the form (0 = unknown)
    #[arg(short, long, default_value = "0")]
    expected_rows: usize,

    /// Scan image to attach to the run (providers are replayed, so optional)
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// Emit results as JSON instead of a table
    #[arg(long)]
    json: bool,
}

/// Provider that answers with previously recorded records.
struct ReplayProvider {
    id: ProviderId,
    records: Vec<ExtractedRecord>,
}

#[async_trait]
impl OcrProvider for ReplayProvider {
    fn id(&self) -> ProviderId {
        self.id.clone()
    }

    async fn extract(
        &self,
        _image: &PreprocessedImage,
    ) -> Result<Vec<ExtractedRecord>, ProviderError> {
        Ok(self.records.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    let config = resolve_config(&args)?;

    let content = std::fs::read_to_string(&args.records)
        .with_context(|| format!("failed to read records file {:?}", args.records))?;
    let fixtures: BTreeMap<String, Vec<ExtractedRecord>> =
        serde_json::from_str(&content).context("failed to parse records file")?;
    anyhow::ensure!(!fixtures.is_empty(), "records file contains no providers");

    info!("Replaying {} provider(s)", fixtures.len());

    let providers: Vec<Arc<dyn OcrProvider>> = fixtures
        .into_iter()
        .map(|(name, records)| {
            Arc::new(ReplayProvider {
                id: ProviderId::new(name),
                records,
            }) as Arc<dyn OcrProvider>
        })
        .collect();

    let image = match &args.image {
        Some(path) => PreprocessedImage::from_path(path)
            .with_context(|| format!("failed to load image {path:?}"))?,
        None => PreprocessedImage::default(),
    };

    let ensemble = DigitEnsemble::new(config)?;
    let results = ensemble
        .combine(image, &providers, args.expected_rows)
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print_table(&results);
    }

    Ok(())
}

/// Load configuration from the explicit path, the platform config dir, or
/// fall back to built-in defaults.
fn resolve_config(args: &Args) -> Result<EnsembleConfig> {
    if let Some(path) = &args.config {
        let config =
            load_config(path).with_context(|| format!("failed to load config {path:?}"))?;
        info!("Loaded configuration from {:?}", path);
        return Ok(config);
    }

    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "cashea", "digit-ensemble") {
        let path = proj_dirs.config_dir().join("ensemble.toml");
        if path.exists() {
            let config =
                load_config(&path).with_context(|| format!("failed to load config {path:?}"))?;
            info!("Loaded configuration from {:?}", path);
            return Ok(config);
        }
    }

    info!("Using default configuration");
    Ok(EnsembleConfig::default())
}

fn print_table(results: &[digit_ensemble::ConsensusRecord]) {
    println!("{:>4}  {:<16} {:>10}  {:<8}  providers", "row", "digits", "confidence", "review");
    for record in results {
        println!(
            "{:>4}  {:<16} {:>10}  {:<8}  {}",
            record.position_index,
            record.final_text,
            record.final_confidence.to_string(),
            if record.needs_review { "REVIEW" } else { "ok" },
            record
                .providers
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(",")
        );
    }
}
