//! Fingerprint-based storefront synchronization.

pub mod config;
pub mod fingerprint;
pub mod orchestrator;
pub mod storefront;

use std::path::Path;

use anyhow::{Context, Result};
use catsync_feed::{exclude_by_code_prefix, parse_source_file, render_target_feed};
use catsync_storage::write_atomic;
use catsync_transform::{Pipeline, TransformConfig, TransformWarning};
use serde::Serialize;
use tracing::info;

pub use config::{AppConfig, SyncSettings, DEFAULT_CONFIG_PATH};
pub use fingerprint::{diff_catalog, fingerprint, ChangeSet, DiffEntry, DiffKind};
pub use orchestrator::{
    state_summary, CycleError, CycleReport, ErrorBudget, FeedSource, FileFeedSource, HttpFeedSource,
    Orchestrator, OrchestratorSettings, Phase, Sleeper, StateSummary, StatusSnapshot, TokioSleeper,
};
pub use storefront::{ProductPayload, ShopifyClient, StorefrontApi, StorefrontError};

pub const CRATE_NAME: &str = "catsync-sync";

#[derive(Debug, Clone, Serialize)]
pub struct ConversionSummary {
    pub products: usize,
    pub variants: usize,
    pub excluded: usize,
    pub validation_issues: Vec<String>,
    pub warnings: Vec<TransformWarning>,
}

/// Offline conversion: parse, filter, transform and write the marketplace feed atomically.
pub async fn convert_file(input: &Path, output: &Path, transform: &TransformConfig) -> Result<ConversionSummary> {
    let catalog = parse_source_file(input)?;
    let mut products = catalog.products;
    let excluded = exclude_by_code_prefix(&mut products, &transform.exclude_code_prefixes);

    let mut pipeline = Pipeline::new(transform.clone()).context("building transform pipeline")?;
    let out = pipeline.run(&products).context("transforming catalog")?;

    let xml = render_target_feed(&out.products).context("rendering marketplace feed")?;
    write_atomic(output, xml.as_bytes())
        .await
        .with_context(|| format!("writing {}", output.display()))?;

    let summary = ConversionSummary {
        products: out.products.len(),
        variants: out.products.iter().map(|p| p.variants.len()).sum(),
        excluded,
        validation_issues: catalog.issues.iter().map(ToString::to_string).collect(),
        warnings: out.warnings,
    };
    info!(
        input = %input.display(),
        output = %output.display(),
        products = summary.products,
        variants = summary.variants,
        skipped = summary.validation_issues.len(),
        "conversion complete"
    );
    Ok(summary)
}
