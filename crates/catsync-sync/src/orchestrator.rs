//! The sync cycle state machine and the daemon loop around it.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use catsync_core::{SyncRecord, TargetProduct};
use catsync_feed::{exclude_by_code_prefix, parse_source_feed, render_target_feed, FeedError};
use catsync_storage::{
    sha256_hex, write_atomic, BackoffPolicy, FeedArchive, FetchError, HttpClientConfig, HttpFetcher,
    StateError, StateStore,
};
pub use catsync_storage::{Sleeper, TokioSleeper};
use catsync_transform::{Pipeline, TransformConfig, TransformError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::fingerprint::{diff_catalog, DiffKind};
use crate::storefront::{ProductPayload, ShopifyClient, StorefrontApi, StorefrontError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Fetching,
    Parsing,
    Diffing,
    Pushing,
    Persisting,
    Sleeping,
    /// Terminal. Only a restart leaves it.
    Halted,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("fetching feed: {0}")]
    Fetch(#[from] FetchError),
    #[error("parsing feed: {0}")]
    Parse(#[from] FeedError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("transforming catalog: {0}")]
    Transform(#[from] TransformError),
    #[error("sync halted after {consecutive_failures} consecutive failures; restart required")]
    Halted { consecutive_failures: u32 },
}

/// Failure counters with a ceiling. Crossing it is permanent for this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorBudget {
    pub max_sync_errors: u32,
    pub consecutive_failures: u32,
    pub total_errors_this_run: u32,
}

impl ErrorBudget {
    pub fn new(max_sync_errors: u32) -> Self {
        Self {
            max_sync_errors,
            consecutive_failures: 0,
            total_errors_this_run: 0,
        }
    }

    /// Returns true once the ceiling has been crossed.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_errors_this_run = self.total_errors_this_run.saturating_add(1);
        self.is_exhausted()
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn is_exhausted(&self) -> bool {
        self.consecutive_failures > self.max_sync_errors
    }
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    fn describe(&self) -> String;

    /// Retry waits, if the source has any, go through `sleeper`.
    async fn fetch(&self, run_id: Uuid, sleeper: &dyn Sleeper) -> Result<Vec<u8>, FetchError>;
}

pub struct HttpFeedSource {
    fetcher: HttpFetcher,
    url: String,
}

impl HttpFeedSource {
    pub fn new(fetcher: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            fetcher,
            url: url.into(),
        }
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn fetch(&self, run_id: Uuid, sleeper: &dyn Sleeper) -> Result<Vec<u8>, FetchError> {
        Ok(self.fetcher.fetch_bytes(run_id, &self.url, sleeper).await?.body)
    }
}

pub struct FileFeedSource {
    path: PathBuf,
}

impl FileFeedSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FeedSource for FileFeedSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch(&self, _run_id: Uuid, _sleeper: &dyn Sleeper) -> Result<Vec<u8>, FetchError> {
        tokio::fs::read(&self.path).await.map_err(|source| FetchError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PushFailure {
    pub product_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feed_hash: String,
    /// Feed bytes identical to the last clean cycle; nothing was parsed or pushed.
    pub feed_unchanged: bool,
    pub parsed: usize,
    pub excluded: usize,
    pub validation_issues: Vec<String>,
    pub transform_warnings: usize,
    pub new_products: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub pushed: usize,
    pub failed: Vec<PushFailure>,
    pub halted: bool,
}

impl CycleReport {
    fn new(run_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            started_at: now,
            finished_at: now,
            feed_hash: String::new(),
            feed_unchanged: false,
            parsed: 0,
            excluded: 0,
            validation_issues: Vec::new(),
            transform_warnings: 0,
            new_products: 0,
            changed: 0,
            unchanged: 0,
            pushed: 0,
            failed: Vec::new(),
            halted: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub phase: Phase,
    pub cycles: u64,
    pub last_successful_sync: Option<DateTime<Utc>>,
    pub last_feed_hash: Option<String>,
    pub error_budget: ErrorBudget,
}

/// What the state file says, for the `status` command.
#[derive(Debug, Clone, Serialize)]
pub struct StateSummary {
    pub state_file: PathBuf,
    pub tracked_products: usize,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub products: BTreeMap<String, SyncRecord>,
}

pub async fn state_summary(store: &StateStore) -> Result<StateSummary, StateError> {
    let state = store.load().await?;
    Ok(StateSummary {
        state_file: store.path().to_path_buf(),
        tracked_products: state.products.len(),
        last_synced_at: state.last_synced_at(),
        products: state.products,
    })
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub interval: Duration,
    pub push_backoff: BackoffPolicy,
    pub max_sync_errors: u32,
    pub published_feed_path: Option<PathBuf>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            interval: config.sync.interval(),
            push_backoff: config.sync.backoff(),
            max_sync_errors: config.sync.max_sync_errors,
            published_feed_path: config.sync.published_feed_path.clone(),
        }
    }
}

struct PushOutcome {
    external_id: String,
    variant_ids: BTreeMap<String, String>,
}

/// Owns everything one sync process needs. Nothing is shared through globals.
pub struct Orchestrator {
    settings: OrchestratorSettings,
    transform: TransformConfig,
    source: Box<dyn FeedSource>,
    storefront: Arc<dyn StorefrontApi>,
    sleeper: Arc<dyn Sleeper>,
    state_store: StateStore,
    archive: Option<FeedArchive>,
    phase: Phase,
    budget: ErrorBudget,
    cycles: u64,
    last_feed_hash: Option<String>,
    last_cycle_clean: bool,
    last_successful_sync: Option<DateTime<Utc>>,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        transform: TransformConfig,
        source: Box<dyn FeedSource>,
        storefront: Arc<dyn StorefrontApi>,
        state_store: StateStore,
    ) -> Self {
        let budget = ErrorBudget::new(settings.max_sync_errors);
        Self {
            settings,
            transform,
            source,
            storefront,
            sleeper: Arc::new(TokioSleeper),
            state_store,
            archive: None,
            phase: Phase::Idle,
            budget,
            cycles: 0,
            last_feed_hash: None,
            last_cycle_clean: false,
            last_successful_sync: None,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_archive(mut self, archive: FeedArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Wires the HTTP feed (or local file), the Shopify client and the state file from config.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        config.validate_for_sync()?;
        let sync = &config.sync;

        let source: Box<dyn FeedSource> = match (&sync.feed_url, &sync.feed_path) {
            (Some(url), _) => {
                let fetcher = HttpFetcher::new(HttpClientConfig {
                    timeout: sync.http_timeout(),
                    user_agent: Some(sync.user_agent.clone()),
                    backoff: sync.backoff(),
                })?;
                Box::new(HttpFeedSource::new(fetcher, url.clone()))
            }
            (None, Some(path)) => Box::new(FileFeedSource::new(path.clone())),
            (None, None) => anyhow::bail!("no feed source configured"),
        };

        let storefront = ShopifyClient::new(
            sync.shop_domain.as_deref().unwrap_or_default(),
            &sync.api_version,
            sync.access_token.as_deref().unwrap_or_default(),
            sync.http_timeout(),
            &sync.user_agent,
        )
        .context("configuring storefront client")?;

        Ok(Self::new(
            OrchestratorSettings::from_config(config),
            config.transform.clone(),
            source,
            Arc::new(storefront),
            StateStore::new(sync.state_file_path.clone()),
        )
        .with_archive(FeedArchive::new(sync.feed_cache_dir.clone())))
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn error_budget(&self) -> ErrorBudget {
        self.budget
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            phase: self.phase,
            cycles: self.cycles,
            last_successful_sync: self.last_successful_sync,
            last_feed_hash: self.last_feed_hash.clone(),
            error_budget: self.budget,
        }
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "phase transition");
            self.phase = phase;
        }
    }

    fn halt(&mut self) {
        error!(
            consecutive_failures = self.budget.consecutive_failures,
            max_sync_errors = self.budget.max_sync_errors,
            "sync halted; restart required"
        );
        self.phase = Phase::Halted;
    }

    /// Counts a whole-cycle failure against the budget and ends the cycle.
    fn fail_cycle(&mut self, err: CycleError) -> CycleError {
        warn!(error = %err, "sync cycle failed");
        self.last_cycle_clean = false;
        if self.budget.record_failure() {
            self.halt();
        } else {
            self.enter(Phase::Idle);
        }
        err
    }

    /// Runs FETCHING through PERSISTING once. A halted orchestrator does nothing and errors.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, CycleError> {
        if self.phase == Phase::Halted {
            return Err(CycleError::Halted {
                consecutive_failures: self.budget.consecutive_failures,
            });
        }
        self.cycles += 1;
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_cycle", %run_id, cycle = self.cycles);
        self.cycle(run_id).instrument(span).await
    }

    async fn cycle(&mut self, run_id: Uuid) -> Result<CycleReport, CycleError> {
        let mut report = CycleReport::new(run_id);

        self.enter(Phase::Fetching);
        info!(source = %self.source.describe(), "fetching feed");
        let bytes = match self.source.fetch(run_id, self.sleeper.as_ref()).await {
            Ok(bytes) => bytes,
            Err(err) => return Err(self.fail_cycle(err.into())),
        };
        report.feed_hash = sha256_hex(&bytes);

        if let Some(archive) = &self.archive {
            match archive.store(Utc::now(), &bytes).await {
                Ok(archived) => debug!(
                    path = %archived.relative_path.display(),
                    deduplicated = archived.deduplicated,
                    "feed archived"
                ),
                Err(err) => warn!(error = %err, "could not archive feed"),
            }
        }

        if self.last_cycle_clean && self.last_feed_hash.as_deref() == Some(report.feed_hash.as_str()) {
            info!("feed unchanged since last clean cycle");
            report.feed_unchanged = true;
            return Ok(self.finish_cycle(report));
        }

        self.enter(Phase::Parsing);
        let catalog = match parse_source_feed(&bytes) {
            Ok(catalog) => catalog,
            Err(err) => return Err(self.fail_cycle(err.into())),
        };
        let mut products = catalog.products;
        report.validation_issues = catalog.issues.iter().map(ToString::to_string).collect();
        report.excluded = exclude_by_code_prefix(&mut products, &self.transform.exclude_code_prefixes);
        report.parsed = products.len();

        self.enter(Phase::Diffing);
        let mut state = match self.state_store.load().await {
            Ok(state) => state,
            Err(err) => {
                // Prior state is never guessed.
                self.last_cycle_clean = false;
                self.budget.record_failure();
                self.halt();
                return Err(err.into());
            }
        };
        let diff = diff_catalog(&products, &state);
        for entry in &diff {
            match entry.kind {
                DiffKind::NewProduct => report.new_products += 1,
                DiffKind::Changed(_) => report.changed += 1,
                DiffKind::Unchanged => report.unchanged += 1,
            }
        }
        info!(
            parsed = report.parsed,
            new = report.new_products,
            changed = report.changed,
            unchanged = report.unchanged,
            "diff complete"
        );

        let output = match Pipeline::new(self.transform.clone()).and_then(|mut p| p.run(&products)) {
            Ok(output) => output,
            Err(err) => return Err(self.fail_cycle(err.into())),
        };
        report.transform_warnings = output.warnings.len();
        let targets: HashMap<&str, &TargetProduct> =
            output.products.iter().map(|p| (p.id.as_str(), p)).collect();

        self.enter(Phase::Pushing);
        for entry in diff.iter().filter(|e| e.kind.needs_push()) {
            let Some(target) = targets.get(entry.product_id.as_str()) else {
                continue;
            };
            if let DiffKind::Changed(changes) = &entry.kind {
                debug!(product_id = %entry.product_id, fields = ?changes.labels(), "product changed");
            }

            let prior = state.get(&entry.product_id).cloned();
            match self.push_product(target, prior.as_ref()).await {
                Ok(outcome) => {
                    self.enter(Phase::Persisting);
                    state.upsert(
                        entry.product_id.clone(),
                        SyncRecord {
                            external_id: outcome.external_id,
                            fingerprint: entry.fingerprint.clone(),
                            last_synced_at: Utc::now(),
                            variant_ids: outcome.variant_ids,
                        },
                    );
                    if let Err(err) = self.state_store.save(&state).await {
                        self.last_cycle_clean = false;
                        self.budget.record_failure();
                        self.halt();
                        return Err(err.into());
                    }
                    self.budget.record_success();
                    report.pushed += 1;
                    self.enter(Phase::Pushing);
                }
                Err(err) => {
                    error!(product_id = %entry.product_id, error = %err, "push failed");
                    report.failed.push(PushFailure {
                        product_id: entry.product_id.clone(),
                        error: err.to_string(),
                    });
                    if self.budget.record_failure() {
                        self.halt();
                        report.halted = true;
                        break;
                    }
                }
            }
        }

        if report.halted {
            self.last_cycle_clean = false;
            report.finished_at = Utc::now();
            return Ok(report);
        }

        if let Some(path) = &self.settings.published_feed_path {
            if let Err(err) = publish_feed(path, &output.products).await {
                warn!(error = %err, "could not write published feed");
            }
        }

        self.last_feed_hash = Some(report.feed_hash.clone());
        self.last_cycle_clean = report.failed.is_empty();
        Ok(self.finish_cycle(report))
    }

    fn finish_cycle(&mut self, mut report: CycleReport) -> CycleReport {
        if report.failed.is_empty() {
            self.budget.record_success();
            self.last_successful_sync = Some(Utc::now());
        }
        report.finished_at = Utc::now();
        self.enter(Phase::Idle);
        info!(
            pushed = report.pushed,
            failed = report.failed.len(),
            skipped = report.validation_issues.len(),
            feed_unchanged = report.feed_unchanged,
            total_errors = self.budget.total_errors_this_run,
            "sync cycle finished"
        );
        report
    }

    async fn push_product(
        &self,
        target: &TargetProduct,
        prior: Option<&SyncRecord>,
    ) -> Result<PushOutcome, StorefrontError> {
        let payload = ProductPayload::from_target(target);
        let storefront = &self.storefront;

        let Some(record) = prior else {
            let remote = self
                .with_retries("create_product", &target.id, || storefront.create_product(&payload))
                .await?;
            let variant_ids = remote
                .variants
                .into_iter()
                .filter(|v| !v.sku.is_empty())
                .map(|v| (v.sku, v.id))
                .collect();
            return Ok(PushOutcome {
                external_id: remote.id,
                variant_ids,
            });
        };

        let external_id = record.external_id.as_str();
        let remote = self
            .with_retries("update_product", &target.id, || {
                storefront.update_product(external_id, &payload)
            })
            .await?;

        let mut variant_ids = record.variant_ids.clone();
        for variant in remote.variants.into_iter().filter(|v| !v.sku.is_empty()) {
            variant_ids.entry(variant.sku).or_insert(variant.id);
        }

        for variant in &payload.variants {
            let pushed = match variant_ids.get(&variant.sku) {
                Some(variant_id) => {
                    self.with_retries("update_variant", &target.id, || {
                        storefront.update_variant(variant_id, variant)
                    })
                    .await?
                }
                None => {
                    self.with_retries("create_variant", &target.id, || {
                        storefront.create_variant(external_id, variant)
                    })
                    .await?
                }
            };
            variant_ids.insert(variant.sku.clone(), pushed.id);
        }

        Ok(PushOutcome {
            external_id: remote.id,
            variant_ids,
        })
    }

    async fn with_retries<T, F, Fut>(
        &self,
        operation: &'static str,
        product_id: &str,
        mut call: F,
    ) -> Result<T, StorefrontError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorefrontError>>,
    {
        let backoff = self.settings.push_backoff;
        let mut attempt = 0usize;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < backoff.max_retries => {
                    let delay = backoff.delay_with_hint(attempt, err.retry_after());
                    warn!(operation, product_id, attempt, ?delay, error = %err, "storefront call failed, retrying");
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Cycles until `stop` turns true or the error budget runs out. The stop flag is only
    /// read between cycles, so a running push always completes and its state is flushed.
    pub async fn run_daemon(&mut self, mut stop: watch::Receiver<bool>) -> Result<u64, CycleError> {
        let started = self.cycles;
        info!(interval = ?self.settings.interval, "sync daemon started");
        loop {
            if *stop.borrow() {
                break;
            }

            match self.run_cycle().await {
                Ok(report) if report.halted => {
                    return Err(CycleError::Halted {
                        consecutive_failures: self.budget.consecutive_failures,
                    })
                }
                Ok(_) => {}
                Err(err) if self.phase == Phase::Halted => return Err(err),
                Err(err) => error!(error = %err, "cycle aborted; retrying next interval"),
            }

            self.enter(Phase::Sleeping);
            let sleeper = Arc::clone(&self.sleeper);
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => break,
                _ = sleeper.sleep(self.settings.interval) => {}
            }
        }

        self.enter(Phase::Idle);
        let cycles = self.cycles - started;
        info!(cycles, "sync daemon stopped");
        Ok(cycles)
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            // Sender gone: nobody can ask us to stop any more.
            std::future::pending::<()>().await;
        }
    }
}

async fn publish_feed(path: &Path, products: &[TargetProduct]) -> anyhow::Result<()> {
    let xml = render_target_feed(products).context("rendering published feed")?;
    write_atomic(path, xml.as_bytes())
        .await
        .with_context(|| format!("writing published feed {}", path.display()))?;
    debug!(path = %path.display(), products = products.len(), "published feed written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storefront::{RemoteProduct, RemoteVariant, VariantPayload};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    const P1_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<root>
  <Product>
    <Product_code>P1</Product_code>
    <Name>Runner</Name>
    <Price>199</Price>
    <Stock>10</Stock>
    <Brand>Solederva</Brand>
    <mainCategory>Ayakkabı</mainCategory>
    <category>Spor</category>
    <Image1>https://cdn.example.com/p1.jpg</Image1>
    <variants>
      <variant><quantity>5</quantity><spec name="Renk">red</spec></variant>
      <variant><quantity>5</quantity><spec name="Renk">blue</spec></variant>
    </variants>
  </Product>
</root>"#;

    fn multi_feed(count: usize) -> String {
        let products: String = (1..=count)
            .map(|i| {
                format!(
                    "<Product><Product_code>M{i}</Product_code><Name>Item {i}</Name><Price>10</Price><Stock>1</Stock></Product>"
                )
            })
            .collect();
        format!("<root>{products}</root>")
    }

    #[derive(Default)]
    struct RecordingSleeper {
        waits: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        fn waits(&self) -> Vec<Duration> {
            self.waits.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.waits.lock().unwrap().push(duration);
        }
    }

    /// In-memory storefront. Scripted errors are returned before any call succeeds.
    #[derive(Default)]
    struct FakeStorefront {
        script: Mutex<VecDeque<StorefrontError>>,
        always_fail: Option<StorefrontError>,
        calls: AtomicUsize,
        successes: Mutex<Vec<String>>,
        next_id: AtomicUsize,
        stop_on_call: Option<watch::Sender<bool>>,
    }

    impl FakeStorefront {
        fn failing_with(err: StorefrontError) -> Self {
            Self {
                always_fail: Some(err),
                ..Self::default()
            }
        }

        fn scripted(errors: Vec<StorefrontError>) -> Self {
            Self {
                script: Mutex::new(errors.into()),
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn successes(&self) -> Vec<String> {
            self.successes.lock().unwrap().clone()
        }

        fn begin(&self, op: &str) -> Result<(), StorefrontError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(stop) = &self.stop_on_call {
                let _ = stop.send(true);
            }
            if let Some(err) = &self.always_fail {
                return Err(err.clone());
            }
            if let Some(err) = self.script.lock().unwrap().pop_front() {
                return Err(err);
            }
            self.successes.lock().unwrap().push(op.to_string());
            Ok(())
        }

        fn id(&self) -> String {
            (self.next_id.fetch_add(1, Ordering::SeqCst) + 1000).to_string()
        }

        fn remote_variants(&self, payload: &ProductPayload) -> Vec<RemoteVariant> {
            payload
                .variants
                .iter()
                .map(|v| RemoteVariant {
                    id: self.id(),
                    sku: v.sku.clone(),
                })
                .collect()
        }
    }

    #[async_trait]
    impl StorefrontApi for FakeStorefront {
        async fn create_product(&self, product: &ProductPayload) -> Result<RemoteProduct, StorefrontError> {
            self.begin("create_product")?;
            Ok(RemoteProduct {
                id: self.id(),
                variants: self.remote_variants(product),
            })
        }

        async fn update_product(
            &self,
            external_id: &str,
            _product: &ProductPayload,
        ) -> Result<RemoteProduct, StorefrontError> {
            self.begin("update_product")?;
            Ok(RemoteProduct {
                id: external_id.to_string(),
                variants: Vec::new(),
            })
        }

        async fn create_variant(
            &self,
            _external_id: &str,
            variant: &VariantPayload,
        ) -> Result<RemoteVariant, StorefrontError> {
            self.begin("create_variant")?;
            Ok(RemoteVariant {
                id: self.id(),
                sku: variant.sku.clone(),
            })
        }

        async fn update_variant(
            &self,
            variant_id: &str,
            variant: &VariantPayload,
        ) -> Result<RemoteVariant, StorefrontError> {
            self.begin("update_variant")?;
            Ok(RemoteVariant {
                id: variant_id.to_string(),
                sku: variant.sku.clone(),
            })
        }
    }

    /// Serves fixed bytes and counts fetches.
    struct StaticFeed {
        body: Mutex<Vec<u8>>,
        fetches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FeedSource for StaticFeed {
        fn describe(&self) -> String {
            "static".into()
        }

        async fn fetch(&self, _run_id: Uuid, _sleeper: &dyn Sleeper) -> Result<Vec<u8>, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.body.lock().unwrap().clone())
        }
    }

    struct Harness {
        dir: TempDir,
        storefront: Arc<FakeStorefront>,
        sleeper: Arc<RecordingSleeper>,
        fetches: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new(storefront: FakeStorefront) -> Self {
            Self {
                dir: tempdir().unwrap(),
                storefront: Arc::new(storefront),
                sleeper: Arc::new(RecordingSleeper::default()),
                fetches: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn state_path(&self) -> PathBuf {
            self.dir.path().join("sync_state.json")
        }

        fn orchestrator(&self, feed: &str, max_sync_errors: u32) -> Orchestrator {
            let source = StaticFeed {
                body: Mutex::new(feed.as_bytes().to_vec()),
                fetches: Arc::clone(&self.fetches),
            };
            self.orchestrator_with_source(Box::new(source), max_sync_errors)
        }

        fn orchestrator_with_source(&self, source: Box<dyn FeedSource>, max_sync_errors: u32) -> Orchestrator {
            let settings = OrchestratorSettings {
                interval: Duration::from_secs(1800),
                push_backoff: BackoffPolicy::from_retry_settings(3, Duration::from_secs(60)),
                max_sync_errors,
                published_feed_path: Some(self.dir.path().join("published.xml")),
            };
            let transform = TransformConfig {
                variant_mode: true,
                ..TransformConfig::default()
            };
            let storefront: Arc<dyn StorefrontApi> = self.storefront.clone();
            let sleeper: Arc<dyn Sleeper> = self.sleeper.clone();
            Orchestrator::new(
                settings,
                transform,
                source,
                storefront,
                StateStore::new(self.state_path()),
            )
            .with_sleeper(sleeper)
            .with_archive(FeedArchive::new(self.dir.path().join("feed_cache")))
        }
    }

    #[tokio::test]
    async fn unchanged_second_run_pushes_nothing() {
        let harness = Harness::new(FakeStorefront::default());
        let mut orchestrator = harness.orchestrator(P1_FEED, 5);

        let first = orchestrator.run_cycle().await.unwrap();
        assert_eq!(first.new_products, 1);
        assert_eq!(first.pushed, 1);
        assert_eq!(harness.storefront.successes(), vec!["create_product"]);

        let state = StateStore::new(harness.state_path()).load().await.unwrap();
        let record = state.get("P1").unwrap();
        assert_eq!(record.variant_ids.len(), 2);

        let published = std::fs::read_to_string(harness.dir.path().join("published.xml")).unwrap();
        let barcodes: Vec<&str> = published
            .lines()
            .filter(|l| l.trim_start().starts_with("<Barcode>2199"))
            .collect();
        // product barcode plus one per variant
        assert_eq!(barcodes.len(), 3);

        // Same process: the identical feed short-circuits.
        let second = orchestrator.run_cycle().await.unwrap();
        assert!(second.feed_unchanged);
        assert_eq!(harness.storefront.calls(), 1);

        // Fresh process over the same state: the noisy pipeline runs again, diff says unchanged.
        let mut restarted = harness.orchestrator(P1_FEED, 5);
        let third = restarted.run_cycle().await.unwrap();
        assert!(!third.feed_unchanged);
        assert_eq!(third.unchanged, 1);
        assert_eq!(third.pushed, 0);
        assert_eq!(harness.storefront.calls(), 1);
    }

    #[tokio::test]
    async fn changed_price_updates_product_and_known_variants() {
        let harness = Harness::new(FakeStorefront::default());
        harness.orchestrator(P1_FEED, 5).run_cycle().await.unwrap();

        let repriced = P1_FEED.replace("<Price>199</Price>", "<Price>219</Price>");
        let report = harness.orchestrator(&repriced, 5).run_cycle().await.unwrap();
        assert_eq!(report.changed, 1);
        assert_eq!(report.pushed, 1);
        assert_eq!(
            harness.storefront.successes(),
            vec!["create_product", "update_product", "update_variant", "update_variant"]
        );
    }

    #[tokio::test]
    async fn transient_failures_are_retried_with_growing_waits() {
        let harness = Harness::new(FakeStorefront::scripted(vec![
            StorefrontError::Network("connection reset".into()),
            StorefrontError::Network("connection reset".into()),
        ]));
        let report = harness.orchestrator(P1_FEED, 5).run_cycle().await.unwrap();

        assert_eq!(report.pushed, 1);
        assert_eq!(harness.storefront.calls(), 3);
        assert_eq!(harness.storefront.successes(), vec!["create_product"]);
        let waits = harness.sleeper.waits();
        assert_eq!(waits.len(), 2);
        assert!(waits[0] <= waits[1]);
    }

    #[tokio::test]
    async fn rate_limit_hint_is_a_lower_bound() {
        let harness = Harness::new(FakeStorefront::scripted(vec![StorefrontError::RateLimited {
            retry_after: Some(Duration::from_secs(600)),
        }]));
        harness.orchestrator(P1_FEED, 5).run_cycle().await.unwrap();
        assert_eq!(harness.sleeper.waits(), vec![Duration::from_secs(600)]);
    }

    #[tokio::test]
    async fn error_budget_exhaustion_halts_without_further_calls() {
        let harness = Harness::new(FakeStorefront::failing_with(StorefrontError::Api {
            status: 422,
            message: "invalid".into(),
        }));
        let max_sync_errors = 2;
        let mut orchestrator = harness.orchestrator(&multi_feed(6), max_sync_errors);

        let report = orchestrator.run_cycle().await.unwrap();
        assert!(report.halted);
        assert_eq!(report.failed.len(), max_sync_errors as usize + 1);
        assert_eq!(orchestrator.phase(), Phase::Halted);
        assert_eq!(harness.storefront.calls(), max_sync_errors as usize + 1);
        // Non-retryable errors never wait.
        assert!(harness.sleeper.waits().is_empty());

        let fetches = harness.fetches.load(Ordering::SeqCst);
        let again = orchestrator.run_cycle().await;
        assert!(matches!(again, Err(CycleError::Halted { .. })));
        assert_eq!(harness.storefront.calls(), max_sync_errors as usize + 1);
        assert_eq!(harness.fetches.load(Ordering::SeqCst), fetches);
    }

    /// Always fails the way an unreachable supplier does.
    struct UnreachableFeed {
        fetches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FeedSource for UnreachableFeed {
        fn describe(&self) -> String {
            "unreachable".into()
        }

        async fn fetch(&self, _run_id: Uuid, _sleeper: &dyn Sleeper) -> Result<Vec<u8>, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::HttpStatus {
                status: 503,
                url: "https://supplier.example.com/feed.xml".into(),
            })
        }
    }

    #[tokio::test]
    async fn repeated_fetch_failures_halt_and_stop_fetching() {
        let harness = Harness::new(FakeStorefront::default());
        let source = UnreachableFeed {
            fetches: Arc::clone(&harness.fetches),
        };
        let max_sync_errors = 2;
        let mut orchestrator = harness.orchestrator_with_source(Box::new(source), max_sync_errors);

        for cycle in 1..=max_sync_errors {
            let err = orchestrator.run_cycle().await.unwrap_err();
            assert!(matches!(err, CycleError::Fetch(_)), "cycle {cycle}: {err}");
            assert_eq!(orchestrator.phase(), Phase::Idle);
            assert_eq!(orchestrator.error_budget().consecutive_failures, cycle);
        }

        let err = orchestrator.run_cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::Fetch(_)));
        assert_eq!(orchestrator.phase(), Phase::Halted);
        let fetches = harness.fetches.load(Ordering::SeqCst);
        assert_eq!(fetches, max_sync_errors as usize + 1);

        for _ in 0..2 {
            let again = orchestrator.run_cycle().await;
            assert!(matches!(again, Err(CycleError::Halted { consecutive_failures: 3 })));
        }
        assert_eq!(harness.fetches.load(Ordering::SeqCst), fetches);
        assert_eq!(harness.storefront.calls(), 0);
        assert!(!harness.state_path().exists());
    }

    #[tokio::test]
    async fn repeated_parse_failures_halt() {
        let harness = Harness::new(FakeStorefront::default());
        let mut orchestrator = harness.orchestrator("<root><Product>", 1);

        assert!(matches!(orchestrator.run_cycle().await, Err(CycleError::Parse(_))));
        assert_eq!(orchestrator.phase(), Phase::Idle);
        assert!(matches!(orchestrator.run_cycle().await, Err(CycleError::Parse(_))));
        assert_eq!(orchestrator.phase(), Phase::Halted);

        assert!(matches!(orchestrator.run_cycle().await, Err(CycleError::Halted { .. })));
        assert_eq!(harness.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn feed_fetch_backoff_waits_on_the_injected_sleeper() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let supplier = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&supplier)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(P1_FEED))
            .expect(1)
            .mount(&supplier)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("catsync-test".into()),
            backoff: BackoffPolicy::from_retry_settings(3, Duration::from_secs(60)),
        })
        .unwrap();
        let source = HttpFeedSource::new(fetcher, format!("{}/feed.xml", supplier.uri()));

        let harness = Harness::new(FakeStorefront::default());
        let report = harness
            .orchestrator_with_source(Box::new(source), 5)
            .run_cycle()
            .await
            .unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(
            harness.sleeper.waits(),
            vec![Duration::from_secs(60), Duration::from_secs(120)]
        );
    }

    #[tokio::test]
    async fn one_bad_product_does_not_block_the_rest() {
        let harness = Harness::new(FakeStorefront::scripted(vec![StorefrontError::Api {
            status: 422,
            message: "title can't be blank".into(),
        }]));
        let mut orchestrator = harness.orchestrator(&multi_feed(3), 5);
        let report = orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].product_id, "M1");
        assert_eq!(report.pushed, 2);
        assert_eq!(orchestrator.error_budget().consecutive_failures, 0);
        assert_eq!(orchestrator.error_budget().total_errors_this_run, 1);

        // The failed product is retried on the next cycle even though the feed is identical.
        let retry = orchestrator.run_cycle().await.unwrap();
        assert!(!retry.feed_unchanged);
        assert_eq!(retry.new_products, 1);
        assert_eq!(retry.pushed, 1);
    }

    #[tokio::test]
    async fn malformed_feed_aborts_cycle_without_touching_state() {
        let harness = Harness::new(FakeStorefront::default());
        let mut orchestrator = harness.orchestrator("<root><Product>", 5);
        let err = orchestrator.run_cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::Parse(_)));
        assert_eq!(orchestrator.phase(), Phase::Idle);
        assert_eq!(orchestrator.error_budget().consecutive_failures, 1);
        assert!(!harness.state_path().exists());
        assert_eq!(harness.storefront.calls(), 0);
    }

    #[tokio::test]
    async fn corrupt_state_halts_immediately() {
        let harness = Harness::new(FakeStorefront::default());
        std::fs::write(harness.state_path(), "{ not json").unwrap();
        let mut orchestrator = harness.orchestrator(P1_FEED, 5);

        let err = orchestrator.run_cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::State(StateError::Corrupt { .. })));
        assert_eq!(orchestrator.phase(), Phase::Halted);
        assert_eq!(harness.storefront.calls(), 0);
        assert_eq!(std::fs::read_to_string(harness.state_path()).unwrap(), "{ not json");
    }

    #[tokio::test]
    async fn stop_during_push_is_honored_after_the_cycle() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let harness = Harness::new(FakeStorefront {
            stop_on_call: Some(stop_tx),
            ..FakeStorefront::default()
        });
        let mut orchestrator = harness.orchestrator(&multi_feed(3), 5);

        let cycles = orchestrator.run_daemon(stop_rx).await.unwrap();
        assert_eq!(cycles, 1);
        assert_eq!(harness.storefront.successes().len(), 3);
        assert_eq!(orchestrator.phase(), Phase::Idle);

        let state = StateStore::new(harness.state_path()).load().await.unwrap();
        assert_eq!(state.products.len(), 3);
    }

    #[tokio::test]
    async fn daemon_sleeps_the_configured_interval_between_cycles() {
        let (stop_tx, stop_rx) = watch::channel(false);

        struct StopAfter {
            remaining: Mutex<usize>,
            stop: watch::Sender<bool>,
            waits: Mutex<Vec<Duration>>,
        }

        #[async_trait]
        impl Sleeper for StopAfter {
            async fn sleep(&self, duration: Duration) {
                self.waits.lock().unwrap().push(duration);
                let mut remaining = self.remaining.lock().unwrap();
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    let _ = self.stop.send(true);
                }
            }
        }

        let harness = Harness::new(FakeStorefront::default());
        let sleeper = Arc::new(StopAfter {
            remaining: Mutex::new(2),
            stop: stop_tx,
            waits: Mutex::new(Vec::new()),
        });
        let mut orchestrator = harness
            .orchestrator(P1_FEED, 5)
            .with_sleeper(sleeper.clone());

        let cycles = orchestrator.run_daemon(stop_rx).await.unwrap();
        assert_eq!(cycles, 2);
        assert_eq!(
            *sleeper.waits.lock().unwrap(),
            vec![Duration::from_secs(1800), Duration::from_secs(1800)]
        );
        assert_eq!(orchestrator.status().cycles, 2);
        assert!(orchestrator.status().last_successful_sync.is_some());
    }

    #[tokio::test]
    async fn status_summary_reads_state_file() {
        let harness = Harness::new(FakeStorefront::default());
        harness.orchestrator(P1_FEED, 5).run_cycle().await.unwrap();
        let summary = state_summary(&StateStore::new(harness.state_path())).await.unwrap();
        assert_eq!(summary.tracked_products, 1);
        assert!(summary.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn file_source_reads_local_feed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("feed.xml");
        std::fs::write(&path, P1_FEED).unwrap();
        let bytes = FileFeedSource::new(&path).fetch(Uuid::new_v4(), &TokioSleeper).await.unwrap();
        assert_eq!(bytes, P1_FEED.as_bytes());

        let missing = FileFeedSource::new(dir.path().join("nope.xml"));
        assert!(matches!(missing.fetch(Uuid::new_v4(), &TokioSleeper).await, Err(FetchError::Io { .. })));
    }
}
