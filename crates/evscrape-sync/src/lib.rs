//! Sync pipeline orchestration: collect every source, merge into the stored
//! collections, report.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use evscrape_adapters::{adapter_for_source, collect_events, AdapterError, FixturePageLoader, HttpPageLoader};
use evscrape_core::{normalize_key_component, Event};
use evscrape_storage::{
    export_events_csv, BackoffPolicy, CollectionStore, CsvCollectionStore, FetchConfig, PageFetcher, RetryingStore,
    StoreError, DEFAULT_MARKER_COLUMN,
};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod merge;

pub use merge::{
    align_to_header, DedupePlan, DiffOutcome, DuplicateGroup, MergeConfig, MergeEngine, SchemaMismatch,
    SurvivorPolicy, SurvivorRule, DEFAULT_FLAG_COLUMN, KEY_COLUMNS,
};

pub const CRATE_NAME: &str = "evscrape-sync";

pub const COMBINED_COLLECTION: &str = "combined";

/// Jaro-Winkler title similarity at or above which two same-day events are
/// listed for manual review.
pub const DEFAULT_NEAR_DUPLICATE_THRESHOLD: f64 = 0.92;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Live,
    Fixture,
}

fn default_max_pages() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub mode: SourceMode,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub collections_dir: PathBuf,
    pub fixtures_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub flag_column: String,
    pub marker_column: String,
    pub per_source_collections: bool,
    pub dedupe_after_merge: bool,
    pub store_retries: usize,
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn for_workspace(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        Self {
            collections_dir: workspace_root.join("collections"),
            fixtures_dir: workspace_root.join("fixtures"),
            workspace_root,
            user_agent: "evscrape/0.1".to_string(),
            http_timeout_secs: 20,
            flag_column: DEFAULT_FLAG_COLUMN.to_string(),
            marker_column: DEFAULT_MARKER_COLUMN.to_string(),
            per_source_collections: true,
            dedupe_after_merge: false,
            store_retries: 3,
        }
    }

    pub fn from_env() -> Self {
        let base = Self::for_workspace(
            std::env::var("EVSCRAPE_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        );
        Self {
            collections_dir: std::env::var("EVSCRAPE_COLLECTIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or(base.collections_dir),
            user_agent: std::env::var("EVSCRAPE_USER_AGENT").unwrap_or(base.user_agent),
            http_timeout_secs: std::env::var("EVSCRAPE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(base.http_timeout_secs),
            flag_column: std::env::var("EVSCRAPE_FLAG_COLUMN").unwrap_or(base.flag_column),
            marker_column: std::env::var("EVSCRAPE_MARKER_COLUMN").unwrap_or(base.marker_column),
            per_source_collections: env_flag("EVSCRAPE_PER_SOURCE_COLLECTIONS", base.per_source_collections),
            dedupe_after_merge: env_flag("EVSCRAPE_DEDUPE_AFTER_MERGE", base.dedupe_after_merge),
            store_retries: std::env::var("EVSCRAPE_STORE_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(base.store_retries),
            ..base
        }
    }

    pub fn collection_path(&self, name: &str) -> PathBuf {
        self.collections_dir.join(format!("{name}.csv"))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterFailure {
    pub source_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionFailure {
    pub collection: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub source_id: String,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Default)]
pub struct CollectedEvents {
    pub batches: Vec<SourceBatch>,
    pub failures: Vec<AdapterFailure>,
}

impl CollectedEvents {
    pub fn all_events(&self) -> Vec<Event> {
        self.batches.iter().flat_map(|b| b.events.iter().cloned()).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionOutcome {
    pub collection: String,
    pub header_initialized: bool,
    pub inserted: usize,
    pub already_present: usize,
    pub duplicates_removed: usize,
    pub dedupe_error: Option<String>,
    pub schema_warnings: Vec<String>,
    #[serde(skip)]
    pub new_events: Vec<Event>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventStats {
    pub total: usize,
    pub by_source: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
}

impl EventStats {
    pub fn categories_by_count(&self) -> Vec<(&str, usize)> {
        let mut categories = self
            .by_category
            .iter()
            .map(|(name, count)| (name.as_str(), *count))
            .collect::<Vec<_>>();
        categories.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        categories
    }
}

pub fn compute_stats(events: &[Event]) -> EventStats {
    let mut stats = EventStats {
        total: events.len(),
        ..Default::default()
    };
    for event in events {
        *stats.by_source.entry(event.source().to_string()).or_default() += 1;
        if let Some(category) = event.category().filter(|c| !c.trim().is_empty()) {
            for name in category.split(", ") {
                *stats.by_category.entry(name.to_string()).or_default() += 1;
            }
        }
    }
    stats
}

#[derive(Debug, Clone, Serialize)]
pub struct NearDuplicate {
    pub start_date: String,
    pub title_a: String,
    pub source_a: String,
    pub title_b: String,
    pub source_b: String,
    pub similarity: f64,
}

/// Pairs of events on the same normalized start date with different
/// identity keys but near-identical titles. Reported only; never merged.
pub fn find_near_duplicates(events: &[Event], threshold: f64) -> Vec<NearDuplicate> {
    let keyed = events
        .iter()
        .map(|e| {
            (
                e,
                e.identity_key(),
                normalize_key_component(e.start_date()),
                normalize_key_component(e.title()),
            )
        })
        .collect::<Vec<_>>();

    let mut pairs = Vec::new();
    for (i, (a, key_a, date_a, title_a)) in keyed.iter().enumerate() {
        for (b, key_b, date_b, title_b) in &keyed[i + 1..] {
            if date_a != date_b || key_a == key_b {
                continue;
            }
            let similarity = jaro_winkler(title_a, title_b);
            if similarity >= threshold {
                pairs.push(NearDuplicate {
                    start_date: a.start_date().to_string(),
                    title_a: a.title().to_string(),
                    source_a: a.source().to_string(),
                    title_b: b.title().to_string(),
                    source_b: b.source().to_string(),
                    similarity,
                });
            }
        }
    }
    pairs
}

/// One merge cycle. A failed read ends the cycle before anything is written.
/// Once rows are committed the outcome is returned even if the follow-up
/// dedupe fails; that failure lands in `dedupe_error`.
pub async fn merge_batch(
    store: &dyn CollectionStore,
    engine: &MergeEngine,
    events: &[Event],
    dedupe_after: bool,
) -> Result<CollectionOutcome, StoreError> {
    let existing = store.read_all().await?;
    let diff = engine.diff(&existing, events);

    if diff.initialize_header {
        store.initialize(&diff.header, &diff.rows_to_insert).await?;
    } else if !diff.rows_to_insert.is_empty() {
        store.insert_rows_at_top(&diff.rows_to_insert).await?;
    }
    info!(
        collection = store.name(),
        inserted = diff.rows_to_insert.len(),
        already_present = diff.already_present,
        "collection merged"
    );

    let mut outcome = CollectionOutcome {
        collection: store.name().to_string(),
        header_initialized: diff.initialize_header,
        inserted: diff.rows_to_insert.len(),
        already_present: diff.already_present,
        duplicates_removed: 0,
        dedupe_error: None,
        schema_warnings: diff.schema_warnings.iter().map(ToString::to_string).collect(),
        new_events: diff.new_events,
    };
    if dedupe_after {
        match dedupe_collection(store, engine).await {
            Ok(plan) => outcome.duplicates_removed = plan.rows_to_delete.len(),
            Err(err) => {
                warn!(collection = store.name(), error = %err, "dedupe after merge failed");
                outcome.dedupe_error = Some(err.to_string());
            }
        }
    }
    Ok(outcome)
}

/// Re-reads the collection and deletes every duplicate but its survivor.
pub async fn dedupe_collection(store: &dyn CollectionStore, engine: &MergeEngine) -> Result<DedupePlan, StoreError> {
    let collection = store.read_all().await?;
    let plan = engine.deduplicate_in_place(&collection);
    if plan.is_empty() {
        info!(collection = store.name(), "no duplicate rows found");
        return Ok(plan);
    }
    store.delete_rows(&plan.rows_to_delete).await?;
    info!(
        collection = store.name(),
        groups = plan.duplicate_groups.len(),
        removed = plan.rows_to_delete.len(),
        "duplicate rows removed"
    );
    Ok(plan)
}

/// Sets the flag marker on every row whose trimmed `title_column` text is in
/// `titles`. Returns how many rows were newly flagged.
pub async fn mark_reviewed(
    store: &dyn CollectionStore,
    titles: &HashSet<String>,
    title_column: &str,
) -> Result<usize, StoreError> {
    let collection = store.read_all().await?;
    let Some(title_idx) = collection.column_index(title_column) else {
        return Err(StoreError::Malformed(format!(
            "{}: no `{title_column}` column in header",
            store.name()
        )));
    };
    let positions = collection
        .positioned_rows()
        .filter(|(_, row)| !row.marker.is_set() && titles.contains(row.cell(title_idx).trim()))
        .map(|(position, _)| position)
        .collect::<Vec<_>>();
    if !positions.is_empty() {
        store.set_flagged(&positions).await?;
    }
    info!(collection = store.name(), marked = positions.len(), "rows marked as reviewed");
    Ok(positions.len())
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sources: usize,
    pub fetched_events: usize,
    pub inserted_rows: usize,
    pub duplicates_removed: usize,
    pub adapter_failures: Vec<AdapterFailure>,
    pub collections: Vec<CollectionOutcome>,
    pub collection_failures: Vec<CollectionFailure>,
    pub near_duplicates: usize,
    pub reports_dir: String,
}

impl SyncRunSummary {
    pub fn failed_names(&self) -> Vec<&str> {
        self.adapter_failures
            .iter()
            .map(|f| f.source_id.as_str())
            .chain(self.collection_failures.iter().map(|f| f.collection.as_str()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeSummary {
    pub path: Option<PathBuf>,
    pub written: usize,
    pub stats: EventStats,
    pub failures: Vec<AdapterFailure>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    engine: MergeEngine,
    http: HttpPageLoader,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let survivor = SurvivorPolicy::load_or_default(&config.workspace_root)?;
        let engine = MergeEngine::new(MergeConfig {
            flag_column: config.flag_column.clone(),
            survivor,
        });
        let fetcher = PageFetcher::new(FetchConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            engine,
            http: HttpPageLoader::new(fetcher),
        })
    }

    pub fn with_engine(mut self, engine: MergeEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn engine(&self) -> &MergeEngine {
        &self.engine
    }

    pub async fn load_source_registry(&self) -> Result<SourceRegistry> {
        SourceRegistry::load(&self.config.workspace_root.join("sources.yaml")).await
    }

    pub fn open_collection(&self, path: impl Into<PathBuf>) -> RetryingStore<CsvCollectionStore> {
        RetryingStore::new(
            CsvCollectionStore::new(path).with_marker_column(self.config.marker_column.clone()),
            BackoffPolicy {
                max_retries: self.config.store_retries,
                ..Default::default()
            },
        )
    }

    async fn collect_source(&self, source: &SourceConfig) -> Result<Vec<Event>, AdapterError> {
        let adapter = adapter_for_source(&source.source_id)
            .ok_or_else(|| AdapterError::Message(format!("no adapter registered for {}", source.source_id)))?;
        match source.mode {
            SourceMode::Live => collect_events(adapter.as_ref(), &self.http, source.max_pages).await,
            SourceMode::Fixture => {
                let manifest = self
                    .config
                    .fixtures_dir
                    .join(&source.source_id)
                    .join("pages.yaml");
                let loader = FixturePageLoader::from_manifest(&manifest)?;
                collect_events(adapter.as_ref(), &loader, source.max_pages).await
            }
        }
    }

    /// Runs every enabled source in turn. A failing source is recorded and
    /// skipped; the others still run.
    pub async fn collect(&self, registry: &SourceRegistry) -> CollectedEvents {
        let mut collected = CollectedEvents::default();
        for source in registry.enabled() {
            let span = info_span!("source", source_id = %source.source_id, mode = ?source.mode);
            match self.collect_source(source).instrument(span).await {
                Ok(events) => {
                    info!(source_id = %source.source_id, events = events.len(), "source finished");
                    collected.batches.push(SourceBatch {
                        source_id: source.source_id.clone(),
                        events,
                    });
                }
                Err(err) => {
                    warn!(source_id = %source.source_id, error = %err, "source failed");
                    collected.failures.push(AdapterFailure {
                        source_id: source.source_id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        collected
    }

    async fn merge_named(&self, name: &str, events: &[Event]) -> Result<CollectionOutcome, StoreError> {
        let store = self.open_collection(self.config.collection_path(name));
        merge_batch(&store, &self.engine, events, self.config.dedupe_after_merge)
            .instrument(info_span!("collection", collection = name))
            .await
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = self.load_source_registry().await?;
        let enabled_sources = registry.enabled().count();

        let collected = self.collect(&registry).await;
        let all_events = collected.all_events();

        let mut targets: Vec<(String, Vec<Event>)> = Vec::new();
        if self.config.per_source_collections {
            targets.extend(
                collected
                    .batches
                    .iter()
                    .filter(|b| !b.events.is_empty())
                    .map(|b| (b.source_id.clone(), b.events.clone())),
            );
        }
        if !all_events.is_empty() {
            targets.push((COMBINED_COLLECTION.to_string(), all_events.clone()));
        }

        let mut collections = Vec::new();
        let mut collection_failures = Vec::new();
        for (name, events) in &targets {
            match self.merge_named(name, events).await {
                Ok(outcome) => {
                    if let Some(error) = &outcome.dedupe_error {
                        collection_failures.push(CollectionFailure {
                            collection: name.clone(),
                            error: format!("dedupe after merge: {error}"),
                        });
                    }
                    collections.push(outcome);
                }
                Err(err) => {
                    warn!(collection = %name, error = %err, "merge cycle aborted");
                    collection_failures.push(CollectionFailure {
                        collection: name.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        let stats = compute_stats(&all_events);
        let near_duplicates = find_near_duplicates(&all_events, DEFAULT_NEAR_DUPLICATE_THRESHOLD);
        let finished_at = Utc::now();

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            enabled_sources,
            fetched_events: all_events.len(),
            inserted_rows: collections.iter().map(|c| c.inserted).sum(),
            duplicates_removed: collections.iter().map(|c| c.duplicates_removed).sum(),
            adapter_failures: collected.failures,
            collections,
            collection_failures,
            near_duplicates: near_duplicates.len(),
            reports_dir: String::new(),
        };
        let reports_dir = self.write_reports(&summary, &stats, &near_duplicates).await?;
        summary.reports_dir = reports_dir.display().to_string();
        Ok(summary)
    }

    /// Collects every source and writes the batch to a fresh CSV, without
    /// touching any stored collection.
    pub async fn scrape_to_csv(&self, out: Option<PathBuf>) -> Result<ScrapeSummary> {
        let registry = self.load_source_registry().await?;
        let collected = self.collect(&registry).await;
        let events = collected.all_events();
        let stats = compute_stats(&events);

        if events.is_empty() {
            warn!("no events collected; nothing written");
            return Ok(ScrapeSummary {
                path: None,
                written: 0,
                stats,
                failures: collected.failures,
            });
        }

        let path = out.unwrap_or_else(|| {
            self.config.workspace_root.join(format!(
                "combined_events_{}.csv",
                Local::now().format("%Y%m%d_%H%M%S")
            ))
        });
        let written = export_events_csv(&path, &events).await?;
        Ok(ScrapeSummary {
            path: Some(path),
            written,
            stats,
            failures: collected.failures,
        })
    }

    async fn write_reports(
        &self,
        summary: &SyncRunSummary,
        stats: &EventStats,
        near_duplicates: &[NearDuplicate],
    ) -> Result<PathBuf> {
        let reports_dir = self
            .config
            .workspace_root
            .join("reports")
            .join(summary.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        fs::write(reports_dir.join("summary.md"), render_summary_markdown(summary, stats, near_duplicates))
            .await
            .context("writing summary.md")?;

        let inserted = summary
            .collections
            .iter()
            .map(|c| (c.collection.as_str(), &c.new_events))
            .collect::<BTreeMap<_, _>>();
        let delta_json = serde_json::to_vec_pretty(&serde_json::json!({
            "run": summary,
            "stats": stats,
            "inserted": inserted,
            "near_duplicates": near_duplicates,
        }))
        .context("serializing run delta")?;
        fs::write(reports_dir.join("delta.json"), delta_json)
            .await
            .context("writing delta.json")?;

        Ok(reports_dir)
    }
}

fn render_summary_markdown(summary: &SyncRunSummary, stats: &EventStats, near_duplicates: &[NearDuplicate]) -> String {
    let mut lines = vec![
        "# Event Sync Summary".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Enabled sources: {}", summary.enabled_sources),
        format!("- Events fetched: {}", summary.fetched_events),
        format!("- Rows inserted: {}", summary.inserted_rows),
        format!("- Duplicates removed: {}", summary.duplicates_removed),
        String::new(),
        "## Collections".to_string(),
    ];
    for c in &summary.collections {
        lines.push(format!(
            "- {}: {} inserted, {} already present, {} duplicates removed",
            c.collection, c.inserted, c.already_present, c.duplicates_removed
        ));
        lines.extend(c.schema_warnings.iter().map(|w| format!("  - warning: {w}")));
    }

    if !summary.adapter_failures.is_empty() || !summary.collection_failures.is_empty() {
        lines.push(String::new());
        lines.push("## Failures".to_string());
        lines.extend(
            summary
                .adapter_failures
                .iter()
                .map(|f| format!("- source {}: {}", f.source_id, f.error)),
        );
        lines.extend(
            summary
                .collection_failures
                .iter()
                .map(|f| format!("- collection {}: {}", f.collection, f.error)),
        );
    }

    lines.push(String::new());
    lines.push("## By Source".to_string());
    lines.extend(stats.by_source.iter().map(|(k, v)| format!("- {k}: {v}")));
    lines.push(String::new());
    lines.push("## By Category".to_string());
    lines.extend(stats.categories_by_count().iter().map(|(k, v)| format!("- {k}: {v}")));

    if !near_duplicates.is_empty() {
        lines.push(String::new());
        lines.push("## Possible Duplicates (review)".to_string());
        lines.extend(near_duplicates.iter().map(|d| {
            format!(
                "- {}: \"{}\" ({}) ~ \"{}\" ({}) [{:.3}]",
                d.start_date, d.title_a, d.source_a, d.title_b, d.source_b, d.similarity
            )
        }));
    }
    lines.push(String::new());
    lines.join("\n")
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    SyncPipeline::new(SyncConfig::from_env())?.run_once().await
}
