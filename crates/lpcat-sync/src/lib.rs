//! Batch orchestration: load streams, refresh the catalogue, decide actions, report gaps.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Int64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use lpcat_adapters::{
    open_stream, FetchCollaborator, FixtureAnnotator, FixtureFetcher, NoopAnnotator, NoopFetcher,
    PageAnnotator, PathExpansion, StreamOptions, StreamSpec, VerticalMap,
};
use lpcat_core::{
    Action, CatalogueRecord, Decision, GapRecord, GapReport, GapSummary, PageStatus, RawUrlRecord,
    RedirectKind, ResolvedFetch, SourceId, StatusWrite, StatusWriter, ATTR_BUSINESS_STATUS,
    ATTR_CATEGORY, ATTR_EXTERNAL_ID, ATTR_SESSION_COUNT, ATTR_VERTICAL,
};
use lpcat_reconcile::{page_id_for, ConfigError, GapSort, ReconcileConfig, Reconciler, ShardGroups};
use lpcat_storage::{sha256_hex, ArtifactStore, CatalogueStore, SourceObservation};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lpcat-sync";

pub const STREAMS_FILE: &str = "streams.yaml";
pub const RULES_FILE: &str = "reconcile.yaml";
pub const RUN_SUMMARY_FILE: &str = "run.json";
pub const GAP_REPORT_FILE: &str = "gap_report.json";
pub const ACTIONS_FILE: &str = "actions.json";
pub const DAILY_BRIEF_FILE: &str = "daily_brief.md";

/// Systemic failures. Anything per-record is a flag instead.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("missing {stream} stream: {detail}")]
    MissingStream { stream: SourceId, detail: String },
    #[error("warehouse stream '{0}' returned no rows")]
    EmptyWarehouse(String),
    #[error("invalid reconcile configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamRegistry {
    pub streams: Vec<StreamSpec>,
    #[serde(default)]
    pub collaborators: CollaboratorFixtures,
}

/// Optional fixture files standing in for the fetch service and the annotator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollaboratorFixtures {
    #[serde(default)]
    pub fetch: Option<PathBuf>,
    #[serde(default)]
    pub annotations: Option<PathBuf>,
}

impl StreamRegistry {
    pub fn enabled(&self, source: SourceId) -> impl Iterator<Item = &StreamSpec> {
        self.streams
            .iter()
            .filter(move |spec| spec.enabled && spec.source == source)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReconcileRules {
    pub reconcile: ReconcileConfig,
    pub warehouse_paths: PathExpansion,
    pub category_verticals: VerticalMap,
}

impl ReconcileRules {
    /// Validated reconciler for these rules.
    pub fn reconciler(&self) -> Result<Arc<Reconciler>, RunError> {
        self.reconcile.validate()?;
        Ok(Arc::new(Reconciler::new(self.reconcile.clone())))
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            path_expansion: self.warehouse_paths.clone(),
            vertical_map: self.category_verticals.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub catalogue_path: PathBuf,
    pub shards: usize,
    pub fetch_concurrency: usize,
    pub max_annotations: usize,
    pub apply_deactivations: bool,
}

impl SyncConfig {
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            artifacts_dir: root.join("artifacts"),
            reports_dir: root.join("reports"),
            catalogue_path: root.join("catalogue.json"),
            workspace_root: root,
            shards: 4,
            fetch_concurrency: 4,
            max_annotations: 25,
            apply_deactivations: false,
        }
    }

    pub fn from_env() -> Self {
        let root = std::env::var("LPCAT_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let mut config = Self::for_workspace(root);
        if let Ok(dir) = std::env::var("ARTIFACTS_DIR") {
            config.artifacts_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("LPCAT_REPORTS_DIR") {
            config.reports_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("LPCAT_CATALOGUE_PATH") {
            config.catalogue_path = PathBuf::from(path);
        }
        config.shards = env_usize("LPCAT_SHARDS", config.shards);
        config.fetch_concurrency = env_usize("LPCAT_FETCH_CONCURRENCY", config.fetch_concurrency);
        config.max_annotations = env_usize("LPCAT_MAX_ANNOTATIONS", config.max_annotations);
        config.apply_deactivations = std::env::var("LPCAT_APPLY_DEACTIVATIONS")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false);
        config
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchStats {
    pub fetched: usize,
    pub failed: usize,
    pub redirects: usize,
    pub declared_canonicals: usize,
    pub ambiguous: usize,
}

impl FetchStats {
    fn record(&mut self, fetch: &ResolvedFetch) {
        self.fetched += 1;
        match fetch.kind {
            RedirectKind::FetchFailed => self.failed += 1,
            RedirectKind::Redirect => self.redirects += 1,
            RedirectKind::DeclaredCanonical => self.declared_canonicals += 1,
            RedirectKind::Direct | RedirectKind::Unknown => {}
        }
        if !fetch.redirect_detected_reliably {
            self.ambiguous += 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_records: usize,
    pub warehouse_records: usize,
    pub catalogue_records: usize,
    pub created_records: usize,
    #[serde(default)]
    pub crawl_updates: usize,
    #[serde(default)]
    pub recatalogued: usize,
    pub fetch: FetchStats,
    pub eligible: usize,
    pub annotated: usize,
    pub deactivation_candidates: usize,
    pub deactivations_applied: usize,
    pub deactivations_rejected: usize,
    pub dry_run: bool,
    pub gaps: GapSummary,
    pub near_matches: usize,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

/// `None` in `write` means the run was a dry run and nothing was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivationOutcome {
    pub page_id: String,
    pub url: String,
    pub target: PageStatus,
    pub write: Option<StatusWrite>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionsReport {
    pub run_id: Uuid,
    pub dry_run: bool,
    pub decisions: Vec<Decision>,
    pub deactivations: Vec<DeactivationOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub struct SyncPipeline {
    config: SyncConfig,
    artifact_store: ArtifactStore,
    fetcher: Arc<dyn FetchCollaborator>,
    annotator: Arc<dyn PageAnnotator>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Self {
        let artifact_store = ArtifactStore::new(config.artifacts_dir.clone());
        Self {
            config,
            artifact_store,
            fetcher: Arc::new(NoopFetcher),
            annotator: Arc::new(NoopAnnotator),
        }
    }

    pub fn with_collaborators(
        mut self,
        fetcher: Arc<dyn FetchCollaborator>,
        annotator: Arc<dyn PageAnnotator>,
    ) -> Self {
        self.fetcher = fetcher;
        self.annotator = annotator;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        self.run(run_id)
            .instrument(info_span!("sync_run", %run_id))
            .await
    }

    async fn run(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let registry = load_stream_registry(&self.config.workspace_root).await?;
        let rules = load_reconcile_rules(&self.config.workspace_root).await?;
        let reconciler = rules.reconciler()?;
        let options = rules.stream_options();

        let source_records = self
            .load_source(&registry, SourceId::SourceOfRecord, &options, started_at)
            .await?;
        let warehouse_records = self
            .load_source(&registry, SourceId::Warehouse, &options, started_at)
            .await?;
        if warehouse_records.is_empty() {
            let ids = registry
                .enabled(SourceId::Warehouse)
                .map(|spec| spec.id.as_str())
                .collect::<Vec<_>>()
                .join(",");
            return Err(RunError::EmptyWarehouse(ids).into());
        }
        let crawl_specs = registry.enabled(SourceId::Crawl).collect::<Vec<_>>();
        let crawl_records = self
            .load_streams(&crawl_specs, SourceId::Crawl, &options, started_at)
            .await?;
        info!(
            source_records = source_records.len(),
            warehouse_records = warehouse_records.len(),
            crawl_updates = crawl_records.len(),
            "streams loaded"
        );

        let catalogue = Arc::new(CatalogueStore::load(&self.config.catalogue_path).await?);
        let created_records = self
            .observe_source_of_record(&reconciler, &catalogue, &source_records, started_at)
            .await;
        let recatalogued = recatalogue_crawl_updates(&reconciler, &catalogue, &crawl_records).await?;

        let fetch = self.fetch_pending(&reconciler, &catalogue).await?;
        info!(fetched = fetch.fetched, failed = fetch.failed, redirects = fetch.redirects, "fetch stage done");

        let sessions = reconciler.session_index(&warehouse_records);
        let decisions = reconciler.decide_all(&catalogue.snapshot().await, &sessions);
        let eligible = decisions
            .iter()
            .filter(|d| d.has(Action::EligibleForCataloguing))
            .count();

        let annotated = self.annotate_eligible(&catalogue, &decisions).await?;
        let deactivations = self
            .deactivate_zero_sessions(&catalogue, &decisions, rules.reconcile.deactivated_status)
            .await?;

        let sources_a = group_sharded(reconciler.clone(), &source_records, self.config.shards).await?;
        let sources_b = group_sharded(reconciler.clone(), &warehouse_records, self.config.shards).await?;
        let gap_report = reconciler.classify_groups(&sources_a, &sources_b, Some(&GapSort::sessions_desc()));
        info!(
            total_gaps = gap_report.summary.total_gaps,
            a_only = gap_report.summary.a_only,
            b_only = gap_report.summary.b_only,
            near_matches = gap_report.near_matches.len(),
            "gap report computed"
        );

        catalogue.persist().await?;
        let records = catalogue.snapshot().await;
        let finished_at = Utc::now();

        let run_dir = self.config.reports_dir.join(run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;
        let manifest_path = export_parquet_snapshots(&run_dir, &gap_report, &records, &decisions).await?;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            source_records: source_records.len(),
            warehouse_records: warehouse_records.len(),
            catalogue_records: records.len(),
            created_records,
            crawl_updates: crawl_records.len(),
            recatalogued,
            fetch,
            eligible,
            annotated,
            deactivation_candidates: deactivations.len(),
            deactivations_applied: deactivations
                .iter()
                .filter(|d| d.write == Some(StatusWrite::Applied))
                .count(),
            deactivations_rejected: deactivations
                .iter()
                .filter(|d| d.write == Some(StatusWrite::Rejected))
                .count(),
            dry_run: !self.config.apply_deactivations,
            gaps: gap_report.summary.clone(),
            near_matches: gap_report.near_matches.len(),
            reports_dir: run_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        };
        let actions = ActionsReport {
            run_id,
            dry_run: summary.dry_run,
            decisions,
            deactivations,
        };
        write_reports(&run_dir, &summary, &gap_report, &actions).await?;
        info!(reports = %run_dir.display(), "sync run complete");
        Ok(summary)
    }

    /// Load and snapshot every enabled stream of `source`, in registry order.
    async fn load_source(
        &self,
        registry: &StreamRegistry,
        source: SourceId,
        options: &StreamOptions,
        started_at: DateTime<Utc>,
    ) -> Result<Vec<RawUrlRecord>> {
        let specs = registry.enabled(source).collect::<Vec<_>>();
        if specs.is_empty() {
            return Err(RunError::MissingStream {
                stream: source,
                detail: format!("no enabled stream in {STREAMS_FILE}"),
            }
            .into());
        }
        self.load_streams(&specs, source, options, started_at).await
    }

    /// Load and snapshot `specs`, in order. An empty list loads nothing.
    async fn load_streams(
        &self,
        specs: &[&StreamSpec],
        source: SourceId,
        options: &StreamOptions,
        started_at: DateTime<Utc>,
    ) -> Result<Vec<RawUrlRecord>> {
        let mut records = Vec::new();
        for spec in specs.iter().copied() {
            let stream = open_stream(spec, &self.config.workspace_root, options)
                .with_context(|| format!("opening stream {}", spec.id))?;
            if !fs::try_exists(stream.path()).await.unwrap_or(false) {
                return Err(RunError::MissingStream {
                    stream: source,
                    detail: format!("{} does not exist", stream.path().display()),
                }
                .into());
            }
            let bytes = fs::read(stream.path())
                .await
                .with_context(|| format!("reading {}", stream.path().display()))?;
            let snapshot = self
                .artifact_store
                .snapshot_stream(started_at, &spec.id, spec.extension(), &bytes)
                .await?;
            let loaded = stream
                .load()
                .await
                .with_context(|| format!("loading stream {}", spec.id))?;
            info!(
                stream = %spec.id,
                records = loaded.len(),
                snapshot = %snapshot.relative_path.display(),
                deduplicated = snapshot.deduplicated,
                "stream loaded"
            );
            records.extend(loaded);
        }
        Ok(records)
    }

    /// One catalogue record per normalized key, fed from the group representative.
    async fn observe_source_of_record(
        &self,
        reconciler: &Reconciler,
        catalogue: &CatalogueStore,
        records: &[RawUrlRecord],
        seen_at: DateTime<Utc>,
    ) -> usize {
        let mut created = 0usize;
        for (key, group) in reconciler.group(records) {
            let representative = &group.representative;
            let business_status = representative
                .text_attr(ATTR_BUSINESS_STATUS)
                .and_then(|raw| match raw.parse::<PageStatus>() {
                    Ok(status) => Some(status),
                    Err(err) => {
                        warn!(url = %representative.raw_url, %err, "ignoring business status");
                        None
                    }
                });
            let text = |name: &str| representative.text_attr(name).map(str::to_string);
            let outcome = catalogue
                .observe_source_record(
                    SourceObservation {
                        page_id: page_id_for(&key),
                        url: representative.raw_url.clone(),
                        business_status,
                        external_id: text(ATTR_EXTERNAL_ID),
                        category: text(ATTR_CATEGORY),
                        vertical: text(ATTR_VERTICAL),
                    },
                    seen_at,
                )
                .await;
            if outcome.created {
                created += 1;
            }
            if group.is_duplicate() {
                debug!(key = %key, members = group.count, "duplicate source-of-record rows");
            }
        }
        created
    }

    async fn fetch_pending(
        &self,
        reconciler: &Arc<Reconciler>,
        catalogue: &Arc<CatalogueStore>,
    ) -> Result<FetchStats> {
        let pending = catalogue
            .snapshot()
            .await
            .into_iter()
            .filter(CatalogueRecord::needs_fetch)
            .collect::<Vec<_>>();
        let limit = Arc::new(Semaphore::new(self.config.fetch_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for record in pending {
            let permit = limit
                .clone()
                .acquire_owned()
                .await
                .context("fetch limiter closed")?;
            let fetcher = self.fetcher.clone();
            let reconciler = reconciler.clone();
            let catalogue = catalogue.clone();
            let span = info_span!("fetch", page_id = %record.page_id, url = %record.url);
            tasks.spawn(
                async move {
                    let _permit = permit;
                    let observed = fetcher.fetch(&record.url).await;
                    let resolved = reconciler.resolve_fetch(&observed);
                    if !resolved.flags.is_empty() {
                        warn!(kind = ?resolved.kind, flags = ?resolved.flags, "degraded fetch result");
                    }
                    catalogue
                        .apply_fetch(&record.page_id, &resolved, Utc::now())
                        .await
                        .map(|()| resolved)
                }
                .instrument(span),
            );
        }

        let mut stats = FetchStats::default();
        while let Some(joined) = tasks.join_next().await {
            let resolved = joined.context("joining fetch task")??;
            stats.record(&resolved);
        }
        Ok(stats)
    }

    async fn annotate_eligible(&self, catalogue: &CatalogueStore, decisions: &[Decision]) -> Result<usize> {
        let mut annotated = 0usize;
        let eligible = decisions
            .iter()
            .filter(|d| d.has(Action::EligibleForCataloguing))
            .take(self.config.max_annotations);
        for decision in eligible {
            let Some(record) = catalogue.get(&decision.page_id).await else {
                continue;
            };
            match self.annotator.annotate(&record).await {
                Ok(annotation) => {
                    catalogue.mark_catalogued(&decision.page_id, annotation).await?;
                    annotated += 1;
                }
                Err(err) => warn!(page_id = %decision.page_id, %err, "annotation failed; page stays eligible"),
            }
        }
        Ok(annotated)
    }

    async fn deactivate_zero_sessions(
        &self,
        catalogue: &CatalogueStore,
        decisions: &[Decision],
        target: PageStatus,
    ) -> Result<Vec<DeactivationOutcome>> {
        let mut outcomes = Vec::new();
        for decision in decisions.iter().filter(|d| d.has(Action::DeactivateZeroSessions)) {
            let write = if self.config.apply_deactivations {
                let write = catalogue
                    .apply_status(&decision.page_id, target, StatusWriter::ZeroSessionPolicy)
                    .await?;
                if write == StatusWrite::Rejected {
                    warn!(page_id = %decision.page_id, "deactivation rejected by policy override");
                }
                Some(write)
            } else {
                None
            };
            outcomes.push(DeactivationOutcome {
                page_id: decision.page_id.clone(),
                url: decision.url.clone(),
                target,
                write,
            });
        }
        Ok(outcomes)
    }
}

/// Reset catalogued pages the crawler saw change so this run fetches and annotates
/// them again. Updates for pages outside the catalogue are ignored.
async fn recatalogue_crawl_updates(
    reconciler: &Reconciler,
    catalogue: &CatalogueStore,
    updates: &[RawUrlRecord],
) -> Result<usize> {
    let keys = updates
        .iter()
        .map(|record| reconciler.normalize_key(&record.raw_url))
        .collect::<BTreeSet<_>>();
    let mut reset = 0usize;
    for key in keys {
        let page_id = page_id_for(&key);
        if catalogue.get(&page_id).await.is_none() {
            debug!(key = %key, "crawl update for a page outside the catalogue");
            continue;
        }
        if catalogue.mark_for_recatalogue(&page_id).await? {
            debug!(key = %key, %page_id, "page content changed; queued for recatalogue");
            reset += 1;
        }
    }
    if reset > 0 {
        info!(recatalogued = reset, "crawl updates applied");
    }
    Ok(reset)
}

/// Group `records` across blocking worker tasks and merge the shards.
pub async fn group_sharded(
    reconciler: Arc<Reconciler>,
    records: &[RawUrlRecord],
    shards: usize,
) -> Result<ShardGroups> {
    let chunk = records.len().div_ceil(shards.max(1)).max(1);
    let mut handles = Vec::new();
    for (index, slice) in records.chunks(chunk).enumerate() {
        let offset = index * chunk;
        let batch = slice
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, record)| (offset + i, record))
            .collect::<Vec<_>>();
        let reconciler = reconciler.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let excluded = reconciler.config().excluded_hosts.clone();
            reconciler.group_shard(batch, &excluded)
        }));
    }

    let mut parts = Vec::with_capacity(handles.len());
    for handle in handles {
        parts.push(handle.await.context("joining shard grouping task")?);
    }
    Ok(ShardGroups::merge_all(parts))
}

pub async fn load_stream_registry(workspace_root: &Path) -> Result<StreamRegistry> {
    let path = workspace_root.join(STREAMS_FILE);
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Missing `reconcile.yaml` means default rules.
pub async fn load_reconcile_rules(workspace_root: &Path) -> Result<ReconcileRules> {
    let path = workspace_root.join(RULES_FILE);
    if !fs::try_exists(&path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        info!(path = %path.display(), "no reconcile rules file; using defaults");
        return Ok(ReconcileRules::default());
    }
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let registry = load_stream_registry(&config.workspace_root).await?;
    let reconciler = load_reconcile_rules(&config.workspace_root).await?.reconciler()?;
    let resolve = |path: &PathBuf| {
        if path.is_absolute() {
            path.clone()
        } else {
            config.workspace_root.join(path)
        }
    };

    let fetcher: Arc<dyn FetchCollaborator> = match &registry.collaborators.fetch {
        Some(path) => Arc::new(FixtureFetcher::from_path(resolve(path), reconciler.clone()).await?),
        None => Arc::new(NoopFetcher),
    };
    let annotator: Arc<dyn PageAnnotator> = match &registry.collaborators.annotations {
        Some(path) => Arc::new(FixtureAnnotator::from_path(resolve(path), reconciler.clone()).await?),
        None => Arc::new(NoopAnnotator),
    };
    SyncPipeline::new(config)
        .with_collaborators(fetcher, annotator)
        .run_once()
        .await
}

/// Most recent runs first. Directories without a run summary are skipped.
pub fn load_runs(reports_dir: &Path, limit: usize) -> Result<Vec<SyncRunSummary>> {
    if !reports_dir.exists() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in std::fs::read_dir(reports_dir).with_context(|| format!("reading {}", reports_dir.display()))? {
        let entry = entry.with_context(|| format!("reading entry in {}", reports_dir.display()))?;
        let summary_path = entry.path().join(RUN_SUMMARY_FILE);
        if !summary_path.is_file() {
            continue;
        }
        runs.push(read_json::<SyncRunSummary>(&summary_path)?);
    }
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| a.run_id.cmp(&b.run_id)));
    runs.truncate(limit);
    Ok(runs)
}

pub fn load_gap_report(reports_dir: &Path, run_id: Uuid) -> Result<Option<GapReport>> {
    read_run_file(reports_dir, run_id, GAP_REPORT_FILE)
}

pub fn load_actions(reports_dir: &Path, run_id: Uuid) -> Result<Option<ActionsReport>> {
    read_run_file(reports_dir, run_id, ACTIONS_FILE)
}

fn read_run_file<T: for<'de> Deserialize<'de>>(reports_dir: &Path, run_id: Uuid, name: &str) -> Result<Option<T>> {
    let path = reports_dir.join(run_id.to_string()).join(name);
    if !path.is_file() {
        return Ok(None);
    }
    read_json(&path).map(Some)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn report_daily_markdown(runs: usize, reports_dir: &Path) -> Result<String> {
    let mut lines = vec!["# Landing Page Catalogue Report".to_string(), String::new()];
    let runs = load_runs(reports_dir, runs.max(1))?;
    if runs.is_empty() {
        lines.push(format!("No runs found under `{}`.", reports_dir.display()));
    }
    for run in runs {
        lines.push(format!("## Run `{}` ({})", run.run_id, run.started_at.format("%Y-%m-%d %H:%M UTC")));
        lines.push(format!(
            "- catalogue: {} records ({} new, {} recatalogued), {} eligible, {} annotated",
            run.catalogue_records, run.created_records, run.recatalogued, run.eligible, run.annotated
        ));
        lines.push(format!(
            "- gaps: {} total ({} source of record only, {} warehouse only, {} matched)",
            run.gaps.total_gaps, run.gaps.a_only, run.gaps.b_only, run.gaps.matched
        ));
        lines.push(format!(
            "- zero-session deactivations: {} candidates, {} applied{}",
            run.deactivation_candidates,
            run.deactivations_applied,
            if run.dry_run { " (dry run)" } else { "" }
        ));
        lines.push(format!("- reports: `{}`", run.reports_dir));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

fn render_daily_brief(summary: &SyncRunSummary, gaps: &GapReport, actions: &ActionsReport) -> String {
    let mut out = format!(
        "# Landing Page Catalogue Daily Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Source-of-record rows: {}\n- Warehouse rows: {}\n- Catalogue records: {} ({} new)\n- Crawl updates: {} ({} pages recatalogued)\n\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.source_records,
        summary.warehouse_records,
        summary.catalogue_records,
        summary.created_records,
        summary.crawl_updates,
        summary.recatalogued,
    );

    out.push_str(&format!(
        "## Fetch\n- fetched: {}\n- failed: {}\n- redirects: {}\n- declared canonicals: {}\n- ambiguous: {}\n\n",
        summary.fetch.fetched,
        summary.fetch.failed,
        summary.fetch.redirects,
        summary.fetch.declared_canonicals,
        summary.fetch.ambiguous,
    ));

    let mut action_counts: BTreeMap<String, usize> = BTreeMap::new();
    for decision in &actions.decisions {
        for action in &decision.actions {
            *action_counts.entry(format!("{action:?}")).or_default() += 1;
        }
    }
    out.push_str("## Actions\n");
    for (action, count) in &action_counts {
        out.push_str(&format!("- {action}: {count}\n"));
    }
    out.push_str(&format!(
        "- annotated this run: {}\n- deactivations: {} candidates, {} applied, {} rejected{}\n\n",
        summary.annotated,
        summary.deactivation_candidates,
        summary.deactivations_applied,
        summary.deactivations_rejected,
        if summary.dry_run { " (dry run)" } else { "" },
    ));

    out.push_str(&format!(
        "## Data Gaps\n- total: {}\n- source of record only: {}\n- warehouse only: {}\n- matched: {}\n- excluded rows: {}\n- malformed rows: {}\n\n",
        gaps.summary.total_gaps,
        gaps.summary.a_only,
        gaps.summary.b_only,
        gaps.summary.matched,
        gaps.summary.excluded_records,
        gaps.summary.malformed_records,
    ));

    out.push_str("### Top warehouse-only pages\n");
    for gap in gaps.b_not_a.iter().take(10) {
        let sessions = gap
            .attributes
            .get(ATTR_SESSION_COUNT)
            .map(ToString::to_string)
            .unwrap_or_else(|| "?".to_string());
        out.push_str(&format!("- {} ({} sessions)\n", gap.url, sessions));
    }

    if !gaps.near_matches.is_empty() {
        out.push_str("\n### Possible spelling mismatches\n");
        for near in &gaps.near_matches {
            out.push_str(&format!("- `{}` ~ `{}` ({:.3})\n", near.a_key, near.b_key, near.score));
        }
    }
    out
}

async fn write_reports(
    run_dir: &Path,
    summary: &SyncRunSummary,
    gaps: &GapReport,
    actions: &ActionsReport,
) -> Result<()> {
    let brief = render_daily_brief(summary, gaps, actions);
    fs::write(run_dir.join(DAILY_BRIEF_FILE), brief)
        .await
        .context("writing daily_brief.md")?;

    let gap_json = serde_json::to_vec_pretty(gaps).context("serializing gap report")?;
    fs::write(run_dir.join(GAP_REPORT_FILE), gap_json)
        .await
        .context("writing gap_report.json")?;

    let actions_json = serde_json::to_vec_pretty(actions).context("serializing actions")?;
    fs::write(run_dir.join(ACTIONS_FILE), actions_json)
        .await
        .context("writing actions.json")?;

    // Written last: its presence marks the run directory as complete.
    let summary_json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join(RUN_SUMMARY_FILE), summary_json)
        .await
        .context("writing run.json")?;
    Ok(())
}

async fn export_parquet_snapshots(
    run_dir: &Path,
    gaps: &GapReport,
    records: &[CatalogueRecord],
    decisions: &[Decision],
) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let gaps_path = snapshot_dir.join("gaps.parquet");
    let catalogue_path = snapshot_dir.join("catalogue.parquet");
    let actions_path = snapshot_dir.join("actions.parquet");

    write_gaps_parquet(&gaps_path, gaps)?;
    write_catalogue_parquet(&catalogue_path, records)?;
    write_actions_parquet(&actions_path, decisions)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("gaps", run_dir, &gaps_path)?,
            manifest_entry("catalogue", run_dir, &catalogue_path)?,
            manifest_entry("actions", run_dir, &actions_path)?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn joined_debug<T: std::fmt::Debug>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| format!("{item:?}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn write_gaps_parquet(path: &Path, gaps: &GapReport) -> Result<()> {
    let rows = gaps
        .a_not_b
        .iter()
        .map(|gap| ("source_of_record_only", gap))
        .chain(gaps.b_not_a.iter().map(|gap| ("warehouse_only", gap)))
        .collect::<Vec<(&str, &GapRecord)>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("side", DataType::Utf8, false),
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("normalized_key", DataType::Utf8, false),
        ArrowField::new("duplicate_count", DataType::UInt32, false),
        ArrowField::new("duplicate_ids", DataType::Utf8, false),
        ArrowField::new("session_count", DataType::Int64, true),
        ArrowField::new("flags", DataType::Utf8, false),
    ]));

    let sides = StringArray::from(rows.iter().map(|(side, _)| Some(*side)).collect::<Vec<_>>());
    let urls = StringArray::from(rows.iter().map(|(_, g)| Some(g.url.as_str())).collect::<Vec<_>>());
    let keys = StringArray::from(
        rows.iter()
            .map(|(_, g)| Some(g.normalized_key.as_str()))
            .collect::<Vec<_>>(),
    );
    let counts = UInt32Array::from(
        rows.iter()
            .map(|(_, g)| u32::try_from(g.duplicate_count).unwrap_or(u32::MAX))
            .collect::<Vec<_>>(),
    );
    let ids = StringArray::from(
        rows.iter()
            .map(|(_, g)| Some(g.duplicate_ids.join(";")))
            .collect::<Vec<_>>(),
    );
    let sessions = Int64Array::from(
        rows.iter()
            .map(|(_, g)| g.attributes.get(ATTR_SESSION_COUNT).and_then(|v| v.as_i64()))
            .collect::<Vec<_>>(),
    );
    let flags = StringArray::from(
        rows.iter()
            .map(|(_, g)| Some(joined_debug(&g.flags)))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(sides),
            Arc::new(urls),
            Arc::new(keys),
            Arc::new(counts),
            Arc::new(ids),
            Arc::new(sessions),
            Arc::new(flags),
        ],
    )
    .context("building gaps record batch")?;
    write_parquet(path, batch)
}

fn write_catalogue_parquet(path: &Path, records: &[CatalogueRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("page_id", DataType::Utf8, false),
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("canonical_url", DataType::Utf8, false),
        ArrowField::new("status_code", DataType::UInt32, false),
        ArrowField::new("page_status", DataType::Utf8, true),
        ArrowField::new("catalogued", DataType::Boolean, false),
        ArrowField::new("redirect_detected_reliably", DataType::Boolean, false),
        ArrowField::new("policy_override", DataType::Boolean, false),
        ArrowField::new("category", DataType::Utf8, true),
        ArrowField::new("vertical", DataType::Utf8, true),
    ]));

    let page_ids = StringArray::from(records.iter().map(|r| Some(r.page_id.as_str())).collect::<Vec<_>>());
    let urls = StringArray::from(records.iter().map(|r| Some(r.url.as_str())).collect::<Vec<_>>());
    let canonical = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.canonical_url.as_str()))
            .collect::<Vec<_>>(),
    );
    let status_codes = UInt32Array::from(records.iter().map(|r| u32::from(r.status_code)).collect::<Vec<_>>());
    let page_status = StringArray::from(
        records
            .iter()
            .map(|r| r.page_status.map(|s| s.as_str()))
            .collect::<Vec<_>>(),
    );
    let catalogued = BooleanArray::from(records.iter().map(|r| r.catalogued).collect::<Vec<_>>());
    let reliable = BooleanArray::from(
        records
            .iter()
            .map(|r| r.redirect_detected_reliably)
            .collect::<Vec<_>>(),
    );
    let overrides = BooleanArray::from(records.iter().map(|r| r.policy_override).collect::<Vec<_>>());
    let categories = StringArray::from(records.iter().map(|r| r.category.as_deref()).collect::<Vec<_>>());
    let verticals = StringArray::from(records.iter().map(|r| r.vertical.as_deref()).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(page_ids),
            Arc::new(urls),
            Arc::new(canonical),
            Arc::new(status_codes),
            Arc::new(page_status),
            Arc::new(catalogued),
            Arc::new(reliable),
            Arc::new(overrides),
            Arc::new(categories),
            Arc::new(verticals),
        ],
    )
    .context("building catalogue record batch")?;
    write_parquet(path, batch)
}

fn write_actions_parquet(path: &Path, decisions: &[Decision]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("page_id", DataType::Utf8, false),
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("actions", DataType::Utf8, false),
        ArrowField::new("flags", DataType::Utf8, false),
    ]));

    let page_ids = StringArray::from(decisions.iter().map(|d| Some(d.page_id.as_str())).collect::<Vec<_>>());
    let urls = StringArray::from(decisions.iter().map(|d| Some(d.url.as_str())).collect::<Vec<_>>());
    let actions = StringArray::from(
        decisions
            .iter()
            .map(|d| Some(joined_debug(&d.actions)))
            .collect::<Vec<_>>(),
    );
    let flags = StringArray::from(
        decisions
            .iter()
            .map(|d| Some(joined_debug(&d.flags)))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![Arc::new(page_ids), Arc::new(urls), Arc::new(actions), Arc::new(flags)],
    )
    .context("building actions record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lpcat_adapters::AdapterError;
    use lpcat_reconcile::normalize;
    use tempfile::{tempdir, TempDir};

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(rel: &str) -> String {
        workspace_root().join("fixtures").join(rel).display().to_string()
    }

    const RULES: &str = r#"
reconcile:
  host_aliases:
    forbes.com: www.forbes.com
    carshieldplans.com: www.carshieldplans.com
  excluded_hosts:
    - carshieldplans.com
    - gorenewalbyandersen.com
warehouse_paths:
  default_host: www.forbes.com
  property_hosts:
    expertise: www.expertise.com
category_verticals:
  Car Insurance: Insurance
"#;

    fn write_workspace(warehouse_path: &str) -> TempDir {
        write_workspace_with_crawl(warehouse_path, None)
    }

    fn write_workspace_with_crawl(warehouse_path: &str, crawl_path: Option<&str>) -> TempDir {
        let dir = tempdir().expect("tempdir");
        let mut streams = format!(
            "streams:\n  - id: source_of_record\n    source: source_of_record\n    format: json\n    path: {}\n  - id: warehouse\n    source: warehouse\n    format: json\n    path: {}\n",
            fixture("source_of_record/sample.json"),
            warehouse_path,
        );
        if let Some(path) = crawl_path {
            streams.push_str(&format!(
                "  - id: crawl_updates\n    source: crawl\n    format: json\n    path: {path}\n"
            ));
        }
        std::fs::write(dir.path().join(STREAMS_FILE), streams).expect("write streams");
        std::fs::write(dir.path().join(RULES_FILE), RULES).expect("write rules");
        dir
    }

    async fn fixture_pipeline(root: &Path, apply_deactivations: bool) -> SyncPipeline {
        let mut config = SyncConfig::for_workspace(root);
        config.apply_deactivations = apply_deactivations;
        config.shards = 3;
        let rules: ReconcileRules = serde_yaml::from_str(RULES).expect("rules");
        let reconciler = rules.reconciler().expect("valid rules");
        let fetcher = FixtureFetcher::from_path(fixture("fetch/sample.json"), reconciler.clone())
            .await
            .expect("fetch fixture");
        let annotator = FixtureAnnotator::from_path(fixture("annotations/sample.json"), reconciler)
            .await
            .expect("annotation fixture");
        SyncPipeline::new(config).with_collaborators(Arc::new(fetcher), Arc::new(annotator))
    }

    #[tokio::test]
    async fn fixture_run_produces_catalogue_actions_and_gaps() {
        let workspace = write_workspace(&fixture("warehouse/sample.json"));
        let pipeline = fixture_pipeline(workspace.path(), true).await;
        let summary = pipeline.run_once().await.expect("run");

        assert_eq!(summary.source_records, 9);
        assert_eq!(summary.warehouse_records, 8);
        assert_eq!(summary.catalogue_records, 8);
        assert_eq!(summary.created_records, 8);
        assert_eq!(
            summary.fetch,
            FetchStats {
                fetched: 8,
                failed: 2,
                redirects: 1,
                declared_canonicals: 1,
                ambiguous: 1,
            }
        );
        assert_eq!(summary.eligible, 7);
        assert_eq!(summary.annotated, 7);
        assert_eq!(summary.crawl_updates, 0);
        assert_eq!(summary.recatalogued, 0);
        // refinance has an explicit zero row; the travel-cards and home-warranty pages
        // never appear in the warehouse.
        assert_eq!(summary.deactivation_candidates, 3);
        assert_eq!(summary.deactivations_applied, 3);

        assert_eq!(summary.gaps.a_only, 3);
        assert_eq!(summary.gaps.b_only, 2);
        assert_eq!(summary.gaps.matched, 4);
        assert_eq!(summary.gaps.total_gaps, 5);
        assert_eq!(summary.gaps.excluded_records, 2);
        assert_eq!(summary.gaps.a_duplicate_groups, 1);

        let run_dir = PathBuf::from(&summary.reports_dir);
        for name in [DAILY_BRIEF_FILE, GAP_REPORT_FILE, ACTIONS_FILE, RUN_SUMMARY_FILE] {
            assert!(run_dir.join(name).exists(), "{name} missing");
        }
        for name in ["gaps", "catalogue", "actions"] {
            assert!(run_dir.join("snapshots").join(format!("{name}.parquet")).exists());
        }
        assert!(PathBuf::from(&summary.parquet_manifest).exists());

        let reports_dir = workspace.path().join("reports");
        let gaps = load_gap_report(&reports_dir, summary.run_id)
            .expect("load gaps")
            .expect("gap report present");
        let warehouse_only = gaps.b_not_a.iter().map(|g| g.url.as_str()).collect::<Vec<_>>();
        assert_eq!(
            warehouse_only,
            vec![
                "https://www.forbes.com/advisor/business/best-payroll-software",
                "https://www.forbes.com/advisor/credit-cards/best-travel-card",
            ]
        );
        assert!(gaps.near_matches.iter().any(|m| {
            m.a_key == normalize("https://www.forbes.com/advisor/credit-cards/best-travel-cards")
                && m.b_key == normalize("https://www.forbes.com/advisor/credit-cards/best-travel-card")
        }));

        let catalogue = CatalogueStore::load(workspace.path().join("catalogue.json"))
            .await
            .expect("catalogue");
        let refinance = catalogue
            .get(&page_id_for(&normalize("https://www.forbes.com/advisor/mortgages/refinance-rates")))
            .await
            .expect("refinance record");
        assert_eq!(refinance.page_status, Some(PageStatus::Inactive));
        assert_eq!(refinance.page_status_writer, Some(StatusWriter::ZeroSessionPolicy));

        let redirect = catalogue
            .get(&page_id_for(&normalize("https://www.forbes.com/advisor/banking/old-savings-page")))
            .await
            .expect("redirect record");
        assert_eq!(redirect.status_code, 301);
        assert!(!redirect.catalogued);

        let loans = catalogue
            .get(&page_id_for(&normalize("https://www.forbes.com/advisor/personal-loans/best-personal-loans")))
            .await
            .expect("loans record");
        assert_eq!(loans.external_id.as_deref(), Some("rec001"));
        assert_eq!(
            loans.url,
            "https://www.forbes.com/advisor/personal-loans/best-personal-loans/"
        );
        assert!(loans.annotation.is_some_and(|a| a.brand_list.is_populated()));
    }

    #[tokio::test]
    async fn second_run_only_refetches_incomplete_records() {
        let workspace = write_workspace(&fixture("warehouse/sample.json"));
        let pipeline = fixture_pipeline(workspace.path(), false).await;
        let first = pipeline.run_once().await.expect("first run");
        let second = pipeline.run_once().await.expect("second run");

        assert!(first.dry_run);
        assert_eq!(first.deactivations_applied, 0);
        assert_eq!(second.created_records, 0);
        assert_eq!(second.fetch.fetched, 3);
        assert_eq!(second.eligible, 0);
        assert_eq!(second.annotated, 0);

        let runs = load_runs(&workspace.path().join("reports"), 10).expect("runs");
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, second.run_id);

        let markdown = report_daily_markdown(1, &workspace.path().join("reports")).expect("markdown");
        assert!(markdown.contains(&second.run_id.to_string()));
        assert!(!markdown.contains(&first.run_id.to_string()));
        assert!(markdown.contains("(dry run)"));
    }

    #[tokio::test]
    async fn crawl_updates_send_catalogued_pages_back_for_recataloguing() {
        let workspace =
            write_workspace_with_crawl(&fixture("warehouse/sample.json"), Some(&fixture("crawl/sample.json")));
        let pipeline = fixture_pipeline(workspace.path(), false).await;
        let first = pipeline.run_once().await.expect("first run");
        let second = pipeline.run_once().await.expect("second run");

        assert_eq!(first.crawl_updates, 3);
        assert_eq!(first.recatalogued, 0, "new pages are already pending");
        assert_eq!(first.catalogue_records, 8);

        assert_eq!(second.recatalogued, 2);
        assert_eq!(second.catalogue_records, 8, "unknown crawl page is not created");
        assert_eq!(second.fetch.fetched, 5);
        assert_eq!(second.eligible, 2);
        assert_eq!(second.annotated, 2);

        let catalogue = CatalogueStore::load(workspace.path().join("catalogue.json"))
            .await
            .expect("catalogue");
        let car = catalogue
            .get(&page_id_for(&normalize("https://www.forbes.com/advisor/car-insurance/cheapest-car-insurance")))
            .await
            .expect("car insurance record");
        assert_eq!(car.status_code, 200);
        assert!(car.catalogued);
        assert_eq!(car.page_status, Some(PageStatus::Active));
    }

    #[tokio::test]
    async fn crawl_csv_stream_fails_the_run() {
        let workspace = write_workspace(&fixture("warehouse/sample.json"));
        let mut streams = std::fs::read_to_string(workspace.path().join(STREAMS_FILE)).expect("read streams");
        streams.push_str("  - id: crawl_updates\n    source: crawl\n    format: csv\n    path: crawl.csv\n");
        std::fs::write(workspace.path().join(STREAMS_FILE), streams).expect("write streams");
        let pipeline = fixture_pipeline(workspace.path(), false).await;
        let err = pipeline.run_once().await.unwrap_err();
        assert!(err.chain().any(|cause| matches!(
            cause.downcast_ref::<AdapterError>(),
            Some(AdapterError::UnsupportedFormat { kind: SourceId::Crawl, .. })
        )));
    }

    #[tokio::test]
    async fn missing_warehouse_stream_fails_the_run() {
        let workspace = write_workspace("/definitely/not/here.json");
        let pipeline = fixture_pipeline(workspace.path(), false).await;
        let err = pipeline.run_once().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RunError>(),
            Some(RunError::MissingStream { stream: SourceId::Warehouse, .. })
        ));
    }

    #[tokio::test]
    async fn empty_warehouse_stream_fails_the_run() {
        let scratch = tempdir().expect("tempdir");
        let empty = scratch.path().join("warehouse.json");
        std::fs::write(
            &empty,
            r#"{"stream_id":"warehouse","queried_at":"2026-03-02T05:45:00Z","rows":[]}"#,
        )
        .expect("write empty warehouse");
        let workspace = write_workspace(&empty.display().to_string());
        let pipeline = fixture_pipeline(workspace.path(), true).await;
        let err = pipeline.run_once().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<RunError>(), Some(RunError::EmptyWarehouse(_))));
        assert!(!workspace.path().join("catalogue.json").exists());
    }

    #[tokio::test]
    async fn alias_cycle_is_rejected_before_loading_streams() {
        let workspace = write_workspace(&fixture("warehouse/sample.json"));
        std::fs::write(
            workspace.path().join(RULES_FILE),
            "reconcile:\n  host_aliases:\n    a.com: b.com\n    b.com: a.com\n",
        )
        .expect("write rules");
        let pipeline = fixture_pipeline(workspace.path(), false).await;
        let err = pipeline.run_once().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<RunError>(), Some(RunError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn sharded_grouping_matches_single_pass() {
        let reconciler = Arc::new(Reconciler::default());
        let records = (0..23)
            .map(|i| RawUrlRecord::new(SourceId::Warehouse, format!("https://x.com/p{}/", i % 7)))
            .collect::<Vec<_>>();
        let single = reconciler.group_shard(records.iter().cloned().enumerate(), &Default::default());
        for shards in [1, 2, 5, 40] {
            let sharded = group_sharded(reconciler.clone(), &records, shards).await.expect("sharded");
            assert_eq!(sharded, single, "shards={shards}");
        }
    }

    #[test]
    fn rules_fill_omitted_fields_with_defaults() {
        let rules: ReconcileRules = serde_yaml::from_str("reconcile:\n  near_match_threshold: 0.8\n").unwrap();
        assert!(rules.reconcile.treat_missing_as_zero);
        assert_eq!(rules.reconcile.near_match_threshold, 0.8);
        assert!(rules.reconcile.tracking_params.contains("gclid"));
        assert_eq!(rules.reconcile.deactivated_status, PageStatus::Inactive);
        assert_eq!(rules.warehouse_paths.default_host, "www.forbes.com");
    }
}
