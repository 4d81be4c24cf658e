//! Extraction orchestrator
//!
//! Runs one season extraction through
//! `Init -> FetchPrimary -> FetchSecondary -> Merge -> Validate -> Finalize`
//! and ends in `Done` or `PartialFailure`. Every fetch goes through the
//! cache first and the rate limiter on a miss. A source that fails degrades
//! the run instead of aborting it; only cancellation aborts.


pub use crate::monitor::Phase;

use crate::cancel::CancelToken;
use crate::client::{domain_of, HttpTransport, RateLimiter, RateLimiterConfig};
use crate::config::{Config, FetchScope, PipelineOptions, SourceConfig, SourceRole};
use crate::data::{
    apply_derived, coalesce, merge, normalize_row, validate_consistency, MergeColumn, MergeSpec, MergeStats,
    ValidationIssues, DEFAULT_JOIN_KEYS, TEAMS,
};
use crate::error::{PipelineError, Result};
use crate::ingester::{FetchContext, JsonEndpointSource, SourceFetcher, SourceParams};
use crate::monitor::{ProgressStatus, ProgressTracker};
use crate::storage::{CacheStore, CacheWarmer};
use crate::types::{
    CanonicalDataset, CanonicalRecord, DerivedStats, PartialRecord, Position, RawSourceRow, RecordKey,
};
use chrono::Utc;
use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_TRACKED_ERRORS: usize = 100;
/// Upper bound for `cleanup_cache`; anything larger means "everything".
const MAX_CLEANUP_HOURS: u64 = 24 * 365 * 100;

/// A configured source and the fetcher that serves it.
#[derive(Clone)]
pub struct SourceBinding {
    pub config: SourceConfig,
    pub fetcher: Arc<dyn SourceFetcher>,
}

/// Per-run options.
#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    pub season: i32,
    pub use_cache: bool,
    /// Seconds; a source's own `cache_ttl` takes precedence
    pub cache_ttl: u64,
    pub warm_cache: bool,
    pub max_workers: usize,
    /// Restrict per-team fetches to these codes; all 32 teams when `None`
    pub teams: Option<Vec<String>>,
    /// Keep only these weeks in the final dataset
    pub weeks: Option<Vec<i32>>,
    /// Base delay for every source domain during this run; the limiter's
    /// configured delay when `None`
    pub rate_limit_delay: Option<Duration>,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self::from(&PipelineOptions::default())
    }
}

impl From<&PipelineOptions> for ExtractionOptions {
    fn from(opts: &PipelineOptions) -> Self {
        Self {
            season: opts.season,
            use_cache: opts.use_cache,
            cache_ttl: opts.cache_ttl,
            warm_cache: opts.warm_cache,
            max_workers: opts.max_workers,
            teams: None,
            weeks: None,
            rate_limit_delay: None,
        }
    }
}

impl ExtractionOptions {
    pub fn teams(&self) -> Vec<String> {
        match &self.teams {
            Some(teams) => teams.clone(),
            None => TEAMS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every fetch task succeeded
    Done,
    /// At least one fetch task failed; the dataset holds what was reachable
    PartialFailure,
}

/// What one source contributed to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceReport {
    pub name: String,
    pub role: SourceRole,
    pub tasks: usize,
    pub failed_tasks: usize,
    pub cache_hits: usize,
    pub rows_fetched: usize,
    /// Rows without player or team after normalization
    pub dropped_rows: usize,
    /// Records handed to the merge
    pub records: usize,
    pub errors: Vec<String>,
}

impl SourceReport {
    pub fn succeeded(&self) -> bool {
        self.failed_tasks == 0
    }
}

/// Result of `orchestrate_full_season`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub dataset: CanonicalDataset,
    pub sources: Vec<SourceReport>,
    pub dropped_rows: usize,
    /// Rows folded into another row with the same key at finalize
    pub duplicates_coalesced: usize,
    pub merge_stats: BTreeMap<String, MergeStats>,
    pub validation: BTreeMap<String, ValidationIssues>,
}

/// Entries removed by `cleanup_cache`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupCounts {
    pub expired: usize,
    pub older_than: usize,
}

/// Rows of one source after fetch and normalization.
struct SourceBatch {
    records: Vec<PartialRecord>,
    report: SourceReport,
}

pub struct Orchestrator {
    limiter: Arc<RateLimiter>,
    cache: Option<Arc<CacheStore>>,
    primary: Option<SourceBinding>,
    secondaries: Vec<SourceBinding>,
    warmers: Mutex<Vec<CacheWarmer>>,
    progress: ProgressTracker,
}

impl Orchestrator {
    pub fn new(limiter: Arc<RateLimiter>, cache: Option<Arc<CacheStore>>) -> Self {
        if cache.is_some() {
            info!("Cache store enabled");
        }
        info!(
            "Rate limiting: {:.2}s delay between requests",
            limiter.config().default_delay.as_secs_f64()
        );
        Self {
            limiter,
            cache,
            primary: None,
            secondaries: Vec::new(),
            warmers: Mutex::new(Vec::new()),
            progress: ProgressTracker::new(MAX_TRACKED_ERRORS),
        }
    }

    /// Build the services and a `JsonEndpointSource` per configured source.
    pub fn from_config(config: &Config, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        let opts = &config.pipeline;
        opts.validate()?;

        let limiter = Arc::new(RateLimiter::new(transport, RateLimiterConfig::from(opts)));
        let cache = if opts.use_cache {
            let dir = shellexpand::tilde(&opts.cache_dir).into_owned();
            Some(Arc::new(CacheStore::open(dir, opts.cache_ttl)?))
        } else {
            None
        };

        let mut orchestrator = Self::new(limiter, cache);
        for source in &config.sources {
            let fetcher = Arc::new(JsonEndpointSource::from_config(source));
            orchestrator.add_source(source.clone(), fetcher)?;
        }
        Ok(orchestrator)
    }

    /// Register a source. Only one primary is allowed; secondaries merge in
    /// the order they were added.
    pub fn add_source(&mut self, config: SourceConfig, fetcher: Arc<dyn SourceFetcher>) -> Result<()> {
        let binding = SourceBinding { config, fetcher };
        match binding.config.role {
            SourceRole::Primary => {
                if let Some(existing) = &self.primary {
                    return Err(PipelineError::Config(format!(
                        "second primary source {} (already have {})",
                        binding.config.name, existing.config.name
                    )));
                }
                self.primary = Some(binding);
            }
            SourceRole::Secondary => self.secondaries.push(binding),
        }
        Ok(())
    }

    /// Extra warmer run when `warm_cache` is set.
    pub fn add_warmer(&self, warmer: CacheWarmer) {
        self.warmers.lock().push(warmer);
    }

    pub fn cache(&self) -> Option<&Arc<CacheStore>> {
        self.cache.as_ref()
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Run a full season extraction.
    ///
    /// Source failures are reported in the returned `RunReport`. The only
    /// errors are a missing primary source and cancellation; in both cases
    /// no dataset is produced.
    pub async fn orchestrate_full_season(
        &self,
        options: &ExtractionOptions,
        cancel: &CancelToken,
    ) -> Result<RunReport> {
        let primary = self
            .primary
            .as_ref()
            .ok_or_else(|| PipelineError::Config("no primary source configured".into()))?;

        let run_id = Uuid::new_v4();
        self.progress.start_run(run_id);
        info!("Full season {} data extraction (run {})", options.season, run_id);

        let result = self.run_phases(primary, options, cancel, run_id).await;
        match &result {
            Ok(report) => {
                let phase = match report.outcome {
                    RunOutcome::Done => Phase::Done,
                    RunOutcome::PartialFailure => Phase::PartialFailure,
                };
                self.progress.enter_phase(phase);
                info!(
                    "Data extraction finished ({:?}) - {} records extracted",
                    report.outcome,
                    report.dataset.len()
                );
            }
            Err(e) => {
                if e.is_cancelled() {
                    self.progress.enter_phase(Phase::Cancelled);
                }
                self.progress.record_error(e.to_string());
                warn!("Data extraction aborted: {}", e);
            }
        }
        self.progress_status().log_performance_summary();
        result
    }

    async fn run_phases(
        &self,
        primary: &SourceBinding,
        options: &ExtractionOptions,
        cancel: &CancelToken,
        run_id: Uuid,
    ) -> Result<RunReport> {
        let ctx = FetchContext {
            limiter: self.limiter.clone(),
            cancel: cancel.clone(),
        };

        if let Some(delay) = options.rate_limit_delay {
            self.apply_rate_limit_delay(primary, delay);
        }

        if options.warm_cache {
            self.warm_cache();
        }

        self.progress.enter_phase(Phase::FetchPrimary);
        let primary_batch = self.fetch_source(primary, options, &ctx, Phase::FetchPrimary).await?;

        cancel.check(Phase::FetchSecondary.as_str())?;
        self.progress.enter_phase(Phase::FetchSecondary);
        let secondary_batches: Vec<SourceBatch> = join_all(
            self.secondaries
                .iter()
                .map(|binding| self.fetch_source(binding, options, &ctx, Phase::FetchSecondary)),
        )
        .await
        .into_iter()
        .collect::<Result<_>>()?;

        cancel.check(Phase::Merge.as_str())?;
        self.progress.enter_phase(Phase::Merge);
        let mut merged = primary_batch.records;
        let mut merge_stats = BTreeMap::new();
        for (binding, batch) in self.secondaries.iter().zip(&secondary_batches) {
            let spec = merge_spec(&binding.config);
            let (next, stats) = merge(merged, &batch.records, &spec);
            merged = next;
            merge_stats.insert(binding.config.name.clone(), stats);
        }

        cancel.check(Phase::Validate.as_str())?;
        self.progress.enter_phase(Phase::Validate);
        let issues = validate_consistency(&merged);
        issues.log("merged data");
        self.progress.record_validation("merged", issues);

        cancel.check(Phase::Finalize.as_str())?;
        self.progress.enter_phase(Phase::Finalize);
        let (records, duplicates_coalesced) = finalize(merged, options.weeks.as_deref());
        let final_issues = validate_consistency(&records);
        final_issues.log("final dataset");
        self.progress.record_validation("final", final_issues);
        log_data_quality(&records);

        let mut sources = vec![primary_batch.report];
        sources.extend(secondary_batches.into_iter().map(|b| b.report));

        let outcome = if sources.iter().all(SourceReport::succeeded) {
            RunOutcome::Done
        } else {
            for failed in sources.iter().filter(|s| !s.succeeded()) {
                warn!(
                    "Source {} failed {}/{} tasks",
                    failed.name, failed.failed_tasks, failed.tasks
                );
            }
            RunOutcome::PartialFailure
        };

        let contributing_sources = sources
            .iter()
            .filter(|s| s.records > 0)
            .map(|s| s.name.clone())
            .collect();

        Ok(RunReport {
            run_id,
            outcome,
            dataset: CanonicalDataset {
                season: options.season,
                generated_at: Utc::now(),
                contributing_sources,
                records,
            },
            dropped_rows: sources.iter().map(|s| s.dropped_rows).sum(),
            sources,
            duplicates_coalesced,
            merge_stats,
            validation: self.progress.validation_issues(),
        })
    }

    fn apply_rate_limit_delay(&self, primary: &SourceBinding, delay: Duration) {
        let domains: BTreeSet<String> = std::iter::once(primary)
            .chain(self.secondaries.iter())
            .map(|binding| domain_of(&binding.config.url_template))
            .collect();
        for domain in &domains {
            self.limiter.set_domain_delay(domain, delay);
        }
    }

    fn warm_cache(&self) {
        let Some(cache) = self.cache.clone() else {
            debug!("Cache disabled, skipping warm-up");
            return;
        };
        info!("Warming cache with frequently accessed data...");

        let mut warmers = self.warmers.lock().clone();
        let store = cache.clone();
        warmers.insert(
            0,
            CacheWarmer::new("team_table", move || {
                store.set_json("reference", "teams", &TEAMS[..], &Default::default(), None)
            }),
        );

        let report = cache.warm_cache(warmers);
        info!(
            "Cache warming completed: {} succeeded, {} failed",
            report.succeeded.len(),
            report.failed.len()
        );
    }

    /// Fetch every task of one source, then normalize and validate its rows.
    async fn fetch_source(
        &self,
        binding: &SourceBinding,
        options: &ExtractionOptions,
        ctx: &FetchContext,
        phase: Phase,
    ) -> Result<SourceBatch> {
        let name = binding.config.name.as_str();
        let tasks: Vec<SourceParams> = match binding.config.scope {
            FetchScope::PerTeam => options
                .teams()
                .iter()
                .map(|team| SourceParams::for_team(name, options.season, team))
                .collect(),
            FetchScope::Season => vec![SourceParams::for_season(name, options.season)],
        };
        self.progress.register_source(name, tasks.len());
        info!("Extracting {} ({} tasks)", name, tasks.len());

        let mut results: Vec<(usize, Result<(Vec<RawSourceRow>, bool)>)> = stream::iter(tasks.into_iter().enumerate())
            .map(|(idx, params)| async move { (idx, self.fetch_task(binding, &params, options, ctx, phase).await) })
            .buffer_unordered(options.max_workers.max(1))
            .collect()
            .await;
        results.sort_by_key(|(idx, _)| *idx);

        let mut report = SourceReport {
            name: name.to_string(),
            role: binding.config.role,
            tasks: results.len(),
            failed_tasks: 0,
            cache_hits: 0,
            rows_fetched: 0,
            dropped_rows: 0,
            records: 0,
            errors: Vec::new(),
        };
        let mut raw = Vec::new();
        for (_, result) in results {
            match result {
                Ok((rows, from_cache)) => {
                    if from_cache {
                        report.cache_hits += 1;
                    }
                    raw.extend(rows);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    report.failed_tasks += 1;
                    let err = PipelineError::Source {
                        source_name: name.to_string(),
                        reason: e.to_string(),
                    };
                    report.errors.push(err.to_string());
                }
            }
        }
        report.rows_fetched = raw.len();

        let (records, dropped) = self.normalize_source(name, raw, options);
        report.dropped_rows = dropped;
        report.records = records.len();
        info!(
            "Extracted {} records from {} ({} cached, {} failed tasks)",
            report.records, name, report.cache_hits, report.failed_tasks
        );

        Ok(SourceBatch { records, report })
    }

    /// Cache lookup, then fetch through the rate limiter on a miss.
    /// Returns the rows and whether they came from the cache.
    async fn fetch_task(
        &self,
        binding: &SourceBinding,
        params: &SourceParams,
        options: &ExtractionOptions,
        ctx: &FetchContext,
        phase: Phase,
    ) -> Result<(Vec<RawSourceRow>, bool)> {
        ctx.cancel.check(phase.as_str())?;

        let name = binding.config.name.as_str();
        let ttl = binding.config.cache_ttl.unwrap_or(options.cache_ttl);
        let key = params.cache_key();
        let cache_params = params.cache_params();
        let cache = self.cache.as_ref().filter(|_| options.use_cache);

        if let Some(cache) = cache {
            if let Some(rows) = cache.get_json::<Vec<RawSourceRow>>(name, &key, &cache_params, Some(ttl)) {
                debug!("Retrieved {} rows for {}:{} from cache", rows.len(), name, key);
                self.progress.task_succeeded(name, rows.len(), true);
                return Ok((rows, true));
            }
        }

        match binding.fetcher.fetch_raw(params, ctx).await {
            Ok(rows) => {
                if let Some(cache) = cache {
                    if let Err(e) = cache.set_json(name, &key, &rows, &cache_params, Some(ttl)) {
                        warn!("Failed to cache {}:{}: {}", name, key, e);
                    }
                }
                self.progress.task_succeeded(name, rows.len(), false);
                Ok((rows, false))
            }
            Err(e) => {
                if !e.is_cancelled() {
                    warn!("Error processing {} for {}: {}", name, key, e);
                    self.progress.task_failed(name, &e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Normalize raw rows, drop those without player or team, apply the team
    /// filter and log per-source validation. Returns the records and the
    /// number of rows dropped.
    fn normalize_source(
        &self,
        name: &str,
        raw: Vec<RawSourceRow>,
        options: &ExtractionOptions,
    ) -> (Vec<PartialRecord>, usize) {
        let total = raw.len();
        let mut records: Vec<PartialRecord> = raw
            .iter()
            .map(|row| normalize_row(row, options.season))
            .filter(|r| !r.player.is_empty() && !r.team.is_empty())
            .collect();

        let dropped = total - records.len();
        if dropped > 0 {
            warn!("Dropped {} rows from {} without player or team", dropped, name);
            self.progress.record_dropped(dropped);
        }

        if let Some(teams) = &options.teams {
            let keep: HashSet<&str> = teams.iter().map(String::as_str).collect();
            records.retain(|r| keep.contains(r.team.as_str()));
        }

        let issues = validate_consistency(&records);
        issues.log(name);
        self.progress.record_validation(name, issues);
        (records, dropped)
    }

    /// Read-only snapshot; safe while a run is in flight.
    pub fn progress_status(&self) -> ProgressStatus {
        self.progress.snapshot_with(
            self.cache.as_ref().map(|c| c.stats()),
            Some(self.limiter.stats()),
        )
    }

    /// Validation issues of the current or last run, by label.
    pub fn validation_summary(&self) -> BTreeMap<String, ValidationIssues> {
        self.progress.validation_issues()
    }

    /// Remove expired entries and entries older than `older_than_hours`.
    pub fn cleanup_cache(&self, older_than_hours: u64) -> CleanupCounts {
        let Some(cache) = &self.cache else {
            return CleanupCounts::default();
        };
        let hours = i64::try_from(older_than_hours.min(MAX_CLEANUP_HOURS)).unwrap_or_default();
        let counts = CleanupCounts {
            expired: cache.cleanup_expired(),
            older_than: cache.cleanup_older_than(chrono::Duration::hours(hours)),
        };
        info!("Cleanup completed: {:?}", counts);
        counts
    }
}

fn merge_spec(config: &SourceConfig) -> MergeSpec {
    let columns = config
        .fields
        .iter()
        .filter_map(|field| {
            let column = MergeColumn::parse(field);
            if column.is_none() {
                warn!("Ignoring unknown merge column {} for {}", field, config.name);
            }
            column
        })
        .collect();

    MergeSpec {
        join_keys: config
            .join_keys
            .clone()
            .unwrap_or_else(|| DEFAULT_JOIN_KEYS.to_vec()),
        policy: config.merge_policy,
        columns,
    }
}

/// Coalesce duplicate keys, default absent values, compute derived figures,
/// apply the week filter and sort by (season, week, team, player).
fn finalize(records: Vec<PartialRecord>, weeks: Option<&[i32]>) -> (Vec<CanonicalRecord>, usize) {
    let total = records.len();
    let mut by_key: BTreeMap<RecordKey, PartialRecord> = BTreeMap::new();
    for record in records {
        by_key
            .entry(record.key())
            .and_modify(|existing| coalesce(existing, &record))
            .or_insert(record);
    }
    let duplicates = total - by_key.len();
    if duplicates > 0 {
        info!("Coalesced {} duplicate records", duplicates);
    }

    let (mut canonical, supplied): (Vec<CanonicalRecord>, Vec<DerivedStats<Option<f64>>>) = by_key
        .into_values()
        .map(|partial| {
            let record = CanonicalRecord {
                season: partial.season,
                week: partial.week,
                player: partial.player,
                position: partial.position.unwrap_or(Position::Other(String::new())),
                team: partial.team,
                opponent: partial.opponent.unwrap_or_default(),
                stats: partial.stats.map(Option::unwrap_or_default),
                derived: DerivedStats::default(),
            };
            (record, partial.derived)
        })
        .unzip();

    apply_derived(&mut canonical, &supplied);

    if let Some(weeks) = weeks {
        let keep: BTreeSet<i32> = weeks.iter().copied().collect();
        canonical.retain(|r| keep.contains(&r.week));
    }

    canonical.sort_by(|a, b| {
        (a.season, a.week, &a.team, &a.player).cmp(&(b.season, b.week, &b.team, &b.player))
    });
    (canonical, duplicates)
}

fn log_data_quality(records: &[CanonicalRecord]) {
    if records.is_empty() {
        warn!("No data for quality metrics");
        return;
    }

    let total = records.len();
    let players: BTreeSet<&str> = records.iter().map(|r| r.player.as_str()).collect();
    let teams: BTreeSet<&str> = records.iter().map(|r| r.team.as_str()).collect();
    let weeks: BTreeSet<i32> = records.iter().map(|r| r.week).collect();
    let with_snaps = records.iter().filter(|r| r.stats.snapcount > 0).count();

    info!("Data quality metrics:");
    info!("  Total records: {}", total);
    info!("  Unique players: {}", players.len());
    info!("  Unique teams: {}", teams.len());
    info!("  Weeks covered: {:?}", weeks);
    info!("  Snapcount coverage: {:.1}%", with_snaps as f64 / total as f64 * 100.0);

    let mut by_position: BTreeMap<&str, (BTreeSet<&str>, usize, usize)> = BTreeMap::new();
    for record in records {
        let entry = by_position.entry(record.position.as_str()).or_default();
        entry.0.insert(record.player.as_str());
        entry.1 += 1;
        if record.stats.snapcount > 0 {
            entry.2 += 1;
        }
    }
    for (position, (players, rows, snaps)) in by_position {
        info!(
            "    {}: {} players, {:.1}% snapcount coverage",
            if position.is_empty() { "?" } else { position },
            players.len(),
            snaps as f64 / rows as f64 * 100.0
        );
    }
}
