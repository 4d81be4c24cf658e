//! Run progress tracking
//!
//! The orchestrator reports phase changes and per-source fetch results here.
//! `ProgressTracker::snapshot` is read-only and may be called from any task
//! while a run is in flight.


use crate::client::RateLimiterStats;
use crate::data::ValidationIssues;
use crate::storage::CacheStats;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use tracing::info;
use uuid::Uuid;

/// Orchestration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    FetchPrimary,
    FetchSecondary,
    Merge,
    Validate,
    Finalize,
    Done,
    PartialFailure,
    Cancelled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::FetchPrimary => "fetch_primary",
            Phase::FetchSecondary => "fetch_secondary",
            Phase::Merge => "merge",
            Phase::Validate => "validate",
            Phase::Finalize => "finalize",
            Phase::Done => "done",
            Phase::PartialFailure => "partial_failure",
            Phase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::PartialFailure | Phase::Cancelled)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    /// `None` while the phase is still running
    pub duration_secs: Option<f64>,
}

/// Fetch progress of one source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceProgress {
    pub tasks_total: usize,
    pub tasks_done: usize,
    pub tasks_failed: usize,
    pub cache_hits: usize,
    pub rows: usize,
}

impl SourceProgress {
    pub fn is_complete(&self) -> bool {
        self.tasks_done + self.tasks_failed >= self.tasks_total
    }
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressStatus {
    pub run_id: Option<Uuid>,
    pub phase: Phase,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_secs: f64,
    pub phase_timings: Vec<PhaseTiming>,
    pub sources: BTreeMap<String, SourceProgress>,
    pub dropped_rows: usize,
    pub errors: Vec<String>,
    pub validation_issues: BTreeMap<String, ValidationIssues>,
    pub cache: Option<CacheStats>,
    pub rate_limiter: Option<RateLimiterStats>,
}

#[derive(Debug)]
struct RunState {
    run_id: Option<Uuid>,
    phase: Phase,
    started_at: Option<DateTime<Utc>>,
    phase_timings: Vec<PhaseTiming>,
    sources: BTreeMap<String, SourceProgress>,
    dropped_rows: usize,
    errors: VecDeque<String>,
    validation_issues: BTreeMap<String, ValidationIssues>,
}

impl RunState {
    fn new() -> Self {
        Self {
            run_id: None,
            phase: Phase::Init,
            started_at: None,
            phase_timings: Vec::new(),
            sources: BTreeMap::new(),
            dropped_rows: 0,
            errors: VecDeque::new(),
            validation_issues: BTreeMap::new(),
        }
    }

    fn close_current_phase(&mut self, now: DateTime<Utc>) {
        if let Some(last) = self.phase_timings.last_mut() {
            if last.duration_secs.is_none() {
                last.duration_secs = Some(seconds_between(last.started_at, now));
            }
        }
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds().max(0) as f64 / 1000.0
}

/// Shared progress state for one orchestrator.
pub struct ProgressTracker {
    state: RwLock<RunState>,
    max_errors: usize,
}

impl ProgressTracker {
    /// Keeps at most `max_errors` error messages, dropping the oldest.
    pub fn new(max_errors: usize) -> Self {
        Self {
            state: RwLock::new(RunState::new()),
            max_errors,
        }
    }

    /// Reset all counters for a new run.
    pub fn start_run(&self, run_id: Uuid) {
        let mut state = self.state.write();
        *state = RunState::new();
        state.run_id = Some(run_id);
        state.started_at = Some(Utc::now());
    }

    pub fn enter_phase(&self, phase: Phase) {
        let now = Utc::now();
        let mut state = self.state.write();
        state.close_current_phase(now);
        state.phase = phase;
        if phase.is_terminal() {
            return;
        }
        state.phase_timings.push(PhaseTiming {
            phase,
            started_at: now,
            duration_secs: None,
        });
        info!("Phase: {}", phase);
    }

    pub fn phase(&self) -> Phase {
        self.state.read().phase
    }

    pub fn register_source(&self, source: &str, tasks: usize) {
        let mut state = self.state.write();
        let entry = state.sources.entry(source.to_string()).or_default();
        entry.tasks_total += tasks;
    }

    pub fn task_succeeded(&self, source: &str, rows: usize, from_cache: bool) {
        let mut state = self.state.write();
        let entry = state.sources.entry(source.to_string()).or_default();
        entry.tasks_done += 1;
        entry.rows += rows;
        if from_cache {
            entry.cache_hits += 1;
        }
    }

    pub fn task_failed(&self, source: &str, error: &str) {
        let mut state = self.state.write();
        state.sources.entry(source.to_string()).or_default().tasks_failed += 1;
        let message = format!("{}: {}", source, error);
        Self::push_error(&mut state, message, self.max_errors);
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let mut state = self.state.write();
        Self::push_error(&mut state, message.into(), self.max_errors);
    }

    fn push_error(state: &mut RunState, message: String, max: usize) {
        state.errors.push_back(message);
        while state.errors.len() > max {
            state.errors.pop_front();
        }
    }

    pub fn record_dropped(&self, rows: usize) {
        self.state.write().dropped_rows += rows;
    }

    pub fn record_validation(&self, label: &str, issues: ValidationIssues) {
        self.state
            .write()
            .validation_issues
            .insert(label.to_string(), issues);
    }

    pub fn validation_issues(&self) -> BTreeMap<String, ValidationIssues> {
        self.state.read().validation_issues.clone()
    }

    /// Snapshot without service stats; see `snapshot_with`.
    pub fn snapshot(&self) -> ProgressStatus {
        self.snapshot_with(None, None)
    }

    pub fn snapshot_with(
        &self,
        cache: Option<CacheStats>,
        rate_limiter: Option<RateLimiterStats>,
    ) -> ProgressStatus {
        let now = Utc::now();
        let state = self.state.read();

        let phase_timings = state
            .phase_timings
            .iter()
            .cloned()
            .map(|mut t| {
                if t.duration_secs.is_none() {
                    t.duration_secs = Some(seconds_between(t.started_at, now));
                }
                t
            })
            .collect();

        ProgressStatus {
            run_id: state.run_id,
            phase: state.phase,
            started_at: state.started_at,
            elapsed_secs: state
                .started_at
                .map(|start| seconds_between(start, now))
                .unwrap_or_default(),
            phase_timings,
            sources: state.sources.clone(),
            dropped_rows: state.dropped_rows,
            errors: state.errors.iter().cloned().collect(),
            validation_issues: state.validation_issues.clone(),
            cache,
            rate_limiter,
        }
    }
}

impl ProgressStatus {
    /// End-of-run summary in the log.
    pub fn log_performance_summary(&self) {
        info!("=== Performance summary ===");
        info!("Final phase: {}", self.phase);
        info!("Total processing time: {:.1}s", self.elapsed_secs);
        for timing in &self.phase_timings {
            info!(
                "  {}: {:.2}s",
                timing.phase,
                timing.duration_secs.unwrap_or_default()
            );
        }
        for (name, source) in &self.sources {
            info!(
                "  source {}: {}/{} tasks ok, {} failed, {} from cache, {} rows",
                name, source.tasks_done, source.tasks_total, source.tasks_failed, source.cache_hits, source.rows
            );
        }
        if let Some(cache) = &self.cache {
            info!(
                "Cache: {} hits, {} misses ({:.1}%), {} bytes",
                cache.hits, cache.misses, cache.hit_rate_percent, cache.size_bytes
            );
        }
        if let Some(limiter) = &self.rate_limiter {
            info!(
                "Requests: {} total, {} retries, {:.1}% success, {:.1}s total delay",
                limiter.total_requests, limiter.retries, limiter.success_rate_percent, limiter.total_delay_time
            );
        }
        if self.dropped_rows > 0 {
            info!("Dropped rows: {}", self.dropped_rows);
        }
    }
}
