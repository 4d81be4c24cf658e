//! Record validation
//!
//! `validate_consistency` is a read-only scan. It never mutates or drops
//! records; the orchestrator logs the resulting `ValidationIssues` and keeps
//! going.

use super::normalizer::is_known_team;
use crate::types::{CanonicalRecord, PartialRecord, RecordKey, StatField, MAX_WEEK, MIN_WEEK};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{info, warn};

/// Stats that should never be negative. Yardage can legitimately dip below
/// zero for a single play but is still reported for review.
const NON_NEGATIVE: [StatField; 8] = [
    StatField::PassAtt,
    StatField::PassYards,
    StatField::RushAtt,
    StatField::RushYards,
    StatField::RecTargets,
    StatField::RecRecep,
    StatField::RecYards,
    StatField::Snapcount,
];

const DETAIL_LIMIT: usize = 5;

/// Structured issue report for one record set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssues {
    /// Unknown team or opponent codes
    pub invalid_teams: Vec<String>,
    /// Unknown position codes (blank shows as "")
    pub invalid_positions: Vec<String>,
    /// Row indices with an empty player
    pub missing_players: Vec<usize>,
    /// `"{column}: {n} records"`
    pub negative_stats: Vec<String>,
    /// Row indices sharing a (season, week, player, team) key
    pub duplicate_records: Vec<usize>,
    /// Row indices with a week outside 1..=18
    pub out_of_range_weeks: Vec<usize>,
}

impl ValidationIssues {
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn total(&self) -> usize {
        self.invalid_teams.len()
            + self.invalid_positions.len()
            + self.missing_players.len()
            + self.negative_stats.len()
            + self.duplicate_records.len()
            + self.out_of_range_weeks.len()
    }

    /// Per-category counts and, for short lists, the details.
    pub fn categories(&self) -> Vec<(&'static str, usize, String)> {
        fn entry<T: std::fmt::Debug>(name: &'static str, items: &[T]) -> (&'static str, usize, String) {
            (name, items.len(), format!("{:?}", items))
        }
        vec![
            entry("invalid_teams", &self.invalid_teams),
            entry("invalid_positions", &self.invalid_positions),
            entry("missing_players", &self.missing_players),
            entry("negative_stats", &self.negative_stats),
            entry("duplicate_records", &self.duplicate_records),
            entry("out_of_range_weeks", &self.out_of_range_weeks),
        ]
    }

    pub fn log(&self, source: &str) {
        if self.is_empty() {
            info!("No validation issues found in {}", source);
            return;
        }
        warn!("Validation issues found in {}:", source);
        for (name, count, details) in self.categories() {
            if count == 0 {
                continue;
            }
            warn!("  {}: {} issues", name, count);
            if count <= DETAIL_LIMIT {
                warn!("    Details: {}", details);
            }
        }
    }
}

/// Read access the validator needs from a record.
pub trait Validatable {
    fn record_key(&self) -> RecordKey;
    fn team(&self) -> &str;
    fn opponent(&self) -> Option<&str>;
    /// `None` when the source supplied no position.
    fn position_code(&self) -> Option<&str>;
    fn stat_value(&self, field: StatField) -> Option<i32>;
}

impl Validatable for PartialRecord {
    fn record_key(&self) -> RecordKey {
        self.key()
    }

    fn team(&self) -> &str {
        &self.team
    }

    fn opponent(&self) -> Option<&str> {
        self.opponent.as_deref()
    }

    fn position_code(&self) -> Option<&str> {
        self.position.as_ref().map(|p| p.as_str())
    }

    fn stat_value(&self, field: StatField) -> Option<i32> {
        self.stats.get(field).copied().flatten()
    }
}

impl Validatable for CanonicalRecord {
    fn record_key(&self) -> RecordKey {
        self.key()
    }

    fn team(&self) -> &str {
        &self.team
    }

    fn opponent(&self) -> Option<&str> {
        Some(self.opponent.as_str()).filter(|o| !o.is_empty())
    }

    fn position_code(&self) -> Option<&str> {
        Some(self.position.as_str())
    }

    fn stat_value(&self, field: StatField) -> Option<i32> {
        self.stats.get(field).copied()
    }
}

/// Scan `records` for consistency problems.
pub fn validate_consistency<R: Validatable>(records: &[R]) -> ValidationIssues {
    let mut issues = ValidationIssues::default();
    if records.is_empty() {
        return issues;
    }

    let mut invalid_teams = BTreeSet::new();
    let mut invalid_positions = BTreeSet::new();
    let mut negative_counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut rows_by_key: HashMap<RecordKey, Vec<usize>> = HashMap::new();

    for (idx, record) in records.iter().enumerate() {
        let key = record.record_key();

        if !is_known_team(record.team()) {
            invalid_teams.insert(record.team().to_string());
        }
        if let Some(opponent) = record.opponent() {
            if !is_known_team(opponent) {
                invalid_teams.insert(opponent.to_string());
            }
        }

        if let Some(code) = record.position_code() {
            if !matches!(code, "QB" | "RB" | "WR" | "TE" | "K" | "DEF") {
                invalid_positions.insert(code.to_string());
            }
        }

        if key.player.trim().is_empty() {
            issues.missing_players.push(idx);
        }

        if !(MIN_WEEK..=MAX_WEEK).contains(&key.week) {
            issues.out_of_range_weeks.push(idx);
        }

        for field in NON_NEGATIVE {
            if record.stat_value(field).is_some_and(|v| v < 0) {
                *negative_counts.entry(field.column()).or_default() += 1;
            }
        }

        rows_by_key.entry(key).or_default().push(idx);
    }

    issues.invalid_teams = invalid_teams.into_iter().collect();
    issues.invalid_positions = invalid_positions.into_iter().collect();
    issues.negative_stats = negative_counts
        .into_iter()
        .map(|(column, n)| format!("{}: {} records", column, n))
        .collect();
    issues.duplicate_records = rows_by_key
        .into_values()
        .filter(|rows| rows.len() > 1)
        .flatten()
        .collect();
    issues.duplicate_records.sort_unstable();

    issues
}
