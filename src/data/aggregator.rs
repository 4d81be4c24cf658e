//! Multi-source record merge
//!
//! Secondary sources are left-joined onto the primary rows. The primary
//! always wins: a secondary value is only copied into a primary field the
//! primary left empty (or, under `FillAbsentOrZero`, set to zero).
//! Secondary rows sharing a join key are coalesced first, so the outcome
//! does not depend on the order rows arrived in.

use crate::types::{PartialRecord, Position, StatField};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// A record field usable as a join key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinField {
    Season,
    Week,
    Player,
    Team,
    Position,
    Opponent,
}

pub const DEFAULT_JOIN_KEYS: [JoinField; 4] =
    [JoinField::Season, JoinField::Week, JoinField::Player, JoinField::Team];

/// When a secondary value may replace the primary's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Only fields the primary did not supply
    #[default]
    FillAbsent,
    /// Also primary zeros (placeholder columns)
    FillAbsentOrZero,
}

/// A column a secondary source can contribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeColumn {
    Stat(StatField),
    Position,
    Opponent,
}

impl MergeColumn {
    /// Case-insensitive; `None` for unknown names.
    pub fn parse(name: &str) -> Option<MergeColumn> {
        match name.trim().to_ascii_lowercase().as_str() {
            "position" => Some(MergeColumn::Position),
            "opponent" => Some(MergeColumn::Opponent),
            _ => StatField::from_column(name).map(MergeColumn::Stat),
        }
    }

    pub fn all() -> Vec<MergeColumn> {
        StatField::COUNTING
            .iter()
            .chain(StatField::DERIVED.iter())
            .map(|f| MergeColumn::Stat(*f))
            .chain([MergeColumn::Position, MergeColumn::Opponent])
            .collect()
    }
}

/// How one secondary joins onto the primary.
#[derive(Debug, Clone)]
pub struct MergeSpec {
    pub join_keys: Vec<JoinField>,
    pub policy: MergePolicy,
    /// Contributed columns; empty means all.
    pub columns: Vec<MergeColumn>,
}

impl Default for MergeSpec {
    fn default() -> Self {
        Self {
            join_keys: DEFAULT_JOIN_KEYS.to_vec(),
            policy: MergePolicy::default(),
            columns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeStats {
    pub primary_rows: usize,
    pub secondary_rows: usize,
    /// Primary rows that found a secondary partner
    pub matched: usize,
    /// Secondary keys that matched nothing
    pub unmatched_secondary: usize,
    /// Individual fields copied from the secondary
    pub filled_fields: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct JoinKey(Vec<String>);

fn join_key(record: &PartialRecord, fields: &[JoinField]) -> JoinKey {
    JoinKey(
        fields
            .iter()
            .map(|field| match field {
                JoinField::Season => record.season.to_string(),
                JoinField::Week => record.week.to_string(),
                JoinField::Player => record.player.clone(),
                JoinField::Team => record.team.clone(),
                JoinField::Position => record
                    .position
                    .as_ref()
                    .map(|p| p.as_str().to_string())
                    .unwrap_or_default(),
                JoinField::Opponent => record.opponent.clone().unwrap_or_default(),
            })
            .collect(),
    )
}

/// Left outer join of `secondary` onto `primary`.
///
/// Primary rows keep their order; unmatched ones pass through with the
/// secondary's columns still absent (finalize turns those into zero).
pub fn merge(
    mut primary: Vec<PartialRecord>,
    secondary: &[PartialRecord],
    spec: &MergeSpec,
) -> (Vec<PartialRecord>, MergeStats) {
    let mut stats = MergeStats {
        primary_rows: primary.len(),
        secondary_rows: secondary.len(),
        ..Default::default()
    };
    if secondary.is_empty() {
        return (primary, stats);
    }

    let join_keys: &[JoinField] = if spec.join_keys.is_empty() {
        &DEFAULT_JOIN_KEYS
    } else {
        &spec.join_keys
    };
    let columns = if spec.columns.is_empty() {
        MergeColumn::all()
    } else {
        spec.columns.clone()
    };

    let mut by_key: HashMap<JoinKey, PartialRecord> = HashMap::with_capacity(secondary.len());
    for row in secondary {
        by_key
            .entry(join_key(row, join_keys))
            .and_modify(|existing| coalesce(existing, row))
            .or_insert_with(|| row.clone());
    }

    let mut used: HashMap<JoinKey, bool> = by_key.keys().map(|k| (k.clone(), false)).collect();
    for record in primary.iter_mut() {
        let key = join_key(record, join_keys);
        if let Some(partner) = by_key.get(&key) {
            stats.matched += 1;
            stats.filled_fields += fill_from(record, partner, &columns, spec.policy);
            used.insert(key, true);
        }
    }
    stats.unmatched_secondary = used.values().filter(|hit| !**hit).count();

    info!(
        "Merged {} secondary rows onto {} primary rows: {} matched, {} fields filled, {} secondary keys unmatched",
        stats.secondary_rows, stats.primary_rows, stats.matched, stats.filled_fields, stats.unmatched_secondary
    );
    (primary, stats)
}

/// Copy `partner`'s columns into `record` where the policy allows.
/// Returns the number of fields written.
fn fill_from(
    record: &mut PartialRecord,
    partner: &PartialRecord,
    columns: &[MergeColumn],
    policy: MergePolicy,
) -> usize {
    let mut filled = 0;
    for column in columns {
        match column {
            MergeColumn::Stat(field) if field.is_derived() => {
                let incoming = partner.derived.get(*field).copied().flatten();
                if let (Some(slot), Some(value)) = (record.derived.get_mut(*field), incoming) {
                    if should_fill(slot.map(|v| v == 0.0), policy) {
                        *slot = Some(value);
                        filled += 1;
                    }
                }
            }
            MergeColumn::Stat(field) => {
                let incoming = partner.stats.get(*field).copied().flatten();
                if let (Some(slot), Some(value)) = (record.stats.get_mut(*field), incoming) {
                    if should_fill(slot.map(|v| v == 0), policy) {
                        *slot = Some(value);
                        filled += 1;
                    }
                }
            }
            MergeColumn::Position => {
                if record.position.is_none() && partner.position.is_some() {
                    record.position = partner.position.clone();
                    filled += 1;
                }
            }
            MergeColumn::Opponent => {
                if record.opponent.is_none() && partner.opponent.is_some() {
                    record.opponent = partner.opponent.clone();
                    filled += 1;
                }
            }
        }
    }
    if filled > 0 {
        debug!("Filled {} fields for {} week {}", filled, record.player, record.week);
    }
    filled
}

/// `current_is_zero` is `None` when the primary field is absent.
fn should_fill(current_is_zero: Option<bool>, policy: MergePolicy) -> bool {
    match (current_is_zero, policy) {
        (None, _) => true,
        (Some(true), MergePolicy::FillAbsentOrZero) => true,
        _ => false,
    }
}

/// Combine two rows describing the same key, field by field: absent values
/// are filled from the other side and, when both are present, the larger
/// value wins. Commutative and idempotent.
pub fn coalesce(into: &mut PartialRecord, other: &PartialRecord) {
    for field in StatField::COUNTING {
        if let (Some(slot), Some(incoming)) = (into.stats.get_mut(field), other.stats.get(field)) {
            *slot = max_option(*slot, *incoming);
        }
    }
    for field in StatField::DERIVED {
        if let (Some(slot), Some(incoming)) = (into.derived.get_mut(field), other.derived.get(field)) {
            *slot = match (*slot, *incoming) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }
    }
    into.position = min_position(into.position.take(), other.position.clone());
    into.opponent = match (into.opponent.take(), other.opponent.clone()) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
}

fn max_option(a: Option<i32>, b: Option<i32>) -> Option<i32> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn min_position(a: Option<Position>, b: Option<Position>) -> Option<Position> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
