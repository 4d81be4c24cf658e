//! Core record types shared across the pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const MIN_WEEK: i32 = 1;
pub const MAX_WEEK: i32 = 18;

/// Canonical position code. Unknown codes are carried as `Other` and
/// surfaced by validation instead of being rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Position {
    QB,
    RB,
    WR,
    TE,
    K,
    DEF,
    Other(String),
}

impl Position {
    pub fn as_str(&self) -> &str {
        match self {
            Position::QB => "QB",
            Position::RB => "RB",
            Position::WR => "WR",
            Position::TE => "TE",
            Position::K => "K",
            Position::DEF => "DEF",
            Position::Other(code) => code,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Position::Other(_))
    }
}

impl From<String> for Position {
    fn from(code: String) -> Self {
        match code.as_str() {
            "QB" => Position::QB,
            "RB" => Position::RB,
            "WR" => Position::WR,
            "TE" => Position::TE,
            "K" => Position::K,
            "DEF" => Position::DEF,
            _ => Position::Other(code),
        }
    }
}

impl From<Position> for String {
    fn from(pos: Position) -> Self {
        pos.as_str().to_string()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every numeric column a source may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StatField {
    PassComp,
    PassAtt,
    PassYards,
    PassTd,
    PassInt,
    RushAtt,
    RushYards,
    RushTd,
    RecTargets,
    RecRecep,
    RecYards,
    RecTd,
    Snapcount,
    PprPoints,
    PprAverage,
    RegLeagueAvg,
    RegDueFor,
}

impl StatField {
    pub const COUNTING: [StatField; 13] = [
        StatField::PassComp,
        StatField::PassAtt,
        StatField::PassYards,
        StatField::PassTd,
        StatField::PassInt,
        StatField::RushAtt,
        StatField::RushYards,
        StatField::RushTd,
        StatField::RecTargets,
        StatField::RecRecep,
        StatField::RecYards,
        StatField::RecTd,
        StatField::Snapcount,
    ];

    pub const DERIVED: [StatField; 4] = [
        StatField::PprPoints,
        StatField::PprAverage,
        StatField::RegLeagueAvg,
        StatField::RegDueFor,
    ];

    /// Column name used by the sources and the exported dataset.
    pub fn column(&self) -> &'static str {
        match self {
            StatField::PassComp => "Pass_Comp",
            StatField::PassAtt => "Pass_Att",
            StatField::PassYards => "Pass_Yards",
            StatField::PassTd => "Pass_TD",
            StatField::PassInt => "Pass_Int",
            StatField::RushAtt => "Rush_Att",
            StatField::RushYards => "Rush_Yards",
            StatField::RushTd => "Rush_TD",
            StatField::RecTargets => "Rec_Targets",
            StatField::RecRecep => "Rec_Recep",
            StatField::RecYards => "Rec_Yards",
            StatField::RecTd => "Rec_TD",
            StatField::Snapcount => "Snapcount",
            StatField::PprPoints => "PPR_Points",
            StatField::PprAverage => "PPR_Average",
            StatField::RegLeagueAvg => "Reg_League_Avg",
            StatField::RegDueFor => "Reg_Due_For",
        }
    }

    /// Case-insensitive column lookup.
    pub fn from_column(name: &str) -> Option<StatField> {
        let name = name.trim();
        Self::COUNTING
            .iter()
            .chain(Self::DERIVED.iter())
            .copied()
            .find(|field| field.column().eq_ignore_ascii_case(name))
    }

    pub fn is_derived(&self) -> bool {
        Self::DERIVED.contains(self)
    }
}

/// Integer counting stats. `T` is `Option<i32>` before merge (absence is
/// meaningful) and `i32` in the canonical record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CountingStats<T> {
    #[serde(rename = "Pass_Comp")]
    pub pass_comp: T,
    #[serde(rename = "Pass_Att")]
    pub pass_att: T,
    #[serde(rename = "Pass_Yards")]
    pub pass_yards: T,
    #[serde(rename = "Pass_TD")]
    pub pass_td: T,
    #[serde(rename = "Pass_Int")]
    pub pass_int: T,
    #[serde(rename = "Rush_Att")]
    pub rush_att: T,
    #[serde(rename = "Rush_Yards")]
    pub rush_yards: T,
    #[serde(rename = "Rush_TD")]
    pub rush_td: T,
    #[serde(rename = "Rec_Targets")]
    pub rec_targets: T,
    #[serde(rename = "Rec_Recep")]
    pub rec_recep: T,
    #[serde(rename = "Rec_Yards")]
    pub rec_yards: T,
    #[serde(rename = "Rec_TD")]
    pub rec_td: T,
    #[serde(rename = "Snapcount")]
    pub snapcount: T,
}

impl<T> CountingStats<T> {
    /// Field accessor; `None` for derived fields.
    pub fn get(&self, field: StatField) -> Option<&T> {
        Some(match field {
            StatField::PassComp => &self.pass_comp,
            StatField::PassAtt => &self.pass_att,
            StatField::PassYards => &self.pass_yards,
            StatField::PassTd => &self.pass_td,
            StatField::PassInt => &self.pass_int,
            StatField::RushAtt => &self.rush_att,
            StatField::RushYards => &self.rush_yards,
            StatField::RushTd => &self.rush_td,
            StatField::RecTargets => &self.rec_targets,
            StatField::RecRecep => &self.rec_recep,
            StatField::RecYards => &self.rec_yards,
            StatField::RecTd => &self.rec_td,
            StatField::Snapcount => &self.snapcount,
            _ => return None,
        })
    }

    pub fn get_mut(&mut self, field: StatField) -> Option<&mut T> {
        Some(match field {
            StatField::PassComp => &mut self.pass_comp,
            StatField::PassAtt => &mut self.pass_att,
            StatField::PassYards => &mut self.pass_yards,
            StatField::PassTd => &mut self.pass_td,
            StatField::PassInt => &mut self.pass_int,
            StatField::RushAtt => &mut self.rush_att,
            StatField::RushYards => &mut self.rush_yards,
            StatField::RushTd => &mut self.rush_td,
            StatField::RecTargets => &mut self.rec_targets,
            StatField::RecRecep => &mut self.rec_recep,
            StatField::RecYards => &mut self.rec_yards,
            StatField::RecTd => &mut self.rec_td,
            StatField::Snapcount => &mut self.snapcount,
            _ => return None,
        })
    }

    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> CountingStats<U> {
        CountingStats {
            pass_comp: f(self.pass_comp),
            pass_att: f(self.pass_att),
            pass_yards: f(self.pass_yards),
            pass_td: f(self.pass_td),
            pass_int: f(self.pass_int),
            rush_att: f(self.rush_att),
            rush_yards: f(self.rush_yards),
            rush_td: f(self.rush_td),
            rec_targets: f(self.rec_targets),
            rec_recep: f(self.rec_recep),
            rec_yards: f(self.rec_yards),
            rec_td: f(self.rec_td),
            snapcount: f(self.snapcount),
        }
    }
}

/// Float stats computed from the counting stats when no source supplies them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedStats<T> {
    #[serde(rename = "PPR_Points")]
    pub ppr_points: T,
    #[serde(rename = "PPR_Average")]
    pub ppr_average: T,
    #[serde(rename = "Reg_League_Avg")]
    pub reg_league_avg: T,
    #[serde(rename = "Reg_Due_For")]
    pub reg_due_for: T,
}

impl<T> DerivedStats<T> {
    pub fn get(&self, field: StatField) -> Option<&T> {
        Some(match field {
            StatField::PprPoints => &self.ppr_points,
            StatField::PprAverage => &self.ppr_average,
            StatField::RegLeagueAvg => &self.reg_league_avg,
            StatField::RegDueFor => &self.reg_due_for,
            _ => return None,
        })
    }

    pub fn get_mut(&mut self, field: StatField) -> Option<&mut T> {
        Some(match field {
            StatField::PprPoints => &mut self.ppr_points,
            StatField::PprAverage => &mut self.ppr_average,
            StatField::RegLeagueAvg => &mut self.reg_league_avg,
            StatField::RegDueFor => &mut self.reg_due_for,
            _ => return None,
        })
    }
}

/// Loosely typed cell as delivered by a scraper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Null,
    /// Arrays, objects and anything else a scraper passes through
    Other(serde_json::Value),
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Text(s.to_string())
    }
}

impl From<i32> for RawValue {
    fn from(v: i32) -> Self {
        RawValue::Int(i64::from(v))
    }
}

impl From<i64> for RawValue {
    fn from(v: i64) -> Self {
        RawValue::Int(v)
    }
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self {
        RawValue::Float(v)
    }
}

/// One row as returned by a source before normalization. Identity columns
/// are named; every other column lands in `stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSourceRow {
    #[serde(default, alias = "Season", alias = "SEASON")]
    pub season: Option<RawValue>,
    #[serde(default, alias = "Week", alias = "WEEK")]
    pub week: Option<RawValue>,
    #[serde(default, deserialize_with = "lenient_text", alias = "Player", alias = "PLAYER")]
    pub player: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", alias = "Position", alias = "POSITION", alias = "Pos")]
    pub position: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", alias = "Team", alias = "TEAM")]
    pub team: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", alias = "Opponent", alias = "OPPONENT", alias = "Opp")]
    pub opponent: Option<String>,
    #[serde(flatten)]
    pub stats: BTreeMap<String, RawValue>,
}

/// Identity cells arrive as strings, numbers or junk. Scalars are kept as
/// text; anything else reads as missing.
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde_json::Value;

    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

impl RawSourceRow {
    /// Convenience constructor for the identity columns.
    pub fn new(season: i64, week: i64, player: &str, team: &str) -> Self {
        Self {
            season: Some(RawValue::Int(season)),
            week: Some(RawValue::Int(week)),
            player: Some(player.to_string()),
            team: Some(team.to_string()),
            ..Default::default()
        }
    }

    pub fn with_position(mut self, position: &str) -> Self {
        self.position = Some(position.to_string());
        self
    }

    pub fn with_opponent(mut self, opponent: &str) -> Self {
        self.opponent = Some(opponent.to_string());
        self
    }

    pub fn with_stat(mut self, column: &str, value: impl Into<RawValue>) -> Self {
        self.stats.insert(column.to_string(), value.into());
        self
    }
}

/// A normalized row from a single source. Optional fields record absence so
/// the merge can tell "not supplied" from an explicit zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialRecord {
    pub season: i32,
    pub week: i32,
    pub player: String,
    pub position: Option<Position>,
    pub team: String,
    pub opponent: Option<String>,
    pub stats: CountingStats<Option<i32>>,
    pub derived: DerivedStats<Option<f64>>,
}

impl PartialRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            season: self.season,
            week: self.week,
            player: self.player.clone(),
            team: self.team.clone(),
        }
    }

    /// Value of a stat column as f64, for merge comparisons.
    pub fn stat(&self, field: StatField) -> Option<f64> {
        if field.is_derived() {
            self.derived.get(field).copied().flatten()
        } else {
            self.stats.get(field).copied().flatten().map(f64::from)
        }
    }
}

/// Unique identity of a canonical row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub season: i32,
    pub week: i32,
    pub player: String,
    pub team: String,
}

/// One player's performance in one week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    #[serde(rename = "Season")]
    pub season: i32,
    #[serde(rename = "Week")]
    pub week: i32,
    #[serde(rename = "Player")]
    pub player: String,
    #[serde(rename = "Position")]
    pub position: Position,
    #[serde(rename = "Team")]
    pub team: String,
    #[serde(rename = "Opponent")]
    pub opponent: String,
    #[serde(flatten)]
    pub stats: CountingStats<i32>,
    #[serde(flatten)]
    pub derived: DerivedStats<f64>,
}

impl CanonicalRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            season: self.season,
            week: self.week,
            player: self.player.clone(),
            team: self.team.clone(),
        }
    }
}

/// The merged, validated output handed to an exporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalDataset {
    pub season: i32,
    pub generated_at: DateTime<Utc>,
    /// Sources whose rows made it into the merge.
    pub contributing_sources: Vec<String>,
    pub records: Vec<CanonicalRecord>,
}

impl CanonicalDataset {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
