//! Field canonicalization for heterogeneous source rows
//!
//! Every function here is pure and table-driven. Unknown team and position
//! codes pass through unchanged so validation can report them.

use crate::error::{PipelineError, Result};
use crate::types::{PartialRecord, Position, RawSourceRow, RawValue, StatField, MAX_WEEK, MIN_WEEK};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Canonical codes of the 32 franchises.
pub const TEAMS: [&str; 32] = [
    "ARI", "ATL", "BAL", "BUF", "CAR", "CHI", "CIN", "CLE", "DAL", "DEN", "DET", "GB", "HOU",
    "IND", "JAX", "KC", "LAC", "LAR", "LV", "MIA", "MIN", "NE", "NO", "NYG", "NYJ", "PHI", "PIT",
    "SEA", "SF", "TB", "TEN", "WAS",
];

/// Alternate codes seen across sources.
const TEAM_ALIASES: &[(&str, &str)] = &[
    ("GNB", "GB"),
    ("GBP", "GB"),
    ("KAN", "KC"),
    ("KCC", "KC"),
    ("LVR", "LV"),
    ("RAI", "LV"),
    ("OAK", "LV"),
    ("RAM", "LAR"),
    ("LA", "LAR"),
    ("SDG", "LAC"),
    ("SD", "LAC"),
    ("NWE", "NE"),
    ("NEP", "NE"),
    ("NOR", "NO"),
    ("NOS", "NO"),
    ("SFO", "SF"),
    ("SF9", "SF"),
    ("TAM", "TB"),
    ("TBB", "TB"),
    ("WSH", "WAS"),
    ("JAC", "JAX"),
    ("HST", "HOU"),
    ("BLT", "BAL"),
    ("CLV", "CLE"),
    ("ARZ", "ARI"),
];

const POSITION_ALIASES: &[(&str, &str)] = &[
    ("DST", "DEF"),
    ("D/ST", "DEF"),
    ("DEFENSE", "DEF"),
    ("DEFENSE/ST", "DEF"),
    ("QUARTERBACK", "QB"),
    ("RUNNING BACK", "RB"),
    ("RUNNINGBACK", "RB"),
    ("HB", "RB"),
    ("WIDE RECEIVER", "WR"),
    ("WIDERECEIVER", "WR"),
    ("RECEIVER", "WR"),
    ("TIGHT END", "TE"),
    ("TIGHTEND", "TE"),
    ("KICKER", "K"),
    ("PLACEKICKER", "K"),
    ("PK", "K"),
];

/// Full-name spellings that differ between sources.
const NAME_CORRECTIONS: &[(&str, &str)] = &[
    ("DeAndre Washington", "De'Andre Washington"),
    ("DAndre Swift", "D'Andre Swift"),
    ("Ja Marr Chase", "Ja'Marr Chase"),
    ("JaMarr Chase", "Ja'Marr Chase"),
    ("Amon Ra St. Brown", "Amon-Ra St. Brown"),
];

const MISSING_MARKERS: [&str; 6] = ["na", "n/a", "null", "none", "nan", "-"];

pub fn is_known_team(code: &str) -> bool {
    TEAMS.contains(&code)
}

/// Upper-case, trim and map aliases. Empty input stays empty.
pub fn normalize_team_code(code: &str) -> String {
    let code = code.trim().trim_start_matches('@').trim().to_ascii_uppercase();
    TEAM_ALIASES
        .iter()
        .find(|(alias, _)| *alias == code)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(code)
}

/// `None` for blank input; unknown codes become `Position::Other`.
pub fn normalize_position(position: &str) -> Option<Position> {
    let code = position.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_uppercase();
    if code.is_empty() {
        return None;
    }
    let code = POSITION_ALIASES
        .iter()
        .find(|(alias, _)| *alias == code)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(code);
    Some(Position::from(code))
}

/// Best-effort name canonicalization for cross-source matching.
///
/// Collapses whitespace, straightens apostrophes, joins dotted initials
/// (`A.J.` becomes `AJ`), normalizes `Jr`/`Sr`/roman-numeral suffixes and
/// finally applies the correction table.
pub fn normalize_player_name(name: &str) -> String {
    let straightened: String = name
        .chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' | '\u{02BC}' | '`' | '\u{00B4}' => '\'',
            other => other,
        })
        .collect();

    let tokens: Vec<&str> = straightened.split_whitespace().collect();
    let mut out: Vec<String> = Vec::with_capacity(tokens.len());
    for (i, token) in tokens.iter().enumerate() {
        let next_is_suffix = tokens.get(i + 1).is_some_and(|next| suffix(next).is_some());
        let token = if next_is_suffix {
            token.trim_end_matches(',')
        } else {
            token
        };

        if let Some(canonical) = suffix(token) {
            out.push(canonical.to_string());
        } else if let Some(joined) = joined_initials(token) {
            out.push(joined);
        } else if !token.is_empty() {
            out.push(token.to_string());
        }
    }

    let joined = out.join(" ");
    NAME_CORRECTIONS
        .iter()
        .find(|(variant, _)| *variant == joined)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(joined)
}

fn suffix(token: &str) -> Option<&'static str> {
    match token.trim_end_matches('.').to_ascii_lowercase().as_str() {
        "jr" => Some("Jr"),
        "sr" => Some("Sr"),
        "ii" => Some("II"),
        "iii" => Some("III"),
        "iv" => Some("IV"),
        _ => None,
    }
}

/// `A.J.` / `A.J` / `C.J.` → `AJ` / `CJ`. Requires at least two single letters.
fn joined_initials(token: &str) -> Option<String> {
    if !token.contains('.') {
        return None;
    }
    let parts: Vec<&str> = token.split('.').filter(|p| !p.is_empty()).collect();
    let all_initials = parts.len() >= 2
        && parts
            .iter()
            .all(|p| p.chars().count() == 1 && p.chars().all(|c| c.is_alphabetic()));
    all_initials.then(|| parts.concat().to_uppercase())
}

/// How a raw cell reads as a number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericCell {
    /// Blank, null, NaN or a missing marker
    Absent,
    Value(f64),
    /// Present but unreadable
    Garbage,
}

pub fn parse_numeric(value: &RawValue) -> NumericCell {
    match value {
        RawValue::Null => NumericCell::Absent,
        RawValue::Int(v) => NumericCell::Value(*v as f64),
        RawValue::Float(v) if v.is_nan() => NumericCell::Absent,
        RawValue::Float(v) if v.is_infinite() => NumericCell::Garbage,
        RawValue::Float(v) => NumericCell::Value(*v),
        RawValue::Bool(b) => NumericCell::Value(if *b { 1.0 } else { 0.0 }),
        RawValue::Text(text) => parse_numeric_text(text),
        RawValue::Other(_) => NumericCell::Garbage,
    }
}

fn parse_numeric_text(text: &str) -> NumericCell {
    let trimmed = text.trim();
    if trimmed.is_empty() || MISSING_MARKERS.contains(&trimmed.to_ascii_lowercase().as_str()) {
        return NumericCell::Absent;
    }

    let cleaned: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() || cleaned == "-" {
        return NumericCell::Garbage;
    }

    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() => NumericCell::Value(v),
        _ => NumericCell::Garbage,
    }
}

/// Coerce any raw cell to a number; absent and garbage both yield `default`.
/// Integers truncate toward zero unless `allow_float`.
pub fn normalize_numeric_stat(value: Option<&RawValue>, default: f64, allow_float: bool) -> f64 {
    match value.map(parse_numeric) {
        Some(NumericCell::Value(v)) if allow_float => v,
        Some(NumericCell::Value(v)) => v.trunc(),
        Some(NumericCell::Garbage) => {
            debug!("Could not normalize numeric value {:?}, using {}", value, default);
            default
        }
        Some(NumericCell::Absent) | None => default,
    }
}

/// Integer cell with absence preserved. Garbage becomes `Some(0)`.
fn int_cell(value: &RawValue) -> Option<i32> {
    match parse_numeric(value) {
        NumericCell::Absent => None,
        NumericCell::Value(v) => Some(v.trunc().clamp(i32::MIN as f64, i32::MAX as f64) as i32),
        NumericCell::Garbage => {
            debug!("Non-numeric stat {:?} coerced to 0", value);
            Some(0)
        }
    }
}

fn float_cell(value: &RawValue) -> Option<f64> {
    match parse_numeric(value) {
        NumericCell::Absent => None,
        NumericCell::Value(v) => Some(v),
        NumericCell::Garbage => Some(0.0),
    }
}

/// Apply every field normalizer to one raw row. `season` is used when the
/// row does not carry its own.
pub fn normalize_row(row: &RawSourceRow, season: i32) -> PartialRecord {
    let season = row.season.as_ref().and_then(int_cell).unwrap_or(season);
    let week = row.week.as_ref().and_then(int_cell).unwrap_or(0);

    let mut record = PartialRecord {
        season,
        week,
        player: normalize_player_name(row.player.as_deref().unwrap_or_default()),
        position: row.position.as_deref().and_then(normalize_position),
        team: normalize_team_code(row.team.as_deref().unwrap_or_default()),
        opponent: row
            .opponent
            .as_deref()
            .map(normalize_team_code)
            .filter(|code| !code.is_empty()),
        ..Default::default()
    };

    for (column, value) in &row.stats {
        match StatField::from_column(column) {
            Some(field) if field.is_derived() => {
                if let Some(slot) = record.derived.get_mut(field) {
                    *slot = float_cell(value);
                }
            }
            Some(field) => {
                if let Some(slot) = record.stats.get_mut(field) {
                    *slot = int_cell(value);
                }
            }
            None => debug!("Ignoring unknown column {}", column),
        }
    }

    record
}

/// Variant → normalized name, for names that change under normalization.
pub fn create_player_mapping<'a>(names: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, String> {
    names
        .into_iter()
        .filter_map(|name| {
            let normalized = normalize_player_name(name);
            (normalized != name).then(|| (name.to_string(), normalized))
        })
        .collect()
}

/// Parse `"1"`, `"1-4"`, `"1,3,5"` or `"1-3,5,7-9"` into sorted unique weeks.
pub fn parse_week_range(spec: &str) -> Result<Vec<i32>> {
    let invalid = |detail: String| PipelineError::Config(format!("invalid week range '{}': {}", spec, detail));
    let parse_week = |text: &str| -> Result<i32> {
        let week: i32 = text
            .trim()
            .parse()
            .map_err(|_| invalid(format!("'{}' is not a number", text.trim())))?;
        if !(MIN_WEEK..=MAX_WEEK).contains(&week) {
            return Err(invalid(format!("week {} outside {}-{}", week, MIN_WEEK, MAX_WEEK)));
        }
        Ok(week)
    };

    let mut weeks = BTreeSet::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse_week(start)?, parse_week(end)?);
                if start > end {
                    return Err(invalid(format!("{} is after {}", start, end)));
                }
                weeks.extend(start..=end);
            }
            None => {
                weeks.insert(parse_week(part)?);
            }
        }
    }

    if weeks.is_empty() {
        return Err(invalid("no weeks given".to_string()));
    }
    Ok(weeks.into_iter().collect())
}

/// Parse `"ARI,phi"` into canonical codes, rejecting unknown teams.
pub fn parse_team_list(spec: &str) -> Result<Vec<String>> {
    let mut teams = BTreeSet::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let code = normalize_team_code(part);
        if !is_known_team(&code) {
            return Err(PipelineError::Config(format!("unknown team code '{}'", part)));
        }
        teams.insert(code);
    }
    if teams.is_empty() {
        return Err(PipelineError::Config(format!("invalid team list '{}'", spec)));
    }
    Ok(teams.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_team_codes() {
        assert_eq!(normalize_team_code("GNB"), "GB");
        assert_eq!(normalize_team_code(" kan "), "KC");
        assert_eq!(normalize_team_code("@SFO"), "SF");
        assert_eq!(normalize_team_code("ARI"), "ARI");
        assert_eq!(normalize_team_code("XXX"), "XXX");
        assert_eq!(normalize_team_code(""), "");
        assert!(!is_known_team("XXX"));
    }

    #[test]
    fn test_every_alias_maps_to_a_known_team() {
        for (alias, canonical) in TEAM_ALIASES {
            assert!(is_known_team(canonical), "{} -> {}", alias, canonical);
        }
    }

    #[test]
    fn test_positions() {
        assert_eq!(normalize_position("QUARTERBACK"), Some(Position::QB));
        assert_eq!(normalize_position("running  back"), Some(Position::RB));
        assert_eq!(normalize_position("DST"), Some(Position::DEF));
        assert_eq!(normalize_position("wr"), Some(Position::WR));
        assert_eq!(normalize_position("LB"), Some(Position::Other("LB".into())));
        assert_eq!(normalize_position("   "), None);
    }

    #[test]
    fn test_player_names() {
        assert_eq!(normalize_player_name("  A.J.   Brown "), "AJ Brown");
        assert_eq!(normalize_player_name("C.J. Stroud Jr."), "CJ Stroud Jr");
        assert_eq!(normalize_player_name("Odell Beckham, Jr"), "Odell Beckham Jr");
        assert_eq!(normalize_player_name("Marvin Harrison jr."), "Marvin Harrison Jr");
        assert_eq!(normalize_player_name("Michael Pittman iii"), "Michael Pittman III");
        assert_eq!(normalize_player_name("Ja\u{2019}Marr Chase"), "Ja'Marr Chase");
        assert_eq!(normalize_player_name("DeAndre Washington"), "De'Andre Washington");
        assert_eq!(normalize_player_name("Amon Ra St. Brown"), "Amon-Ra St. Brown");
        // single-letter abbreviations are not initials
        assert_eq!(normalize_player_name("St. Brown"), "St. Brown");
        assert_eq!(normalize_player_name(""), "");
    }

    #[test]
    fn test_numeric_parsing() {
        assert_eq!(parse_numeric(&RawValue::Int(45)), NumericCell::Value(45.0));
        assert_eq!(parse_numeric(&"1,234".into()), NumericCell::Value(1234.0));
        assert_eq!(parse_numeric(&" -3 ".into()), NumericCell::Value(-3.0));
        assert_eq!(parse_numeric(&"".into()), NumericCell::Absent);
        assert_eq!(parse_numeric(&"N/A".into()), NumericCell::Absent);
        assert_eq!(parse_numeric(&RawValue::Float(f64::NAN)), NumericCell::Absent);
        assert_eq!(parse_numeric(&RawValue::Null), NumericCell::Absent);
        assert_eq!(parse_numeric(&"abc".into()), NumericCell::Garbage);
        assert_eq!(parse_numeric(&RawValue::Other(serde_json::json!({"href": "/x"}))), NumericCell::Garbage);
        assert_eq!(parse_numeric(&"1.2.3".into()), NumericCell::Garbage);
    }

    #[test]
    fn test_normalize_numeric_stat_defaults() {
        assert_eq!(normalize_numeric_stat(Some(&"12.7".into()), 0.0, false), 12.0);
        assert_eq!(normalize_numeric_stat(Some(&"12.7".into()), 0.0, true), 12.7);
        assert_eq!(normalize_numeric_stat(Some(&"garbage".into()), 0.0, false), 0.0);
        assert_eq!(normalize_numeric_stat(None, 0.0, true), 0.0);
        assert_eq!(normalize_numeric_stat(Some(&RawValue::Null), 7.0, false), 7.0);
    }

    #[test]
    fn test_normalize_row() {
        let row = RawSourceRow::new(2024, 1, "A.J. Brown", "PHI")
            .with_position("Wide Receiver")
            .with_opponent("@GNB")
            .with_stat("rec_yards", "119")
            .with_stat("REC_TD", 1)
            .with_stat("Snapcount", "")
            .with_stat("PPR_Points", "24.9")
            .with_stat("Rush_Att", "bad")
            .with_stat("Fumbles", 1);

        let record = normalize_row(&row, 2023);
        assert_eq!(record.season, 2024);
        assert_eq!(record.week, 1);
        assert_eq!(record.player, "AJ Brown");
        assert_eq!(record.position, Some(Position::WR));
        assert_eq!(record.opponent.as_deref(), Some("GB"));
        assert_eq!(record.stats.rec_yards, Some(119));
        assert_eq!(record.stats.rec_td, Some(1));
        assert_eq!(record.stats.snapcount, None);
        assert_eq!(record.stats.rush_att, Some(0));
        assert_eq!(record.stats.pass_att, None);
        assert_eq!(record.derived.ppr_points, Some(24.9));
    }

    #[test]
    fn test_normalize_row_fallbacks() {
        let row = RawSourceRow {
            player: Some("  ".into()),
            ..Default::default()
        };
        let record = normalize_row(&row, 2022);
        assert_eq!(record.season, 2022);
        assert_eq!(record.week, 0);
        assert!(record.player.is_empty());
        assert!(record.team.is_empty());
        assert!(record.opponent.is_none());
    }

    #[test]
    fn test_player_mapping_lists_changed_names_only() {
        let mapping = create_player_mapping(["A.J. Brown", "Josh Allen", "D.J. Moore"]);
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping["A.J. Brown"], "AJ Brown");
        assert_eq!(mapping["D.J. Moore"], "DJ Moore");
    }

    #[test]
    fn test_week_ranges() {
        assert_eq!(parse_week_range("1").unwrap(), vec![1]);
        assert_eq!(parse_week_range("1-4").unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(parse_week_range("5,1,3").unwrap(), vec![1, 3, 5]);
        assert_eq!(parse_week_range("1-3, 5, 7-9").unwrap(), vec![1, 2, 3, 5, 7, 8, 9]);
        assert_eq!(parse_week_range("2-3,3-4").unwrap(), vec![2, 3, 4]);
        assert!(parse_week_range("0").is_err());
        assert!(parse_week_range("19").is_err());
        assert!(parse_week_range("4-2").is_err());
        assert!(parse_week_range("x").is_err());
        assert!(parse_week_range("").is_err());
    }

    #[test]
    fn test_team_lists() {
        assert_eq!(parse_team_list("ARI,phi").unwrap(), vec!["ARI", "PHI"]);
        assert_eq!(parse_team_list("GNB, gb").unwrap(), vec!["GB"]);
        assert!(parse_team_list("ARI,XXX").is_err());
        assert!(parse_team_list(" , ").is_err());
    }
}
