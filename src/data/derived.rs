//! Derived fantasy figures computed at finalize time

use crate::types::{CanonicalRecord, CountingStats, DerivedStats};
use std::collections::HashMap;

/// Full-PPR scoring.
pub fn ppr_points(stats: &CountingStats<i32>) -> f64 {
    let points = 0.04 * f64::from(stats.pass_yards)
        + 6.0 * f64::from(stats.pass_td)
        - 2.0 * f64::from(stats.pass_int)
        + 0.1 * f64::from(stats.rush_yards)
        + 6.0 * f64::from(stats.rush_td)
        + f64::from(stats.rec_recep)
        + 0.1 * f64::from(stats.rec_yards)
        + 6.0 * f64::from(stats.rec_td);
    round2(points)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Fill every derived figure a source did not supply.
///
/// `supplied[i]` holds the source values for `records[i]`. Computed figures:
/// PPR points from the counting stats, the player's season-to-date PPR
/// average through that week, the mean PPR points of the same position in
/// that week, and the difference of the two.
pub fn apply_derived(records: &mut [CanonicalRecord], supplied: &[DerivedStats<Option<f64>>]) {
    for (record, given) in records.iter_mut().zip(supplied) {
        record.derived.ppr_points = given.ppr_points.unwrap_or_else(|| ppr_points(&record.stats));
    }

    let mut by_player: HashMap<(&str, &str), Vec<(i32, f64)>> = HashMap::new();
    let mut by_position_week: HashMap<(&str, i32), Vec<f64>> = HashMap::new();
    for record in records.iter() {
        by_player
            .entry((record.player.as_str(), record.team.as_str()))
            .or_default()
            .push((record.week, record.derived.ppr_points));
        by_position_week
            .entry((record.position.as_str(), record.week))
            .or_default()
            .push(record.derived.ppr_points);
    }

    let computed: Vec<(f64, f64)> = records
        .iter()
        .map(|record| {
            let to_date: Vec<f64> = by_player
                .get(&(record.player.as_str(), record.team.as_str()))
                .map(|weeks| {
                    weeks
                        .iter()
                        .filter(|(week, _)| *week <= record.week)
                        .map(|(_, points)| *points)
                        .collect()
                })
                .unwrap_or_default();
            let league = by_position_week
                .get(&(record.position.as_str(), record.week))
                .map(|points| mean(points))
                .unwrap_or_default();
            (round2(mean(&to_date)), round2(league))
        })
        .collect();

    for ((record, given), (average, league)) in records.iter_mut().zip(supplied).zip(computed) {
        record.derived.ppr_average = given.ppr_average.unwrap_or(average);
        record.derived.reg_league_avg = given.reg_league_avg.unwrap_or(league);
        record.derived.reg_due_for = given
            .reg_due_for
            .unwrap_or_else(|| round2(record.derived.reg_league_avg - record.derived.ppr_average));
    }
}
