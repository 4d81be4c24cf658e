//! Record normalization, merging and validation
//!
//! - Field canonicalization (teams, positions, names, numbers)
//! - Multi-key left-join merge across sources
//! - Consistency validation
//! - Derived fantasy figures

pub mod aggregator;
pub mod cleaning;
pub mod derived;
pub mod normalizer;

pub use aggregator::{coalesce, merge, JoinField, MergeColumn, MergePolicy, MergeSpec, MergeStats, DEFAULT_JOIN_KEYS};
pub use cleaning::{validate_consistency, Validatable, ValidationIssues};
pub use derived::{apply_derived, ppr_points};
pub use normalizer::{
    create_player_mapping, normalize_numeric_stat, normalize_player_name, normalize_position, normalize_row,
    normalize_team_code, parse_team_list, parse_week_range, TEAMS,
};
