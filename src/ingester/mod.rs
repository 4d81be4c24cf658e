//! Source fetchers
//!
//! A fetcher turns `(source, season, team)` into raw rows. It is the only
//! source-specific piece of the pipeline; caching, spacing and merging are
//! applied around it by the orchestrator.

pub mod source;

#[cfg(test)]
mod tests;

pub use source::JsonEndpointSource;

use crate::cancel::CancelToken;
use crate::client::RateLimiter;
use crate::error::Result;
use crate::storage::CacheParams;
use crate::types::RawSourceRow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One unit of fetch work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceParams {
    pub source: String,
    pub season: i32,
    /// `None` for season-wide sources
    pub team: Option<String>,
}

impl SourceParams {
    pub fn for_team(source: &str, season: i32, team: &str) -> Self {
        Self {
            source: source.to_string(),
            season,
            team: Some(team.to_string()),
        }
    }

    pub fn for_season(source: &str, season: i32) -> Self {
        Self {
            source: source.to_string(),
            season,
            team: None,
        }
    }

    /// Logical cache key within the source's namespace.
    pub fn cache_key(&self) -> String {
        match &self.team {
            Some(team) => format!("{}_{}", team, self.season),
            None => format!("season_{}", self.season),
        }
    }

    /// Inverse of `cache_key`.
    pub fn from_cache_key(source: &str, key: &str) -> Option<Self> {
        let (head, season) = key.rsplit_once('_')?;
        let season: i32 = season.parse().ok()?;
        match head {
            "season" => Some(Self::for_season(source, season)),
            team if !team.is_empty() => Some(Self::for_team(source, season, team)),
            _ => None,
        }
    }

    pub fn cache_params(&self) -> CacheParams {
        CacheParams::new()
            .with("season", self.season)
            .with("team", self.team.clone().unwrap_or_default())
    }
}

/// Shared services a fetcher may use.
#[derive(Clone)]
pub struct FetchContext {
    pub limiter: Arc<RateLimiter>,
    pub cancel: CancelToken,
}

/// Scraper interface: given a team and season, return raw player-week rows.
/// Network calls must go through `ctx.limiter`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch_raw(&self, params: &SourceParams, ctx: &FetchContext) -> Result<Vec<RawSourceRow>>;
}
