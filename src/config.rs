//! Configuration management

use crate::data::{JoinField, MergePolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineOptions,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// Recognized pipeline options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Season to extract
    pub season: i32,
    /// Memoize raw source rows on disk
    pub use_cache: bool,
    /// Cache entry lifetime in seconds
    pub cache_ttl: u64,
    /// Cache root directory
    pub cache_dir: String,
    /// Default per-domain delay between requests, in seconds
    pub rate_limit_delay: f64,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Exponential backoff multiplier
    pub backoff_factor: f64,
    /// Apply +/-20% jitter to every wait
    pub jitter: bool,
    /// Run cache warmers before extraction
    pub warm_cache: bool,
    /// Concurrent fetches per phase
    pub max_workers: usize,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            season: 2024,
            use_cache: true,
            cache_ttl: 3600,
            cache_dir: "cache".to_string(),
            rate_limit_delay: 1.0,
            max_retries: 3,
            backoff_factor: 2.0,
            jitter: true,
            warm_cache: false,
            max_workers: 4,
            request_timeout_secs: 30,
            user_agent: "Mozilla/5.0 (compatible; season-extractor/0.1)".to_string(),
        }
    }
}

impl PipelineOptions {
    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_secs_f64(self.rate_limit_delay.max(0.0))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Reject values that would make the limiter or worker pool misbehave.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::PipelineError;

        if !self.rate_limit_delay.is_finite() || self.rate_limit_delay < 0.0 {
            return Err(PipelineError::Config(format!(
                "rate_limit_delay must be >= 0, got {}",
                self.rate_limit_delay
            )));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(PipelineError::Config(format!(
                "backoff_factor must be >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        if self.max_workers == 0 {
            return Err(PipelineError::Config("max_workers must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRole {
    Primary,
    Secondary,
}

/// How many requests one source needs per season.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchScope {
    /// One request per team
    #[default]
    PerTeam,
    /// One request for the whole season
    Season,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Source name, also the cache namespace
    pub name: String,
    pub role: SourceRole,
    /// URL with `{team}` and `{season}` placeholders
    pub url_template: String,
    #[serde(default)]
    pub scope: FetchScope,
    /// Merge keys (secondary sources only)
    #[serde(default)]
    pub join_keys: Option<Vec<JoinField>>,
    #[serde(default)]
    pub merge_policy: MergePolicy,
    /// Cache TTL override in seconds
    #[serde(default)]
    pub cache_ttl: Option<u64>,
    /// Columns a secondary contributes; all columns when empty
    #[serde(default)]
    pub fields: Vec<String>,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("config path is not valid UTF-8: {}", path.display()))?;

        let settings = config::Config::builder()
            .add_source(config::File::with_name(path_str).required(false))
            .add_source(
                config::Environment::with_prefix("SEASON_EXTRACTOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.pipeline.validate()?;
        Ok(config)
    }

    /// Load from default locations
    pub fn load_default() -> anyhow::Result<Self> {
        let paths = [
            "config.toml",
            "config.yaml",
            "~/.config/season-extractor/config.toml",
        ];

        for path in paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::load(expanded.as_ref());
            }
        }

        tracing::warn!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    pub fn primary_source(&self) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.role == SourceRole::Primary)
    }

    pub fn secondary_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.role == SourceRole::Secondary)
    }
}
