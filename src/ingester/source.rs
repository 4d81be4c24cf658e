//! JSON-over-HTTP fetcher for endpoints that already serve raw rows

use super::{FetchContext, SourceFetcher, SourceParams};
use crate::client::{HttpMethod, RequestOptions};
use crate::config::SourceConfig;
use crate::error::{PipelineError, Result};
use crate::types::RawSourceRow;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Accepted payload shapes. Rows stay untyped until decoded one by one.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RowsPayload {
    Bare(Vec<Value>),
    Rows { rows: Vec<Value> },
    Data { data: Vec<Value> },
}

impl RowsPayload {
    fn into_values(self) -> Vec<Value> {
        match self {
            RowsPayload::Bare(rows) | RowsPayload::Rows { rows } | RowsPayload::Data { data: rows } => rows,
        }
    }
}

/// Decode each row on its own; rows that are not objects are skipped.
fn decode_rows(source: &str, values: Vec<Value>) -> Vec<RawSourceRow> {
    let total = values.len();
    let rows: Vec<RawSourceRow> = values
        .into_iter()
        .enumerate()
        .filter_map(|(i, value)| match serde_json::from_value(value) {
            Ok(row) => Some(row),
            Err(e) => {
                debug!("{}: skipping row {}: {}", source, i, e);
                None
            }
        })
        .collect();
    if rows.len() < total {
        warn!("{}: skipped {} of {} undecodable rows", source, total - rows.len(), total);
    }
    rows
}

/// Fetches `url_template` with `{team}` and `{season}` substituted and
/// decodes the body as a list of rows.
pub struct JsonEndpointSource {
    name: String,
    url_template: String,
}

impl JsonEndpointSource {
    pub fn new(name: &str, url_template: &str) -> Self {
        Self {
            name: name.to_string(),
            url_template: url_template.to_string(),
        }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(&config.name, &config.url_template)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url_for(&self, params: &SourceParams) -> String {
        self.url_template
            .replace("{season}", &params.season.to_string())
            .replace("{team}", params.team.as_deref().unwrap_or_default())
    }
}

#[async_trait]
impl SourceFetcher for JsonEndpointSource {
    async fn fetch_raw(&self, params: &SourceParams, ctx: &FetchContext) -> Result<Vec<RawSourceRow>> {
        let url = self.url_for(params);
        if url::Url::parse(&url).is_err() {
            return Err(PipelineError::InvalidUrl(url));
        }
        let opts = RequestOptions {
            headers: vec![("Accept".to_string(), "application/json".to_string())],
            cancel: Some(ctx.cancel.clone()),
            ..Default::default()
        };

        let resp = ctx.limiter.make_request(&url, HttpMethod::Get, opts).await?;
        let rows = decode_rows(&self.name, resp.json::<RowsPayload>()?.into_values());
        debug!("{} returned {} rows from {}", self.name, rows.len(), url);
        Ok(rows)
    }
}
