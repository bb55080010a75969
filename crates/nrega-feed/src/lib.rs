//! Client for the district-wise MGNREGA open-data feed.
//!
//! The client only fetches and decodes. Turning [`RawRecord`]s into stored snapshots is the
//! ingestion pipeline's job.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use nrega_core::FiscalMonth;
use nrega_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "nrega-feed";

/// One (fiscal year, month) combination of the ingestion grid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedCell {
    pub fiscal_year: String,
    pub month: FiscalMonth,
}

impl FeedCell {
    pub fn new(fiscal_year: impl Into<String>, month: FiscalMonth) -> Self {
        Self {
            fiscal_year: fiscal_year.into(),
            month,
        }
    }
}

impl fmt::Display for FeedCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.month, self.fiscal_year)
    }
}

/// Record as published by the feed. Numeric columns arrive as numbers, numeric strings or
/// placeholders such as `"NA"`, so they stay untyped until mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default)]
    pub district_name: Option<String>,
    #[serde(default)]
    pub state_name: Option<String>,
    #[serde(default)]
    pub month: Option<String>,
    #[serde(default)]
    pub fin_year: Option<String>,
    #[serde(rename = "Total_No_of_Works_Takenup", default)]
    pub total_works: Option<JsonValue>,
    #[serde(rename = "Persondays_of_Central_Liability_so_far", default)]
    pub person_days: Option<JsonValue>,
    #[serde(rename = "Total_Exp", default)]
    pub total_exp: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct FeedBody {
    #[serde(default)]
    records: Option<Vec<RawRecord>>,
}

#[derive(Debug, Error)]
pub enum FeedFailure {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed response body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// The feed could not serve a cell. Always scoped to the cell that was requested.
#[derive(Debug, Error)]
#[error("feed unavailable for {cell}: {cause}")]
pub struct FeedUnavailable {
    pub cell: FeedCell,
    #[source]
    pub cause: FeedFailure,
}

impl FeedUnavailable {
    pub fn new(cell: &FeedCell, cause: impl Into<FeedFailure>) -> Self {
        Self {
            cell: cell.clone(),
            cause: cause.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(&self.cause, FeedFailure::Fetch(err) if err.is_timeout())
    }
}

/// Decodes a feed response body. A missing or null `records` array is an empty result.
pub fn parse_feed_body(bytes: &[u8]) -> Result<Vec<RawRecord>, serde_json::Error> {
    let body: FeedBody = serde_json::from_slice(bytes)?;
    Ok(body.records.unwrap_or_default())
}

#[async_trait]
pub trait FeedClient: Send + Sync {
    /// Fetch every record of one grid cell. `Ok(vec![])` means the feed has no data yet.
    async fn fetch(&self, run_id: Uuid, cell: &FeedCell) -> Result<Vec<RawRecord>, FeedUnavailable>;
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Resource URL including the api key and `format=json`.
    pub base_url: String,
    pub state_name: String,
    pub limit: Option<u32>,
}

/// Live client for the data.gov.in resource, filtered by state, month and fiscal year.
#[derive(Debug)]
pub struct DataGovFeedClient {
    http: HttpFetcher,
    config: FeedConfig,
}

impl DataGovFeedClient {
    pub fn new(http: HttpFetcher, config: FeedConfig) -> Self {
        Self { http, config }
    }

    fn query_for(&self, cell: &FeedCell) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("filters[state_name]", self.config.state_name.clone()),
            ("filters[month]", cell.month.as_str().to_string()),
            ("filters[fin_year]", cell.fiscal_year.clone()),
        ];
        if let Some(limit) = self.config.limit {
            query.push(("limit", limit.to_string()));
        }
        query
    }
}

#[async_trait]
impl FeedClient for DataGovFeedClient {
    async fn fetch(&self, run_id: Uuid, cell: &FeedCell) -> Result<Vec<RawRecord>, FeedUnavailable> {
        let query = self.query_for(cell);
        let response = self
            .http
            .get_with_query(run_id, &self.config.base_url, &query)
            .await
            .map_err(|err| FeedUnavailable::new(cell, err))?;
        debug!(
            %run_id,
            cell = %cell,
            bytes = response.body.len(),
            url = %response.final_url,
            "feed response received"
        );
        parse_feed_body(&response.body).map_err(|err| FeedUnavailable::new(cell, err))
    }
}

/// Offline client replaying a captured feed body. Records are served to the cell whose
/// month and fiscal year they carry.
#[derive(Debug, Clone, Default)]
pub struct FixtureFeedClient {
    records: Vec<RawRecord>,
}

impl FixtureFeedClient {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self { records }
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let records =
            parse_feed_body(&bytes).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(records))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl FeedClient for FixtureFeedClient {
    async fn fetch(&self, _run_id: Uuid, cell: &FeedCell) -> Result<Vec<RawRecord>, FeedUnavailable> {
        Ok(self
            .records
            .iter()
            .filter(|r| {
                r.month
                    .as_deref()
                    .is_some_and(|m| m.trim().eq_ignore_ascii_case(cell.month.as_str()))
            })
            .filter(|r| r.fin_year.as_deref().map(str::trim) == Some(cell.fiscal_year.as_str()))
            .cloned()
            .collect())
    }
}
