//! Ingestion pipeline: walks the (fiscal year × month) grid, maps feed records into
//! snapshots and upserts them, plus the refresh scheduler and history reconciliation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nrega_core::{canonical_district_name, CoreError, FiscalMonth, PerformanceSnapshot};
use nrega_feed::{DataGovFeedClient, FeedCell, FeedClient, FeedConfig, FixtureFeedClient, RawRecord};
use nrega_storage::{
    HttpClientConfig, HttpFetcher, MemorySnapshotStore, PgSnapshotStore, SnapshotStore,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod history;
pub mod scheduler;

pub use history::{build_history, reconcile, HistoryError};
pub use scheduler::RefreshScheduler;

pub const CRATE_NAME: &str = "nrega-sync";

/// Feed section of the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSettings {
    pub state_name: String,
    pub fiscal_years: Vec<String>,
    pub limit: Option<u32>,
}

/// Keys read from `feed.yaml`. Absent keys leave the environment value in place.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FeedOverrides {
    pub state_name: Option<String>,
    pub fiscal_years: Option<Vec<String>>,
    pub limit: Option<u32>,
}

impl FeedOverrides {
    pub fn apply(self, settings: &mut FeedSettings) {
        if let Some(state_name) = self.state_name {
            settings.state_name = state_name;
        }
        if let Some(fiscal_years) = self.fiscal_years.filter(|years| !years.is_empty()) {
            settings.fiscal_years = fiscal_years;
        }
        if self.limit.is_some() {
            settings.limit = self.limit;
        }
    }
}

fn default_state_name() -> String {
    "UTTAR PRADESH".to_string()
}

fn default_fiscal_years() -> Vec<String> {
    vec!["2023-2024".to_string(), "2024-2025".to_string()]
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            state_name: default_state_name(),
            fiscal_years: default_fiscal_years(),
            limit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub data_api: Option<String>,
    pub feed_fixture: Option<PathBuf>,
    pub feed: FeedSettings,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub safety_net_interval: Duration,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub refresh_concurrency: usize,
    pub workspace_root: PathBuf,
}

fn env_truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes" | "YES")
}

fn split_fiscal_years(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|y| !y.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Hours between safety-net refreshes, at least one.
fn safety_net_interval(hours: Option<&str>) -> Duration {
    let hours = hours
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(6)
        .max(1);
    Duration::from_secs(hours.saturating_mul(60 * 60))
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let mut feed = FeedSettings::default();
        if let Ok(state) = std::env::var("NREGA_STATE_NAME") {
            feed.state_name = state;
        }
        if let Ok(years) = std::env::var("NREGA_FIN_YEARS") {
            let years = split_fiscal_years(&years);
            if !years.is_empty() {
                feed.fiscal_years = years;
            }
        }
        feed.limit = std::env::var("NREGA_FEED_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok());

        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            data_api: std::env::var("DATA_API").ok().filter(|v| !v.is_empty()),
            feed_fixture: std::env::var("NREGA_FEED_FIXTURE").ok().map(PathBuf::from),
            feed,
            scheduler_enabled: std::env::var("NREGA_SCHEDULER_ENABLED")
                .map(|v| env_truthy(&v))
                .unwrap_or(true),
            sync_cron: std::env::var("NREGA_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 0 * * *".to_string()),
            safety_net_interval: safety_net_interval(
                std::env::var("NREGA_SAFETY_NET_HOURS").ok().as_deref(),
            ),
            user_agent: std::env::var("NREGA_USER_AGENT")
                .unwrap_or_else(|_| "nrega-harvester/0.1".to_string()),
            http_timeout_secs: std::env::var("NREGA_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            refresh_concurrency: std::env::var("NREGA_REFRESH_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            workspace_root: std::env::var("NREGA_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Environment configuration with `feed.yaml` from the workspace root applied on top.
    pub fn load() -> Result<Self> {
        let mut config = Self::from_env();
        if let Some(overrides) = load_feed_settings(&config.workspace_root)? {
            overrides.apply(&mut config.feed);
        }
        Ok(config)
    }
}

pub fn load_feed_settings(workspace_root: &Path) -> Result<Option<FeedOverrides>> {
    let path = workspace_root.join("feed.yaml");
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let settings = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(settings))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("record has no district_name")]
    MissingDistrict,
    #[error(transparent)]
    InvalidMonth(#[from] CoreError),
}

/// Numeric coercion for feed columns: numbers and numeric strings (thousands separators
/// allowed) parse; anything else, negatives and non-finite values become 0.
pub fn parse_or_zero(value: Option<&JsonValue>) -> f64 {
    let parsed = match value {
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() && v > 0.0 => v,
        _ => 0.0,
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Translates one feed record into the storage schema.
///
/// Month and fiscal year fall back to the requested cell when the record omits them; a
/// month that is present but outside the fiscal calendar is rejected.
pub fn map_record(
    raw: &RawRecord,
    cell: &FeedCell,
    now: DateTime<Utc>,
) -> Result<PerformanceSnapshot, MappingError> {
    let district = non_blank(raw.district_name.as_deref()).ok_or(MappingError::MissingDistrict)?;
    let month = match non_blank(raw.month.as_deref()) {
        Some(m) => m.parse::<FiscalMonth>()?,
        None => cell.month,
    };
    let fiscal_year = non_blank(raw.fin_year.as_deref()).unwrap_or(&cell.fiscal_year);

    Ok(PerformanceSnapshot {
        district_name: canonical_district_name(district),
        state_name: raw.state_name.as_deref().unwrap_or_default().trim().to_string(),
        month: month.as_str().to_string(),
        fiscal_year: fiscal_year.to_string(),
        total_works: parse_or_zero(raw.total_works.as_ref()),
        person_days_generated: parse_or_zero(raw.person_days.as_ref()),
        expenditure: parse_or_zero(raw.total_exp.as_ref()),
        last_updated: now,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellOutcome {
    Unavailable,
    Empty,
    Stored { upserted: usize, rejected: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cells_total: usize,
    pub cells_fetched: usize,
    pub cells_empty: usize,
    pub cells_failed: usize,
    pub records_upserted: usize,
    pub records_rejected: usize,
}

impl RefreshSummary {
    fn record(&mut self, outcome: CellOutcome) {
        match outcome {
            CellOutcome::Unavailable => self.cells_failed += 1,
            CellOutcome::Empty => self.cells_empty += 1,
            CellOutcome::Stored { upserted, rejected } => {
                self.cells_fetched += 1;
                self.records_upserted += upserted;
                self.records_rejected += rejected;
            }
        }
    }
}

/// Drives full refresh passes. Passes never overlap: a second caller waits for the first.
pub struct IngestionPipeline {
    feed: Arc<dyn FeedClient>,
    store: Arc<dyn SnapshotStore>,
    fiscal_years: Vec<String>,
    concurrency: usize,
    refresh_lock: Mutex<()>,
}

impl IngestionPipeline {
    pub fn new(
        feed: Arc<dyn FeedClient>,
        store: Arc<dyn SnapshotStore>,
        fiscal_years: Vec<String>,
    ) -> Self {
        Self {
            feed,
            store,
            fiscal_years,
            concurrency: 1,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Number of cells fetched at once. `1` keeps the pass sequential.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn store(&self) -> Arc<dyn SnapshotStore> {
        Arc::clone(&self.store)
    }

    /// Every (fiscal year, month) cell, fiscal years in configured order, months Apr..Mar.
    pub fn grid(&self) -> Vec<FeedCell> {
        self.fiscal_years
            .iter()
            .flat_map(|year| FiscalMonth::ALL.into_iter().map(move |m| FeedCell::new(year.clone(), m)))
            .collect()
    }

    pub async fn run_full_refresh(&self) -> RefreshSummary {
        let _pass = self.refresh_lock.lock().await;

        let run_id = Uuid::new_v4();
        let grid = self.grid();
        let mut summary = RefreshSummary {
            run_id,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            cells_total: grid.len(),
            cells_fetched: 0,
            cells_empty: 0,
            cells_failed: 0,
            records_upserted: 0,
            records_rejected: 0,
        };
        info!(%run_id, cells = grid.len(), concurrency = self.concurrency, "refresh pass started");

        if self.concurrency <= 1 {
            for cell in &grid {
                let outcome = refresh_cell(self.feed.as_ref(), self.store.as_ref(), run_id, cell).await;
                summary.record(outcome);
            }
        } else {
            let limit = Arc::new(Semaphore::new(self.concurrency));
            let mut tasks = JoinSet::new();
            for cell in grid {
                let feed = Arc::clone(&self.feed);
                let store = Arc::clone(&self.store);
                let limit = Arc::clone(&limit);
                tasks.spawn(async move {
                    let _permit = limit.acquire_owned().await.ok();
                    refresh_cell(feed.as_ref(), store.as_ref(), run_id, &cell).await
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(outcome) => summary.record(outcome),
                    Err(err) => {
                        error!(%run_id, error = %err, "refresh cell task aborted");
                        summary.record(CellOutcome::Unavailable);
                    }
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            %run_id,
            fetched = summary.cells_fetched,
            empty = summary.cells_empty,
            failed = summary.cells_failed,
            upserted = summary.records_upserted,
            rejected = summary.records_rejected,
            "refresh pass finished"
        );
        summary
    }
}

async fn refresh_cell(
    feed: &dyn FeedClient,
    store: &dyn SnapshotStore,
    run_id: Uuid,
    cell: &FeedCell,
) -> CellOutcome {
    let span = info_span!("refresh_cell", %run_id, month = %cell.month, fiscal_year = %cell.fiscal_year);
    async {
        let records = match feed.fetch(run_id, cell).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, timeout = err.is_timeout(), "feed unavailable; skipping cell");
                return CellOutcome::Unavailable;
            }
        };
        if records.is_empty() {
            info!("no data published for cell");
            return CellOutcome::Empty;
        }

        let now = Utc::now();
        let mut upserted = 0usize;
        let mut rejected = 0usize;
        for raw in &records {
            let snapshot = match map_record(raw, cell, now) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(error = %err, district = ?raw.district_name, "rejecting feed record");
                    rejected += 1;
                    continue;
                }
            };
            match store.upsert(&snapshot).await {
                Ok(()) => upserted += 1,
                Err(err) => {
                    warn!(error = %err, "snapshot upsert failed");
                    rejected += 1;
                }
            }
        }
        info!(upserted, rejected, "stored cell records");
        CellOutcome::Stored { upserted, rejected }
    }
    .instrument(span)
    .await
}

/// Postgres when `DATABASE_URL` is configured (migrations applied), in-memory otherwise.
pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn SnapshotStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgSnapshotStore::connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await.context("applying migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; snapshots are kept in memory only");
            Ok(Arc::new(MemorySnapshotStore::new()))
        }
    }
}

/// Feed client selected by configuration: a captured fixture body, or the live resource.
pub fn build_feed_client(config: &SyncConfig) -> Result<Arc<dyn FeedClient>> {
    if let Some(path) = &config.feed_fixture {
        let client = FixtureFeedClient::from_file(path)?;
        info!(path = %path.display(), records = client.len(), "using fixture feed");
        return Ok(Arc::new(client));
    }
    let base_url = config
        .data_api
        .clone()
        .context("DATA_API is not set; cannot reach the feed")?;
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        global_concurrency: config.refresh_concurrency.max(1),
    })?;
    Ok(Arc::new(DataGovFeedClient::new(
        http,
        FeedConfig {
            base_url,
            state_name: config.feed.state_name.clone(),
            limit: config.feed.limit,
        },
    )))
}

pub fn build_pipeline(config: &SyncConfig, store: Arc<dyn SnapshotStore>) -> Result<IngestionPipeline> {
    let feed = build_feed_client(config)?;
    Ok(IngestionPipeline::new(feed, store, config.feed.fiscal_years.clone())
        .with_concurrency(config.refresh_concurrency))
}

pub async fn run_refresh_once_from_env() -> Result<RefreshSummary> {
    let config = SyncConfig::load()?;
    let store = open_store(&config).await?;
    let pipeline = build_pipeline(&config, store)?;
    Ok(pipeline.run_full_refresh().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nrega_feed::{FeedFailure, FeedUnavailable};
    use nrega_storage::{FetchError, StoreError};
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn raw(district: &str, month: &str, year: &str, works: &str) -> RawRecord {
        RawRecord {
            district_name: Some(district.to_string()),
            state_name: Some("UTTAR PRADESH".to_string()),
            month: Some(month.to_string()),
            fin_year: Some(year.to_string()),
            total_works: Some(JsonValue::from(works)),
            person_days: Some(JsonValue::from(100)),
            total_exp: Some(JsonValue::from(12.5)),
        }
    }

    /// Scripted feed: fixed records per cell, failures for selected cells, call log.
    #[derive(Default)]
    struct ScriptedFeed {
        records: HashMap<FeedCell, Vec<RawRecord>>,
        failing: HashSet<FeedCell>,
        calls: StdMutex<Vec<FeedCell>>,
    }

    #[async_trait]
    impl FeedClient for ScriptedFeed {
        async fn fetch(&self, _run_id: Uuid, cell: &FeedCell) -> Result<Vec<RawRecord>, FeedUnavailable> {
            self.calls.lock().unwrap().push(cell.clone());
            if self.failing.contains(cell) {
                return Err(FeedUnavailable::new(
                    cell,
                    FeedFailure::Fetch(FetchError::HttpStatus {
                        status: 504,
                        url: "https://feed.invalid".into(),
                    }),
                ));
            }
            Ok(self.records.get(cell).cloned().unwrap_or_default())
        }
    }

    /// Store that rejects writes for one district and delegates everything else.
    struct FlakyStore {
        inner: MemorySnapshotStore,
        reject_district: String,
    }

    #[async_trait]
    impl SnapshotStore for FlakyStore {
        async fn upsert(&self, snapshot: &PerformanceSnapshot) -> Result<(), StoreError> {
            if snapshot.district_name == self.reject_district {
                return Err(StoreError::WriteFailure {
                    key: snapshot.key(),
                    reason: "unique violation".into(),
                });
            }
            self.inner.upsert(snapshot).await
        }
        async fn find_latest(
            &self,
            district_name: &str,
            month_filter: Option<&str>,
            year_filter: Option<&str>,
        ) -> Result<Option<PerformanceSnapshot>, StoreError> {
            self.inner.find_latest(district_name, month_filter, year_filter).await
        }
        async fn find_all(&self, district_name: &str) -> Result<Vec<PerformanceSnapshot>, StoreError> {
            self.inner.find_all(district_name).await
        }
        async fn distinct_district_names(&self) -> Result<Vec<String>, StoreError> {
            self.inner.distinct_district_names().await
        }
        async fn count_all(&self) -> Result<u64, StoreError> {
            self.inner.count_all().await
        }
        async fn delete_all(&self) -> Result<u64, StoreError> {
            self.inner.delete_all().await
        }
    }

    fn years() -> Vec<String> {
        vec!["2023-2024".to_string(), "2024-2025".to_string()]
    }

    fn cell(year: &str, month: FiscalMonth) -> FeedCell {
        FeedCell::new(year, month)
    }

    /// Stored state with timestamps removed, for comparing passes.
    async fn stored_values(store: &dyn SnapshotStore, districts: &[&str]) -> Vec<(String, String, String, u64, u64, u64)> {
        let mut out = Vec::new();
        for district in districts {
            for s in store.find_all(district).await.unwrap() {
                out.push((
                    s.district_name,
                    s.month,
                    s.fiscal_year,
                    s.total_works as u64,
                    s.person_days_generated as u64,
                    s.expenditure as u64,
                ));
            }
        }
        out.sort();
        out
    }

    #[test]
    fn parse_or_zero_coerces_loose_values() {
        assert_eq!(parse_or_zero(Some(&JsonValue::from(12))), 12.0);
        assert_eq!(parse_or_zero(Some(&JsonValue::from(" 12.5 "))), 12.5);
        assert_eq!(parse_or_zero(Some(&JsonValue::from("1,20,455"))), 120455.0);
        assert_eq!(parse_or_zero(Some(&JsonValue::from("NA"))), 0.0);
        assert_eq!(parse_or_zero(Some(&JsonValue::from("NaN"))), 0.0);
        assert_eq!(parse_or_zero(Some(&JsonValue::from(-4))), 0.0);
        assert_eq!(parse_or_zero(Some(&JsonValue::Null)), 0.0);
        assert_eq!(parse_or_zero(Some(&JsonValue::Bool(true))), 0.0);
        assert_eq!(parse_or_zero(None), 0.0);
    }

    #[test]
    fn map_record_normalizes_identity_fields() {
        let now = Utc::now();
        let mut record = raw("  Agra ", "jan", "2023-2024", "17");
        record.state_name = None;
        let snapshot = map_record(&record, &cell("2023-2024", FiscalMonth::Jan), now).unwrap();
        assert_eq!(snapshot.district_name, "AGRA");
        assert_eq!(snapshot.month, "Jan");
        assert_eq!(snapshot.fiscal_year, "2023-2024");
        assert_eq!(snapshot.state_name, "");
        assert_eq!(snapshot.total_works, 17.0);
        assert_eq!(snapshot.person_days_generated, 100.0);
        assert_eq!(snapshot.expenditure, 12.5);
        assert_eq!(snapshot.last_updated, now);
    }

    #[test]
    fn map_record_falls_back_to_cell_and_rejects_bad_months() {
        let now = Utc::now();
        let target = cell("2024-2025", FiscalMonth::Sep);

        let mut record = raw("BANDA", "", "", "1");
        record.month = None;
        let snapshot = map_record(&record, &target, now).unwrap();
        assert_eq!((snapshot.month.as_str(), snapshot.fiscal_year.as_str()), ("Sep", "2024-2025"));

        let bad_month = raw("BANDA", "September", "2024-2025", "1");
        assert_eq!(
            map_record(&bad_month, &target, now),
            Err(MappingError::InvalidMonth(CoreError::InvalidMonth("September".into())))
        );

        let mut no_district = raw("", "Sep", "2024-2025", "1");
        no_district.district_name = Some("   ".into());
        assert_eq!(map_record(&no_district, &target, now), Err(MappingError::MissingDistrict));
    }

    #[test]
    fn grid_covers_years_by_fiscal_months() {
        let pipeline = IngestionPipeline::new(
            Arc::new(ScriptedFeed::default()),
            Arc::new(MemorySnapshotStore::new()),
            years(),
        );
        let grid = pipeline.grid();
        assert_eq!(grid.len(), 24);
        assert_eq!(grid[0], cell("2023-2024", FiscalMonth::Apr));
        assert_eq!(grid[11], cell("2023-2024", FiscalMonth::Mar));
        assert_eq!(grid[12], cell("2024-2025", FiscalMonth::Apr));
    }

    #[tokio::test]
    async fn unavailable_cell_does_not_stop_later_cells() {
        let mut feed = ScriptedFeed::default();
        feed.failing.insert(cell("2023-2024", FiscalMonth::Apr));
        feed.records.insert(
            cell("2023-2024", FiscalMonth::May),
            vec![raw("AGRA", "May", "2023-2024", "5")],
        );
        feed.records.insert(
            cell("2024-2025", FiscalMonth::Mar),
            vec![raw("AGRA", "Mar", "2024-2025", "9")],
        );
        let feed = Arc::new(feed);
        let store = Arc::new(MemorySnapshotStore::new());
        let pipeline = IngestionPipeline::new(feed.clone(), store.clone(), years());

        let summary = pipeline.run_full_refresh().await;

        assert_eq!(feed.calls.lock().unwrap().len(), 24);
        assert_eq!(summary.cells_total, 24);
        assert_eq!(summary.cells_failed, 1);
        assert_eq!(summary.cells_fetched, 2);
        assert_eq!(summary.cells_empty, 21);
        assert_eq!(summary.records_upserted, 2);
        assert_eq!(store.count_all().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rejected_records_do_not_abort_the_batch() {
        let mut feed = ScriptedFeed::default();
        feed.records.insert(
            cell("2024-2025", FiscalMonth::Apr),
            vec![
                raw("AGRA", "Apr", "2024-2025", "1"),
                raw("BANDA", "Apr", "2024-2025", "2"),
                raw("VARANASI", "Apri", "2024-2025", "3"),
                raw("LUCKNOW", "Apr", "2024-2025", "4"),
            ],
        );
        let store = Arc::new(FlakyStore {
            inner: MemorySnapshotStore::new(),
            reject_district: "BANDA".into(),
        });
        let pipeline = IngestionPipeline::new(Arc::new(feed), store.clone(), years());

        let summary = pipeline.run_full_refresh().await;

        assert_eq!(summary.records_upserted, 2);
        assert_eq!(summary.records_rejected, 2);
        assert_eq!(
            store.distinct_district_names().await.unwrap(),
            vec!["AGRA", "LUCKNOW"]
        );
    }

    #[tokio::test]
    async fn repeated_refresh_leaves_store_unchanged() {
        let mut feed = ScriptedFeed::default();
        feed.records.insert(
            cell("2023-2024", FiscalMonth::Aug),
            vec![raw("AGRA", "Aug", "2023-2024", "10"), raw("BANDA", "Aug", "2023-2024", "3")],
        );
        feed.records.insert(
            cell("2024-2025", FiscalMonth::Jan),
            vec![raw("AGRA", "Jan", "2024-2025", "7")],
        );
        let store = Arc::new(MemorySnapshotStore::new());
        let pipeline = IngestionPipeline::new(Arc::new(feed), store.clone(), years());

        pipeline.run_full_refresh().await;
        let first = stored_values(store.as_ref(), &["AGRA", "BANDA"]).await;
        pipeline.run_full_refresh().await;
        let second = stored_values(store.as_ref(), &["AGRA", "BANDA"]).await;

        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        assert_eq!(store.count_all().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn parallel_refresh_matches_sequential_result() {
        let build_feed = || {
            let mut feed = ScriptedFeed::default();
            feed.failing.insert(cell("2023-2024", FiscalMonth::Oct));
            for month in FiscalMonth::ALL {
                feed.records.insert(
                    cell("2024-2025", month),
                    vec![raw("AGRA", month.as_str(), "2024-2025", "1")],
                );
            }
            Arc::new(feed)
        };

        let sequential = Arc::new(MemorySnapshotStore::new());
        IngestionPipeline::new(build_feed(), sequential.clone(), years())
            .run_full_refresh()
            .await;

        let parallel = Arc::new(MemorySnapshotStore::new());
        let summary = IngestionPipeline::new(build_feed(), parallel.clone(), years())
            .with_concurrency(4)
            .run_full_refresh()
            .await;

        assert_eq!(summary.cells_failed, 1);
        assert_eq!(summary.records_upserted, 12);
        assert_eq!(
            stored_values(sequential.as_ref(), &["AGRA"]).await,
            stored_values(parallel.as_ref(), &["AGRA"]).await
        );
    }

    #[tokio::test]
    async fn overlapping_refreshes_are_serialized() {
        struct SlowFeed {
            active: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait]
        impl FeedClient for SlowFeed {
            async fn fetch(&self, _run_id: Uuid, _cell: &FeedCell) -> Result<Vec<RawRecord>, FeedUnavailable> {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(Vec::new())
            }
        }

        let feed = Arc::new(SlowFeed {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let pipeline = Arc::new(IngestionPipeline::new(
            feed.clone(),
            Arc::new(MemorySnapshotStore::new()),
            years(),
        ));

        let a = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.run_full_refresh().await }
        });
        let b = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.run_full_refresh().await }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert_eq!(a.cells_empty + b.cells_empty, 48);
        assert_eq!(feed.peak.load(Ordering::SeqCst), 1);
        assert!(a.finished_at <= b.started_at || b.finished_at <= a.started_at);
    }

    #[test]
    fn feed_yaml_overrides_feed_settings() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_feed_settings(dir.path()).unwrap(), None);

        std::fs::write(
            dir.path().join("feed.yaml"),
            "state_name: BIHAR\nfiscal_years:\n  - \"2024-2025\"\nlimit: 1000\n",
        )
        .unwrap();
        let mut settings = FeedSettings::default();
        load_feed_settings(dir.path())
            .unwrap()
            .unwrap()
            .apply(&mut settings);
        assert_eq!(settings.state_name, "BIHAR");
        assert_eq!(settings.fiscal_years, vec!["2024-2025"]);
        assert_eq!(settings.limit, Some(1000));
    }

    #[test]
    fn partial_feed_yaml_keeps_environment_values() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("feed.yaml"), "limit: 50\n").unwrap();

        let mut settings = FeedSettings {
            state_name: "BIHAR".to_string(),
            fiscal_years: split_fiscal_years("2021-2022"),
            limit: None,
        };
        let overrides = load_feed_settings(dir.path()).unwrap().unwrap();
        assert_eq!(
            overrides,
            FeedOverrides {
                limit: Some(50),
                ..FeedOverrides::default()
            }
        );
        overrides.apply(&mut settings);

        assert_eq!(settings.state_name, "BIHAR");
        assert_eq!(settings.fiscal_years, vec!["2021-2022"]);
        assert_eq!(settings.limit, Some(50));
    }

    #[test]
    fn huge_safety_net_interval_saturates() {
        assert_eq!(safety_net_interval(Some("18446744073709551615")), Duration::from_secs(u64::MAX));
        assert_eq!(safety_net_interval(Some("0")), Duration::from_secs(60 * 60));
        assert_eq!(safety_net_interval(None), Duration::from_secs(6 * 60 * 60));
    }

    #[test]
    fn fiscal_year_lists_split_on_commas() {
        assert_eq!(
            split_fiscal_years(" 2023-2024, ,2024-2025 "),
            vec!["2023-2024", "2024-2025"]
        );
        assert!(env_truthy("true"));
        assert!(!env_truthy("0"));
    }
}
