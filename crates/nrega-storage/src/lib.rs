//! Snapshot persistence + HTTP fetch utilities for the MGNREGA harvester.

use async_trait::async_trait;
use nrega_core::{PerformanceSnapshot, SnapshotKey};
use thiserror::Error;

mod http;
mod memory;
mod postgres;

pub use http::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher};
pub use memory::MemorySnapshotStore;
pub use postgres::PgSnapshotStore;

pub const CRATE_NAME: &str = "nrega-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("upsert rejected for {key}: {reason}")]
    WriteFailure { key: SnapshotKey, reason: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Keyed store of district performance snapshots.
///
/// The key is `(district_name, month, fiscal_year)`; at most one snapshot exists per key.
/// District names, both stored and queried, are canonicalized (trimmed, upper-cased) by
/// every implementation.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Insert the snapshot, or fully replace the non-key fields of the existing row.
    async fn upsert(&self, snapshot: &PerformanceSnapshot) -> Result<(), StoreError>;

    /// Most recently updated snapshot for the district whose month and fiscal year contain
    /// the given filters, compared case-insensitively.
    async fn find_latest(
        &self,
        district_name: &str,
        month_filter: Option<&str>,
        year_filter: Option<&str>,
    ) -> Result<Option<PerformanceSnapshot>, StoreError>;

    /// Every snapshot of the district, in no particular order.
    async fn find_all(&self, district_name: &str) -> Result<Vec<PerformanceSnapshot>, StoreError>;

    /// Alphabetically ordered, deduplicated district names.
    async fn distinct_district_names(&self) -> Result<Vec<String>, StoreError>;

    async fn count_all(&self) -> Result<u64, StoreError>;

    /// Administrative bulk clear. Returns the number of removed snapshots.
    async fn delete_all(&self) -> Result<u64, StoreError>;
}

/// Empty filters behave like absent ones.
fn normalize_filter(filter: Option<&str>) -> Option<String> {
    filter
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_lowercase)
}

fn matches_filter(value: &str, filter: Option<&str>) -> bool {
    match filter {
        Some(needle) => value.to_lowercase().contains(needle),
        None => true,
    }
}
