use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use nrega_core::{canonical_district_name, PerformanceSnapshot, SnapshotKey};
use tokio::sync::RwLock;

use crate::{matches_filter, normalize_filter, SnapshotStore, StoreError};

/// In-process store used by tests and when no database is configured.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    rows: RwLock<HashMap<SnapshotKey, PerformanceSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn upsert(&self, snapshot: &PerformanceSnapshot) -> Result<(), StoreError> {
        let mut row = snapshot.clone();
        row.district_name = canonical_district_name(&snapshot.district_name);
        self.rows.write().await.insert(row.key(), row);
        Ok(())
    }

    async fn find_latest(
        &self,
        district_name: &str,
        month_filter: Option<&str>,
        year_filter: Option<&str>,
    ) -> Result<Option<PerformanceSnapshot>, StoreError> {
        let district = canonical_district_name(district_name);
        let month = normalize_filter(month_filter);
        let year = normalize_filter(year_filter);
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|s| s.district_name == district)
            .filter(|s| matches_filter(&s.month, month.as_deref()))
            .filter(|s| matches_filter(&s.fiscal_year, year.as_deref()))
            .max_by_key(|s| s.last_updated)
            .cloned())
    }

    async fn find_all(&self, district_name: &str) -> Result<Vec<PerformanceSnapshot>, StoreError> {
        let district = canonical_district_name(district_name);
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|s| s.district_name == district)
            .cloned()
            .collect())
    }

    async fn distinct_district_names(&self) -> Result<Vec<String>, StoreError> {
        let rows = self.rows.read().await;
        let names: BTreeSet<&str> = rows.keys().map(|k| k.district_name.as_str()).collect();
        Ok(names.into_iter().map(ToString::to_string).collect())
    }

    async fn count_all(&self) -> Result<u64, StoreError> {
        Ok(self.rows.read().await.len() as u64)
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let mut rows = self.rows.write().await;
        let removed = rows.len() as u64;
        rows.clear();
        Ok(removed)
    }
}
