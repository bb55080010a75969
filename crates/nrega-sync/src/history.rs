//! Reconstructs a district's fiscal-calendar timeline from stored snapshots.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use nrega_core::{
    calendar_year, canonical_district_name, display_year, AggregatedPeriod, FiscalPosition,
    PerformanceSnapshot,
};
use nrega_storage::{SnapshotStore, StoreError};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("no history stored for district {district}")]
    NoHistory { district: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Running totals for one (month, fiscal year) group.
struct PeriodGroup {
    district_name: String,
    state_name: String,
    total_works: f64,
    person_days_generated: f64,
    expenditure: f64,
    last_updated: DateTime<Utc>,
}

impl PeriodGroup {
    fn start(snapshot: &PerformanceSnapshot) -> Self {
        Self {
            district_name: snapshot.district_name.clone(),
            state_name: snapshot.state_name.clone(),
            total_works: 0.0,
            person_days_generated: 0.0,
            expenditure: 0.0,
            last_updated: snapshot.last_updated,
        }
    }

    fn absorb(&mut self, snapshot: &PerformanceSnapshot) {
        self.total_works += snapshot.total_works;
        self.person_days_generated += snapshot.person_days_generated;
        self.expenditure += snapshot.expenditure;
        if snapshot.last_updated >= self.last_updated {
            self.last_updated = snapshot.last_updated;
            self.state_name = snapshot.state_name.clone();
        }
    }
}

pub async fn build_history(
    store: &dyn SnapshotStore,
    district_name: &str,
) -> Result<Vec<AggregatedPeriod>, HistoryError> {
    let snapshots = store.find_all(district_name).await?;
    debug!(district = district_name, snapshots = snapshots.len(), "reconciling history");
    reconcile(district_name, &snapshots)
}

/// Groups snapshots by (month, fiscal year), sums the counters and orders the periods by
/// fiscal position. Ties go to the group updated least recently, then to the group key.
///
/// Duplicate rows for one period are summed rather than rejected; older data may predate
/// the store's uniqueness constraint.
pub fn reconcile(
    district_name: &str,
    snapshots: &[PerformanceSnapshot],
) -> Result<Vec<AggregatedPeriod>, HistoryError> {
    if snapshots.is_empty() {
        return Err(HistoryError::NoHistory {
            district: canonical_district_name(district_name),
        });
    }

    let mut groups: BTreeMap<(&str, &str), PeriodGroup> = BTreeMap::new();
    for snapshot in snapshots {
        groups
            .entry((snapshot.month.as_str(), snapshot.fiscal_year.as_str()))
            .or_insert_with(|| PeriodGroup::start(snapshot))
            .absorb(snapshot);
    }

    let mut ordered: Vec<_> = groups
        .into_iter()
        .map(|((month, fiscal_year), group)| {
            (FiscalPosition::of(month, fiscal_year), month, fiscal_year, group)
        })
        .collect();
    ordered.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then(a.3.last_updated.cmp(&b.3.last_updated))
            .then((a.1, a.2).cmp(&(b.1, b.2)))
    });

    Ok(ordered
        .into_iter()
        .map(|(_, month, fiscal_year, group)| AggregatedPeriod {
            district_name: group.district_name,
            state_name: group.state_name,
            month: month.to_string(),
            fiscal_year: fiscal_year.to_string(),
            total_works: group.total_works,
            person_days_generated: group.person_days_generated,
            expenditure: group.expenditure,
            last_updated: group.last_updated,
            calendar_year: calendar_year(month, fiscal_year),
            label: format!("{} {}", month, display_year(fiscal_year)),
        })
        .collect())
}
