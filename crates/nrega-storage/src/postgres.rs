use async_trait::async_trait;
use nrega_core::{canonical_district_name, PerformanceSnapshot, SnapshotKey};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use crate::{normalize_filter, SnapshotStore, StoreError};

/// Postgres-backed snapshot store. The key triple is enforced by a unique constraint.
#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("district_snapshots migrations applied");
        Ok(())
    }
}

/// `ILIKE` pattern for a substring match; the escape character is `\`.
fn like_pattern(filter: &str) -> String {
    let mut escaped = String::with_capacity(filter.len() + 2);
    escaped.push('%');
    for c in filter.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn snapshot_from_row(row: &PgRow) -> Result<PerformanceSnapshot, sqlx::Error> {
    Ok(PerformanceSnapshot {
        district_name: row.try_get("district_name")?,
        state_name: row.try_get("state_name")?,
        month: row.try_get("month")?,
        fiscal_year: row.try_get("fiscal_year")?,
        total_works: row.try_get("total_works")?,
        person_days_generated: row.try_get("person_days_generated")?,
        expenditure: row.try_get("expenditure")?,
        last_updated: row.try_get("last_updated")?,
    })
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn upsert(&self, snapshot: &PerformanceSnapshot) -> Result<(), StoreError> {
        let district_name = canonical_district_name(&snapshot.district_name);
        sqlx::query(
            r#"
            INSERT INTO district_snapshots
                (district_name, state_name, month, fiscal_year,
                 total_works, person_days_generated, expenditure, last_updated)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (district_name, month, fiscal_year)
            DO UPDATE SET state_name = EXCLUDED.state_name,
                          total_works = EXCLUDED.total_works,
                          person_days_generated = EXCLUDED.person_days_generated,
                          expenditure = EXCLUDED.expenditure,
                          last_updated = EXCLUDED.last_updated
            "#,
        )
        .bind(&district_name)
        .bind(&snapshot.state_name)
        .bind(&snapshot.month)
        .bind(&snapshot.fiscal_year)
        .bind(snapshot.total_works)
        .bind(snapshot.person_days_generated)
        .bind(snapshot.expenditure)
        .bind(snapshot.last_updated)
        .execute(&self.pool)
        .await
        .map_err(|err| StoreError::WriteFailure {
            key: SnapshotKey {
                district_name: district_name.clone(),
                month: snapshot.month.clone(),
                fiscal_year: snapshot.fiscal_year.clone(),
            },
            reason: err.to_string(),
        })?;
        Ok(())
    }

    async fn find_latest(
        &self,
        district_name: &str,
        month_filter: Option<&str>,
        year_filter: Option<&str>,
    ) -> Result<Option<PerformanceSnapshot>, StoreError> {
        let month_pattern = normalize_filter(month_filter).map(|f| like_pattern(&f));
        let year_pattern = normalize_filter(year_filter).map(|f| like_pattern(&f));

        let row = sqlx::query(
            r#"
            SELECT district_name, state_name, month, fiscal_year,
                   total_works, person_days_generated, expenditure, last_updated
              FROM district_snapshots
             WHERE district_name = $1
               AND ($2::text IS NULL OR month ILIKE $2 ESCAPE '\')
               AND ($3::text IS NULL OR fiscal_year ILIKE $3 ESCAPE '\')
             ORDER BY last_updated DESC
             LIMIT 1
            "#,
        )
        .bind(canonical_district_name(district_name))
        .bind(month_pattern)
        .bind(year_pattern)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(snapshot_from_row).transpose()?)
    }

    async fn find_all(&self, district_name: &str) -> Result<Vec<PerformanceSnapshot>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT district_name, state_name, month, fiscal_year,
                   total_works, person_days_generated, expenditure, last_updated
              FROM district_snapshots
             WHERE district_name = $1
            "#,
        )
        .bind(canonical_district_name(district_name))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(snapshot_from_row(row)?);
        }
        Ok(out)
    }

    async fn distinct_district_names(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT district_name
              FROM district_snapshots
             ORDER BY district_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get("district_name")?);
        }
        Ok(out)
    }

    async fn count_all(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM district_snapshots")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM district_snapshots")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
