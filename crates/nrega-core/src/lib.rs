//! Core domain model and fiscal-calendar normalization for the MGNREGA harvester.
//!
//! The programme's fiscal year runs April through March, so "chronological" throughout the
//! workspace means ordering by [`FiscalPosition`], never by calendar month.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "nrega-core";

/// Rank given to month tokens outside the fiscal calendar when sorting tolerantly.
pub const UNKNOWN_MONTH_RANK: u16 = 999;

/// Fiscal start year reported for labels that cannot be parsed. Sorts first.
pub const UNKNOWN_FISCAL_YEAR: i64 = i64::MIN;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("invalid month abbreviation `{0}`")]
    InvalidMonth(String),
}

/// The twelve months of the fiscal calendar, declared in fiscal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FiscalMonth {
    Apr,
    May,
    Jun,
    Jul,
    Aug,
    Sep,
    Oct,
    Nov,
    Dec,
    Jan,
    Feb,
    Mar,
}

impl FiscalMonth {
    pub const ALL: [FiscalMonth; 12] = [
        FiscalMonth::Apr,
        FiscalMonth::May,
        FiscalMonth::Jun,
        FiscalMonth::Jul,
        FiscalMonth::Aug,
        FiscalMonth::Sep,
        FiscalMonth::Oct,
        FiscalMonth::Nov,
        FiscalMonth::Dec,
        FiscalMonth::Jan,
        FiscalMonth::Feb,
        FiscalMonth::Mar,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FiscalMonth::Apr => "Apr",
            FiscalMonth::May => "May",
            FiscalMonth::Jun => "Jun",
            FiscalMonth::Jul => "Jul",
            FiscalMonth::Aug => "Aug",
            FiscalMonth::Sep => "Sep",
            FiscalMonth::Oct => "Oct",
            FiscalMonth::Nov => "Nov",
            FiscalMonth::Dec => "Dec",
            FiscalMonth::Jan => "Jan",
            FiscalMonth::Feb => "Feb",
            FiscalMonth::Mar => "Mar",
        }
    }

    /// Position inside the fiscal year, `Apr = 1` through `Mar = 12`.
    pub fn rank(self) -> u16 {
        self as u16 + 1
    }

    /// Jan–Mar fall in the second calendar year of a fiscal range.
    pub fn is_year_end(self) -> bool {
        matches!(self, FiscalMonth::Jan | FiscalMonth::Feb | FiscalMonth::Mar)
    }
}

impl fmt::Display for FiscalMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FiscalMonth {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        FiscalMonth::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(token))
            .ok_or_else(|| CoreError::InvalidMonth(s.to_string()))
    }
}

/// Strict month rank, used where malformed months must be rejected.
pub fn month_rank(month: &str) -> Result<u16, CoreError> {
    month.parse::<FiscalMonth>().map(FiscalMonth::rank)
}

/// Tolerant month rank for read paths: unknown tokens sort last.
pub fn month_rank_or_last(month: &str) -> u16 {
    month_rank(month).unwrap_or(UNKNOWN_MONTH_RANK)
}

fn four_digit_year(s: &str) -> Option<i64> {
    if s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit()) {
        s.parse().ok()
    } else {
        None
    }
}

/// Splits `"2023-2024"` (or `"2023 - 24"`) into its start year and the raw remainder.
fn split_range(label: &str) -> Option<(i64, &str)> {
    let label = label.trim();
    let start = four_digit_year(label.get(..4)?)?;
    let rest = label[4..].trim_start().strip_prefix('-')?;
    Some((start, rest.trim()))
}

/// Start year of a fiscal label; [`UNKNOWN_FISCAL_YEAR`] when the label is malformed.
pub fn fiscal_start_year(label: &str) -> i64 {
    if let Some((start, _)) = split_range(label) {
        return start;
    }
    four_digit_year(label.trim()).unwrap_or(UNKNOWN_FISCAL_YEAR)
}

/// True calendar year of a (month, fiscal label) pair.
///
/// Ranges resolve Jan–Mar to the end year and every other month to the start year. Bare
/// years are already calendar years and pass through; months outside the calendar are
/// treated as start-year months.
pub fn calendar_year(month: &str, label: &str) -> i64 {
    if let Some((start, end)) = split_range(label) {
        let year_end = month.parse::<FiscalMonth>().map(FiscalMonth::is_year_end).unwrap_or(false);
        if !year_end {
            return start;
        }
        return four_digit_year(end).unwrap_or(start + 1);
    }
    four_digit_year(label.trim()).unwrap_or(UNKNOWN_FISCAL_YEAR)
}

/// Year shown in period labels: the start of a range, or the raw label otherwise.
pub fn display_year(label: &str) -> &str {
    let trimmed = label.trim();
    match trimmed.split_once('-') {
        Some((start, _)) => start.trim(),
        None => trimmed,
    }
}

/// Canonical district identifier: trimmed and upper-cased.
pub fn canonical_district_name(name: &str) -> String {
    name.trim().to_uppercase()
}

/// Derived sort key. The derived `Ord` is lexicographic over (start year, month rank).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FiscalPosition {
    pub fiscal_start_year: i64,
    pub month_rank: u16,
}

impl FiscalPosition {
    pub fn of(month: &str, fiscal_year: &str) -> Self {
        Self {
            fiscal_start_year: fiscal_start_year(fiscal_year),
            month_rank: month_rank_or_last(month),
        }
    }
}

/// Uniqueness key of a stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotKey {
    pub district_name: String,
    pub month: String,
    pub fiscal_year: String,
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.district_name, self.month, self.fiscal_year)
    }
}

/// One observation of a district's performance for one month of one fiscal year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSnapshot {
    pub district_name: String,
    pub state_name: String,
    pub month: String,
    pub fiscal_year: String,
    pub total_works: f64,
    pub person_days_generated: f64,
    pub expenditure: f64,
    pub last_updated: DateTime<Utc>,
}

impl PerformanceSnapshot {
    pub fn key(&self) -> SnapshotKey {
        SnapshotKey {
            district_name: self.district_name.clone(),
            month: self.month.clone(),
            fiscal_year: self.fiscal_year.clone(),
        }
    }

    pub fn position(&self) -> FiscalPosition {
        FiscalPosition::of(&self.month, &self.fiscal_year)
    }
}

/// History row: every snapshot sharing a (month, fiscal year) summed into one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedPeriod {
    pub district_name: String,
    pub state_name: String,
    pub month: String,
    pub fiscal_year: String,
    pub total_works: f64,
    pub person_days_generated: f64,
    pub expenditure: f64,
    pub last_updated: DateTime<Utc>,
    pub calendar_year: i64,
    pub label: String,
}
