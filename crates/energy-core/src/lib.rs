//! Core domain model for energy time-series ingestion.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, DurationRound, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod schema;

pub use schema::{
    ColumnDefault, DomainSchema, GridRecord, HouseholdRecord, MeasurementSpec, QualitySpec,
    TimeSeriesRecord, WeatherRecord, GRID_SCHEMA, HOUSEHOLD_SCHEMA, WEATHER_SCHEMA,
};

pub const CRATE_NAME: &str = "energy-core";

/// Provenance label written on rows produced by the synthetic generators.
pub const SYNTHETIC_PROVIDER: &str = "Synthetic Generator";

#[derive(Debug, Error, PartialEq)]
pub enum CoreError {
    #[error("unknown domain `{0}`")]
    UnknownDomain(String),
    #[error("unknown job status `{0}`")]
    UnknownStatus(String),
    #[error("time range start {start} is after end {end}")]
    InvertedRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Household,
    Weather,
    Grid,
}

impl Domain {
    pub const ALL: [Domain; 3] = [Domain::Household, Domain::Weather, Domain::Grid];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Household => "household",
            Domain::Weather => "weather",
            Domain::Grid => "grid",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "household" => Ok(Domain::Household),
            "weather" => Ok(Domain::Weather),
            "grid" => Ok(Domain::Grid),
            other => Err(CoreError::UnknownDomain(other.to_string())),
        }
    }
}

/// Inclusive time window `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, CoreError> {
        if start > end {
            return Err(CoreError::InvertedRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Window of `span` ending at `end`.
    pub fn trailing(end: DateTime<Utc>, span: Duration) -> Self {
        Self {
            start: end - span,
            end,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }

    pub fn span(&self) -> Duration {
        self.end - self.start
    }

    /// Split into consecutive windows of at most `span`; each window starts
    /// one `step` after the previous window's end.
    pub fn chunks(&self, span: Duration, step: Duration) -> Vec<TimeRange> {
        let mut out = Vec::new();
        if span <= Duration::zero() || step <= Duration::zero() {
            out.push(*self);
            return out;
        }
        let mut cursor = self.start;
        while cursor <= self.end {
            let chunk_end = (cursor + span).min(self.end);
            out.push(TimeRange {
                start: cursor,
                end: chunk_end,
            });
            cursor = chunk_end + step;
        }
        out
    }

    /// Regular grid of timestamps inside the window, aligned to whole `step`s.
    pub fn expected_grid(&self, step: Duration) -> Vec<DateTime<Utc>> {
        let mut out = Vec::new();
        if step <= Duration::zero() {
            return out;
        }
        let mut cursor = match self.start.duration_trunc(step) {
            Ok(floor) if floor < self.start => floor + step,
            Ok(floor) => floor,
            Err(_) => self.start,
        };
        while cursor <= self.end {
            out.push(cursor);
            cursor += step;
        }
        out
    }
}

/// Parse the timestamp spellings seen across providers; naive values are UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    const NAIVE_FORMATS: [&str; 7] = [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
        "%d/%m/%Y %H:%M:%S",
        "%d/%m/%Y %H:%M",
        "%Y-%m-%dT%H:%M:%S%.f",
    ];
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    let trimmed = raw.trim_end_matches('Z');
    if trimmed.len() != raw.len() {
        return parse_timestamp(trimmed);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Cell spellings treated as missing values.
pub fn is_missing(cell: &str) -> bool {
    let cell = cell.trim();
    cell.is_empty()
        || cell == "?"
        || cell.eq_ignore_ascii_case("nan")
        || cell.eq_ignore_ascii_case("null")
        || cell.eq_ignore_ascii_case("none")
}

/// Tabular payload exactly as a source produced it, before reconciliation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawTable {
    pub provider: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub synthetic: bool,
    /// File path or URL the payload was read from.
    pub origin: Option<String>,
}

impl RawTable {
    pub fn new(provider: impl Into<String>, headers: Vec<String>) -> Self {
        Self {
            provider: provider.into(),
            headers,
            rows: Vec::new(),
            synthetic: false,
            origin: None,
        }
    }

    pub fn synthetic(mut self) -> Self {
        self.synthetic = true;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn push_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
    }

    /// Cell text, or `None` when absent or spelled as missing.
    pub fn cell(&self, row: usize, col: usize) -> Option<&str> {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .map(|c| c.trim())
            .filter(|c| !is_missing(c))
    }

    pub fn numeric(&self, row: usize, col: usize) -> Option<f64> {
        self.cell(row, col)
            .and_then(|c| c.parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }

    /// Keep only rows whose cell in `col` parses to a timestamp inside `range`.
    /// Rows with unparseable timestamps are kept for the validator to reject.
    pub fn retain_range(&mut self, col: usize, range: &TimeRange) {
        self.rows.retain(|row| {
            match row.get(col).and_then(|c| parse_timestamp(c)) {
                Some(ts) => range.contains(ts),
                None => true,
            }
        });
    }
}

/// Identity of the thing a time series describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityKey {
    Household {
        household_id: String,
    },
    Location {
        location_id: String,
        latitude: f64,
        longitude: f64,
    },
    Region {
        country_code: String,
        region_code: String,
    },
}

impl EntityKey {
    pub fn id(&self) -> String {
        match self {
            EntityKey::Household { household_id } => household_id.clone(),
            EntityKey::Location { location_id, .. } => location_id.clone(),
            EntityKey::Region {
                country_code,
                region_code,
            } => format!("{country_code}/{region_code}"),
        }
    }

    /// Values of the non-timestamp key columns, in key order.
    pub fn key_parts(&self) -> Vec<String> {
        match self {
            EntityKey::Household { household_id } => vec![household_id.clone()],
            EntityKey::Location { location_id, .. } => vec![location_id.clone()],
            EntityKey::Region {
                country_code,
                region_code,
            } => vec![country_code.clone(), region_code.clone()],
        }
    }
}

/// One row after column reconciliation: canonical names, typed values.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRow {
    pub timestamp: Option<DateTime<Utc>>,
    pub entity: EntityKey,
    pub provider: String,
    pub values: BTreeMap<&'static str, Option<f64>>,
}

impl CanonicalRow {
    pub fn new(timestamp: Option<DateTime<Utc>>, entity: EntityKey, provider: impl Into<String>) -> Self {
        Self {
            timestamp,
            entity,
            provider: provider.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn value(&self, column: &str) -> Option<f64> {
        self.values.get(column).copied().flatten()
    }

    pub fn set(&mut self, column: &'static str, value: Option<f64>) {
        self.values.insert(column, value);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalTable {
    pub domain: Domain,
    pub rows: Vec<CanonicalRow>,
    pub synthetic: bool,
}

impl CanonicalTable {
    pub fn new(domain: Domain) -> Self {
        Self {
            domain,
            rows: Vec::new(),
            synthetic: false,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Positional value bound into an insert statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    Timestamp(DateTime<Utc>),
    Text(String),
    Float(Option<f64>),
}

impl ColumnValue {
    /// Stable text form used when a value participates in a key.
    pub fn key_fragment(&self) -> String {
        match self {
            ColumnValue::Timestamp(ts) => ts.to_rfc3339(),
            ColumnValue::Text(s) => s.clone(),
            ColumnValue::Float(Some(v)) => v.to_string(),
            ColumnValue::Float(None) => String::new(),
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ColumnValue::Float(v) => *v,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// The only states a running job may move into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Completed,
    Failed,
}

impl From<TerminalStatus> for JobStatus {
    fn from(value: TerminalStatus) -> Self {
        match value {
            TerminalStatus::Completed => JobStatus::Completed,
            TerminalStatus::Failed => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCompletion {
    pub status: TerminalStatus,
    pub records_processed: i64,
    pub records_inserted: i64,
    /// Share of `records_inserted` written through the insert-or-update
    /// path after a key collision.
    pub records_updated: i64,
    pub records_rejected: i64,
    pub error_message: Option<String>,
}

impl JobCompletion {
    pub fn completed(records_processed: i64, records_inserted: i64) -> Self {
        Self {
            status: TerminalStatus::Completed,
            records_processed,
            records_inserted,
            records_updated: 0,
            records_rejected: 0,
            error_message: None,
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            status: TerminalStatus::Failed,
            records_processed: 0,
            records_inserted: 0,
            records_updated: 0,
            records_rejected: 0,
            error_message: Some(error_message.into()),
        }
    }
}

/// One row of the ingestion log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub id: i64,
    pub job_name: String,
    pub data_source: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub records_processed: i64,
    pub records_inserted: i64,
    pub records_updated: i64,
    pub records_rejected: i64,
    pub error_message: Option<String>,
    pub processing_duration_seconds: Option<f64>,
}

impl IngestionJob {
    pub fn duration_seconds(&self) -> Option<f64> {
        self.processing_duration_seconds.or_else(|| {
            self.end_time
                .map(|end| (end - self.start_time).num_milliseconds() as f64 / 1000.0)
        })
    }
}

/// Aggregates over the jobs started inside a trailing window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatistics {
    pub since: DateTime<Utc>,
    pub total_jobs: usize,
    pub successful_jobs: usize,
    pub failed_jobs: usize,
    pub running_jobs: usize,
    pub success_rate_pct: f64,
    pub total_records_processed: i64,
    pub total_records_inserted: i64,
    pub total_records_rejected: i64,
    pub average_duration_seconds: Option<f64>,
}

impl JobStatistics {
    pub fn from_jobs(since: DateTime<Utc>, jobs: &[IngestionJob]) -> Self {
        let in_window = jobs.iter().filter(|j| j.start_time >= since);
        let mut stats = JobStatistics {
            since,
            total_jobs: 0,
            successful_jobs: 0,
            failed_jobs: 0,
            running_jobs: 0,
            success_rate_pct: 0.0,
            total_records_processed: 0,
            total_records_inserted: 0,
            total_records_rejected: 0,
            average_duration_seconds: None,
        };
        let mut durations = Vec::new();
        for job in in_window {
            stats.total_jobs += 1;
            match job.status {
                JobStatus::Completed => stats.successful_jobs += 1,
                JobStatus::Failed => stats.failed_jobs += 1,
                JobStatus::Running => stats.running_jobs += 1,
            }
            stats.total_records_processed += job.records_processed;
            stats.total_records_inserted += job.records_inserted;
            stats.total_records_rejected += job.records_rejected;
            if let Some(d) = job.duration_seconds() {
                durations.push(d);
            }
        }
        if stats.total_jobs > 0 {
            stats.success_rate_pct =
                stats.successful_jobs as f64 * 100.0 / stats.total_jobs as f64;
        }
        if !durations.is_empty() {
            stats.average_duration_seconds =
                Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, h, 0, 0).single().unwrap()
    }

    #[test]
    fn chunks_step_past_previous_end() {
        let range = TimeRange::new(ts(1, 0), ts(10, 0)).unwrap();
        let chunks = range.chunks(Duration::days(4), Duration::hours(1));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].end, ts(5, 0));
        assert_eq!(chunks[1].start, ts(5, 1));
        assert_eq!(chunks[2].end, ts(10, 0));
    }

    #[test]
    fn expected_grid_aligns_to_whole_hours() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).single().unwrap();
        let range = TimeRange::new(start, ts(1, 3)).unwrap();
        let grid = range.expected_grid(Duration::hours(1));
        assert_eq!(grid, vec![ts(1, 1), ts(1, 2), ts(1, 3)]);
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert!(TimeRange::new(ts(2, 0), ts(1, 0)).is_err());
    }

    #[test]
    fn timestamp_spellings_parse_as_utc() {
        assert_eq!(parse_timestamp("2024-01-01T05:00:00Z"), Some(ts(1, 5)));
        assert_eq!(parse_timestamp("2024-01-01T05:00"), Some(ts(1, 5)));
        assert_eq!(parse_timestamp("2024-01-01 05:00:00"), Some(ts(1, 5)));
        assert_eq!(parse_timestamp("01/01/2024 05:00:00"), Some(ts(1, 5)));
        assert_eq!(parse_timestamp("2024-01-01"), Some(ts(1, 0)));
        assert_eq!(parse_timestamp("?"), None);
    }

    #[test]
    fn raw_cells_treat_question_mark_as_missing() {
        let mut raw = RawTable::new("test", vec!["a".into(), "b".into()]);
        raw.push_row(vec!["?".into(), "1.5".into()]);
        assert_eq!(raw.cell(0, 0), None);
        assert_eq!(raw.numeric(0, 1), Some(1.5));
        assert_eq!(raw.column_index("B"), Some(1));
    }

    #[test]
    fn statistics_count_outcomes_and_durations() {
        let job = |id, status, secs: Option<i64>| IngestionJob {
            id,
            job_name: "batch_weather_ingestion".into(),
            data_source: "Open-Meteo API".into(),
            start_time: ts(2, 0),
            end_time: secs.map(|s| ts(2, 0) + Duration::seconds(s)),
            status,
            records_processed: 10,
            records_inserted: 8,
            records_updated: 0,
            records_rejected: 2,
            error_message: None,
            processing_duration_seconds: None,
        };
        let jobs = vec![
            job(1, JobStatus::Completed, Some(10)),
            job(2, JobStatus::Failed, Some(30)),
            job(3, JobStatus::Running, None),
        ];
        let stats = JobStatistics::from_jobs(ts(1, 0), &jobs);
        assert_eq!(stats.total_jobs, 3);
        assert_eq!(stats.successful_jobs, 1);
        assert_eq!(stats.failed_jobs, 1);
        assert_eq!(stats.running_jobs, 1);
        assert!((stats.success_rate_pct - 33.333).abs() < 0.01);
        assert_eq!(stats.total_records_inserted, 24);
        assert_eq!(stats.average_duration_seconds, Some(20.0));
    }
}
