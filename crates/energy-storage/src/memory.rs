//! In-process store with the same key and transaction semantics as PostgreSQL.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use energy_core::{
    ColumnValue, DomainSchema, EntityKey, IngestionJob, JobCompletion, JobStatus, TimeRange,
};
use tokio::sync::Mutex;

use crate::store::{JobLog, StoreError, TimeSeriesStore};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub values: Vec<ColumnValue>,
    pub ingestion_timestamp: DateTime<Utc>,
    pub writes: u32,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<&'static str, BTreeMap<String, StoredRow>>>,
    jobs: Mutex<Vec<IngestionJob>>,
    offline: AtomicBool,
    upsert_calls: AtomicUsize,
    append_calls: AtomicUsize,
    failing_upsert_calls: Mutex<HashSet<usize>>,
}

fn row_key(schema: &DomainSchema, row: &[ColumnValue]) -> String {
    row.iter()
        .take(schema.key_columns.len())
        .map(ColumnValue::key_fragment)
        .collect::<Vec<_>>()
        .join("|")
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with a connectivity error while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make the n-th upsert call (0-based, counted over the store's lifetime) fail.
    pub async fn fail_upsert_call(&self, index: usize) {
        self.failing_upsert_calls.lock().await.insert(index);
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    /// Stored rows of one table ordered by key.
    pub async fn rows(&self, schema: &DomainSchema) -> Vec<StoredRow> {
        self.tables
            .lock()
            .await
            .get(schema.table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn jobs(&self) -> Vec<IngestionJob> {
        self.jobs.lock().await.clone()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Connectivity("connection refused".to_string()));
        }
        Ok(())
    }

    fn check_width(schema: &DomainSchema, rows: &[Vec<ColumnValue>]) -> Result<(), StoreError> {
        let width = schema.insert_columns().len();
        match rows.iter().find(|r| r.len() != width) {
            Some(bad) => Err(StoreError::Statement(format!(
                "{} expects {width} values per row, got {}",
                schema.table,
                bad.len()
            ))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_online()
    }

    async fn append(
        &self,
        schema: &'static DomainSchema,
        rows: &[Vec<ColumnValue>],
        _chunk_size: usize,
    ) -> Result<u64, StoreError> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        Self::check_width(schema, rows)?;

        let mut tables = self.tables.lock().await;
        let table = tables.entry(schema.table).or_default();
        let mut seen = HashSet::new();
        for row in rows {
            let key = row_key(schema, row);
            if table.contains_key(&key) || !seen.insert(key.clone()) {
                return Err(StoreError::UniqueViolation(format!(
                    "duplicate key ({key}) in {}",
                    schema.table
                )));
            }
        }

        let now = Utc::now();
        for row in rows {
            table.insert(
                row_key(schema, row),
                StoredRow {
                    values: row.clone(),
                    ingestion_timestamp: now,
                    writes: 1,
                },
            );
        }
        Ok(rows.len() as u64)
    }

    async fn upsert(
        &self,
        schema: &'static DomainSchema,
        rows: &[Vec<ColumnValue>],
    ) -> Result<u64, StoreError> {
        let call = self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        if self.failing_upsert_calls.lock().await.contains(&call) {
            return Err(StoreError::Statement(format!(
                "injected failure for upsert call {call}"
            )));
        }
        Self::check_width(schema, rows)?;

        let mut seen = HashSet::new();
        if rows.iter().any(|row| !seen.insert(row_key(schema, row))) {
            return Err(StoreError::Statement(
                "ON CONFLICT DO UPDATE command cannot affect row a second time".to_string(),
            ));
        }

        let mut tables = self.tables.lock().await;
        let table = tables.entry(schema.table).or_default();
        let now = Utc::now();
        for row in rows {
            let key = row_key(schema, row);
            let writes = table.get(&key).map(|r| r.writes + 1).unwrap_or(1);
            table.insert(
                key,
                StoredRow {
                    values: row.clone(),
                    ingestion_timestamp: now,
                    writes,
                },
            );
        }
        Ok(rows.len() as u64)
    }

    async fn existing_timestamps(
        &self,
        schema: &'static DomainSchema,
        entity: &EntityKey,
        range: &TimeRange,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        self.check_online()?;
        let parts = entity.key_parts();
        let tables = self.tables.lock().await;
        let mut out = tables
            .get(schema.table)
            .map(|table| {
                table
                    .values()
                    .filter(|row| {
                        row.values[1..schema.key_columns.len()]
                            .iter()
                            .map(ColumnValue::key_fragment)
                            .eq(parts.iter().cloned())
                    })
                    .filter_map(|row| match row.values.first() {
                        Some(ColumnValue::Timestamp(ts)) if range.contains(*ts) => Some(*ts),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        out.sort();
        Ok(out)
    }

    async fn count_rows(&self, schema: &'static DomainSchema) -> Result<u64, StoreError> {
        self.check_online()?;
        Ok(self
            .tables
            .lock()
            .await
            .get(schema.table)
            .map(|t| t.len() as u64)
            .unwrap_or(0))
    }
}

#[async_trait]
impl JobLog for MemoryStore {
    async fn insert_job(
        &self,
        job_name: &str,
        data_source: &str,
        start_time: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.check_online()?;
        let mut jobs = self.jobs.lock().await;
        let id = jobs.len() as i64 + 1;
        jobs.push(IngestionJob {
            id,
            job_name: job_name.to_string(),
            data_source: data_source.to_string(),
            start_time,
            end_time: None,
            status: JobStatus::Running,
            records_processed: 0,
            records_inserted: 0,
            records_updated: 0,
            records_rejected: 0,
            error_message: None,
            processing_duration_seconds: None,
        });
        Ok(id)
    }

    async fn finish_job(
        &self,
        job_id: i64,
        completion: &JobCompletion,
        end_time: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check_online()?;
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.status == JobStatus::Running)
        else {
            return Ok(false);
        };
        job.end_time = Some(end_time);
        job.status = completion.status.into();
        job.records_processed = completion.records_processed;
        job.records_inserted = completion.records_inserted;
        job.records_updated = completion.records_updated;
        job.records_rejected = completion.records_rejected;
        job.error_message = completion.error_message.clone();
        job.processing_duration_seconds =
            Some((end_time - job.start_time).num_milliseconds() as f64 / 1000.0);
        Ok(true)
    }

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<IngestionJob>, StoreError> {
        self.check_online()?;
        let mut jobs = self.jobs.lock().await.clone();
        jobs.sort_by(|a, b| b.start_time.cmp(&a.start_time).then(b.id.cmp(&a.id)));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn jobs_since(&self, since: DateTime<Utc>) -> Result<Vec<IngestionJob>, StoreError> {
        let mut jobs = self.recent_jobs(usize::MAX).await?;
        jobs.retain(|j| j.start_time >= since);
        Ok(jobs)
    }

    async fn failed_jobs_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<IngestionJob>, StoreError> {
        let mut jobs = self.jobs_since(since).await?;
        jobs.retain(|j| j.status == JobStatus::Failed);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use energy_core::HOUSEHOLD_SCHEMA;

    fn row(hour: u32, power: f64) -> Vec<ColumnValue> {
        let mut values = vec![
            ColumnValue::Timestamp(Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).single().unwrap()),
            ColumnValue::Text("uci_france_001".into()),
            ColumnValue::Float(Some(power)),
        ];
        values.extend(std::iter::repeat(ColumnValue::Float(None)).take(8));
        values.push(ColumnValue::Text("uci_dataset".into()));
        values
    }

    #[tokio::test]
    async fn append_is_atomic_on_key_collision() {
        let store = MemoryStore::new();
        store
            .append(&HOUSEHOLD_SCHEMA, &[row(0, 1.0)], 100)
            .await
            .expect("first append");
        let err = store
            .append(&HOUSEHOLD_SCHEMA, &[row(1, 2.0), row(0, 3.0)], 100)
            .await
            .expect_err("collision");
        assert!(matches!(err, StoreError::UniqueViolation(_)));
        assert_eq!(store.count_rows(&HOUSEHOLD_SCHEMA).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn upsert_overwrites_in_place() {
        let store = MemoryStore::new();
        store.upsert(&HOUSEHOLD_SCHEMA, &[row(0, 1.0)]).await.unwrap();
        store.upsert(&HOUSEHOLD_SCHEMA, &[row(0, 4.0)]).await.unwrap();
        let rows = store.rows(&HOUSEHOLD_SCHEMA).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values[2], ColumnValue::Float(Some(4.0)));
        assert_eq!(rows[0].writes, 2);
    }

    #[tokio::test]
    async fn finish_only_applies_to_running_jobs() {
        let store = MemoryStore::new();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap();
        let id = store.insert_job("job", "src", start).await.unwrap();
        let end = start + chrono::Duration::seconds(5);
        assert!(store
            .finish_job(id, &JobCompletion::completed(3, 3), end)
            .await
            .unwrap());
        assert!(!store
            .finish_job(id, &JobCompletion::failed("late"), end)
            .await
            .unwrap());
        let jobs = store.jobs().await;
        assert_eq!(jobs[0].status, JobStatus::Completed);
        assert_eq!(jobs[0].processing_duration_seconds, Some(5.0));
    }
}
