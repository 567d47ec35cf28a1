use async_trait::async_trait;
use chrono::{DateTime, Utc};
use energy_core::{ColumnValue, DomainSchema, EntityKey, IngestionJob, JobCompletion, TimeRange};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique key violation: {0}")]
    UniqueViolation(String),
    #[error("store unreachable: {0}")]
    Connectivity(String),
    #[error("statement failed: {0}")]
    Statement(String),
}

impl StoreError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Connectivity(_))
    }
}

/// Relational time-series tables keyed by `(timestamp, entity...)`.
///
/// Rows are positional and follow `DomainSchema::insert_columns`.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Append-only insert of every row inside one transaction, `chunk_size`
    /// rows per statement. A key collision rolls the whole call back.
    async fn append(
        &self,
        schema: &'static DomainSchema,
        rows: &[Vec<ColumnValue>],
        chunk_size: usize,
    ) -> Result<u64, StoreError>;

    /// Single insert-or-update statement for one batch. Keys inside the batch
    /// must be distinct; existing rows get every non-key column replaced and
    /// their ingestion timestamp refreshed.
    async fn upsert(
        &self,
        schema: &'static DomainSchema,
        rows: &[Vec<ColumnValue>],
    ) -> Result<u64, StoreError>;

    /// Stored timestamps for one entity inside `range`, ascending.
    async fn existing_timestamps(
        &self,
        schema: &'static DomainSchema,
        entity: &EntityKey,
        range: &TimeRange,
    ) -> Result<Vec<DateTime<Utc>>, StoreError>;

    async fn count_rows(&self, schema: &'static DomainSchema) -> Result<u64, StoreError>;
}

/// Backing table for ingestion job records.
#[async_trait]
pub trait JobLog: Send + Sync {
    async fn insert_job(
        &self,
        job_name: &str,
        data_source: &str,
        start_time: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Applies the terminal transition only while the job is still running.
    /// Returns `false` when the job was unknown or already finished.
    async fn finish_job(
        &self,
        job_id: i64,
        completion: &JobCompletion,
        end_time: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<IngestionJob>, StoreError>;

    async fn jobs_since(&self, since: DateTime<Utc>) -> Result<Vec<IngestionJob>, StoreError>;

    async fn failed_jobs_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<IngestionJob>, StoreError>;
}
