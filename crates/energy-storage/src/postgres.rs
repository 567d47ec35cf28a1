//! PostgreSQL implementation of the store and job log.

use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use energy_core::{
    ColumnValue, DomainSchema, EntityKey, IngestionJob, JobCompletion, JobStatus, TimeRange,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, warn};

use crate::store::{JobLog, StoreError, TimeSeriesStore};

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, settings: &PoolSettings) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections.max(1))
            .min_connections(settings.min_connections.min(settings.max_connections))
            .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
            .connect(database_url)
            .await
            .map_err(map_sqlx)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn map_sqlx(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::UniqueViolation(db.message().to_string())
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Connectivity(err.to_string()),
        _ => StoreError::Statement(err.to_string()),
    }
}

fn insert_builder(schema: &DomainSchema) -> QueryBuilder<'static, Postgres> {
    QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        schema.table,
        schema.insert_columns().join(", ")
    ))
}

fn push_rows(builder: &mut QueryBuilder<'static, Postgres>, rows: &[Vec<ColumnValue>]) {
    builder.push_values(rows, |mut b, row| {
        for value in row {
            match value {
                ColumnValue::Timestamp(ts) => {
                    b.push_bind(*ts);
                }
                ColumnValue::Text(text) => {
                    b.push_bind(text.clone());
                }
                ColumnValue::Float(v) => {
                    b.push_bind(*v);
                }
            }
        }
    });
}

fn upsert_clause(schema: &DomainSchema) -> String {
    let assignments = schema
        .update_columns()
        .into_iter()
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .chain(std::iter::once("ingestion_timestamp = NOW()".to_string()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        " ON CONFLICT ({}) DO UPDATE SET {}",
        schema.key_columns.join(", "),
        assignments
    )
}

fn job_from_row(row: &PgRow) -> Result<IngestionJob, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status).map_err(|e| sqlx::Error::ColumnDecode {
        index: "status".to_string(),
        source: Box::new(e),
    })?;
    Ok(IngestionJob {
        id: row.try_get("id")?,
        job_name: row.try_get("job_name")?,
        data_source: row.try_get("data_source")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        status,
        records_processed: row.try_get("records_processed")?,
        records_inserted: row.try_get("records_inserted")?,
        records_updated: row.try_get("records_updated")?,
        records_rejected: row.try_get("records_rejected")?,
        error_message: row.try_get("error_message")?,
        processing_duration_seconds: row.try_get("processing_duration_seconds")?,
    })
}

const JOB_COLUMNS: &str = "id, job_name, data_source, start_time, end_time, status, \
    records_processed, records_inserted, records_updated, records_rejected, error_message, \
    processing_duration_seconds";

#[async_trait]
impl TimeSeriesStore for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn append(
        &self,
        schema: &'static DomainSchema,
        rows: &[Vec<ColumnValue>],
        chunk_size: usize,
    ) -> Result<u64, StoreError> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let mut written = 0u64;
        for chunk in rows.chunks(chunk_size.max(1)) {
            let mut builder = insert_builder(schema);
            push_rows(&mut builder, chunk);
            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
            written += result.rows_affected();
        }
        tx.commit().await.map_err(map_sqlx)?;

        let elapsed = started.elapsed();
        if elapsed.as_millis() > 1000 {
            warn!(
                table = schema.table,
                rows = rows.len(),
                duration_ms = elapsed.as_millis() as u64,
                "slow bulk append"
            );
        }
        Ok(written)
    }

    async fn upsert(
        &self,
        schema: &'static DomainSchema,
        rows: &[Vec<ColumnValue>],
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut builder = insert_builder(schema);
        push_rows(&mut builder, rows);
        builder.push(upsert_clause(schema));
        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        debug!(table = schema.table, rows = rows.len(), "upsert batch applied");
        Ok(result.rows_affected())
    }

    async fn existing_timestamps(
        &self,
        schema: &'static DomainSchema,
        entity: &EntityKey,
        range: &TimeRange,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let mut builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("SELECT timestamp FROM {} WHERE ", schema.table));
        for (column, value) in schema.key_columns[1..].iter().zip(entity.key_parts()) {
            builder.push(format!("{column} = "));
            builder.push_bind(value);
            builder.push(" AND ");
        }
        builder.push("timestamp BETWEEN ");
        builder.push_bind(range.start);
        builder.push(" AND ");
        builder.push_bind(range.end);
        builder.push(" ORDER BY timestamp");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter()
            .map(|row| row.try_get::<DateTime<Utc>, _>("timestamp"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_sqlx)
    }

    async fn count_rows(&self, schema: &'static DomainSchema) -> Result<u64, StoreError> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", schema.table))
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let n: i64 = row.try_get("n").map_err(map_sqlx)?;
        Ok(n.max(0) as u64)
    }
}

#[async_trait]
impl JobLog for PgStore {
    async fn insert_job(
        &self,
        job_name: &str,
        data_source: &str,
        start_time: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO metadata.ingestion_log (job_name, data_source, start_time, status)
            VALUES ($1, $2, $3, 'running')
            RETURNING id
            "#,
        )
        .bind(job_name)
        .bind(data_source)
        .bind(start_time)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.try_get::<i64, _>("id").map_err(map_sqlx)
    }

    async fn finish_job(
        &self,
        job_id: i64,
        completion: &JobCompletion,
        end_time: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let status: JobStatus = completion.status.into();
        let result = sqlx::query(
            r#"
            UPDATE metadata.ingestion_log
               SET end_time = $2,
                   status = $3,
                   records_processed = $4,
                   records_inserted = $5,
                   records_rejected = $6,
                   error_message = $7,
                   records_updated = $8,
                   processing_duration_seconds = EXTRACT(EPOCH FROM ($2 - start_time))::DOUBLE PRECISION
             WHERE id = $1
               AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(end_time)
        .bind(status.as_str())
        .bind(completion.records_processed)
        .bind(completion.records_inserted)
        .bind(completion.records_rejected)
        .bind(completion.error_message.as_deref())
        .bind(completion.records_updated)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<IngestionJob>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM metadata.ingestion_log ORDER BY start_time DESC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_sqlx)
    }

    async fn jobs_since(&self, since: DateTime<Utc>) -> Result<Vec<IngestionJob>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM metadata.ingestion_log WHERE start_time >= $1 ORDER BY start_time DESC"
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_sqlx)
    }

    async fn failed_jobs_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<IngestionJob>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM metadata.ingestion_log \
             WHERE status = 'failed' AND start_time >= $1 ORDER BY start_time DESC"
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_sqlx)
    }
}
