//! Two-tier writer: optimistic bulk append, batched upsert on key conflict.

use std::collections::HashMap;
use std::sync::Arc;

use energy_core::TimeSeriesRecord;
use tracing::{info, info_span, warn, Instrument};

use crate::store::{StoreError, TimeSeriesStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePath {
    Nothing,
    Append,
    Upsert,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub written: usize,
    pub path: WritePath,
    pub duplicates_collapsed: usize,
    pub failed_batches: usize,
}

#[derive(Clone)]
pub struct UpsertWriter {
    store: Arc<dyn TimeSeriesStore>,
    append_chunk: usize,
}

impl UpsertWriter {
    pub fn new(store: Arc<dyn TimeSeriesStore>, append_chunk: usize) -> Self {
        Self {
            store,
            append_chunk: append_chunk.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn TimeSeriesStore> {
        &self.store
    }

    /// Persist `records`; rewriting the same records leaves the table unchanged
    /// apart from refreshed values and ingestion timestamps.
    ///
    /// Only connectivity failures are returned as errors. Any other failed
    /// upsert batch is logged and skipped.
    pub async fn write<R: TimeSeriesRecord>(
        &self,
        records: &[R],
    ) -> Result<WriteOutcome, StoreError> {
        let schema = R::schema();
        let span = info_span!("upsert_write", table = schema.table, records = records.len());
        self.write_inner(records).instrument(span).await
    }

    async fn write_inner<R: TimeSeriesRecord>(
        &self,
        records: &[R],
    ) -> Result<WriteOutcome, StoreError> {
        let schema = R::schema();
        if records.is_empty() {
            return Ok(WriteOutcome {
                written: 0,
                path: WritePath::Nothing,
                duplicates_collapsed: 0,
                failed_batches: 0,
            });
        }

        let rows = collapse_duplicate_keys(records)
            .into_iter()
            .map(|r| r.column_values())
            .collect::<Vec<_>>();
        let duplicates_collapsed = records.len() - rows.len();
        if duplicates_collapsed > 0 {
            warn!(duplicates_collapsed, "batch repeated keys; keeping the last occurrence");
        }

        match self.store.append(schema, &rows, self.append_chunk).await {
            Ok(written) => {
                return Ok(WriteOutcome {
                    written: written as usize,
                    path: WritePath::Append,
                    duplicates_collapsed,
                    failed_batches: 0,
                })
            }
            Err(StoreError::UniqueViolation(detail)) => {
                info!(%detail, "existing keys detected; switching to upsert");
            }
            Err(err @ StoreError::Connectivity(_)) => return Err(err),
            Err(err) => {
                warn!(error = %err, "bulk append failed; retrying as upsert");
            }
        }

        let mut written = 0usize;
        let mut failed_batches = 0usize;
        for (index, batch) in rows.chunks(schema.upsert_batch_size.max(1)).enumerate() {
            match self.store.upsert(schema, batch).await {
                Ok(n) => written += n as usize,
                Err(err @ StoreError::Connectivity(_)) => return Err(err),
                Err(err) => {
                    failed_batches += 1;
                    warn!(batch = index, rows = batch.len(), error = %err, "upsert batch failed");
                }
            }
        }

        Ok(WriteOutcome {
            written,
            path: WritePath::Upsert,
            duplicates_collapsed,
            failed_batches,
        })
    }
}

/// Drop earlier records whose key reappears later, keeping input order otherwise.
fn collapse_duplicate_keys<R: TimeSeriesRecord>(records: &[R]) -> Vec<&R> {
    let mut last_index: HashMap<String, usize> = HashMap::with_capacity(records.len());
    for (i, r) in records.iter().enumerate() {
        last_index.insert(r.key(), i);
    }
    records
        .iter()
        .enumerate()
        .filter(|(i, r)| last_index.get(&r.key()) == Some(i))
        .map(|(_, r)| r)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use chrono::{DateTime, TimeZone, Utc};
    use energy_core::{ColumnValue, GridRecord, GRID_SCHEMA};

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).single().unwrap()
    }

    fn grid(hour: u32, load: f64) -> GridRecord {
        GridRecord {
            timestamp: ts(hour),
            country_code: "FR".into(),
            region_code: "FR".into(),
            load_actual_mw: Some(load),
            load_forecast_mw: Some(0.0),
            solar_generation_actual_mw: Some(0.0),
            wind_onshore_generation_actual_mw: Some(0.0),
            wind_offshore_generation_actual_mw: Some(0.0),
            hydro_generation_actual_mw: Some(0.0),
            nuclear_generation_actual_mw: Some(0.0),
            fossil_generation_actual_mw: Some(0.0),
            other_renewable_generation_mw: Some(0.0),
            total_generation_mw: Some(0.0),
            net_import_export_mw: Some(-load),
            price_day_ahead_eur_mwh: None,
            source: "Open Power System Data".into(),
        }
    }

    fn writer(store: &Arc<MemoryStore>) -> UpsertWriter {
        UpsertWriter::new(store.clone() as Arc<dyn TimeSeriesStore>, 1000)
    }

    #[tokio::test]
    async fn fresh_data_takes_the_append_path() {
        let store = Arc::new(MemoryStore::new());
        let outcome = writer(&store)
            .write(&[grid(0, 50_000.0), grid(1, 51_000.0)])
            .await
            .expect("write");
        assert_eq!(outcome.path, WritePath::Append);
        assert_eq!(outcome.written, 2);
        assert_eq!(store.upsert_calls(), 0);
    }

    #[tokio::test]
    async fn rewriting_the_same_batch_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let w = writer(&store);
        let batch = vec![grid(0, 50_000.0), grid(1, 51_000.0)];
        w.write(&batch).await.expect("first");
        let before = store.rows(&GRID_SCHEMA).await;

        let outcome = w.write(&batch).await.expect("second");
        let after = store.rows(&GRID_SCHEMA).await;

        assert_eq!(outcome.path, WritePath::Upsert);
        assert_eq!(outcome.written, 2);
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.values, a.values);
        }
    }

    #[tokio::test]
    async fn overlapping_batch_updates_values_without_duplicating() {
        let store = Arc::new(MemoryStore::new());
        let w = writer(&store);
        w.write(&[grid(0, 50_000.0), grid(1, 51_000.0)]).await.unwrap();
        w.write(&[grid(1, 52_500.0), grid(2, 53_000.0)]).await.unwrap();

        let rows = store.rows(&GRID_SCHEMA).await;
        assert_eq!(rows.len(), 3);
        let loads = rows
            .iter()
            .map(|r| r.values[3].clone())
            .collect::<Vec<_>>();
        assert_eq!(loads[1], ColumnValue::Float(Some(52_500.0)));
    }

    #[tokio::test]
    async fn repeated_keys_in_one_batch_keep_the_last_value() {
        let store = Arc::new(MemoryStore::new());
        let outcome = writer(&store)
            .write(&[grid(0, 1.0), grid(0, 2.0)])
            .await
            .unwrap();
        assert_eq!(outcome.duplicates_collapsed, 1);
        let rows = store.rows(&GRID_SCHEMA).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values[3], ColumnValue::Float(Some(2.0)));
    }

    #[tokio::test]
    async fn failed_upsert_batch_is_skipped_and_counted() {
        let store = Arc::new(MemoryStore::new());
        let w = writer(&store);
        let batch = (0..24)
            .flat_map(|h| (0..10).map(move |d| (h, d)))
            .map(|(h, d)| {
                let mut r = grid(h, 40_000.0 + d as f64);
                r.timestamp = r.timestamp + chrono::Duration::days(d);
                r
            })
            .collect::<Vec<_>>();
        w.write(&batch).await.unwrap();
        store.fail_upsert_call(0).await;

        let outcome = w.write(&batch).await.unwrap();
        assert_eq!(outcome.failed_batches, 1);
        assert_eq!(outcome.written, batch.len() - GRID_SCHEMA.upsert_batch_size);
        assert_eq!(store.rows(&GRID_SCHEMA).await.len(), batch.len());
    }

    #[tokio::test]
    async fn connectivity_failure_aborts_the_call() {
        let store = Arc::new(MemoryStore::new());
        store.set_offline(true);
        let err = writer(&store)
            .write(&[grid(0, 1.0)])
            .await
            .expect_err("offline");
        assert!(err.is_connectivity());
    }
}
