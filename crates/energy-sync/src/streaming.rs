//! Continuous mode: one polling loop per domain feeding a shared buffer that
//! is flushed on size or on a timer, and once more on stop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use energy_core::Domain;
use energy_storage::UpsertWriter;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::StreamingSettings;
use crate::pipeline::{DomainPipeline, ValidatedBatch};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamingStats {
    pub is_running: bool,
    pub buffered_rows: usize,
    pub polls: BTreeMap<Domain, usize>,
    pub received: BTreeMap<Domain, usize>,
    pub written: BTreeMap<Domain, usize>,
    pub poll_errors: usize,
    pub flushes: usize,
    /// Rows the final flush could not write before shutdown.
    pub dropped_rows: usize,
}

#[derive(Default)]
struct StreamState {
    pending: Vec<ValidatedBatch>,
    rows: usize,
    stats: StreamingStats,
}

pub struct StreamingRunner {
    loops: Vec<(Arc<dyn DomainPipeline>, Duration)>,
    writer: UpsertWriter,
    buffer_size: usize,
    flush_interval: Duration,
    error_backoff: Duration,
    state: Mutex<StreamState>,
    /// Serialises flushes so batches of one domain land in arrival order.
    flush_turn: Mutex<()>,
}

impl StreamingRunner {
    pub fn new(writer: UpsertWriter, settings: &StreamingSettings) -> Self {
        Self {
            loops: Vec::new(),
            writer,
            buffer_size: settings.buffer_size.max(1),
            flush_interval: Duration::from_secs(settings.flush_interval_secs.max(1)),
            error_backoff: Duration::from_secs(settings.error_backoff_secs),
            state: Mutex::new(StreamState::default()),
            flush_turn: Mutex::new(()),
        }
    }

    /// Poll every pipeline at the interval configured for its domain.
    pub fn for_pipelines(
        pipelines: &[Arc<dyn DomainPipeline>],
        writer: UpsertWriter,
        settings: &StreamingSettings,
    ) -> Self {
        let mut runner = Self::new(writer, settings);
        for pipeline in pipelines {
            let secs = match pipeline.domain() {
                Domain::Household => settings.household_interval_secs,
                Domain::Weather => settings.weather_interval_secs,
                Domain::Grid => settings.grid_interval_secs,
            };
            runner = runner.with_pipeline(Arc::clone(pipeline), Duration::from_secs(secs.max(1)));
        }
        runner
    }

    pub fn with_pipeline(mut self, pipeline: Arc<dyn DomainPipeline>, interval: Duration) -> Self {
        self.loops.push((pipeline, interval));
        self
    }

    pub fn with_timing(mut self, flush_interval: Duration, error_backoff: Duration) -> Self {
        self.flush_interval = flush_interval;
        self.error_backoff = error_backoff;
        self
    }

    pub async fn stats(&self) -> StreamingStats {
        let state = self.state.lock().await;
        StreamingStats {
            buffered_rows: state.rows,
            ..state.stats.clone()
        }
    }

    /// Run until `stop` flips to true (or its sender goes away), then flush
    /// what is left.
    pub async fn run(self: Arc<Self>, stop: watch::Receiver<bool>) -> StreamingStats {
        self.state.lock().await.stats.is_running = true;
        info!(loops = self.loops.len(), buffer = self.buffer_size, "streaming started");

        let mut tasks = JoinSet::new();
        for (pipeline, interval) in &self.loops {
            tasks.spawn(Arc::clone(&self).domain_loop(Arc::clone(pipeline), *interval, stop.clone()));
        }
        tasks.spawn(Arc::clone(&self).flush_loop(stop.clone()));
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "streaming task ended abnormally");
            }
        }

        self.flush().await;
        let mut state = self.state.lock().await;
        if state.rows > 0 {
            error!(rows = state.rows, "final flush failed; buffered rows are lost");
            state.stats.dropped_rows += state.rows;
            state.pending.clear();
            state.rows = 0;
        }
        state.stats.is_running = false;
        info!("streaming stopped");
        StreamingStats {
            buffered_rows: state.rows,
            ..state.stats.clone()
        }
    }

    async fn domain_loop(
        self: Arc<Self>,
        pipeline: Arc<dyn DomainPipeline>,
        interval: Duration,
        mut stop: watch::Receiver<bool>,
    ) {
        let domain = pipeline.domain();
        loop {
            if *stop.borrow() {
                break;
            }
            let polled = tokio::select! {
                _ = stop.changed() => break,
                polled = pipeline.poll(interval) => polled,
            };
            let wait = match polled {
                Ok(batch) => {
                    debug!(%domain, rows = batch.len(), "polled");
                    if self.push(batch).await {
                        self.flush().await;
                    }
                    interval
                }
                Err(message) => {
                    warn!(%domain, error = %message, backoff_secs = self.error_backoff.as_secs(), "poll failed; backing off");
                    self.state.lock().await.stats.poll_errors += 1;
                    self.error_backoff
                }
            };
            tokio::select! {
                _ = stop.changed() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!(%domain, "polling loop ended");
    }

    async fn flush_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = tokio::time::sleep(self.flush_interval) => {}
            }
            if *stop.borrow() {
                break;
            }
            self.flush().await;
        }
    }

    /// Buffer a polled batch; `true` once the buffer reached its size limit.
    async fn push(&self, batch: ValidatedBatch) -> bool {
        let mut state = self.state.lock().await;
        let domain = batch.domain();
        *state.stats.polls.entry(domain).or_default() += 1;
        if batch.is_empty() {
            return false;
        }
        state.rows += batch.len();
        *state.stats.received.entry(domain).or_default() += batch.len();
        state.pending.push(batch);
        state.rows >= self.buffer_size
    }

    /// Write everything buffered, grouped by domain. Batches that could not
    /// be written go back to the front of the buffer.
    pub async fn flush(&self) -> usize {
        let _turn = self.flush_turn.lock().await;
        let pending = {
            let mut state = self.state.lock().await;
            state.rows = 0;
            std::mem::take(&mut state.pending)
        };
        if pending.is_empty() {
            return 0;
        }

        let mut grouped: BTreeMap<Domain, ValidatedBatch> = BTreeMap::new();
        for batch in pending {
            let domain = batch.domain();
            let slot = grouped
                .entry(domain)
                .or_insert_with(|| ValidatedBatch::empty(domain));
            if let Err(batch) = slot.absorb(batch) {
                warn!(%domain, rows = batch.len(), "batch domain mismatch; dropped");
            }
        }

        let mut written_total = 0;
        let mut unwritten = Vec::new();
        let mut written_by_domain = BTreeMap::new();
        for (domain, batch) in grouped {
            match batch.write(&self.writer).await {
                Ok(outcome) => {
                    written_total += outcome.written;
                    written_by_domain.insert(domain, outcome.written);
                }
                Err(err) => {
                    warn!(%domain, rows = batch.len(), error = %err, "flush failed; keeping rows buffered");
                    unwritten.push(batch);
                }
            }
        }

        let mut state = self.state.lock().await;
        for (domain, n) in written_by_domain {
            *state.stats.written.entry(domain).or_default() += n;
        }
        state.stats.flushes += 1;
        let kept: usize = unwritten.iter().map(ValidatedBatch::len).sum();
        if !unwritten.is_empty() {
            unwritten.append(&mut state.pending);
            state.pending = unwritten;
        }
        state.rows = state.pending.iter().map(ValidatedBatch::len).sum();
        info!(written = written_total, kept, "buffer flushed");
        written_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use energy_core::{GridRecord, TimeRange, GRID_SCHEMA};
    use energy_storage::{MemoryStore, TimeSeriesStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::pipeline::{Collected, IngestReport};

    struct Ticker {
        calls: AtomicUsize,
        rows_per_poll: usize,
        fail: bool,
    }

    fn ts(hour: usize) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap()
            + chrono::Duration::hours(hour as i64)
    }

    fn grid(hour: usize) -> GridRecord {
        GridRecord {
            timestamp: ts(hour),
            country_code: "DE".into(),
            region_code: "DE".into(),
            load_actual_mw: Some(55_000.0),
            load_forecast_mw: Some(0.0),
            solar_generation_actual_mw: Some(0.0),
            wind_onshore_generation_actual_mw: Some(0.0),
            wind_offshore_generation_actual_mw: Some(0.0),
            hydro_generation_actual_mw: Some(0.0),
            nuclear_generation_actual_mw: Some(0.0),
            fossil_generation_actual_mw: Some(0.0),
            other_renewable_generation_mw: Some(0.0),
            total_generation_mw: Some(0.0),
            net_import_export_mw: Some(-55_000.0),
            price_day_ahead_eur_mwh: None,
            source: "Synthetic Generator".into(),
        }
    }

    #[async_trait]
    impl DomainPipeline for Ticker {
        fn domain(&self) -> Domain {
            Domain::Grid
        }

        fn job_name(&self) -> &'static str {
            "batch_grid_ingestion"
        }

        fn data_source(&self) -> &'static str {
            "Open Power System Data"
        }

        async fn ingest_batch(&self) -> IngestReport {
            IngestReport::empty(Domain::Grid)
        }

        async fn process_historical(&self, _range: TimeRange) -> IngestReport {
            IngestReport::empty(Domain::Grid)
        }

        async fn probe(&self) -> Vec<Collected> {
            Vec::new()
        }

        async fn poll(&self, _window: Duration) -> Result<ValidatedBatch, String> {
            if self.fail {
                return Err("opsd_latest: connection reset".into());
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let first = call * self.rows_per_poll;
            Ok(ValidatedBatch::Grid(
                (first..first + self.rows_per_poll).map(grid).collect(),
            ))
        }
    }

    fn runner(store: &Arc<MemoryStore>, buffer_size: usize, ticker: Ticker) -> Arc<StreamingRunner> {
        let settings = StreamingSettings {
            buffer_size,
            ..StreamingSettings::default()
        };
        let writer = UpsertWriter::new(store.clone() as Arc<dyn TimeSeriesStore>, 1000);
        Arc::new(
            StreamingRunner::new(writer, &settings)
                .with_pipeline(Arc::new(ticker), Duration::from_millis(10))
                .with_timing(Duration::from_secs(3600), Duration::from_millis(20)),
        )
    }

    fn ticker(rows_per_poll: usize, fail: bool) -> Ticker {
        Ticker {
            calls: AtomicUsize::new(0),
            rows_per_poll,
            fail,
        }
    }

    #[tokio::test]
    async fn stop_flushes_everything_received() {
        let store = Arc::new(MemoryStore::new());
        let runner = runner(&store, 10_000, ticker(3, false));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&runner).run(rx));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(runner.stats().await.is_running);
        tx.send(true).unwrap();
        let stats = handle.await.unwrap();

        let received = stats.received[&Domain::Grid];
        assert!(received >= 3);
        assert_eq!(stats.written[&Domain::Grid], received);
        assert_eq!(stats.buffered_rows, 0);
        assert_eq!(stats.dropped_rows, 0);
        assert!(!stats.is_running);
        assert_eq!(store.rows(&GRID_SCHEMA).await.len(), received);
    }

    #[tokio::test]
    async fn full_buffer_flushes_before_stop() {
        let store = Arc::new(MemoryStore::new());
        let runner = runner(&store, 4, ticker(5, false));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&runner).run(rx));

        tokio::time::sleep(Duration::from_millis(60)).await;
        let midway = runner.stats().await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(midway.flushes >= 1);
        assert!(midway.written[&Domain::Grid] >= 5);
    }

    #[tokio::test]
    async fn poll_errors_back_off_without_stopping() {
        let store = Arc::new(MemoryStore::new());
        let runner = runner(&store, 10, ticker(1, true));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&runner).run(rx));

        tokio::time::sleep(Duration::from_millis(70)).await;
        tx.send(true).unwrap();
        let stats = handle.await.unwrap();
        assert!(stats.poll_errors >= 2);
        assert!(stats.received.is_empty());
    }

    #[tokio::test]
    async fn failed_flush_keeps_rows_buffered() {
        let store = Arc::new(MemoryStore::new());
        let runner = runner(&store, 10_000, ticker(2, false));
        assert!(!runner.push(ValidatedBatch::Grid(vec![grid(0), grid(1)])).await);

        store.set_offline(true);
        assert_eq!(runner.flush().await, 0);
        assert_eq!(runner.stats().await.buffered_rows, 2);

        store.set_offline(false);
        assert_eq!(runner.flush().await, 2);
        assert_eq!(runner.stats().await.buffered_rows, 0);
    }

    #[tokio::test]
    async fn failed_final_flush_counts_dropped_rows() {
        let store = Arc::new(MemoryStore::new());
        let runner = runner(&store, 10_000, ticker(2, false));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&runner).run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.set_offline(true);
        tx.send(true).unwrap();
        let stats = handle.await.unwrap();

        assert!(stats.dropped_rows >= 2);
        assert_eq!(stats.dropped_rows, stats.received[&Domain::Grid]);
        assert_eq!(stats.buffered_rows, 0);
        assert!(stats.written.is_empty());
    }
}
