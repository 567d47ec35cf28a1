//! Validation, per-domain pipelines, job tracking, scheduling and streaming.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use energy_core::{Domain, DomainSchema, IngestionJob, JobStatistics};
use energy_storage::{HttpFetcher, JobLog, PgStore, TimeSeriesStore, UpsertWriter};
use serde::Serialize;
use tracing::{info, warn};

pub mod config;
pub mod gaps;
pub mod grid;
pub mod household;
pub mod jobs;
pub mod orchestrator;
pub mod pipeline;
pub mod streaming;
pub mod validate;
pub mod weather;

pub use config::{PipelineSettings, SyncConfig};
pub use gaps::{find_gaps, Gap};
pub use grid::GridPipeline;
pub use household::{HouseholdChains, HouseholdPipeline};
pub use jobs::JobTracker;
pub use orchestrator::{JobRun, Orchestrator};
pub use pipeline::{ChunkedWrite, Clip, Collected, DomainPipeline, IngestCore, IngestReport, ValidatedBatch};
pub use streaming::{StreamingRunner, StreamingStats};
pub use validate::{validate_table, ValidationReport};
pub use weather::{GapFillReport, WeatherPipeline};

pub const CRATE_NAME: &str = "energy-sync";

/// The three domain pipelines built from one settings file.
#[derive(Clone)]
pub struct Pipelines {
    pub household: Arc<HouseholdPipeline>,
    pub weather: Arc<WeatherPipeline>,
    pub grid: Arc<GridPipeline>,
}

impl Pipelines {
    pub fn from_settings(
        settings: &PipelineSettings,
        fetcher: Arc<HttpFetcher>,
        writer: UpsertWriter,
        root: &Path,
    ) -> Result<Self> {
        Ok(Self {
            household: Arc::new(
                HouseholdPipeline::from_settings(settings, fetcher.clone(), writer.clone(), root)
                    .context("building household pipeline")?,
            ),
            weather: Arc::new(WeatherPipeline::from_settings(settings, fetcher.clone(), writer.clone())),
            grid: Arc::new(GridPipeline::from_settings(settings, fetcher, writer, root)),
        })
    }

    pub fn get(&self, domain: Domain) -> Arc<dyn DomainPipeline> {
        match domain {
            Domain::Household => self.household.clone(),
            Domain::Weather => self.weather.clone(),
            Domain::Grid => self.grid.clone(),
        }
    }

    pub fn all(&self) -> Vec<Arc<dyn DomainPipeline>> {
        Domain::ALL.into_iter().map(|d| self.get(d)).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub store_reachable: bool,
    pub row_counts: BTreeMap<Domain, u64>,
    pub statistics: JobStatistics,
    pub recent_jobs: Vec<IngestionJob>,
    pub failed_jobs: Vec<IngestionJob>,
}

/// Everything a process needs to ingest: store, tracker, pipelines and the
/// orchestrator wired together.
pub struct SyncRuntime {
    pub config: SyncConfig,
    pub settings: PipelineSettings,
    pub store: Arc<dyn TimeSeriesStore>,
    pub writer: UpsertWriter,
    pub tracker: JobTracker,
    pub pipelines: Pipelines,
    pub orchestrator: Arc<Orchestrator>,
}

impl SyncRuntime {
    /// Wire a runtime over any store that also keeps the job log.
    pub fn assemble<S>(config: SyncConfig, settings: PipelineSettings, store: Arc<S>) -> Result<Self>
    where
        S: TimeSeriesStore + JobLog + 'static,
    {
        let fetcher = Arc::new(
            HttpFetcher::new(config.http_client_config(&settings.ingestion))
                .context("building http client")?,
        );
        let series: Arc<dyn TimeSeriesStore> = store.clone();
        let log: Arc<dyn JobLog> = store;
        let writer = UpsertWriter::new(series.clone(), settings.ingestion.batch_size);
        let pipelines = Pipelines::from_settings(&settings, fetcher, writer.clone(), &config.workspace_root)?;
        let tracker = JobTracker::new(log);
        let orchestrator = Orchestrator::new(
            tracker.clone(),
            pipelines.all(),
            settings.schedules.clone(),
            chrono::Duration::days(settings.ingestion.historical_chunk_days.max(1)),
        )
        .with_gap_filler(pipelines.weather.clone());

        Ok(Self {
            config,
            settings,
            store: series,
            writer,
            tracker,
            pipelines,
            orchestrator: Arc::new(orchestrator),
        })
    }

    /// Read the environment and settings file, connect to PostgreSQL.
    pub async fn connect_from_env() -> Result<Self> {
        let config = SyncConfig::from_env();
        let settings = config.load_settings().await?;
        let store = PgStore::connect(&config.database_url, &config.pool_settings(&settings.database))
            .await
            .context("connecting to database")?;
        info!(max_connections = settings.database.max_connections, "database pool ready");
        Self::assemble(config, settings, Arc::new(store))
    }

    pub fn streaming(&self) -> Arc<StreamingRunner> {
        Arc::new(StreamingRunner::for_pipelines(
            &self.pipelines.all(),
            self.writer.clone(),
            &self.settings.streaming,
        ))
    }

    /// Store reachability, table sizes and the job log over `days`.
    pub async fn status(&self, days: i64, recent: usize) -> Result<StatusSnapshot> {
        let store_reachable = match self.store.ping().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "store ping failed");
                false
            }
        };
        let mut row_counts = BTreeMap::new();
        if store_reachable {
            for domain in Domain::ALL {
                let count = self
                    .store
                    .count_rows(DomainSchema::for_domain(domain))
                    .await
                    .with_context(|| format!("counting {domain} rows"))?;
                row_counts.insert(domain, count);
            }
        }
        Ok(StatusSnapshot {
            store_reachable,
            row_counts,
            statistics: self.tracker.job_statistics(days).await.context("job statistics")?,
            recent_jobs: self.tracker.recent_jobs(recent).await.context("recent jobs")?,
            failed_jobs: self.tracker.failed_jobs(days).await.context("failed jobs")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use energy_storage::MemoryStore;

    fn offline_settings() -> PipelineSettings {
        let mut settings = PipelineSettings::default();
        settings.grid.opsd_urls.clear();
        settings
    }

    #[tokio::test]
    async fn assembled_runtime_wires_every_domain() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            workspace_root: dir.path().to_path_buf(),
            ..SyncConfig::from_env()
        };
        let store = Arc::new(MemoryStore::new());
        let runtime = SyncRuntime::assemble(config, offline_settings(), store).unwrap();

        let domains: Vec<_> = runtime.pipelines.all().iter().map(|p| p.domain()).collect();
        assert_eq!(domains, Domain::ALL.to_vec());
        assert_eq!(runtime.orchestrator.pipelines().len(), 3);

        let status = runtime.status(7, 10).await.unwrap();
        assert!(status.store_reachable);
        assert_eq!(status.row_counts[&Domain::Grid], 0);
        assert_eq!(status.statistics.total_jobs, 0);
    }

    #[tokio::test]
    async fn grid_job_without_downloads_uses_the_synthetic_profile() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            workspace_root: dir.path().to_path_buf(),
            ..SyncConfig::from_env()
        };
        let store = Arc::new(MemoryStore::new());
        let runtime = SyncRuntime::assemble(config, offline_settings(), store.clone()).unwrap();

        let run = runtime.orchestrator.run_job(Domain::Grid).await.unwrap();
        assert!(run.report.synthetic);
        assert!(run.report.written > 0);
        let status = runtime.status(1, 5).await.unwrap();
        assert_eq!(status.statistics.successful_jobs, 1);
        assert_eq!(status.row_counts[&Domain::Grid], run.report.written as u64);
    }
}
