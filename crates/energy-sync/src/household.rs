use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use energy_adapters::household::{LocalFileSource, SyntheticHouseholdSource, UciArchiveSource};
use energy_adapters::{FetchRequest, HouseholdReconciler, SourceChain};
use energy_core::{Domain, EntityKey, TimeRange};
use energy_storage::{HttpFetcher, RawArchive, UpsertWriter};
use tracing::{info, warn};

use crate::config::PipelineSettings;
use crate::pipeline::{polled, Clip, Collected, DomainPipeline, IngestCore, IngestReport, ValidatedBatch};

const LOCAL_SOURCE: &str = "local_files";

/// Source chains for the three ways household data is requested.
#[derive(Clone)]
pub struct HouseholdChains {
    /// Intake directory, then the UCI download, then synthetic.
    pub batch: SourceChain,
    pub historical: SourceChain,
    pub live: SourceChain,
}

pub struct HouseholdPipeline {
    core: IngestCore,
    chains: HouseholdChains,
    household: EntityKey,
    archive: RawArchive,
    chunk_rows: usize,
    lookback: chrono::Duration,
}

impl HouseholdPipeline {
    pub fn new(
        core: IngestCore,
        chains: HouseholdChains,
        household_id: impl Into<String>,
        archive: RawArchive,
        chunk_rows: usize,
        lookback: chrono::Duration,
    ) -> Self {
        Self {
            core,
            chains,
            household: EntityKey::Household {
                household_id: household_id.into(),
            },
            archive,
            chunk_rows: chunk_rows.max(1),
            lookback,
        }
    }

    pub fn from_settings(
        settings: &PipelineSettings,
        fetcher: Arc<HttpFetcher>,
        writer: UpsertWriter,
        root: &Path,
    ) -> Result<Self> {
        let house = &settings.household;
        let offset = house.utc_offset()?;
        let timeout = settings.ingestion.chain_attempt_timeout();
        let archive = RawArchive::new(root.join(&house.archive_dir));

        let local = Arc::new(LocalFileSource::new(root.join(&house.input_dir), house.file_names.clone()));
        let uci = Arc::new(UciArchiveSource::new(fetcher, house.uci_url.clone()).with_archive(archive.clone()));
        let synthetic = Arc::new(SyntheticHouseholdSource::new(offset));

        let mut batch = SourceChain::new(timeout).with_source(local).with_source(uci.clone());
        let mut historical = SourceChain::new(timeout).with_source(uci);
        let mut live = SourceChain::new(timeout);
        if settings.ingestion.synthetic_fallback {
            batch = batch.with_source(synthetic.clone());
            historical = historical.with_source(synthetic.clone());
            live = live.with_source(synthetic);
        }

        let core = IngestCore::new(
            Arc::new(HouseholdReconciler::new(house.household_id.clone(), offset)),
            writer,
        );
        Ok(Self::new(
            core,
            HouseholdChains {
                batch,
                historical,
                live,
            },
            house.household_id.clone(),
            archive,
            house.chunk_rows,
            chrono::Duration::days(house.lookback_days),
        ))
    }

    fn request(&self, range: TimeRange) -> FetchRequest {
        FetchRequest::for_entity(range, self.household.clone())
    }

    /// Move a fully written intake file out of the way so it is not read twice.
    async fn archive_processed(&self, collected: &Collected, report: &IngestReport) {
        if collected.source.as_deref() != Some(LOCAL_SOURCE) || report.is_failure() {
            return;
        }
        let Some(origin) = &collected.origin else { return };
        match self.archive.archive_processed(Path::new(origin), Utc::now()).await {
            Ok(archived) => info!(from = %origin, to = %archived.archived_path.display(), "archived processed household file"),
            Err(err) => warn!(path = %origin, error = %err, "could not archive processed household file"),
        }
    }
}

#[async_trait]
impl DomainPipeline for HouseholdPipeline {
    fn domain(&self) -> Domain {
        Domain::Household
    }

    fn job_name(&self) -> &'static str {
        "batch_household_processing"
    }

    fn data_source(&self) -> &'static str {
        "UCI Household Files"
    }

    /// Whole intake files are ingested as delivered; the lookback window
    /// only shapes the download and synthetic fallbacks.
    async fn ingest_batch(&self) -> IngestReport {
        let range = TimeRange::trailing(Utc::now(), self.lookback);
        let collected = self.core.collect(&self.chains.batch, &self.request(range), Clip::Keep).await;
        let report = self.core.write(&collected, Some(self.chunk_rows)).await;
        self.archive_processed(&collected, &report).await;
        report
    }

    async fn process_historical(&self, range: TimeRange) -> IngestReport {
        let request = self.request(range);
        let collected = self.core.collect(&self.chains.historical, &request, Clip::ToRange).await;
        self.core.write(&collected, Some(self.chunk_rows)).await
    }

    async fn probe(&self) -> Vec<Collected> {
        let range = TimeRange::trailing(Utc::now(), self.lookback);
        vec![self.core.collect(&self.chains.batch, &self.request(range), Clip::Keep).await]
    }

    async fn poll(&self, window: Duration) -> Result<ValidatedBatch, String> {
        let span = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::minutes(1));
        let request = self.request(TimeRange::trailing(Utc::now(), span));
        let collected = self.core.collect(&self.chains.live, &request, Clip::ToRange).await;
        polled(vec![collected], Domain::Household)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use energy_core::HOUSEHOLD_SCHEMA;
    use energy_storage::{MemoryStore, TimeSeriesStore};

    const FILE: &str = "Date;Time;Global_active_power;Global_reactive_power;Voltage;Global_intensity;Sub_metering_1;Sub_metering_2;Sub_metering_3\n\
16/12/2006;17:24:00;4.216;0.418;234.840;18.400;0.000;1.000;17.000\n\
16/12/2006;17:25:00;5.360;0.436;233.630;23.000;0.000;1.000;16.000\n\
16/12/2006;17:26:00;?;?;?;?;?;?;\n\
16/12/2006;17:27:00;35.0;0.498;233.290;23.000;0.000;2.000;17.000\n";

    fn pipeline(store: &Arc<MemoryStore>, dir: &Path, synthetic: bool) -> HouseholdPipeline {
        let offset = FixedOffset::east_opt(3600).unwrap();
        let timeout = Duration::from_secs(5);
        let local = Arc::new(LocalFileSource::new(dir.join("raw"), vec!["household_power_consumption.txt".into()]));
        let fake = Arc::new(SyntheticHouseholdSource::new(offset).with_seed(9));
        let mut batch = SourceChain::new(timeout).with_source(local);
        let mut live = SourceChain::new(timeout);
        if synthetic {
            batch = batch.with_source(fake.clone());
            live = live.with_source(fake.clone());
        }
        let core = IngestCore::new(
            Arc::new(HouseholdReconciler::new("uci_france_001", offset)),
            UpsertWriter::new(store.clone() as Arc<dyn TimeSeriesStore>, 1000),
        );
        HouseholdPipeline::new(
            core,
            HouseholdChains {
                batch,
                historical: SourceChain::new(timeout).with_source(fake),
                live,
            },
            "uci_france_001",
            RawArchive::new(dir.join("archive")),
            2,
            chrono::Duration::hours(2),
        )
    }

    #[tokio::test]
    async fn intake_file_is_written_in_chunks_and_archived() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("raw")).unwrap();
        let input = dir.path().join("raw/household_power_consumption.txt");
        std::fs::write(&input, FILE).unwrap();
        let store = Arc::new(MemoryStore::new());

        let report = pipeline(&store, dir.path(), true).ingest_batch().await;

        assert_eq!(report.processed, 4);
        assert_eq!(report.written, 3);
        assert_eq!(report.rejected, 1);
        assert!(!report.synthetic);
        assert_eq!(store.append_calls(), 2);
        assert!(!input.exists());
        let archived: Vec<_> = std::fs::read_dir(dir.path().join("archive")).unwrap().collect();
        assert_eq!(archived.len(), 1);

        let rows = store.rows(&HOUSEHOLD_SCHEMA).await;
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn empty_intake_falls_back_to_synthetic() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let report = pipeline(&store, dir.path(), true).ingest_batch().await;
        assert!(report.synthetic);
        assert!(report.written > 100);
        assert_eq!(report.sources, vec!["synthetic_household".to_string()]);
    }

    #[tokio::test]
    async fn without_fallback_an_empty_intake_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&store, dir.path(), false);
        let report = pipeline.ingest_batch().await;
        assert_eq!(report.written, 0);
        assert!(report.failure.is_none());
        assert!(pipeline.poll(Duration::from_secs(60)).await.is_err());
    }

    #[tokio::test]
    async fn failed_write_keeps_the_intake_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("raw")).unwrap();
        let input = dir.path().join("raw/household_power_consumption.txt");
        std::fs::write(&input, FILE).unwrap();
        let store = Arc::new(MemoryStore::new());
        store.set_offline(true);

        let report = pipeline(&store, dir.path(), true).ingest_batch().await;
        assert!(report.is_failure());
        assert!(input.exists());
    }
}
