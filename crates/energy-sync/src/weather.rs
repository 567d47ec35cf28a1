use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use energy_adapters::weather::{OpenMeteoSource, SyntheticWeatherSource};
use energy_adapters::{FetchRequest, SourceChain, WeatherReconciler};
use energy_core::{Domain, EntityKey, TimeRange, WEATHER_SCHEMA};
use energy_storage::{HttpFetcher, StoreError, UpsertWriter};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::config::{PipelineSettings, WeatherSettings};
use crate::gaps::{find_gaps, Gap};
use crate::pipeline::{polled, Clip, Collected, DomainPipeline, IngestCore, IngestReport, ValidatedBatch};

/// Weather is stored hourly.
pub fn weather_step() -> chrono::Duration {
    chrono::Duration::hours(1)
}

#[derive(Debug, Clone, Serialize)]
pub struct GapFillReport {
    pub location_id: String,
    pub gaps: Vec<Gap>,
    pub filled: Vec<Gap>,
    /// Gaps longer than the fill limit; reported, not fetched.
    pub skipped: Vec<Gap>,
    pub ingest: IngestReport,
}

pub struct WeatherPipeline {
    core: IngestCore,
    /// ERA5 archive when old enough, forecast otherwise, then synthetic.
    batch: SourceChain,
    live: SourceChain,
    locations: Vec<EntityKey>,
    lookback: chrono::Duration,
    gap_lookback: chrono::Duration,
    max_gap: chrono::Duration,
    api_delay: Duration,
}

impl WeatherPipeline {
    pub fn new(
        core: IngestCore,
        batch: SourceChain,
        live: SourceChain,
        settings: &WeatherSettings,
        api_delay: Duration,
    ) -> Self {
        let locations = settings
            .locations
            .iter()
            .map(|l| EntityKey::Location {
                location_id: l.location_id.clone(),
                latitude: l.latitude,
                longitude: l.longitude,
            })
            .collect();
        Self {
            core,
            batch,
            live,
            locations,
            lookback: chrono::Duration::hours(settings.lookback_hours),
            gap_lookback: chrono::Duration::days(settings.gap_lookback_days),
            max_gap: chrono::Duration::days(settings.max_gap_days),
            api_delay,
        }
    }

    pub fn from_settings(settings: &PipelineSettings, fetcher: Arc<HttpFetcher>, writer: UpsertWriter) -> Self {
        let weather = &settings.weather;
        let timeout = settings.ingestion.chain_attempt_timeout();
        let forecast = Arc::new(OpenMeteoSource::forecast(fetcher.clone(), weather.forecast_url.clone()));
        let archive = Arc::new(OpenMeteoSource::archive(
            fetcher,
            weather.archive_url.clone(),
            weather.archive_min_age_days,
        ));
        let synthetic = Arc::new(SyntheticWeatherSource::new());

        let mut batch = SourceChain::new(timeout).with_source(archive).with_source(forecast.clone());
        let mut live = SourceChain::new(timeout).with_source(forecast);
        if settings.ingestion.synthetic_fallback {
            batch = batch.with_source(synthetic.clone());
            live = live.with_source(synthetic);
        }
        let core = IngestCore::new(Arc::new(WeatherReconciler), writer);
        Self::new(
            core,
            batch,
            live,
            weather,
            Duration::from_millis(settings.ingestion.weather_api_delay_ms),
        )
    }

    pub fn locations(&self) -> &[EntityKey] {
        &self.locations
    }

    /// One request per location, spaced by the API delay. A write failure
    /// stops the remaining locations.
    async fn run_locations(&self, chain: &SourceChain, range: TimeRange) -> IngestReport {
        let mut report = IngestReport::empty(Domain::Weather);
        for (idx, location) in self.locations.iter().enumerate() {
            if idx > 0 && !self.api_delay.is_zero() {
                tokio::time::sleep(self.api_delay).await;
            }
            let request = FetchRequest::for_entity(range, location.clone());
            let span = info_span!("weather_location", location = %location.id());
            let one = self.core.run(chain, &request, Clip::ToRange).instrument(span).await;
            let stop = one.is_failure();
            report.merge(one);
            if stop {
                break;
            }
        }
        report
    }

    /// Missing hourly points for one location over the trailing `lookback`.
    pub async fn detect_gaps(&self, location: &EntityKey, lookback: chrono::Duration) -> Result<Vec<Gap>, StoreError> {
        let range = TimeRange::trailing(Utc::now(), lookback);
        let expected = range.expected_grid(weather_step());
        let existing = self
            .core
            .writer()
            .store()
            .existing_timestamps(&WEATHER_SCHEMA, location, &range)
            .await?;
        let gaps = find_gaps(&expected, &existing, weather_step());
        info!(location = %location.id(), gaps = gaps.len(), "gap detection finished");
        Ok(gaps)
    }

    /// Detect and refill gaps for every location. Gaps longer than the
    /// configured limit are only reported.
    pub async fn fill_gaps(&self) -> Result<Vec<GapFillReport>, StoreError> {
        let mut reports = Vec::with_capacity(self.locations.len());
        for location in &self.locations {
            let gaps = self.detect_gaps(location, self.gap_lookback).await?;
            let mut fill = GapFillReport {
                location_id: location.id(),
                gaps: gaps.clone(),
                filled: Vec::new(),
                skipped: Vec::new(),
                ingest: IngestReport::empty(Domain::Weather),
            };
            for gap in gaps {
                if gap.span() > self.max_gap {
                    warn!(
                        location = %location.id(),
                        start = %gap.start,
                        hours = gap.span().num_hours(),
                        "gap exceeds fill limit; skipping"
                    );
                    fill.skipped.push(gap);
                    continue;
                }
                if !fill.filled.is_empty() && !self.api_delay.is_zero() {
                    tokio::time::sleep(self.api_delay).await;
                }
                let request = FetchRequest::for_entity(gap.range(), location.clone());
                let one = self.core.run(&self.batch, &request, Clip::ToRange).await;
                let stop = one.is_failure();
                fill.ingest.merge(one);
                fill.filled.push(gap);
                if stop {
                    break;
                }
            }
            let stop = fill.ingest.is_failure();
            reports.push(fill);
            if stop {
                break;
            }
        }
        Ok(reports)
    }
}

#[async_trait]
impl DomainPipeline for WeatherPipeline {
    fn domain(&self) -> Domain {
        Domain::Weather
    }

    fn job_name(&self) -> &'static str {
        "batch_weather_ingestion"
    }

    fn data_source(&self) -> &'static str {
        "Open-Meteo API"
    }

    async fn ingest_batch(&self) -> IngestReport {
        let range = TimeRange::trailing(Utc::now(), self.lookback);
        self.run_locations(&self.batch, range).await
    }

    async fn process_historical(&self, range: TimeRange) -> IngestReport {
        self.run_locations(&self.batch, range).await
    }

    async fn probe(&self) -> Vec<Collected> {
        let range = TimeRange::trailing(Utc::now(), self.lookback);
        let mut out = Vec::with_capacity(self.locations.len());
        for location in &self.locations {
            let request = FetchRequest::for_entity(range, location.clone());
            out.push(self.core.collect(&self.batch, &request, Clip::ToRange).await);
        }
        out
    }

    async fn poll(&self, window: Duration) -> Result<ValidatedBatch, String> {
        let span = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::hours(1));
        let range = TimeRange::trailing(Utc::now(), span);
        let mut collected = Vec::with_capacity(self.locations.len());
        for location in &self.locations {
            let request = FetchRequest::for_entity(range, location.clone());
            collected.push(self.core.collect(&self.live, &request, Clip::ToRange).await);
        }
        polled(collected, Domain::Weather)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocationSettings;
    use chrono::DurationRound;
    use energy_core::WeatherRecord;
    use energy_storage::{MemoryStore, TimeSeriesStore};

    fn settings() -> WeatherSettings {
        WeatherSettings {
            locations: vec![
                LocationSettings {
                    location_id: "paris_fr_001".into(),
                    latitude: 48.8566,
                    longitude: 2.3522,
                },
                LocationSettings {
                    location_id: "berlin_de_001".into(),
                    latitude: 52.52,
                    longitude: 13.405,
                },
            ],
            gap_lookback_days: 2,
            max_gap_days: 1,
            ..WeatherSettings::default()
        }
    }

    fn pipeline(store: &Arc<MemoryStore>) -> WeatherPipeline {
        let synthetic = Arc::new(SyntheticWeatherSource::new().with_seed(4));
        let chain = SourceChain::new(Duration::from_secs(5)).with_source(synthetic);
        let core = IngestCore::new(
            Arc::new(WeatherReconciler),
            UpsertWriter::new(store.clone() as Arc<dyn TimeSeriesStore>, 1000),
        );
        WeatherPipeline::new(core, chain.clone(), chain, &settings(), Duration::ZERO)
    }

    fn record(location: &EntityKey, ts: chrono::DateTime<Utc>) -> WeatherRecord {
        let EntityKey::Location {
            location_id,
            latitude,
            longitude,
        } = location
        else {
            unreachable!()
        };
        WeatherRecord {
            timestamp: ts,
            location_id: location_id.clone(),
            latitude: *latitude,
            longitude: *longitude,
            temperature_2m_c: Some(10.0),
            relative_humidity_2m_pct: None,
            dew_point_2m_c: None,
            apparent_temperature_c: None,
            rain_mm: None,
            shortwave_radiation_w_m2: None,
            cloud_cover_pct: None,
            surface_pressure_hpa: None,
            visibility_m: None,
            wind_speed_10m_kmh: None,
            wind_direction_10m_deg: None,
            wind_gusts_10m_kmh: None,
            data_provider: "Open-Meteo ERA5".into(),
        }
    }

    #[tokio::test]
    async fn batch_ingests_every_location() {
        let store = Arc::new(MemoryStore::new());
        let report = pipeline(&store).ingest_batch().await;
        assert!(report.synthetic);
        assert!(report.failure.is_none());
        // 24h lookback on an hourly grid, two locations
        let rows = store.rows(&WEATHER_SCHEMA).await.len();
        assert!((48..=50).contains(&rows), "{rows}");
        assert_eq!(report.written, rows);
    }

    #[tokio::test]
    async fn short_gaps_are_filled_and_long_ones_skipped() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&store);
        let paris = pipeline.locations()[0].clone();
        let now = Utc::now().duration_trunc(chrono::Duration::hours(1)).unwrap();

        // Paris: complete except a 3-hour hole. Berlin: nothing at all.
        let records: Vec<_> = (0..=48)
            .map(|h| now - chrono::Duration::hours(h))
            .filter(|ts| {
                let age = (now - *ts).num_hours();
                !(10..13).contains(&age)
            })
            .map(|ts| record(&paris, ts))
            .collect();
        pipeline.core.writer().write(&records).await.unwrap();

        let gaps = pipeline.detect_gaps(&paris, chrono::Duration::hours(40)).await.unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].span(), chrono::Duration::hours(3));

        let reports = pipeline.fill_gaps().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].filled.len(), 1);
        assert!(reports[0].skipped.is_empty());
        assert_eq!(reports[0].ingest.written, 3);
        // Berlin's whole window is one gap longer than a day.
        assert_eq!(reports[1].filled.len(), 0);
        assert_eq!(reports[1].skipped.len(), 1);

        let after = pipeline.detect_gaps(&paris, chrono::Duration::hours(40)).await.unwrap();
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn polling_returns_rows_for_each_location() {
        let store = Arc::new(MemoryStore::new());
        let batch = pipeline(&store).poll(Duration::from_secs(3 * 3600)).await.unwrap();
        assert_eq!(batch.domain(), Domain::Weather);
        assert!(batch.len() >= 4);
    }
}
