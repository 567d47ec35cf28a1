//! Grid operations: Open Power System Data bulk CSV and a synthetic per-country profile.

use std::f64::consts::PI;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Duration, Timelike, Utc, Weekday};
use energy_core::{RawTable, TimeRange, SYNTHETIC_PROVIDER};
use energy_storage::{HttpFetcher, RawArchive};
use tracing::{info, warn};

use crate::reconcile::GRID_TIMESTAMP_COLUMNS;
use crate::synthetic::{cell, Noise};
use crate::tabular::{decode_tabular, TabularOptions};
use crate::{AdapterError, DataSource, FetchRequest, SourceTier};

pub const OPSD_PROVIDER: &str = "Open Power System Data";

/// One OPSD time-series release (the latest build or a pinned mirror).
pub struct OpsdSource {
    fetcher: Arc<HttpFetcher>,
    url: String,
    tier: SourceTier,
    archive: Option<RawArchive>,
}

impl OpsdSource {
    pub fn new(fetcher: Arc<HttpFetcher>, url: impl Into<String>, tier: SourceTier) -> Self {
        Self {
            fetcher,
            url: url.into(),
            tier,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: RawArchive) -> Self {
        self.archive = Some(archive);
        self
    }
}

/// Decode an OPSD-style CSV and keep the rows inside `range`.
pub fn parse_opsd(bytes: &[u8], range: &TimeRange) -> Result<RawTable, AdapterError> {
    let options = TabularOptions {
        provider: OPSD_PROVIDER,
        delimiters: b",;",
        min_columns: 2,
    };
    let (mut table, format) = decode_tabular(bytes, &options)?;
    let ts_col = GRID_TIMESTAMP_COLUMNS
        .iter()
        .find_map(|c| table.column_index(c))
        .ok_or_else(|| AdapterError::Parse("no timestamp column in OPSD payload".to_string()))?;
    let before = table.len();
    table.retain_range(ts_col, range);
    info!(?format, rows = before, kept = table.len(), "decoded OPSD payload");
    Ok(table)
}

#[async_trait]
impl DataSource for OpsdSource {
    fn name(&self) -> &str {
        match self.tier {
            SourceTier::Primary => "opsd_latest",
            _ => "opsd_mirror",
        }
    }

    fn tier(&self) -> SourceTier {
        self.tier
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawTable, AdapterError> {
        let response = self.fetcher.fetch_bytes("opsd", &self.url, &[]).await?;
        if let Some(archive) = &self.archive {
            if let Err(err) = archive
                .keep_download(Utc::now(), "opsd", "csv", &response.body)
                .await
            {
                warn!(error = %err, "could not keep OPSD download");
            }
        }
        parse_opsd(&response.body, &request.range).map(|t| t.with_origin(response.final_url))
    }
}

/// Hourly load curve and generation mix per country, in OPSD column layout.
#[derive(Debug, Clone)]
pub struct SyntheticGridSource {
    countries: Vec<String>,
    seed: Option<u64>,
}

impl Default for SyntheticGridSource {
    fn default() -> Self {
        Self::new(vec!["FR".into(), "DE".into(), "ES".into()])
    }
}

fn base_load(country: &str) -> f64 {
    match country {
        "FR" => 50_000.0,
        "DE" => 60_000.0,
        "ES" => 35_000.0,
        _ => 30_000.0,
    }
}

const SERIES: [&str; 10] = [
    "load_actual_entsoe_transparency",
    "load_forecast_entsoe_transparency",
    "solar_generation_actual",
    "wind_onshore_generation_actual",
    "wind_offshore_generation_actual",
    "hydro_generation_actual",
    "nuclear_generation_actual",
    "fossil_gas_generation_actual",
    "other_renewable_generation_actual",
    "price_day_ahead",
];

impl SyntheticGridSource {
    pub fn new(countries: Vec<String>) -> Self {
        Self {
            countries: countries.into_iter().map(|c| c.to_ascii_uppercase()).collect(),
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn generate(&self, range: &TimeRange, only: Option<&str>) -> RawTable {
        let mut noise = Noise::new(self.seed);
        let countries = self
            .countries
            .iter()
            .filter(|c| only.map_or(true, |o| c.eq_ignore_ascii_case(o)))
            .cloned()
            .collect::<Vec<_>>();

        let mut headers = vec!["utc_timestamp".to_string()];
        for country in &countries {
            headers.extend(SERIES.iter().map(|s| format!("{country}_{s}")));
        }
        let mut table = RawTable::new(SYNTHETIC_PROVIDER, headers).synthetic();

        for ts in range.expected_grid(Duration::hours(1)) {
            let hour = ts.hour() as f64;
            let weekend = matches!(ts.weekday(), Weekday::Sat | Weekday::Sun);
            let daily = 0.8 + 0.4 * (1.0 + (2.0 * PI * (hour - 19.0) / 24.0).cos());
            let weekly = if weekend { 0.7 } else { 0.9 };

            let mut row = vec![ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()];
            for country in &countries {
                let base = base_load(country);
                let load = (base * daily * weekly + noise.gaussian(0.0, base * 0.05)).max(0.0);
                let forecast = (load * (1.0 + noise.gaussian(0.0, 0.02))).max(0.0);
                let solar = if (6.0..=18.0).contains(&hour) {
                    noise.gaussian(3_000.0, 1_000.0).max(0.0)
                } else {
                    0.0
                };
                let onshore = noise.exponential(8_000.0).min(60_000.0);
                let offshore = noise.exponential(4_000.0).min(30_000.0);
                let hydro = (base * 0.1 + noise.gaussian(0.0, 500.0)).max(0.0);
                let nuclear = (base * 0.7 + noise.gaussian(0.0, 1_000.0)).max(0.0);
                let fossil = (load - (solar + onshore + offshore + hydro + nuclear)).max(0.0);
                let other = noise.gaussian(1_000.0, 300.0).max(0.0);
                let price = noise.gaussian(50.0, 20.0);

                row.extend([
                    cell(load, 1),
                    cell(forecast, 1),
                    cell(solar, 1),
                    cell(onshore, 1),
                    cell(offshore, 1),
                    cell(hydro, 1),
                    cell(nuclear, 1),
                    cell(fossil, 1),
                    cell(other, 1),
                    cell(price, 2),
                ]);
            }
            table.push_row(row);
        }
        table
    }
}

#[async_trait]
impl DataSource for SyntheticGridSource {
    fn name(&self) -> &str {
        "synthetic_grid"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Synthetic
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawTable, AdapterError> {
        let only = match &request.target {
            Some(energy_core::EntityKey::Region { country_code, .. }) => Some(country_code.as_str()),
            _ => None,
        };
        Ok(self.generate(&request.range, only))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{GridReconciler, Reconciler};
    use chrono::TimeZone;

    fn range(hours: i64) -> TimeRange {
        let start = Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).single().unwrap();
        TimeRange::new(start, start + Duration::hours(hours)).unwrap()
    }

    #[test]
    fn opsd_rows_are_clipped_to_the_request() {
        let csv = "utc_timestamp,cet_cest_timestamp,FR_load_actual_entsoe_transparency\n\
                   2020-05-31T23:00:00Z,2020-06-01T01:00:00+0200,48000\n\
                   2020-06-01T00:00:00Z,2020-06-01T02:00:00+0200,47000\n\
                   2020-06-01T01:00:00Z,2020-06-01T03:00:00+0200,46000\n\
                   2020-06-01T05:00:00Z,2020-06-01T07:00:00+0200,52000\n";
        let table = parse_opsd(csv.as_bytes(), &range(2)).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[0][2], "47000");
    }

    #[test]
    fn gzipped_opsd_body_parses_like_plain_csv() {
        use flate2::write::GzEncoder;
        use std::io::Write;

        let csv = "utc_timestamp,FR_load_actual_entsoe_transparency\n\
                   2020-06-01T00:00:00Z,47000\n\
                   2020-06-01T01:00:00Z,46000\n";
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(csv.as_bytes()).unwrap();
        let gz = encoder.finish().unwrap();

        let table = parse_opsd(&gz, &range(2)).unwrap();
        assert_eq!(table, parse_opsd(csv.as_bytes(), &range(2)).unwrap());
        assert_eq!(table.rows[1][1], "46000");
    }

    #[test]
    fn opsd_without_timestamp_column_fails_parse() {
        let err = parse_opsd(b"a,b\n1,2\n", &range(1)).unwrap_err();
        assert!(matches!(err, AdapterError::Parse(_)));
    }

    #[test]
    fn synthetic_grid_reconciles_to_three_countries() {
        let raw = SyntheticGridSource::default().with_seed(5).generate(&range(23), None);
        assert_eq!(raw.len(), 24);
        let out = GridReconciler::default().reconcile(&raw, None).unwrap();
        assert_eq!(out.mapped.len(), 3);
        assert!(out.discarded.is_empty());
        for row in &out.table.rows {
            let total = row.value("total_generation_mw").unwrap();
            let load = row.value("load_actual_mw").unwrap();
            assert!(total >= 0.0);
            assert_eq!(row.value("net_import_export_mw"), Some(total - load));
        }
    }

    #[test]
    fn synthetic_grid_can_target_one_country() {
        let raw = SyntheticGridSource::default().with_seed(5).generate(&range(0), Some("de"));
        assert_eq!(raw.headers.len(), 1 + SERIES.len());
        assert!(raw.headers[1].starts_with("DE_"));
    }
}
