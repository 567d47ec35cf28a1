//! Household meter sources: intake directory, UCI archive download, synthetic profile.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, DurationRound, FixedOffset, Timelike, Utc};
use energy_core::{RawTable, SYNTHETIC_PROVIDER};
use energy_storage::{HttpFetcher, RawArchive};
use tracing::{info, warn};

use crate::synthetic::{cell, Noise};
use crate::tabular::{decode_tabular, TabularOptions};
use crate::{AdapterError, DataSource, FetchRequest, SourceTier};

pub const UCI_HEADERS: [&str; 9] = [
    "Date",
    "Time",
    "Global_active_power",
    "Global_reactive_power",
    "Voltage",
    "Global_intensity",
    "Sub_metering_1",
    "Sub_metering_2",
    "Sub_metering_3",
];

const HOUSEHOLD_DELIMITERS: &[u8] = b";,\t";
const HOUSEHOLD_MIN_COLUMNS: usize = 7;

/// Provenance written for rows read from the intake directory.
pub const LOCAL_PROVIDER: &str = "processed_batch";
pub const UCI_PROVIDER: &str = "uci_dataset";

/// First matching file in the intake directory, in configured name order.
#[derive(Debug, Clone)]
pub struct LocalFileSource {
    input_dir: PathBuf,
    file_names: Vec<String>,
}

impl LocalFileSource {
    pub fn new(input_dir: impl Into<PathBuf>, file_names: Vec<String>) -> Self {
        Self {
            input_dir: input_dir.into(),
            file_names,
        }
    }

    pub async fn find_file(&self) -> Option<PathBuf> {
        for name in &self.file_names {
            let path = self.input_dir.join(name);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Some(path);
            }
        }
        None
    }
}

pub async fn load_household_file(path: &Path, provider: &str) -> Result<RawTable, AdapterError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| AdapterError::Message(format!("reading {}: {e}", path.display())))?;
    let options = TabularOptions {
        provider,
        delimiters: HOUSEHOLD_DELIMITERS,
        min_columns: HOUSEHOLD_MIN_COLUMNS,
    };
    let (table, format) = decode_tabular(&bytes, &options)?;
    info!(path = %path.display(), rows = table.len(), ?format, "loaded household file");
    Ok(table.with_origin(path.display().to_string()))
}

#[async_trait]
impl DataSource for LocalFileSource {
    fn name(&self) -> &str {
        "local_files"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Primary
    }

    async fn fetch(&self, _request: &FetchRequest) -> Result<RawTable, AdapterError> {
        let Some(path) = self.find_file().await else {
            return Err(AdapterError::Message(format!(
                "no household file in {}",
                self.input_dir.display()
            )));
        };
        load_household_file(&path, LOCAL_PROVIDER).await
    }
}

/// The public UCI "individual household electric power consumption" zip.
pub struct UciArchiveSource {
    fetcher: Arc<HttpFetcher>,
    url: String,
    archive: Option<RawArchive>,
}

impl UciArchiveSource {
    pub fn new(fetcher: Arc<HttpFetcher>, url: impl Into<String>) -> Self {
        Self {
            fetcher,
            url: url.into(),
            archive: None,
        }
    }

    /// Keep a copy of every downloaded archive under `archive`.
    pub fn with_archive(mut self, archive: RawArchive) -> Self {
        self.archive = Some(archive);
        self
    }
}

#[async_trait]
impl DataSource for UciArchiveSource {
    fn name(&self) -> &str {
        "uci_archive"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Secondary
    }

    async fn fetch(&self, _request: &FetchRequest) -> Result<RawTable, AdapterError> {
        let response = self.fetcher.fetch_bytes("uci", &self.url, &[]).await?;
        if let Some(archive) = &self.archive {
            match archive
                .keep_download(Utc::now(), "uci_household", "zip", &response.body)
                .await
            {
                Ok(kept) => info!(path = %kept.path.display(), already_present = kept.already_present, "kept UCI download"),
                Err(err) => warn!(error = %err, "could not keep UCI download"),
            }
        }
        let options = TabularOptions {
            provider: UCI_PROVIDER,
            delimiters: b";",
            min_columns: HOUSEHOLD_MIN_COLUMNS,
        };
        let (table, _) = decode_tabular(&response.body, &options)?;
        Ok(table.with_origin(response.final_url))
    }
}

/// Minutely household profile in the UCI file layout, local wall-clock time.
#[derive(Debug, Clone)]
pub struct SyntheticHouseholdSource {
    utc_offset: FixedOffset,
    seed: Option<u64>,
}

impl SyntheticHouseholdSource {
    pub fn new(utc_offset: FixedOffset) -> Self {
        Self {
            utc_offset,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn generate(&self, request: &FetchRequest) -> RawTable {
        let mut noise = Noise::new(self.seed);
        let mut table = RawTable::new(
            SYNTHETIC_PROVIDER,
            UCI_HEADERS.iter().map(|h| h.to_string()).collect(),
        )
        .synthetic();

        let step = Duration::minutes(1);
        let mut ts = request
            .range
            .start
            .duration_trunc(step)
            .unwrap_or(request.range.start);
        if ts < request.range.start {
            ts += step;
        }
        while ts <= request.range.end {
            let local = ts.with_timezone(&self.utc_offset);
            let hour = local.hour();
            let base = match hour {
                7..=9 => 2.2,
                18..=22 => 3.0,
                0..=5 => 0.4,
                _ => 1.1,
            };
            let power = (base + noise.gaussian(0.0, 0.3)).clamp(0.08, 10.0);
            let reactive = (power * 0.1 + noise.gaussian(0.0, 0.02)).clamp(0.0, 1.0);
            let voltage = noise.gaussian(240.0, 3.0).clamp(225.0, 252.0);
            let intensity = power * 1000.0 / voltage;
            let kitchen = if (18..=20).contains(&hour) && noise.chance(0.3) {
                noise.uniform(10.0, 38.0)
            } else {
                0.0
            };
            let laundry = if noise.chance(0.1) { noise.uniform(1.0, 20.0) } else { 0.0 };
            let heater = if power > 1.0 { noise.uniform(10.0, 18.0) } else { noise.uniform(0.0, 1.0) };

            table.push_row(vec![
                local.format("%d/%m/%Y").to_string(),
                local.format("%H:%M:%S").to_string(),
                cell(power, 3),
                cell(reactive, 3),
                cell(voltage, 2),
                cell(intensity, 1),
                cell(kitchen.round(), 1),
                cell(laundry.round(), 1),
                cell(heater.round(), 1),
            ]);
            ts += step;
        }
        table
    }
}

#[async_trait]
impl DataSource for SyntheticHouseholdSource {
    fn name(&self) -> &str {
        "synthetic_household"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Synthetic
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawTable, AdapterError> {
        Ok(self.generate(request))
    }
}
