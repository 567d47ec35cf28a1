//! Open-Meteo hourly weather (ERA5 archive and forecast) plus a synthetic profile.

use std::f64::consts::PI;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Duration, Timelike, Utc};
use energy_core::{parse_timestamp, EntityKey, RawTable, TimeRange, SYNTHETIC_PROVIDER};
use energy_storage::HttpFetcher;
use serde::Deserialize;
use serde_json::Value;

use crate::synthetic::{cell, Noise};
use crate::{AdapterError, DataSource, FetchRequest, SourceTier};

/// Hourly variables requested from both endpoints.
pub const HOURLY_VARIABLES: [&str; 12] = [
    "temperature_2m",
    "relative_humidity_2m",
    "dew_point_2m",
    "apparent_temperature",
    "rain",
    "shortwave_radiation",
    "wind_speed_10m",
    "wind_direction_10m",
    "wind_gusts_10m",
    "cloud_cover",
    "surface_pressure",
    "visibility",
];

pub const ARCHIVE_PROVIDER: &str = "Open-Meteo ERA5";
pub const FORECAST_PROVIDER: &str = "Open-Meteo Forecast";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMeteoEndpoint {
    /// Reanalysis; only complete for ranges ending some days in the past.
    Archive { min_age_days: i64 },
    Forecast,
}

pub struct OpenMeteoSource {
    fetcher: Arc<HttpFetcher>,
    url: String,
    endpoint: OpenMeteoEndpoint,
}

impl OpenMeteoSource {
    pub fn archive(fetcher: Arc<HttpFetcher>, url: impl Into<String>, min_age_days: i64) -> Self {
        Self {
            fetcher,
            url: url.into(),
            endpoint: OpenMeteoEndpoint::Archive { min_age_days },
        }
    }

    pub fn forecast(fetcher: Arc<HttpFetcher>, url: impl Into<String>) -> Self {
        Self {
            fetcher,
            url: url.into(),
            endpoint: OpenMeteoEndpoint::Forecast,
        }
    }

    fn provider(&self) -> &'static str {
        match self.endpoint {
            OpenMeteoEndpoint::Archive { .. } => ARCHIVE_PROVIDER,
            OpenMeteoEndpoint::Forecast => FORECAST_PROVIDER,
        }
    }

    pub fn query(&self, latitude: f64, longitude: f64, range: &TimeRange) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("latitude", latitude.to_string()),
            ("longitude", longitude.to_string()),
            ("hourly", HOURLY_VARIABLES.join(",")),
            ("start_date", range.start.format("%Y-%m-%d").to_string()),
            ("end_date", range.end.format("%Y-%m-%d").to_string()),
            ("timezone", "UTC".to_string()),
        ];
        if matches!(self.endpoint, OpenMeteoEndpoint::Archive { .. }) {
            query.push(("models", "era5".to_string()));
        }
        query
    }
}

#[async_trait]
impl DataSource for OpenMeteoSource {
    fn name(&self) -> &str {
        match self.endpoint {
            OpenMeteoEndpoint::Archive { .. } => "open_meteo_archive",
            OpenMeteoEndpoint::Forecast => "open_meteo_forecast",
        }
    }

    fn tier(&self) -> SourceTier {
        match self.endpoint {
            OpenMeteoEndpoint::Archive { .. } => SourceTier::Primary,
            OpenMeteoEndpoint::Forecast => SourceTier::Secondary,
        }
    }

    fn supports(&self, request: &FetchRequest) -> bool {
        match self.endpoint {
            OpenMeteoEndpoint::Archive { min_age_days } => {
                request.range.end <= Utc::now() - Duration::days(min_age_days)
            }
            OpenMeteoEndpoint::Forecast => true,
        }
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawTable, AdapterError> {
        let Some(EntityKey::Location {
            latitude,
            longitude,
            ..
        }) = &request.target
        else {
            return Err(AdapterError::Message(
                "weather fetch needs a location".to_string(),
            ));
        };
        let query = self.query(*latitude, *longitude, &request.range);
        let response = self.fetcher.fetch_bytes("open-meteo", &self.url, &query).await?;
        parse_hourly(&response.body, self.provider(), &request.range)
            .map(|t| t.with_origin(response.final_url))
    }
}

#[derive(Debug, Deserialize)]
struct HourlyPayload {
    hourly: serde_json::Map<String, Value>,
}

/// Flatten the `hourly` arrays into a `time`-first table clipped to `range`.
pub fn parse_hourly(body: &[u8], provider: &str, range: &TimeRange) -> Result<RawTable, AdapterError> {
    let payload: HourlyPayload =
        serde_json::from_slice(body).map_err(|e| AdapterError::Parse(e.to_string()))?;
    let times = payload
        .hourly
        .get("time")
        .and_then(Value::as_array)
        .ok_or_else(|| AdapterError::Parse("hourly.time missing".to_string()))?;

    let variables = payload
        .hourly
        .iter()
        .filter(|(name, _)| name.as_str() != "time")
        .filter_map(|(name, values)| values.as_array().map(|v| (name.clone(), v)))
        .collect::<Vec<_>>();

    let mut headers = vec!["time".to_string()];
    headers.extend(variables.iter().map(|(name, _)| name.clone()));
    let mut table = RawTable::new(provider, headers);

    for (idx, time) in times.iter().enumerate() {
        let Some(time) = time.as_str() else { continue };
        if let Some(ts) = parse_timestamp(time) {
            if !range.contains(ts) {
                continue;
            }
        }
        let mut row = Vec::with_capacity(variables.len() + 1);
        row.push(time.to_string());
        for (_, values) in &variables {
            row.push(match values.get(idx) {
                Some(Value::Number(n)) => n.to_string(),
                _ => String::new(),
            });
        }
        table.push_row(row);
    }
    Ok(table)
}

/// Hourly seasonal/diurnal weather in the Open-Meteo column layout.
#[derive(Debug, Clone, Default)]
pub struct SyntheticWeatherSource {
    seed: Option<u64>,
}

impl SyntheticWeatherSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn generate(&self, latitude: f64, range: &TimeRange) -> RawTable {
        let mut noise = Noise::new(self.seed);
        let mut headers = vec!["time".to_string()];
        headers.extend(HOURLY_VARIABLES.iter().map(|v| v.to_string()));
        let mut table = RawTable::new(SYNTHETIC_PROVIDER, headers).synthetic();

        for ts in range.expected_grid(Duration::hours(1)) {
            let day = ts.ordinal() as f64;
            let hour = ts.hour() as f64;
            let seasonal = 8.0 * (2.0 * PI * (day - 200.0) / 365.0).cos();
            let diurnal = 5.0 * (2.0 * PI * (hour - 15.0) / 24.0).cos();
            let temperature = 12.0 - (latitude - 45.0) * 0.5 + seasonal + diurnal + noise.gaussian(0.0, 1.5);
            let humidity = (70.0 - diurnal * 3.0 + noise.gaussian(0.0, 8.0)).clamp(5.0, 100.0);
            let dew_point = temperature - (100.0 - humidity) / 5.0;
            let wind = noise.exponential(12.0).min(120.0);
            let apparent = temperature - wind * 0.1;
            let rain = if noise.chance(0.1) { noise.exponential(1.5) } else { 0.0 };
            let daylight = (6.0..=20.0).contains(&hour);
            let cloud = noise.uniform(0.0, 100.0);
            let radiation = if daylight {
                (800.0 * (PI * (hour - 6.0) / 14.0).sin() * (1.0 - cloud / 150.0)).max(0.0)
            } else {
                0.0
            };

            table.push_row(vec![
                ts.format("%Y-%m-%dT%H:%M").to_string(),
                cell(temperature, 1),
                cell(humidity, 0),
                cell(dew_point, 1),
                cell(apparent, 1),
                cell(rain.min(50.0), 1),
                cell(radiation, 0),
                cell(wind, 1),
                cell(noise.uniform(0.0, 360.0), 0),
                cell((wind * noise.uniform(1.2, 1.8)).min(199.0), 1),
                cell(cloud, 0),
                cell(noise.gaussian(1013.0, 8.0).clamp(950.0, 1050.0), 1),
                cell(noise.uniform(5_000.0, 40_000.0), 0),
            ]);
        }
        table
    }
}

#[async_trait]
impl DataSource for SyntheticWeatherSource {
    fn name(&self) -> &str {
        "synthetic_weather"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Synthetic
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawTable, AdapterError> {
        let latitude = match &request.target {
            Some(EntityKey::Location { latitude, .. }) => *latitude,
            _ => 48.8566,
        };
        Ok(self.generate(latitude, &request.range))
    }
}
