//! Static per-domain table layouts and the typed records written into them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CanonicalRow, ColumnValue, Domain, EntityKey};

/// Value given to a canonical column no source column mapped onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnDefault {
    Null,
    Zero,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementSpec {
    pub name: &'static str,
    pub range: Option<(f64, f64)>,
    pub default: ColumnDefault,
    pub derived: bool,
}

impl MeasurementSpec {
    pub fn in_range(&self, value: f64) -> bool {
        match self.range {
            Some((min, max)) => value >= min && value <= max,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualitySpec {
    pub column: &'static str,
    pub required: &'static [&'static str],
}

#[derive(Debug, PartialEq)]
pub struct DomainSchema {
    pub domain: Domain,
    pub table: &'static str,
    pub key_columns: &'static [&'static str],
    pub attribute_columns: &'static [&'static str],
    pub measurements: &'static [MeasurementSpec],
    pub quality: Option<QualitySpec>,
    pub provenance_column: &'static str,
    pub upsert_batch_size: usize,
}

impl DomainSchema {
    pub fn for_domain(domain: Domain) -> &'static DomainSchema {
        match domain {
            Domain::Household => &HOUSEHOLD_SCHEMA,
            Domain::Weather => &WEATHER_SCHEMA,
            Domain::Grid => &GRID_SCHEMA,
        }
    }

    /// Column after `timestamp` that names the entity.
    pub fn entity_column(&self) -> &'static str {
        self.key_columns.get(1).copied().unwrap_or("timestamp")
    }

    pub fn measurement(&self, name: &str) -> Option<&MeasurementSpec> {
        self.measurements.iter().find(|m| m.name == name)
    }

    pub fn measurement_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.measurements.iter().map(|m| m.name)
    }

    /// Insert column order; `TimeSeriesRecord::column_values` follows it.
    pub fn insert_columns(&self) -> Vec<&'static str> {
        let mut cols: Vec<&'static str> = Vec::new();
        cols.extend_from_slice(self.key_columns);
        cols.extend_from_slice(self.attribute_columns);
        cols.extend(self.measurement_names());
        if let Some(quality) = &self.quality {
            cols.push(quality.column);
        }
        cols.push(self.provenance_column);
        cols
    }

    pub fn update_columns(&self) -> Vec<&'static str> {
        self.insert_columns()
            .into_iter()
            .filter(|c| !self.key_columns.contains(c))
            .collect()
    }
}

const fn measured(name: &'static str, min: f64, max: f64) -> MeasurementSpec {
    MeasurementSpec {
        name,
        range: Some((min, max)),
        default: ColumnDefault::Null,
        derived: false,
    }
}

const fn power(name: &'static str) -> MeasurementSpec {
    MeasurementSpec {
        name,
        range: Some((0.0, 200_000.0)),
        default: ColumnDefault::Zero,
        derived: false,
    }
}

pub static HOUSEHOLD_SCHEMA: DomainSchema = DomainSchema {
    domain: Domain::Household,
    table: "household.consumption",
    key_columns: &["timestamp", "household_id"],
    attribute_columns: &[],
    measurements: &[
        measured("global_active_power", 0.0, 20.0),
        measured("global_reactive_power", 0.0, 10.0),
        measured("voltage", 200.0, 260.0),
        measured("global_intensity", 0.0, 100.0),
        measured("sub_metering_1", 0.0, 1000.0),
        measured("sub_metering_2", 0.0, 1000.0),
        measured("sub_metering_3", 0.0, 1000.0),
        MeasurementSpec {
            name: "calculated_other_consumption",
            range: None,
            default: ColumnDefault::Null,
            derived: true,
        },
    ],
    quality: Some(QualitySpec {
        column: "data_quality_score",
        required: &["global_active_power", "voltage", "global_intensity"],
    }),
    provenance_column: "source_file",
    upsert_batch_size: 100,
};

pub static WEATHER_SCHEMA: DomainSchema = DomainSchema {
    domain: Domain::Weather,
    table: "weather.observations",
    key_columns: &["timestamp", "location_id"],
    attribute_columns: &["latitude", "longitude"],
    measurements: &[
        measured("temperature_2m_c", -50.0, 60.0),
        measured("relative_humidity_2m_pct", 0.0, 100.0),
        measured("dew_point_2m_c", -50.0, 60.0),
        measured("apparent_temperature_c", -50.0, 60.0),
        measured("rain_mm", 0.0, 200.0),
        measured("shortwave_radiation_w_m2", 0.0, 1500.0),
        measured("cloud_cover_pct", 0.0, 100.0),
        measured("surface_pressure_hpa", 800.0, 1100.0),
        measured("visibility_m", 0.0, 50_000.0),
        measured("wind_speed_10m_kmh", 0.0, 200.0),
        measured("wind_direction_10m_deg", 0.0, 360.0),
        measured("wind_gusts_10m_kmh", 0.0, 200.0),
    ],
    quality: None,
    provenance_column: "data_provider",
    upsert_batch_size: 500,
};

pub static GRID_SCHEMA: DomainSchema = DomainSchema {
    domain: Domain::Grid,
    table: "grid.operations",
    key_columns: &["timestamp", "country_code", "region_code"],
    attribute_columns: &[],
    measurements: &[
        power("load_actual_mw"),
        power("load_forecast_mw"),
        power("solar_generation_actual_mw"),
        power("wind_onshore_generation_actual_mw"),
        power("wind_offshore_generation_actual_mw"),
        power("hydro_generation_actual_mw"),
        power("nuclear_generation_actual_mw"),
        power("fossil_generation_actual_mw"),
        power("other_renewable_generation_mw"),
        MeasurementSpec {
            name: "total_generation_mw",
            range: Some((0.0, 200_000.0)),
            default: ColumnDefault::Null,
            derived: true,
        },
        MeasurementSpec {
            name: "net_import_export_mw",
            range: Some((-200_000.0, 200_000.0)),
            default: ColumnDefault::Null,
            derived: true,
        },
        MeasurementSpec {
            name: "price_day_ahead_eur_mwh",
            range: Some((-500.0, 4000.0)),
            default: ColumnDefault::Null,
            derived: false,
        },
    ],
    quality: None,
    provenance_column: "source",
    upsert_batch_size: 200,
};

/// A validated row bound for one of the domain tables.
pub trait TimeSeriesRecord: Clone + fmt::Debug + Send + Sync + 'static {
    fn schema() -> &'static DomainSchema;

    /// `None` when the row has no timestamp or belongs to another domain.
    fn from_canonical(row: &CanonicalRow) -> Option<Self>;

    fn timestamp(&self) -> DateTime<Utc>;

    fn entity_id(&self) -> String;

    /// Values in `schema().insert_columns()` order.
    fn column_values(&self) -> Vec<ColumnValue>;

    fn key(&self) -> String {
        format!("{}|{}", self.timestamp().to_rfc3339(), self.entity_id())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HouseholdRecord {
    pub timestamp: DateTime<Utc>,
    pub household_id: String,
    pub global_active_power: Option<f64>,
    pub global_reactive_power: Option<f64>,
    pub voltage: Option<f64>,
    pub global_intensity: Option<f64>,
    pub sub_metering_1: Option<f64>,
    pub sub_metering_2: Option<f64>,
    pub sub_metering_3: Option<f64>,
    pub calculated_other_consumption: Option<f64>,
    pub data_quality_score: f64,
    pub source_file: String,
}

impl TimeSeriesRecord for HouseholdRecord {
    fn schema() -> &'static DomainSchema {
        &HOUSEHOLD_SCHEMA
    }

    fn from_canonical(row: &CanonicalRow) -> Option<Self> {
        let EntityKey::Household { household_id } = &row.entity else {
            return None;
        };
        Some(Self {
            timestamp: row.timestamp?,
            household_id: household_id.clone(),
            global_active_power: row.value("global_active_power"),
            global_reactive_power: row.value("global_reactive_power"),
            voltage: row.value("voltage"),
            global_intensity: row.value("global_intensity"),
            sub_metering_1: row.value("sub_metering_1"),
            sub_metering_2: row.value("sub_metering_2"),
            sub_metering_3: row.value("sub_metering_3"),
            calculated_other_consumption: row.value("calculated_other_consumption"),
            data_quality_score: row.value("data_quality_score").unwrap_or(1.0),
            source_file: row.provider.clone(),
        })
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn entity_id(&self) -> String {
        self.household_id.clone()
    }

    fn column_values(&self) -> Vec<ColumnValue> {
        vec![
            ColumnValue::Timestamp(self.timestamp),
            ColumnValue::Text(self.household_id.clone()),
            ColumnValue::Float(self.global_active_power),
            ColumnValue::Float(self.global_reactive_power),
            ColumnValue::Float(self.voltage),
            ColumnValue::Float(self.global_intensity),
            ColumnValue::Float(self.sub_metering_1),
            ColumnValue::Float(self.sub_metering_2),
            ColumnValue::Float(self.sub_metering_3),
            ColumnValue::Float(self.calculated_other_consumption),
            ColumnValue::Float(Some(self.data_quality_score)),
            ColumnValue::Text(self.source_file.clone()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRecord {
    pub timestamp: DateTime<Utc>,
    pub location_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub temperature_2m_c: Option<f64>,
    pub relative_humidity_2m_pct: Option<f64>,
    pub dew_point_2m_c: Option<f64>,
    pub apparent_temperature_c: Option<f64>,
    pub rain_mm: Option<f64>,
    pub shortwave_radiation_w_m2: Option<f64>,
    pub cloud_cover_pct: Option<f64>,
    pub surface_pressure_hpa: Option<f64>,
    pub visibility_m: Option<f64>,
    pub wind_speed_10m_kmh: Option<f64>,
    pub wind_direction_10m_deg: Option<f64>,
    pub wind_gusts_10m_kmh: Option<f64>,
    pub data_provider: String,
}

impl TimeSeriesRecord for WeatherRecord {
    fn schema() -> &'static DomainSchema {
        &WEATHER_SCHEMA
    }

    fn from_canonical(row: &CanonicalRow) -> Option<Self> {
        let EntityKey::Location {
            location_id,
            latitude,
            longitude,
        } = &row.entity
        else {
            return None;
        };
        Some(Self {
            timestamp: row.timestamp?,
            location_id: location_id.clone(),
            latitude: *latitude,
            longitude: *longitude,
            temperature_2m_c: row.value("temperature_2m_c"),
            relative_humidity_2m_pct: row.value("relative_humidity_2m_pct"),
            dew_point_2m_c: row.value("dew_point_2m_c"),
            apparent_temperature_c: row.value("apparent_temperature_c"),
            rain_mm: row.value("rain_mm"),
            shortwave_radiation_w_m2: row.value("shortwave_radiation_w_m2"),
            cloud_cover_pct: row.value("cloud_cover_pct"),
            surface_pressure_hpa: row.value("surface_pressure_hpa"),
            visibility_m: row.value("visibility_m"),
            wind_speed_10m_kmh: row.value("wind_speed_10m_kmh"),
            wind_direction_10m_deg: row.value("wind_direction_10m_deg"),
            wind_gusts_10m_kmh: row.value("wind_gusts_10m_kmh"),
            data_provider: row.provider.clone(),
        })
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn entity_id(&self) -> String {
        self.location_id.clone()
    }

    fn column_values(&self) -> Vec<ColumnValue> {
        vec![
            ColumnValue::Timestamp(self.timestamp),
            ColumnValue::Text(self.location_id.clone()),
            ColumnValue::Float(Some(self.latitude)),
            ColumnValue::Float(Some(self.longitude)),
            ColumnValue::Float(self.temperature_2m_c),
            ColumnValue::Float(self.relative_humidity_2m_pct),
            ColumnValue::Float(self.dew_point_2m_c),
            ColumnValue::Float(self.apparent_temperature_c),
            ColumnValue::Float(self.rain_mm),
            ColumnValue::Float(self.shortwave_radiation_w_m2),
            ColumnValue::Float(self.cloud_cover_pct),
            ColumnValue::Float(self.surface_pressure_hpa),
            ColumnValue::Float(self.visibility_m),
            ColumnValue::Float(self.wind_speed_10m_kmh),
            ColumnValue::Float(self.wind_direction_10m_deg),
            ColumnValue::Float(self.wind_gusts_10m_kmh),
            ColumnValue::Text(self.data_provider.clone()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridRecord {
    pub timestamp: DateTime<Utc>,
    pub country_code: String,
    pub region_code: String,
    pub load_actual_mw: Option<f64>,
    pub load_forecast_mw: Option<f64>,
    pub solar_generation_actual_mw: Option<f64>,
    pub wind_onshore_generation_actual_mw: Option<f64>,
    pub wind_offshore_generation_actual_mw: Option<f64>,
    pub hydro_generation_actual_mw: Option<f64>,
    pub nuclear_generation_actual_mw: Option<f64>,
    pub fossil_generation_actual_mw: Option<f64>,
    pub other_renewable_generation_mw: Option<f64>,
    pub total_generation_mw: Option<f64>,
    pub net_import_export_mw: Option<f64>,
    pub price_day_ahead_eur_mwh: Option<f64>,
    pub source: String,
}

impl TimeSeriesRecord for GridRecord {
    fn schema() -> &'static DomainSchema {
        &GRID_SCHEMA
    }

    fn from_canonical(row: &CanonicalRow) -> Option<Self> {
        let EntityKey::Region {
            country_code,
            region_code,
        } = &row.entity
        else {
            return None;
        };
        Some(Self {
            timestamp: row.timestamp?,
            country_code: country_code.clone(),
            region_code: region_code.clone(),
            load_actual_mw: row.value("load_actual_mw"),
            load_forecast_mw: row.value("load_forecast_mw"),
            solar_generation_actual_mw: row.value("solar_generation_actual_mw"),
            wind_onshore_generation_actual_mw: row.value("wind_onshore_generation_actual_mw"),
            wind_offshore_generation_actual_mw: row.value("wind_offshore_generation_actual_mw"),
            hydro_generation_actual_mw: row.value("hydro_generation_actual_mw"),
            nuclear_generation_actual_mw: row.value("nuclear_generation_actual_mw"),
            fossil_generation_actual_mw: row.value("fossil_generation_actual_mw"),
            other_renewable_generation_mw: row.value("other_renewable_generation_mw"),
            total_generation_mw: row.value("total_generation_mw"),
            net_import_export_mw: row.value("net_import_export_mw"),
            price_day_ahead_eur_mwh: row.value("price_day_ahead_eur_mwh"),
            source: row.provider.clone(),
        })
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn entity_id(&self) -> String {
        format!("{}/{}", self.country_code, self.region_code)
    }

    fn column_values(&self) -> Vec<ColumnValue> {
        vec![
            ColumnValue::Timestamp(self.timestamp),
            ColumnValue::Text(self.country_code.clone()),
            ColumnValue::Text(self.region_code.clone()),
            ColumnValue::Float(self.load_actual_mw),
            ColumnValue::Float(self.load_forecast_mw),
            ColumnValue::Float(self.solar_generation_actual_mw),
            ColumnValue::Float(self.wind_onshore_generation_actual_mw),
            ColumnValue::Float(self.wind_offshore_generation_actual_mw),
            ColumnValue::Float(self.hydro_generation_actual_mw),
            ColumnValue::Float(self.nuclear_generation_actual_mw),
            ColumnValue::Float(self.fossil_generation_actual_mw),
            ColumnValue::Float(self.other_renewable_generation_mw),
            ColumnValue::Float(self.total_generation_mw),
            ColumnValue::Float(self.net_import_export_mw),
            ColumnValue::Float(self.price_day_ahead_eur_mwh),
            ColumnValue::Text(self.source.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn column_values_follow_insert_column_order() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).single().unwrap();
        let mut row = CanonicalRow::new(
            Some(ts),
            EntityKey::Region {
                country_code: "FR".into(),
                region_code: "FR".into(),
            },
            "Open Power System Data",
        );
        row.set("load_actual_mw", Some(51_000.0));
        let grid = GridRecord::from_canonical(&row).expect("grid record");
        assert_eq!(grid.column_values().len(), GRID_SCHEMA.insert_columns().len());
        assert_eq!(grid.column_values()[3], ColumnValue::Float(Some(51_000.0)));

        let household = HouseholdRecord {
            timestamp: ts,
            household_id: "uci_france_001".into(),
            global_active_power: None,
            global_reactive_power: None,
            voltage: None,
            global_intensity: None,
            sub_metering_1: None,
            sub_metering_2: None,
            sub_metering_3: None,
            calculated_other_consumption: None,
            data_quality_score: 0.0,
            source_file: "uci_dataset".into(),
        };
        assert_eq!(
            household.column_values().len(),
            HOUSEHOLD_SCHEMA.insert_columns().len()
        );
        assert_eq!(HOUSEHOLD_SCHEMA.insert_columns()[10], "data_quality_score");
    }

    #[test]
    fn records_reject_rows_from_other_domains() {
        let row = CanonicalRow::new(
            None,
            EntityKey::Household {
                household_id: "h".into(),
            },
            "x",
        );
        assert!(WeatherRecord::from_canonical(&row).is_none());
        assert!(HouseholdRecord::from_canonical(&row).is_none());
    }

    #[test]
    fn update_columns_exclude_keys() {
        let cols = WEATHER_SCHEMA.update_columns();
        assert!(!cols.contains(&"timestamp"));
        assert!(!cols.contains(&"location_id"));
        assert!(cols.contains(&"data_provider"));
        assert_eq!(WEATHER_SCHEMA.entity_column(), "location_id");
    }
}
