//! Column reconciliation: ordered rule lists that map provider column names
//! onto canonical measurement columns.
//!
//! Every target is tried with its exact rules first, across all targets,
//! then with keyword rules over the headers nobody claimed. A header is
//! claimed by at most one target.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use energy_core::{
    parse_timestamp, CanonicalRow, CanonicalTable, ColumnDefault, Domain, DomainSchema,
    EntityKey, RawTable, GRID_SCHEMA, HOUSEHOLD_SCHEMA, WEATHER_SCHEMA,
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq)]
pub enum ReconcileError {
    #[error("no timestamp column in payload from {provider}")]
    MissingTimestamp { provider: String },
    #[error("no recognisable entity in payload from {provider}")]
    NoEntities { provider: String },
}

/// One way a source header can satisfy a target column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRule {
    /// Case-insensitive equality. `{entity}` expands to the lowercase entity prefix.
    Exact(&'static str),
    /// Header contains every `all` keyword and none of the `none` keywords.
    Keywords {
        all: &'static [&'static str],
        none: &'static [&'static str],
    },
}

impl ColumnRule {
    fn matches(&self, header_lower: &str, entity: Option<&str>) -> bool {
        match self {
            ColumnRule::Exact(pattern) => {
                let expected = match entity {
                    Some(prefix) => pattern.replace("{entity}", prefix),
                    None => pattern.to_string(),
                };
                header_lower == expected.to_ascii_lowercase()
            }
            ColumnRule::Keywords { all, none } => {
                all.iter().all(|k| header_lower.contains(k))
                    && !none.iter().any(|k| header_lower.contains(k))
            }
        }
    }

    fn kind(&self) -> MatchKind {
        match self {
            ColumnRule::Exact(_) => MatchKind::Exact,
            ColumnRule::Keywords { .. } => MatchKind::Keyword,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMapping {
    pub target: &'static str,
    pub rules: &'static [ColumnRule],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Keyword,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMatch {
    pub target: &'static str,
    pub source: String,
    pub column: usize,
    pub kind: MatchKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub table: CanonicalTable,
    /// Column matches per entity id.
    pub mapped: BTreeMap<String, Vec<ColumnMatch>>,
    /// Entity ids dropped because none of their columns mapped.
    pub discarded: Vec<String>,
}

pub trait Reconciler: Send + Sync {
    fn domain(&self) -> Domain;

    fn reconcile(
        &self,
        raw: &RawTable,
        entity: Option<&EntityKey>,
    ) -> Result<Reconciled, ReconcileError>;
}

/// Run the rule list against `headers`. With an entity prefix only headers
/// starting with `{prefix}_` are candidates.
pub fn match_columns(
    headers: &[String],
    mappings: &[ColumnMapping],
    entity_prefix: Option<&str>,
) -> Vec<ColumnMatch> {
    let lowered = headers
        .iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .collect::<Vec<_>>();
    let candidate = |idx: usize| match entity_prefix {
        Some(prefix) => lowered[idx].starts_with(&format!("{prefix}_")),
        None => true,
    };

    let mut claimed = vec![false; headers.len()];
    let mut found: Vec<Option<ColumnMatch>> = vec![None; mappings.len()];

    for pass in [MatchKind::Exact, MatchKind::Keyword] {
        for (slot, mapping) in mappings.iter().enumerate() {
            if found[slot].is_some() {
                continue;
            }
            'rules: for rule in mapping.rules.iter().filter(|r| r.kind() == pass) {
                for idx in 0..headers.len() {
                    if claimed[idx] || !candidate(idx) {
                        continue;
                    }
                    if rule.matches(&lowered[idx], entity_prefix) {
                        claimed[idx] = true;
                        found[slot] = Some(ColumnMatch {
                            target: mapping.target,
                            source: headers[idx].clone(),
                            column: idx,
                            kind: pass,
                        });
                        break 'rules;
                    }
                }
            }
        }
    }

    found.into_iter().flatten().collect()
}

/// First header equal (case-insensitive) to one of `candidates`, in candidate order.
fn find_column(raw: &RawTable, candidates: &[&str]) -> Option<usize> {
    candidates.iter().find_map(|c| raw.column_index(c))
}

/// Build canonical rows for one entity: mapped values, then schema defaults
/// for everything that did not map. Derived columns are left to the caller.
fn build_rows(
    raw: &RawTable,
    timestamps: &[Option<DateTime<Utc>>],
    entity: &EntityKey,
    matches: &[ColumnMatch],
    schema: &DomainSchema,
) -> Vec<CanonicalRow> {
    (0..raw.len())
        .map(|row_idx| {
            let mut row = CanonicalRow::new(timestamps[row_idx], entity.clone(), raw.provider.clone());
            for spec in schema.measurements.iter().filter(|m| !m.derived) {
                let value = match matches.iter().find(|m| m.target == spec.name) {
                    Some(m) => raw.numeric(row_idx, m.column),
                    None => match spec.default {
                        ColumnDefault::Zero => Some(0.0),
                        ColumnDefault::Null => None,
                    },
                };
                row.set(spec.name, value);
            }
            row
        })
        .collect()
}

fn finish(
    domain: Domain,
    raw: &RawTable,
    rows: Vec<CanonicalRow>,
    mapped: BTreeMap<String, Vec<ColumnMatch>>,
    discarded: Vec<String>,
) -> Reconciled {
    Reconciled {
        table: CanonicalTable {
            domain,
            rows,
            synthetic: raw.synthetic,
        },
        mapped,
        discarded,
    }
}

// ---------------------------------------------------------------- grid

const EXCLUDED_GRID: &[&str] = &["capacity", "profile", "share", "forecast"];

pub static GRID_RULES: &[ColumnMapping] = &[
    ColumnMapping {
        target: "load_actual_mw",
        rules: &[
            ColumnRule::Exact("{entity}_load_actual_entsoe_transparency"),
            ColumnRule::Exact("{entity}_load_actual"),
            ColumnRule::Keywords {
                all: &["load", "actual"],
                none: &["forecast"],
            },
        ],
    },
    ColumnMapping {
        target: "load_forecast_mw",
        rules: &[
            ColumnRule::Exact("{entity}_load_forecast_entsoe_transparency"),
            ColumnRule::Keywords {
                all: &["load", "forecast"],
                none: &[],
            },
        ],
    },
    ColumnMapping {
        target: "solar_generation_actual_mw",
        rules: &[
            ColumnRule::Exact("{entity}_solar_generation_actual"),
            ColumnRule::Keywords {
                all: &["solar"],
                none: EXCLUDED_GRID,
            },
        ],
    },
    ColumnMapping {
        target: "wind_onshore_generation_actual_mw",
        rules: &[
            ColumnRule::Exact("{entity}_wind_onshore_generation_actual"),
            ColumnRule::Keywords {
                all: &["wind", "onshore"],
                none: EXCLUDED_GRID,
            },
        ],
    },
    ColumnMapping {
        target: "wind_offshore_generation_actual_mw",
        rules: &[
            ColumnRule::Exact("{entity}_wind_offshore_generation_actual"),
            ColumnRule::Keywords {
                all: &["wind", "offshore"],
                none: EXCLUDED_GRID,
            },
        ],
    },
    ColumnMapping {
        target: "hydro_generation_actual_mw",
        rules: &[
            ColumnRule::Exact("{entity}_hydro_generation_actual"),
            ColumnRule::Keywords {
                all: &["hydro"],
                none: EXCLUDED_GRID,
            },
        ],
    },
    ColumnMapping {
        target: "nuclear_generation_actual_mw",
        rules: &[
            ColumnRule::Exact("{entity}_nuclear_generation_actual"),
            ColumnRule::Keywords {
                all: &["nuclear"],
                none: EXCLUDED_GRID,
            },
        ],
    },
    ColumnMapping {
        target: "fossil_generation_actual_mw",
        rules: &[
            ColumnRule::Exact("{entity}_fossil_gas_generation_actual"),
            ColumnRule::Exact("{entity}_fossil_generation_actual"),
            ColumnRule::Keywords {
                all: &["fossil"],
                none: EXCLUDED_GRID,
            },
        ],
    },
    ColumnMapping {
        target: "other_renewable_generation_mw",
        rules: &[
            ColumnRule::Exact("{entity}_other_renewable_generation_actual"),
            ColumnRule::Keywords {
                all: &["renewable", "generation"],
                none: EXCLUDED_GRID,
            },
        ],
    },
    ColumnMapping {
        target: "price_day_ahead_eur_mwh",
        rules: &[
            ColumnRule::Exact("{entity}_price_day_ahead"),
            ColumnRule::Keywords {
                all: &["price"],
                none: &[],
            },
        ],
    },
];

const GENERATION_COLUMNS: [&str; 7] = [
    "solar_generation_actual_mw",
    "wind_onshore_generation_actual_mw",
    "wind_offshore_generation_actual_mw",
    "hydro_generation_actual_mw",
    "nuclear_generation_actual_mw",
    "fossil_generation_actual_mw",
    "other_renewable_generation_mw",
];

pub const GRID_TIMESTAMP_COLUMNS: [&str; 3] = ["timestamp", "utc_timestamp", "Time (UTC)"];

pub const DEFAULT_COUNTRIES: [&str; 9] = ["FR", "DE", "ES", "IT", "NL", "BE", "AT", "CH", "PL"];

/// Wide per-country bulk CSV onto `grid.operations` rows.
#[derive(Debug, Clone)]
pub struct GridReconciler {
    countries: Vec<String>,
}

impl Default for GridReconciler {
    fn default() -> Self {
        Self::new(DEFAULT_COUNTRIES.iter().map(|c| c.to_string()).collect())
    }
}

impl GridReconciler {
    pub fn new(countries: Vec<String>) -> Self {
        Self {
            countries: countries.into_iter().map(|c| c.to_ascii_uppercase()).collect(),
        }
    }

    /// Known country codes appearing as a two-letter column prefix, in first-seen order.
    pub fn detect_countries(&self, headers: &[String]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for header in headers {
            let Some((prefix, _)) = header.trim().split_once('_') else {
                continue;
            };
            if prefix.len() != 2 || !prefix.chars().all(|c| c.is_ascii_alphabetic()) {
                continue;
            }
            let code = prefix.to_ascii_uppercase();
            if self.countries.contains(&code) && !out.contains(&code) {
                out.push(code);
            }
        }
        out
    }
}

impl Reconciler for GridReconciler {
    fn domain(&self) -> Domain {
        Domain::Grid
    }

    fn reconcile(
        &self,
        raw: &RawTable,
        entity: Option<&EntityKey>,
    ) -> Result<Reconciled, ReconcileError> {
        let ts_col = find_column(raw, &GRID_TIMESTAMP_COLUMNS).ok_or_else(|| {
            ReconcileError::MissingTimestamp {
                provider: raw.provider.clone(),
            }
        })?;
        let timestamps = (0..raw.len())
            .map(|r| raw.cell(r, ts_col).and_then(parse_timestamp))
            .collect::<Vec<_>>();

        let mut countries = self.detect_countries(&raw.headers);
        if let Some(EntityKey::Region { country_code, .. }) = entity {
            countries.retain(|c| c.eq_ignore_ascii_case(country_code));
        }
        if countries.is_empty() {
            return Err(ReconcileError::NoEntities {
                provider: raw.provider.clone(),
            });
        }

        let mut rows = Vec::new();
        let mut mapped = BTreeMap::new();
        let mut discarded = Vec::new();
        for country in countries {
            let prefix = country.to_ascii_lowercase();
            let matches = match_columns(&raw.headers, GRID_RULES, Some(&prefix));
            let key = EntityKey::Region {
                country_code: country.clone(),
                region_code: country.clone(),
            };
            if matches.is_empty() {
                warn!(country = %country, provider = %raw.provider, "no grid columns mapped; discarding country");
                discarded.push(key.id());
                continue;
            }
            debug!(country = %country, mapped = matches.len(), "grid columns mapped");

            let mapped_generation = GENERATION_COLUMNS
                .iter()
                .copied()
                .filter(|g| matches.iter().any(|m| m.target == *g))
                .collect::<Vec<_>>();
            for mut row in build_rows(raw, &timestamps, &key, &matches, &GRID_SCHEMA) {
                let present = mapped_generation
                    .iter()
                    .filter_map(|g| row.value(g))
                    .collect::<Vec<_>>();
                let total = if present.is_empty() {
                    None
                } else {
                    Some(present.iter().sum::<f64>())
                };
                row.set("total_generation_mw", total);
                let net = total.zip(row.value("load_actual_mw")).map(|(t, l)| t - l);
                row.set("net_import_export_mw", net);
                rows.push(row);
            }
            mapped.insert(key.id(), matches);
        }

        Ok(finish(Domain::Grid, raw, rows, mapped, discarded))
    }
}

// ----------------------------------------------------------- household

pub static HOUSEHOLD_RULES: &[ColumnMapping] = &[
    ColumnMapping {
        target: "global_active_power",
        rules: &[
            ColumnRule::Exact("global_active_power"),
            ColumnRule::Keywords {
                all: &["active", "power"],
                none: &["reactive"],
            },
        ],
    },
    ColumnMapping {
        target: "global_reactive_power",
        rules: &[
            ColumnRule::Exact("global_reactive_power"),
            ColumnRule::Keywords {
                all: &["reactive"],
                none: &[],
            },
        ],
    },
    ColumnMapping {
        target: "voltage",
        rules: &[
            ColumnRule::Exact("voltage"),
            ColumnRule::Keywords {
                all: &["volt"],
                none: &[],
            },
        ],
    },
    ColumnMapping {
        target: "global_intensity",
        rules: &[
            ColumnRule::Exact("global_intensity"),
            ColumnRule::Keywords {
                all: &["intensity"],
                none: &[],
            },
        ],
    },
    ColumnMapping {
        target: "sub_metering_1",
        rules: &[
            ColumnRule::Exact("sub_metering_1"),
            ColumnRule::Keywords {
                all: &["kitchen"],
                none: &[],
            },
        ],
    },
    ColumnMapping {
        target: "sub_metering_2",
        rules: &[
            ColumnRule::Exact("sub_metering_2"),
            ColumnRule::Keywords {
                all: &["laundry"],
                none: &[],
            },
        ],
    },
    ColumnMapping {
        target: "sub_metering_3",
        rules: &[
            ColumnRule::Exact("sub_metering_3"),
            ColumnRule::Keywords {
                all: &["heater"],
                none: &[],
            },
        ],
    },
];

/// Minutely household meter files onto `household.consumption` rows.
#[derive(Debug, Clone)]
pub struct HouseholdReconciler {
    household_id: String,
    utc_offset: FixedOffset,
}

impl HouseholdReconciler {
    pub fn new(household_id: impl Into<String>, utc_offset: FixedOffset) -> Self {
        Self {
            household_id: household_id.into(),
            utc_offset,
        }
    }

    fn timestamps(&self, raw: &RawTable) -> Option<Vec<Option<DateTime<Utc>>>> {
        if let (Some(date), Some(time)) = (raw.column_index("Date"), raw.column_index("Time")) {
            return Some(
                (0..raw.len())
                    .map(|r| {
                        let d = raw.cell(r, date)?;
                        let t = raw.cell(r, time)?;
                        let naive =
                            NaiveDateTime::parse_from_str(&format!("{d} {t}"), "%d/%m/%Y %H:%M:%S")
                                .ok()?;
                        self.utc_offset
                            .from_local_datetime(&naive)
                            .single()
                            .map(|local| local.with_timezone(&Utc))
                    })
                    .collect(),
            );
        }
        let col = find_column(raw, &["timestamp", "datetime"])?;
        Some(
            (0..raw.len())
                .map(|r| raw.cell(r, col).and_then(parse_timestamp))
                .collect(),
        )
    }
}

impl Reconciler for HouseholdReconciler {
    fn domain(&self) -> Domain {
        Domain::Household
    }

    fn reconcile(
        &self,
        raw: &RawTable,
        entity: Option<&EntityKey>,
    ) -> Result<Reconciled, ReconcileError> {
        let timestamps = self
            .timestamps(raw)
            .ok_or_else(|| ReconcileError::MissingTimestamp {
                provider: raw.provider.clone(),
            })?;
        let key = match entity {
            Some(key @ EntityKey::Household { .. }) => key.clone(),
            _ => EntityKey::Household {
                household_id: self.household_id.clone(),
            },
        };

        let matches = match_columns(&raw.headers, HOUSEHOLD_RULES, None);
        if matches.is_empty() {
            warn!(household = %key.id(), provider = %raw.provider, "no household columns mapped; discarding batch");
            return Ok(finish(
                Domain::Household,
                raw,
                Vec::new(),
                BTreeMap::new(),
                vec![key.id()],
            ));
        }

        let mut rows = build_rows(raw, &timestamps, &key, &matches, &HOUSEHOLD_SCHEMA);
        for row in &mut rows {
            let other = match (
                row.value("global_active_power"),
                row.value("sub_metering_1"),
                row.value("sub_metering_2"),
                row.value("sub_metering_3"),
            ) {
                (Some(p), Some(s1), Some(s2), Some(s3)) => Some(p * 1000.0 / 60.0 - s1 - s2 - s3),
                _ => None,
            };
            row.set("calculated_other_consumption", other);
        }

        let mut mapped = BTreeMap::new();
        mapped.insert(key.id(), matches);
        Ok(finish(Domain::Household, raw, rows, mapped, Vec::new()))
    }
}

// ------------------------------------------------------------- weather

/// API variable name, then the canonical name, then keywords.
const fn weather_rules(
    api: &'static str,
    canonical: &'static str,
    all: &'static [&'static str],
    none: &'static [&'static str],
) -> [ColumnRule; 3] {
    [
        ColumnRule::Exact(api),
        ColumnRule::Exact(canonical),
        ColumnRule::Keywords { all, none },
    ]
}

pub static WEATHER_RULES: &[ColumnMapping] = &[
    ColumnMapping {
        target: "temperature_2m_c",
        rules: &weather_rules("temperature_2m", "temperature_2m_c", &["temperature"], &["apparent", "dew"]),
    },
    ColumnMapping {
        target: "relative_humidity_2m_pct",
        rules: &weather_rules("relative_humidity_2m", "relative_humidity_2m_pct", &["humidity"], &[]),
    },
    ColumnMapping {
        target: "dew_point_2m_c",
        rules: &weather_rules("dew_point_2m", "dew_point_2m_c", &["dew"], &[]),
    },
    ColumnMapping {
        target: "apparent_temperature_c",
        rules: &weather_rules("apparent_temperature", "apparent_temperature_c", &["apparent"], &[]),
    },
    ColumnMapping {
        target: "rain_mm",
        rules: &weather_rules("rain", "rain_mm", &["precipitation"], &["probability"]),
    },
    ColumnMapping {
        target: "shortwave_radiation_w_m2",
        rules: &weather_rules("shortwave_radiation", "shortwave_radiation_w_m2", &["radiation"], &[]),
    },
    ColumnMapping {
        target: "cloud_cover_pct",
        rules: &weather_rules("cloud_cover", "cloud_cover_pct", &["cloud"], &[]),
    },
    ColumnMapping {
        target: "surface_pressure_hpa",
        rules: &weather_rules("surface_pressure", "surface_pressure_hpa", &["pressure"], &[]),
    },
    ColumnMapping {
        target: "visibility_m",
        rules: &weather_rules("visibility", "visibility_m", &["visib"], &[]),
    },
    ColumnMapping {
        target: "wind_speed_10m_kmh",
        rules: &weather_rules("wind_speed_10m", "wind_speed_10m_kmh", &["wind", "speed"], &[]),
    },
    ColumnMapping {
        target: "wind_direction_10m_deg",
        rules: &weather_rules("wind_direction_10m", "wind_direction_10m_deg", &["wind", "direction"], &[]),
    },
    ColumnMapping {
        target: "wind_gusts_10m_kmh",
        rules: &weather_rules("wind_gusts_10m", "wind_gusts_10m_kmh", &["gust"], &[]),
    },
];

/// Hourly per-location weather tables onto `weather.observations` rows.
#[derive(Debug, Clone, Default)]
pub struct WeatherReconciler;

impl Reconciler for WeatherReconciler {
    fn domain(&self) -> Domain {
        Domain::Weather
    }

    fn reconcile(
        &self,
        raw: &RawTable,
        entity: Option<&EntityKey>,
    ) -> Result<Reconciled, ReconcileError> {
        let ts_col = find_column(raw, &["time", "timestamp"]).ok_or_else(|| {
            ReconcileError::MissingTimestamp {
                provider: raw.provider.clone(),
            }
        })?;
        let Some(key @ EntityKey::Location { .. }) = entity else {
            return Err(ReconcileError::NoEntities {
                provider: raw.provider.clone(),
            });
        };
        let timestamps = (0..raw.len())
            .map(|r| raw.cell(r, ts_col).and_then(parse_timestamp))
            .collect::<Vec<_>>();

        let matches = match_columns(&raw.headers, WEATHER_RULES, None);
        if matches.is_empty() {
            warn!(location = %key.id(), provider = %raw.provider, "no weather columns mapped; discarding location");
            return Ok(finish(
                Domain::Weather,
                raw,
                Vec::new(),
                BTreeMap::new(),
                vec![key.id()],
            ));
        }

        let rows = build_rows(raw, &timestamps, key, &matches, &WEATHER_SCHEMA);
        let mut mapped = BTreeMap::new();
        mapped.insert(key.id(), matches);
        Ok(finish(Domain::Weather, raw, rows, mapped, Vec::new()))
    }
}
