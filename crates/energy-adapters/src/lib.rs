//! Source adapters: fetch raw tables with tiered fallback and map them onto canonical columns.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use energy_core::{EntityKey, RawTable, TimeRange};
use energy_storage::FetchError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub mod grid;
pub mod household;
pub mod reconcile;
mod synthetic;
pub mod tabular;
pub mod weather;

pub use reconcile::{
    ColumnMapping, ColumnMatch, ColumnRule, GridReconciler, HouseholdReconciler, MatchKind,
    ReconcileError, Reconciled, Reconciler, WeatherReconciler,
};
pub use tabular::{decode_tabular, TabularFormat, TabularOptions};

pub const CRATE_NAME: &str = "energy-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("source {source_name} returned no rows")]
    Empty { source_name: String },
    #[error("source {source_name} timed out after {secs}s")]
    Timeout { source_name: String, secs: u64 },
    #[error("unparseable payload: {0}")]
    Parse(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    Primary,
    Secondary,
    Synthetic,
}

/// What a pipeline asks its sources for.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub range: TimeRange,
    pub target: Option<EntityKey>,
}

impl FetchRequest {
    pub fn new(range: TimeRange) -> Self {
        Self {
            range,
            target: None,
        }
    }

    pub fn for_entity(range: TimeRange, target: EntityKey) -> Self {
        Self {
            range,
            target: Some(target),
        }
    }
}

/// One place raw data can come from. Implementations do network or file I/O
/// only; they never write to the store.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    fn tier(&self) -> SourceTier;

    /// Sources that cannot serve a request are skipped without an attempt.
    fn supports(&self, _request: &FetchRequest) -> bool {
        true
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawTable, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub source: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub table: Option<RawTable>,
    pub source: Option<String>,
    pub tier: Option<SourceTier>,
    pub failures: Vec<SourceFailure>,
}

impl FetchOutcome {
    pub fn is_empty(&self) -> bool {
        self.table.is_none()
    }
}

/// Ordered list of sources; the first non-empty answer wins.
#[derive(Clone)]
pub struct SourceChain {
    sources: Vec<Arc<dyn DataSource>>,
    attempt_timeout: Duration,
}

impl SourceChain {
    pub fn new(attempt_timeout: Duration) -> Self {
        Self {
            sources: Vec::new(),
            attempt_timeout,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    /// Try every source in order. Failures are logged and never returned;
    /// an outcome without a table means every tier came back empty.
    pub async fn fetch(&self, request: &FetchRequest) -> FetchOutcome {
        let mut failures = Vec::new();

        for source in &self.sources {
            if !source.supports(request) {
                continue;
            }
            let name = source.name().to_string();
            let attempt = tokio::time::timeout(self.attempt_timeout, source.fetch(request)).await;
            let result = match attempt {
                Ok(result) => result,
                Err(_) => Err(AdapterError::Timeout {
                    source_name: name.clone(),
                    secs: self.attempt_timeout.as_secs(),
                }),
            };

            match result {
                Ok(table) if !table.is_empty() => {
                    if source.tier() == SourceTier::Synthetic {
                        warn!(source = %name, rows = table.len(), "all real sources failed; using synthetic data");
                    } else {
                        info!(source = %name, rows = table.len(), "source answered");
                    }
                    return FetchOutcome {
                        table: Some(table),
                        source: Some(name),
                        tier: Some(source.tier()),
                        failures,
                    };
                }
                Ok(_) => {
                    warn!(source = %name, "source returned no rows; trying next");
                    failures.push(SourceFailure {
                        source: name.clone(),
                        error: AdapterError::Empty { source_name: name }.to_string(),
                    });
                }
                Err(err) => {
                    warn!(source = %name, error = %err, "source failed; trying next");
                    failures.push(SourceFailure {
                        source: name,
                        error: err.to_string(),
                    });
                }
            }
        }

        FetchOutcome {
            table: None,
            source: None,
            tier: None,
            failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    struct Fixed {
        name: &'static str,
        tier: SourceTier,
        rows: usize,
        fail: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl DataSource for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn tier(&self) -> SourceTier {
            self.tier
        }

        async fn fetch(&self, _request: &FetchRequest) -> Result<RawTable, AdapterError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(AdapterError::Message(format!("{} is down", self.name)));
            }
            let mut table = RawTable::new(self.name, vec!["time".into(), "v".into()]);
            for i in 0..self.rows {
                table.push_row(vec![format!("2024-01-01T{i:02}:00"), i.to_string()]);
            }
            Ok(table)
        }
    }

    fn source(name: &'static str, tier: SourceTier, rows: usize, fail: bool) -> Arc<dyn DataSource> {
        Arc::new(Fixed {
            name,
            tier,
            rows,
            fail,
            delay: None,
        })
    }

    fn request() -> FetchRequest {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap();
        FetchRequest::new(TimeRange::new(start, start + chrono::Duration::hours(3)).unwrap())
    }

    #[tokio::test]
    async fn secondary_answers_when_primary_fails() {
        let chain = SourceChain::new(Duration::from_secs(5))
            .with_source(source("primary", SourceTier::Primary, 3, true))
            .with_source(source("mirror", SourceTier::Secondary, 2, false))
            .with_source(source("synthetic", SourceTier::Synthetic, 9, false));

        let outcome = chain.fetch(&request()).await;
        let direct = source("mirror", SourceTier::Secondary, 2, false)
            .fetch(&request())
            .await
            .unwrap();

        assert_eq!(outcome.source.as_deref(), Some("mirror"));
        assert_eq!(outcome.tier, Some(SourceTier::Secondary));
        assert_eq!(outcome.table, Some(direct));
        assert_eq!(outcome.failures.len(), 1);
    }

    #[tokio::test]
    async fn empty_tables_fall_through_to_synthetic() {
        let chain = SourceChain::new(Duration::from_secs(5))
            .with_source(source("primary", SourceTier::Primary, 0, false))
            .with_source(source("mirror", SourceTier::Secondary, 0, true))
            .with_source(source("synthetic", SourceTier::Synthetic, 4, false));

        let outcome = chain.fetch(&request()).await;
        assert_eq!(outcome.tier, Some(SourceTier::Synthetic));
        assert_eq!(outcome.failures.len(), 2);
    }

    #[tokio::test]
    async fn slow_sources_time_out_per_attempt() {
        let slow: Arc<dyn DataSource> = Arc::new(Fixed {
            name: "slow",
            tier: SourceTier::Primary,
            rows: 1,
            fail: false,
            delay: Some(Duration::from_secs(30)),
        });
        let chain = SourceChain::new(Duration::from_millis(20))
            .with_source(slow)
            .with_source(source("mirror", SourceTier::Secondary, 1, false));

        let outcome = chain.fetch(&request()).await;
        assert_eq!(outcome.source.as_deref(), Some("mirror"));
        assert!(outcome.failures[0].error.contains("timed out"));
    }

    /// Behaves like an HTTP fetch whose first request hangs until the
    /// client timeout and whose retry succeeds.
    struct HangsOnce {
        request_timeout: Duration,
        backoff: energy_storage::BackoffPolicy,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl DataSource for HangsOnce {
        fn name(&self) -> &str {
            "open-meteo"
        }

        fn tier(&self) -> SourceTier {
            SourceTier::Primary
        }

        async fn fetch(&self, _request: &FetchRequest) -> Result<RawTable, AdapterError> {
            use std::sync::atomic::Ordering;
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(self.request_timeout).await;
                tokio::time::sleep(self.backoff.delay_for_retry(0)).await;
            }
            let mut table = RawTable::new("open-meteo", vec!["time".into(), "v".into()]);
            table.push_row(vec!["2024-01-01T00:00".into(), "1".into()]);
            Ok(table)
        }
    }

    #[tokio::test]
    async fn retry_after_request_timeout_fits_in_the_attempt_budget() {
        let request_timeout = Duration::from_millis(40);
        let backoff = energy_storage::BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        };
        let hangs_once = |calls: usize| -> Arc<dyn DataSource> {
            Arc::new(HangsOnce {
                request_timeout,
                backoff,
                calls: std::sync::atomic::AtomicUsize::new(calls),
            })
        };

        let chain = SourceChain::new(backoff.attempt_budget(request_timeout))
            .with_source(hangs_once(0))
            .with_source(source("synthetic", SourceTier::Synthetic, 4, false));
        let outcome = chain.fetch(&request()).await;
        assert_eq!(outcome.source.as_deref(), Some("open-meteo"));
        assert!(outcome.failures.is_empty());

        // a chain limited to one request's timeout cuts the retry off
        let tight = SourceChain::new(request_timeout)
            .with_source(hangs_once(0))
            .with_source(source("synthetic", SourceTier::Synthetic, 4, false));
        let outcome = tight.fetch(&request()).await;
        assert_eq!(outcome.tier, Some(SourceTier::Synthetic));
        assert!(outcome.failures[0].error.contains("timed out"));
    }

    #[tokio::test]
    async fn exhausted_chain_returns_empty_outcome() {
        let chain = SourceChain::new(Duration::from_secs(1))
            .with_source(source("primary", SourceTier::Primary, 0, true));
        let outcome = chain.fetch(&request()).await;
        assert!(outcome.is_empty());
        assert_eq!(outcome.failures.len(), 1);
    }
}
