//! The fetch → reconcile → validate → write sequence shared by every domain.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use energy_adapters::{FetchRequest, Reconciler, SourceChain, SourceFailure, SourceTier};
use energy_core::{
    CanonicalTable, Domain, DomainSchema, GridRecord, HouseholdRecord, JobCompletion, TimeRange,
    WeatherRecord,
};
use energy_storage::{StoreError, UpsertWriter, WriteOutcome, WritePath};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::validate::{to_records, validate_table, ValidationReport};

/// Outcome of one pipeline call. Pipelines never return errors; a failure
/// that stopped the write is carried in `failure`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub domain: Domain,
    pub processed: usize,
    pub written: usize,
    /// Part of `written` that went through the upsert path.
    pub updated: usize,
    pub rejected: usize,
    pub failed_batches: usize,
    pub sources: Vec<String>,
    pub synthetic: bool,
    pub failure: Option<String>,
}

impl IngestReport {
    pub fn empty(domain: Domain) -> Self {
        Self {
            domain,
            processed: 0,
            written: 0,
            updated: 0,
            rejected: 0,
            failed_batches: 0,
            sources: Vec::new(),
            synthetic: false,
            failure: None,
        }
    }

    pub fn failed(domain: Domain, message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::empty(domain)
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }

    /// Fold another report of the same domain into this one; the first
    /// failure wins.
    pub fn merge(&mut self, other: IngestReport) {
        self.processed += other.processed;
        self.written += other.written;
        self.updated += other.updated;
        self.rejected += other.rejected;
        self.failed_batches += other.failed_batches;
        for source in other.sources {
            if !self.sources.contains(&source) {
                self.sources.push(source);
            }
        }
        self.synthetic |= other.synthetic;
        if self.failure.is_none() {
            self.failure = other.failure;
        }
    }

    pub fn completion(&self) -> JobCompletion {
        match &self.failure {
            Some(message) => JobCompletion {
                records_processed: self.processed as i64,
                records_inserted: self.written as i64,
                records_updated: self.updated as i64,
                records_rejected: self.rejected as i64,
                ..JobCompletion::failed(message.clone())
            },
            None => JobCompletion {
                records_updated: self.updated as i64,
                records_rejected: self.rejected as i64,
                ..JobCompletion::completed(self.processed as i64, self.written as i64)
            },
        }
    }

    /// Interactive entry points surface a recorded failure as an error.
    pub fn into_result(self) -> anyhow::Result<Self> {
        match &self.failure {
            Some(message) => Err(anyhow::anyhow!("{} ingestion failed: {message}", self.domain)),
            None => Ok(self),
        }
    }
}

/// Validated rows of one domain, typed for the writer.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidatedBatch {
    Household(Vec<HouseholdRecord>),
    Weather(Vec<WeatherRecord>),
    Grid(Vec<GridRecord>),
}

impl ValidatedBatch {
    pub fn empty(domain: Domain) -> Self {
        match domain {
            Domain::Household => Self::Household(Vec::new()),
            Domain::Weather => Self::Weather(Vec::new()),
            Domain::Grid => Self::Grid(Vec::new()),
        }
    }

    pub fn from_table(table: &CanonicalTable) -> Self {
        match table.domain {
            Domain::Household => Self::Household(to_records(table)),
            Domain::Weather => Self::Weather(to_records(table)),
            Domain::Grid => Self::Grid(to_records(table)),
        }
    }

    pub fn domain(&self) -> Domain {
        match self {
            Self::Household(_) => Domain::Household,
            Self::Weather(_) => Domain::Weather,
            Self::Grid(_) => Domain::Grid,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Household(r) => r.len(),
            Self::Weather(r) => r.len(),
            Self::Grid(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `other` when it holds the same domain; otherwise hand it back.
    pub fn absorb(&mut self, other: ValidatedBatch) -> Result<(), ValidatedBatch> {
        match (self, other) {
            (Self::Household(a), Self::Household(b)) => a.extend(b),
            (Self::Weather(a), Self::Weather(b)) => a.extend(b),
            (Self::Grid(a), Self::Grid(b)) => a.extend(b),
            (_, other) => return Err(other),
        }
        Ok(())
    }

    pub async fn write(&self, writer: &UpsertWriter) -> Result<WriteOutcome, StoreError> {
        match self {
            Self::Household(r) => writer.write(r).await,
            Self::Weather(r) => writer.write(r).await,
            Self::Grid(r) => writer.write(r).await,
        }
    }

    /// Write in slices of at most `chunk_rows`. A connectivity failure stops
    /// the call and reports nothing written, even when earlier slices were
    /// committed; those rows are idempotent under a rerun.
    pub async fn write_chunked(
        &self,
        writer: &UpsertWriter,
        chunk_rows: usize,
    ) -> (ChunkedWrite, Result<(), StoreError>) {
        async fn run<R: energy_core::TimeSeriesRecord>(
            writer: &UpsertWriter,
            records: &[R],
            chunk_rows: usize,
        ) -> (ChunkedWrite, Result<(), StoreError>) {
            let mut total = ChunkedWrite::default();
            for chunk in records.chunks(chunk_rows.max(1)) {
                match writer.write(chunk).await {
                    Ok(outcome) => {
                        total.written += outcome.written;
                        if outcome.path == WritePath::Upsert {
                            total.updated += outcome.written;
                        }
                        total.failed_batches += outcome.failed_batches;
                    }
                    Err(err) => {
                        if total.written > 0 {
                            warn!(committed = total.written, error = %err, "store lost mid-write; reporting nothing written");
                        }
                        let aborted = ChunkedWrite {
                            failed_batches: total.failed_batches,
                            ..ChunkedWrite::default()
                        };
                        return (aborted, Err(err));
                    }
                }
            }
            (total, Ok(()))
        }
        match self {
            Self::Household(r) => run(writer, r, chunk_rows).await,
            Self::Weather(r) => run(writer, r, chunk_rows).await,
            Self::Grid(r) => run(writer, r, chunk_rows).await,
        }
    }
}

/// Row counts of a `write_chunked` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkedWrite {
    pub written: usize,
    pub updated: usize,
    pub failed_batches: usize,
}

/// Everything learned about one request before anything is written.
#[derive(Debug, Clone)]
pub struct Collected {
    pub batch: ValidatedBatch,
    pub validation: ValidationReport,
    pub source: Option<String>,
    pub tier: Option<SourceTier>,
    pub synthetic: bool,
    pub fetched_rows: usize,
    /// Entities the reconciler found no columns for.
    pub discarded: Vec<String>,
    pub failures: Vec<SourceFailure>,
    /// File or URL the winning table came from.
    pub origin: Option<String>,
}

impl Collected {
    fn nothing(domain: Domain, failures: Vec<SourceFailure>) -> Self {
        Self {
            batch: ValidatedBatch::empty(domain),
            validation: ValidationReport::default(),
            source: None,
            tier: None,
            synthetic: false,
            fetched_rows: 0,
            discarded: Vec::new(),
            failures,
            origin: None,
        }
    }

    pub fn answered(&self) -> bool {
        self.source.is_some()
    }
}

/// Rows outside the request window are dropped before validation when the
/// source hands back more than was asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clip {
    Keep,
    ToRange,
}

/// Reconciler plus writer for one domain; chains are supplied per call.
#[derive(Clone)]
pub struct IngestCore {
    domain: Domain,
    reconciler: Arc<dyn Reconciler>,
    writer: UpsertWriter,
}

impl IngestCore {
    pub fn new(reconciler: Arc<dyn Reconciler>, writer: UpsertWriter) -> Self {
        Self {
            domain: reconciler.domain(),
            reconciler,
            writer,
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn schema(&self) -> &'static DomainSchema {
        DomainSchema::for_domain(self.domain)
    }

    pub fn writer(&self) -> &UpsertWriter {
        &self.writer
    }

    /// Fetch with fallback, reconcile and validate. Nothing is written.
    pub async fn collect(&self, chain: &SourceChain, request: &FetchRequest, clip: Clip) -> Collected {
        let outcome = chain.fetch(request).await;
        let Some(raw) = outcome.table else {
            warn!(domain = %self.domain, failures = outcome.failures.len(), "every source came back empty");
            return Collected::nothing(self.domain, outcome.failures);
        };

        let fetched_rows = raw.len();
        let reconciled = match self.reconciler.reconcile(&raw, request.target.as_ref()) {
            Ok(reconciled) => reconciled,
            Err(err) => {
                warn!(domain = %self.domain, provider = %raw.provider, error = %err, "discarding unusable batch");
                let mut collected = Collected::nothing(self.domain, outcome.failures);
                collected.source = outcome.source;
                collected.tier = outcome.tier;
                collected.fetched_rows = fetched_rows;
                return collected;
            }
        };

        let mut table = reconciled.table;
        if clip == Clip::ToRange {
            let before = table.len();
            table
                .rows
                .retain(|row| row.timestamp.map_or(true, |ts| request.range.contains(ts)));
            if table.len() < before {
                info!(domain = %self.domain, kept = table.len(), dropped = before - table.len(), "clipped rows to the requested window");
            }
        }

        let synthetic = table.synthetic || outcome.tier == Some(SourceTier::Synthetic);
        let (clean, validation) = validate_table(self.schema(), table);
        Collected {
            batch: ValidatedBatch::from_table(&clean),
            validation,
            source: outcome.source,
            tier: outcome.tier,
            synthetic,
            fetched_rows,
            discarded: reconciled.discarded,
            failures: outcome.failures,
            origin: raw.origin,
        }
    }

    /// Persist a collected batch and summarise it.
    pub async fn write(&self, collected: &Collected, chunk_rows: Option<usize>) -> IngestReport {
        let mut report = IngestReport::empty(self.domain);
        report.processed = collected.validation.input_rows;
        report.rejected = collected.validation.rejected();
        report.synthetic = collected.synthetic;
        report.sources.extend(collected.source.clone());
        if collected.batch.is_empty() {
            return report;
        }

        let chunk_rows = chunk_rows.unwrap_or(usize::MAX);
        let span = info_span!("domain_write", domain = %self.domain, rows = collected.batch.len());
        let (counts, result) = collected
            .batch
            .write_chunked(&self.writer, chunk_rows)
            .instrument(span)
            .await;
        report.written = counts.written;
        report.updated = counts.updated;
        report.failed_batches = counts.failed_batches;
        if let Err(err) = result {
            warn!(domain = %self.domain, error = %err, "write aborted");
            report.failure = Some(err.to_string());
        }
        report
    }

    pub async fn run(&self, chain: &SourceChain, request: &FetchRequest, clip: Clip) -> IngestReport {
        let collected = self.collect(chain, request, clip).await;
        self.write(&collected, None).await
    }
}

/// Capabilities every domain pipeline offers to the orchestrator and the
/// streaming runner.
#[async_trait]
pub trait DomainPipeline: Send + Sync {
    fn domain(&self) -> Domain;

    /// Name recorded in the ingestion log for scheduled runs.
    fn job_name(&self) -> &'static str;

    fn data_source(&self) -> &'static str;

    /// The regular incremental run.
    async fn ingest_batch(&self) -> IngestReport;

    /// One explicit window; callers split long ranges into chunks.
    async fn process_historical(&self, range: TimeRange) -> IngestReport;

    fn validate(&self, table: CanonicalTable) -> (CanonicalTable, ValidationReport) {
        validate_table(DomainSchema::for_domain(self.domain()), table)
    }

    /// Fetch, reconcile and validate the batch window without writing.
    async fn probe(&self) -> Vec<Collected>;

    /// Fresh rows for the trailing `window`, for streaming mode.
    async fn poll(&self, window: Duration) -> Result<ValidatedBatch, String>;
}

/// Polling result shared by the pipelines: an empty answer from every
/// source is an error so the streaming loop can back off.
pub(crate) fn polled(collected: Vec<Collected>, domain: Domain) -> Result<ValidatedBatch, String> {
    if collected.iter().all(|c| !c.answered()) {
        let reasons = collected
            .iter()
            .flat_map(|c| c.failures.iter())
            .map(|f| format!("{}: {}", f.source, f.error))
            .collect::<Vec<_>>();
        return Err(if reasons.is_empty() {
            format!("no {domain} source configured for polling")
        } else {
            reasons.join("; ")
        });
    }
    let mut batch = ValidatedBatch::empty(domain);
    for c in collected {
        if batch.absorb(c.batch).is_err() {
            warn!(%domain, "polled batch belonged to another domain");
        }
    }
    Ok(batch)
}
