//! Runs domain pipelines as tracked jobs, on a cron schedule or on demand.

use std::future::Future;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use energy_core::{Domain, JobCompletion, TerminalStatus, TimeRange};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::ScheduleSettings;
use crate::jobs::JobTracker;
use crate::pipeline::{DomainPipeline, IngestReport};
use crate::weather::{GapFillReport, WeatherPipeline};

#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub job_id: i64,
    pub job_name: String,
    pub status: TerminalStatus,
    pub report: IngestReport,
}

pub struct Orchestrator {
    tracker: JobTracker,
    pipelines: Vec<Arc<dyn DomainPipeline>>,
    gap_filler: Option<Arc<WeatherPipeline>>,
    schedules: ScheduleSettings,
    historical_chunk: chrono::Duration,
    /// One job at a time, scheduled or manual.
    run_lock: Mutex<()>,
    scheduler: Mutex<Option<JobScheduler>>,
}

/// tokio-cron-scheduler wants a seconds field; accept classic five-field
/// expressions by pinning seconds to zero.
pub fn scheduler_expression(cron: &str) -> String {
    let fields = cron.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", cron.trim())
    } else {
        cron.trim().to_string()
    }
}

/// Run the pipeline future on its own task so a panic becomes a failed
/// report instead of tearing down the caller.
async fn isolated<F>(domain: Domain, fut: F) -> IngestReport
where
    F: Future<Output = IngestReport> + Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(report) => report,
        Err(err) => {
            error!(%domain, error = %err, "pipeline task aborted");
            IngestReport::failed(domain, format!("pipeline task aborted: {err}"))
        }
    }
}

impl Orchestrator {
    pub fn new(
        tracker: JobTracker,
        pipelines: Vec<Arc<dyn DomainPipeline>>,
        schedules: ScheduleSettings,
        historical_chunk: chrono::Duration,
    ) -> Self {
        Self {
            tracker,
            pipelines,
            gap_filler: None,
            schedules,
            historical_chunk,
            run_lock: Mutex::new(()),
            scheduler: Mutex::new(None),
        }
    }

    pub fn with_gap_filler(mut self, weather: Arc<WeatherPipeline>) -> Self {
        self.gap_filler = Some(weather);
        self
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    pub fn pipeline(&self, domain: Domain) -> Option<Arc<dyn DomainPipeline>> {
        self.pipelines.iter().find(|p| p.domain() == domain).cloned()
    }

    pub fn pipelines(&self) -> &[Arc<dyn DomainPipeline>] {
        &self.pipelines
    }

    fn cron_for(&self, domain: Domain) -> &str {
        match domain {
            Domain::Household => &self.schedules.household,
            Domain::Weather => &self.schedules.weather,
            Domain::Grid => &self.schedules.grid,
        }
    }

    async fn finish(&self, job_id: i64, job_name: String, report: IngestReport) -> Result<JobRun> {
        let completion: JobCompletion = report.completion();
        self.tracker
            .complete_job(job_id, &completion)
            .await
            .with_context(|| format!("recording outcome of job {job_id}"))?;
        Ok(JobRun {
            job_id,
            job_name,
            status: completion.status,
            report,
        })
    }

    /// One tracked batch run. Pipeline failures end up in the job record;
    /// only an unreachable job log is returned as an error.
    pub async fn run_job(&self, domain: Domain) -> Result<JobRun> {
        let pipeline = self
            .pipeline(domain)
            .with_context(|| format!("no {domain} pipeline configured"))?;
        let _turn = self.run_lock.lock().await;

        let job_id = self
            .tracker
            .start_job(pipeline.job_name(), pipeline.data_source())
            .await
            .context("recording job start")?;
        let span = info_span!("ingest_job", %domain, job_id);
        let task = {
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.ingest_batch().await }.instrument(span)
        };
        let report = isolated(domain, task).await;
        if let Some(message) = &report.failure {
            warn!(%domain, job_id, error = %message, "ingestion job failed");
        }
        self.finish(job_id, pipeline.job_name().to_string(), report).await
    }

    /// Every configured domain in turn.
    pub async fn run_all(&self) -> Result<Vec<JobRun>> {
        let mut runs = Vec::with_capacity(self.pipelines.len());
        for domain in Domain::ALL {
            if self.pipeline(domain).is_some() {
                runs.push(self.run_job(domain).await?);
            }
        }
        Ok(runs)
    }

    /// Ingest an explicit range in chunks; each chunk starts one hour after
    /// the previous one ends. A failed chunk stops the run and is returned
    /// as an error after the job is recorded.
    pub async fn run_historical(&self, domain: Domain, range: TimeRange) -> Result<JobRun> {
        let pipeline = self
            .pipeline(domain)
            .with_context(|| format!("no {domain} pipeline configured"))?;
        let _turn = self.run_lock.lock().await;

        let job_name = format!("historical_{domain}");
        let job_id = self
            .tracker
            .start_job(&job_name, pipeline.data_source())
            .await
            .context("recording job start")?;

        let chunks = range.chunks(self.historical_chunk, chrono::Duration::hours(1));
        info!(%domain, job_id, chunks = chunks.len(), start = %range.start, end = %range.end, "historical run started");
        let mut report = IngestReport::empty(domain);
        for (idx, chunk) in chunks.into_iter().enumerate() {
            let span = info_span!("historical_chunk", %domain, chunk = idx);
            let task = {
                let pipeline = Arc::clone(&pipeline);
                async move { pipeline.process_historical(chunk).await }.instrument(span)
            };
            report.merge(isolated(domain, task).await);
            if report.is_failure() {
                break;
            }
        }

        let run = self.finish(job_id, job_name, report).await?;
        if let Some(message) = &run.report.failure {
            bail!("historical {domain} run failed: {message}");
        }
        Ok(run)
    }

    /// Detect and fill weather gaps as one tracked job.
    pub async fn backfill_gaps(&self) -> Result<Vec<GapFillReport>> {
        let Some(weather) = self.gap_filler.clone() else {
            bail!("gap backfill needs the weather pipeline");
        };
        let _turn = self.run_lock.lock().await;
        let job_id = self
            .tracker
            .start_job("weather_gap_backfill", weather.data_source())
            .await
            .context("recording job start")?;

        let outcome = tokio::spawn(
            async move { weather.fill_gaps().await }.instrument(info_span!("gap_backfill", job_id)),
        )
        .await;

        let (reports, report) = match outcome {
            Ok(Ok(reports)) => {
                let mut total = IngestReport::empty(Domain::Weather);
                for r in &reports {
                    total.merge(r.ingest.clone());
                }
                (reports, total)
            }
            Ok(Err(err)) => (Vec::new(), IngestReport::failed(Domain::Weather, err.to_string())),
            Err(err) => (
                Vec::new(),
                IngestReport::failed(Domain::Weather, format!("gap backfill aborted: {err}")),
            ),
        };

        let run = self.finish(job_id, "weather_gap_backfill".to_string(), report).await?;
        if let Some(message) = &run.report.failure {
            bail!("gap backfill failed: {message}");
        }
        Ok(reports)
    }

    /// Register one cron job per pipeline and start the scheduler.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for pipeline in &self.pipelines {
            let domain = pipeline.domain();
            let cron = scheduler_expression(self.cron_for(domain));
            let orchestrator = Arc::clone(self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let orchestrator = Arc::clone(&orchestrator);
                Box::pin(async move {
                    if let Err(err) = orchestrator.run_job(domain).await {
                        error!(%domain, error = %err, "scheduled job could not be recorded");
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for {domain} cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
            info!(%domain, %cron, "scheduled");
        }
        sched.start().await.context("starting scheduler")?;
        *self.scheduler.lock().await = Some(sched);
        Ok(())
    }

    /// Stop scheduling; waits for a job in progress to finish.
    pub async fn stop(&self) -> Result<()> {
        let sched = self.scheduler.lock().await.take();
        if let Some(mut sched) = sched {
            sched.shutdown().await.context("stopping scheduler")?;
        }
        let _turn = self.run_lock.lock().await;
        info!("scheduler stopped");
        Ok(())
    }
}
