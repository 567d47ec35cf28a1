//! Job lifecycle recording and the status queries built on it.

use std::sync::Arc;

use chrono::{Duration, Utc};
use energy_core::{IngestionJob, JobCompletion, JobStatistics};
use energy_storage::{JobLog, StoreError};
use tracing::{info, warn};

#[derive(Clone)]
pub struct JobTracker {
    log: Arc<dyn JobLog>,
}

impl JobTracker {
    pub fn new(log: Arc<dyn JobLog>) -> Self {
        Self { log }
    }

    /// Open a `running` job stamped with the current time.
    pub async fn start_job(&self, job_name: &str, data_source: &str) -> Result<i64, StoreError> {
        let job_id = self.log.insert_job(job_name, data_source, Utc::now()).await?;
        info!(job_id, job_name, data_source, "job started");
        Ok(job_id)
    }

    /// Apply the single terminal transition. Later calls for the same job
    /// leave the first outcome in place and return `false`.
    pub async fn complete_job(
        &self,
        job_id: i64,
        completion: &JobCompletion,
    ) -> Result<bool, StoreError> {
        let applied = self.log.finish_job(job_id, completion, Utc::now()).await?;
        if applied {
            info!(
                job_id,
                status = ?completion.status,
                processed = completion.records_processed,
                inserted = completion.records_inserted,
                "job finished"
            );
        } else {
            warn!(job_id, "job already finished or unknown; keeping the first outcome");
        }
        Ok(applied)
    }

    pub async fn recent_jobs(&self, limit: usize) -> Result<Vec<IngestionJob>, StoreError> {
        self.log.recent_jobs(limit).await
    }

    pub async fn job_statistics(&self, days: i64) -> Result<JobStatistics, StoreError> {
        let since = Utc::now() - Duration::days(days);
        let jobs = self.log.jobs_since(since).await?;
        Ok(JobStatistics::from_jobs(since, &jobs))
    }

    pub async fn failed_jobs(&self, days: i64) -> Result<Vec<IngestionJob>, StoreError> {
        self.log
            .failed_jobs_since(Utc::now() - Duration::days(days))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use energy_core::JobStatus;
    use energy_storage::MemoryStore;

    fn tracker() -> (Arc<MemoryStore>, JobTracker) {
        let store = Arc::new(MemoryStore::new());
        let tracker = JobTracker::new(store.clone() as Arc<dyn JobLog>);
        (store, tracker)
    }

    #[tokio::test]
    async fn first_completion_is_authoritative() {
        let (store, tracker) = tracker();
        let id = tracker.start_job("batch_grid_ingestion", "Open Power System Data").await.unwrap();

        assert!(tracker.complete_job(id, &JobCompletion::completed(10, 8)).await.unwrap());
        assert!(!tracker.complete_job(id, &JobCompletion::failed("late")).await.unwrap());

        let job = &store.jobs().await[0];
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.records_inserted, 8);
        assert!(job.error_message.is_none());
        assert!(job.end_time.unwrap() >= job.start_time);
    }

    #[tokio::test]
    async fn statistics_and_failure_listing() {
        let (_store, tracker) = tracker();
        let ok = tracker.start_job("batch_weather_ingestion", "Open-Meteo API").await.unwrap();
        tracker.complete_job(ok, &JobCompletion::completed(24, 24)).await.unwrap();
        let bad = tracker.start_job("batch_grid_ingestion", "Open Power System Data").await.unwrap();
        tracker
            .complete_job(bad, &JobCompletion::failed("store unreachable: connection refused"))
            .await
            .unwrap();
        tracker.start_job("batch_household_processing", "UCI Household Files").await.unwrap();

        let stats = tracker.job_statistics(7).await.unwrap();
        assert_eq!(stats.total_jobs, 3);
        assert_eq!(stats.successful_jobs, 1);
        assert_eq!(stats.failed_jobs, 1);
        assert_eq!(stats.running_jobs, 1);
        assert_eq!(stats.total_records_inserted, 24);

        let failed = tracker.failed_jobs(7).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].job_name, "batch_grid_ingestion");
        assert_eq!(tracker.recent_jobs(2).await.unwrap().len(), 2);
    }
}
