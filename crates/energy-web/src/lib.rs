//! Read-only JSON status surface over the ingestion job log.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use energy_core::{Domain, DomainSchema};
use energy_storage::{StoreError, TimeSeriesStore};
use energy_sync::{JobTracker, SyncRuntime};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "energy-web";

const DEFAULT_RECENT_LIMIT: usize = 20;
const MAX_RECENT_LIMIT: usize = 500;
const DEFAULT_WINDOW_DAYS: i64 = 7;

#[derive(Clone)]
pub struct AppState {
    pub tracker: JobTracker,
    pub store: Arc<dyn TimeSeriesStore>,
}

impl AppState {
    pub fn new(tracker: JobTracker, store: Arc<dyn TimeSeriesStore>) -> Self {
        Self { tracker, store }
    }

    pub fn from_runtime(runtime: &SyncRuntime) -> Self {
        Self::new(runtime.tracker.clone(), runtime.store.clone())
    }
}

#[derive(Debug, Default, Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct WindowQuery {
    days: Option<i64>,
}

impl WindowQuery {
    fn days(&self) -> Result<i64, Response> {
        match self.days {
            None => Ok(DEFAULT_WINDOW_DAYS),
            Some(d) if d >= 1 => Ok(d),
            Some(d) => Err(bad_request(format!("days must be at least 1, got {d}"))),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthBody {
    service: &'static str,
    status: &'static str,
    store_reachable: bool,
    row_counts: BTreeMap<Domain, u64>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs/recent", get(recent_jobs_handler))
        .route("/jobs/stats", get(job_stats_handler))
        .route("/jobs/failed", get(failed_jobs_handler))
        .with_state(Arc::new(state))
}

/// Serve until Ctrl-C.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "status server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "could not listen for ctrl-c");
            }
        })
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut body = HealthBody {
        service: CRATE_NAME,
        status: "ok",
        store_reachable: true,
        row_counts: BTreeMap::new(),
    };
    if let Err(err) = state.store.ping().await {
        warn!(error = %err, "health check could not reach the store");
        body.status = "degraded";
        body.store_reachable = false;
        return (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
    }
    for domain in Domain::ALL {
        match state.store.count_rows(DomainSchema::for_domain(domain)).await {
            Ok(n) => {
                body.row_counts.insert(domain, n);
            }
            Err(err) => return store_error(err),
        }
    }
    Json(body).into_response()
}

async fn recent_jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_LIMIT).min(MAX_RECENT_LIMIT);
    match state.tracker.recent_jobs(limit).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(err) => store_error(err),
    }
}

async fn job_stats_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> Response {
    let days = match query.days() {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    match state.tracker.job_statistics(days).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => store_error(err),
    }
}

async fn failed_jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> Response {
    let days = match query.days() {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    match state.tracker.failed_jobs(days).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(err) => store_error(err),
    }
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn store_error(err: StoreError) -> Response {
    let status = if err.is_connectivity() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    warn!(error = %err, "status query failed");
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use energy_core::{IngestionJob, JobCompletion, JobStatistics, JobStatus};
    use energy_storage::{JobLog, MemoryStore};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn state(store: &Arc<MemoryStore>) -> AppState {
        AppState::new(
            JobTracker::new(store.clone() as Arc<dyn JobLog>),
            store.clone() as Arc<dyn TimeSeriesStore>,
        )
    }

    async fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let tracker = JobTracker::new(store.clone() as Arc<dyn JobLog>);
        let ok = tracker.start_job("batch_grid_ingestion", "Open Power System Data").await.unwrap();
        tracker.complete_job(ok, &JobCompletion::completed(48, 48)).await.unwrap();
        let bad = tracker.start_job("batch_weather_ingestion", "Open-Meteo API").await.unwrap();
        tracker
            .complete_job(bad, &JobCompletion::failed("store unreachable: connection refused"))
            .await
            .unwrap();
        tracker.start_job("batch_household_processing", "UCI Household Files").await.unwrap();
        store
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn handler_smoke_health() {
        let store = Arc::new(MemoryStore::new());
        let (status, body) = get_json(app(state(&store)), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["row_counts"]["grid"], 0);

        store.set_offline(true);
        let (status, body) = get_json(app(state(&store)), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["store_reachable"], false);
    }

    #[tokio::test]
    async fn handler_smoke_recent_jobs_respects_limit() {
        let store = seeded().await;
        let (status, body) = get_json(app(state(&store)), "/jobs/recent?limit=2").await;
        assert_eq!(status, StatusCode::OK);
        let jobs: Vec<IngestionJob> = serde_json::from_value(body).unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs[0].start_time >= jobs[1].start_time);
    }

    #[tokio::test]
    async fn handler_smoke_stats_and_failures() {
        let store = seeded().await;
        let app = app(state(&store));

        let (status, body) = get_json(app.clone(), "/jobs/stats?days=1").await;
        assert_eq!(status, StatusCode::OK);
        let stats: JobStatistics = serde_json::from_value(body).unwrap();
        assert_eq!(stats.total_jobs, 3);
        assert_eq!(stats.successful_jobs, 1);
        assert_eq!(stats.failed_jobs, 1);
        assert_eq!(stats.running_jobs, 1);

        let (status, body) = get_json(app, "/jobs/failed").await;
        assert_eq!(status, StatusCode::OK);
        let failed: Vec<IngestionJob> = serde_json::from_value(body).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, JobStatus::Failed);
        assert!(failed[0].error_message.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn handler_smoke_rejects_bad_window_and_offline_store() {
        let store = seeded().await;
        let (status, body) = get_json(app(state(&store)), "/jobs/stats?days=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("days"));

        store.set_offline(true);
        let (status, _) = get_json(app(state(&store)), "/jobs/recent").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
