//! The read-only HTTP surface collectors poll.
//!
//! Every handler serves from the snapshot current at request time; unknown
//! jobs and collectors yield empty bodies with status 200, never errors.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::cache::{CollectorView, LinkLabel, SnapshotCache};

pub fn router(cache: Arc<SnapshotCache>, timeout: Duration) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/:job_id/targets", get(job_targets))
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(cache)
}

async fn list_jobs(State(cache): State<Arc<SnapshotCache>>) -> Json<BTreeMap<String, LinkLabel>> {
    Json(cache.load().job_index.clone())
}

#[derive(Debug, Deserialize)]
struct TargetsParams {
    collector_id: Option<String>,
}

async fn job_targets(
    State(cache): State<Arc<SnapshotCache>>,
    Path(job_id): Path<String>,
    Query(params): Query<TargetsParams>,
) -> Response {
    let snapshot = cache.load();
    match params.collector_id {
        Some(collector_id) => Json(
            snapshot
                .collector_groups(&job_id, &collector_id)
                .cloned()
                .unwrap_or_default(),
        )
        .into_response(),
        None => Json(
            snapshot
                .job_view
                .get(&job_id)
                .cloned()
                .unwrap_or_else(BTreeMap::<String, CollectorView>::new),
        )
        .into_response(),
    }
}
