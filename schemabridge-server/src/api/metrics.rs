// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Read-only metrics and statistics endpoints

use axum::{
    extract::{Query, State},
    Json,
};
use schemabridge_observability::{Alert, PerformanceMetrics, PerformanceSnapshot};
use serde::{Deserialize, Serialize};

use crate::api::{ApiError, AppState};
use crate::dispatcher::DispatcherStats;

const DEFAULT_SNAPSHOT_LIMIT: usize = 100;
const MAX_SNAPSHOT_LIMIT: usize = 1000;

/// GET /api/v1/metrics
pub async fn get_metrics(State(state): State<AppState>) -> Json<PerformanceMetrics> {
    Json(state.dispatcher.metrics().compute_metrics())
}

#[derive(Debug, Serialize)]
pub struct AlertsResponse {
    pub alerts: Vec<Alert>,
}

/// GET /api/v1/metrics/alerts
pub async fn get_alerts(State(state): State<AppState>) -> Json<AlertsResponse> {
    Json(AlertsResponse {
        alerts: state.dispatcher.metrics().check_alerts(),
    })
}

#[derive(Debug, Deserialize)]
pub struct SnapshotQueryParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SnapshotsResponse {
    pub snapshots: Vec<PerformanceSnapshot>,
    pub count: usize,
}

/// GET /api/v1/metrics/snapshots?limit=N
pub async fn get_snapshots(
    State(state): State<AppState>,
    Query(params): Query<SnapshotQueryParams>,
) -> Result<Json<SnapshotsResponse>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_SNAPSHOT_LIMIT);
    if limit == 0 || limit > MAX_SNAPSHOT_LIMIT {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {} (got {})",
            MAX_SNAPSHOT_LIMIT, limit
        )));
    }

    let snapshots = state.dispatcher.metrics().snapshots(Some(limit));
    Ok(Json(SnapshotsResponse {
        count: snapshots.len(),
        snapshots,
    }))
}

/// GET /api/v1/stats
pub async fn get_stats(State(state): State<AppState>) -> Json<DispatcherStats> {
    Json(state.dispatcher.stats())
}
