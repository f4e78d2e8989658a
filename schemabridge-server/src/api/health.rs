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

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use schemabridge_observability::AlertLevel;
use serde::Serialize;
use tracing::debug;

use crate::api::AppState;

/// Health check response structure
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub pool: PoolHealth,
    pub requests_total: u64,
    pub active_alerts: usize,
}

#[derive(Debug, Serialize)]
pub struct PoolHealth {
    pub total: usize,
    pub active: usize,
    pub max_size: usize,
}

/// GET /health
///
/// Reports `degraded` while any error-level alert is active.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    debug!("Health check requested");

    let pool = state.dispatcher.pool().stats();
    let metrics = state.dispatcher.metrics();
    let alerts = metrics.check_alerts();
    let degraded = alerts.iter().any(|a| a.level == AlertLevel::Error);

    let health = HealthResponse {
        status: if degraded { "degraded" } else { "healthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        pool: PoolHealth {
            total: pool.total,
            active: pool.active,
            max_size: pool.max_size,
        },
        requests_total: metrics.compute_metrics().request_count,
        active_alerts: alerts.len(),
    };

    (StatusCode::OK, Json(health))
}
