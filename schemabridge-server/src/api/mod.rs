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

//! HTTP API

pub mod health;
pub mod metrics;
pub mod tools;

use crate::dispatcher::Dispatcher;
use crate::tools::ToolRegistry;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use schemabridge_core::PerfError;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

pub use health::health_check;
pub use metrics::{get_alerts, get_metrics, get_snapshots, get_stats};
pub use tools::{call_tool, list_tools};

/// API error types
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Dispatch(#[from] PerfError),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Dispatch(err) => match err {
                PerfError::PoolExhausted { .. }
                | PerfError::PoolClosed
                | PerfError::BatchCleared { .. } => StatusCode::SERVICE_UNAVAILABLE,
                PerfError::BatchTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                PerfError::ResourceCreation(_) | PerfError::BatchResultMissing { .. } => {
                    StatusCode::BAD_GATEWAY
                }
                PerfError::Handler(tool) => match tool.code.as_str() {
                    "TOOL_NOT_FOUND" => StatusCode::NOT_FOUND,
                    "INVALID_ARGUMENTS" => StatusCode::BAD_REQUEST,
                    _ => StatusCode::UNPROCESSABLE_ENTITY,
                },
                PerfError::InvalidConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::BadRequest(msg) => ErrorResponse {
                error: msg,
                code: "BAD_REQUEST".to_string(),
                details: None,
            },
            // Handler failures reach the client verbatim
            ApiError::Dispatch(PerfError::Handler(tool)) => ErrorResponse {
                error: tool.message,
                code: tool.code,
                details: tool.details,
            },
            ApiError::Dispatch(err) => ErrorResponse {
                error: err.to_string(),
                code: err.code().to_string(),
                details: None,
            },
        };

        (status, Json(body)).into_response()
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<ToolRegistry>,
    pub started_at: Instant,
}

/// API routes without middleware
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/tools", get(list_tools))
        .route("/api/v1/tools/call", post(call_tool))
        .route("/api/v1/metrics", get(get_metrics))
        .route("/api/v1/metrics/alerts", get(get_alerts))
        .route("/api/v1/metrics/snapshots", get(get_snapshots))
        .route("/api/v1/stats", get(get_stats))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemabridge_core::ToolError;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                PerfError::PoolExhausted {
                    waited: Duration::from_millis(5),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                PerfError::BatchTimeout {
                    call_id: 1,
                    waited: Duration::from_secs(1),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                PerfError::BatchResultMissing { call_id: 2 },
                StatusCode::BAD_GATEWAY,
            ),
            (
                PerfError::Handler(ToolError::not_found("nope")),
                StatusCode::NOT_FOUND,
            ),
            (
                PerfError::Handler(ToolError::new("SCHEMA_INVALID", "bad schema")),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }
}
