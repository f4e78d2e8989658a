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

//! Tool listing and invocation endpoints

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::api::{ApiError, AppState};
use crate::tools::ToolDescriptor;

#[derive(Debug, Serialize)]
pub struct ToolListResponse {
    pub tools: Vec<ToolDescriptor>,
}

/// GET /api/v1/tools
pub async fn list_tools(State(state): State<AppState>) -> Json<ToolListResponse> {
    Json(ToolListResponse {
        tools: state.registry.list(),
    })
}

#[derive(Debug, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default = "empty_arguments")]
    pub arguments: Value,
    /// Route through the batch coordinator instead of the cached path
    #[serde(default)]
    pub batched: bool,
}

fn empty_arguments() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Serialize)]
pub struct ToolCallResponse {
    pub name: String,
    pub result: Value,
}

/// POST /api/v1/tools/call
pub async fn call_tool(
    State(state): State<AppState>,
    Json(request): Json<ToolCallRequest>,
) -> Result<Json<ToolCallResponse>, ApiError> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }

    debug!(tool = name, batched = request.batched, "Tool call requested");

    let result = if request.batched {
        state
            .dispatcher
            .dispatch_batched(name, request.arguments)
            .await?
    } else {
        state.dispatcher.dispatch(name, request.arguments).await?
    };

    Ok(Json(ToolCallResponse {
        name: name.to_string(),
        result,
    }))
}
