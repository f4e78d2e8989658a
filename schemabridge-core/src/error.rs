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

//! Error taxonomy for the performance layer.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = PerfError> = std::result::Result<T, E>;

/// Failure raised by an external tool handler.
///
/// Carried through the layer verbatim and never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct ToolError {
    /// Stable machine-readable code (e.g. `TOOL_NOT_FOUND`)
    pub code: String,
    /// Human-readable description
    pub message: String,
    /// Optional structured payload from the handler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ToolError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(tool: &str) -> Self {
        Self::new("TOOL_NOT_FOUND", format!("Unknown tool: {}", tool))
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new("INVALID_ARGUMENTS", message)
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::new("EXECUTION_FAILED", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Errors produced by the pool, cache, batch coordinator and dispatcher.
///
/// Every variant is returned only to the caller whose operation triggered it.
#[derive(Debug, Clone, Error)]
pub enum PerfError {
    #[error("Resource pool exhausted: no handle became available within {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("Resource pool is closed")]
    PoolClosed,

    #[error("Failed to create pooled resource: {0}")]
    ResourceCreation(String),

    #[error("Batched call {call_id} timed out after {waited:?} in queue")]
    BatchTimeout { call_id: u64, waited: Duration },

    #[error("Batch queue cleared before call {call_id} was dispatched")]
    BatchCleared { call_id: u64 },

    #[error("Batch handler returned no result for call {call_id}")]
    BatchResultMissing { call_id: u64 },

    #[error("Tool handler failed: {0}")]
    Handler(#[from] ToolError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PerfError {
    /// Stable code for logs and API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PoolExhausted { .. } => "POOL_EXHAUSTED",
            Self::PoolClosed => "POOL_CLOSED",
            Self::ResourceCreation(_) => "RESOURCE_CREATION_FAILED",
            Self::BatchTimeout { .. } => "BATCH_TIMEOUT",
            Self::BatchCleared { .. } => "BATCH_CLEARED",
            Self::BatchResultMissing { .. } => "BATCH_RESULT_MISSING",
            Self::Handler(_) => "HANDLER_FAILED",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
        }
    }

    /// Whether the failure came from capacity pressure rather than the request itself.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. } | Self::BatchTimeout { .. } | Self::PoolClosed
        )
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}
