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

//! Tool invocation contract
//!
//! The performance layer never looks inside a tool call. It hands an operation
//! name and a JSON payload to a [`ToolInvoker`] and gets back a JSON value or a
//! [`ToolError`].

use crate::error::ToolError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// One call inside a coalesced batch.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub id: u64,
    pub argument: Value,
}

/// Results of a batch invocation keyed by call id.
pub type BatchOutput = HashMap<u64, Value>;

/// Backend that executes tool calls.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Execute a single call.
    async fn invoke(&self, operation: &str, arguments: Value) -> Result<Value, ToolError>;

    /// Execute a group of calls to the same operation.
    ///
    /// The default runs every item through [`ToolInvoker::invoke`] concurrently and
    /// fails the whole group on the first error. Backends with a native bulk path
    /// should override this.
    async fn invoke_batch(
        &self,
        operation: &str,
        items: Vec<BatchItem>,
    ) -> Result<BatchOutput, ToolError> {
        let calls = items.into_iter().map(|item| async move {
            let value = self.invoke(operation, item.argument).await?;
            Ok::<_, ToolError>((item.id, value))
        });

        let results = futures::future::try_join_all(calls).await?;
        Ok(results.into_iter().collect())
    }

    /// Whether results of `operation` may be served from the response cache.
    fn cacheable(&self, _operation: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Doubler;

    #[async_trait]
    impl ToolInvoker for Doubler {
        async fn invoke(&self, _operation: &str, arguments: Value) -> Result<Value, ToolError> {
            let n = arguments
                .as_i64()
                .ok_or_else(|| ToolError::invalid_arguments("expected integer"))?;
            Ok(json!(n * 2))
        }
    }

    #[tokio::test]
    async fn test_default_batch_maps_results_by_id() {
        let items = vec![
            BatchItem { id: 10, argument: json!(1) },
            BatchItem { id: 11, argument: json!(5) },
        ];

        let output = Doubler.invoke_batch("double", items).await.unwrap();
        assert_eq!(output.len(), 2);
        assert_eq!(output[&10], json!(2));
        assert_eq!(output[&11], json!(10));
    }

    #[tokio::test]
    async fn test_default_batch_fails_whole_group() {
        let items = vec![
            BatchItem { id: 1, argument: json!(1) },
            BatchItem { id: 2, argument: json!("nope") },
        ];

        let err = Doubler.invoke_batch("double", items).await.unwrap_err();
        assert_eq!(err.code, "INVALID_ARGUMENTS");
    }
}
