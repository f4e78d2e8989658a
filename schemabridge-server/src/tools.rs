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

//! Tool Handler Registry
//!
//! Named handlers the dispatcher routes calls to. The registry itself is the
//! [`ToolInvoker`] handed to the dispatcher and the batch coordinator.

use async_trait::async_trait;
use dashmap::DashMap;
use schemabridge_core::{BatchItem, BatchOutput, ToolError, ToolInvoker};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for the `sleep` tool
const MAX_SLEEP_MS: u64 = 60_000;

/// A single named tool
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError>;

    /// Execute a coalesced group. Defaults to one `execute` per item.
    async fn execute_batch(&self, items: Vec<BatchItem>) -> Result<BatchOutput, ToolError> {
        let mut output = BatchOutput::with_capacity(items.len());
        for item in items {
            let value = self.execute(item.argument).await?;
            output.insert(item.id, value);
        }
        Ok(output)
    }

    fn description(&self) -> &str {
        ""
    }

    /// Tools with side effects or timing behavior opt out of response caching.
    fn cacheable(&self) -> bool {
        true
    }
}

/// Listing entry for a registered tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub cacheable: bool,
}

/// Registry of tool handlers keyed by name
pub struct ToolRegistry {
    handlers: DashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Registry preloaded with the built-in tools
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(EchoHandler));
        registry.register(Arc::new(SleepHandler));
        registry
    }

    /// Register a handler, replacing any previous handler with the same name
    pub fn register(&self, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).map(|h| h.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered tools sorted by name
    pub fn list(&self) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self
            .handlers
            .iter()
            .map(|entry| ToolDescriptor {
                name: entry.key().clone(),
                description: entry.value().description().to_string(),
                cacheable: entry.value().cacheable(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn ToolHandler>, ToolError> {
        self.get(name).ok_or_else(|| ToolError::not_found(name))
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolInvoker for ToolRegistry {
    async fn invoke(&self, operation: &str, arguments: Value) -> Result<Value, ToolError> {
        let handler = self.lookup(operation)?;
        handler.execute(arguments).await
    }

    async fn invoke_batch(
        &self,
        operation: &str,
        items: Vec<BatchItem>,
    ) -> Result<BatchOutput, ToolError> {
        let handler = self.lookup(operation)?;
        handler.execute_batch(items).await
    }

    fn cacheable(&self, operation: &str) -> bool {
        self.get(operation).map_or(true, |h| h.cacheable())
    }
}

/// Returns its arguments unchanged
pub struct EchoHandler;

#[async_trait]
impl ToolHandler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        Ok(arguments)
    }

    async fn execute_batch(&self, items: Vec<BatchItem>) -> Result<BatchOutput, ToolError> {
        Ok(items.into_iter().map(|i| (i.id, i.argument)).collect())
    }

    fn description(&self) -> &str {
        "Echoes back the input arguments"
    }
}

/// Sleeps for `{"ms": n}` milliseconds. Never served from the cache.
pub struct SleepHandler;

#[async_trait]
impl ToolHandler for SleepHandler {
    fn name(&self) -> &str {
        "sleep"
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let ms = match arguments.get("ms") {
            None => 100,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| ToolError::invalid_arguments("ms must be a non-negative integer"))?,
        };
        if ms > MAX_SLEEP_MS {
            return Err(ToolError::invalid_arguments(format!(
                "ms must not exceed {}",
                MAX_SLEEP_MS
            )));
        }

        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({ "slept_ms": ms }))
    }

    fn description(&self) -> &str {
        "Sleeps for the specified number of milliseconds"
    }

    fn cacheable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_through_registry() {
        let registry = ToolRegistry::with_builtins();

        let result = registry
            .invoke("echo", json!({ "hello": "world" }))
            .await
            .unwrap();
        assert_eq!(result, json!({ "hello": "world" }));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = ToolRegistry::new();

        let err = registry.invoke("nonexistent", json!({})).await.unwrap_err();
        assert_eq!(err.code, "TOOL_NOT_FOUND");

        let err = registry
            .invoke_batch("nonexistent", vec![BatchItem { id: 1, argument: json!(1) }])
            .await
            .unwrap_err();
        assert_eq!(err.code, "TOOL_NOT_FOUND");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_arguments() {
        let registry = ToolRegistry::with_builtins();

        let result = registry.invoke("sleep", json!({ "ms": 25 })).await.unwrap();
        assert_eq!(result, json!({ "slept_ms": 25 }));

        let err = registry
            .invoke("sleep", json!({ "ms": "soon" }))
            .await
            .unwrap_err();
        assert_eq!(err.code, "INVALID_ARGUMENTS");

        let err = registry
            .invoke("sleep", json!({ "ms": MAX_SLEEP_MS + 1 }))
            .await
            .unwrap_err();
        assert_eq!(err.code, "INVALID_ARGUMENTS");
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_execute_batch_runs_each_item() {
        let registry = ToolRegistry::with_builtins();
        let items = vec![
            BatchItem { id: 7, argument: json!({ "ms": 1 }) },
            BatchItem { id: 8, argument: json!({ "ms": 2 }) },
        ];

        let output = registry.invoke_batch("sleep", items).await.unwrap();
        assert_eq!(output[&7], json!({ "slept_ms": 1 }));
        assert_eq!(output[&8], json!({ "slept_ms": 2 }));
    }

    #[test]
    fn test_list_is_sorted() {
        let registry = ToolRegistry::with_builtins();
        let names: Vec<String> = registry.list().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["echo", "sleep"]);
        assert!(registry.contains("echo"));
    }

    #[test]
    fn test_sleep_is_not_cacheable() {
        let registry = ToolRegistry::with_builtins();
        assert!(registry.cacheable("echo"));
        assert!(!registry.cacheable("sleep"));
        assert!(registry.cacheable("nonexistent"));
    }
}
