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

//! End-to-end dispatch through the registry, pool, cache and batcher

use async_trait::async_trait;
use schemabridge_core::{PerfError, ToolError};
use schemabridge_server::{
    BatchConfig, CacheConfig, Dispatcher, DispatcherConfig, EvictionStrategy, PoolConfig,
    SessionFactory, ToolHandler, ToolRegistry,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Pretends to convert a schema, counting real executions
#[derive(Default)]
struct ConvertHandler {
    executions: AtomicUsize,
}

#[async_trait]
impl ToolHandler for ConvertHandler {
    fn name(&self) -> &str {
        "openapi_to_asyncapi"
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let title = arguments
            .pointer("/spec/info/title")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::invalid_arguments("spec.info.title is required"))?;
        Ok(json!({ "asyncapi": "2.6.0", "info": { "title": title } }))
    }
}

fn build(config: DispatcherConfig) -> (Arc<Dispatcher>, Arc<ConvertHandler>) {
    let registry = ToolRegistry::with_builtins();
    let convert = Arc::new(ConvertHandler::default());
    registry.register(convert.clone());

    let dispatcher = Dispatcher::new(
        config,
        Arc::new(registry),
        SessionFactory {
            open_delay: Duration::ZERO,
        },
    )
    .unwrap();
    (Arc::new(dispatcher), convert)
}

#[tokio::test(start_paused = true)]
async fn test_equivalent_payloads_share_cached_result() {
    let (dispatcher, convert) = build(DispatcherConfig::default());

    let a: Value = serde_json::from_str(
        r#"{"spec": {"openapi": "3.0.0", "info": {"title": "Orders", "version": "1"}}}"#,
    )
    .unwrap();
    let b: Value = serde_json::from_str(
        r#"{"spec": {"info": {"version": "1", "title": "Orders"}, "openapi": "3.0.0"}}"#,
    )
    .unwrap();

    let first = dispatcher.dispatch("openapi_to_asyncapi", a).await.unwrap();
    let second = dispatcher.dispatch("openapi_to_asyncapi", b).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(convert.executions.load(Ordering::SeqCst), 1);

    let stats = dispatcher.stats();
    assert_eq!(stats.cache.hits, 1);
    assert_eq!(stats.cache.misses, 1);
    assert_eq!(stats.metrics.success_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_arguments_surface_unchanged() {
    let (dispatcher, convert) = build(DispatcherConfig::default());

    let err = dispatcher
        .dispatch("openapi_to_asyncapi", json!({ "spec": {} }))
        .await
        .unwrap_err();

    match err {
        PerfError::Handler(tool) => {
            assert_eq!(tool.code, "INVALID_ARGUMENTS");
            assert!(tool.message.contains("title"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(convert.executions.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.metrics().compute_metrics().error_rate, 100.0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_calls_share_bounded_pool() {
    let (dispatcher, _) = build(DispatcherConfig {
        pool: PoolConfig {
            min_size: 0,
            max_size: 2,
            connection_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(5),
            ..Default::default()
        },
        ..Default::default()
    });

    let mut calls = Vec::new();
    for i in 0..6 {
        let dispatcher = dispatcher.clone();
        calls.push(tokio::spawn(async move {
            dispatcher.dispatch("sleep", json!({ "ms": 20, "call": i })).await
        }));
    }
    for call in calls {
        assert!(call.await.unwrap().is_ok());
    }

    let pool = dispatcher.pool().stats();
    assert!(pool.total <= 2);
    assert_eq!(pool.created_total, 2);
    assert_eq!(pool.active, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cache_capacity_is_enforced_through_dispatch() {
    let (dispatcher, _) = build(DispatcherConfig {
        cache: CacheConfig {
            max_size: 2,
            strategy: EvictionStrategy::Lru,
            ..Default::default()
        },
        ..Default::default()
    });

    for i in 0..5 {
        dispatcher.dispatch("echo", json!({ "n": i })).await.unwrap();
    }

    let cache = dispatcher.cache().stats();
    assert_eq!(cache.size, 2);
    assert_eq!(cache.evictions, 3);
}

#[tokio::test(start_paused = true)]
async fn test_batched_calls_coalesce_per_operation() {
    let (dispatcher, _) = build(DispatcherConfig {
        batch: BatchConfig {
            batch_size: 10,
            batch_window: Duration::from_millis(25),
            max_wait_time: Duration::from_millis(500),
        },
        ..Default::default()
    });

    let (a, b, c) = tokio::join!(
        dispatcher.dispatch_batched("echo", json!("a")),
        dispatcher.dispatch_batched("echo", json!("b")),
        dispatcher.dispatch_batched("missing_tool", json!("c")),
    );

    assert_eq!(a.unwrap(), json!("a"));
    assert_eq!(b.unwrap(), json!("b"));
    match c.unwrap_err() {
        PerfError::Handler(tool) => assert_eq!(tool.code, "TOOL_NOT_FOUND"),
        other => panic!("unexpected error: {:?}", other),
    }

    let stats = dispatcher.stats();
    assert_eq!(stats.batch.batches, 1);
    assert_eq!(stats.batch.resolved, 2);
    assert_eq!(stats.batch.failed, 1);
    assert_eq!(stats.metrics.request_count, 3);
    assert_eq!(stats.metrics.error_count, 1);
}
