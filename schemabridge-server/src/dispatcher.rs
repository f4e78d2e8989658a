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

//! Request Dispatcher
//!
//! Wraps every tool call in the performance layer:
//!
//! ```text
//! start timer → acquire session → fingerprint → cache hit?  ── yes ─► return
//!                                                   │
//!                                                   no
//!                                                   ▼
//!                                   invoke handler → cache on success → return
//! ```
//!
//! The session guard and the latency timer are released on every exit path,
//! and every call is counted as exactly one success or one error.
//!
//! Operations the invoker reports as not cacheable skip the cache entirely.
//!
//! Batched calls go through the [`BatchCoordinator`] instead. They share the
//! metrics bookkeeping but neither hold a session nor touch the cache.

use crate::batcher::{BatchConfig, BatchCoordinator, BatchStats};
use crate::cache::{BoundedCache, CacheConfig, CacheStats};
use crate::pool::{PoolConfig, PoolStats, ResourceFactory, ResourcePool, SessionFactory};
use schemabridge_core::{CacheKey, Result, ToolInvoker};
use schemabridge_observability::{
    LatencyTimer, MetricsConfig, MetricsRecorder, PerformanceMetrics,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Component configuration for a [`Dispatcher`]
#[derive(Debug, Clone, Default)]
pub struct DispatcherConfig {
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub metrics: MetricsConfig,
}

/// Aggregated component statistics
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub pool: PoolStats,
    pub cache: CacheStats,
    pub batch: BatchStats,
    pub metrics: PerformanceMetrics,
}

/// Routes tool calls through the pool, cache, batcher and metrics recorder.
pub struct Dispatcher<F: ResourceFactory = SessionFactory> {
    invoker: Arc<dyn ToolInvoker>,
    pool: ResourcePool<F>,
    cache: BoundedCache<CacheKey, Value>,
    batcher: BatchCoordinator,
    metrics: MetricsRecorder,
}

impl<F: ResourceFactory> Dispatcher<F> {
    /// Build every component. Must be called from within a Tokio runtime.
    pub fn new(
        config: DispatcherConfig,
        invoker: Arc<dyn ToolInvoker>,
        factory: F,
    ) -> Result<Self> {
        let pool = ResourcePool::new(config.pool, factory)?;
        let cache = BoundedCache::new(config.cache)?;
        let batcher = BatchCoordinator::new(config.batch, invoker.clone())?;
        let metrics = MetricsRecorder::new(config.metrics);

        Ok(Self {
            invoker,
            pool,
            cache,
            batcher,
            metrics,
        })
    }

    /// Fill the pool up to its minimum size.
    pub async fn warm_up(&self) -> Result<()> {
        let report = self.pool.run_maintenance().await?;
        info!(sessions = report.created, "Session pool warmed up");
        Ok(())
    }

    /// Execute a call with pooling, caching and metrics.
    pub async fn dispatch(&self, operation: &str, arguments: Value) -> Result<Value> {
        let timer = self.metrics.record_start();
        let outcome = self.dispatch_direct(operation, arguments).await;
        record_outcome(timer, &outcome);
        outcome
    }

    /// Execute a call through the batch coordinator with metrics.
    pub async fn dispatch_batched(&self, operation: &str, arguments: Value) -> Result<Value> {
        let timer = self.metrics.record_start();
        let outcome = self.batcher.submit(operation, arguments).await;
        record_outcome(timer, &outcome);
        outcome
    }

    async fn dispatch_direct(&self, operation: &str, arguments: Value) -> Result<Value> {
        let session = self.pool.acquire().await?;

        if !self.invoker.cacheable(operation) {
            return Ok(self.invoker.invoke(operation, arguments).await?);
        }

        let key = CacheKey::for_call(operation, &arguments);
        if let Some(hit) = self.cache.get(&key) {
            debug!(operation, session = session.id(), "Cache hit");
            return Ok(hit);
        }

        let value = self.invoker.invoke(operation, arguments).await?;
        self.cache.set(key, value.clone(), None);
        Ok(value)
    }

    pub fn pool(&self) -> &ResourcePool<F> {
        &self.pool
    }

    pub fn cache(&self) -> &BoundedCache<CacheKey, Value> {
        &self.cache
    }

    pub fn batcher(&self) -> &BatchCoordinator {
        &self.batcher
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            pool: self.pool.stats(),
            cache: self.cache.stats(),
            batch: self.batcher.stats(),
            metrics: self.metrics.compute_metrics(),
        }
    }

    /// Fail queued batch calls, close the pool and stop the cache sweep.
    pub fn shutdown(&self) {
        let cleared = self.batcher.clear();
        self.pool.close();
        self.cache.shutdown();
        info!(cleared_batch_calls = cleared, "Dispatcher shut down");
    }
}

/// Close the timer with the call's outcome. A cancelled call drops its timer
/// instead, which counts as an error.
fn record_outcome(timer: LatencyTimer, outcome: &Result<Value>) {
    match outcome {
        Ok(_) => {
            timer.succeed();
        }
        Err(e) => {
            debug!(code = e.code(), error = %e, "Dispatch failed");
            timer.fail();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use schemabridge_core::{PerfError, ToolError};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingInvoker {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ToolInvoker for CountingInvoker {
        async fn invoke(&self, operation: &str, arguments: Value) -> std::result::Result<Value, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match operation {
                "fail" => Err(ToolError::new("SCHEMA_INVALID", "missing 'paths'")),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(arguments)
                }
                _ => Ok(json!({ "converted": arguments })),
            }
        }

        fn cacheable(&self, operation: &str) -> bool {
            operation != "fresh"
        }
    }

    fn dispatcher(pool: PoolConfig) -> (Dispatcher, Arc<CountingInvoker>) {
        let invoker = Arc::new(CountingInvoker::default());
        let config = DispatcherConfig {
            pool,
            batch: BatchConfig {
                batch_window: Duration::from_millis(20),
                ..Default::default()
            },
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(
            config,
            invoker.clone(),
            SessionFactory {
                open_delay: Duration::ZERO,
            },
        )
        .unwrap();
        (dispatcher, invoker)
    }

    fn small_pool() -> PoolConfig {
        PoolConfig {
            min_size: 0,
            max_size: 1,
            connection_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_calls_hit_cache() {
        let (dispatcher, invoker) = dispatcher(PoolConfig::default());

        let first = dispatcher
            .dispatch("openapi_to_asyncapi", json!({ "a": 1, "b": 2 }))
            .await
            .unwrap();
        let second = dispatcher
            .dispatch("openapi_to_asyncapi", json!({ "b": 2, "a": 1 }))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);

        let stats = dispatcher.stats();
        assert_eq!(stats.cache.hits, 1);
        assert_eq!(stats.metrics.request_count, 2);
        assert_eq!(stats.metrics.success_count, 2);
        assert_eq!(stats.pool.active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncacheable_operation_always_invokes() {
        let (dispatcher, invoker) = dispatcher(PoolConfig::default());

        for _ in 0..2 {
            dispatcher.dispatch("fresh", json!({ "a": 1 })).await.unwrap();
        }

        assert_eq!(invoker.calls.load(Ordering::SeqCst), 2);
        assert!(dispatcher.cache().is_empty());
        assert_eq!(dispatcher.stats().cache.misses, 0);
        assert_eq!(dispatcher.metrics().compute_metrics().success_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_errors_are_not_cached() {
        let (dispatcher, invoker) = dispatcher(PoolConfig::default());

        for _ in 0..2 {
            let err = dispatcher.dispatch("fail", json!({})).await.unwrap_err();
            match err {
                PerfError::Handler(inner) => assert_eq!(inner.code, "SCHEMA_INVALID"),
                other => panic!("unexpected error: {:?}", other),
            }
        }

        assert_eq!(invoker.calls.load(Ordering::SeqCst), 2);
        assert!(dispatcher.cache().is_empty());

        let metrics = dispatcher.metrics().compute_metrics();
        assert_eq!(metrics.error_count, 2);
        assert_eq!(metrics.request_count, 2);
        assert_eq!(dispatcher.pool().stats().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_exhaustion_is_reported_and_metered() {
        let (dispatcher, invoker) = dispatcher(small_pool());
        let dispatcher = Arc::new(dispatcher);

        let busy = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch("slow", json!(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let err = dispatcher.dispatch("convert", json!(2)).await.unwrap_err();
        assert!(matches!(err, PerfError::PoolExhausted { .. }));
        assert!(err.is_capacity());

        assert!(busy.await.unwrap().is_ok());
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);

        let metrics = dispatcher.metrics().compute_metrics();
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batched_dispatch_is_metered_not_cached() {
        let (dispatcher, invoker) = dispatcher(PoolConfig::default());

        let (a, b) = tokio::join!(
            dispatcher.dispatch_batched("convert", json!(1)),
            dispatcher.dispatch_batched("convert", json!(1)),
        );
        assert_eq!(a.unwrap(), json!({ "converted": 1 }));
        assert_eq!(b.unwrap(), json!({ "converted": 1 }));

        assert_eq!(invoker.calls.load(Ordering::SeqCst), 2);
        assert!(dispatcher.cache().is_empty());

        let stats = dispatcher.stats();
        assert_eq!(stats.batch.batches, 1);
        assert_eq!(stats.metrics.success_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_clears_batches_and_closes_pool() {
        let (dispatcher, _) = dispatcher(PoolConfig::default());
        let dispatcher = Arc::new(dispatcher);

        let queued = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch_batched("convert", json!(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        dispatcher.shutdown();

        assert!(matches!(
            queued.await.unwrap(),
            Err(PerfError::BatchCleared { .. })
        ));
        assert!(matches!(
            dispatcher.dispatch("convert", json!(1)).await,
            Err(PerfError::PoolClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_dispatch_counts_as_error() {
        let (dispatcher, _) = dispatcher(PoolConfig::default());
        let dispatcher = Arc::new(dispatcher);

        let call = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch("slow", json!(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        call.abort();
        assert!(call.await.unwrap_err().is_cancelled());

        let metrics = dispatcher.metrics().compute_metrics();
        assert_eq!(metrics.request_count, 1);
        assert_eq!(metrics.success_count, 0);
        assert_eq!(metrics.error_count, 1);
        assert_eq!(dispatcher.pool().stats().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_up_fills_pool() {
        let (dispatcher, _) = dispatcher(PoolConfig {
            min_size: 2,
            ..Default::default()
        });

        dispatcher.warm_up().await.unwrap();
        assert_eq!(dispatcher.pool().stats().idle, 2);
    }
}
