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

//! SchemaBridge Server
//!
//! HTTP front end for the request performance layer: tool calls are routed
//! through a bounded session pool, a result cache, a batch coordinator and a
//! metrics recorder before reaching the registered tool handlers.

pub mod api;
pub mod batcher;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod pool;
pub mod tools;

use anyhow::Result;
use axum::{http::HeaderValue, Router};
use schemabridge_observability::{AlertLevel, MetricsRecorder};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

pub use batcher::{BatchConfig, BatchCoordinator, BatchStats};
pub use cache::{BoundedCache, CacheConfig, CacheStats, EvictionStrategy};
pub use config::ServerConfig;
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherStats};
pub use pool::{PoolConfig, PoolStats, ResourceFactory, ResourcePool, SessionFactory};
pub use tools::{ToolHandler, ToolRegistry};

/// Run the HTTP server until Ctrl-C
pub async fn run_server(config: ServerConfig) -> Result<()> {
    schemabridge_observability::logging::init(&config.logging.filter, config.logging.format)?;

    config.validate()?;
    let addr = config.socket_addr()?;

    let registry = Arc::new(ToolRegistry::with_builtins());
    let dispatcher = Arc::new(Dispatcher::new(
        config.dispatcher_config(),
        registry.clone(),
        config.session_factory(),
    )?);

    if let Err(e) = dispatcher.warm_up().await {
        tracing::warn!("Session pool warm-up failed: {}", e);
    }

    let alert_monitor = spawn_alert_monitor(dispatcher.metrics().clone(), config.alert_check_interval());

    let state = api::AppState {
        dispatcher: dispatcher.clone(),
        registry,
        started_at: Instant::now(),
    };
    let app = build_app(state, &config);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("SchemaBridge server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    alert_monitor.abort();
    dispatcher.shutdown();
    tracing::info!("SchemaBridge server stopped");

    Ok(())
}

/// Full application: API routes plus CORS and request tracing
pub fn build_app(state: api::AppState, config: &ServerConfig) -> Router {
    api::router(state)
        .layer(cors_layer(config))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    if !config.server.enable_cors {
        return CorsLayer::new();
    }

    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if config.server.cors_origins.is_empty() {
        tracing::warn!("CORS: Allowing all origins (development mode). Set cors_origins in production!");
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = config
        .server
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("CORS: Ignoring invalid origin {:?}", origin);
                None
            }
        })
        .collect();

    tracing::info!("CORS: Allowing origins: {:?}", config.server.cors_origins);
    cors.allow_origin(AllowOrigin::list(origins))
}

/// Periodically log every active alert at its level
fn spawn_alert_monitor(metrics: MetricsRecorder, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            for alert in metrics.check_alerts() {
                match alert.level {
                    AlertLevel::Warning => tracing::warn!(
                        metric = %alert.metric,
                        value = alert.value,
                        threshold = alert.threshold,
                        "{}",
                        alert.message
                    ),
                    AlertLevel::Error => tracing::error!(
                        metric = %alert.metric,
                        value = alert.value,
                        threshold = alert.threshold,
                        "{}",
                        alert.message
                    ),
                }
            }
        }
    })
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            futures::future::pending::<()>().await
        }
    }
}
