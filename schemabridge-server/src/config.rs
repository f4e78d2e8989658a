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

use crate::batcher::BatchConfig;
use crate::cache::{CacheConfig, EvictionStrategy};
use crate::dispatcher::DispatcherConfig;
use crate::pool::{PoolConfig, SessionFactory};
use anyhow::{Context, Result};
use schemabridge_observability::{AlertThresholds, LogFormat, MetricsConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// SchemaBridge Server Configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: HttpServerConfig,
    pub pool: PoolSection,
    pub cache: CacheSection,
    pub batch: BatchSection,
    pub metrics: MetricsSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpServerConfig {
    /// HTTP API listen address (e.g., "127.0.0.1:47200")
    pub listen_addr: String,

    /// Enable CORS
    pub enable_cors: bool,

    /// Allowed CORS origins (empty = allow all)
    pub cors_origins: Vec<String>,

    /// How often active alerts are logged
    pub alert_check_interval_ms: u64,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_http_addr(),
            enable_cors: true,
            cors_origins: vec![],
            alert_check_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolSection {
    pub min_size: usize,
    pub max_size: usize,
    pub idle_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub connection_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Simulated setup cost of a new session
    pub session_open_delay_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            min_size: 5,
            max_size: 20,
            idle_timeout_ms: 30_000,
            health_check_interval_ms: 10_000,
            connection_timeout_ms: 5_000,
            poll_interval_ms: 100,
            session_open_delay_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSection {
    pub max_size: usize,
    /// Default entry TTL; 0 disables expiry
    pub default_ttl_ms: u64,
    pub strategy: EvictionStrategy,
    pub sweep_interval_ms: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl_ms: 3_600_000,
            strategy: EvictionStrategy::Lru,
            sweep_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchSection {
    pub batch_size: usize,
    pub batch_window_ms: u64,
    pub max_wait_time_ms: u64,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_window_ms: 100,
            max_wait_time_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsSection {
    pub window_size: usize,
    pub max_snapshots: usize,
    pub snapshot_every: u64,
    pub throughput_window_ms: u64,
    pub thresholds: AlertThresholds,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            window_size: 100,
            max_snapshots: 1000,
            snapshot_every: 100,
            throughput_window_ms: 60_000,
            thresholds: AlertThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Filter used when RUST_LOG is unset
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: "schemabridge_server=info,tower_http=info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

fn default_http_addr() -> String {
    "127.0.0.1:47200".to_string()
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// Parse `var` with `lookup` into `target` when it is set.
fn override_from<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
    target: &mut T,
) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(var) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value {:?} for {}: {}", raw, var, e))?;
    }
    Ok(())
}

impl ServerConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Defaults overridden by environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Load configuration with priority: env > file > defaults
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let mut config = match config_file {
            Some(path) if path.exists() => {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(&path)?
            }
            Some(path) => {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Apply `SCHEMABRIDGE_*` overrides.
    ///
    /// Supported variables:
    /// - SCHEMABRIDGE_HTTP_ADDR: HTTP listen address (default: 127.0.0.1:47200)
    /// - SCHEMABRIDGE_ENABLE_CORS: Enable CORS (default: true)
    /// - SCHEMABRIDGE_POOL_MIN_SIZE / SCHEMABRIDGE_POOL_MAX_SIZE
    /// - SCHEMABRIDGE_POOL_CONNECTION_TIMEOUT_MS
    /// - SCHEMABRIDGE_CACHE_MAX_SIZE / SCHEMABRIDGE_CACHE_TTL_MS
    /// - SCHEMABRIDGE_CACHE_STRATEGY: lru, lfu or ttl
    /// - SCHEMABRIDGE_BATCH_SIZE / SCHEMABRIDGE_BATCH_WINDOW_MS / SCHEMABRIDGE_BATCH_MAX_WAIT_MS
    /// - SCHEMABRIDGE_LOG_FILTER / SCHEMABRIDGE_LOG_FORMAT
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let env = &lookup;

        override_from(env, "SCHEMABRIDGE_HTTP_ADDR", &mut self.server.listen_addr)?;
        override_from(env, "SCHEMABRIDGE_ENABLE_CORS", &mut self.server.enable_cors)?;

        override_from(env, "SCHEMABRIDGE_POOL_MIN_SIZE", &mut self.pool.min_size)?;
        override_from(env, "SCHEMABRIDGE_POOL_MAX_SIZE", &mut self.pool.max_size)?;
        override_from(
            env,
            "SCHEMABRIDGE_POOL_CONNECTION_TIMEOUT_MS",
            &mut self.pool.connection_timeout_ms,
        )?;

        override_from(env, "SCHEMABRIDGE_CACHE_MAX_SIZE", &mut self.cache.max_size)?;
        override_from(env, "SCHEMABRIDGE_CACHE_TTL_MS", &mut self.cache.default_ttl_ms)?;
        override_from(env, "SCHEMABRIDGE_CACHE_STRATEGY", &mut self.cache.strategy)?;

        override_from(env, "SCHEMABRIDGE_BATCH_SIZE", &mut self.batch.batch_size)?;
        override_from(env, "SCHEMABRIDGE_BATCH_WINDOW_MS", &mut self.batch.batch_window_ms)?;
        override_from(
            env,
            "SCHEMABRIDGE_BATCH_MAX_WAIT_MS",
            &mut self.batch.max_wait_time_ms,
        )?;

        override_from(env, "SCHEMABRIDGE_LOG_FILTER", &mut self.logging.filter)?;
        override_from(env, "SCHEMABRIDGE_LOG_FORMAT", &mut self.logging.format)?;

        Ok(())
    }

    /// Parse listen address as SocketAddr
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.server.listen_addr))
    }

    pub fn alert_check_interval(&self) -> Duration {
        ms(self.server.alert_check_interval_ms)
    }

    pub fn session_factory(&self) -> SessionFactory {
        SessionFactory {
            open_delay: ms(self.pool.session_open_delay_ms),
        }
    }

    /// Component configuration derived from the file sections
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            pool: PoolConfig {
                min_size: self.pool.min_size,
                max_size: self.pool.max_size,
                idle_timeout: ms(self.pool.idle_timeout_ms),
                health_check_interval: ms(self.pool.health_check_interval_ms),
                connection_timeout: ms(self.pool.connection_timeout_ms),
                poll_interval: ms(self.pool.poll_interval_ms),
            },
            cache: CacheConfig {
                max_size: self.cache.max_size,
                default_ttl: (self.cache.default_ttl_ms > 0).then(|| ms(self.cache.default_ttl_ms)),
                strategy: self.cache.strategy,
                sweep_interval: ms(self.cache.sweep_interval_ms),
            },
            batch: BatchConfig {
                batch_size: self.batch.batch_size,
                batch_window: ms(self.batch.batch_window_ms),
                max_wait_time: ms(self.batch.max_wait_time_ms),
            },
            metrics: MetricsConfig {
                window_size: self.metrics.window_size,
                max_snapshots: self.metrics.max_snapshots,
                snapshot_every: self.metrics.snapshot_every,
                throughput_window: ms(self.metrics.throughput_window_ms),
                thresholds: self.metrics.thresholds.clone(),
            },
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;

        let components = self.dispatcher_config();
        components.pool.validate()?;
        components.cache.validate()?;
        components.batch.validate()?;

        if self.metrics.window_size == 0 {
            anyhow::bail!("metrics.window_size must be positive");
        }
        if self.server.alert_check_interval_ms == 0 {
            anyhow::bail!("server.alert_check_interval_ms must be positive");
        }

        Ok(())
    }
}
