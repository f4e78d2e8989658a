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

//! Request Metrics Recorder
//!
//! Records the outcome and latency of every request into a bounded sliding
//! window and derives summary statistics on demand.
//!
//! ## Percentiles
//!
//! ```text
//! sorted = sort(window)
//! pX     = sorted[floor(n * X)]
//! ```
//!
//! ## Error Rate
//!
//! ```text
//! error_rate = errors / (successes + errors) * 100
//! ```
//!
//! Counters are lifetime totals; latency statistics only cover the window.
//!
//! ## Throughput
//!
//! Every `snapshot_every` recorded requests a snapshot is taken. Each snapshot
//! stores the request rate since the previous one; the reported throughput is
//! the mean of those rates over snapshots younger than `throughput_window`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Alert thresholds checked by [`MetricsRecorder::check_alerts`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// P95 latency above this raises a warning (ms)
    pub p95_warning_ms: f64,
    /// P99 latency above this raises an error (ms)
    pub p99_error_ms: f64,
    /// Error rate above this raises a warning (percent)
    pub error_rate_warning_pct: f64,
    /// Error rate above this raises an error (percent)
    pub error_rate_error_pct: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            p95_warning_ms: 1000.0,
            p99_error_ms: 2000.0,
            error_rate_warning_pct: 5.0,
            error_rate_error_pct: 10.0,
        }
    }
}

/// Configuration for the metrics recorder
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Number of latency samples kept in the sliding window
    pub window_size: usize,
    /// Maximum snapshots kept in history
    pub max_snapshots: usize,
    /// Take a snapshot every N recorded requests
    pub snapshot_every: u64,
    /// Snapshots younger than this feed the throughput estimate
    pub throughput_window: Duration,
    pub thresholds: AlertThresholds,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            max_snapshots: 1000,
            snapshot_every: 100,
            throughput_window: Duration::from_secs(60),
            thresholds: AlertThresholds::default(),
        }
    }
}

/// Summary statistics derived from the window and lifetime counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub request_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    /// Requests per second
    pub throughput: f64,
    /// Percentage of failed requests
    pub error_rate: f64,
}

/// Point-in-time copy of the metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Request rate since the previous snapshot (requests/sec)
    pub interval_throughput: f64,
    pub metrics: PerformanceMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Error,
}

/// Threshold crossing reported by [`MetricsRecorder::check_alerts`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
}

struct SnapshotRecord {
    taken_at: Instant,
    requests_at: u64,
    snapshot: PerformanceSnapshot,
}

struct RecorderState {
    window: VecDeque<f64>,
    request_count: u64,
    success_count: u64,
    error_count: u64,
    snapshots: VecDeque<SnapshotRecord>,
    started_at: Instant,
}

impl RecorderState {
    fn new(config: &MetricsConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window_size),
            request_count: 0,
            success_count: 0,
            error_count: 0,
            snapshots: VecDeque::new(),
            started_at: Instant::now(),
        }
    }
}

/// Sliding-window metrics recorder.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct MetricsRecorder {
    state: Arc<Mutex<RecorderState>>,
    config: Arc<MetricsConfig>,
}

impl MetricsRecorder {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(RecorderState::new(&config))),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Start timing a request.
    ///
    /// The returned timer records the elapsed latency when finished or dropped.
    /// A timer dropped before it finishes also counts the request as an error,
    /// so an abandoned request never leaves the counters unbalanced.
    pub fn record_start(&self) -> LatencyTimer {
        LatencyTimer {
            started: Instant::now(),
            recorder: self.clone(),
            finished: false,
        }
    }

    /// Record a latency sample and count the request.
    pub fn record_latency(&self, latency: Duration) {
        let mut state = self.state.lock();

        state.window.push_back(latency.as_micros() as f64 / 1000.0);
        while state.window.len() > self.config.window_size {
            state.window.pop_front();
        }
        state.request_count += 1;

        if self.config.snapshot_every > 0 && state.request_count % self.config.snapshot_every == 0
        {
            self.push_snapshot(&mut state);
        }
    }

    pub fn record_success(&self) {
        self.state.lock().success_count += 1;
    }

    pub fn record_error(&self) {
        self.state.lock().error_count += 1;
    }

    /// Derive summary statistics from the current window.
    pub fn compute_metrics(&self) -> PerformanceMetrics {
        let state = self.state.lock();
        self.compute(&state, Instant::now())
    }

    /// Take a snapshot now, regardless of the request cadence.
    pub fn take_snapshot(&self) -> PerformanceSnapshot {
        let mut state = self.state.lock();
        self.push_snapshot(&mut state)
    }

    /// Snapshot history, oldest first. `limit` keeps only the most recent N.
    pub fn snapshots(&self, limit: Option<usize>) -> Vec<PerformanceSnapshot> {
        let state = self.state.lock();
        let skip = match limit {
            Some(limit) => state.snapshots.len().saturating_sub(limit),
            None => 0,
        };
        state
            .snapshots
            .iter()
            .skip(skip)
            .map(|r| r.snapshot.clone())
            .collect()
    }

    /// Clear window, counters and history.
    pub fn reset(&self) {
        *self.state.lock() = RecorderState::new(&self.config);
    }

    /// Evaluate the configured thresholds against the current metrics.
    pub fn check_alerts(&self) -> Vec<Alert> {
        let metrics = self.compute_metrics();
        let t = &self.config.thresholds;
        let mut alerts = Vec::new();

        if metrics.p95_latency_ms > t.p95_warning_ms {
            alerts.push(Alert {
                level: AlertLevel::Warning,
                metric: "p95_latency_ms".to_string(),
                value: metrics.p95_latency_ms,
                threshold: t.p95_warning_ms,
                message: format!("P95 latency too high: {:.2}ms", metrics.p95_latency_ms),
            });
        }

        if metrics.p99_latency_ms > t.p99_error_ms {
            alerts.push(Alert {
                level: AlertLevel::Error,
                metric: "p99_latency_ms".to_string(),
                value: metrics.p99_latency_ms,
                threshold: t.p99_error_ms,
                message: format!("P99 latency too high: {:.2}ms", metrics.p99_latency_ms),
            });
        }

        if metrics.error_rate > t.error_rate_warning_pct {
            alerts.push(Alert {
                level: AlertLevel::Warning,
                metric: "error_rate".to_string(),
                value: metrics.error_rate,
                threshold: t.error_rate_warning_pct,
                message: format!("Error rate elevated: {:.2}%", metrics.error_rate),
            });
        }

        if metrics.error_rate > t.error_rate_error_pct {
            alerts.push(Alert {
                level: AlertLevel::Error,
                metric: "error_rate".to_string(),
                value: metrics.error_rate,
                threshold: t.error_rate_error_pct,
                message: format!("Error rate critical: {:.2}%", metrics.error_rate),
            });
        }

        alerts
    }

    fn push_snapshot(&self, state: &mut RecorderState) -> PerformanceSnapshot {
        let now = Instant::now();
        let (since, requests_before) = state
            .snapshots
            .back()
            .map(|r| (r.taken_at, r.requests_at))
            .unwrap_or((state.started_at, 0));

        let elapsed = now.duration_since(since).as_secs_f64();
        let interval_throughput = if elapsed > 0.0 {
            (state.request_count - requests_before) as f64 / elapsed
        } else {
            0.0
        };

        let snapshot = PerformanceSnapshot {
            timestamp: Utc::now(),
            interval_throughput,
            metrics: self.compute(state, now),
        };

        state.snapshots.push_back(SnapshotRecord {
            taken_at: now,
            requests_at: state.request_count,
            snapshot: snapshot.clone(),
        });
        while state.snapshots.len() > self.config.max_snapshots {
            state.snapshots.pop_front();
        }

        debug!(
            requests = state.request_count,
            interval_throughput, "Metrics snapshot taken"
        );
        snapshot
    }

    fn compute(&self, state: &RecorderState, now: Instant) -> PerformanceMetrics {
        let mut sorted: Vec<f64> = state.window.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let count = sorted.len();
        let avg = if count > 0 {
            sorted.iter().sum::<f64>() / count as f64
        } else {
            0.0
        };

        let total = state.success_count + state.error_count;
        let error_rate = if total > 0 {
            state.error_count as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        let recent: Vec<f64> = state
            .snapshots
            .iter()
            .filter(|r| now.duration_since(r.taken_at) < self.config.throughput_window)
            .map(|r| r.snapshot.interval_throughput)
            .collect();
        let throughput = if recent.is_empty() {
            0.0
        } else {
            recent.iter().sum::<f64>() / recent.len() as f64
        };

        PerformanceMetrics {
            request_count: state.request_count,
            success_count: state.success_count,
            error_count: state.error_count,
            avg_latency_ms: avg,
            min_latency_ms: sorted.first().copied().unwrap_or(0.0),
            max_latency_ms: sorted.last().copied().unwrap_or(0.0),
            p50_latency_ms: percentile(&sorted, 0.50),
            p95_latency_ms: percentile(&sorted, 0.95),
            p99_latency_ms: percentile(&sorted, 0.99),
            throughput,
            error_rate,
        }
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

/// `sorted[floor(n * p)]`, clamped to the last element.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64) * p).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// In-flight request timer returned by [`MetricsRecorder::record_start`].
pub struct LatencyTimer {
    started: Instant,
    recorder: MetricsRecorder,
    finished: bool,
}

impl LatencyTimer {
    /// Record the elapsed latency and return it. The outcome is left to the caller.
    pub fn finish(mut self) -> Duration {
        self.complete()
    }

    /// Record the elapsed latency and a success.
    pub fn succeed(mut self) -> Duration {
        let elapsed = self.complete();
        self.recorder.record_success();
        elapsed
    }

    /// Record the elapsed latency and an error.
    pub fn fail(mut self) -> Duration {
        let elapsed = self.complete();
        self.recorder.record_error();
        elapsed
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn complete(&mut self) -> Duration {
        let elapsed = self.started.elapsed();
        if !self.finished {
            self.finished = true;
            self.recorder.record_latency(elapsed);
        }
        elapsed
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        if !self.finished {
            let elapsed = self.complete();
            self.recorder.record_error();
            debug!(
                elapsed_ms = elapsed.as_millis() as u64,
                "Request abandoned before completion"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> MetricsRecorder {
        MetricsRecorder::new(MetricsConfig::default())
    }

    #[test]
    fn test_percentiles_use_floor_index() {
        let metrics = recorder();
        for ms in (10..=100).step_by(10) {
            metrics.record_latency(Duration::from_millis(ms));
        }

        let m = metrics.compute_metrics();
        assert_eq!(m.request_count, 10);
        assert_eq!(m.p50_latency_ms, 60.0);
        assert_eq!(m.p95_latency_ms, 100.0);
        assert_eq!(m.p99_latency_ms, 100.0);
        assert_eq!(m.min_latency_ms, 10.0);
        assert_eq!(m.max_latency_ms, 100.0);
        assert!((m.avg_latency_ms - 55.0).abs() < 1e-9);
    }

    #[test]
    fn test_error_rate() {
        let metrics = recorder();
        for _ in 0..9 {
            metrics.record_success();
        }
        metrics.record_error();

        let m = metrics.compute_metrics();
        assert!((m.error_rate - 10.0).abs() < 1e-9);
        // Counters move independently of latency samples
        assert_eq!(m.request_count, 0);
    }

    #[test]
    fn test_empty_recorder_reports_zeroes() {
        let m = recorder().compute_metrics();
        assert_eq!(m.p99_latency_ms, 0.0);
        assert_eq!(m.error_rate, 0.0);
        assert_eq!(m.throughput, 0.0);
    }

    #[test]
    fn test_window_is_bounded() {
        let metrics = MetricsRecorder::new(MetricsConfig {
            window_size: 3,
            ..Default::default()
        });
        for ms in [500, 1, 2, 3] {
            metrics.record_latency(Duration::from_millis(ms));
        }

        let m = metrics.compute_metrics();
        // The 500ms sample fell out of the window, but the counter kept it
        assert_eq!(m.max_latency_ms, 3.0);
        assert_eq!(m.request_count, 4);
    }

    #[test]
    fn test_snapshot_every_hundredth_request() {
        let metrics = recorder();
        for _ in 0..250 {
            metrics.record_latency(Duration::from_millis(5));
        }
        assert_eq!(metrics.snapshots(None).len(), 2);
        assert_eq!(metrics.snapshots(Some(1))[0].metrics.request_count, 200);
    }

    #[test]
    fn test_snapshot_history_is_bounded() {
        let metrics = MetricsRecorder::new(MetricsConfig {
            max_snapshots: 2,
            snapshot_every: 1,
            ..Default::default()
        });
        for _ in 0..5 {
            metrics.record_latency(Duration::from_millis(1));
        }

        let history = metrics.snapshots(None);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].metrics.request_count, 4);
        assert_eq!(history[1].metrics.request_count, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_from_recent_snapshots() {
        let metrics = MetricsRecorder::new(MetricsConfig {
            snapshot_every: 10,
            ..Default::default()
        });

        tokio::time::advance(Duration::from_secs(2)).await;
        for _ in 0..10 {
            metrics.record_latency(Duration::from_millis(1));
        }
        assert!((metrics.compute_metrics().throughput - 5.0).abs() < 1e-6);

        // Snapshots older than a minute stop contributing
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(metrics.compute_metrics().throughput, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_records_on_finish_and_drop() {
        let metrics = recorder();

        let timer = metrics.record_start();
        tokio::time::advance(Duration::from_millis(40)).await;
        let elapsed = timer.finish();
        assert_eq!(elapsed, Duration::from_millis(40));

        {
            let _timer = metrics.record_start();
            tokio::time::advance(Duration::from_millis(20)).await;
        }

        let m = metrics.compute_metrics();
        assert_eq!(m.request_count, 2);
        assert_eq!(m.max_latency_ms, 40.0);
        assert_eq!(m.min_latency_ms, 20.0);
        // Only the abandoned timer carries an outcome
        assert_eq!(m.success_count, 0);
        assert_eq!(m.error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_outcomes_keep_counters_balanced() {
        let metrics = recorder();

        metrics.record_start().succeed();
        metrics.record_start().fail();
        drop(metrics.record_start());

        let m = metrics.compute_metrics();
        assert_eq!(m.request_count, 3);
        assert_eq!(m.success_count, 1);
        assert_eq!(m.error_count, 2);
        assert_eq!(m.request_count, m.success_count + m.error_count);
    }

    #[test]
    fn test_alerts() {
        let metrics = recorder();
        assert!(metrics.check_alerts().is_empty());

        for _ in 0..20 {
            metrics.record_latency(Duration::from_millis(2500));
        }
        for _ in 0..8 {
            metrics.record_success();
        }
        for _ in 0..2 {
            metrics.record_error();
        }

        let alerts = metrics.check_alerts();
        let levels: Vec<(&str, AlertLevel)> = alerts
            .iter()
            .map(|a| (a.metric.as_str(), a.level))
            .collect();

        assert_eq!(
            levels,
            vec![
                ("p95_latency_ms", AlertLevel::Warning),
                ("p99_latency_ms", AlertLevel::Error),
                ("error_rate", AlertLevel::Warning),
                ("error_rate", AlertLevel::Error),
            ]
        );
    }

    #[test]
    fn test_reset() {
        let metrics = recorder();
        metrics.record_latency(Duration::from_millis(3));
        metrics.record_error();
        metrics.take_snapshot();

        metrics.reset();
        let m = metrics.compute_metrics();
        assert_eq!(m.request_count, 0);
        assert_eq!(m.error_count, 0);
        assert!(metrics.snapshots(None).is_empty());
    }
}
