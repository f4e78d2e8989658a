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

//! Call Coalescing for Tool Invocations
//!
//! Collects independent calls for a short window and hands them to the invoker
//! as one group per operation, so backends with a bulk path pay their setup cost
//! once per batch instead of once per call.
//!
//! ## Lifecycle
//!
//! ```text
//! queued ──► dispatched ──► resolved | failed
//!   │
//!   ├──► timed out   (still queued after max_wait_time)
//!   └──► cleared     (drained by clear())
//! ```
//!
//! ## Flush Triggers
//!
//! - the queue reaches `batch_size`
//! - `batch_window` has passed since the oldest queued call arrived
//!
//! Only one flush runs at a time. Calls that arrive during a flush wait for the
//! next one, and a flush never takes more than `batch_size` calls.
//!
//! Whoever removes a call from the queue (flush, timeout, or clear) owns its
//! responder, so every call settles exactly once.

use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use schemabridge_core::{BatchItem, BatchOutput, PerfError, Result, ToolError, ToolInvoker};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Configuration for the batch coordinator
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Queue length that triggers an immediate flush
    pub batch_size: usize,
    /// Maximum time the oldest queued call waits before a flush
    pub batch_window: Duration,
    /// Calls still queued after this fail with a timeout
    pub max_wait_time: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_window: Duration::from_millis(100),
            max_wait_time: Duration::from_millis(1000),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(PerfError::invalid_config("batch.batch_size must be positive"));
        }
        if self.batch_window.is_zero() {
            return Err(PerfError::invalid_config("batch.batch_window must be positive"));
        }
        if self.max_wait_time <= self.batch_window {
            return Err(PerfError::invalid_config(
                "batch.max_wait_time must exceed batch.batch_window",
            ));
        }
        Ok(())
    }
}

/// Batch coordinator statistics
#[derive(Debug, Clone, Serialize)]
pub struct BatchStats {
    pub queue_depth: usize,
    pub flushing: bool,
    pub submitted: u64,
    pub batches: u64,
    pub resolved: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cleared: u64,
    pub avg_batch_size: f64,
}

type Responder = oneshot::Sender<Result<Value>>;

struct PendingCall {
    id: u64,
    operation: String,
    argument: Value,
    enqueued_at: Instant,
    responder: Responder,
    expiry: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Counters {
    submitted: u64,
    batches: u64,
    dispatched: u64,
    resolved: u64,
    failed: u64,
    timed_out: u64,
    cleared: u64,
}

struct BatchState {
    queue: VecDeque<PendingCall>,
    flushing: bool,
    next_id: u64,
    window_timer: Option<JoinHandle<()>>,
    counters: Counters,
}

struct BatchShared {
    config: BatchConfig,
    invoker: Arc<dyn ToolInvoker>,
    state: Mutex<BatchState>,
}

/// Coalesces tool calls into per-operation batches.
pub struct BatchCoordinator {
    shared: Arc<BatchShared>,
}

impl BatchCoordinator {
    pub fn new(config: BatchConfig, invoker: Arc<dyn ToolInvoker>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            shared: Arc::new(BatchShared {
                config,
                invoker,
                state: Mutex::new(BatchState {
                    queue: VecDeque::new(),
                    flushing: false,
                    next_id: 0,
                    window_timer: None,
                    counters: Counters::default(),
                }),
            }),
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.shared.config
    }

    /// Queue a call and wait for its outcome.
    ///
    /// Must be awaited from within a Tokio runtime.
    pub async fn submit(&self, operation: &str, argument: Value) -> Result<Value> {
        let (tx, rx) = oneshot::channel();

        let id = {
            let mut state = self.shared.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.counters.submitted += 1;

            let expiry = tokio::spawn(expire_after(
                Arc::downgrade(&self.shared),
                id,
                self.shared.config.max_wait_time,
            ));

            state.queue.push_back(PendingCall {
                id,
                operation: operation.to_string(),
                argument,
                enqueued_at: Instant::now(),
                responder: tx,
                expiry: Some(expiry),
            });

            schedule(&self.shared, &mut state);
            id
        };

        // A dropped responder means the coordinator went away with the call queued
        rx.await
            .unwrap_or(Err(PerfError::BatchCleared { call_id: id }))
    }

    /// Fail every queued call with [`PerfError::BatchCleared`].
    ///
    /// Calls already handed to a flush are unaffected. Returns how many calls
    /// were cleared.
    pub fn clear(&self) -> usize {
        let drained: Vec<PendingCall> = {
            let mut state = self.shared.state.lock();
            if let Some(timer) = state.window_timer.take() {
                timer.abort();
            }
            let drained: Vec<PendingCall> = state.queue.drain(..).collect();
            state.counters.cleared += drained.len() as u64;
            drained
        };

        let count = drained.len();
        for mut call in drained {
            if let Some(expiry) = call.expiry.take() {
                expiry.abort();
            }
            let _ = call
                .responder
                .send(Err(PerfError::BatchCleared { call_id: call.id }));
        }

        if count > 0 {
            debug!(count, "Cleared queued batch calls");
        }
        count
    }

    pub fn stats(&self) -> BatchStats {
        let state = self.shared.state.lock();
        let c = &state.counters;
        BatchStats {
            queue_depth: state.queue.len(),
            flushing: state.flushing,
            submitted: c.submitted,
            batches: c.batches,
            resolved: c.resolved,
            failed: c.failed,
            timed_out: c.timed_out,
            cleared: c.cleared,
            avg_batch_size: if c.batches > 0 {
                c.dispatched as f64 / c.batches as f64
            } else {
                0.0
            },
        }
    }
}

impl Drop for BatchCoordinator {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Start a flush or arm the window timer, depending on the queue.
fn schedule(shared: &Arc<BatchShared>, state: &mut BatchState) {
    if state.flushing {
        return;
    }

    if state.queue.is_empty() {
        if let Some(timer) = state.window_timer.take() {
            timer.abort();
        }
        return;
    }

    if state.queue.len() >= shared.config.batch_size {
        start_flush(shared, state);
        return;
    }

    if state.window_timer.is_none() {
        state.window_timer = Some(tokio::spawn(window_loop(Arc::downgrade(shared))));
    }
}

fn start_flush(shared: &Arc<BatchShared>, state: &mut BatchState) {
    if let Some(timer) = state.window_timer.take() {
        timer.abort();
    }

    let take = state.queue.len().min(shared.config.batch_size);
    let mut batch: Vec<PendingCall> = state.queue.drain(..take).collect();
    for call in &mut batch {
        if let Some(expiry) = call.expiry.take() {
            expiry.abort();
        }
    }

    state.flushing = true;
    state.counters.batches += 1;
    state.counters.dispatched += batch.len() as u64;

    tokio::spawn(run_flush(shared.clone(), batch));
}

async fn window_loop(shared: Weak<BatchShared>) {
    loop {
        let deadline = {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut state = shared.state.lock();
            let oldest = state
                .queue
                .front()
                .filter(|_| !state.flushing)
                .map(|call| call.enqueued_at + shared.config.batch_window);
            match oldest {
                Some(deadline) => deadline,
                None => {
                    state.window_timer = None;
                    return;
                }
            }
        };

        tokio::time::sleep_until(deadline).await;

        let Some(shared) = shared.upgrade() else {
            return;
        };
        let mut state = shared.state.lock();
        let window = shared.config.batch_window;
        let due = !state.flushing
            && state
                .queue
                .front()
                .is_some_and(|call| Instant::now() >= call.enqueued_at + window);

        if due {
            // Detach rather than abort: this task is the timer
            state.window_timer = None;
            start_flush(&shared, &mut state);
            return;
        }
    }
}

async fn expire_after(shared: Weak<BatchShared>, id: u64, max_wait: Duration) {
    tokio::time::sleep(max_wait).await;

    let Some(shared) = shared.upgrade() else {
        return;
    };

    let call = {
        let mut state = shared.state.lock();
        let Some(pos) = state.queue.iter().position(|c| c.id == id) else {
            return;
        };
        let Some(call) = state.queue.remove(pos) else {
            return;
        };
        state.counters.timed_out += 1;
        schedule(&shared, &mut state);
        call
    };

    let waited = call.enqueued_at.elapsed();
    warn!(
        call_id = id,
        operation = %call.operation,
        waited_ms = waited.as_millis() as u64,
        "Batched call timed out"
    );
    let _ = call
        .responder
        .send(Err(PerfError::BatchTimeout { call_id: id, waited }));
}

async fn run_flush(shared: Arc<BatchShared>, batch: Vec<PendingCall>) {
    let size = batch.len();
    let mut groups: HashMap<String, Vec<PendingCall>> = HashMap::new();
    for call in batch {
        groups.entry(call.operation.clone()).or_default().push(call);
    }
    debug!(size, groups = groups.len(), "Flushing batch");

    let runs = groups.into_iter().map(|(operation, calls)| {
        let invoker = shared.invoker.clone();
        async move {
            let mut items = Vec::with_capacity(calls.len());
            let mut responders = Vec::with_capacity(calls.len());
            for call in calls {
                items.push(BatchItem {
                    id: call.id,
                    argument: call.argument,
                });
                responders.push((call.id, call.responder));
            }

            let outcome = AssertUnwindSafe(invoker.invoke_batch(&operation, items))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(ToolError::execution_failed(format!(
                        "batch handler for {} panicked",
                        operation
                    )))
                });

            deliver(&operation, responders, outcome)
        }
    });

    let tallies = join_all(runs).await;

    let mut state = shared.state.lock();
    for (resolved, failed) in tallies {
        state.counters.resolved += resolved;
        state.counters.failed += failed;
    }
    state.flushing = false;
    schedule(&shared, &mut state);
}

/// Settle every responder of one group. Returns (resolved, failed).
fn deliver(
    operation: &str,
    responders: Vec<(u64, Responder)>,
    outcome: std::result::Result<BatchOutput, ToolError>,
) -> (u64, u64) {
    let mut resolved = 0;
    let mut failed = 0;

    match outcome {
        Ok(mut output) => {
            for (id, responder) in responders {
                match output.remove(&id) {
                    Some(value) => {
                        resolved += 1;
                        let _ = responder.send(Ok(value));
                    }
                    None => {
                        failed += 1;
                        warn!(call_id = id, operation, "Batch result missing for call");
                        let _ = responder.send(Err(PerfError::BatchResultMissing { call_id: id }));
                    }
                }
            }
        }
        Err(err) => {
            warn!(operation, error = %err, calls = responders.len(), "Batch group failed");
            for (_, responder) in responders {
                failed += 1;
                let _ = responder.send(Err(PerfError::Handler(err.clone())));
            }
        }
    }

    (resolved, failed)
}
