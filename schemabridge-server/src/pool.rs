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

//! Bounded Resource Pool
//!
//! Hands out reusable, expensive-to-create resources (tool sessions) and takes
//! them back when the caller's guard is dropped.
//!
//! ## Acquisition
//!
//! 1. Reuse the first idle, healthy handle (lowest id first)
//! 2. Otherwise create one if `total + creating < max_size`
//! 3. Otherwise wait, re-checking every `poll_interval` and on every release,
//!    until `connection_timeout` elapses → [`PerfError::PoolExhausted`]
//!
//! Waiters are not served in FIFO order: whichever waiter re-checks first after
//! a release wins the handle.
//!
//! ## Maintenance
//!
//! Every `health_check_interval`:
//! - probe idle handles through [`ResourceFactory::check_health`]
//! - evict unhealthy idle handles
//! - evict idle handles unused for longer than `idle_timeout` while `total > min_size`
//! - top the pool back up to `min_size`
//!
//! Unhealthy handles that are currently checked out are dropped when released.
//!
//! ## Leases
//!
//! Every checkout bumps the slot's lease number and the guard remembers it. A
//! release carrying an older lease, or one for an idle slot, is ignored.

use async_trait::async_trait;
use parking_lot::Mutex;
use schemabridge_core::{PerfError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for the resource pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Handles kept alive even when idle
    pub min_size: usize,
    /// Hard cap on live handles (idle + active + being created)
    pub max_size: usize,
    /// Idle handles unused for longer than this are evicted
    pub idle_timeout: Duration,
    /// Period of the maintenance task
    pub health_check_interval: Duration,
    /// Maximum time `acquire` waits for a handle
    pub connection_timeout: Duration,
    /// Re-check period while waiting
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 5,
            max_size: 20,
            idle_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(PerfError::invalid_config("pool.max_size must be positive"));
        }
        if self.min_size > self.max_size {
            return Err(PerfError::invalid_config(format!(
                "pool.min_size ({}) exceeds pool.max_size ({})",
                self.min_size, self.max_size
            )));
        }
        for (name, value) in [
            ("idle_timeout", self.idle_timeout),
            ("health_check_interval", self.health_check_interval),
            ("connection_timeout", self.connection_timeout),
            ("poll_interval", self.poll_interval),
        ] {
            if value.is_zero() {
                return Err(PerfError::invalid_config(format!(
                    "pool.{} must be positive",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Creates and probes pooled resources.
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;

    /// Create a fresh resource. Failures are surfaced to the caller, never retried.
    async fn create(&self, id: u64) -> Result<Self::Resource>;

    /// Probe an idle resource during maintenance.
    async fn check_health(&self, _resource: &Self::Resource) -> bool {
        true
    }
}

/// Bookkeeping for a pooled resource
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    pub id: u64,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub healthy: bool,
}

struct Slot<R> {
    handle: ResourceHandle,
    resource: Arc<R>,
    active: bool,
    lease: u64,
}

#[derive(Default)]
struct Counters {
    created: u64,
    evicted: u64,
    timeouts: u64,
}

struct PoolState<R> {
    slots: BTreeMap<u64, Slot<R>>,
    creating: usize,
    next_id: u64,
    closed: bool,
    counters: Counters,
}

/// Pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub creating: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub created_total: u64,
    pub evicted_total: u64,
    pub timeouts_total: u64,
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub evicted_idle: usize,
    pub evicted_unhealthy: usize,
    pub created: usize,
}

enum Checkout<R> {
    Ready(u64, u64, Arc<R>),
    Create(u64),
    Wait,
}

struct PoolShared<F: ResourceFactory> {
    config: PoolConfig,
    factory: F,
    state: Mutex<PoolState<F::Resource>>,
    released: Notify,
}

/// Slot reserved for a resource that is still being created.
///
/// Dropping it without [`CreateReservation::fill`] frees the slot, so a cancelled
/// or failed creation never leaks capacity.
struct CreateReservation<'a, F: ResourceFactory> {
    shared: &'a PoolShared<F>,
    id: u64,
    armed: bool,
}

impl<F: ResourceFactory> CreateReservation<'_, F> {
    fn fill(mut self, resource: F::Resource, active: bool) -> Result<Arc<F::Resource>> {
        let mut state = self.shared.state.lock();
        state.creating -= 1;
        self.armed = false;

        if state.closed {
            return Err(PerfError::PoolClosed);
        }

        let now = Instant::now();
        let resource = Arc::new(resource);
        state.slots.insert(
            self.id,
            Slot {
                handle: ResourceHandle {
                    id: self.id,
                    created_at: now,
                    last_used_at: now,
                    healthy: true,
                },
                resource: resource.clone(),
                active,
                lease: 0,
            },
        );
        state.counters.created += 1;
        Ok(resource)
    }
}

impl<F: ResourceFactory> Drop for CreateReservation<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.state.lock().creating -= 1;
            self.shared.released.notify_waiters();
        }
    }
}

impl<F: ResourceFactory> PoolShared<F> {
    fn checkout(&self) -> Result<Checkout<F::Resource>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PerfError::PoolClosed);
        }

        let now = Instant::now();
        if let Some(slot) = state
            .slots
            .values_mut()
            .find(|s| !s.active && s.handle.healthy)
        {
            slot.active = true;
            slot.lease += 1;
            slot.handle.last_used_at = now;
            return Ok(Checkout::Ready(slot.handle.id, slot.lease, slot.resource.clone()));
        }

        if state.slots.len() + state.creating < self.config.max_size {
            state.creating += 1;
            let id = state.next_id;
            state.next_id += 1;
            return Ok(Checkout::Create(id));
        }

        Ok(Checkout::Wait)
    }

    fn reserve_for_min(&self) -> Option<CreateReservation<'_, F>> {
        let mut state = self.state.lock();
        if state.closed || state.slots.len() + state.creating >= self.config.min_size {
            return None;
        }
        state.creating += 1;
        let id = state.next_id;
        state.next_id += 1;
        Some(CreateReservation {
            shared: self,
            id,
            armed: true,
        })
    }

    /// Return `id` to the idle set. With `lease`, only that checkout may release it.
    fn release(&self, id: u64, lease: Option<u64>) {
        {
            let mut state = self.state.lock();
            let Some(slot) = state.slots.get_mut(&id) else {
                debug!(handle = id, "Release of unknown handle ignored");
                return;
            };
            if !slot.active || lease.is_some_and(|l| l != slot.lease) {
                debug!(handle = id, "Stale release ignored");
                return;
            }

            slot.active = false;
            slot.handle.last_used_at = Instant::now();

            if !slot.handle.healthy {
                state.slots.remove(&id);
                state.counters.evicted += 1;
                debug!(handle = id, "Dropped unhealthy handle on release");
            }
        }
        self.released.notify_waiters();
    }

    async fn maintain(&self) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();

        let idle: Vec<(u64, Arc<F::Resource>)> = {
            let state = self.state.lock();
            if state.closed {
                return Ok(report);
            }
            state
                .slots
                .values()
                .filter(|s| !s.active && s.handle.healthy)
                .map(|s| (s.handle.id, s.resource.clone()))
                .collect()
        };

        for (id, resource) in idle {
            if !self.factory.check_health(&resource).await {
                if let Some(slot) = self.state.lock().slots.get_mut(&id) {
                    slot.handle.healthy = false;
                }
            }
        }

        {
            let mut state = self.state.lock();
            let now = Instant::now();

            let unhealthy: Vec<u64> = state
                .slots
                .values()
                .filter(|s| !s.active && !s.handle.healthy)
                .map(|s| s.handle.id)
                .collect();
            for id in &unhealthy {
                state.slots.remove(id);
            }
            report.evicted_unhealthy = unhealthy.len();

            let mut expired: Vec<(Instant, u64)> = state
                .slots
                .values()
                .filter(|s| {
                    !s.active && now.duration_since(s.handle.last_used_at) > self.config.idle_timeout
                })
                .map(|s| (s.handle.last_used_at, s.handle.id))
                .collect();
            expired.sort();

            for (_, id) in expired {
                if state.slots.len() <= self.config.min_size {
                    break;
                }
                state.slots.remove(&id);
                report.evicted_idle += 1;
            }

            state.counters.evicted += (report.evicted_idle + report.evicted_unhealthy) as u64;
        }

        while let Some(reservation) = self.reserve_for_min() {
            let id = reservation.id;
            let resource = self.factory.create(id).await?;
            reservation.fill(resource, false)?;
            report.created += 1;
        }

        if report.created > 0 {
            self.released.notify_waiters();
        }
        if report != MaintenanceReport::default() {
            debug!(
                evicted_idle = report.evicted_idle,
                evicted_unhealthy = report.evicted_unhealthy,
                created = report.created,
                "Pool maintenance completed"
            );
        }

        Ok(report)
    }
}

/// Bounded pool of reusable resources.
pub struct ResourcePool<F: ResourceFactory> {
    shared: Arc<PoolShared<F>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl<F: ResourceFactory> ResourcePool<F> {
    /// Create a pool and start its maintenance task.
    ///
    /// Must be called from within a Tokio runtime. The pool starts empty; call
    /// [`ResourcePool::run_maintenance`] to warm it up to `min_size`.
    pub fn new(config: PoolConfig, factory: F) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(PoolShared {
            config,
            factory,
            state: Mutex::new(PoolState {
                slots: BTreeMap::new(),
                creating: 0,
                next_id: 0,
                closed: false,
                counters: Counters::default(),
            }),
            released: Notify::new(),
        });

        let handle = tokio::spawn(maintenance_loop(
            Arc::downgrade(&shared),
            shared.config.health_check_interval,
        ));

        Ok(Self {
            shared,
            maintenance: Mutex::new(Some(handle)),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Check out a healthy idle handle, creating or waiting as needed.
    pub async fn acquire(&self) -> Result<PooledResource<F>> {
        let started = Instant::now();
        let deadline = started + self.shared.config.connection_timeout;

        loop {
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.shared.checkout()? {
                Checkout::Ready(id, lease, resource) => {
                    return Ok(self.guard(id, lease, resource))
                }
                Checkout::Create(id) => {
                    let reservation = CreateReservation {
                        shared: &self.shared,
                        id,
                        armed: true,
                    };
                    let resource = self.shared.factory.create(id).await?;
                    let resource = reservation.fill(resource, true)?;
                    debug!(handle = id, "Created pooled resource");
                    return Ok(self.guard(id, 0, resource));
                }
                Checkout::Wait => {}
            }

            let now = Instant::now();
            if now >= deadline {
                self.shared.state.lock().counters.timeouts += 1;
                let waited = now.duration_since(started);
                warn!(waited_ms = waited.as_millis() as u64, "Resource pool exhausted");
                return Err(PerfError::PoolExhausted { waited });
            }

            let nap = self.shared.config.poll_interval.min(deadline - now);
            let _ = tokio::time::timeout(nap, notified).await;
        }
    }

    /// Return a checked-out handle to the idle set. Unknown or idle ids are ignored.
    ///
    /// The guard of the ended checkout no longer affects the handle once it is
    /// leased again.
    pub fn release(&self, id: u64) {
        self.shared.release(id, None);
    }

    /// Flag a handle as unhealthy so it is never handed out again.
    pub fn mark_unhealthy(&self, id: u64) -> bool {
        match self.shared.state.lock().slots.get_mut(&id) {
            Some(slot) => {
                slot.handle.healthy = false;
                true
            }
            None => false,
        }
    }

    /// Run one maintenance pass now.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        self.shared.maintain().await
    }

    /// Bookkeeping for every live handle, ordered by id.
    pub fn handles(&self) -> Vec<ResourceHandle> {
        self.shared
            .state
            .lock()
            .slots
            .values()
            .map(|s| s.handle.clone())
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        let active = state.slots.values().filter(|s| s.active).count();
        PoolStats {
            total: state.slots.len(),
            active,
            idle: state.slots.len() - active,
            creating: state.creating,
            min_size: self.shared.config.min_size,
            max_size: self.shared.config.max_size,
            created_total: state.counters.created,
            evicted_total: state.counters.evicted,
            timeouts_total: state.counters.timeouts,
        }
    }

    /// Stop maintenance and drop every handle. Later acquisitions fail.
    pub fn close(&self) {
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
        {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.slots.clear();
        }
        self.shared.released.notify_waiters();
        info!("Resource pool closed");
    }

    fn guard(&self, id: u64, lease: u64, resource: Arc<F::Resource>) -> PooledResource<F> {
        PooledResource {
            shared: self.shared.clone(),
            id,
            lease,
            resource,
        }
    }
}

impl<F: ResourceFactory> Drop for ResourcePool<F> {
    fn drop(&mut self) {
        if let Some(handle) = self.maintenance.get_mut().take() {
            handle.abort();
        }
    }
}

async fn maintenance_loop<F: ResourceFactory>(shared: Weak<PoolShared<F>>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if let Err(e) = shared.maintain().await {
            warn!(error = %e, "Pool maintenance failed");
        }
    }
}

/// Checked-out resource. Returned to the pool when dropped.
pub struct PooledResource<F: ResourceFactory> {
    shared: Arc<PoolShared<F>>,
    id: u64,
    lease: u64,
    resource: Arc<F::Resource>,
}

impl<F: ResourceFactory> PooledResource<F> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn resource(&self) -> &F::Resource {
        &self.resource
    }

    /// Flag this handle so it is dropped instead of reused on release.
    pub fn mark_unhealthy(&self) {
        if let Some(slot) = self.shared.state.lock().slots.get_mut(&self.id) {
            if slot.active && slot.lease == self.lease {
                slot.handle.healthy = false;
            }
        }
    }
}

impl<F: ResourceFactory> std::fmt::Debug for PooledResource<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledResource")
            .field("id", &self.id)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl<F: ResourceFactory> std::ops::Deref for PooledResource<F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        &self.resource
    }
}

impl<F: ResourceFactory> Drop for PooledResource<F> {
    fn drop(&mut self) {
        self.shared.release(self.id, Some(self.lease));
    }
}

/// Lightweight session handed to tool calls.
#[derive(Debug)]
pub struct ToolSession {
    pub id: u64,
    pub opened_at: Instant,
}

/// Opens [`ToolSession`]s, simulating the setup cost of a real connection.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    pub open_delay: Duration,
}

impl Default for SessionFactory {
    fn default() -> Self {
        Self {
            open_delay: Duration::from_millis(10),
        }
    }
}

#[async_trait]
impl ResourceFactory for SessionFactory {
    type Resource = ToolSession;

    async fn create(&self, id: u64) -> Result<ToolSession> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        Ok(ToolSession {
            id,
            opened_at: Instant::now(),
        })
    }
}
