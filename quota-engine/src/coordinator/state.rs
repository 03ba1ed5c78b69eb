//! Per-resource state and its exclusion scope.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, MutexGuard};
use tracing::trace;

use crate::clock::period_start;
use crate::config::{EngineConfig, ResourceConfig};
use crate::ledger::QuotaLedger;
use crate::queue::{estimate_wait, FairQueue, QueueEntry, SessionDurationEwma};
use crate::reservation::ReservationPool;
use crate::types::{EntryId, Grant, GrantId, RejectionReason, ResourceId, WaitEstimate};

/// Everything mutated by admissions on one resource.
///
/// Only ever touched while holding the owning [`ResourceSlot`]'s lock.
#[derive(Debug)]
pub struct ResourceState {
    /// Envelope in force
    pub config: ResourceConfig,
    /// Validation failure that disables admission
    pub config_error: Option<String>,
    /// Quota counters
    pub ledger: QuotaLedger,
    /// Reserved/general split
    pub pool: ReservationPool,
    /// Waiting line
    pub queue: FairQueue,
    /// Active grants
    pub grants: HashMap<GrantId, Grant>,
    /// Observed session durations
    pub durations: SessionDurationEwma,
}

impl ResourceState {
    /// Fresh state for a validated config.
    pub fn new(config: ResourceConfig, engine: &EngineConfig, now: DateTime<Utc>) -> Self {
        let resource = config.resource_id.clone();
        Self {
            ledger: QuotaLedger::new(
                resource.clone(),
                config.per_requester_limit,
                config.period_secs,
                period_start(now, config.period_secs),
            ),
            pool: ReservationPool::new(
                resource.clone(),
                config.total_capacity,
                config.reservation_fraction,
            ),
            queue: FairQueue::new(resource, config.max_queue_depth),
            grants: HashMap::new(),
            durations: SessionDurationEwma::new(
                engine.queue.default_session_secs,
                engine.queue.ewma_alpha,
            ),
            config_error: None,
            config,
        }
    }

    /// State for a resource whose first config failed validation.
    ///
    /// Uses a zero-capacity envelope so nothing can be admitted.
    pub fn misconfigured(
        config: ResourceConfig,
        reason: String,
        engine: &EngineConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let mut inert = config.clone();
        inert.total_capacity = 0;
        inert.reservation_fraction = 0.0;
        inert.period_secs = inert.period_secs.max(1);
        let mut state = Self::new(inert, engine, now);
        state.config = config;
        state.config_error = Some(reason);
        state
    }

    /// Apply a validated config. Returns `true` if a capacity reduction was
    /// staged.
    pub fn reconfigure(&mut self, config: ResourceConfig) -> bool {
        self.ledger
            .reconfigure(config.per_requester_limit, config.period_secs);
        let applied = self
            .pool
            .reconfigure(config.total_capacity, config.reservation_fraction);
        self.queue.set_max_depth(config.max_queue_depth);
        self.config = config;
        self.config_error = None;
        !applied
    }

    /// Current wait estimate for a queued entry.
    pub fn wait_estimate(&self, entry_id: &str) -> Option<WaitEstimate> {
        let entry = self.queue.get(entry_id)?;
        let position = self.queue.position(entry_id)?;
        let pools = self.pool.state();
        let (capacity, in_use) = if entry.underserved {
            (pools.total_capacity(), pools.in_use())
        } else {
            (pools.general_capacity, pools.general_in_use)
        };
        Some(WaitEstimate {
            position,
            estimated_wait: estimate_wait(position, capacity, in_use, self.durations.average()),
        })
    }
}

/// A resource's state behind its own lock.
#[derive(Debug)]
pub struct ResourceSlot {
    resource: ResourceId,
    state: Mutex<ResourceState>,
    contention_retries: AtomicU64,
}

impl ResourceSlot {
    /// Wrap state in a new slot.
    pub fn new(state: ResourceState) -> Self {
        Self {
            resource: state.config.resource_id.clone(),
            state: Mutex::new(state),
            contention_retries: AtomicU64::new(0),
        }
    }

    /// Enter the resource's exclusion scope.
    ///
    /// Tries without waiting first; contention is counted and then waited
    /// out, never reported to callers.
    pub async fn lock(&self) -> MutexGuard<'_, ResourceState> {
        match self.state.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                let retries = self.contention_retries.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(resource = %self.resource, retries, "Resource lock contended, retrying");
                self.state.lock().await
            }
        }
    }

    /// Times the lock was contended.
    pub fn contention_retries(&self) -> u64 {
        self.contention_retries.load(Ordering::Relaxed)
    }
}

/// Quota units held between reservation and capacity commit.
///
/// Dropping an uncommitted hold returns the units, including while
/// unwinding, so quota is never left charged without a capacity slot.
pub struct QuotaHold<'a> {
    ledger: &'a mut QuotaLedger,
    requester: &'a str,
    units: u32,
    period: DateTime<Utc>,
    armed: bool,
}

impl<'a> QuotaHold<'a> {
    /// Track units already reserved in `ledger`.
    pub fn new(ledger: &'a mut QuotaLedger, requester: &'a str, units: u32) -> Self {
        let period = ledger.period_start();
        Self {
            ledger,
            requester,
            units,
            period,
            armed: true,
        }
    }

    /// Keep the units charged.
    pub fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for QuotaHold<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.ledger.release(self.requester, self.units, self.period);
        }
    }
}

/// Result of draining a queue.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    /// Entries admitted, with their grants
    pub admitted: Vec<(EntryId, Grant)>,
    /// Entries removed because they can no longer pass quota
    pub evicted: Vec<(QueueEntry, RejectionReason)>,
}
