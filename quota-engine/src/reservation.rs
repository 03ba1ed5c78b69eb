//! Reserved and general capacity pools for one resource.
//!
//! Capacity is split into `reserved = floor(total * fraction)` for
//! underserved requesters and `general = total - reserved` for everyone.
//! General requesters never draw from the reserved pool, even when it sits
//! idle; unclaimed reserved capacity simply expires with the period.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{PoolKind, ResourceId};

/// Point-in-time view of a resource's pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationState {
    /// Capacity reserved for underserved requesters
    pub reserved_capacity: u32,
    /// Reserved slots in use
    pub reserved_in_use: u32,
    /// General capacity
    pub general_capacity: u32,
    /// General slots in use
    pub general_in_use: u32,
}

impl ReservationState {
    /// Free reserved slots.
    pub fn reserved_slack(&self) -> u32 {
        self.reserved_capacity.saturating_sub(self.reserved_in_use)
    }

    /// Free general slots.
    pub fn general_slack(&self) -> u32 {
        self.general_capacity.saturating_sub(self.general_in_use)
    }

    /// Total capacity.
    pub fn total_capacity(&self) -> u32 {
        self.reserved_capacity + self.general_capacity
    }

    /// Total slots in use.
    pub fn in_use(&self) -> u32 {
        self.reserved_in_use + self.general_in_use
    }
}

/// Capacity envelope waiting for occupancy to drain.
#[derive(Debug, Clone, Copy, PartialEq)]
struct StagedSplit {
    total_capacity: u32,
    reservation_fraction: f64,
}

/// Reserved/general capacity split for one resource.
#[derive(Debug, Clone)]
pub struct ReservationPool {
    resource: ResourceId,
    total_capacity: u32,
    reservation_fraction: f64,
    reserved_capacity: u32,
    general_capacity: u32,
    reserved_in_use: u32,
    general_in_use: u32,
    staged: Option<StagedSplit>,
    reserved_grants_this_period: u64,
}

impl ReservationPool {
    /// Create a pool with the given envelope.
    pub fn new(resource: impl Into<ResourceId>, total_capacity: u32, reservation_fraction: f64) -> Self {
        let (reserved, general) = split(total_capacity, reservation_fraction);
        Self {
            resource: resource.into(),
            total_capacity,
            reservation_fraction,
            reserved_capacity: reserved,
            general_capacity: general,
            reserved_in_use: 0,
            general_in_use: 0,
            staged: None,
            reserved_grants_this_period: 0,
        }
    }

    /// Snapshot of the pools.
    pub fn state(&self) -> ReservationState {
        ReservationState {
            reserved_capacity: self.reserved_capacity,
            reserved_in_use: self.reserved_in_use,
            general_capacity: self.general_capacity,
            general_in_use: self.general_in_use,
        }
    }

    /// Total capacity in force.
    pub fn total_capacity(&self) -> u32 {
        self.total_capacity
    }

    /// Whether a reconfiguration is waiting for occupancy to drain.
    pub fn has_staged_config(&self) -> bool {
        self.staged.is_some()
    }

    /// Pick the pool a requester would draw from right now.
    ///
    /// `underserved_waiting_ahead` counts queued underserved requesters that
    /// rank ahead of this one; while any exist, an underserved requester may
    /// not spill into the general pool.
    pub fn select(&self, underserved: bool, underserved_waiting_ahead: usize) -> Option<PoolKind> {
        let state = self.state();
        if underserved {
            if state.reserved_slack() > 0 {
                return Some(PoolKind::Reserved);
            }
            if state.general_slack() > 0 && underserved_waiting_ahead == 0 {
                return Some(PoolKind::General);
            }
            return None;
        }
        if state.general_slack() > 0 {
            Some(PoolKind::General)
        } else {
            None
        }
    }

    /// Take a slot in `pool`. Callers must have selected it first.
    pub fn occupy(&mut self, pool: PoolKind) {
        match pool {
            PoolKind::Reserved => {
                debug_assert!(self.reserved_in_use < self.reserved_capacity);
                self.reserved_in_use += 1;
                self.reserved_grants_this_period += 1;
            }
            PoolKind::General => {
                debug_assert!(self.general_in_use < self.general_capacity);
                self.general_in_use += 1;
            }
        }
    }

    /// Give back a slot in `pool`, then apply any staged reconfiguration that
    /// now fits.
    pub fn release(&mut self, pool: PoolKind) {
        match pool {
            PoolKind::Reserved => self.reserved_in_use = self.reserved_in_use.saturating_sub(1),
            PoolKind::General => self.general_in_use = self.general_in_use.saturating_sub(1),
        }
        self.apply_staged();
    }

    /// Change the envelope.
    ///
    /// Applies immediately when current occupancy fits the new split,
    /// otherwise stages it until releases make room. Returns `true` if the
    /// change was applied now.
    pub fn reconfigure(&mut self, total_capacity: u32, reservation_fraction: f64) -> bool {
        self.staged = Some(StagedSplit {
            total_capacity,
            reservation_fraction,
        });
        let applied = self.apply_staged();
        if !applied {
            warn!(
                resource = %self.resource,
                total_capacity,
                in_use = self.state().in_use(),
                "Capacity reduction staged until occupancy drains"
            );
        }
        applied
    }

    /// Close the period. Returns how many reserved slots were never claimed.
    pub fn close_period(&mut self) -> u32 {
        let unclaimed = if self.reserved_grants_this_period == 0 {
            self.reserved_capacity
        } else {
            0
        };
        if unclaimed > 0 {
            info!(
                resource = %self.resource,
                unclaimed,
                "Reserved capacity expired unclaimed"
            );
        }
        self.reserved_grants_this_period = 0;
        unclaimed
    }

    fn apply_staged(&mut self) -> bool {
        let Some(staged) = self.staged else {
            return false;
        };
        let (reserved, general) = split(staged.total_capacity, staged.reservation_fraction);
        if self.reserved_in_use > reserved || self.general_in_use > general {
            return false;
        }
        self.total_capacity = staged.total_capacity;
        self.reservation_fraction = staged.reservation_fraction;
        self.reserved_capacity = reserved;
        self.general_capacity = general;
        self.staged = None;
        debug_assert_eq!(self.reserved_capacity + self.general_capacity, self.total_capacity);
        true
    }
}

fn split(total_capacity: u32, reservation_fraction: f64) -> (u32, u32) {
    let reserved = (f64::from(total_capacity) * reservation_fraction.clamp(0.0, 1.0)).floor() as u32;
    let reserved = reserved.min(total_capacity);
    (reserved, total_capacity - reserved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_invariant() {
        for total in 0..50u32 {
            for step in 0..=10 {
                let fraction = f64::from(step) / 10.0;
                let pool = ReservationPool::new("gpu", total, fraction);
                let state = pool.state();
                assert_eq!(state.reserved_capacity + state.general_capacity, total);
            }
        }
    }

    #[test]
    fn test_general_never_uses_reserved() {
        let mut pool = ReservationPool::new("gpu", 10, 0.3);
        let mut admitted = 0;
        for _ in 0..8 {
            if let Some(kind) = pool.select(false, 0) {
                assert_eq!(kind, PoolKind::General);
                pool.occupy(kind);
                admitted += 1;
            }
        }
        assert_eq!(admitted, 7);
        assert_eq!(pool.state().reserved_in_use, 0);
        assert_eq!(pool.state().reserved_slack(), 3);
    }

    #[test]
    fn test_underserved_prefers_reserved_then_spills() {
        let mut pool = ReservationPool::new("gpu", 2, 0.5);
        assert_eq!(pool.select(true, 0), Some(PoolKind::Reserved));
        pool.occupy(PoolKind::Reserved);
        assert_eq!(pool.select(true, 0), Some(PoolKind::General));
        assert_eq!(pool.select(true, 1), None);
    }

    #[test]
    fn test_shrink_is_staged_until_release() {
        let mut pool = ReservationPool::new("gpu", 4, 0.0);
        for _ in 0..4 {
            pool.occupy(PoolKind::General);
        }
        assert!(!pool.reconfigure(2, 0.0));
        assert!(pool.has_staged_config());
        assert_eq!(pool.total_capacity(), 4);

        pool.release(PoolKind::General);
        assert!(pool.has_staged_config());
        pool.release(PoolKind::General);
        assert!(!pool.has_staged_config());
        assert_eq!(pool.total_capacity(), 2);
        assert_eq!(pool.state().general_slack(), 0);
    }

    #[test]
    fn test_close_period_reports_unclaimed() {
        let mut pool = ReservationPool::new("gpu", 10, 0.3);
        assert_eq!(pool.close_period(), 3);

        pool.occupy(PoolKind::Reserved);
        pool.release(PoolKind::Reserved);
        assert_eq!(pool.close_period(), 0);
    }
}
