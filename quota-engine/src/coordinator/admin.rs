//! Read-only operator views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AllocationCoordinator;
use crate::hoarding::FlaggedRequester;
use crate::ledger::QuotaRecord;
use crate::types::{ResourceId, Result};

/// Point-in-time view of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Resource
    pub resource: ResourceId,
    /// Total capacity in force
    pub total_capacity: u32,
    /// Reserved pool size
    pub reserved_capacity: u32,
    /// Reserved slots in use
    pub reserved_in_use: u32,
    /// General pool size
    pub general_capacity: u32,
    /// General slots in use
    pub general_in_use: u32,
    /// Occupied fraction of total capacity
    pub utilization: f64,
    /// Entries waiting
    pub queue_depth: usize,
    /// Underserved entries waiting
    pub queued_underserved: usize,
    /// Active grants
    pub active_grants: usize,
    /// Whether a capacity change is waiting for occupancy to drain
    pub staged_capacity_change: bool,
    /// Limit waiting for the next rollover
    pub pending_limit: Option<u32>,
    /// Times the resource lock was contended
    pub contention_retries: u64,
    /// Running average session length in seconds
    pub average_session_secs: u64,
    /// Current quota period
    pub period_start: DateTime<Utc>,
    /// End of the current quota period
    pub period_end: DateTime<Utc>,
    /// Validation failure disabling admission
    pub config_error: Option<String>,
}

impl AllocationCoordinator {
    /// Snapshot one resource.
    pub async fn snapshot(&self, resource: &str) -> Result<ResourceSnapshot> {
        let slot = self.slot(resource)?;
        let retries = slot.contention_retries();
        let state = slot.lock().await;
        let pools = state.pool.state();
        let total = pools.total_capacity();
        let utilization = if total == 0 {
            0.0
        } else {
            pools.in_use() as f64 / total as f64
        };

        Ok(ResourceSnapshot {
            resource: resource.to_string(),
            total_capacity: total,
            reserved_capacity: pools.reserved_capacity,
            reserved_in_use: pools.reserved_in_use,
            general_capacity: pools.general_capacity,
            general_in_use: pools.general_in_use,
            utilization,
            queue_depth: state.queue.len(),
            queued_underserved: state.queue.underserved_waiting(),
            active_grants: state.grants.len(),
            staged_capacity_change: state.pool.has_staged_config(),
            pending_limit: state.ledger.pending_limit(),
            contention_retries: retries,
            average_session_secs: state.durations.average().as_secs(),
            period_start: state.ledger.period_start(),
            period_end: state.ledger.period_end(),
            config_error: state.config_error.clone(),
        })
    }

    /// Snapshot every resource, ordered by ID.
    pub async fn snapshots(&self) -> Vec<ResourceSnapshot> {
        let mut out = Vec::new();
        for resource in self.resource_ids() {
            if let Ok(snapshot) = self.snapshot(&resource).await {
                out.push(snapshot);
            }
        }
        out
    }

    /// Requesters currently Watched or Restricted.
    pub fn flagged_requesters(&self) -> Vec<FlaggedRequester> {
        self.hoarding.flagged()
    }

    /// A requester's quota record on a resource for the current period.
    pub async fn quota_record(&self, resource: &str, requester: &str) -> Result<Option<QuotaRecord>> {
        let slot = self.slot(resource)?;
        let state = slot.lock().await;
        Ok(state.ledger.record(requester).cloned())
    }
}
