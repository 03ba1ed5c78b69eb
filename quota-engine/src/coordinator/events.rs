//! Events published for the external notification channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hoarding::FlagChange;
use crate::queue::QueueEntry;
use crate::types::{EntryId, Grant, GrantId, RejectionReason, RequesterId, ResourceId};

/// Something queued requesters or operators may want to hear about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AllocationEvent {
    /// A queued entry was admitted by a drain
    AdmittedFromQueue {
        /// Entry that was waiting
        entry_id: EntryId,
        /// Grant issued
        grant: Grant,
    },
    /// A queued entry was removed because it can no longer pass quota
    Evicted {
        /// Removed entry
        entry: QueueEntry,
        /// Why
        reason: RejectionReason,
    },
    /// A queued entry waited past the resource's timeout
    TimedOut {
        /// Removed entry
        entry: QueueEntry,
    },
    /// A queued entry was withdrawn by its requester
    Withdrawn {
        /// Removed entry
        entry: QueueEntry,
    },
    /// A grant ended
    SessionEnded {
        /// Grant
        grant_id: GrantId,
        /// Resource
        resource: ResourceId,
        /// Holder
        requester: RequesterId,
        /// Whether it expired rather than completing
        expired: bool,
    },
    /// A hoarding flag changed
    FlagChanged(FlagChange),
    /// A quota period rolled over
    RolloverApplied {
        /// Resource
        resource: ResourceId,
        /// New period start
        period_start: DateTime<Utc>,
    },
    /// A resource configuration was accepted
    ResourceConfigured {
        /// Resource
        resource: ResourceId,
        /// Whether a capacity reduction is waiting for occupancy to drain
        staged: bool,
    },
}
