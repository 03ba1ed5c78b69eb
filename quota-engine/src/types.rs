//! Core types for the allocation engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stable identifier of a requester (organization or member).
pub type RequesterId = String;

/// Stable identifier of a scarce resource.
pub type ResourceId = String;

/// Identifier of an admitted grant.
pub type GrantId = String;

/// Identifier of a pending queue entry.
pub type EntryId = String;

/// Access level supplied by the identity collaborator.
///
/// Ordered: a requester may use any resource whose required level is at or
/// below its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    /// Anyone
    Public = 0,
    /// Member of a registered organization
    Member = 1,
    /// Verified organization
    Verified = 2,
    /// Partner organization
    Partner = 3,
}

impl Default for AccessLevel {
    fn default() -> Self {
        Self::Public
    }
}

/// An already-authenticated requester as seen by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requester {
    /// Stable identifier
    pub id: RequesterId,
    /// Underserved status from the verification collaborator
    pub underserved: bool,
    /// Access level from the identity collaborator
    pub access_level: AccessLevel,
}

impl Requester {
    /// Create a general (not underserved) requester.
    pub fn general(id: impl Into<RequesterId>) -> Self {
        Self {
            id: id.into(),
            underserved: false,
            access_level: AccessLevel::Member,
        }
    }

    /// Create an underserved requester.
    pub fn underserved(id: impl Into<RequesterId>) -> Self {
        Self {
            id: id.into(),
            underserved: true,
            access_level: AccessLevel::Member,
        }
    }

    /// Set access level.
    pub fn with_access_level(mut self, level: AccessLevel) -> Self {
        self.access_level = level;
        self
    }
}

/// A request to use one unit of a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRequest {
    /// Who is asking
    pub requester: Requester,
    /// Which resource
    pub resource: ResourceId,
    /// Opaque need / impact signal from the Project/Impact collaborator
    pub need: f64,
    /// Quota units this session consumes
    pub units: u32,
}

impl AccessRequest {
    /// Create a request with zero need and one quota unit.
    pub fn new(requester: Requester, resource: impl Into<ResourceId>) -> Self {
        Self {
            requester,
            resource: resource.into(),
            need: 0.0,
            units: 1,
        }
    }

    /// Set the need signal.
    pub fn with_need(mut self, need: f64) -> Self {
        self.need = need;
        self
    }

    /// Set quota units.
    pub fn with_units(mut self, units: u32) -> Self {
        self.units = units;
        self
    }
}

/// Which capacity pool a grant draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Capacity carved out for underserved requesters
    Reserved,
    /// Capacity open to everyone
    General,
}

/// Token for an admitted session's claim on quota and capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    /// Unique grant ID
    pub id: GrantId,
    /// Holder
    pub requester: RequesterId,
    /// Resource
    pub resource: ResourceId,
    /// Pool the capacity slot came from
    pub pool: PoolKind,
    /// Quota units held
    pub units: u32,
    /// Quota period the units were charged to
    pub period_start: DateTime<Utc>,
    /// When the grant was issued
    pub admitted_at: DateTime<Utc>,
    /// Priority score, when the grant came out of the queue
    pub score: Option<f64>,
}

/// How a session ended.
///
/// A session that started and then stopped early is `Completed`: quota is
/// charged per session, so one that ran consumes its unit however short it
/// was. Use `NotStarted` only when the resource was never used, including a
/// session abandoned before it began; that is the early end whose quota is
/// released back to the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    /// Session ran; held quota is consumed
    Completed,
    /// Session failed to start or was abandoned; held quota is returned
    NotStarted,
}

/// Result of `request_access`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AccessOutcome {
    /// Admitted immediately
    Admitted(Grant),
    /// Waiting in the fair queue
    Queued {
        /// Queue entry ID (for withdraw / estimate)
        entry_id: EntryId,
        /// 1-based position
        position: usize,
        /// Advisory wait estimate
        estimated_wait: Duration,
    },
    /// Refused
    Rejected(RejectionReason),
}

impl AccessOutcome {
    /// Whether the outcome is an immediate admission.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }

    /// Whether the outcome is a queued entry.
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }

    /// Get the grant if admitted.
    pub fn grant(&self) -> Option<&Grant> {
        match self {
            Self::Admitted(grant) => Some(grant),
            _ => None,
        }
    }

    /// Short label for logs and audit.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Admitted(_) => "admitted",
            Self::Queued { .. } => "queued",
            Self::Rejected(_) => "rejected",
        }
    }
}

/// Structured reason for a rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    /// Requester's own quota for the period is used up
    QuotaExceeded {
        /// Units used this period
        used: u32,
        /// Per-requester limit
        limit: u32,
        /// Units asked for
        requested: u32,
        /// When the period rolls over
        resets_at: DateTime<Utc>,
    },
    /// Hoarding restriction has cut the effective quota
    RestrictedRequester {
        /// Units used this period
        used: u32,
        /// Limit after the restriction factor
        effective_limit: u32,
        /// Earliest time the restriction can decay
        restricted_until: DateTime<Utc>,
    },
    /// Resource configuration is invalid; admission is disabled
    ConfigurationInvalid {
        /// Validation failure
        reason: String,
    },
    /// Requester access level is below the resource requirement
    AccessLevelInsufficient {
        /// Required level
        required: AccessLevel,
        /// Requester's level
        actual: AccessLevel,
    },
    /// Queue for the resource is full
    QueueFull {
        /// Current depth
        depth: usize,
    },
}

impl RejectionReason {
    /// Short label for logs and audit.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::RestrictedRequester { .. } => "restricted_requester",
            Self::ConfigurationInvalid { .. } => "configuration_invalid",
            Self::AccessLevelInsufficient { .. } => "access_level_insufficient",
            Self::QueueFull { .. } => "queue_full",
        }
    }
}

/// Advisory wait for a queued entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaitEstimate {
    /// 1-based queue position
    pub position: usize,
    /// Estimated time until admission
    pub estimated_wait: Duration,
}

/// Error types for the allocation engine.
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    /// Resource was never configured
    #[error("Unknown resource: {0}")]
    UnknownResource(ResourceId),

    /// Grant is not active (already completed or expired)
    #[error("Grant not found: {0}")]
    GrantNotFound(GrantId),

    /// Queue entry is not pending
    #[error("Queue entry not found: {0}")]
    EntryNotFound(EntryId),

    /// Configuration failed validation
    #[error("Invalid configuration for {resource}: {reason}")]
    ConfigurationInvalid {
        /// Resource the config was for
        resource: ResourceId,
        /// What was wrong
        reason: String,
    },

    /// Admission was aborted between quota and capacity commit
    #[error("Admission aborted: {0}")]
    AdmissionAborted(String),

    /// Config could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, AllocationError>;
