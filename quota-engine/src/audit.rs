//! Audit trail of admission decisions.
//!
//! Every `request_access` outcome is recorded with the score that ordered it,
//! so operators can explain any decision after the fact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::types::{AccessOutcome, RequesterId, ResourceId};

/// Decision kind recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    /// Admitted on request
    Admitted,
    /// Admitted from the queue by a drain
    AdmittedFromQueue,
    /// Queued
    Queued,
    /// Rejected
    Rejected,
    /// Removed from the queue (withdrawn, timed out, evicted)
    Dequeued,
}

/// An entry in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique entry ID
    pub entry_id: String,
    /// Requester
    pub requester: RequesterId,
    /// Resource
    pub resource: ResourceId,
    /// Decision
    pub decision: AuditDecision,
    /// Rejection or removal reason
    pub reason: Option<String>,
    /// Priority score, when one was computed
    pub score: Option<f64>,
    /// Grant ID, when admitted
    pub grant_id: Option<String>,
    /// When the decision was made
    pub decided_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Create an entry.
    pub fn new(
        requester: impl Into<RequesterId>,
        resource: impl Into<ResourceId>,
        decision: AuditDecision,
        decided_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entry_id: uuid::Uuid::new_v4().to_string(),
            requester: requester.into(),
            resource: resource.into(),
            decision,
            reason: None,
            score: None,
            grant_id: None,
            decided_at,
        }
    }

    /// Build an entry from a request outcome.
    pub fn from_outcome(
        requester: &str,
        resource: &str,
        outcome: &AccessOutcome,
        score: Option<f64>,
        decided_at: DateTime<Utc>,
    ) -> Self {
        let (decision, reason, grant_id) = match outcome {
            AccessOutcome::Admitted(grant) => (AuditDecision::Admitted, None, Some(grant.id.clone())),
            AccessOutcome::Queued { .. } => (AuditDecision::Queued, None, None),
            AccessOutcome::Rejected(reason) => {
                (AuditDecision::Rejected, Some(reason.as_str().to_string()), None)
            }
        };
        Self {
            reason,
            score,
            grant_id,
            ..Self::new(requester, resource, decision, decided_at)
        }
    }

    /// Set a reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Set a score.
    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }
}

/// Summary counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStats {
    /// Entries retained
    pub total: usize,
    /// Immediate admissions
    pub admitted: usize,
    /// Admissions out of the queue
    pub admitted_from_queue: usize,
    /// Queued
    pub queued: usize,
    /// Rejected
    pub rejected: usize,
    /// Removed from the queue
    pub dequeued: usize,
}

/// Bounded audit log, newest first.
pub struct AuditLog {
    entries: Arc<RwLock<VecDeque<AuditEntry>>>,
    max_entries: usize,
}

impl AuditLog {
    /// Create with a retention limit.
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::new())),
            max_entries,
        }
    }

    /// Append an entry.
    pub async fn record(&self, entry: AuditEntry) {
        let mut entries = self.entries.write().await;
        entries.push_front(entry);

        // Prune if over limit
        while entries.len() > self.max_entries {
            entries.pop_back();
        }
    }

    /// Get recent entries.
    pub async fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        entries.iter().take(limit).cloned().collect()
    }

    /// Get entries for a requester.
    pub async fn by_requester(&self, requester: &str, limit: usize) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.requester == requester)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Get entries for a resource.
    pub async fn by_resource(&self, resource: &str, limit: usize) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.resource == resource)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Get statistics.
    pub async fn stats(&self) -> AuditStats {
        let entries = self.entries.read().await;
        let mut stats = AuditStats {
            total: entries.len(),
            ..Default::default()
        };
        for entry in entries.iter() {
            match entry.decision {
                AuditDecision::Admitted => stats.admitted += 1,
                AuditDecision::AdmittedFromQueue => stats.admitted_from_queue += 1,
                AuditDecision::Queued => stats.queued += 1,
                AuditDecision::Rejected => stats.rejected += 1,
                AuditDecision::Dequeued => stats.dequeued += 1,
            }
        }
        stats
    }
}
