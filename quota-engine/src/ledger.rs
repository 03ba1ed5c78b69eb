//! Per-resource quota ledger.
//!
//! Holds one [`QuotaRecord`] per requester for the current period of a single
//! resource. The ledger itself is not synchronized: it lives inside the
//! resource's exclusion scope, which makes every check-and-increment atomic
//! with respect to other admissions and to rollover.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::types::{RequesterId, ResourceId};

/// Usage of one requester on one resource for one period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    /// Units allowed this period
    pub limit: u32,
    /// Units used this period
    pub used: u32,
    /// When the period ends
    pub resets_at: DateTime<Utc>,
}

impl QuotaRecord {
    /// Units left before the limit.
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }
}

/// Outcome of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaCheck {
    /// Reservation fits; carries the balance left afterwards
    Granted {
        /// Units left after the reservation
        remaining: u32,
    },
    /// Reservation would push `used` past the effective limit
    QuotaExceeded {
        /// Units used so far
        used: u32,
        /// Limit the check was made against
        limit: u32,
        /// When the period ends
        resets_at: DateTime<Utc>,
    },
}

impl QuotaCheck {
    /// Whether the check passed.
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}

/// Result of a rollover call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloverOutcome {
    /// Whether the period actually advanced
    pub applied: bool,
    /// Records reset
    pub records_reset: usize,
}

/// Quota counters for one resource.
#[derive(Debug, Clone)]
pub struct QuotaLedger {
    resource: ResourceId,
    limit: u32,
    /// Lower limit waiting for the next rollover
    pending_limit: Option<u32>,
    period_secs: u64,
    period_start: DateTime<Utc>,
    records: HashMap<RequesterId, QuotaRecord>,
}

impl QuotaLedger {
    /// Create a ledger whose first period starts at `period_start`.
    pub fn new(
        resource: impl Into<ResourceId>,
        limit: u32,
        period_secs: u64,
        period_start: DateTime<Utc>,
    ) -> Self {
        Self {
            resource: resource.into(),
            limit,
            pending_limit: None,
            period_secs,
            period_start,
            records: HashMap::new(),
        }
    }

    /// Start of the current period.
    pub fn period_start(&self) -> DateTime<Utc> {
        self.period_start
    }

    /// End of the current period.
    pub fn period_end(&self) -> DateTime<Utc> {
        self.period_start + crate::clock::span(self.period_secs)
    }

    /// Period length in seconds.
    pub fn period_secs(&self) -> u64 {
        self.period_secs
    }

    /// Per-requester limit in force.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Limit staged for the next rollover, if any.
    pub fn pending_limit(&self) -> Option<u32> {
        self.pending_limit
    }

    /// Record for a requester, if one exists this period.
    pub fn record(&self, requester: &str) -> Option<&QuotaRecord> {
        self.records.get(requester)
    }

    /// Units used by a requester this period.
    pub fn used(&self, requester: &str) -> u32 {
        self.records.get(requester).map(|r| r.used).unwrap_or(0)
    }

    /// Number of records in the current period.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Limit after applying a restriction factor.
    pub fn effective_limit(&self, factor: f64) -> u32 {
        if factor >= 1.0 {
            self.limit
        } else {
            (f64::from(self.limit) * factor.max(0.0)).floor() as u32
        }
    }

    /// Check whether `amount` more units fit under `limit * factor`,
    /// without changing anything.
    pub fn check(&self, requester: &str, amount: u32, factor: f64) -> QuotaCheck {
        let limit = self.effective_limit(factor);
        let used = self.used(requester);
        match used.checked_add(amount) {
            Some(total) if total <= limit => QuotaCheck::Granted {
                remaining: limit - total,
            },
            _ => QuotaCheck::QuotaExceeded {
                used,
                limit,
                resets_at: self.period_end(),
            },
        }
    }

    /// Reserve `amount` units if they fit under `limit * factor`.
    ///
    /// Never clamps: an over-limit request changes nothing.
    pub fn check_and_reserve(&mut self, requester: &str, amount: u32, factor: f64) -> QuotaCheck {
        let outcome = self.check(requester, amount, factor);
        if outcome.is_granted() {
            let limit = self.limit;
            let resets_at = self.period_end();
            let record = self
                .records
                .entry(requester.to_string())
                .or_insert_with(|| QuotaRecord {
                    limit,
                    used: 0,
                    resets_at,
                });
            record.used += amount;
            debug!(
                resource = %self.resource,
                requester = %requester,
                amount,
                used = record.used,
                "Quota reserved"
            );
        }
        outcome
    }

    /// Return `amount` units to a requester.
    ///
    /// A no-op when the requester has no record or the units were charged to
    /// an earlier period.
    pub fn release(&mut self, requester: &str, amount: u32, charged_period: DateTime<Utc>) {
        if charged_period != self.period_start {
            return;
        }
        if let Some(record) = self.records.get_mut(requester) {
            record.used = record.used.saturating_sub(amount);
            debug!(
                resource = %self.resource,
                requester = %requester,
                amount,
                used = record.used,
                "Quota released"
            );
        }
    }

    /// Reset every record for a new period starting at `new_period_start`.
    ///
    /// Idempotent: a start at or before the current one changes nothing.
    pub fn rollover(&mut self, new_period_start: DateTime<Utc>) -> RolloverOutcome {
        if new_period_start <= self.period_start {
            return RolloverOutcome {
                applied: false,
                records_reset: 0,
            };
        }

        if let Some(limit) = self.pending_limit.take() {
            self.limit = limit;
        }
        self.period_start = new_period_start;
        let limit = self.limit;
        let resets_at = self.period_end();
        for record in self.records.values_mut() {
            record.used = 0;
            record.limit = limit;
            record.resets_at = resets_at;
        }

        info!(
            resource = %self.resource,
            period_start = %new_period_start,
            records = self.records.len(),
            "Quota period rolled over"
        );

        RolloverOutcome {
            applied: true,
            records_reset: self.records.len(),
        }
    }

    /// Apply a new per-requester limit and period length.
    ///
    /// Raising the limit takes effect now. Lowering it below any record's
    /// usage is staged for the next rollover so `used <= limit` keeps holding.
    pub fn reconfigure(&mut self, limit: u32, period_secs: u64) {
        self.period_secs = period_secs;
        let max_used = self.records.values().map(|r| r.used).max().unwrap_or(0);
        if limit >= max_used {
            self.limit = limit;
            self.pending_limit = None;
        } else {
            self.pending_limit = Some(limit);
        }
        let limit = self.limit;
        let resets_at = self.period_end();
        for record in self.records.values_mut() {
            record.limit = limit;
            record.resets_at = resets_at;
        }
    }
}
