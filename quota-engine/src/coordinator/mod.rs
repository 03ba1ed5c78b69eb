//! AllocationCoordinator - admission, queueing and session bookkeeping.
//!
//! Every resource owns an exclusion scope ([`ResourceSlot`]). Within it the
//! sequence "check quota → check reservation → charge both" runs as one
//! unit, and so do releases, drains, withdrawals and rollovers. Unrelated
//! resources never wait on each other.
//!
//! ```text
//!  request_access
//!       │
//!       ▼
//!  ┌──────────┐   restricted &    ┌──────────┐  quota   ┌─────────────┐
//!  │ Hoarding │── exhausted ─────▶│ Rejected │◀─ used ──│ QuotaLedger │
//!  └──────────┘                   └──────────┘   up     └─────────────┘
//!       │                                                     │
//!       ▼                                                     ▼
//!  ┌─────────────────┐  slot free   ┌──────────┐
//!  │ ReservationPool │─────────────▶│ Admitted │
//!  └─────────────────┘              └──────────┘
//!       │ no slot
//!       ▼
//!  ┌────────┐   ┌───────────┐
//!  │ Scorer │──▶│ FairQueue │──▶ Queued(position, wait)
//!  └────────┘   └───────────┘
//! ```

mod admin;
mod events;
mod state;

pub use admin::ResourceSnapshot;
pub use events::AllocationEvent;
pub use state::{DrainReport, QuotaHold, ResourceSlot, ResourceState};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::audit::{AuditDecision, AuditEntry, AuditLog};
use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, ResourceConfig};
use crate::hoarding::{FlagChange, HoardingFlag, HoardingMonitor};
use crate::history::HistoryBook;
use crate::ledger::{QuotaCheck, RolloverOutcome};
use crate::queue::QueueEntry;
use crate::scorer::{PriorityScorer, ScoringSignals};
use crate::types::{
    AccessOutcome, AccessRequest, AllocationError, Grant, PoolKind, RejectionReason, Requester,
    ResourceId, Result, SessionEnd, WaitEstimate,
};

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Hook run between the quota reservation and the capacity commit.
///
/// Returning an error aborts the admission; the quota reservation is rolled
/// back and neither counter changes.
#[async_trait::async_trait]
pub trait AdmissionHook: Send + Sync {
    /// Called with the grant about to be issued.
    async fn before_capacity_commit(&self, grant: &Grant) -> Result<()>;
}

/// A session that was ended, as seen after the lock is released.
struct EndedSession {
    grant: Grant,
    duration: Duration,
    ran: bool,
}

/// Orchestrates quota, reservation, hoarding, scoring and queueing.
pub struct AllocationCoordinator {
    config: EngineConfig,
    resources: DashMap<ResourceId, Arc<ResourceSlot>>,
    scorer: PriorityScorer,
    hoarding: HoardingMonitor,
    history: HistoryBook,
    clock: Arc<dyn Clock>,
    hook: Option<Arc<dyn AdmissionHook>>,
    audit: AuditLog,
    events: broadcast::Sender<AllocationEvent>,
}

impl AllocationCoordinator {
    /// Create a coordinator with default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create with custom configuration and the system clock.
    pub fn with_config(config: EngineConfig) -> Self {
        Self::builder().config(config).build()
    }

    /// Create a builder for custom configuration.
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new()
    }

    /// Configuration in use.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to allocation events.
    pub fn subscribe(&self) -> broadcast::Receiver<AllocationEvent> {
        self.events.subscribe()
    }

    /// Audit log of admission decisions.
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Hoarding monitor.
    pub fn hoarding(&self) -> &HoardingMonitor {
        &self.hoarding
    }

    /// Scorer.
    pub fn scorer(&self) -> &PriorityScorer {
        &self.scorer
    }

    /// Current time from the configured clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn publish(&self, event: AllocationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn audit_entry(&self, entry: AuditEntry) {
        if self.config.audit.enabled {
            self.audit.record(entry).await;
        }
    }

    fn slot(&self, resource: &str) -> Result<Arc<ResourceSlot>> {
        self.resources
            .get(resource)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| AllocationError::UnknownResource(resource.to_string()))
    }

    /// Resources known to the coordinator.
    pub fn resource_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.resources.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn slots(&self) -> Vec<Arc<ResourceSlot>> {
        self.resources.iter().map(|e| Arc::clone(e.value())).collect()
    }

    // ------------------------------------------------------------------
    // Configuration (resource catalog collaborator)
    // ------------------------------------------------------------------

    /// Install or update a resource's allocation envelope.
    ///
    /// An invalid config disables admission on that resource until a valid
    /// one arrives. Queued entries stay and are re-evaluated on the next
    /// drain.
    pub async fn configure_resource(&self, config: ResourceConfig) -> Result<()> {
        let now = self.clock.now();
        let resource = config.resource_id.clone();

        if let Err(err) = config.validate() {
            let reason = err.to_string();
            warn!(resource = %resource, reason = %reason, "Rejected resource configuration");
            match self.slot(&resource) {
                Ok(slot) => {
                    let mut state = slot.lock().await;
                    state.config_error = Some(reason);
                }
                Err(_) => {
                    let state = ResourceState::misconfigured(config, reason, &self.config, now);
                    self.resources
                        .entry(resource)
                        .or_insert_with(|| Arc::new(ResourceSlot::new(state)));
                }
            }
            return Err(err);
        }

        let slot = match self.slot(&resource) {
            Ok(slot) => slot,
            Err(_) => {
                let slot = Arc::clone(
                    self.resources
                        .entry(resource.clone())
                        .or_insert_with(|| {
                            Arc::new(ResourceSlot::new(ResourceState::new(
                                config.clone(),
                                &self.config,
                                now,
                            )))
                        })
                        .value(),
                );
                info!(
                    resource = %resource,
                    total_capacity = config.total_capacity,
                    reservation_fraction = config.reservation_fraction,
                    "Resource configured"
                );
                self.publish(AllocationEvent::ResourceConfigured {
                    resource: resource.clone(),
                    staged: false,
                });
                // A concurrent first registration may have won; apply ours on top.
                let mut state = slot.lock().await;
                if state.config != config || state.config_error.is_some() {
                    state.reconfigure(config);
                }
                return Ok(());
            }
        };

        let report = {
            let mut state = slot.lock().await;
            let staged = state.reconfigure(config.clone());
            info!(
                resource = %resource,
                total_capacity = config.total_capacity,
                staged,
                "Resource reconfigured"
            );
            self.publish(AllocationEvent::ResourceConfigured {
                resource: resource.clone(),
                staged,
            });
            self.drain_locked(&mut state, now).await
        };
        self.after_drain(&resource, report, None, now).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Decide a request: admit now, queue with a wait estimate, or reject.
    ///
    /// Never waits for capacity; only for the resource's short critical
    /// section.
    pub async fn request_access(&self, request: AccessRequest) -> Result<AccessOutcome> {
        let now = self.clock.now();
        let slot = self.slot(&request.resource)?;
        let requester = &request.requester;

        let (outcome, score, report, entry_id) = {
            let mut guard = slot.lock().await;
            let state = &mut *guard;
            self.decide_locked(state, &request, now).await?
        };

        let new_entry_admitted = outcome.is_admitted() && entry_id.is_some();

        match &outcome {
            AccessOutcome::Admitted(grant) => {
                self.history.record_grant(&requester.id, now);
                self.hoarding.record_grant(&grant.resource, &requester.id, now);
                debug!(
                    requester = %requester.id,
                    resource = %request.resource,
                    pool = ?grant.pool,
                    grant_id = %grant.id,
                    "Access admitted"
                );
            }
            AccessOutcome::Queued {
                position,
                estimated_wait,
                ..
            } => {
                self.history.record_denial(&requester.id, now);
                self.hoarding.record_denial(&request.resource, &requester.id, now);
                debug!(
                    requester = %requester.id,
                    resource = %request.resource,
                    position,
                    wait_secs = estimated_wait.as_secs(),
                    score,
                    "Access queued"
                );
            }
            AccessOutcome::Rejected(reason) => {
                debug!(
                    requester = %requester.id,
                    resource = %request.resource,
                    reason = reason.as_str(),
                    "Access rejected"
                );
            }
        }

        self.audit_entry(AuditEntry::from_outcome(
            &requester.id,
            &request.resource,
            &outcome,
            score,
            now,
        ))
        .await;

        let skip = if new_entry_admitted { entry_id.as_deref() } else { None };
        self.after_drain(&request.resource, report, skip, now).await;

        Ok(outcome)
    }

    /// The admission sequence, inside the resource's critical section.
    async fn decide_locked(
        &self,
        state: &mut ResourceState,
        request: &AccessRequest,
        now: DateTime<Utc>,
    ) -> Result<(AccessOutcome, Option<f64>, DrainReport, Option<String>)> {
        let requester = &request.requester;
        let units = request.units;

        if let Some(reason) = &state.config_error {
            let reason = RejectionReason::ConfigurationInvalid {
                reason: reason.clone(),
            };
            return Ok((AccessOutcome::Rejected(reason), None, DrainReport::default(), None));
        }

        if requester.access_level < state.config.required_access_level {
            let reason = RejectionReason::AccessLevelInsufficient {
                required: state.config.required_access_level,
                actual: requester.access_level,
            };
            return Ok((AccessOutcome::Rejected(reason), None, DrainReport::default(), None));
        }

        if let Some(reason) = self.quota_rejection(state, &requester.id, units, now) {
            return Ok((AccessOutcome::Rejected(reason), None, DrainReport::default(), None));
        }

        // Fast path: nobody waiting and a slot is free.
        if state.queue.is_empty() {
            if let Some(pool) = state.pool.select(requester.underserved, 0) {
                let factor = self.hoarding.quota_factor(&requester.id, now);
                let grant = self
                    .commit_admission(state, &requester.id, units, pool, factor, None, now)
                    .await?;
                return Ok((AccessOutcome::Admitted(grant), None, DrainReport::default(), None));
            }
        }

        // Score and queue; the drain admits the entry only if it reaches the
        // head, or takes a reserved slot as the best-ranked underserved entry.
        let score = self.score(state, requester, request.need, now);
        let entry = QueueEntry::new(requester.id.clone(), request.resource.clone(), score, now)
            .underserved(requester.underserved)
            .with_units(units);
        let entry_id = entry.id.clone();

        if let Err(full) = state.queue.enqueue(entry) {
            let reason = RejectionReason::QueueFull { depth: full.depth };
            return Ok((AccessOutcome::Rejected(reason), Some(score), DrainReport::default(), None));
        }

        let report = self.drain_locked(state, now).await;

        let drained = report
            .admitted
            .iter()
            .find(|(id, _)| *id == entry_id)
            .map(|(_, grant)| grant.clone());
        if let Some(grant) = drained {
            return Ok((AccessOutcome::Admitted(grant), Some(score), report, Some(entry_id)));
        }

        match state.wait_estimate(&entry_id) {
            Some(estimate) => Ok((
                AccessOutcome::Queued {
                    entry_id: entry_id.clone(),
                    position: estimate.position,
                    estimated_wait: estimate.estimated_wait,
                },
                Some(score),
                report,
                Some(entry_id),
            )),
            // Evicted during the drain.
            None => {
                let reason = report
                    .evicted
                    .iter()
                    .find(|(e, _)| e.id == entry_id)
                    .map(|(_, reason)| reason.clone())
                    .unwrap_or(RejectionReason::QueueFull {
                        depth: state.queue.len(),
                    });
                Ok((AccessOutcome::Rejected(reason), Some(score), report, None))
            }
        }
    }

    /// Quota rejection for `units` more, if any: restriction first, then
    /// the requester's own limit.
    fn quota_rejection(
        &self,
        state: &ResourceState,
        requester: &str,
        units: u32,
        now: DateTime<Utc>,
    ) -> Option<RejectionReason> {
        if self.hoarding.flag(requester, now) == HoardingFlag::Restricted {
            let factor = self.hoarding.quota_factor(requester, now);
            if let QuotaCheck::QuotaExceeded { used, limit, .. } =
                state.ledger.check(requester, units, factor)
            {
                return Some(RejectionReason::RestrictedRequester {
                    used,
                    effective_limit: limit,
                    restricted_until: self.hoarding.restricted_until(requester).unwrap_or(now),
                });
            }
        }
        match state.ledger.check(requester, units, 1.0) {
            QuotaCheck::Granted { .. } => None,
            QuotaCheck::QuotaExceeded {
                used,
                limit,
                resets_at,
            } => Some(RejectionReason::QuotaExceeded {
                used,
                limit,
                requested: units,
                resets_at,
            }),
        }
    }

    fn score(&self, state: &ResourceState, requester: &Requester, need: f64, now: DateTime<Utc>) -> f64 {
        let history = self.history.get(&requester.id, now);
        let signals = ScoringSignals {
            need,
            recent_grants: history.grants,
            recent_denials: history.denials,
            underserved: requester.underserved,
            hoarding: self.hoarding.flag(&requester.id, now),
        };
        self.scorer.score(&signals, &state.pool.state())
    }

    /// Charge quota and capacity together.
    ///
    /// The quota is reserved first and held by a [`QuotaHold`]; if the hook
    /// fails or anything unwinds before the capacity slot is taken, the hold
    /// returns the units.
    #[allow(clippy::too_many_arguments)]
    async fn commit_admission(
        &self,
        state: &mut ResourceState,
        requester: &str,
        units: u32,
        pool: PoolKind,
        factor: f64,
        score: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Grant> {
        let ResourceState {
            config,
            ledger,
            pool: pools,
            grants,
            ..
        } = state;

        if !ledger.check_and_reserve(requester, units, factor).is_granted() {
            return Err(AllocationError::AdmissionAborted(format!(
                "quota for {requester} changed inside the critical section"
            )));
        }
        let period_start = ledger.period_start();
        let hold = QuotaHold::new(ledger, requester, units);

        let grant = Grant {
            id: uuid::Uuid::new_v4().to_string(),
            requester: requester.to_string(),
            resource: config.resource_id.clone(),
            pool,
            units,
            period_start,
            admitted_at: now,
            score,
        };

        if let Some(hook) = &self.hook {
            if let Err(err) = hook.before_capacity_commit(&grant).await {
                warn!(
                    requester = %requester,
                    resource = %grant.resource,
                    error = %err,
                    "Admission aborted before capacity commit"
                );
                return Err(err);
            }
        }

        pools.occupy(pool);
        hold.commit();
        grants.insert(grant.id.clone(), grant.clone());
        Ok(grant)
    }

    // ------------------------------------------------------------------
    // Queue draining
    // ------------------------------------------------------------------

    /// Admit queued entries from the head while they fit, then fill free
    /// reserved slots with the best-ranked underserved entries.
    ///
    /// Strict priority: a head blocked on capacity or reservation blocks the
    /// general pool for everyone behind it. Reserved slots are never usable
    /// by a general head, so underserved entries behind it still take them
    /// in rank order. An entry that can no longer pass quota is evicted.
    async fn drain_locked(&self, state: &mut ResourceState, now: DateTime<Utc>) -> DrainReport {
        let mut report = DrainReport::default();
        if state.config_error.is_some() {
            return report;
        }

        while let Some(head) = state.queue.peek().cloned() {
            if self.evict_if_over_quota(state, &head, now, &mut report) {
                continue;
            }

            // Spill into general stays closed while underserved entries rank ahead.
            let ahead = state.queue.underserved_ahead_of(Some(&head.id));
            let mut chosen = None;
            let entry = state.queue.dequeue_if_admissible(|e| {
                chosen = state.pool.select(e.underserved, ahead);
                chosen.is_some()
            });
            let (Some(entry), Some(pool)) = (entry, chosen) else {
                break;
            };
            if !self.admit_queued(state, entry, pool, now, &mut report).await {
                return report;
            }
        }

        while state.pool.state().reserved_slack() > 0 {
            let Some(candidate) = state.queue.first_underserved().cloned() else {
                break;
            };
            if self.evict_if_over_quota(state, &candidate, now, &mut report) {
                continue;
            }
            let Some(entry) = state.queue.withdraw(&candidate.id) else {
                break;
            };
            if !self.admit_queued(state, entry, PoolKind::Reserved, now, &mut report).await {
                break;
            }
        }
        report
    }

    /// Evict `entry` if it can no longer pass quota. Returns `true` if it was
    /// removed.
    fn evict_if_over_quota(
        &self,
        state: &mut ResourceState,
        entry: &QueueEntry,
        now: DateTime<Utc>,
        report: &mut DrainReport,
    ) -> bool {
        let Some(reason) = self.quota_rejection(state, &entry.requester, entry.units, now) else {
            return false;
        };
        warn!(
            requester = %entry.requester,
            resource = %entry.resource,
            reason = reason.as_str(),
            "Evicting queued entry that can no longer pass quota"
        );
        state.queue.withdraw(&entry.id);
        report.evicted.push((entry.clone(), reason));
        true
    }

    /// Commit a dequeued entry. On failure the entry goes back in the queue
    /// and `false` is returned.
    async fn admit_queued(
        &self,
        state: &mut ResourceState,
        entry: QueueEntry,
        pool: PoolKind,
        now: DateTime<Utc>,
        report: &mut DrainReport,
    ) -> bool {
        let factor = self.hoarding.quota_factor(&entry.requester, now);
        match self
            .commit_admission(state, &entry.requester, entry.units, pool, factor, Some(entry.score), now)
            .await
        {
            Ok(grant) => {
                report.admitted.push((entry.id.clone(), grant));
                true
            }
            Err(err) => {
                warn!(
                    entry_id = %entry.id,
                    error = %err,
                    "Drain admission failed, entry returned to queue"
                );
                // The entry was just removed, so depth allows it back.
                let _ = state.queue.enqueue(entry);
                false
            }
        }
    }

    /// Bookkeeping for a drain once the lock is released.
    async fn after_drain(
        &self,
        resource: &str,
        report: DrainReport,
        skip_entry: Option<&str>,
        now: DateTime<Utc>,
    ) {
        for (entry_id, grant) in report.admitted {
            if Some(entry_id.as_str()) == skip_entry {
                continue;
            }
            self.history.record_grant(&grant.requester, now);
            self.hoarding.record_grant(resource, &grant.requester, now);
            info!(
                requester = %grant.requester,
                resource = %resource,
                grant_id = %grant.id,
                "Queued entry admitted"
            );
            self.audit_entry(
                AuditEntry::new(&grant.requester, resource, AuditDecision::AdmittedFromQueue, now)
                    .with_score(grant.score.unwrap_or_default()),
            )
            .await;
            self.publish(AllocationEvent::AdmittedFromQueue { entry_id, grant });
        }
        for (entry, reason) in report.evicted {
            self.audit_entry(
                AuditEntry::new(&entry.requester, resource, AuditDecision::Dequeued, now)
                    .with_reason(reason.as_str())
                    .with_score(entry.score),
            )
            .await;
            self.publish(AllocationEvent::Evicted { entry, reason });
        }
    }

    // ------------------------------------------------------------------
    // Session end
    // ------------------------------------------------------------------

    /// End a session: release its capacity slot, settle or return its quota,
    /// then drain the queue. Returns what the drain admitted.
    pub async fn complete_session(&self, grant: &Grant, end: SessionEnd) -> Result<DrainReport> {
        self.end_session(grant, end, false).await
    }

    /// Same bookkeeping as a completed session, recorded as an expiry for
    /// hoarding detection.
    pub async fn expire_grant(&self, grant: &Grant) -> Result<DrainReport> {
        self.end_session(grant, SessionEnd::Completed, true).await
    }

    async fn end_session(&self, grant: &Grant, end: SessionEnd, expired: bool) -> Result<DrainReport> {
        let now = self.clock.now();
        let slot = self.slot(&grant.resource)?;

        let (ended, report) = {
            let mut guard = slot.lock().await;
            let state = &mut *guard;
            let ended = Self::release_locked(state, &grant.id, end, now)?;
            let report = self.drain_locked(state, now).await;
            (ended, report)
        };

        self.after_session(ended, expired, now);
        let returned = report.clone();
        self.after_drain(&grant.resource, report, None, now).await;
        Ok(returned)
    }

    /// Release a grant's capacity and, for sessions that never started, its
    /// quota.
    fn release_locked(
        state: &mut ResourceState,
        grant_id: &str,
        end: SessionEnd,
        now: DateTime<Utc>,
    ) -> Result<EndedSession> {
        let grant = state
            .grants
            .remove(grant_id)
            .ok_or_else(|| AllocationError::GrantNotFound(grant_id.to_string()))?;

        state.pool.release(grant.pool);
        let duration = (now - grant.admitted_at).max(Duration::zero());
        let ran = end == SessionEnd::Completed;
        if ran {
            if let Ok(std_duration) = duration.to_std() {
                state.durations.observe(std_duration);
            }
        } else {
            state
                .ledger
                .release(&grant.requester, grant.units, grant.period_start);
        }

        Ok(EndedSession {
            grant,
            duration,
            ran,
        })
    }

    fn after_session(&self, ended: EndedSession, expired: bool, now: DateTime<Utc>) {
        let EndedSession {
            grant,
            duration,
            ran,
        } = ended;

        debug!(
            requester = %grant.requester,
            resource = %grant.resource,
            grant_id = %grant.id,
            duration_secs = duration.num_seconds(),
            expired,
            "Session ended"
        );

        if ran {
            if let Some(change) =
                self.hoarding
                    .record_session(&grant.resource, &grant.requester, duration, expired, now)
            {
                self.publish(AllocationEvent::FlagChanged(change));
            }
        }

        self.publish(AllocationEvent::SessionEnded {
            grant_id: grant.id,
            resource: grant.resource,
            requester: grant.requester,
            expired,
        });
    }

    // ------------------------------------------------------------------
    // Queue operations
    // ------------------------------------------------------------------

    /// Remove a queued entry before admission.
    pub async fn withdraw(&self, resource: &str, entry_id: &str) -> Result<QueueEntry> {
        let now = self.clock.now();
        let slot = self.slot(resource)?;

        let (entry, report) = {
            let mut guard = slot.lock().await;
            let state = &mut *guard;
            let entry = state
                .queue
                .withdraw(entry_id)
                .ok_or_else(|| AllocationError::EntryNotFound(entry_id.to_string()))?;
            // Removing a blocked head can unblock the next one.
            let report = self.drain_locked(state, now).await;
            (entry, report)
        };

        info!(requester = %entry.requester, resource = %resource, "Queue entry withdrawn");
        self.audit_entry(
            AuditEntry::new(&entry.requester, resource, AuditDecision::Dequeued, now)
                .with_reason("withdrawn")
                .with_score(entry.score),
        )
        .await;
        self.publish(AllocationEvent::Withdrawn {
            entry: entry.clone(),
        });
        self.after_drain(resource, report, None, now).await;
        Ok(entry)
    }

    /// Current position and advisory wait of a queued entry.
    pub async fn estimate_wait(&self, resource: &str, entry_id: &str) -> Result<WaitEstimate> {
        let slot = self.slot(resource)?;
        let state = slot.lock().await;
        state
            .wait_estimate(entry_id)
            .ok_or_else(|| AllocationError::EntryNotFound(entry_id.to_string()))
    }

    // ------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------

    /// Reset quota for `resource` to a period starting at `new_period_start`.
    ///
    /// Runs in the resource's critical section, so it never interleaves with
    /// an admission. Re-running it for the same start is a no-op.
    pub async fn rollover(&self, resource: &str, new_period_start: DateTime<Utc>) -> Result<RolloverOutcome> {
        let slot = self.slot(resource)?;
        let outcome = {
            let mut state = slot.lock().await;
            let outcome = state.ledger.rollover(new_period_start);
            if outcome.applied {
                state.pool.close_period();
            }
            outcome
        };
        if outcome.applied {
            self.publish(AllocationEvent::RolloverApplied {
                resource: resource.to_string(),
                period_start: new_period_start,
            });
        }
        Ok(outcome)
    }

    /// One maintenance pass over every resource: boundary rollover, queue
    /// timeouts, overdue grants, then hoarding decay.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let now = self.clock.now();
        let mut summary = MaintenanceReport::default();

        for slot in self.slots() {
            let (resource, rolled, timed_out, ended, report) = {
                let mut guard = slot.lock().await;
                let state = &mut *guard;
                let resource = state.config.resource_id.clone();

                let boundary = crate::clock::period_start(now, state.ledger.period_secs());
                let rolled = if boundary > state.ledger.period_start() {
                    let outcome = state.ledger.rollover(boundary);
                    if outcome.applied {
                        state.pool.close_period();
                    }
                    outcome.applied.then_some(boundary)
                } else {
                    None
                };

                let timeout = crate::clock::span(state.config.queue_timeout_secs);
                let timed_out = state.queue.sweep_expired(now, timeout);

                let mut ended = Vec::new();
                if let Some(max_secs) = state.config.max_session_secs {
                    let cutoff = now - crate::clock::span(max_secs);
                    let overdue: Vec<String> = state
                        .grants
                        .values()
                        .filter(|g| g.admitted_at <= cutoff)
                        .map(|g| g.id.clone())
                        .collect();
                    for grant_id in overdue {
                        if let Ok(session) =
                            Self::release_locked(state, &grant_id, SessionEnd::Completed, now)
                        {
                            ended.push(session);
                        }
                    }
                }

                let report = self.drain_locked(state, now).await;
                (resource, rolled, timed_out, ended, report)
            };

            if let Some(period_start) = rolled {
                summary.rollovers += 1;
                self.publish(AllocationEvent::RolloverApplied {
                    resource: resource.clone(),
                    period_start,
                });
            }

            for entry in timed_out {
                summary.timed_out += 1;
                info!(
                    requester = %entry.requester,
                    resource = %resource,
                    "Queue entry timed out"
                );
                self.audit_entry(
                    AuditEntry::new(&entry.requester, &resource, AuditDecision::Dequeued, now)
                        .with_reason("timed_out")
                        .with_score(entry.score),
                )
                .await;
                self.publish(AllocationEvent::TimedOut { entry });
            }

            for session in ended {
                summary.expired_grants += 1;
                self.after_session(session, true, now);
            }

            summary.admitted_from_queue += report.admitted.len();
            summary.evicted += report.evicted.len();
            self.after_drain(&resource, report, None, now).await;
        }

        let decayed: Vec<FlagChange> = self.hoarding.decay_all(now);
        summary.flags_decayed = decayed.len();
        for change in decayed {
            self.publish(AllocationEvent::FlagChanged(change));
        }

        summary
    }
}

impl Default for AllocationCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts from one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Resources whose period rolled over
    pub rollovers: usize,
    /// Queue entries removed for waiting too long
    pub timed_out: usize,
    /// Grants expired for running too long
    pub expired_grants: usize,
    /// Entries admitted by the drains
    pub admitted_from_queue: usize,
    /// Entries evicted by the drains
    pub evicted: usize,
    /// Hoarding flags lifted
    pub flags_decayed: usize,
}

/// Builder for AllocationCoordinator.
pub struct CoordinatorBuilder {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    hook: Option<Arc<dyn AdmissionHook>>,
}

impl CoordinatorBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            hook: None,
        }
    }

    /// Set engine config.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the time source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the admission hook.
    pub fn admission_hook(mut self, hook: Arc<dyn AdmissionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Build the coordinator.
    pub fn build(self) -> AllocationCoordinator {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        AllocationCoordinator {
            scorer: PriorityScorer::new(self.config.scoring.clone()),
            hoarding: HoardingMonitor::new(self.config.hoarding.clone()),
            history: HistoryBook::new(self.config.history.window_secs),
            audit: AuditLog::with_max_entries(self.config.audit.max_entries),
            resources: DashMap::new(),
            clock: self.clock,
            hook: self.hook,
            events,
            config: self.config,
        }
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
