//! Per-resource fair queue.
//!
//! Entries are ordered by priority score (higher first), then by submission
//! time (earlier first), then by arrival sequence. Dequeueing is strict
//! priority: if the head cannot be admitted the queue stays blocked on it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::types::{EntryId, RequesterId, ResourceId};

/// A pending request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Unique entry ID
    pub id: EntryId,
    /// Requester
    pub requester: RequesterId,
    /// Resource
    pub resource: ResourceId,
    /// Underserved status at submission
    pub underserved: bool,
    /// Quota units the session will consume
    pub units: u32,
    /// Priority score at submission
    pub score: f64,
    /// When the entry was submitted
    pub submitted_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Create an entry with a fresh ID.
    pub fn new(
        requester: impl Into<RequesterId>,
        resource: impl Into<ResourceId>,
        score: f64,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            requester: requester.into(),
            resource: resource.into(),
            underserved: false,
            units: 1,
            score,
            submitted_at,
        }
    }

    /// Mark as underserved.
    pub fn underserved(mut self, underserved: bool) -> Self {
        self.underserved = underserved;
        self
    }

    /// Set quota units.
    pub fn with_units(mut self, units: u32) -> Self {
        self.units = units;
        self
    }
}

/// Ordering key: score descending, then submission time, then sequence.
#[derive(Debug, Clone, Copy)]
struct QueueKey {
    score: f64,
    submitted_at: DateTime<Utc>,
    sequence: u64,
}

impl PartialEq for QueueKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueKey {}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.submitted_at.cmp(&other.submitted_at))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

/// Queue is at its depth limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queue full at depth {depth}")]
pub struct QueueFull {
    /// Current depth
    pub depth: usize,
}

/// Waiting line for one resource.
#[derive(Debug, Clone)]
pub struct FairQueue {
    resource: ResourceId,
    ordered: BTreeMap<QueueKey, QueueEntry>,
    index: HashMap<EntryId, QueueKey>,
    next_sequence: u64,
    max_depth: usize,
}

impl FairQueue {
    /// Create an empty queue.
    pub fn new(resource: impl Into<ResourceId>, max_depth: usize) -> Self {
        Self {
            resource: resource.into(),
            ordered: BTreeMap::new(),
            index: HashMap::new(),
            next_sequence: 0,
            max_depth,
        }
    }

    /// Resource this queue serves.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Change the depth limit. Entries already queued stay.
    pub fn set_max_depth(&mut self, max_depth: usize) {
        self.max_depth = max_depth;
    }

    /// Insert an entry, returning its 1-based position.
    pub fn enqueue(&mut self, entry: QueueEntry) -> Result<usize, QueueFull> {
        if self.ordered.len() >= self.max_depth {
            return Err(QueueFull {
                depth: self.ordered.len(),
            });
        }
        let key = QueueKey {
            score: entry.score,
            submitted_at: entry.submitted_at,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        let id = entry.id.clone();
        self.ordered.insert(key, entry);
        self.index.insert(id.clone(), key);
        Ok(self.position(&id).unwrap_or(self.ordered.len()))
    }

    /// Highest-priority entry.
    pub fn peek(&self) -> Option<&QueueEntry> {
        self.ordered.values().next()
    }

    /// Pop the head if `admissible` accepts it; otherwise leave the queue
    /// blocked on that head.
    pub fn dequeue_if_admissible<F>(&mut self, admissible: F) -> Option<QueueEntry>
    where
        F: FnOnce(&QueueEntry) -> bool,
    {
        let head = self.peek()?;
        if !admissible(head) {
            return None;
        }
        let (_, entry) = self.ordered.pop_first()?;
        self.index.remove(&entry.id);
        Some(entry)
    }

    /// 1-based position of an entry.
    pub fn position(&self, entry_id: &str) -> Option<usize> {
        let key = self.index.get(entry_id)?;
        Some(self.ordered.range(..*key).count() + 1)
    }

    /// Look up an entry.
    pub fn get(&self, entry_id: &str) -> Option<&QueueEntry> {
        let key = self.index.get(entry_id)?;
        self.ordered.get(key)
    }

    /// Remove an entry (cancellation, timeout, eviction).
    pub fn withdraw(&mut self, entry_id: &str) -> Option<QueueEntry> {
        let key = self.index.remove(entry_id)?;
        self.ordered.remove(&key)
    }

    /// Underserved entries ranked ahead of `entry_id` (all of them if the
    /// entry is not queued).
    pub fn underserved_ahead_of(&self, entry_id: Option<&str>) -> usize {
        match entry_id.and_then(|id| self.index.get(id)) {
            Some(key) => self.ordered.range(..*key).filter(|(_, e)| e.underserved).count(),
            None => self.ordered.values().filter(|e| e.underserved).count(),
        }
    }

    /// Highest-priority underserved entry.
    pub fn first_underserved(&self) -> Option<&QueueEntry> {
        self.ordered.values().find(|e| e.underserved)
    }

    /// Queued underserved entries.
    pub fn underserved_waiting(&self) -> usize {
        self.underserved_ahead_of(None)
    }

    /// Remove entries submitted at or before `now - timeout`.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>, timeout: ChronoDuration) -> Vec<QueueEntry> {
        let cutoff = now - timeout;
        let expired: Vec<EntryId> = self
            .ordered
            .values()
            .filter(|e| e.submitted_at <= cutoff)
            .map(|e| e.id.clone())
            .collect();
        expired.iter().filter_map(|id| self.withdraw(id)).collect()
    }

    /// Entries in dequeue order.
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.ordered.values()
    }
}

/// Exponentially-weighted moving average of session durations.
#[derive(Debug, Clone, Copy)]
pub struct SessionDurationEwma {
    alpha: f64,
    value_secs: f64,
    samples: u64,
}

impl SessionDurationEwma {
    /// Start from `initial_secs` with smoothing factor `alpha`.
    pub fn new(initial_secs: u64, alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            value_secs: initial_secs as f64,
            samples: 0,
        }
    }

    /// Fold in an observed session.
    pub fn observe(&mut self, duration: Duration) {
        let secs = duration.as_secs_f64();
        self.value_secs = if self.samples == 0 {
            secs
        } else {
            self.alpha * secs + (1.0 - self.alpha) * self.value_secs
        };
        self.samples += 1;
    }

    /// Current average.
    pub fn average(&self) -> Duration {
        Duration::from_secs_f64(self.value_secs.max(0.0))
    }

    /// Sessions observed.
    pub fn samples(&self) -> u64 {
        self.samples
    }
}

/// Advisory wait for the entry at `position`.
///
/// `capacity` is the capacity the entry can draw on, `in_use` how much of it
/// is occupied. Each full wave of `capacity` entries ahead costs one average
/// session; the current wave costs the occupied fraction of one.
pub fn estimate_wait(position: usize, capacity: u32, in_use: u32, average: Duration) -> Duration {
    let capacity = capacity.max(1) as usize;
    let waves_ahead = (position.saturating_sub(1) / capacity) as f64;
    let occupied = (in_use as f64 / capacity as f64).min(1.0);
    average.mul_f64(waves_ahead + occupied)
}
