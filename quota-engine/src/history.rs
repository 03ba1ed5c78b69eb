//! Rolling access history per requester.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::clock::window_index;
use crate::types::RequesterId;

/// Grants and denials in the current history window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessHistory {
    /// Admissions
    pub grants: u32,
    /// Requests that had to queue
    pub denials: u32,
    window: i64,
}

/// History of every requester, reset per window.
pub struct HistoryBook {
    window_secs: u64,
    entries: DashMap<RequesterId, AccessHistory>,
}

impl HistoryBook {
    /// Count over windows of `window_secs`.
    pub fn new(window_secs: u64) -> Self {
        Self {
            window_secs,
            entries: DashMap::new(),
        }
    }

    fn update(&self, requester: &str, now: DateTime<Utc>, f: impl FnOnce(&mut AccessHistory)) {
        let window = window_index(now, self.window_secs);
        let mut entry = self.entries.entry(requester.to_string()).or_default();
        if entry.window != window {
            *entry = AccessHistory {
                window,
                ..Default::default()
            };
        }
        f(&mut entry);
    }

    /// Count a grant.
    pub fn record_grant(&self, requester: &str, now: DateTime<Utc>) {
        self.update(requester, now, |h| h.grants = h.grants.saturating_add(1));
    }

    /// Count a denial.
    pub fn record_denial(&self, requester: &str, now: DateTime<Utc>) {
        self.update(requester, now, |h| h.denials = h.denials.saturating_add(1));
    }

    /// History for the window containing `now`.
    pub fn get(&self, requester: &str, now: DateTime<Utc>) -> AccessHistory {
        let window = window_index(now, self.window_secs);
        self.entries
            .get(requester)
            .filter(|h| h.window == window)
            .map(|h| *h)
            .unwrap_or_default()
    }
}
