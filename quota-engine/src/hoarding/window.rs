//! Rolling per-resource activity windows.

use std::collections::{HashMap, VecDeque};

use crate::types::RequesterId;

/// Activity on one resource within one window.
#[derive(Debug, Clone, Default)]
pub struct WindowActivity {
    /// Window index (see [`crate::clock::window_index`])
    pub window: i64,
    /// Session seconds per requester
    pub usage_secs: HashMap<RequesterId, f64>,
    /// Sessions per requester
    pub sessions: HashMap<RequesterId, u32>,
    /// Expired (not completed) sessions per requester
    pub expiries: HashMap<RequesterId, u32>,
    /// Admissions per requester
    pub grants: HashMap<RequesterId, u32>,
    /// Denials (requests that had to queue) per requester
    pub denials: HashMap<RequesterId, u32>,
}

impl WindowActivity {
    fn new(window: i64) -> Self {
        Self {
            window,
            ..Default::default()
        }
    }

    /// Usage of a requester in this window.
    pub fn usage_of(&self, requester: &str) -> f64 {
        self.usage_secs.get(requester).copied().unwrap_or(0.0)
    }

    /// Expiries of a requester in this window.
    pub fn expiries_of(&self, requester: &str) -> u32 {
        self.expiries.get(requester).copied().unwrap_or(0)
    }

    /// Usage of every other requester active in this window.
    pub fn peer_usage(&self, requester: &str) -> Vec<f64> {
        self.usage_secs
            .iter()
            .filter(|(id, _)| id.as_str() != requester)
            .map(|(_, usage)| *usage)
            .collect()
    }
}

/// Trailing windows of activity for one resource.
#[derive(Debug, Clone)]
pub struct ResourceActivity {
    windows: VecDeque<WindowActivity>,
    retained: usize,
}

impl ResourceActivity {
    /// Keep at most `retained` windows.
    pub fn new(retained: usize) -> Self {
        Self {
            windows: VecDeque::new(),
            retained: retained.max(1),
        }
    }

    /// Activity for `window`, creating it (and pruning old ones) if needed.
    pub fn window_mut(&mut self, window: i64) -> &mut WindowActivity {
        let is_current = self.windows.back().map(|w| w.window == window).unwrap_or(false);
        if !is_current {
            if let Some(pos) = self.windows.iter().position(|w| w.window == window) {
                return &mut self.windows[pos];
            }
            self.windows.push_back(WindowActivity::new(window));
            while self.windows.len() > self.retained {
                self.windows.pop_front();
            }
            while self
                .windows
                .front()
                .map(|w| w.window <= window - self.retained as i64)
                .unwrap_or(false)
            {
                self.windows.pop_front();
            }
        }
        // Non-empty: the current window was pushed above if missing.
        let last = self.windows.len() - 1;
        &mut self.windows[last]
    }

    /// Activity for `window`, if recorded.
    pub fn window(&self, window: i64) -> Option<&WindowActivity> {
        self.windows.iter().find(|w| w.window == window)
    }

    /// Grants-to-denials ratio of every requester except `requester`,
    /// across the retained windows.
    ///
    /// `None` when nobody else was denied: the resource was not contended.
    pub fn others_grant_ratio(&self, requester: &str) -> Option<f64> {
        let mut grants = 0u64;
        let mut denials = 0u64;
        for window in &self.windows {
            grants += window
                .grants
                .iter()
                .filter(|(id, _)| id.as_str() != requester)
                .map(|(_, n)| u64::from(*n))
                .sum::<u64>();
            denials += window
                .denials
                .iter()
                .filter(|(id, _)| id.as_str() != requester)
                .map(|(_, n)| u64::from(*n))
                .sum::<u64>();
        }
        if denials == 0 {
            None
        } else {
            Some(grants as f64 / denials as f64)
        }
    }
}

/// Median of a set of values; `None` for an empty set.
pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}
