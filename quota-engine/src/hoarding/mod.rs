//! Hoarding detection.
//!
//! Keeps rolling usage statistics per requester and resource and flags
//! requesters whose usage of *contended* capacity is far above their peers:
//!
//! - **Watched**: usage in the current window exceeds `watch_multiple` times
//!   the median of other active requesters, or grants keep expiring instead
//!   of completing.
//! - **Restricted**: the deviation persisted for `restrict_after_windows`
//!   consecutive windows *and* other requesters on the resource were being
//!   denied more than they were granted.
//!
//! Flags only feed priority scoring and the effective quota. They decay on
//! their own after a quiet period; nothing here rejects a request.

mod window;

pub use window::{median, ResourceActivity, WindowActivity};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::clock::{span, window_index};
use crate::config::HoardingConfig;
use crate::types::{RequesterId, ResourceId};

/// Hoarding state of a requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoardingFlag {
    /// No penalty
    Clear,
    /// Moderate priority penalty
    Watched,
    /// Large priority penalty and reduced quota
    Restricted,
}

impl Default for HoardingFlag {
    fn default() -> Self {
        Self::Clear
    }
}

impl HoardingFlag {
    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clear => "clear",
            Self::Watched => "watched",
            Self::Restricted => "restricted",
        }
    }
}

/// Consecutive-anomaly streak on one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyStreak {
    /// Consecutive anomalous windows
    pub consecutive: u32,
    /// Last window judged anomalous
    pub last_window: Option<i64>,
}

/// Hoarding profile of one requester.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoardingProfile {
    /// Requester
    pub requester: RequesterId,
    /// Current flag
    pub flag: HoardingFlag,
    /// When the current flag was raised
    pub flagged_at: Option<DateTime<Utc>>,
    /// Most recent anomalous sample
    pub last_anomaly_at: Option<DateTime<Utc>>,
    /// Streaks per resource
    pub streaks: HashMap<ResourceId, AnomalyStreak>,
}

impl HoardingProfile {
    fn new(requester: &str) -> Self {
        Self {
            requester: requester.to_string(),
            flag: HoardingFlag::Clear,
            flagged_at: None,
            last_anomaly_at: None,
            streaks: HashMap::new(),
        }
    }
}

/// A flag transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagChange {
    /// Requester
    pub requester: RequesterId,
    /// Previous flag
    pub from: HoardingFlag,
    /// New flag
    pub to: HoardingFlag,
    /// When it changed
    pub at: DateTime<Utc>,
}

/// Entry in the operator-facing flagged list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlaggedRequester {
    /// Requester
    pub requester: RequesterId,
    /// Current flag
    pub flag: HoardingFlag,
    /// When the flag was raised
    pub flagged_at: Option<DateTime<Utc>>,
    /// Earliest time the flag can decay
    pub decays_at: Option<DateTime<Utc>>,
    /// Resources with an active anomaly streak
    pub resources: Vec<ResourceId>,
}

/// Observes usage and maintains hoarding profiles.
pub struct HoardingMonitor {
    config: HoardingConfig,
    profiles: DashMap<RequesterId, HoardingProfile>,
    activity: DashMap<ResourceId, ResourceActivity>,
}

impl HoardingMonitor {
    /// Create a monitor.
    pub fn new(config: HoardingConfig) -> Self {
        Self {
            config,
            profiles: DashMap::new(),
            activity: DashMap::new(),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &HoardingConfig {
        &self.config
    }

    fn window(&self, at: DateTime<Utc>) -> i64 {
        window_index(at, self.config.window_secs)
    }

    /// Record an admission of `requester` on `resource`.
    pub fn record_grant(&self, resource: &str, requester: &str, now: DateTime<Utc>) {
        let window = self.window(now);
        let mut activity = self
            .activity
            .entry(resource.to_string())
            .or_insert_with(|| ResourceActivity::new(self.config.retained_windows));
        *activity
            .window_mut(window)
            .grants
            .entry(requester.to_string())
            .or_insert(0) += 1;
    }

    /// Record a denial (requests that had to queue) of `requester` on `resource`.
    pub fn record_denial(&self, resource: &str, requester: &str, now: DateTime<Utc>) {
        let window = self.window(now);
        let mut activity = self
            .activity
            .entry(resource.to_string())
            .or_insert_with(|| ResourceActivity::new(self.config.retained_windows));
        *activity
            .window_mut(window)
            .denials
            .entry(requester.to_string())
            .or_insert(0) += 1;
    }

    /// Record a finished session and re-evaluate the requester.
    ///
    /// `expired` marks a session that timed out instead of completing.
    pub fn record_session(
        &self,
        resource: &str,
        requester: &str,
        duration: Duration,
        expired: bool,
        now: DateTime<Utc>,
    ) -> Option<FlagChange> {
        let window = self.window(now);
        let seconds = (duration.num_milliseconds().max(0) as f64) / 1000.0;

        // Update activity, then read what the evaluation needs.
        let (anomalous, contended) = {
            let mut activity = self
                .activity
                .entry(resource.to_string())
                .or_insert_with(|| ResourceActivity::new(self.config.retained_windows));
            let current = activity.window_mut(window);
            *current.usage_secs.entry(requester.to_string()).or_insert(0.0) += seconds;
            *current.sessions.entry(requester.to_string()).or_insert(0) += 1;
            if expired {
                *current.expiries.entry(requester.to_string()).or_insert(0) += 1;
            }

            let anomalous = self.is_anomalous(current, requester);
            let contended = activity
                .others_grant_ratio(requester)
                .map(|ratio| ratio < self.config.contention_ratio_threshold)
                .unwrap_or(false);
            (anomalous, contended)
        };

        let mut profile = self
            .profiles
            .entry(requester.to_string())
            .or_insert_with(|| HoardingProfile::new(requester));

        let mut change = self.apply_decay(&mut profile, now);
        if !anomalous {
            return change;
        }

        let streak = profile.streaks.entry(resource.to_string()).or_default();
        match streak.last_window {
            Some(last) if last == window => {}
            Some(last) if last == window - 1 => {
                streak.consecutive += 1;
                streak.last_window = Some(window);
            }
            _ => {
                streak.consecutive = 1;
                streak.last_window = Some(window);
            }
        }
        let consecutive = streak.consecutive;
        profile.last_anomaly_at = Some(now);

        let target = if consecutive >= self.config.restrict_after_windows && contended {
            HoardingFlag::Restricted
        } else {
            HoardingFlag::Watched
        };

        debug!(
            requester = %requester,
            resource = %resource,
            consecutive,
            contended,
            "Anomalous usage sample"
        );

        if target > profile.flag {
            let from = profile.flag;
            profile.flag = target;
            profile.flagged_at = Some(now);
            if target == HoardingFlag::Restricted {
                warn!(
                    requester = %requester,
                    resource = %resource,
                    consecutive,
                    "Requester restricted for hoarding contended capacity"
                );
            } else {
                info!(requester = %requester, resource = %resource, "Requester watched");
            }
            change = Some(FlagChange {
                requester: requester.to_string(),
                from,
                to: target,
                at: now,
            });
        }
        change
    }

    fn is_anomalous(&self, window: &WindowActivity, requester: &str) -> bool {
        if window.expiries_of(requester) >= self.config.expiry_anomaly_threshold {
            return true;
        }
        let mut peers = window.peer_usage(requester);
        if peers.len() < self.config.min_population {
            return false;
        }
        let own = window.usage_of(requester);
        match median(&mut peers) {
            Some(m) => own > 0.0 && own > self.config.watch_multiple * m,
            None => false,
        }
    }

    /// Lift a flag whose quiet period has elapsed.
    fn apply_decay(&self, profile: &mut HoardingProfile, now: DateTime<Utc>) -> Option<FlagChange> {
        let decays_at = self.decays_at(profile)?;
        if now < decays_at {
            return None;
        }
        let from = profile.flag;
        profile.flag = HoardingFlag::Clear;
        profile.flagged_at = None;
        profile.streaks.clear();
        info!(
            requester = %profile.requester,
            from = from.as_str(),
            "Hoarding flag decayed"
        );
        Some(FlagChange {
            requester: profile.requester.clone(),
            from,
            to: HoardingFlag::Clear,
            at: now,
        })
    }

    fn decays_at(&self, profile: &HoardingProfile) -> Option<DateTime<Utc>> {
        let last = profile.last_anomaly_at?;
        match profile.flag {
            HoardingFlag::Clear => None,
            HoardingFlag::Watched => Some(last + span(self.config.watch_decay_secs)),
            HoardingFlag::Restricted => Some(last + span(self.config.cooldown_secs)),
        }
    }

    /// Current flag of a requester, after decay.
    pub fn flag(&self, requester: &str, now: DateTime<Utc>) -> HoardingFlag {
        match self.profiles.get_mut(requester) {
            Some(mut profile) => {
                self.apply_decay(&mut profile, now);
                profile.flag
            }
            None => HoardingFlag::Clear,
        }
    }

    /// Quota multiplier for a requester: `restricted_quota_factor` while
    /// restricted, otherwise 1.
    pub fn quota_factor(&self, requester: &str, now: DateTime<Utc>) -> f64 {
        match self.flag(requester, now) {
            HoardingFlag::Restricted => self.config.restricted_quota_factor.clamp(0.0, 1.0),
            _ => 1.0,
        }
    }

    /// When a restriction can lift.
    pub fn restricted_until(&self, requester: &str) -> Option<DateTime<Utc>> {
        let profile = self.profiles.get(requester)?;
        if profile.flag != HoardingFlag::Restricted {
            return None;
        }
        self.decays_at(&profile)
    }

    /// Lift every flag whose quiet period has elapsed.
    pub fn decay_all(&self, now: DateTime<Utc>) -> Vec<FlagChange> {
        let mut changes = Vec::new();
        for mut profile in self.profiles.iter_mut() {
            if let Some(change) = self.apply_decay(profile.value_mut(), now) {
                changes.push(change);
            }
        }
        changes
    }

    /// Snapshot of a profile.
    pub fn profile(&self, requester: &str) -> Option<HoardingProfile> {
        self.profiles.get(requester).map(|p| p.value().clone())
    }

    /// Requesters currently watched or restricted, most severe first.
    pub fn flagged(&self) -> Vec<FlaggedRequester> {
        let mut flagged: Vec<_> = self
            .profiles
            .iter()
            .filter(|p| p.flag != HoardingFlag::Clear)
            .map(|p| {
                let mut resources: Vec<_> = p
                    .streaks
                    .iter()
                    .filter(|(_, s)| s.consecutive > 0)
                    .map(|(r, _)| r.clone())
                    .collect();
                resources.sort();
                FlaggedRequester {
                    requester: p.requester.clone(),
                    flag: p.flag,
                    flagged_at: p.flagged_at,
                    decays_at: self.decays_at(&p),
                    resources,
                }
            })
            .collect();
        flagged.sort_by(|a, b| b.flag.cmp(&a.flag).then_with(|| a.requester.cmp(&b.requester)));
        flagged
    }
}

impl Default for HoardingMonitor {
    fn default() -> Self {
        Self::new(HoardingConfig::default())
    }
}
