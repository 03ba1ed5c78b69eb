//! Configuration for the allocation engine.

use serde::{Deserialize, Serialize};

use crate::types::{AccessLevel, AllocationError, ResourceId};

/// Upper bound for every `*_secs` setting (100 years).
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 3600;

/// Engine-wide configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Priority scoring weights
    pub scoring: ScoringWeights,
    /// Hoarding detection settings
    pub hoarding: HoardingConfig,
    /// Queue and wait-estimate settings
    pub queue: QueueConfig,
    /// Access history window
    pub history: HistoryConfig,
    /// Maintenance loop settings
    pub maintenance: MaintenanceConfig,
    /// Audit settings
    pub audit: AuditConfig,
}

impl EngineConfig {
    /// Load config from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, AllocationError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every duration setting is within range.
    pub fn validate(&self) -> Result<(), AllocationError> {
        let spans = [
            ("hoarding.window_secs", self.hoarding.window_secs),
            ("hoarding.cooldown_secs", self.hoarding.cooldown_secs),
            ("hoarding.watch_decay_secs", self.hoarding.watch_decay_secs),
            ("queue.default_session_secs", self.queue.default_session_secs),
            ("history.window_secs", self.history.window_secs),
            ("maintenance.interval_secs", self.maintenance.interval_secs),
        ];
        for (name, secs) in spans {
            check_span(name, secs).map_err(|reason| AllocationError::ConfigurationInvalid {
                resource: "engine".to_string(),
                reason,
            })?;
        }
        Ok(())
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String, AllocationError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Weights for the priority formula.
///
/// `score = need * need_weight
///        - ln(1 + recent_grants) * history_weight
///        + ln(1 + recent_denials) * denial_weight
///        + underserved_bonus (if underserved)
///        + reserved_slack_bonus (if underserved and reserved pool has slack)
///        - watched_penalty | restricted_penalty`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// Weight on the clamped need signal
    pub need_weight: f64,
    /// Upper bound for the need signal (lower bound is 0)
    pub need_ceiling: f64,
    /// Weight on recent grants (anti-monopolization)
    pub history_weight: f64,
    /// Weight on recent denials
    pub denial_weight: f64,
    /// Fixed bonus for underserved requesters
    pub underserved_bonus: f64,
    /// Extra bonus when the reserved pool has free slots
    pub reserved_slack_bonus: f64,
    /// Penalty for a `watched` hoarding profile
    pub watched_penalty: f64,
    /// Penalty for a `restricted` hoarding profile
    pub restricted_penalty: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            need_weight: 1.0,
            need_ceiling: 10.0,
            history_weight: 1.5,
            denial_weight: 0.5,
            underserved_bonus: 3.0,
            reserved_slack_bonus: 1.0,
            watched_penalty: 2.0,
            restricted_penalty: 10.0,
        }
    }
}

/// Hoarding monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HoardingConfig {
    /// Length of one observation window (seconds)
    pub window_secs: u64,
    /// Number of trailing windows kept per requester and resource
    pub retained_windows: usize,
    /// Usage above this multiple of the peer median is anomalous
    pub watch_multiple: f64,
    /// Minimum number of other active requesters for a median comparison
    pub min_population: usize,
    /// Consecutive anomalous windows before a restriction is considered
    pub restrict_after_windows: u32,
    /// Other requesters' grants/denials ratio below which a resource counts
    /// as contended
    pub contention_ratio_threshold: f64,
    /// Expiries per window that count as an anomaly on their own
    pub expiry_anomaly_threshold: u32,
    /// Quiet period after which a restriction is lifted (seconds)
    pub cooldown_secs: u64,
    /// Quiet period after which a watch is lifted (seconds)
    pub watch_decay_secs: u64,
    /// Effective quota multiplier while restricted (0.0 - 1.0)
    pub restricted_quota_factor: f64,
}

impl Default for HoardingConfig {
    fn default() -> Self {
        Self {
            window_secs: 3600, // 1 hour
            retained_windows: 24,
            watch_multiple: 3.0,
            min_population: 2,
            restrict_after_windows: 3,
            contention_ratio_threshold: 1.0,
            expiry_anomaly_threshold: 3,
            cooldown_secs: 6 * 3600,
            watch_decay_secs: 2 * 3600,
            restricted_quota_factor: 0.5,
        }
    }
}

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Session duration assumed before any session has completed (seconds)
    pub default_session_secs: u64,
    /// EWMA smoothing factor for observed session durations
    pub ewma_alpha: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_session_secs: 1800,
            ewma_alpha: 0.2,
        }
    }
}

/// Access-history configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Rolling window over which grants and denials are counted (seconds)
    pub window_secs: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            window_secs: 7 * 24 * 3600,
        }
    }
}

/// Maintenance loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Tick interval (seconds)
    pub interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

/// Audit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Record admission decisions
    pub enabled: bool,
    /// Maximum retained entries
    pub max_entries: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
        }
    }
}

/// Allocation envelope of one resource, as supplied by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Resource ID
    pub resource_id: ResourceId,
    /// Category (informational, used for grouping in admin views)
    #[serde(default)]
    pub category: Option<String>,
    /// Total concurrent-usage capacity
    pub total_capacity: u32,
    /// Per-requester quota units per period
    pub per_requester_limit: u32,
    /// Fraction of capacity reserved for underserved requesters (0.0 - 1.0)
    pub reservation_fraction: f64,
    /// Minimum access level
    #[serde(default)]
    pub required_access_level: AccessLevel,
    /// Quota period length (seconds)
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    /// How long an entry may wait in the queue (seconds)
    #[serde(default = "default_queue_timeout_secs")]
    pub queue_timeout_secs: u64,
    /// Maximum queue depth
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    /// Grants older than this are expired by maintenance (seconds)
    #[serde(default)]
    pub max_session_secs: Option<u64>,
}

fn default_period_secs() -> u64 {
    86_400
}

fn default_queue_timeout_secs() -> u64 {
    3600
}

fn default_max_queue_depth() -> usize {
    1000
}

impl ResourceConfig {
    /// Create a config with daily periods and default queue settings.
    pub fn new(
        resource_id: impl Into<ResourceId>,
        total_capacity: u32,
        per_requester_limit: u32,
        reservation_fraction: f64,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            category: None,
            total_capacity,
            per_requester_limit,
            reservation_fraction,
            required_access_level: AccessLevel::Public,
            period_secs: default_period_secs(),
            queue_timeout_secs: default_queue_timeout_secs(),
            max_queue_depth: default_max_queue_depth(),
            max_session_secs: None,
        }
    }

    /// Set required access level.
    pub fn with_access_level(mut self, level: AccessLevel) -> Self {
        self.required_access_level = level;
        self
    }

    /// Set quota period.
    pub fn with_period_secs(mut self, secs: u64) -> Self {
        self.period_secs = secs;
        self
    }

    /// Set queue timeout.
    pub fn with_queue_timeout_secs(mut self, secs: u64) -> Self {
        self.queue_timeout_secs = secs;
        self
    }

    /// Set maximum queue depth.
    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    /// Set maximum session length.
    pub fn with_max_session_secs(mut self, secs: u64) -> Self {
        self.max_session_secs = Some(secs);
        self
    }

    /// Capacity carved out for underserved requesters.
    pub fn reserved_capacity(&self) -> u32 {
        (f64::from(self.total_capacity) * self.reservation_fraction).floor() as u32
    }

    /// Capacity open to all requesters.
    pub fn general_capacity(&self) -> u32 {
        self.total_capacity - self.reserved_capacity()
    }

    /// Check the envelope is usable.
    pub fn validate(&self) -> Result<(), AllocationError> {
        let invalid = |reason: String| AllocationError::ConfigurationInvalid {
            resource: self.resource_id.clone(),
            reason,
        };

        if self.resource_id.is_empty() {
            return Err(invalid("resource id is empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.reservation_fraction) {
            return Err(invalid(format!(
                "reservation fraction {} outside [0, 1]",
                self.reservation_fraction
            )));
        }
        if self.total_capacity == 0 {
            return Err(invalid("total capacity is zero".to_string()));
        }
        if self.per_requester_limit == 0 {
            return Err(invalid("per-requester limit is zero".to_string()));
        }
        if self.period_secs == 0 {
            return Err(invalid("quota period is zero".to_string()));
        }
        if self.queue_timeout_secs == 0 {
            return Err(invalid("queue timeout is zero".to_string()));
        }
        if self.max_session_secs == Some(0) {
            return Err(invalid("max session length is zero".to_string()));
        }
        check_span("period_secs", self.period_secs).map_err(&invalid)?;
        check_span("queue_timeout_secs", self.queue_timeout_secs).map_err(&invalid)?;
        if let Some(secs) = self.max_session_secs {
            check_span("max_session_secs", secs).map_err(&invalid)?;
        }
        Ok(())
    }
}

fn check_span(name: &str, secs: u64) -> Result<(), String> {
    if secs > MAX_DURATION_SECS {
        return Err(format!("{name} {secs} exceeds {MAX_DURATION_SECS}"));
    }
    Ok(())
}
