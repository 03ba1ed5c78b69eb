//! Quota Engine - Fair Resource Allocation
//!
//! Decides who gets a scarce, capacity-limited shared resource:
//!
//! - **Per-requester quotas**: limits per resource per period, reset on
//!   epoch-aligned boundaries
//! - **Reserved capacity**: a fraction held back for underserved requesters
//! - **Priority queueing**: waiting requests ordered by need and history,
//!   with an advisory wait estimate
//! - **Hoarding detection**: requesters holding far more than their peers
//!   while others wait are flagged, restricted, and decay back to clear
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 AllocationCoordinator                       │
//! │                                                             │
//! │  ┌─────────────┐  ┌─────────────────┐  ┌────────────────┐  │
//! │  │ QuotaLedger │  │ ReservationPool │  │   FairQueue    │  │
//! │  └─────────────┘  └─────────────────┘  └────────────────┘  │
//! │         (one set per resource, behind its own lock)         │
//! │                                                             │
//! │  ┌──────────────────┐  ┌────────────────┐  ┌────────────┐  │
//! │  │ HoardingMonitor  │  │ PriorityScorer │  │  AuditLog  │  │
//! │  └──────────────────┘  └────────────────┘  └────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod audit;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod history;
pub mod hoarding;
pub mod ledger;
pub mod maintenance;
pub mod queue;
pub mod reservation;
pub mod scorer;
pub mod types;

// Re-export main types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, ResourceConfig};
pub use coordinator::{
    AdmissionHook, AllocationCoordinator, AllocationEvent, CoordinatorBuilder, DrainReport,
    MaintenanceReport, ResourceSnapshot,
};
pub use hoarding::{HoardingFlag, HoardingMonitor};
pub use maintenance::{MaintenanceHandle, MaintenanceLoop};
pub use types::*;
