//! Periodic maintenance loop.
//!
//! Drives [`AllocationCoordinator::run_maintenance`] on a fixed interval:
//! period rollover at the boundary, queue timeouts, overdue grants and
//! hoarding-flag decay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

use crate::coordinator::{AllocationCoordinator, MaintenanceReport};

/// Loop status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaintenanceStatus {
    /// Whether the loop is running
    pub active: bool,
    /// Passes completed
    pub passes: u64,
    /// When the last pass finished
    pub last_run_at: Option<DateTime<Utc>>,
    /// Entries timed out across all passes
    pub total_timed_out: u64,
    /// Grants expired across all passes
    pub total_expired_grants: u64,
    /// Rollovers applied across all passes
    pub total_rollovers: u64,
}

/// Periodic maintenance over one coordinator.
pub struct MaintenanceLoop {
    coordinator: Arc<AllocationCoordinator>,
    interval: Duration,
    status: Arc<RwLock<MaintenanceStatus>>,
}

impl MaintenanceLoop {
    /// Create a loop using the coordinator's configured interval.
    pub fn new(coordinator: Arc<AllocationCoordinator>) -> Self {
        let secs = coordinator.config().maintenance.interval_secs.max(1);
        Self::with_interval(coordinator, Duration::from_secs(secs))
    }

    /// Create a loop with an explicit interval.
    pub fn with_interval(coordinator: Arc<AllocationCoordinator>, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
            status: Arc::new(RwLock::new(MaintenanceStatus::default())),
        }
    }

    /// Shared status handle.
    pub fn status(&self) -> Arc<RwLock<MaintenanceStatus>> {
        Arc::clone(&self.status)
    }

    /// Run one pass and fold it into the status.
    pub async fn tick(&self) -> MaintenanceReport {
        let report = self.coordinator.run_maintenance().await;

        let mut status = self.status.write().await;
        status.passes += 1;
        status.last_run_at = Some(self.coordinator.now());
        status.total_timed_out += report.timed_out as u64;
        status.total_expired_grants += report.expired_grants as u64;
        status.total_rollovers += report.rollovers as u64;

        if report == MaintenanceReport::default() {
            debug!("Maintenance pass found nothing to do");
        } else {
            info!(
                rollovers = report.rollovers,
                timed_out = report.timed_out,
                expired_grants = report.expired_grants,
                admitted_from_queue = report.admitted_from_queue,
                evicted = report.evicted,
                flags_decayed = report.flags_decayed,
                "Maintenance pass complete"
            );
        }
        report
    }

    /// Start the loop on the runtime.
    pub fn spawn(self) -> MaintenanceHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let status = self.status();

        let join = tokio::spawn(async move {
            self.status.write().await.active = true;
            info!(interval_secs = self.interval.as_secs(), "Maintenance loop started");

            let mut tick = interval(self.interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        self.tick().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Maintenance loop shutting down");
                        break;
                    }
                }
            }

            self.status.write().await.active = false;
        });

        MaintenanceHandle {
            shutdown_tx,
            join,
            status,
        }
    }
}

/// Handle to a spawned [`MaintenanceLoop`].
pub struct MaintenanceHandle {
    shutdown_tx: mpsc::Sender<()>,
    join: JoinHandle<()>,
    status: Arc<RwLock<MaintenanceStatus>>,
}

impl MaintenanceHandle {
    /// Current status.
    pub async fn status(&self) -> MaintenanceStatus {
        self.status.read().await.clone()
    }

    /// Stop the loop and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.join.await;
    }
}
