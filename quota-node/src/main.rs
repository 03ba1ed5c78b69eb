//! quota-node: runtime host for the quota engine
//!
//! Loads the resource catalog, runs the maintenance loop (period rollover,
//! queue timeouts, session expiry, hoarding decay) and logs allocation
//! events and periodic resource snapshots until interrupted.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use quota_engine::{AllocationCoordinator, AllocationEvent, MaintenanceLoop};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, info_span, warn, Instrument};

use config::Config;

#[derive(Parser)]
#[command(name = "quota-node")]
#[command(about = "Fair resource allocation and quota engine host")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "quota-node.toml")]
    config: PathBuf,

    /// Node ID (overrides config file)
    #[arg(long, env = "QUOTA_NODE_ID")]
    node_id: Option<String>,

    /// Maintenance interval in seconds (overrides config file)
    #[arg(long, env = "QUOTA_MAINTENANCE_INTERVAL")]
    maintenance_interval: Option<u64>,

    /// Emit JSON log lines
    #[arg(long, env = "QUOTA_JSON_LOGS")]
    json_logs: bool,

    /// Validate configuration, print resource snapshots and exit
    #[arg(long)]
    check: bool,
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("quota_node=info".parse()?)
        .add_directive("quota_engine=info".parse()?);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node.id = node_id;
    }
    if let Some(interval) = cli.maintenance_interval {
        config.engine.maintenance.interval_secs = interval;
    }
    if cli.json_logs {
        config.logging.json = true;
    }

    init_tracing(config.logging.json)?;

    let span = info_span!("node", node_id = %config.node.id);
    run(config, &cli.config, cli.check).instrument(span).await
}

async fn run(config: Config, path: &std::path::Path, check: bool) -> anyhow::Result<()> {
    info!(config = %path.display(), "Starting quota-node");

    let coordinator = Arc::new(AllocationCoordinator::with_config(config.engine.clone()));

    let mut configured = 0usize;
    for resource in config.resources.iter().cloned() {
        let id = resource.resource_id.clone();
        match coordinator.configure_resource(resource).await {
            Ok(()) => configured += 1,
            Err(e) => warn!(resource = %id, error = %e, "Resource disabled by invalid configuration"),
        }
    }
    info!(
        configured,
        total = config.resources.len(),
        "Resource catalog loaded"
    );

    if check {
        let snapshots = coordinator.snapshots().await;
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
        return Ok(());
    }

    // Event log
    let mut events = coordinator.subscribe();
    let json_events = config.logging.json;
    tokio::spawn(
        async move {
            loop {
                match events.recv().await {
                    Ok(event) => log_event(&event, json_events),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event log lagging, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
        .in_current_span(),
    );

    let maintenance = MaintenanceLoop::new(Arc::clone(&coordinator)).spawn();

    let snapshot_secs = config.logging.snapshot_interval_secs;
    let mut snapshot_tick =
        tokio::time::interval(Duration::from_secs(snapshot_secs.max(1)));

    loop {
        tokio::select! {
            _ = snapshot_tick.tick(), if snapshot_secs > 0 => {
                for snapshot in coordinator.snapshots().await {
                    info!(
                        resource = %snapshot.resource,
                        utilization = snapshot.utilization,
                        queue_depth = snapshot.queue_depth,
                        queued_underserved = snapshot.queued_underserved,
                        reserved_in_use = snapshot.reserved_in_use,
                        general_in_use = snapshot.general_in_use,
                        contention_retries = snapshot.contention_retries,
                        "Resource snapshot"
                    );
                }
                let flagged = coordinator.flagged_requesters();
                if !flagged.is_empty() {
                    info!(flagged = flagged.len(), "Requesters under hoarding watch");
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                info!("Shutting down");
                break;
            }
        }
    }

    let status = maintenance.status().await;
    maintenance.stop().await;
    info!(
        passes = status.passes,
        rollovers = status.total_rollovers,
        timed_out = status.total_timed_out,
        expired_grants = status.total_expired_grants,
        "quota-node stopped"
    );

    Ok(())
}

fn log_event(event: &AllocationEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => info!(event = %line, "Allocation event"),
            Err(e) => warn!(error = %e, "Failed to serialize allocation event"),
        }
        return;
    }
    match event {
        AllocationEvent::AdmittedFromQueue { grant, .. } => {
            info!(requester = %grant.requester, resource = %grant.resource, "Admitted from queue");
        }
        AllocationEvent::Evicted { entry, reason } => {
            info!(
                requester = %entry.requester,
                resource = %entry.resource,
                reason = reason.as_str(),
                "Evicted from queue"
            );
        }
        AllocationEvent::TimedOut { entry } => {
            info!(requester = %entry.requester, resource = %entry.resource, "Queue entry timed out");
        }
        AllocationEvent::Withdrawn { entry } => {
            info!(requester = %entry.requester, resource = %entry.resource, "Queue entry withdrawn");
        }
        AllocationEvent::SessionEnded {
            requester,
            resource,
            expired,
            ..
        } => {
            info!(requester = %requester, resource = %resource, expired, "Session ended");
        }
        AllocationEvent::FlagChanged(change) => {
            info!(
                requester = %change.requester,
                from = change.from.as_str(),
                to = change.to.as_str(),
                "Hoarding flag changed"
            );
        }
        AllocationEvent::RolloverApplied {
            resource,
            period_start,
        } => {
            info!(resource = %resource, period_start = %period_start, "Quota period rolled over");
        }
        AllocationEvent::ResourceConfigured { resource, staged } => {
            info!(resource = %resource, staged, "Resource configured");
        }
    }
}
