//! Allocation coordinator integration tests
//!
//! Drives the coordinator end to end with a manual clock:
//! - Reserved/general partitioning and queueing
//! - Quota limits, release and period rollover
//! - Queue ordering, withdrawal, depth limits and eviction
//! - Staged reconfiguration and invalid configs
//! - Hoarding flags raised by sessions and lifted by maintenance

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use quota_engine::{
    AccessLevel, AccessOutcome, AccessRequest, AllocationCoordinator, AllocationError,
    AllocationEvent, EngineConfig, Grant, HoardingFlag, ManualClock, PoolKind, RejectionReason,
    Requester, ResourceConfig, SessionEnd,
};

// =============================================================================
// Helpers
// =============================================================================

fn coordinator_with_clock() -> (AllocationCoordinator, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_epoch());
    let coordinator = AllocationCoordinator::builder()
        .config(EngineConfig::default())
        .clock(clock.clone())
        .build();
    (coordinator, clock)
}

async fn request(coordinator: &AllocationCoordinator, requester: Requester) -> AccessOutcome {
    coordinator
        .request_access(AccessRequest::new(requester, "gpu"))
        .await
        .expect("known resource")
}

fn granted(outcome: &AccessOutcome) -> Grant {
    outcome.grant().cloned().expect("admitted")
}

fn queued_entry(outcome: &AccessOutcome) -> String {
    match outcome {
        AccessOutcome::Queued { entry_id, .. } => entry_id.clone(),
        other => panic!("expected queued, got {other:?}"),
    }
}

// =============================================================================
// Capacity partitioning
// =============================================================================

#[tokio::test]
async fn test_general_requesters_never_take_reserved_slots() {
    let (coordinator, _clock) = coordinator_with_clock();
    coordinator
        .configure_resource(ResourceConfig::new("gpu", 10, 5, 0.3))
        .await
        .unwrap();

    let mut outcomes = Vec::new();
    for i in 0..8 {
        outcomes.push(request(&coordinator, Requester::general(format!("g{i}"))).await);
    }

    assert_eq!(outcomes.iter().filter(|o| o.is_admitted()).count(), 7);
    assert!(outcomes[7].is_queued());

    let snapshot = coordinator.snapshot("gpu").await.unwrap();
    assert_eq!(snapshot.general_in_use, 7);
    assert_eq!(snapshot.reserved_in_use, 0);
    assert_eq!(snapshot.reserved_capacity, 3);
    assert_eq!(snapshot.queue_depth, 1);

    // An underserved arrival still takes a reserved slot while the general
    // entry waits.
    let outcome = request(&coordinator, Requester::underserved("u0")).await;
    assert_eq!(granted(&outcome).pool, PoolKind::Reserved);

    let snapshot = coordinator.snapshot("gpu").await.unwrap();
    assert_eq!(snapshot.reserved_in_use, 1);
    assert_eq!(snapshot.queue_depth, 1);
}

#[tokio::test]
async fn test_underserved_take_reserved_slots_behind_blocked_general_head() {
    let (coordinator, _clock) = coordinator_with_clock();
    coordinator
        .configure_resource(ResourceConfig::new("gpu", 2, 5, 0.5))
        .await
        .unwrap();

    let g1 = request(&coordinator, Requester::general("g1")).await;
    assert_eq!(granted(&g1).pool, PoolKind::General);

    // A high-need general entry blocks the head on the full general pool.
    let g2 = coordinator
        .request_access(AccessRequest::new(Requester::general("g2"), "gpu").with_need(10.0))
        .await
        .unwrap();
    let g2 = queued_entry(&g2);

    // The reserved slot is idle and the head can never use it.
    let u1 = request(&coordinator, Requester::underserved("u1")).await;
    let u1 = granted(&u1);
    assert_eq!(u1.pool, PoolKind::Reserved);

    let snapshot = coordinator.snapshot("gpu").await.unwrap();
    assert_eq!(snapshot.reserved_in_use, 1);
    assert_eq!(snapshot.queue_depth, 1);
    assert_eq!(coordinator.estimate_wait("gpu", &g2).await.unwrap().position, 1);

    // With both pools full, the next underserved arrival waits behind g2.
    let u2 = queued_entry(&request(&coordinator, Requester::underserved("u2")).await);
    assert_eq!(coordinator.estimate_wait("gpu", &u2).await.unwrap().position, 2);

    // Freeing the reserved slot serves u2; g2 still waits for general capacity.
    let report = coordinator
        .complete_session(&u1, SessionEnd::Completed)
        .await
        .unwrap();
    assert_eq!(report.admitted.len(), 1);
    assert_eq!(report.admitted[0].0, u2);
    assert_eq!(report.admitted[0].1.pool, PoolKind::Reserved);
    assert_eq!(coordinator.estimate_wait("gpu", &g2).await.unwrap().position, 1);

    let snapshot = coordinator.snapshot("gpu").await.unwrap();
    assert_eq!(snapshot.general_in_use, 1);
    assert_eq!(snapshot.reserved_in_use, 1);
}

#[tokio::test]
async fn test_queued_with_default_wait_estimate() {
    let (coordinator, _clock) = coordinator_with_clock();
    coordinator
        .configure_resource(ResourceConfig::new("gpu", 2, 5, 0.5))
        .await
        .unwrap();

    let u = request(&coordinator, Requester::underserved("u")).await;
    let g = request(&coordinator, Requester::general("g")).await;
    assert_eq!(granted(&u).pool, PoolKind::Reserved);
    assert_eq!(granted(&g).pool, PoolKind::General);

    let third = request(&coordinator, Requester::general("h")).await;
    match &third {
        AccessOutcome::Queued {
            position,
            estimated_wait,
            ..
        } => {
            assert_eq!(*position, 1);
            assert_eq!(*estimated_wait, Duration::from_secs(1800));
        }
        other => panic!("expected queued, got {other:?}"),
    }

    let entry_id = queued_entry(&third);
    let estimate = coordinator.estimate_wait("gpu", &entry_id).await.unwrap();
    assert_eq!(estimate.position, 1);

    // Freeing the general slot admits the waiting entry.
    let report = coordinator
        .complete_session(&granted(&g), SessionEnd::Completed)
        .await
        .unwrap();
    assert_eq!(report.admitted.len(), 1);
    assert_eq!(report.admitted[0].0, entry_id);
    assert_eq!(report.admitted[0].1.requester, "h");
}

// =============================================================================
// Quota
// =============================================================================

#[tokio::test]
async fn test_quota_exceeded_and_released() {
    let (coordinator, _clock) = coordinator_with_clock();
    coordinator
        .configure_resource(ResourceConfig::new("gpu", 10, 2, 0.0))
        .await
        .unwrap();

    let first = request(&coordinator, Requester::general("a")).await;
    let second = request(&coordinator, Requester::general("a")).await;
    assert!(first.is_admitted() && second.is_admitted());

    let third = request(&coordinator, Requester::general("a")).await;
    match third {
        AccessOutcome::Rejected(RejectionReason::QuotaExceeded {
            used,
            limit,
            requested,
            resets_at,
        }) => {
            assert_eq!(used, 2);
            assert_eq!(limit, 2);
            assert_eq!(requested, 1);
            assert_eq!(resets_at, DateTime::from_timestamp(86_400, 0).unwrap());
        }
        other => panic!("expected quota rejection, got {other:?}"),
    }

    // A completed session keeps its quota consumed.
    coordinator
        .complete_session(&granted(&first), SessionEnd::Completed)
        .await
        .unwrap();
    let record = coordinator.quota_record("gpu", "a").await.unwrap().unwrap();
    assert_eq!(record.used, 2);

    // A session that never started gives its quota back.
    coordinator
        .complete_session(&granted(&second), SessionEnd::NotStarted)
        .await
        .unwrap();
    let record = coordinator.quota_record("gpu", "a").await.unwrap().unwrap();
    assert_eq!(record.used, 1);

    assert!(request(&coordinator, Requester::general("a")).await.is_admitted());
}

#[tokio::test]
async fn test_completing_twice_is_an_error() {
    let (coordinator, _clock) = coordinator_with_clock();
    coordinator
        .configure_resource(ResourceConfig::new("gpu", 1, 5, 0.0))
        .await
        .unwrap();

    let grant = granted(&request(&coordinator, Requester::general("a")).await);
    tokio_test::assert_ok!(coordinator.complete_session(&grant, SessionEnd::Completed).await);
    let err = tokio_test::assert_err!(
        coordinator
            .complete_session(&grant, SessionEnd::Completed)
            .await
    );
    assert!(matches!(err, AllocationError::GrantNotFound(_)));
}

#[tokio::test]
async fn test_rollover_is_idempotent_and_ignores_stale_release() {
    let (coordinator, _clock) = coordinator_with_clock();
    coordinator
        .configure_resource(ResourceConfig::new("gpu", 10, 1, 0.0).with_period_secs(3600))
        .await
        .unwrap();

    let old = granted(&request(&coordinator, Requester::general("a")).await);
    assert!(matches!(
        request(&coordinator, Requester::general("a")).await,
        AccessOutcome::Rejected(RejectionReason::QuotaExceeded { .. })
    ));

    let next = DateTime::from_timestamp(3600, 0).unwrap();
    let outcome = coordinator.rollover("gpu", next).await.unwrap();
    assert!(outcome.applied);
    assert_eq!(outcome.records_reset, 1);

    let again = coordinator.rollover("gpu", next).await.unwrap();
    assert!(!again.applied);

    assert!(request(&coordinator, Requester::general("a")).await.is_admitted());

    // Releasing a grant charged to the previous period leaves the new one alone.
    coordinator
        .complete_session(&old, SessionEnd::NotStarted)
        .await
        .unwrap();
    let record = coordinator.quota_record("gpu", "a").await.unwrap().unwrap();
    assert_eq!(record.used, 1);
}

#[tokio::test]
async fn test_maintenance_rolls_over_at_boundary() {
    let (coordinator, clock) = coordinator_with_clock();
    coordinator
        .configure_resource(ResourceConfig::new("gpu", 10, 1, 0.0).with_period_secs(3600))
        .await
        .unwrap();
    let mut events = coordinator.subscribe();

    assert!(request(&coordinator, Requester::general("a")).await.is_admitted());

    let report = coordinator.run_maintenance().await;
    assert_eq!(report.rollovers, 0);

    clock.advance(chrono::Duration::seconds(3600));
    let report = coordinator.run_maintenance().await;
    assert_eq!(report.rollovers, 1);
    assert!(matches!(
        events.try_recv(),
        Ok(AllocationEvent::RolloverApplied { .. })
    ));

    let report = coordinator.run_maintenance().await;
    assert_eq!(report.rollovers, 0);

    assert!(request(&coordinator, Requester::general("a")).await.is_admitted());
}

// =============================================================================
// Queue behavior
// =============================================================================

#[tokio::test]
async fn test_equal_scores_admitted_in_submission_order() {
    let (coordinator, _clock) = coordinator_with_clock();
    coordinator
        .configure_resource(ResourceConfig::new("gpu", 1, 5, 0.0))
        .await
        .unwrap();

    let a = granted(&request(&coordinator, Requester::general("a")).await);
    let b = queued_entry(&request(&coordinator, Requester::general("b")).await);
    let c = queued_entry(&request(&coordinator, Requester::general("c")).await);

    assert_eq!(coordinator.estimate_wait("gpu", &b).await.unwrap().position, 1);
    assert_eq!(coordinator.estimate_wait("gpu", &c).await.unwrap().position, 2);

    let report = coordinator
        .complete_session(&a, SessionEnd::Completed)
        .await
        .unwrap();
    assert_eq!(report.admitted.len(), 1);
    assert_eq!(report.admitted[0].1.requester, "b");
    assert_eq!(coordinator.estimate_wait("gpu", &c).await.unwrap().position, 1);
}

#[tokio::test]
async fn test_higher_need_jumps_ahead() {
    let (coordinator, _clock) = coordinator_with_clock();
    coordinator
        .configure_resource(ResourceConfig::new("gpu", 1, 5, 0.0))
        .await
        .unwrap();

    let a = granted(&request(&coordinator, Requester::general("a")).await);
    let low = queued_entry(&request(&coordinator, Requester::general("low")).await);
    let high = coordinator
        .request_access(AccessRequest::new(Requester::general("high"), "gpu").with_need(5.0))
        .await
        .unwrap();
    let high = queued_entry(&high);

    assert_eq!(coordinator.estimate_wait("gpu", &high).await.unwrap().position, 1);
    assert_eq!(coordinator.estimate_wait("gpu", &low).await.unwrap().position, 2);

    let report = coordinator
        .complete_session(&a, SessionEnd::Completed)
        .await
        .unwrap();
    assert_eq!(report.admitted[0].1.requester, "high");
}

#[tokio::test]
async fn test_withdraw_updates_positions() {
    let (coordinator, _clock) = coordinator_with_clock();
    coordinator
        .configure_resource(ResourceConfig::new("gpu", 1, 5, 0.0))
        .await
        .unwrap();

    request(&coordinator, Requester::general("a")).await;
    let b = queued_entry(&request(&coordinator, Requester::general("b")).await);
    let c = queued_entry(&request(&coordinator, Requester::general("c")).await);

    let removed = coordinator.withdraw("gpu", &b).await.unwrap();
    assert_eq!(removed.requester, "b");
    assert_eq!(coordinator.estimate_wait("gpu", &c).await.unwrap().position, 1);

    let err = coordinator.withdraw("gpu", &b).await.unwrap_err();
    assert!(matches!(err, AllocationError::EntryNotFound(_)));
}

#[tokio::test]
async fn test_queue_depth_limit() {
    let (coordinator, _clock) = coordinator_with_clock();
    coordinator
        .configure_resource(ResourceConfig::new("gpu", 1, 5, 0.0).with_max_queue_depth(1))
        .await
        .unwrap();

    request(&coordinator, Requester::general("a")).await;
    assert!(request(&coordinator, Requester::general("b")).await.is_queued());
    assert!(matches!(
        request(&coordinator, Requester::general("c")).await,
        AccessOutcome::Rejected(RejectionReason::QueueFull { depth: 1 })
    ));
}

#[tokio::test]
async fn test_head_out_of_quota_is_evicted() {
    let (coordinator, _clock) = coordinator_with_clock();
    coordinator
        .configure_resource(ResourceConfig::new("gpu", 1, 1, 0.0))
        .await
        .unwrap();
    let mut events = coordinator.subscribe();

    let a = granted(&request(&coordinator, Requester::general("a")).await);
    // Both pass quota while waiting; only one can be served.
    assert!(request(&coordinator, Requester::general("b")).await.is_queued());
    assert!(request(&coordinator, Requester::general("b")).await.is_queued());

    let report = coordinator
        .complete_session(&a, SessionEnd::Completed)
        .await
        .unwrap();
    assert_eq!(report.admitted.len(), 1);
    assert_eq!(report.evicted.len(), 1);
    assert!(matches!(
        report.evicted[0].1,
        RejectionReason::QuotaExceeded { .. }
    ));

    let mut saw_eviction = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, AllocationEvent::Evicted { .. }) {
            saw_eviction = true;
        }
    }
    assert!(saw_eviction);
    assert_eq!(coordinator.snapshot("gpu").await.unwrap().queue_depth, 0);
}

#[tokio::test]
async fn test_overdue_grants_expire() {
    let (coordinator, clock) = coordinator_with_clock();
    coordinator
        .configure_resource(ResourceConfig::new("gpu", 1, 5, 0.0).with_max_session_secs(600))
        .await
        .unwrap();

    request(&coordinator, Requester::general("a")).await;
    assert!(request(&coordinator, Requester::general("b")).await.is_queued());

    clock.advance(chrono::Duration::seconds(601));
    let report = coordinator.run_maintenance().await;
    assert_eq!(report.expired_grants, 1);
    assert_eq!(report.admitted_from_queue, 1);
}

// =============================================================================
// Configuration
// =============================================================================

#[tokio::test]
async fn test_unknown_resource() {
    let (coordinator, _clock) = coordinator_with_clock();
    let err = coordinator
        .request_access(AccessRequest::new(Requester::general("a"), "missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, AllocationError::UnknownResource(_)));
}

#[tokio::test]
async fn test_invalid_config_disables_admission() {
    let (coordinator, _clock) = coordinator_with_clock();
    let err = coordinator
        .configure_resource(ResourceConfig::new("gpu", 10, 5, 1.5))
        .await
        .unwrap_err();
    assert!(matches!(err, AllocationError::ConfigurationInvalid { .. }));

    assert!(matches!(
        request(&coordinator, Requester::general("a")).await,
        AccessOutcome::Rejected(RejectionReason::ConfigurationInvalid { .. })
    ));

    coordinator
        .configure_resource(ResourceConfig::new("gpu", 10, 5, 0.5))
        .await
        .unwrap();
    assert!(request(&coordinator, Requester::general("a")).await.is_admitted());
}

#[tokio::test]
async fn test_out_of_range_durations_are_rejected() {
    let (coordinator, _clock) = coordinator_with_clock();
    let huge = 10u64.pow(16);

    let err = coordinator
        .configure_resource(ResourceConfig::new("gpu", 2, 5, 0.0).with_period_secs(huge))
        .await
        .unwrap_err();
    assert!(matches!(err, AllocationError::ConfigurationInvalid { .. }));

    let err = coordinator
        .configure_resource(ResourceConfig::new("lab", 2, 5, 0.0).with_queue_timeout_secs(huge))
        .await
        .unwrap_err();
    assert!(matches!(err, AllocationError::ConfigurationInvalid { .. }));

    assert!(matches!(
        request(&coordinator, Requester::general("a")).await,
        AccessOutcome::Rejected(RejectionReason::ConfigurationInvalid { .. })
    ));
    let report = coordinator.run_maintenance().await;
    assert_eq!(report.timed_out, 0);
    assert_eq!(coordinator.snapshots().await.len(), 2);
}

#[tokio::test]
async fn test_access_level_gate() {
    let (coordinator, _clock) = coordinator_with_clock();
    coordinator
        .configure_resource(
            ResourceConfig::new("gpu", 10, 5, 0.0).with_access_level(AccessLevel::Verified),
        )
        .await
        .unwrap();

    assert!(matches!(
        request(&coordinator, Requester::general("a")).await,
        AccessOutcome::Rejected(RejectionReason::AccessLevelInsufficient { .. })
    ));
    let partner = Requester::general("p").with_access_level(AccessLevel::Partner);
    assert!(request(&coordinator, partner).await.is_admitted());
}

#[tokio::test]
async fn test_capacity_reduction_is_staged() {
    let (coordinator, _clock) = coordinator_with_clock();
    coordinator
        .configure_resource(ResourceConfig::new("gpu", 2, 5, 0.0))
        .await
        .unwrap();

    let a = granted(&request(&coordinator, Requester::general("a")).await);
    let b = granted(&request(&coordinator, Requester::general("b")).await);

    coordinator
        .configure_resource(ResourceConfig::new("gpu", 1, 5, 0.0))
        .await
        .unwrap();
    let snapshot = coordinator.snapshot("gpu").await.unwrap();
    assert!(snapshot.staged_capacity_change);
    assert_eq!(snapshot.total_capacity, 2);

    coordinator
        .complete_session(&a, SessionEnd::Completed)
        .await
        .unwrap();
    let snapshot = coordinator.snapshot("gpu").await.unwrap();
    assert!(!snapshot.staged_capacity_change);
    assert_eq!(snapshot.total_capacity, 1);
    assert_eq!(snapshot.general_in_use, 1);

    assert!(request(&coordinator, Requester::general("c")).await.is_queued());
    let report = coordinator
        .complete_session(&b, SessionEnd::Completed)
        .await
        .unwrap();
    assert_eq!(report.admitted[0].1.requester, "c");
}

#[tokio::test]
async fn test_lowered_limit_waits_for_rollover() {
    let (coordinator, _clock) = coordinator_with_clock();
    coordinator
        .configure_resource(ResourceConfig::new("gpu", 10, 3, 0.0))
        .await
        .unwrap();

    request(&coordinator, Requester::general("a")).await;
    request(&coordinator, Requester::general("a")).await;

    coordinator
        .configure_resource(ResourceConfig::new("gpu", 10, 1, 0.0))
        .await
        .unwrap();
    assert_eq!(coordinator.snapshot("gpu").await.unwrap().pending_limit, Some(1));

    let next = DateTime::from_timestamp(86_400, 0).unwrap();
    coordinator.rollover("gpu", next).await.unwrap();
    let record = coordinator.quota_record("gpu", "a").await.unwrap().unwrap();
    assert_eq!(record.limit, 1);
    assert_eq!(record.used, 0);
}

// =============================================================================
// Hoarding
// =============================================================================

#[tokio::test]
async fn test_heavy_session_is_watched_then_decays() {
    let (coordinator, clock) = coordinator_with_clock();
    coordinator
        .configure_resource(ResourceConfig::new("gpu", 10, 10, 0.0))
        .await
        .unwrap();
    let mut events = coordinator.subscribe();

    let p1 = granted(&request(&coordinator, Requester::general("p1")).await);
    let p2 = granted(&request(&coordinator, Requester::general("p2")).await);
    let hog = granted(&request(&coordinator, Requester::general("hog")).await);

    clock.advance(chrono::Duration::seconds(60));
    coordinator.complete_session(&p1, SessionEnd::Completed).await.unwrap();
    coordinator.complete_session(&p2, SessionEnd::Completed).await.unwrap();

    clock.advance(chrono::Duration::seconds(940));
    coordinator.complete_session(&hog, SessionEnd::Completed).await.unwrap();

    let now = coordinator.now();
    assert_eq!(coordinator.hoarding().flag("hog", now), HoardingFlag::Watched);
    // Nobody was waiting, so no restriction.
    assert_eq!(coordinator.hoarding().quota_factor("hog", now), 1.0);

    let flagged = coordinator.flagged_requesters();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].requester, "hog");

    let mut saw_flag = false;
    while let Ok(event) = events.try_recv() {
        if let AllocationEvent::FlagChanged(change) = event {
            assert_eq!(change.to, HoardingFlag::Watched);
            saw_flag = true;
        }
    }
    assert!(saw_flag);

    clock.advance(chrono::Duration::seconds(7200));
    let report = coordinator.run_maintenance().await;
    assert_eq!(report.flags_decayed, 1);
    assert!(coordinator.flagged_requesters().is_empty());
}

fn hoarding_engine() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.hoarding.window_secs = 100;
    config.hoarding.retained_windows = 10;
    config.hoarding.restrict_after_windows = 3;
    config.hoarding.cooldown_secs = 1000;
    config.hoarding.watch_decay_secs = 400;
    config.hoarding.restricted_quota_factor = 0.5;
    config
}

fn at(secs: i64) -> DateTime<chrono::Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

/// One window on a full resource: two short sessions, one long one, and
/// four requesters turned away while it ran.
async fn contended_window(coordinator: &AllocationCoordinator, clock: &ManualClock, start: i64) {
    clock.set(at(start));
    let hog = granted(&request(coordinator, Requester::general("hog")).await);
    let p1 = granted(&request(coordinator, Requester::general("p1")).await);
    let p2 = granted(&request(coordinator, Requester::general("p2")).await);

    for i in 0..4 {
        let entry = queued_entry(&request(coordinator, Requester::general(format!("w{i}"))).await);
        coordinator.withdraw("gpu", &entry).await.unwrap();
    }

    clock.set(at(start + 10));
    coordinator.complete_session(&p1, SessionEnd::Completed).await.unwrap();
    coordinator.complete_session(&p2, SessionEnd::Completed).await.unwrap();

    clock.set(at(start + 90));
    coordinator.complete_session(&hog, SessionEnd::Completed).await.unwrap();
}

#[tokio::test]
async fn test_restricted_requester_is_capped_then_recovers() {
    let clock = Arc::new(ManualClock::at_epoch());
    let coordinator = AllocationCoordinator::builder()
        .config(hoarding_engine())
        .clock(clock.clone())
        .build();
    coordinator
        .configure_resource(ResourceConfig::new("gpu", 3, 6, 0.0))
        .await
        .unwrap();

    contended_window(&coordinator, &clock, 0).await;
    assert_eq!(coordinator.hoarding().flag("hog", coordinator.now()), HoardingFlag::Watched);
    contended_window(&coordinator, &clock, 100).await;
    contended_window(&coordinator, &clock, 200).await;

    clock.set(at(300));
    let now = coordinator.now();
    assert_eq!(coordinator.hoarding().flag("hog", now), HoardingFlag::Restricted);
    assert_eq!(coordinator.hoarding().flag("p1", now), HoardingFlag::Clear);

    // 3 of 6 used, and the restriction halves the limit.
    match request(&coordinator, Requester::general("hog")).await {
        AccessOutcome::Rejected(RejectionReason::RestrictedRequester {
            used,
            effective_limit,
            restricted_until,
        }) => {
            assert_eq!(used, 3);
            assert_eq!(effective_limit, 3);
            assert_eq!(restricted_until, at(290 + 1000));
        }
        other => panic!("expected restriction, got {other:?}"),
    }
    // p1 has the same usage and is unaffected.
    assert!(request(&coordinator, Requester::general("p1")).await.is_admitted());

    // Elsewhere the restriction costs priority: hog queued first but ranks
    // behind p2, whose history is otherwise identical.
    coordinator
        .configure_resource(ResourceConfig::new("lab", 1, 5, 0.0))
        .await
        .unwrap();
    let lab = |requester| AccessRequest::new(requester, "lab");
    assert!(coordinator.request_access(lab(Requester::general("x"))).await.unwrap().is_admitted());
    let hog_entry = queued_entry(&coordinator.request_access(lab(Requester::general("hog"))).await.unwrap());
    let p2_entry = queued_entry(&coordinator.request_access(lab(Requester::general("p2"))).await.unwrap());
    assert_eq!(coordinator.estimate_wait("lab", &p2_entry).await.unwrap().position, 1);
    assert_eq!(coordinator.estimate_wait("lab", &hog_entry).await.unwrap().position, 2);

    // The cooldown lifts the restriction without intervention.
    clock.set(at(1290));
    let report = coordinator.run_maintenance().await;
    assert_eq!(report.flags_decayed, 1);
    assert_eq!(coordinator.hoarding().flag("hog", coordinator.now()), HoardingFlag::Clear);
    assert!(request(&coordinator, Requester::general("hog")).await.is_admitted());
}

// =============================================================================
// Audit
// =============================================================================

#[tokio::test]
async fn test_decisions_are_audited() {
    let (coordinator, _clock) = coordinator_with_clock();
    coordinator
        .configure_resource(ResourceConfig::new("gpu", 1, 1, 0.0))
        .await
        .unwrap();

    let a = granted(&request(&coordinator, Requester::general("a")).await);
    request(&coordinator, Requester::general("a")).await;
    request(&coordinator, Requester::general("b")).await;
    coordinator
        .complete_session(&a, SessionEnd::Completed)
        .await
        .unwrap();

    let stats = coordinator.audit().stats().await;
    assert_eq!(stats.admitted, 1);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.admitted_from_queue, 1);

    let entries = coordinator.audit().by_requester("b", 10).await;
    assert_eq!(entries.len(), 2);
    let json = serde_json::to_string(&entries[0]).unwrap();
    assert!(json.contains("admitted_from_queue"));
}
