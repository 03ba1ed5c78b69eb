//! Concurrency and atomic-admission integration tests

use std::sync::Arc;

use futures::future::join_all;
use quota_engine::{
    AccessOutcome, AccessRequest, AdmissionHook, AllocationCoordinator, AllocationError, Grant,
    RejectionReason, Requester, ResourceConfig, Result,
};

/// Refuses or panics for specific requesters, admits everyone else.
struct SelectiveHook;

#[async_trait::async_trait]
impl AdmissionHook for SelectiveHook {
    async fn before_capacity_commit(&self, grant: &Grant) -> Result<()> {
        match grant.requester.as_str() {
            "refused" => Err(AllocationError::AdmissionAborted("refused by hook".into())),
            "panicker" => panic!("hook failure"),
            _ => Ok(()),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_never_exceed_quota() {
    let coordinator = Arc::new(AllocationCoordinator::new());
    coordinator
        .configure_resource(ResourceConfig::new("gpu", 100, 3, 0.0))
        .await
        .unwrap();

    let tasks = (0..20).map(|_| {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            coordinator
                .request_access(AccessRequest::new(Requester::general("a"), "gpu"))
                .await
                .unwrap()
        })
    });
    let outcomes: Vec<AccessOutcome> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let admitted = outcomes.iter().filter(|o| o.is_admitted()).count();
    let rejected = outcomes
        .iter()
        .filter(|o| matches!(o, AccessOutcome::Rejected(RejectionReason::QuotaExceeded { .. })))
        .count();
    assert_eq!(admitted, 3);
    assert_eq!(rejected, 17);

    let record = coordinator.quota_record("gpu", "a").await.unwrap().unwrap();
    assert_eq!(record.used, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_never_exceed_capacity() {
    let coordinator = Arc::new(AllocationCoordinator::new());
    coordinator
        .configure_resource(ResourceConfig::new("gpu", 5, 10, 0.4))
        .await
        .unwrap();

    let tasks = (0..30).map(|i| {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            let requester = if i % 3 == 0 {
                Requester::underserved(format!("u{i}"))
            } else {
                Requester::general(format!("g{i}"))
            };
            coordinator
                .request_access(AccessRequest::new(requester, "gpu"))
                .await
                .unwrap()
        })
    });
    let outcomes: Vec<AccessOutcome> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let admitted = outcomes.iter().filter(|o| o.is_admitted()).count();
    let queued = outcomes.iter().filter(|o| o.is_queued()).count();
    assert_eq!(admitted, 5);
    assert_eq!(admitted + queued, 30);

    let snapshot = coordinator.snapshot("gpu").await.unwrap();
    assert!(snapshot.reserved_in_use <= snapshot.reserved_capacity);
    assert!(snapshot.general_in_use <= snapshot.general_capacity);
    assert_eq!(snapshot.reserved_in_use + snapshot.general_in_use, 5);
    assert_eq!(snapshot.queue_depth, 25);
}

#[tokio::test]
async fn test_failed_hook_charges_nothing() {
    let coordinator = AllocationCoordinator::builder()
        .admission_hook(Arc::new(SelectiveHook))
        .build();
    coordinator
        .configure_resource(ResourceConfig::new("gpu", 2, 5, 0.0))
        .await
        .unwrap();

    let err = coordinator
        .request_access(AccessRequest::new(Requester::general("refused"), "gpu"))
        .await
        .unwrap_err();
    assert!(matches!(err, AllocationError::AdmissionAborted(_)));

    let used = coordinator
        .quota_record("gpu", "refused")
        .await
        .unwrap()
        .map(|r| r.used)
        .unwrap_or(0);
    assert_eq!(used, 0);
    assert_eq!(coordinator.snapshot("gpu").await.unwrap().general_in_use, 0);
}

#[tokio::test]
async fn test_panicking_hook_charges_nothing() {
    let coordinator = Arc::new(
        AllocationCoordinator::builder()
            .admission_hook(Arc::new(SelectiveHook))
            .build(),
    );
    coordinator
        .configure_resource(ResourceConfig::new("gpu", 2, 5, 0.0))
        .await
        .unwrap();

    let task = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            coordinator
                .request_access(AccessRequest::new(Requester::general("panicker"), "gpu"))
                .await
        })
    };
    assert!(task.await.unwrap_err().is_panic());

    let used = coordinator
        .quota_record("gpu", "panicker")
        .await
        .unwrap()
        .map(|r| r.used)
        .unwrap_or(0);
    assert_eq!(used, 0);
    assert_eq!(coordinator.snapshot("gpu").await.unwrap().general_in_use, 0);

    // The resource is still usable afterwards.
    let outcome = coordinator
        .request_access(AccessRequest::new(Requester::general("ok"), "gpu"))
        .await
        .unwrap();
    assert!(outcome.is_admitted());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resources_are_independent() {
    let coordinator = Arc::new(AllocationCoordinator::new());
    for resource in ["gpu", "lab", "studio"] {
        coordinator
            .configure_resource(ResourceConfig::new(resource, 2, 5, 0.0))
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for resource in ["gpu", "lab", "studio"] {
        for i in 0..4 {
            let coordinator = Arc::clone(&coordinator);
            tasks.push(tokio::spawn(async move {
                let requester = Requester::general(format!("r{i}"));
                coordinator
                    .request_access(AccessRequest::new(requester, resource))
                    .await
                    .unwrap()
            }));
        }
    }
    let outcomes = join_all(tasks).await;
    assert_eq!(outcomes.len(), 12);

    for snapshot in coordinator.snapshots().await {
        assert_eq!(snapshot.general_in_use, 2);
        assert_eq!(snapshot.queue_depth, 2);
    }
}
