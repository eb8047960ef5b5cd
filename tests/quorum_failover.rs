//! Quorum across replica loss and replacement
#![cfg(unix)]

use hafleet::coordination::{InMemoryDiscovery, MemoryEnsemble, ServiceItem, INSTANCE_ATTRIBUTE};
use hafleet::coordinator::{LogicalServiceCoordinator, LogicalService, PhysicalServiceInstance};
use hafleet::process::{CommandSpec, ServiceRegistry, SupervisorOptions};
use hafleet::Error;
use std::sync::Arc;
use std::time::Duration;

async fn start_replica(
    coordinator: &LogicalServiceCoordinator,
    ensemble: &MemoryEnsemble,
    discovery: &InMemoryDiscovery,
    logical: &LogicalService,
) -> PhysicalServiceInstance {
    let instance = coordinator
        .start_instance(
            logical,
            Arc::new(ensemble.connect()),
            &CommandSpec::new("journal", "sleep").arg("60"),
            SupervisorOptions::default(),
            Duration::from_secs(5),
        )
        .unwrap();
    discovery.register(
        ServiceItem::new("journal").with_attribute(INSTANCE_ATTRIBUTE, instance.node_path()),
    );
    instance.await_running(Duration::from_secs(5)).await.unwrap();
    instance
}

#[tokio::test]
async fn test_quorum_lost_and_regained() {
    let ensemble = MemoryEnsemble::new();
    let discovery = InMemoryDiscovery::new();
    let registry = ServiceRegistry::new();
    let coordinator = LogicalServiceCoordinator::new(
        Arc::new(ensemble.connect()),
        Arc::new(discovery.clone()),
        registry.clone(),
        "/hafleet",
        "h1",
    );
    let logical = coordinator.locate_or_create("journal", 3).unwrap();

    // the gate observes membership through the coordinator's session
    let (gate, _watcher) = coordinator.quorum_gate(&logical).unwrap();

    let a = start_replica(&coordinator, &ensemble, &discovery, &logical).await;
    let b = start_replica(&coordinator, &ensemble, &discovery, &logical).await;
    let err = gate
        .await_quorum(Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    let c = start_replica(&coordinator, &ensemble, &discovery, &logical).await;
    let t0 = gate.await_quorum(Duration::from_secs(5)).await.unwrap();

    // lose B
    b.stop(true).await.unwrap();
    b.await_gone(Duration::from_secs(5)).await.unwrap();
    let mut rx = gate.subscribe();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| !s.quorate))
        .await
        .unwrap()
        .unwrap();
    assert!(gate
        .await_quorum(Duration::from_millis(300))
        .await
        .is_err());
    assert_eq!(gate.current_token(), t0);

    // D restores quorum under a new token
    let d = start_replica(&coordinator, &ensemble, &discovery, &logical).await;
    let t1 = gate.await_quorum(Duration::from_secs(5)).await.unwrap();
    assert!(t1 > t0);
    assert_eq!(gate.state().members.len(), 3);

    for replica in [&a, &c, &d] {
        replica.stop(true).await.unwrap();
    }
    assert!(registry.is_empty());
    let (registered, deregistered) = registry.counts();
    assert_eq!(registered, 4);
    assert_eq!(deregistered, 4);
}

#[tokio::test]
async fn test_master_fails_over_to_next_replica() {
    let ensemble = MemoryEnsemble::new();
    let discovery = InMemoryDiscovery::new();
    let coordinator = LogicalServiceCoordinator::new(
        Arc::new(ensemble.connect()),
        Arc::new(discovery.clone()),
        ServiceRegistry::new(),
        "/hafleet",
        "h1",
    );
    let logical = coordinator.locate_or_create("journal", 2).unwrap();

    let first = start_replica(&coordinator, &ensemble, &discovery, &logical).await;
    let second = start_replica(&coordinator, &ensemble, &discovery, &logical).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !first.is_master() {
        assert!(tokio::time::Instant::now() < deadline, "first never became master");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(first.ensure_master().is_ok());
    assert!(matches!(second.ensure_master(), Err(Error::NotMaster(_))));

    // expiring the master's session removes its contender node
    ensemble.expire(first.session().session_id());
    first.await_gone(Duration::from_secs(10)).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !second.is_master() {
        assert!(tokio::time::Instant::now() < deadline, "second never took over");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    second.ensure_master().unwrap();
    assert!(first.ensure_master().is_err());
    second.stop(true).await.unwrap();
}
