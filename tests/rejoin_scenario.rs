//! A failed node is replaced by a rejoining one

use meshkeeper::common::{Config, Error, StartAction};
use meshkeeper::coordinator::store::{paths, CoordinationStore};
use meshkeeper::coordinator::{LocalCluster, MembershipPhase, NodeId, PartitionId, TransferKind};
use std::collections::BTreeSet;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

fn shape_3_2_1() -> Config {
    let mut config = Config::default();
    config.cluster.host_count = 3;
    config.cluster.sites_per_host = 2;
    config.cluster.k_factor = 1;
    config
}

#[tokio::test]
async fn test_rejoin_takes_exactly_the_short_partitions() {
    let mut cluster = LocalCluster::new(shape_3_2_1(), Duration::from_millis(5)).unwrap();
    cluster.boot().await.unwrap();
    let before = cluster.wait_for_leaders(NodeId(0), TIMEOUT).await.unwrap();

    // node 1 held P0 and P2
    cluster.kill(NodeId(1)).unwrap();
    let observer = cluster.node(NodeId(0)).unwrap().clone();
    let mut shutdown = observer.context().shutdown.listener();
    tokio::time::timeout(
        TIMEOUT,
        observer
            .cartographer()
            .wait_until(&mut shutdown, |s| s.total_sites() == 4),
    )
    .await
    .unwrap()
    .unwrap();

    let replacement = tokio::time::timeout(TIMEOUT, cluster.start_node(StartAction::Rejoin))
        .await
        .unwrap()
        .unwrap();
    // the lowest free id is the dead node's
    assert_eq!(replacement.node_id(), NodeId(1));
    assert_eq!(replacement.phase(), MembershipPhase::Active);
    assert!(replacement.gate().is_open());

    let partitions: BTreeSet<PartitionId> = replacement.sites().iter().map(|s| s.partition).collect();
    assert_eq!(partitions, BTreeSet::from([PartitionId(0), PartitionId(2)]));
    for site in replacement.sites() {
        // fresh generation, never the dead node's
        assert!(site.generation >= 2);
        assert!(replacement.gate().admits(site.partition));
    }

    let requests = cluster.transfer().requests();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert_eq!(request.kind, TransferKind::Replicate);
        let source = request.source.unwrap();
        assert_ne!(source.node, NodeId(1));
        assert_eq!(source.partition, request.site.partition);
    }

    let after = cluster.wait_for_leaders(NodeId(0), TIMEOUT).await.unwrap();
    for p in 0..3 {
        assert_eq!(after.replica_count(PartitionId(p)), 2);
    }
    // the survivor of P0 keeps leading; the rejoined replica only stands by
    assert_eq!(
        after.leaders[&PartitionId(0)].site,
        before.leaders[&PartitionId(0)].site
    );

    // the truncation request was answered and the fan-in drained
    let store = cluster.store().session();
    let (completed, _) = store.get(paths::TRUNCATION_SNAPSHOT_COMPLETED).unwrap();
    assert!(!completed.is_empty());
    let (remaining, _) = store.get("/rejoin_countdown/1").unwrap();
    assert_eq!(remaining, b"0");
    cluster.shutdown();
}

#[tokio::test]
async fn test_rejoin_into_healthy_cluster_is_rejected() {
    let mut cluster = LocalCluster::new(shape_3_2_1(), Duration::ZERO).unwrap();
    cluster.boot().await.unwrap();
    cluster.wait_for_leaders(NodeId(0), TIMEOUT).await.unwrap();

    let err = cluster.start_node(StartAction::Rejoin).await.unwrap_err();
    assert!(matches!(err, Error::NoCapacity { k_factor: 1 }));
    assert!(err.is_config());

    // the rejected node left no trace
    let hosts = cluster.store().session().children(paths::HOSTS).unwrap();
    assert_eq!(hosts.len(), 3);
    for node in cluster.nodes() {
        assert!(node.fatal_report().is_none());
    }
    cluster.shutdown();
}

#[tokio::test]
async fn test_rejoin_without_cluster_is_rejoin_to_self() {
    let mut cluster = LocalCluster::new(shape_3_2_1(), Duration::ZERO).unwrap();
    let err = cluster.start_node(StartAction::LiveRejoin).await.unwrap_err();
    assert!(matches!(err, Error::RejoinToSelf(0)));
    assert!(cluster
        .store()
        .session()
        .children(paths::HOSTS)
        .unwrap()
        .is_empty());
}
