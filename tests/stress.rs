//! Stress test: repeated node churn on a running cluster

#![cfg(feature = "heavy-tests")]

use meshkeeper::common::{Config, StartAction};
use meshkeeper::coordinator::{LocalCluster, NodeId, PartitionId};
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::test]
async fn stress_kill_and_rejoin_rounds() {
    let mut config = Config::default();
    config.cluster.host_count = 4;
    config.cluster.sites_per_host = 4;
    config.cluster.k_factor = 1;
    let mut cluster = LocalCluster::new(config, Duration::from_millis(2)).unwrap();
    cluster.boot().await.unwrap();
    cluster.wait_for_leaders(NodeId(0), TIMEOUT).await.unwrap();

    let rounds = 12;
    let start = Instant::now();
    for round in 0..rounds {
        let victim = NodeId(1 + round % 3);
        cluster.kill(victim).unwrap();
        cluster.wait_for_leaders(NodeId(0), TIMEOUT).await.unwrap();

        let replacement = cluster.start_node(StartAction::Rejoin).await.unwrap();
        assert_eq!(replacement.node_id(), victim);
        assert_eq!(replacement.sites().len(), 4);

        let snapshot = cluster.wait_for_leaders(NodeId(0), TIMEOUT).await.unwrap();
        for p in 0..snapshot.partition_count {
            assert_eq!(snapshot.replica_count(PartitionId(p)), 2);
        }
    }
    let elapsed = start.elapsed();

    println!("{} kill/rejoin rounds: {:?}", rounds, elapsed);
    for node in cluster.nodes() {
        assert!(node.fatal_report().is_none());
    }
    assert!(elapsed.as_secs_f64() < 120.0, "Churn too slow");
    cluster.shutdown();
}
