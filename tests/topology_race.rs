//! Topology publication under concurrent startup

use meshkeeper::coordinator::store::{paths, CoordinationStore, CreateMode, RetryPolicy};
use meshkeeper::coordinator::topology::{derive_initial_topology, Topology, TopologyRegistry};
use meshkeeper::coordinator::{ClusterShape, MemStore, NodeId, PartitionId};
use std::sync::Arc;

#[tokio::test]
async fn test_concurrent_registration_publishes_once() {
    let store = MemStore::new();
    let shape = ClusterShape::new(3, 2, 1);
    let hosts = vec![NodeId(0), NodeId(1), NodeId(2)];

    let mut handles = Vec::new();
    for i in 0..3 {
        let registry = TopologyRegistry::new(Arc::new(store.session()), RetryPolicy::default());
        // every node lists the live hosts in its own order
        let mut live = hosts.clone();
        live.rotate_left(i);
        handles.push(tokio::spawn(async move { registry.register(shape, &live).await }));
    }

    let mut published = Vec::new();
    for handle in handles {
        published.push(handle.await.unwrap().unwrap().to_bytes().unwrap());
    }
    assert!(published.windows(2).all(|pair| pair[0] == pair[1]));

    let (bytes, stat) = store.session().get(paths::TOPOLOGY).unwrap();
    assert_eq!(bytes, published[0]);
    // created once, never overwritten
    assert_eq!(stat.version, 0);

    let topology = Topology::from_bytes(&bytes).unwrap();
    assert_eq!(topology.partition_count(), 3);
    assert_eq!(topology.initial_leader(PartitionId(1)), Some(NodeId(2)));
    for node in &hosts {
        assert_eq!(topology.partitions_on(*node).len(), 2);
    }
}

#[tokio::test]
async fn test_late_node_with_other_shape_is_rejected() {
    let store = MemStore::new();
    let hosts = [NodeId(0), NodeId(1)];
    let first = TopologyRegistry::new(Arc::new(store.session()), RetryPolicy::default());
    first.register(ClusterShape::new(2, 4, 1), &hosts).await.unwrap();

    let second = TopologyRegistry::new(Arc::new(store.session()), RetryPolicy::default());
    let err = second
        .register(ClusterShape::new(2, 2, 1), &hosts)
        .await
        .unwrap_err();
    assert!(err.is_config());
}

#[tokio::test]
async fn test_invalid_shape_writes_nothing() {
    let store = MemStore::new();
    let registry = TopologyRegistry::new(Arc::new(store.session()), RetryPolicy::default());
    let err = registry
        .register(ClusterShape::new(3, 1, 1), &[NodeId(0), NodeId(1), NodeId(2)])
        .await
        .unwrap_err();
    assert!(err.is_config());
    assert!(store.session().exists(paths::TOPOLOGY).unwrap().is_none());
}

#[tokio::test]
async fn test_reader_sees_published_bytes() {
    let store = MemStore::new();
    let shape = ClusterShape::new(2, 3, 1);
    let topology = derive_initial_topology(shape, &[NodeId(4), NodeId(7)]).unwrap();
    store
        .session()
        .create(paths::TOPOLOGY, &topology.to_bytes().unwrap(), CreateMode::Persistent)
        .unwrap();

    let registry = TopologyRegistry::new(Arc::new(store.session()), RetryPolicy::default());
    assert_eq!(registry.read().await.unwrap(), topology);
    // a creator that finds the cluster already formed adopts it
    let adopted = registry.register(shape, &[NodeId(7), NodeId(4)]).await.unwrap();
    assert_eq!(adopted, topology);
}
