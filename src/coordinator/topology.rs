//! Topology registry
//!
//! Derives the initial partition placement from the declarative cluster
//! shape and publishes it exactly once under `/topology`. Every node races to
//! create the node; losers read back the winner's bytes. Joins extend the
//! published topology with a versioned compare-and-set and never replace it.

use crate::common::{Error, Result};
use crate::coordinator::context::ShutdownListener;
use crate::coordinator::store::{get_json, paths, to_json, CoordinationStore, CreateMode, RetryPolicy};
use crate::coordinator::types::{ClusterShape, NodeId, PartitionId, SiteId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Replica hosts of one partition. Index 0 is the initial leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAssignment {
    pub partition: PartitionId,
    pub replicas: Vec<NodeId>,
}

impl PartitionAssignment {
    pub fn leader(&self) -> Option<NodeId> {
        self.replicas.first().copied()
    }

    pub fn is_on(&self, node: NodeId) -> bool {
        self.replicas.contains(&node)
    }
}

/// A replica handed from a donor host to a joining host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaMove {
    pub partition: PartitionId,
    pub donor: NodeId,
}

/// Applied join plan, kept in the topology history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRecord {
    pub node: NodeId,
    pub added: Vec<PartitionId>,
    pub moved: Vec<ReplicaMove>,
}

/// Published partition placement.
///
/// Serialized as JSON with sorted sequences only, so equal topologies are
/// equal bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub shape: ClusterShape,
    pub hosts: Vec<NodeId>,
    pub partitions: Vec<PartitionAssignment>,
    #[serde(default)]
    pub joins: Vec<JoinRecord>,
}

impl Topology {
    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    pub fn replicas_of(&self, partition: PartitionId) -> Option<&[NodeId]> {
        self.assignment(partition).map(|a| a.replicas.as_slice())
    }

    pub fn initial_leader(&self, partition: PartitionId) -> Option<NodeId> {
        self.assignment(partition).and_then(|a| a.leader())
    }

    fn assignment(&self, partition: PartitionId) -> Option<&PartitionAssignment> {
        self.partitions
            .binary_search_by_key(&partition, |a| a.partition)
            .ok()
            .map(|i| &self.partitions[i])
    }

    pub fn partitions_on(&self, node: NodeId) -> Vec<PartitionId> {
        self.partitions
            .iter()
            .filter(|a| a.is_on(node))
            .map(|a| a.partition)
            .collect()
    }

    /// Initial sites of `node` (generation 0)
    pub fn sites_on(&self, node: NodeId) -> Vec<SiteId> {
        self.partitions_on(node)
            .into_iter()
            .map(|p| SiteId::new(node, p, 0))
            .collect()
    }

    pub fn join_of(&self, node: NodeId) -> Option<&JoinRecord> {
        self.joins.iter().find(|j| j.node == node)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        to_json(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Check placement invariants: k+1 replicas on distinct hosts per
    /// partition, `sites_per_host` sites per host.
    pub fn validate(&self) -> Result<()> {
        let replication = self.shape.replication_factor() as usize;
        if self.hosts.len() != self.shape.host_count as usize {
            return Err(Error::Corrupted(format!(
                "topology lists {} hosts, shape says {}",
                self.hosts.len(),
                self.shape.host_count
            )));
        }
        for (i, assignment) in self.partitions.iter().enumerate() {
            if assignment.partition != PartitionId(i as u32) {
                return Err(Error::Corrupted(format!("partition ids not dense at {}", i)));
            }
            let distinct: BTreeSet<NodeId> = assignment.replicas.iter().copied().collect();
            if assignment.replicas.len() != replication || distinct.len() != replication {
                return Err(Error::Corrupted(format!(
                    "partition {} has replicas {:?}",
                    assignment.partition, assignment.replicas
                )));
            }
            if let Some(stray) = distinct.iter().find(|n| !self.hosts.contains(n)) {
                return Err(Error::Corrupted(format!(
                    "partition {} placed on unknown host {}",
                    assignment.partition, stray
                )));
            }
        }
        for host in &self.hosts {
            let sites = self.partitions.iter().filter(|a| a.is_on(*host)).count();
            if sites != self.shape.sites_per_host as usize {
                return Err(Error::Corrupted(format!(
                    "host {} carries {} sites instead of {}",
                    host, sites, self.shape.sites_per_host
                )));
            }
        }
        Ok(())
    }
}

/// Deterministic round-robin placement.
///
/// Replica `r` of partition `p` goes to sorted host index
/// `(p * (k + 1) + r) mod host_count`.
pub fn derive_initial_topology(shape: ClusterShape, live_nodes: &[NodeId]) -> Result<Topology> {
    let partition_count = shape.partition_count()?;
    let hosts: Vec<NodeId> = live_nodes
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if hosts.len() != shape.host_count as usize {
        return Err(Error::InvalidConfig(format!(
            "expected {} distinct hosts, got {:?}",
            shape.host_count, live_nodes
        )));
    }

    let replication = shape.replication_factor();
    let partitions = (0..partition_count)
        .map(|p| PartitionAssignment {
            partition: PartitionId(p),
            replicas: (0..replication)
                .map(|r| hosts[((p * replication + r) % shape.host_count) as usize])
                .collect(),
        })
        .collect();

    Ok(Topology {
        shape,
        hosts,
        partitions,
        joins: Vec::new(),
    })
}

/// Extend `topology` with host `joiner`.
///
/// Appends `sites_per_host / (k + 1)` partitions. Each new partition gets one
/// replica on the joiner and `k` on existing hosts picked round-robin; every
/// such donor hands its lowest old partition not yet on the joiner over to
/// it. Replica counts and per-host site counts are preserved.
pub fn plan_join(topology: &Topology, joiner: NodeId) -> Result<Topology> {
    if topology.join_of(joiner).is_some() {
        return Ok(topology.clone());
    }
    if topology.hosts.contains(&joiner) {
        return Err(Error::InvalidConfig(format!(
            "node {} is already part of the topology",
            joiner
        )));
    }

    let shape = topology.shape;
    let replication = shape.replication_factor();
    let grown = ClusterShape::new(shape.host_count + 1, shape.sites_per_host, shape.k_factor);
    if grown.total_sites() % replication != 0 {
        return Err(Error::InvalidShape(format!(
            "{} hosts with {} sites each is not divisible by replication factor {}",
            grown.host_count, grown.sites_per_host, replication
        )));
    }
    let old_count = topology.partition_count();
    let added = grown.partition_count()? - old_count;

    let mut next = topology.clone();
    let mut record = JoinRecord {
        node: joiner,
        added: Vec::new(),
        moved: Vec::new(),
    };
    let mut cursor = 0usize;

    for i in 0..added {
        let partition = PartitionId(old_count + i);
        let mut replicas = vec![joiner];
        while replicas.len() < replication as usize {
            let donor = topology.hosts[cursor % topology.hosts.len()];
            cursor += 1;
            if replicas.contains(&donor) {
                continue;
            }
            let handed = next.partitions[..old_count as usize]
                .iter_mut()
                .filter(|a| a.is_on(donor) && !a.is_on(joiner))
                .min_by_key(|a| a.partition)
                .ok_or_else(|| {
                    Error::InvalidShape(format!(
                        "host {} has no replica left to hand over to node {}",
                        donor, joiner
                    ))
                })?;
            handed.replicas.retain(|n| *n != donor);
            handed.replicas.push(joiner);
            record.moved.push(ReplicaMove {
                partition: handed.partition,
                donor,
            });
            replicas.push(donor);
        }
        next.partitions.push(PartitionAssignment { partition, replicas });
        record.added.push(partition);
    }

    next.hosts.push(joiner);
    next.hosts.sort();
    next.shape = grown;
    next.joins.push(record);
    next.validate()?;
    Ok(next)
}

/// Publishes and extends `/topology`.
pub struct TopologyRegistry {
    store: Arc<dyn CoordinationStore>,
    retry: RetryPolicy,
}

impl TopologyRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Derive the initial topology and race to publish it. Returns whatever
    /// ended up published, which is byte-identical on every node.
    pub async fn register(&self, shape: ClusterShape, live_nodes: &[NodeId]) -> Result<Topology> {
        let derived = derive_initial_topology(shape, live_nodes)?;
        let bytes = derived.to_bytes()?;

        let created = self
            .retry
            .run("publish topology", || {
                match self.store.create(paths::TOPOLOGY, &bytes, CreateMode::Persistent) {
                    Ok(_) => Ok(true),
                    Err(Error::NodeExists(_)) => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .await?;

        let published = self.read().await?;
        if created {
            tracing::info!(
                partitions = published.partition_count(),
                hosts = published.hosts.len(),
                "published initial topology"
            );
        } else {
            tracing::debug!("topology already published, using existing");
        }
        if published.shape.k_factor != shape.k_factor
            || published.shape.sites_per_host != shape.sites_per_host
        {
            return Err(Error::InvalidConfig(format!(
                "local shape ({}) does not match published topology ({})",
                shape, published.shape
            )));
        }
        Ok(published)
    }

    pub async fn read(&self) -> Result<Topology> {
        Ok(self.read_versioned().await?.0)
    }

    pub async fn read_versioned(&self) -> Result<(Topology, u32)> {
        let (topology, stat) = self
            .retry
            .run("read topology", || get_json::<Topology>(self.store.as_ref(), paths::TOPOLOGY))
            .await?;
        Ok((topology, stat.version))
    }

    /// Apply the join plan for `joiner`. A lost compare-and-set re-reads and
    /// re-plans; re-running for an already applied join is a no-op.
    pub async fn extend_for_join(&self, joiner: NodeId) -> Result<Topology> {
        loop {
            let (current, version) = self.read_versioned().await?;
            let planned = plan_join(&current, joiner)?;
            if planned == current {
                return Ok(current);
            }
            let bytes = planned.to_bytes()?;
            match self.store.set(paths::TOPOLOGY, &bytes, Some(version)) {
                Ok(_) => {
                    if let Some(record) = planned.join_of(joiner) {
                        tracing::info!(
                            node = %joiner,
                            added = ?record.added,
                            moved = record.moved.len(),
                            "extended topology for joining node"
                        );
                    }
                    return Ok(planned);
                }
                Err(Error::BadVersion { .. }) => {
                    tracing::debug!(node = %joiner, "topology changed concurrently, re-planning join");
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(error = %e, "topology extension failed, retrying");
                    tokio::time::sleep(self.retry.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Block until `count` hosts are registered under `/hosts`.
    pub async fn wait_for_hosts(
        &self,
        count: u32,
        shutdown: &mut ShutdownListener,
    ) -> Result<Vec<NodeId>> {
        let mut watch = self.store.watch(paths::HOSTS)?;
        loop {
            let hosts = live_hosts(self.store.as_ref())?;
            if hosts.len() >= count as usize {
                if hosts.len() > count as usize {
                    return Err(Error::InvalidConfig(format!(
                        "{} hosts joined but the cluster shape declares {}",
                        hosts.len(),
                        count
                    )));
                }
                return Ok(hosts);
            }
            tracing::debug!(present = hosts.len(), expected = count, "waiting for hosts");
            tokio::select! {
                event = watch.changed() => {
                    if event.is_none() {
                        return Err(Error::Store("hosts watch closed".into()));
                    }
                    watch.drain();
                }
                _ = shutdown.triggered() => {
                    return Err(Error::Cancelled("waiting for hosts".into()));
                }
            }
        }
    }
}

/// Node ids registered under `/hosts`, sorted.
pub fn live_hosts(store: &dyn CoordinationStore) -> Result<Vec<NodeId>> {
    let mut hosts: Vec<NodeId> = store
        .children(paths::HOSTS)?
        .iter()
        .filter_map(|name| name.parse().ok().map(NodeId))
        .collect();
    hosts.sort();
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::memstore::MemStore;

    fn nodes(ids: &[u32]) -> Vec<NodeId> {
        ids.iter().copied().map(NodeId).collect()
    }

    #[test]
    fn test_round_robin_placement() {
        let topology = derive_initial_topology(ClusterShape::new(3, 2, 1), &nodes(&[0, 1, 2])).unwrap();
        assert_eq!(topology.partition_count(), 3);
        assert_eq!(topology.replicas_of(PartitionId(0)).unwrap(), &nodes(&[0, 1])[..]);
        assert_eq!(topology.replicas_of(PartitionId(1)).unwrap(), &nodes(&[2, 0])[..]);
        assert_eq!(topology.replicas_of(PartitionId(2)).unwrap(), &nodes(&[1, 2])[..]);
        assert_eq!(topology.initial_leader(PartitionId(1)), Some(NodeId(2)));
        topology.validate().unwrap();
    }

    #[test]
    fn test_placement_ignores_input_order() {
        let shape = ClusterShape::new(4, 6, 2);
        let a = derive_initial_topology(shape, &nodes(&[3, 0, 2, 1])).unwrap();
        let b = derive_initial_topology(shape, &nodes(&[0, 1, 2, 3])).unwrap();
        assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
        a.validate().unwrap();
    }

    #[test]
    fn test_wrong_host_count_rejected() {
        let err = derive_initial_topology(ClusterShape::new(3, 2, 1), &nodes(&[0, 1])).unwrap_err();
        assert!(err.is_config());
        let err = derive_initial_topology(ClusterShape::new(3, 1, 1), &nodes(&[0, 1, 2])).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_plan_join_moves_donor_replicas() {
        let topology = derive_initial_topology(ClusterShape::new(3, 2, 1), &nodes(&[0, 1, 2])).unwrap();
        let joined = plan_join(&topology, NodeId(3)).unwrap();

        assert_eq!(joined.partition_count(), 4);
        assert_eq!(joined.shape.host_count, 4);
        assert_eq!(joined.replicas_of(PartitionId(3)).unwrap(), &nodes(&[3, 0])[..]);
        assert_eq!(joined.replicas_of(PartitionId(0)).unwrap(), &nodes(&[1, 3])[..]);
        assert_eq!(joined.partitions_on(NodeId(3)), vec![PartitionId(0), PartitionId(3)]);

        let record = joined.join_of(NodeId(3)).unwrap();
        assert_eq!(record.added, vec![PartitionId(3)]);
        assert_eq!(
            record.moved,
            vec![ReplicaMove {
                partition: PartitionId(0),
                donor: NodeId(0)
            }]
        );
        // replanning an applied join is a no-op
        assert_eq!(plan_join(&joined, NodeId(3)).unwrap(), joined);
    }

    #[test]
    fn test_plan_join_k0() {
        let topology = derive_initial_topology(ClusterShape::new(2, 2, 0), &nodes(&[0, 1])).unwrap();
        let joined = plan_join(&topology, NodeId(2)).unwrap();
        assert_eq!(joined.partition_count(), 6);
        assert_eq!(joined.partitions_on(NodeId(2)), vec![PartitionId(4), PartitionId(5)]);
        assert!(joined.join_of(NodeId(2)).unwrap().moved.is_empty());
    }

    #[test]
    fn test_plan_join_indivisible() {
        let topology = derive_initial_topology(ClusterShape::new(2, 1, 1), &nodes(&[0, 1])).unwrap();
        let err = plan_join(&topology, NodeId(2)).unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn test_register_race_is_byte_identical() {
        let store = MemStore::new();
        let shape = ClusterShape::new(3, 2, 1);
        let mut handles = Vec::new();
        for _ in 0..3 {
            let session: Arc<dyn CoordinationStore> = Arc::new(store.session());
            handles.push(tokio::spawn(async move {
                let registry = TopologyRegistry::new(session.clone(), RetryPolicy::default());
                registry.register(shape, &nodes(&[2, 1, 0])).await.unwrap();
                session.get(paths::TOPOLOGY).unwrap().0
            }));
        }
        let mut published = Vec::new();
        for handle in handles {
            published.push(handle.await.unwrap());
        }
        assert!(published.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_extend_for_join_keeps_node() {
        let store = MemStore::new();
        let session: Arc<dyn CoordinationStore> = Arc::new(store.session());
        let registry = TopologyRegistry::new(session.clone(), RetryPolicy::default());
        let initial = registry
            .register(ClusterShape::new(3, 2, 1), &nodes(&[0, 1, 2]))
            .await
            .unwrap();

        let extended = registry.extend_for_join(NodeId(3)).await.unwrap();
        let (read_back, version) = registry.read_versioned().await.unwrap();
        assert_eq!(read_back, extended);
        assert_eq!(version, 1);
        for assignment in &initial.partitions {
            assert_eq!(read_back.replicas_of(assignment.partition).unwrap().len(), 2);
        }
        // idempotent
        registry.extend_for_join(NodeId(3)).await.unwrap();
        assert_eq!(registry.read_versioned().await.unwrap().1, 1);
    }
}
