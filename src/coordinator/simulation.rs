//! In-process cluster over [`MemStore`] and [`LocalMesh`]
//!
//! Drives whole nodes through create, kill, rejoin and join without any
//! network. Used by the `simulate` command and the integration tests.

use crate::common::{Config, Error, Result, StartAction};
use crate::coordinator::cartographer::CartographerSnapshot;
use crate::coordinator::context::{Capabilities, Shutdown};
use crate::coordinator::loopback::{LoopbackRebalancer, LoopbackTransfer};
use crate::coordinator::mailbox::LocalMesh;
use crate::coordinator::memstore::MemStore;
use crate::coordinator::rejoin::spawn_truncation_responder;
use crate::coordinator::server::ClusterNode;
use crate::coordinator::types::{NodeId, PartitionId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct LocalCluster {
    store: MemStore,
    mesh: LocalMesh,
    config: Config,
    transfer: Arc<LoopbackTransfer>,
    rebalancer: Arc<LoopbackRebalancer>,
    nodes: BTreeMap<NodeId, Arc<ClusterNode>>,
    shutdown: Shutdown,
    responder: JoinHandle<()>,
}

impl LocalCluster {
    /// Must be called inside a tokio runtime.
    pub fn new(config: Config, transfer_delay: Duration) -> Result<Self> {
        config.validate()?;
        let store = MemStore::new();
        let shutdown = Shutdown::new();
        let responder = spawn_truncation_responder(Arc::new(store.session()), shutdown.listener())?;
        Ok(Self {
            store,
            mesh: LocalMesh::new(),
            config,
            transfer: Arc::new(LoopbackTransfer::new(transfer_delay)),
            rebalancer: Arc::new(LoopbackRebalancer::new()),
            nodes: BTreeMap::new(),
            shutdown,
            responder,
        })
    }

    pub fn store(&self) -> &MemStore {
        &self.store
    }

    pub fn transfer(&self) -> &Arc<LoopbackTransfer> {
        &self.transfer
    }

    pub fn rebalancer(&self) -> &Arc<LoopbackRebalancer> {
        &self.rebalancer
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none()
            .with_snapshot_transfer(self.transfer.clone())
            .with_rebalancer(self.rebalancer.clone())
    }

    fn config_for(&self, action: StartAction) -> Config {
        let mut config = self.config.clone();
        config.node.start_action = action;
        config
    }

    /// Start every declared host with the create action, concurrently.
    pub async fn boot(&mut self) -> Result<()> {
        let mut pending = Vec::new();
        for _ in 0..self.config.cluster.host_count {
            let config = self.config_for(StartAction::Create);
            let session = Arc::new(self.store.session());
            let mesh = Arc::new(self.mesh.clone());
            let capabilities = self.capabilities();
            pending.push(tokio::spawn(ClusterNode::start(config, session, mesh, capabilities)));
        }
        let mut failure = None;
        for handle in pending {
            match handle.await {
                Ok(Ok(node)) => {
                    self.nodes.insert(node.node_id(), node);
                }
                Ok(Err(e)) => failure = failure.or(Some(e)),
                Err(e) => failure = failure.or(Some(Error::Internal(format!("node task failed: {}", e)))),
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Start one more node with `action` (rejoin, live rejoin or join).
    pub async fn start_node(&mut self, action: StartAction) -> Result<Arc<ClusterNode>> {
        let node = ClusterNode::start(
            self.config_for(action),
            Arc::new(self.store.session()),
            Arc::new(self.mesh.clone()),
            self.capabilities(),
        )
        .await?;
        self.nodes.insert(node.node_id(), node.clone());
        Ok(node)
    }

    /// Stop a node abruptly: its session and mesh endpoints go away.
    pub fn kill(&mut self, node: NodeId) -> Result<()> {
        let victim = self
            .nodes
            .remove(&node)
            .ok_or_else(|| Error::InvalidConfig(format!("no running node {}", node)))?;
        tracing::info!(node = %node, "killing node");
        victim.shutdown();
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Option<&Arc<ClusterNode>> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<ClusterNode>> {
        self.nodes.values()
    }

    /// Wait until `node`'s partition map shows a live leader for every
    /// partition.
    pub async fn wait_for_leaders(&self, node: NodeId, timeout: Duration) -> Result<Arc<CartographerSnapshot>> {
        let observer = self
            .nodes
            .get(&node)
            .ok_or_else(|| Error::InvalidConfig(format!("no running node {}", node)))?;
        let mut shutdown = observer.context().shutdown.listener();
        let wait = observer.cartographer().wait_until(&mut shutdown, |s| {
            s.partition_count > 0
                && (0..s.partition_count).all(|p| {
                    s.leaders
                        .get(&PartitionId(p))
                        .is_some_and(|leader| s.is_live(leader.site))
                })
        });
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout("waiting for partition leaders".into()))?
    }

    /// Stop every node and the truncation responder.
    pub fn shutdown(&mut self) {
        for node in std::mem::take(&mut self.nodes).into_values() {
            node.shutdown();
        }
        self.shutdown.trigger();
        self.responder.abort();
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_boot_single_host() {
        let mut config = Config::default();
        config.cluster.host_count = 1;
        config.cluster.sites_per_host = 2;
        let mut cluster = LocalCluster::new(config, Duration::ZERO).unwrap();
        cluster.boot().await.unwrap();

        let snapshot = cluster
            .wait_for_leaders(NodeId(0), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(snapshot.partition_count, 2);
        assert_eq!(cluster.nodes().count(), 1);
        cluster.shutdown();
    }
}
