//! Cartographer: live partition map
//!
//! Keeps partition → {leader, live replicas} current from the site
//! registrations under `/replicas`, the appointments under `/leaders` and the
//! published `/topology`. Readers get an immutable snapshot; every refresh
//! builds a new one and swaps a single pointer.

use crate::common::{Error, Result};
use crate::coordinator::context::ShutdownListener;
use crate::coordinator::store::{
    create_if_absent, get_json, paths, to_json, CoordinationStore, CreateMode,
};
use crate::coordinator::topology::Topology;
use crate::coordinator::types::{HsId, NodeId, PartitionId, SiteId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Data of a site registration (`/replicas/<partition>/<node>_<gen>`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteRecord {
    pub site: SiteId,
    pub hsid: HsId,
}

impl SiteRecord {
    pub fn new(site: SiteId) -> Self {
        Self {
            site,
            hsid: site.hsid(),
        }
    }
}

/// Data of `/leaders/<partition>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRecord {
    pub site: SiteId,
    pub hsid: HsId,
    /// Candidacy sequence that won; never decreases
    pub sequence: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CartographerSnapshot {
    pub epoch: u64,
    pub partition_count: u32,
    /// Live replicas, sorted by site id
    pub replicas: BTreeMap<PartitionId, Vec<SiteRecord>>,
    pub leaders: BTreeMap<PartitionId, LeaderRecord>,
}

impl CartographerSnapshot {
    pub fn replica_count(&self, partition: PartitionId) -> usize {
        self.replicas.get(&partition).map_or(0, Vec::len)
    }

    pub fn total_sites(&self) -> usize {
        self.replicas.values().map(Vec::len).sum()
    }

    pub fn is_live(&self, site: SiteId) -> bool {
        self.replicas
            .get(&site.partition)
            .is_some_and(|sites| sites.iter().any(|r| r.site == site))
    }
}

pub struct Cartographer {
    store: Arc<dyn CoordinationStore>,
    snapshot: RwLock<Arc<CartographerSnapshot>>,
    epoch: watch::Sender<u64>,
    refresh_lock: Mutex<()>,
}

impl Cartographer {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Arc<Self> {
        let (epoch, _rx) = watch::channel(0);
        Arc::new(Self {
            store,
            snapshot: RwLock::new(Arc::new(CartographerSnapshot::default())),
            epoch,
            refresh_lock: Mutex::new(()),
        })
    }

    /// Initial refresh, then follow the store until shutdown.
    pub fn start(self: &Arc<Self>, mut shutdown: ShutdownListener) -> Result<JoinHandle<()>> {
        let mut replicas = self.store.watch(paths::REPLICAS)?;
        let mut leaders = self.store.watch(paths::LEADERS)?;
        let mut topology = self.store.watch(paths::TOPOLOGY)?;
        self.refresh()?;

        let this = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                let open = tokio::select! {
                    event = replicas.changed() => event.is_some(),
                    event = leaders.changed() => event.is_some(),
                    event = topology.changed() => event.is_some(),
                    _ = shutdown.triggered() => break,
                };
                if !open {
                    tracing::warn!("cartographer watch closed");
                    break;
                }
                replicas.drain();
                leaders.drain();
                topology.drain();
                match this.refresh() {
                    Ok(snapshot) => tracing::debug!(epoch = snapshot.epoch, "partition map refreshed"),
                    Err(e) if e.is_fatal() => {
                        tracing::error!(error = %e, "cartographer lost the coordination session");
                        break;
                    }
                    Err(e) => tracing::warn!(error = %e, "partition map refresh failed"),
                }
            }
        }))
    }

    /// Rebuild the snapshot from the store and swap it in.
    pub fn refresh(&self) -> Result<Arc<CartographerSnapshot>> {
        let _serial = self.refresh_lock.lock();
        let store = self.store.as_ref();

        let partition_count = match get_json::<Topology>(store, paths::TOPOLOGY) {
            Ok((topology, _)) => topology.partition_count(),
            Err(Error::NoNode(_)) => 0,
            Err(e) => return Err(e),
        };

        let mut replicas: BTreeMap<PartitionId, Vec<SiteRecord>> = (0..partition_count)
            .map(|p| (PartitionId(p), Vec::new()))
            .collect();
        for name in children_or_empty(store, paths::REPLICAS)? {
            let Ok(partition) = name.parse::<u32>() else {
                continue;
            };
            let dir = paths::child(paths::REPLICAS, &name);
            let mut sites = Vec::new();
            for child in children_or_empty(store, &dir)? {
                match get_json::<SiteRecord>(store, &paths::child(&dir, &child)) {
                    Ok((record, _)) => sites.push(record),
                    // vanished between listing and reading
                    Err(Error::NoNode(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
            sites.sort_by_key(|r| r.site);
            replicas.insert(PartitionId(partition), sites);
        }

        let mut leaders = BTreeMap::new();
        for name in children_or_empty(store, paths::LEADERS)? {
            let Ok(partition) = name.parse::<u32>() else {
                continue;
            };
            match get_json::<LeaderRecord>(store, &paths::child(paths::LEADERS, &name)) {
                Ok((record, _)) => {
                    leaders.insert(PartitionId(partition), record);
                }
                Err(Error::NoNode(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        let mut current = self.snapshot.write();
        let next = Arc::new(CartographerSnapshot {
            epoch: current.epoch + 1,
            partition_count,
            replicas,
            leaders,
        });
        *current = next.clone();
        drop(current);
        self.epoch.send_replace(next.epoch);
        Ok(next)
    }

    pub fn current(&self) -> Arc<CartographerSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    pub fn partition_count(&self) -> u32 {
        self.current().partition_count
    }

    /// Appointed leader, if it is still live.
    pub fn leader_of(&self, partition: PartitionId) -> Option<SiteId> {
        let snapshot = self.current();
        let leader = snapshot.leaders.get(&partition)?;
        snapshot.is_live(leader.site).then_some(leader.site)
    }

    pub fn leader_record(&self, partition: PartitionId) -> Option<LeaderRecord> {
        self.current().leaders.get(&partition).copied()
    }

    pub fn replicas_of(&self, partition: PartitionId) -> Vec<SiteId> {
        self.current()
            .replicas
            .get(&partition)
            .map(|sites| sites.iter().map(|r| r.site).collect())
            .unwrap_or_default()
    }

    /// Partitions with fewer than `k + 1` live replicas, fewest replicas
    /// first, at most `sites_per_host` of them.
    pub fn partitions_needing_replica(&self, k_factor: u32, sites_per_host: u32) -> Vec<PartitionId> {
        let snapshot = self.current();
        let wanted = (k_factor + 1) as usize;
        let mut short: Vec<(usize, PartitionId)> = (0..snapshot.partition_count)
            .map(PartitionId)
            .map(|p| (snapshot.replica_count(p), p))
            .filter(|(count, _)| *count < wanted)
            .collect();
        short.sort();
        short
            .into_iter()
            .take(sites_per_host as usize)
            .map(|(_, p)| p)
            .collect()
    }

    pub fn sites_on(&self, node: NodeId) -> Vec<SiteId> {
        self.current()
            .replicas
            .values()
            .flatten()
            .filter(|r| r.site.node == node)
            .map(|r| r.site)
            .collect()
    }

    pub fn live_nodes(&self) -> BTreeSet<NodeId> {
        self.current()
            .replicas
            .values()
            .flatten()
            .map(|r| r.site.node)
            .collect()
    }

    pub fn hsid_of(&self, site: SiteId) -> Option<HsId> {
        self.current()
            .replicas
            .get(&site.partition)?
            .iter()
            .find(|r| r.site == site)
            .map(|r| r.hsid)
    }

    /// Generation the next replica of `partition` will get.
    pub fn next_generation(&self, partition: PartitionId) -> Result<u32> {
        let dir = paths::child(paths::REPLICAS, partition.0);
        match self.store.get(&dir) {
            Ok((bytes, _)) => parse_generation(&dir, &bytes),
            Err(Error::NoNode(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Allocate a generation and publish an ephemeral site registration.
    pub fn register_site(&self, node: NodeId, partition: PartitionId) -> Result<SiteRecord> {
        let dir = paths::child(paths::REPLICAS, partition.0);
        create_if_absent(self.store.as_ref(), &dir, b"0", CreateMode::Persistent)?;
        let generation = loop {
            let (bytes, stat) = self.store.get(&dir)?;
            let generation = parse_generation(&dir, &bytes)?;
            let next = (generation + 1).to_string();
            match self.store.set(&dir, next.as_bytes(), Some(stat.version)) {
                Ok(_) => break generation,
                Err(Error::BadVersion { .. }) => continue,
                Err(e) => return Err(e),
            }
        };

        let record = SiteRecord::new(SiteId::new(node, partition, generation));
        self.store.create(
            &paths::child(&dir, record.site.registry_name()),
            &to_json(&record)?,
            CreateMode::Ephemeral,
        )?;
        tracing::debug!(site = %record.site, "registered site");
        Ok(record)
    }

    /// Withdraw a site registration. Already gone is fine.
    pub fn retire_site(&self, site: SiteId) -> Result<()> {
        let path = paths::child(
            &paths::child(paths::REPLICAS, site.partition.0),
            site.registry_name(),
        );
        match self.store.delete(&path, None) {
            Ok(()) | Err(Error::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Wait until `ready` holds for a snapshot.
    pub async fn wait_until<F>(
        &self,
        shutdown: &mut ShutdownListener,
        ready: F,
    ) -> Result<Arc<CartographerSnapshot>>
    where
        F: Fn(&CartographerSnapshot) -> bool,
    {
        let mut epochs = self.subscribe();
        loop {
            let snapshot = self.current();
            if ready(&snapshot) {
                return Ok(snapshot);
            }
            tokio::select! {
                changed = epochs.changed() => {
                    if changed.is_err() {
                        return Err(Error::Internal("cartographer dropped".into()));
                    }
                }
                _ = shutdown.triggered() => {
                    return Err(Error::Cancelled("waiting for partition map".into()));
                }
            }
        }
    }

    /// Tolerate partial bootstrap views: wait until `expected` sites are live.
    pub async fn wait_for_sites(
        &self,
        expected: usize,
        shutdown: &mut ShutdownListener,
    ) -> Result<Arc<CartographerSnapshot>> {
        self.wait_until(shutdown, |s| s.total_sites() >= expected).await
    }
}

fn children_or_empty(store: &dyn CoordinationStore, path: &str) -> Result<Vec<String>> {
    match store.children(path) {
        Ok(children) => Ok(children),
        Err(Error::NoNode(_)) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

fn parse_generation(path: &str, bytes: &[u8]) -> Result<u32> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.is_empty() {
        return Ok(0);
    }
    text.parse()
        .map_err(|_| Error::Corrupted(format!("{}: bad generation counter {:?}", path, text)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::context::Shutdown;
    use crate::coordinator::memstore::MemStore;
    use crate::coordinator::store::ensure_persistent_dirs;
    use crate::coordinator::topology::derive_initial_topology;
    use crate::coordinator::types::ClusterShape;

    fn publish(store: &dyn CoordinationStore, shape: ClusterShape) {
        let hosts: Vec<NodeId> = (0..shape.host_count).map(NodeId).collect();
        let topology = derive_initial_topology(shape, &hosts).unwrap();
        store
            .create(paths::TOPOLOGY, &topology.to_bytes().unwrap(), CreateMode::Persistent)
            .unwrap();
    }

    #[test]
    fn test_partitions_needing_replica() {
        let store = MemStore::new();
        let session = Arc::new(store.session());
        ensure_persistent_dirs(session.as_ref()).unwrap();
        publish(session.as_ref(), ClusterShape::new(3, 2, 1));

        let cartographer = Cartographer::new(session.clone());
        // P0 on nodes 0,1; P1 on node 2 only; P2 on node 1 only
        for (node, partition) in [(0, 0), (1, 0), (2, 1), (1, 2)] {
            cartographer.register_site(NodeId(node), PartitionId(partition)).unwrap();
        }
        cartographer.refresh().unwrap();

        assert_eq!(cartographer.partition_count(), 3);
        assert_eq!(
            cartographer.partitions_needing_replica(1, 2),
            vec![PartitionId(1), PartitionId(2)]
        );
        assert_eq!(cartographer.partitions_needing_replica(1, 1), vec![PartitionId(1)]);
        assert!(cartographer.partitions_needing_replica(0, 2).is_empty());
        assert_eq!(
            cartographer.live_nodes(),
            [NodeId(0), NodeId(1), NodeId(2)].into_iter().collect()
        );
        assert_eq!(cartographer.sites_on(NodeId(1)).len(), 2);
    }

    #[test]
    fn test_generation_grows_per_partition() {
        let store = MemStore::new();
        let session = Arc::new(store.session());
        ensure_persistent_dirs(session.as_ref()).unwrap();
        let cartographer = Cartographer::new(session.clone());

        let first = cartographer.register_site(NodeId(1), PartitionId(0)).unwrap();
        cartographer.retire_site(first.site).unwrap();
        let second = cartographer.register_site(NodeId(1), PartitionId(0)).unwrap();
        assert_eq!(first.site.generation, 0);
        assert_eq!(second.site.generation, 1);
        assert_eq!(cartographer.next_generation(PartitionId(0)).unwrap(), 2);
        assert_eq!(cartographer.next_generation(PartitionId(7)).unwrap(), 0);

        cartographer.refresh().unwrap();
        assert_eq!(cartographer.replicas_of(PartitionId(0)), vec![second.site]);
        assert_eq!(cartographer.hsid_of(second.site), Some(second.site.hsid()));
    }

    #[tokio::test]
    async fn test_watch_tracks_site_loss() {
        let store = MemStore::new();
        let observer = Arc::new(store.session());
        ensure_persistent_dirs(observer.as_ref()).unwrap();
        publish(observer.as_ref(), ClusterShape::new(2, 1, 1));

        let peer = Arc::new(store.session());
        let peer_map = Cartographer::new(peer.clone());
        peer_map.register_site(NodeId(1), PartitionId(0)).unwrap();

        let cartographer = Cartographer::new(observer.clone());
        let shutdown = Shutdown::new();
        let handle = cartographer.start(shutdown.listener()).unwrap();
        cartographer.register_site(NodeId(0), PartitionId(0)).unwrap();

        let mut listener = shutdown.listener();
        cartographer.wait_for_sites(2, &mut listener).await.unwrap();

        store.expire_session(peer.session_id());
        let snapshot = cartographer
            .wait_until(&mut listener, |s| s.total_sites() == 1)
            .await
            .unwrap();
        assert_eq!(snapshot.replica_count(PartitionId(0)), 1);
        assert_eq!(cartographer.partitions_needing_replica(1, 1), vec![PartitionId(0)]);

        shutdown.trigger();
        handle.await.unwrap();
    }
}
