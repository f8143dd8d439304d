//! Join/rejoin coordinator
//!
//! Brings a node's sites up to date before it accepts client traffic:
//!
//! 1. pick the partitions to host (rejoin: those short of `k + 1` live
//!    replicas; join: the topology extension for this node)
//! 2. per site, ask the partition leader for data and drive the external
//!    snapshot transfer (`NotStarted → Streaming → CaughtUp`)
//! 3. fan in through `/rejoin_countdown/<node>`; at zero the traffic gate opens
//! 4. request a truncation snapshot; its completion makes the node `Active`

use crate::common::{backoff_with_jitter, Error, Result};
use crate::coordinator::cartographer::{Cartographer, SiteRecord};
use crate::coordinator::context::{ClusterContext, ShutdownListener};
use crate::coordinator::leader::register_candidate;
use crate::coordinator::mailbox::{Mailbox, Message};
use crate::coordinator::store::{
    create_if_absent, paths, sequence_of, CoordinationStore, CreateMode, StoreCountdown,
};
use crate::coordinator::topology::{JoinRecord, TopologyRegistry};
use crate::coordinator::types::{HsId, NodeId, PartitionId, SiteId};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

const COMPONENT: &str = "rejoin-coordinator";

/// Recovery progress of one site. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RejoinState {
    NotStarted,
    Streaming,
    CaughtUp,
    Active,
}

impl RejoinState {
    pub fn advance(&mut self, next: RejoinState) -> Result<()> {
        if next < *self {
            return Err(Error::InvalidTransition(format!("{:?} -> {:?}", self, next)));
        }
        *self = next;
        Ok(())
    }
}

/// Where a node stands in its membership lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipPhase {
    Initializing,
    /// Sites are being streamed; client traffic refused
    TransferPending,
    /// Traffic accepted, waiting for the truncation snapshot `request`
    AwaitingTruncation { request: u64 },
    Active,
}

impl MembershipPhase {
    fn rank(&self) -> u8 {
        match self {
            MembershipPhase::Initializing => 0,
            MembershipPhase::TransferPending => 1,
            MembershipPhase::AwaitingTruncation { .. } => 2,
            MembershipPhase::Active => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Copy an existing partition from a live replica
    Replicate,
    /// Receive a partition created by a split during join
    Split,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRequest {
    pub site: SiteId,
    pub source: Option<SiteId>,
    pub kind: TransferKind,
}

/// External snapshot streaming collaborator.
pub trait SnapshotTransfer: Send + Sync {
    fn transfer(&self, request: TransferRequest) -> BoxFuture<'static, Result<()>>;
}

/// External data rebalancer used by joins.
pub trait Rebalancer: Send + Sync {
    fn rebalance(&self, join: JoinRecord) -> BoxFuture<'static, Result<()>>;
}

impl std::fmt::Debug for dyn Rebalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Rebalancer")
    }
}

/// Client write admission for the local node.
///
/// Closed until every owned site caught up; a partition whose site is still
/// streaming is refused even after that.
#[derive(Clone)]
pub struct TrafficGate {
    open: Arc<watch::Sender<bool>>,
    sites: Arc<Mutex<BTreeMap<PartitionId, RejoinState>>>,
}

impl TrafficGate {
    pub fn closed() -> Self {
        let (open, _rx) = watch::channel(false);
        Self {
            open: Arc::new(open),
            sites: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn open(&self) {
        if !self.open.send_replace(true) {
            tracing::info!("traffic gate opened");
        }
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    pub fn track(&self, partition: PartitionId, state: RejoinState) {
        self.sites.lock().insert(partition, state);
    }

    pub fn admits(&self, partition: PartitionId) -> bool {
        self.is_open()
            && self
                .sites
                .lock()
                .get(&partition)
                .map_or(true, |state| *state >= RejoinState::CaughtUp)
    }

    pub async fn wait_open(&self, shutdown: &mut ShutdownListener) -> Result<()> {
        let mut rx = self.open.subscribe();
        tokio::select! {
            result = rx.wait_for(|open| *open) => result
                .map(|_| ())
                .map_err(|_| Error::Internal("traffic gate dropped".into())),
            _ = shutdown.triggered() => Err(Error::Cancelled("waiting for traffic gate".into())),
        }
    }
}

pub struct RejoinCoordinator {
    ctx: Arc<ClusterContext>,
    node: NodeId,
    cartographer: Arc<Cartographer>,
    mailbox: Arc<dyn Mailbox>,
    gate: TrafficGate,
    phase: Mutex<MembershipPhase>,
    sites: Mutex<BTreeMap<PartitionId, (SiteId, RejoinState)>>,
    pending_acks: Mutex<HashMap<SiteId, oneshot::Sender<(SiteId, bool)>>>,
}

impl RejoinCoordinator {
    pub fn new(
        ctx: Arc<ClusterContext>,
        node: NodeId,
        cartographer: Arc<Cartographer>,
        mailbox: Arc<dyn Mailbox>,
        gate: TrafficGate,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            node,
            cartographer,
            mailbox,
            gate,
            phase: Mutex::new(MembershipPhase::Initializing),
            sites: Mutex::new(BTreeMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
        })
    }

    pub fn phase(&self) -> MembershipPhase {
        *self.phase.lock()
    }

    pub fn site_states(&self) -> Vec<(SiteId, RejoinState)> {
        self.sites.lock().values().copied().collect()
    }

    fn set_phase(&self, next: MembershipPhase) -> Result<()> {
        let mut phase = self.phase.lock();
        if next.rank() <= phase.rank() {
            return Err(Error::InvalidTransition(format!("{:?} -> {:?}", *phase, next)));
        }
        tracing::debug!(node = %self.node, from = ?*phase, to = ?next, "membership phase");
        *phase = next;
        Ok(())
    }

    fn advance_site(&self, partition: PartitionId, next: RejoinState) -> Result<()> {
        let mut sites = self.sites.lock();
        let (_, state) = sites
            .get_mut(&partition)
            .ok_or_else(|| Error::Internal(format!("no local site for partition {}", partition)))?;
        state.advance(next)?;
        self.gate.track(partition, next);
        Ok(())
    }

    /// Deliver a source's answer to a pending data request.
    pub fn on_data_ack(&self, site: SiteId, source: SiteId, accepted: bool) {
        if let Some(tx) = self.pending_acks.lock().remove(&site) {
            let _ = tx.send((source, accepted));
        } else {
            tracing::debug!(site = %site, "ignoring unexpected rejoin data ack");
        }
    }

    /// Create/recover path: no transfer, the node is active once replay
    /// completed.
    pub fn activate_after_replay(&self) -> Result<()> {
        self.set_phase(MembershipPhase::Active)?;
        self.gate.open();
        Ok(())
    }

    /// REJOIN: replace the replicas the cluster is missing.
    pub async fn rejoin(self: &Arc<Self>) -> Result<Vec<SiteId>> {
        self.set_phase(MembershipPhase::TransferPending)?;
        let transfer = self
            .ctx
            .capabilities
            .snapshot_transfer
            .require("snapshot transfer")?
            .clone();

        let shape = self.ctx.shape();
        self.cartographer.refresh()?;
        let needed = self
            .cartographer
            .partitions_needing_replica(shape.k_factor, shape.sites_per_host);
        if needed.is_empty() {
            return Err(Error::NoCapacity {
                k_factor: shape.k_factor,
            });
        }
        tracing::info!(node = %self.node, partitions = ?needed, "rejoining cluster");

        let plan = needed
            .into_iter()
            .map(|p| (p, TransferKind::Replicate))
            .collect();
        self.transfer_sites(plan, transfer).await
    }

    /// JOIN: extend the topology, rebalance, then stream the new replicas.
    pub async fn join(self: &Arc<Self>, registry: &TopologyRegistry) -> Result<Vec<SiteId>> {
        self.set_phase(MembershipPhase::TransferPending)?;
        let transfer = self
            .ctx
            .capabilities
            .snapshot_transfer
            .require("snapshot transfer")?
            .clone();
        let rebalancer = self.ctx.capabilities.rebalancer.require("elastic join")?.clone();

        let topology = registry.extend_for_join(self.node).await?;
        let record = topology
            .join_of(self.node)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("join plan for node {} missing", self.node)))?;

        for host in topology.hosts.iter().filter(|h| **h != self.node) {
            let announce = Message::TopologyAnnounce {
                host_count: topology.hosts.len() as u32,
                partition_count: topology.partition_count(),
            };
            if let Err(e) = self.mailbox.send(HsId::coordinator(*host), announce) {
                tracing::warn!(host = %host, error = %e, "failed to announce topology");
            }
        }
        self.cartographer.refresh()?;

        rebalancer.rebalance(record.clone()).await?;

        let mut plan: Vec<(PartitionId, TransferKind)> = record
            .moved
            .iter()
            .map(|m| (m.partition, TransferKind::Replicate))
            .collect();
        plan.extend(record.added.iter().map(|p| (*p, TransferKind::Split)));
        self.transfer_sites(plan, transfer).await
    }

    async fn transfer_sites(
        self: &Arc<Self>,
        plan: Vec<(PartitionId, TransferKind)>,
        transfer: Arc<dyn SnapshotTransfer>,
    ) -> Result<Vec<SiteId>> {
        let countdown = Arc::new(StoreCountdown::create(
            self.ctx.store.clone(),
            paths::child(paths::REJOIN_COUNTDOWN, self.node.0),
            plan.len() as u64,
        )?);

        let mut records = Vec::with_capacity(plan.len());
        for (partition, kind) in plan {
            let record = self.cartographer.register_site(self.node, partition)?;
            self.sites
                .lock()
                .insert(partition, (record.site, RejoinState::NotStarted));
            self.gate.track(partition, RejoinState::NotStarted);
            records.push((record, kind));
        }

        let mut handles: Vec<JoinHandle<Option<Result<()>>>> = Vec::new();
        for (record, kind) in records.iter().copied() {
            let this = self.clone();
            let transfer = transfer.clone();
            let countdown = countdown.clone();
            handles.push(self.ctx.workers.spawn(async move {
                this.stream_site(record, kind, transfer.as_ref()).await?;
                countdown.count_down()?;
                Ok::<(), Error>(())
            }));
        }

        let mut shutdown = self.ctx.shutdown.listener();
        for mut handle in handles {
            let outcome = tokio::select! {
                joined = &mut handle => joined,
                _ = shutdown.triggered() => {
                    handle.abort();
                    return Err(Error::Cancelled("site transfer".into()));
                }
            };
            match outcome {
                Ok(Some(Ok(()))) => {}
                Ok(Some(Err(e))) => return Err(self.ctx.escalate(COMPONENT, e)),
                Ok(None) => return Err(Error::Internal("worker pool closed".into())),
                Err(e) => return Err(Error::Internal(format!("site transfer task failed: {}", e))),
            }
        }

        countdown.wait(&mut shutdown).await?;
        tracing::info!(node = %self.node, sites = records.len(), "all sites caught up");
        self.gate.open();

        self.await_truncation().await?;
        Ok(records.iter().map(|(r, _)| r.site).collect())
    }

    async fn stream_site(
        &self,
        record: SiteRecord,
        kind: TransferKind,
        transfer: &dyn SnapshotTransfer,
    ) -> Result<()> {
        let site = record.site;
        self.advance_site(site.partition, RejoinState::Streaming)?;
        let source = match kind {
            TransferKind::Replicate => Some(self.request_data(site).await?),
            TransferKind::Split => None,
        };
        transfer.transfer(TransferRequest { site, source, kind }).await?;
        self.advance_site(site.partition, RejoinState::CaughtUp)?;
        register_candidate(self.ctx.store.as_ref(), record)?;
        tracing::info!(site = %site, source = ?source, "site caught up");
        Ok(())
    }

    /// Find a live source for `site`'s partition willing to stream to it.
    async fn request_data(&self, site: SiteId) -> Result<SiteId> {
        let partition = site.partition;
        let timeout = self.ctx.config.coordination.rejoin_ack_timeout();
        let mut shutdown = self.ctx.shutdown.listener();
        let mut attempt = 0u32;
        loop {
            if shutdown.is_triggered() {
                return Err(Error::Cancelled(format!("data request for {}", site)));
            }
            let node = self.node;
            let source = self.cartographer.leader_of(partition).filter(|s| s.node != node).or_else(|| {
                self.cartographer
                    .replicas_of(partition)
                    .into_iter()
                    .find(|s| s.node != node)
            });
            let Some(source) = source else {
                tracing::debug!(site = %site, "no live source yet");
                self.cartographer
                    .wait_until(&mut shutdown, |s| {
                        s.replicas
                            .get(&partition)
                            .is_some_and(|sites| sites.iter().any(|r| r.site.node != node))
                    })
                    .await?;
                continue;
            };

            let (tx, rx) = oneshot::channel();
            self.pending_acks.lock().insert(site, tx);
            let request = Message::RejoinDataRequest { site, partition };
            match self.mailbox.send(HsId::coordinator(source.node), request) {
                Ok(()) => match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok((source, true))) => return Ok(source),
                    Ok(Ok((source, false))) => {
                        tracing::debug!(site = %site, source = %source, "data request refused")
                    }
                    Ok(Err(_)) | Err(_) => {
                        tracing::warn!(site = %site, source = %source, "no answer to data request")
                    }
                },
                Err(e) => tracing::warn!(site = %site, source = %source, error = %e, "data request failed"),
            }
            self.pending_acks.lock().remove(&site);

            tokio::time::sleep(backoff_with_jitter(self.ctx.retry.backoff, attempt)).await;
            attempt = (attempt + 1).min(6);
            if let Err(e) = self.cartographer.refresh() {
                tracing::warn!(error = %e, "partition map refresh failed");
            }
        }
    }

    fn request_truncation(&self) -> Result<u64> {
        let path = self.ctx.store.create(
            &paths::child(paths::REQUEST_TRUNCATION_SNAPSHOT, "r_"),
            self.node.to_string().as_bytes(),
            CreateMode::PersistentSequential,
        )?;
        sequence_of(&path).ok_or_else(|| Error::Corrupted(format!("bad request path {}", path)))
    }

    /// Request a truncation snapshot and wait for a completion at or past
    /// our request id. Older completions re-issue the request; the original
    /// id is kept for the comparison.
    pub async fn await_truncation(&self) -> Result<()> {
        let store = self.ctx.store.clone();
        let request = self.request_truncation()?;
        self.set_phase(MembershipPhase::AwaitingTruncation { request })?;
        tracing::info!(node = %self.node, request, "requested truncation snapshot");

        let mut watch = store.watch(paths::TRUNCATION_SNAPSHOT_COMPLETED)?;
        let mut shutdown = self.ctx.shutdown.listener();
        let mut stale = None;
        loop {
            match store.get(paths::TRUNCATION_SNAPSHOT_COMPLETED) {
                Ok((bytes, _)) => {
                    let completed = parse_request_id(&bytes)?;
                    if completed >= request {
                        break;
                    }
                    if stale != Some(completed) {
                        tracing::warn!(completed, request, "older truncation snapshot completed, re-issuing request");
                        self.request_truncation()?;
                        stale = Some(completed);
                    }
                }
                Err(Error::NoNode(_)) => {}
                Err(e) => return Err(e),
            }
            tokio::select! {
                event = watch.changed() => {
                    if event.is_none() {
                        return Err(Error::Store("truncation watch closed".into()));
                    }
                    watch.drain();
                }
                _ = shutdown.triggered() => {
                    return Err(Error::Cancelled("waiting for truncation snapshot".into()));
                }
            }
        }

        {
            let mut sites = self.sites.lock();
            for (partition, (_, state)) in sites.iter_mut() {
                state.advance(RejoinState::Active)?;
                self.gate.track(*partition, RejoinState::Active);
            }
        }
        self.set_phase(MembershipPhase::Active)?;
        tracing::info!(node = %self.node, "node active");
        Ok(())
    }
}

fn parse_request_id(bytes: &[u8]) -> Result<u64> {
    let text = String::from_utf8_lossy(bytes);
    text.trim()
        .parse()
        .map_err(|_| Error::Corrupted(format!("bad truncation request id {:?}", text)))
}

/// Answer pending truncation requests the way the snapshot daemon does:
/// record the highest request id as completed and clear the queue.
pub fn complete_truncation_requests(store: &dyn CoordinationStore) -> Result<Option<u64>> {
    let names = store.children(paths::REQUEST_TRUNCATION_SNAPSHOT)?;
    let Some(highest) = names.iter().filter_map(|n| sequence_of(n)).max() else {
        return Ok(None);
    };
    let data = highest.to_string();
    if !create_if_absent(
        store,
        paths::TRUNCATION_SNAPSHOT_COMPLETED,
        data.as_bytes(),
        CreateMode::Persistent,
    )? {
        store.set(paths::TRUNCATION_SNAPSHOT_COMPLETED, data.as_bytes(), None)?;
    }
    for name in names {
        match store.delete(&paths::child(paths::REQUEST_TRUNCATION_SNAPSHOT, &name), None) {
            Ok(()) | Err(Error::NoNode(_)) => {}
            Err(e) => return Err(e),
        }
    }
    tracing::debug!(completed = highest, "truncation snapshot completed");
    Ok(Some(highest))
}

/// Complete truncation requests as they arrive, until shutdown.
pub fn spawn_truncation_responder(
    store: Arc<dyn CoordinationStore>,
    mut shutdown: ShutdownListener,
) -> Result<JoinHandle<()>> {
    let mut watch = store.watch(paths::REQUEST_TRUNCATION_SNAPSHOT)?;
    Ok(tokio::spawn(async move {
        loop {
            if let Err(e) = complete_truncation_requests(store.as_ref()) {
                tracing::warn!(error = %e, "truncation responder failed");
                if e.is_fatal() {
                    break;
                }
            }
            tokio::select! {
                event = watch.changed() => {
                    if event.is_none() {
                        break;
                    }
                    watch.drain();
                }
                _ = shutdown.triggered() => break,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Config;
    use crate::coordinator::context::Capabilities;
    use crate::coordinator::mailbox::LocalMesh;
    use crate::coordinator::memstore::MemStore;
    use crate::coordinator::store::ensure_persistent_dirs;
    use crate::coordinator::topology::derive_initial_topology;
    use crate::coordinator::types::ClusterShape;
    use futures_util::FutureExt;

    struct InstantTransfer;

    impl SnapshotTransfer for InstantTransfer {
        fn transfer(&self, _request: TransferRequest) -> BoxFuture<'static, Result<()>> {
            async { Ok(()) }.boxed()
        }
    }

    /// Completes one transfer per permit added to the semaphore.
    struct HeldTransfer(Arc<tokio::sync::Semaphore>);

    impl SnapshotTransfer for HeldTransfer {
        fn transfer(&self, _request: TransferRequest) -> BoxFuture<'static, Result<()>> {
            let permits = self.0.clone();
            async move {
                permits
                    .acquire()
                    .await
                    .map_err(|_| Error::Cancelled("held transfer".into()))?
                    .forget();
                Ok(())
            }
            .boxed()
        }
    }

    fn coordinator(store: &MemStore, capabilities: Capabilities) -> Arc<RejoinCoordinator> {
        coordinator_on(store, capabilities, &LocalMesh::new())
    }

    fn coordinator_on(
        store: &MemStore,
        capabilities: Capabilities,
        mesh: &LocalMesh,
    ) -> Arc<RejoinCoordinator> {
        let session: Arc<dyn CoordinationStore> = Arc::new(store.session());
        ensure_persistent_dirs(session.as_ref()).unwrap();
        let mut config = Config::default();
        config.cluster.host_count = 3;
        config.cluster.sites_per_host = 2;
        config.cluster.k_factor = 1;
        let ctx = ClusterContext::new(config, session.clone(), capabilities);
        let (mailbox, _inbox) = mesh.register(HsId::coordinator(NodeId(5))).unwrap();
        RejoinCoordinator::new(
            ctx,
            NodeId(5),
            Cartographer::new(session),
            Arc::new(mailbox),
            TrafficGate::closed(),
        )
    }

    #[test]
    fn test_rejoin_state_is_monotonic() {
        let mut state = RejoinState::NotStarted;
        state.advance(RejoinState::Streaming).unwrap();
        state.advance(RejoinState::CaughtUp).unwrap();
        assert!(state.advance(RejoinState::Streaming).is_err());
        assert_eq!(state, RejoinState::CaughtUp);
    }

    #[test]
    fn test_gate_admission() {
        let gate = TrafficGate::closed();
        gate.track(PartitionId(0), RejoinState::CaughtUp);
        gate.track(PartitionId(1), RejoinState::Streaming);
        assert!(!gate.admits(PartitionId(0)));
        gate.open();
        assert!(gate.admits(PartitionId(0)));
        assert!(!gate.admits(PartitionId(1)));
        assert!(gate.admits(PartitionId(7)));
    }

    #[tokio::test]
    async fn test_rejoin_requires_snapshot_transfer() {
        let store = MemStore::new();
        let coordinator = coordinator(&store, Capabilities::none());
        let err = coordinator.rejoin().await.unwrap_err();
        assert!(matches!(err, Error::CapabilityDisabled(_)));
    }

    #[tokio::test]
    async fn test_rejoin_without_missing_replicas_is_rejected() {
        let store = MemStore::new();
        let setup = store.session();
        ensure_persistent_dirs(&setup).unwrap();
        let shape = ClusterShape::new(3, 2, 1);
        let topology = derive_initial_topology(shape, &[NodeId(0), NodeId(1), NodeId(2)]).unwrap();
        setup
            .create(paths::TOPOLOGY, &topology.to_bytes().unwrap(), CreateMode::Persistent)
            .unwrap();
        let map = Cartographer::new(Arc::new(store.session()));
        for assignment in &topology.partitions {
            for node in &assignment.replicas {
                map.register_site(*node, assignment.partition).unwrap();
            }
        }

        let caps = Capabilities::none().with_snapshot_transfer(Arc::new(InstantTransfer));
        let coordinator = coordinator(&store, caps);
        let err = coordinator.rejoin().await.unwrap_err();
        assert!(matches!(err, Error::NoCapacity { k_factor: 1 }));
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn test_gate_opens_only_after_every_site_caught_up() {
        let store = MemStore::new();
        let setup = store.session();
        ensure_persistent_dirs(&setup).unwrap();
        let shape = ClusterShape::new(3, 2, 1);
        let topology = derive_initial_topology(shape, &[NodeId(0), NodeId(1), NodeId(2)]).unwrap();
        setup
            .create(paths::TOPOLOGY, &topology.to_bytes().unwrap(), CreateMode::Persistent)
            .unwrap();
        // node 1 is gone: P0 and P2 are down to one replica
        let map = Cartographer::new(Arc::new(store.session()));
        for assignment in &topology.partitions {
            for node in assignment.replicas.iter().filter(|n| **n != NodeId(1)) {
                map.register_site(*node, assignment.partition).unwrap();
            }
        }

        let permits = Arc::new(tokio::sync::Semaphore::new(0));
        let caps = Capabilities::none().with_snapshot_transfer(Arc::new(HeldTransfer(permits.clone())));
        let mesh = LocalMesh::new();
        let coordinator = coordinator_on(&store, caps, &mesh);

        let mut sources = Vec::new();
        for node in [NodeId(0), NodeId(2)] {
            let (mailbox, mut inbox) = mesh.register(HsId::coordinator(node)).unwrap();
            sources.push(mailbox);
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                while let Some(Ok(envelope)) = inbox.recv().await {
                    if let Message::RejoinDataRequest { site, partition } = envelope.message {
                        coordinator.on_data_ack(site, SiteId::new(node, partition, 0), true);
                    }
                }
            });
        }
        let _daemon = spawn_truncation_responder(Arc::new(store.session()), coordinator.ctx.shutdown.listener()).unwrap();

        let rejoin = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.rejoin().await })
        };

        permits.add_permits(1);
        loop {
            let states = coordinator.site_states();
            if states.iter().any(|(_, s)| *s == RejoinState::CaughtUp) {
                assert_eq!(states.len(), 2);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(!coordinator.gate.is_open());
        assert!(!coordinator.gate.admits(PartitionId(0)));
        assert!(!coordinator.gate.admits(PartitionId(2)));
        assert_eq!(coordinator.phase(), MembershipPhase::TransferPending);

        permits.add_permits(1);
        let mut sites = rejoin.await.unwrap().unwrap();
        sites.sort();
        assert_eq!(
            sites.iter().map(|s| s.partition).collect::<Vec<_>>(),
            vec![PartitionId(0), PartitionId(2)]
        );
        assert!(sites.iter().all(|s| s.node == NodeId(5)));
        assert!(coordinator.gate.admits(PartitionId(0)));
        assert!(coordinator.gate.admits(PartitionId(2)));
        assert_eq!(coordinator.phase(), MembershipPhase::Active);
        assert!(coordinator
            .site_states()
            .iter()
            .all(|(_, s)| *s == RejoinState::Active));
        coordinator.ctx.shutdown.trigger();
    }

    #[tokio::test]
    async fn test_stale_truncation_completion_reissues() {
        let store = MemStore::new();
        let daemon = store.session();
        ensure_persistent_dirs(&daemon).unwrap();
        // an earlier request, already completed
        daemon
            .create("/request_truncation_snapshot/r_", b"", CreateMode::PersistentSequential)
            .unwrap();
        daemon
            .create(paths::TRUNCATION_SNAPSHOT_COMPLETED, b"0", CreateMode::Persistent)
            .unwrap();

        let coordinator = coordinator(&store, Capabilities::none());
        coordinator.set_phase(MembershipPhase::TransferPending).unwrap();
        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.await_truncation().await })
        };

        loop {
            if daemon.children(paths::REQUEST_TRUNCATION_SNAPSHOT).unwrap().len() == 3 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(
            coordinator.phase(),
            MembershipPhase::AwaitingTruncation { request: 1 }
        );

        assert_eq!(complete_truncation_requests(&daemon).unwrap(), Some(2));
        waiter.await.unwrap().unwrap();
        assert_eq!(coordinator.phase(), MembershipPhase::Active);
    }
}
