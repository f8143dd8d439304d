//! Cluster node lifecycle
//!
//! Wires the coordination components into one startup sequence per node:
//! mesh join, build and start-action validation, metadata exchange, topology,
//! partition map and leader election, then either replay completion
//! (create/recover) or the join/rejoin transfer. Afterwards the node serves
//! its mailbox until shutdown or a fatal error.

use crate::common::{Config, Error, NodeConfig, Result, StartAction};
use crate::coordinator::cartographer::{Cartographer, SiteRecord};
use crate::coordinator::catalog::{
    publish_catalog, read_catalog, CatalogCoordinator, CatalogSnapshot, CatalogUpdate,
};
use crate::coordinator::context::{Capabilities, ClusterContext, FatalReport, ShutdownListener};
use crate::coordinator::leader::{register_candidate, withdraw_candidate, LeaderAppointer};
use crate::coordinator::mailbox::{Envelope, Inbox, Mailbox, MeshTransport, Message};
use crate::coordinator::rejoin::{MembershipPhase, RejoinCoordinator, TrafficGate};
use crate::coordinator::store::{
    create_if_absent, ensure_persistent_dirs, get_json, paths, to_json, CoordinationStore,
    CreateMode,
};
use crate::coordinator::topology::{live_hosts, Topology, TopologyRegistry};
use crate::coordinator::types::{HsId, NodeId, PartitionId, SiteId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const COMPONENT: &str = "cluster-node";

/// Network metadata published under `/cluster_metadata/<node>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub node: NodeId,
    pub hostname: String,
    pub internal_port: u16,
    pub client_port: u16,
    pub admin_port: u16,
    pub build_string: String,
    pub started_at: DateTime<Utc>,
}

impl NodeMetadata {
    fn local(node: NodeId, config: &NodeConfig) -> Self {
        Self {
            node,
            hostname: config.hostname.clone(),
            internal_port: config.internal_port,
            client_port: config.client_port,
            admin_port: config.admin_port,
            build_string: config.build_string.clone(),
            started_at: Utc::now(),
        }
    }

    fn interfaces(&self) -> String {
        format!(
            "[{}] {},{},{}",
            self.hostname, self.client_port, self.admin_port, self.internal_port
        )
    }
}

pub struct ClusterNode {
    ctx: Arc<ClusterContext>,
    node: NodeId,
    transport: Arc<dyn MeshTransport>,
    mailbox: Arc<dyn Mailbox>,
    registry: TopologyRegistry,
    cartographer: Arc<Cartographer>,
    appointer: Arc<LeaderAppointer>,
    coordinator: Arc<RejoinCoordinator>,
    catalog: Arc<CatalogCoordinator>,
    gate: TrafficGate,
    sites: Mutex<BTreeMap<PartitionId, SiteRecord>>,
    peers: BTreeMap<NodeId, NodeMetadata>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterNode")
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

impl ClusterNode {
    /// Run the startup sequence for the configured start action. Returns
    /// once the node accepts traffic.
    pub async fn start(
        config: Config,
        store: Arc<dyn CoordinationStore>,
        transport: Arc<dyn MeshTransport>,
        capabilities: Capabilities,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let ctx = ClusterContext::new(config, store, capabilities);
        tracing::info!(
            action = %ctx.config.node.start_action,
            shape = %ctx.shape(),
            build = %ctx.config.node.build_string,
            "starting cluster node"
        );

        let node = Self::join_mesh(&ctx).await?;
        match Self::boot(ctx.clone(), node, transport.clone()).await {
            Ok(started) => Ok(started),
            Err(e) => {
                ctx.shutdown.trigger();
                transport.disconnect(node);
                if let Err(close) = ctx.store.close() {
                    tracing::warn!(error = %close, "failed to close coordination session");
                }
                Err(ctx.escalate(COMPONENT, e))
            }
        }
    }

    /// Claim the lowest free node id with an ephemeral `/hosts/<id>`.
    async fn join_mesh(ctx: &ClusterContext) -> Result<NodeId> {
        let store = ctx.store.as_ref();
        ctx.retry
            .run("create persistent directories", || ensure_persistent_dirs(store))
            .await?;

        let hostname = ctx.config.node.hostname.clone();
        let node = ctx
            .retry
            .run("claim node id", || {
                let taken: BTreeSet<NodeId> = live_hosts(store)?.into_iter().collect();
                let mut candidate = 0;
                loop {
                    if !taken.contains(&NodeId(candidate))
                        && create_if_absent(
                            store,
                            &paths::child(paths::HOSTS, candidate),
                            hostname.as_bytes(),
                            CreateMode::Ephemeral,
                        )?
                    {
                        return Ok(NodeId(candidate));
                    }
                    candidate += 1;
                }
            })
            .await?;

        if ctx.config.node.start_action.does_rejoin() && live_hosts(store)? == vec![node] {
            if let Err(e) = store.close() {
                tracing::warn!(error = %e, "failed to close coordination session");
            }
            return Err(Error::RejoinToSelf(node.0));
        }
        tracing::info!(node = %node, "joined mesh");
        Ok(node)
    }

    async fn boot(
        ctx: Arc<ClusterContext>,
        node: NodeId,
        transport: Arc<dyn MeshTransport>,
    ) -> Result<Arc<Self>> {
        let store = ctx.store.clone();
        let action = ctx.config.node.start_action;
        let mut shutdown = ctx.shutdown.listener();

        validate_build_string(&ctx)?;
        publish_start_action(store.as_ref(), node, action)?;
        validate_start_actions(store.as_ref(), node)?;
        let validator = spawn_start_action_validator(store.clone(), node, ctx.shutdown.listener())?;

        let registry = TopologyRegistry::new(store.clone(), ctx.retry);
        let shape = ctx.shape();
        let founders = match action {
            StartAction::Create | StartAction::Recover => {
                Some(registry.wait_for_hosts(shape.host_count, &mut shutdown).await?)
            }
            _ => None,
        };

        let (mailbox, inbox) = transport.connect(HsId::coordinator(node))?;
        let metadata = NodeMetadata::local(node, &ctx.config.node);
        store.create(
            &paths::child(paths::CLUSTER_METADATA, node.0),
            &to_json(&metadata)?,
            CreateMode::Ephemeral,
        )?;
        let peers = collect_peer_metadata(&ctx, node).await?;
        log_membership(node, &metadata, &peers);

        let topology: Option<Topology> = match action {
            StartAction::Create | StartAction::Recover => {
                let hosts = founders.unwrap_or_default();
                Some(registry.register(shape, &hosts).await?)
            }
            StartAction::Rejoin | StartAction::LiveRejoin => match registry.read().await {
                Ok(topology) => Some(topology),
                Err(Error::NoNode(_)) => {
                    return Err(Error::InvalidConfig("no running cluster to rejoin".into()))
                }
                Err(e) => return Err(e),
            },
            StartAction::Join => None,
        };

        let cartographer = Cartographer::new(store.clone());
        let map_task = cartographer.start(ctx.shutdown.listener())?;
        let appointer = LeaderAppointer::new(ctx.clone(), cartographer.clone());
        let gate = TrafficGate::closed();
        let coordinator = RejoinCoordinator::new(
            ctx.clone(),
            node,
            cartographer.clone(),
            mailbox.clone(),
            gate.clone(),
        );

        // started after the mailbox connected, so no later update is missed
        let seed = read_catalog(store.as_ref())?.unwrap_or_else(CatalogSnapshot::empty);
        let seeded_txn = seed.version.txn_id;
        if seed.version.version > 0 {
            tracing::info!(
                node = %node,
                version = seed.version.version,
                txn_id = seeded_txn,
                "catalog seeded from store"
            );
        }

        let (catalog_tx, catalog_rx) = mpsc::unbounded_channel();
        let this = Arc::new(Self {
            ctx: ctx.clone(),
            node,
            transport,
            mailbox,
            registry,
            cartographer: cartographer.clone(),
            appointer: appointer.clone(),
            coordinator: coordinator.clone(),
            catalog: Arc::new(CatalogCoordinator::with_snapshot(seed, 1)),
            gate,
            sites: Mutex::new(BTreeMap::new()),
            peers,
            tasks: Mutex::new(vec![map_task]),
        });
        this.spawn_dispatcher(inbox, catalog_tx);
        this.spawn_catalog_applier(catalog_rx, seeded_txn);

        match action {
            StartAction::Create | StartAction::Recover => {
                let topology = topology
                    .ok_or_else(|| Error::Internal("topology missing after registration".into()))?;
                // replica 0 registers its candidacy first so it wins the election
                let mut followers = Vec::new();
                for partition in topology.partitions_on(node) {
                    match topology.initial_leader(partition) {
                        Some(leader) if leader != node => followers.push((partition, leader)),
                        _ => {
                            this.add_site(partition)?;
                        }
                    }
                }
                for (partition, leader) in followers {
                    wait_for_candidate(store.as_ref(), partition, leader, &mut shutdown).await?;
                    this.add_site(partition)?;
                }
                cartographer
                    .wait_for_sites(shape.total_sites() as usize, &mut shutdown)
                    .await?;
                let elector = appointer.start().await?;
                this.tasks.lock().push(elector);

                create_if_absent(store.as_ref(), paths::INIT_COMPLETED, &[], CreateMode::Persistent)?;
                appointer.on_replay_completion().await?;
                coordinator.activate_after_replay()?;
            }
            StartAction::Rejoin | StartAction::LiveRejoin | StartAction::Join => {
                let elector = appointer.start().await?;
                this.tasks.lock().push(elector);
                let sites = if action.is_join() {
                    coordinator.join(&this.registry).await?
                } else {
                    coordinator.rejoin().await?
                };
                for site in sites {
                    this.sites.lock().insert(site.partition, SiteRecord::new(site));
                }
                this.catalog.set_local_replicas(this.sites.lock().len() as u32);
                appointer.on_replay_completion().await?;
            }
        }
        validator.abort();

        tracing::info!(
            node = %node,
            sites = this.sites.lock().len(),
            partitions = cartographer.partition_count(),
            "node ready"
        );
        Ok(this)
    }

    /// Register a local site and its leadership candidacy.
    fn add_site(&self, partition: PartitionId) -> Result<SiteRecord> {
        let record = self.cartographer.register_site(self.node, partition)?;
        let sequence = register_candidate(self.ctx.store.as_ref(), record)?;
        let count = {
            let mut sites = self.sites.lock();
            sites.insert(partition, record);
            sites.len()
        };
        self.catalog.set_local_replicas(count as u32);

        let notice = Message::LeaderCandidacy {
            site: record.site,
            sequence,
        };
        for peer in self.peer_ids() {
            if let Err(e) = self.mailbox.send(HsId::coordinator(peer), notice.clone()) {
                tracing::debug!(peer = %peer, error = %e, "candidacy notice not delivered");
            }
        }
        Ok(record)
    }

    fn remove_site(&self, partition: PartitionId) -> Result<()> {
        let Some(record) = self.sites.lock().remove(&partition) else {
            return Ok(());
        };
        withdraw_candidate(self.ctx.store.as_ref(), record.site)?;
        self.cartographer.retire_site(record.site)?;
        self.catalog.set_local_replicas(self.sites.lock().len() as u32);
        tracing::info!(site = %record.site, "retired site");
        Ok(())
    }

    fn peer_ids(&self) -> Vec<NodeId> {
        match live_hosts(self.ctx.store.as_ref()) {
            Ok(hosts) => hosts.into_iter().filter(|h| *h != self.node).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to list hosts");
                Vec::new()
            }
        }
    }

    fn spawn_dispatcher(
        self: &Arc<Self>,
        mut inbox: Inbox,
        catalog: mpsc::UnboundedSender<CatalogUpdate>,
    ) {
        let this = self.clone();
        let mut shutdown = self.ctx.shutdown.listener();
        let handle = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    next = inbox.recv() => next,
                    _ = shutdown.triggered() => break,
                };
                match next {
                    Some(Ok(envelope)) => this.dispatch(envelope, &catalog),
                    Some(Err(e)) => tracing::warn!(error = %e, "dropping undecodable envelope"),
                    None => break,
                }
            }
            tracing::debug!(node = %this.node, "mailbox dispatcher stopped");
        });
        self.tasks.lock().push(handle);
    }

    fn dispatch(
        self: &Arc<Self>,
        envelope: Envelope,
        catalog: &mpsc::UnboundedSender<CatalogUpdate>,
    ) {
        tracing::debug!(from = %envelope.from, kind = envelope.message.kind(), "mailbox message");
        match envelope.message {
            Message::CatalogUpdate(update) => {
                if catalog.send(update).is_err() {
                    tracing::warn!("catalog applier stopped, dropping update");
                }
            }
            Message::RejoinDataRequest { site, partition } => {
                self.answer_data_request(envelope.from, site, partition);
            }
            Message::RejoinDataAck {
                site,
                source,
                accepted,
            } => self.coordinator.on_data_ack(site, source, accepted),
            Message::SiteFailure { failed } => {
                tracing::info!(failed = %failed, "mesh link lost");
                let this = self.clone();
                self.ctx.workers.spawn(async move {
                    if let Err(e) = this.cartographer.refresh() {
                        tracing::warn!(error = %e, "partition map refresh failed");
                    }
                    if let Err(e) = this.appointer.check_all().await {
                        tracing::warn!(error = %e, "leader check after site failure failed");
                    }
                });
            }
            Message::TopologyAnnounce {
                host_count,
                partition_count,
            } => {
                tracing::info!(host_count, partition_count, "topology announced");
                let this = self.clone();
                self.ctx.workers.spawn(async move {
                    if let Err(e) = this.adopt_topology().await {
                        tracing::warn!(error = %e, "failed to adopt announced topology");
                        this.ctx.escalate(COMPONENT, e);
                    }
                });
            }
            Message::LeaderCandidacy { site, sequence } => {
                tracing::debug!(site = %site, sequence, "peer candidacy");
                let this = self.clone();
                self.ctx.workers.spawn(async move {
                    if let Err(e) = this.appointer.check_partition(site.partition).await {
                        tracing::warn!(error = %e, "leader check failed");
                    }
                });
            }
        }
    }

    /// Stream source side: accept when this node is serving the partition.
    fn answer_data_request(&self, from: HsId, site: SiteId, partition: PartitionId) {
        let local = self.sites.lock().get(&partition).copied();
        let accepted = local.is_some() && self.gate.is_open();
        let source = local.map_or(site, |r| r.site);
        tracing::info!(site = %site, accepted, "rejoin data request");
        let ack = Message::RejoinDataAck {
            site,
            source,
            accepted,
        };
        if let Err(e) = self.mailbox.send(from, ack) {
            tracing::warn!(to = %from, error = %e, "failed to acknowledge data request");
        }
    }

    /// Follow a topology extension: host the partitions now placed here and
    /// hand over the ones moved away.
    async fn adopt_topology(self: &Arc<Self>) -> Result<()> {
        let topology = self.registry.read().await?;
        let wanted: BTreeSet<PartitionId> = topology.partitions_on(self.node).into_iter().collect();
        let held: BTreeSet<PartitionId> = self.sites.lock().keys().copied().collect();

        for partition in wanted.difference(&held) {
            let record = self.add_site(*partition)?;
            tracing::info!(site = %record.site, "adopted partition from topology extension");
        }
        for partition in held.difference(&wanted).copied() {
            let successor = topology.joins.iter().find_map(|join| {
                join.moved
                    .iter()
                    .any(|m| m.partition == partition && m.donor == self.node)
                    .then_some(join.node)
            });
            match successor {
                Some(successor) => self.hand_over(partition, successor),
                None => self.remove_site(partition)?,
            }
        }
        self.cartographer.refresh()?;
        Ok(())
    }

    /// Keep serving a donated partition until the joiner's replica is a
    /// leadership candidate, then retire the local site.
    fn hand_over(self: &Arc<Self>, partition: PartitionId, successor: NodeId) {
        let this = self.clone();
        self.ctx.workers.spawn(async move {
            let mut shutdown = this.ctx.shutdown.listener();
            let result = async {
                wait_for_candidate(this.ctx.store.as_ref(), partition, successor, &mut shutdown).await?;
                this.remove_site(partition)
            }
            .await;
            match result {
                Ok(()) => tracing::info!(partition = %partition, to = %successor, "handed over partition"),
                Err(Error::Cancelled(_)) => {}
                Err(e) => tracing::warn!(partition = %partition, error = %e, "partition handover failed"),
            }
        });
    }

    /// Apply broadcast updates in arrival order. Updates at or below
    /// `covered_txn` are already part of the catalog read from the store.
    fn spawn_catalog_applier(
        self: &Arc<Self>,
        mut updates: mpsc::UnboundedReceiver<CatalogUpdate>,
        mut covered_txn: u64,
    ) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                if update.expected_version > this.catalog.current().version.version {
                    match this.catch_up_catalog(update.expected_version).await {
                        Ok(txn_id) => covered_txn = covered_txn.max(txn_id),
                        Err(e) => {
                            this.ctx.escalate("catalog", e);
                            return;
                        }
                    }
                }
                if update.txn_id <= covered_txn {
                    tracing::debug!(txn_id = update.txn_id, "catalog update already in stored catalog");
                    continue;
                }
                if let Err(e) = this.dispense_catalog(&update).await {
                    this.ctx.escalate("catalog", e);
                    return;
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Compute the update once, store it, then hand the snapshot to every
    /// local replica counted when it was computed.
    async fn dispense_catalog(&self, update: &CatalogUpdate) -> Result<()> {
        let snapshot = self.catalog.apply_update(update)?;
        let store = self.ctx.store.as_ref();
        if let Err(e) = self
            .ctx
            .retry
            .run("publish catalog", || publish_catalog(store, &snapshot))
            .await
        {
            tracing::warn!(txn_id = update.txn_id, error = %e, "failed to store catalog");
        }
        let remaining = self.catalog.outstanding(update.txn_id);
        for _ in 0..remaining {
            self.catalog.apply_update(update)?;
        }
        tracing::debug!(
            txn_id = update.txn_id,
            version = snapshot.version.version,
            replicas = remaining + 1,
            "catalog dispensed"
        );
        Ok(())
    }

    /// Install the stored catalog once it reaches `version`. Gives up after
    /// the metadata retry budget and leaves the version check to fail.
    /// Returns the txn id of the catalog now in place.
    async fn catch_up_catalog(&self, version: u32) -> Result<u64> {
        let coordination = &self.ctx.config.coordination;
        for _ in 0..coordination.metadata_retry_limit.max(1) {
            if let Some(stored) = read_catalog(self.ctx.store.as_ref())? {
                if stored.version.version >= version {
                    self.catalog.install(stored);
                    break;
                }
            }
            tokio::time::sleep(coordination.metadata_retry_interval()).await;
        }
        let current = self.catalog.current();
        if current.version.version < version {
            tracing::warn!(
                have = current.version.version,
                want = version,
                "stored catalog did not catch up"
            );
        }
        Ok(current.version.txn_id)
    }

    /// Send a catalog update to every live node, this one included.
    pub fn broadcast_catalog_update(&self, update: CatalogUpdate) -> Result<usize> {
        let mut delivered = 0;
        for host in live_hosts(self.ctx.store.as_ref())? {
            match self
                .mailbox
                .send(HsId::coordinator(host), Message::CatalogUpdate(update.clone()))
            {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(host = %host, error = %e, "catalog update not delivered"),
            }
        }
        Ok(delivered)
    }

    /// Serve until shutdown; a fatal report stops the node and is returned.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown = self.ctx.shutdown.listener();
        tokio::select! {
            report = self.ctx.fatal.wait() => {
                tracing::error!(component = report.component, reason = %report.reason, "stopping after fatal error");
                self.shutdown();
                Err(Error::Internal(format!("{}: {}", report.component, report.reason)))
            }
            _ = shutdown.triggered() => Ok(()),
        }
    }

    /// Leave the mesh: stop tasks, drop the mailbox endpoint and end the
    /// coordination session so ephemeral registrations vanish.
    pub fn shutdown(&self) {
        if self.ctx.shutdown.is_triggered() {
            return;
        }
        tracing::info!(node = %self.node, "shutting down");
        self.ctx.shutdown.trigger();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.transport.disconnect(self.node);
        if let Err(e) = self.ctx.store.close() {
            tracing::warn!(error = %e, "failed to close coordination session");
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.ctx
    }

    pub fn cartographer(&self) -> &Arc<Cartographer> {
        &self.cartographer
    }

    pub fn appointer(&self) -> &Arc<LeaderAppointer> {
        &self.appointer
    }

    pub fn catalog(&self) -> &Arc<CatalogCoordinator> {
        &self.catalog
    }

    pub fn gate(&self) -> &TrafficGate {
        &self.gate
    }

    pub fn phase(&self) -> MembershipPhase {
        self.coordinator.phase()
    }

    pub fn sites(&self) -> Vec<SiteId> {
        self.sites.lock().values().map(|r| r.site).collect()
    }

    pub fn peers(&self) -> &BTreeMap<NodeId, NodeMetadata> {
        &self.peers
    }

    pub fn fatal_report(&self) -> Option<FatalReport> {
        self.ctx.fatal.report()
    }
}

/// Race to record the build string; every node must match the winner.
fn validate_build_string(ctx: &ClusterContext) -> Result<()> {
    let local = &ctx.config.node.build_string;
    let store = ctx.store.as_ref();
    create_if_absent(store, paths::BUILDSTRING, local.as_bytes(), CreateMode::Persistent)?;
    let (bytes, _) = store.get(paths::BUILDSTRING)?;
    let cluster = String::from_utf8_lossy(&bytes).into_owned();
    if &cluster != local {
        return Err(Error::BuildMismatch {
            local: local.clone(),
            cluster,
        });
    }
    Ok(())
}

fn publish_start_action(store: &dyn CoordinationStore, node: NodeId, action: StartAction) -> Result<()> {
    let path = paths::child(paths::START_ACTION, node.0);
    let data = to_json(&action)?;
    if !create_if_absent(store, &path, &data, CreateMode::Persistent)? {
        store.set(&path, &data, None)?;
    }
    Ok(())
}

/// While the cluster is being created, join and rejoin actions are invalid:
/// an error for this node, a warning for peers.
fn validate_start_actions(store: &dyn CoordinationStore, local: NodeId) -> Result<()> {
    if store.exists(paths::INIT_COMPLETED)?.is_some() {
        return Ok(());
    }
    for name in store.children(paths::START_ACTION)? {
        let Ok(id) = name.parse::<u32>() else {
            continue;
        };
        let action = match get_json::<StartAction>(store, &paths::child(paths::START_ACTION, &name)) {
            Ok((action, _)) => action,
            Err(Error::NoNode(_)) => continue,
            Err(e) => return Err(e),
        };
        if !action.requires_running_cluster() {
            continue;
        }
        if NodeId(id) == local {
            return Err(Error::StartActionRejected {
                node: id,
                action: action.to_string(),
            });
        }
        tracing::warn!(node = id, action = %action, "peer uses a join/rejoin start action during cluster creation");
    }
    Ok(())
}

/// Re-validate on every `/start_action` change until startup finishes.
fn spawn_start_action_validator(
    store: Arc<dyn CoordinationStore>,
    local: NodeId,
    mut shutdown: ShutdownListener,
) -> Result<JoinHandle<()>> {
    let mut watch = store.watch(paths::START_ACTION)?;
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                event = watch.changed() => {
                    if event.is_none() {
                        break;
                    }
                    watch.drain();
                }
                _ = shutdown.triggered() => break,
            }
            if let Err(e) = validate_start_actions(store.as_ref(), local) {
                tracing::warn!(error = %e, "start action validation failed");
            }
        }
    }))
}

/// Read every live peer's metadata, polling until all are published or the
/// retry budget is spent.
async fn collect_peer_metadata(
    ctx: &ClusterContext,
    local: NodeId,
) -> Result<BTreeMap<NodeId, NodeMetadata>> {
    let store = ctx.store.as_ref();
    let mut missing: BTreeSet<NodeId> = live_hosts(store)?.into_iter().filter(|h| *h != local).collect();
    let mut collected = BTreeMap::new();
    let mut attempts = 0;
    while !missing.is_empty() {
        for host in missing.clone() {
            match get_json::<NodeMetadata>(store, &paths::child(paths::CLUSTER_METADATA, host.0)) {
                Ok((metadata, _)) => {
                    collected.insert(host, metadata);
                    missing.remove(&host);
                }
                Err(Error::NoNode(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if missing.is_empty() {
            break;
        }
        attempts += 1;
        if attempts >= ctx.config.coordination.metadata_retry_limit {
            return Err(Error::Timeout(format!("cluster metadata missing for {:?}", missing)));
        }
        tokio::time::sleep(ctx.config.coordination.metadata_retry_interval()).await;
        // hosts that left meanwhile are no longer expected
        let live: BTreeSet<NodeId> = live_hosts(store)?.into_iter().collect();
        missing.retain(|h| live.contains(h));
    }
    Ok(collected)
}

/// Block until `node` holds a leadership candidacy for `partition`.
async fn wait_for_candidate(
    store: &dyn CoordinationStore,
    partition: PartitionId,
    node: NodeId,
    shutdown: &mut ShutdownListener,
) -> Result<()> {
    let dir = paths::child(paths::LEADER_ELECTION, partition.0);
    let mut watch = store.watch(&dir)?;
    loop {
        let names = match store.children(&dir) {
            Ok(names) => names,
            Err(Error::NoNode(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        for name in names {
            match get_json::<SiteRecord>(store, &paths::child(&dir, &name)) {
                Ok((record, _)) if record.site.node == node => return Ok(()),
                Ok(_) | Err(Error::NoNode(_)) => {}
                Err(e) => return Err(e),
            }
        }
        tokio::select! {
            event = watch.changed() => {
                if event.is_none() {
                    return Err(Error::Store(format!("watch on {} closed", dir)));
                }
                watch.drain();
            }
            _ = shutdown.triggered() => {
                return Err(Error::Cancelled(format!("handover of partition {}", partition)));
            }
        }
    }
}

fn log_membership(local: NodeId, metadata: &NodeMetadata, peers: &BTreeMap<NodeId, NodeMetadata>) {
    tracing::info!(node = %local, interfaces = %metadata.interfaces(), "host [SELF]");
    for (id, peer) in peers {
        tracing::info!(node = %id, interfaces = %peer.interfaces(), "host [PEER]");
    }
}
