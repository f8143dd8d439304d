//! Leader appointer
//!
//! Per-partition leader election over ephemeral sequential candidacies under
//! `/leader_election/<partition>/`. The lowest live sequence wins; the result
//! is written to `/leaders/<partition>` with compare-and-set and only ever
//! moves to a higher sequence, so late or repeated deletions are harmless.
//!
//! A partition whose candidacies all disappear has lost every replica. That
//! is fatal once replay completed; before that the loss is recorded and
//! re-checked by [`LeaderAppointer::on_replay_completion`].

use crate::common::{Error, Result};
use crate::coordinator::cartographer::{Cartographer, LeaderRecord, SiteRecord};
use crate::coordinator::context::ClusterContext;
use crate::coordinator::store::{
    create_if_absent, get_json, paths, sequence_of, to_json, CoordinationStore, CreateMode,
};
use crate::coordinator::types::{PartitionId, SiteId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const COMPONENT: &str = "leader-appointer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeaderState {
    #[default]
    Unassigned,
    /// Chosen locally, not yet durable
    LeaderElected(LeaderRecord),
    /// Written to `/leaders/<partition>`
    Steady(LeaderRecord),
}

impl LeaderState {
    pub fn record(&self) -> Option<&LeaderRecord> {
        match self {
            LeaderState::Unassigned => None,
            LeaderState::LeaderElected(r) | LeaderState::Steady(r) => Some(r),
        }
    }
}

/// Register `record` as leadership candidate; returns its sequence number.
pub fn register_candidate(store: &dyn CoordinationStore, record: SiteRecord) -> Result<u64> {
    let dir = paths::child(paths::LEADER_ELECTION, record.site.partition.0);
    create_if_absent(store, &dir, &[], CreateMode::Persistent)?;
    let path = store.create(
        &paths::child(&dir, "c_"),
        &to_json(&record)?,
        CreateMode::EphemeralSequential,
    )?;
    let sequence =
        sequence_of(&path).ok_or_else(|| Error::Corrupted(format!("bad candidacy path {}", path)))?;
    tracing::debug!(site = %record.site, sequence, "registered leadership candidacy");
    Ok(sequence)
}

/// Remove every candidacy of `site`.
pub fn withdraw_candidate(store: &dyn CoordinationStore, site: SiteId) -> Result<()> {
    let dir = paths::child(paths::LEADER_ELECTION, site.partition.0);
    let children = match store.children(&dir) {
        Ok(children) => children,
        Err(Error::NoNode(_)) => return Ok(()),
        Err(e) => return Err(e),
    };
    for name in children {
        let path = paths::child(&dir, &name);
        match get_json::<SiteRecord>(store, &path) {
            Ok((record, _)) if record.site == site => match store.delete(&path, None) {
                Ok(()) | Err(Error::NoNode(_)) => {}
                Err(e) => return Err(e),
            },
            Ok(_) | Err(Error::NoNode(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub struct LeaderAppointer {
    ctx: Arc<ClusterContext>,
    cartographer: Arc<Cartographer>,
    states: Mutex<BTreeMap<PartitionId, LeaderState>>,
    replay_complete: AtomicBool,
    /// Partitions found without replicas before replay completed
    suppressed: Mutex<BTreeSet<PartitionId>>,
    /// Partitions waiting out the loss grace period
    grace_pending: Mutex<BTreeSet<PartitionId>>,
}

impl LeaderAppointer {
    pub fn new(ctx: Arc<ClusterContext>, cartographer: Arc<Cartographer>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            cartographer,
            states: Mutex::new(BTreeMap::new()),
            replay_complete: AtomicBool::new(false),
            suppressed: Mutex::new(BTreeSet::new()),
            grace_pending: Mutex::new(BTreeSet::new()),
        })
    }

    /// Check every partition once, then follow candidacy changes until
    /// shutdown or a fatal error.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mut watch = self.ctx.store.watch(paths::LEADER_ELECTION)?;
        self.check_all().await?;

        let this = self.clone();
        let mut shutdown = self.ctx.shutdown.listener();
        Ok(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = watch.changed() => event,
                    _ = shutdown.triggered() => break,
                };
                let Some(event) = event else {
                    tracing::warn!("candidacy watch closed");
                    break;
                };
                let result = match (watch.drain(), partition_of(&event.path)) {
                    (0, Some(partition)) => this.check_partition(partition).await,
                    _ => this.check_all().await,
                };
                match result {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => break,
                    Err(e) => tracing::warn!(error = %e, "leader check failed"),
                }
            }
        }))
    }

    /// Re-evaluate every partition that ever had a candidate.
    pub async fn check_all(self: &Arc<Self>) -> Result<()> {
        let names = match self.ctx.store.children(paths::LEADER_ELECTION) {
            Ok(names) => names,
            Err(Error::NoNode(_)) => return Ok(()),
            Err(e) => return Err(self.ctx.escalate(COMPONENT, e)),
        };
        for partition in names.iter().filter_map(|n| n.parse().ok()).map(PartitionId) {
            self.check_partition(partition).await?;
        }
        Ok(())
    }

    /// Elect the lowest live candidate, or handle total replica loss.
    pub async fn check_partition(self: &Arc<Self>, partition: PartitionId) -> Result<()> {
        let result = match self.candidates(partition) {
            // never populated
            Ok(None) => Ok(()),
            Ok(Some(candidates)) => match candidates.first() {
                Some(&(sequence, record)) => {
                    self.suppressed.lock().remove(&partition);
                    self.appoint(partition, sequence, record).await.map(|_| ())
                }
                None => self.on_no_replicas(partition).await,
            },
            Err(e) => Err(e),
        };
        result.map_err(|e| self.ctx.escalate(COMPONENT, e))
    }

    fn candidates(&self, partition: PartitionId) -> Result<Option<Vec<(u64, SiteRecord)>>> {
        let store = self.ctx.store.as_ref();
        let dir = paths::child(paths::LEADER_ELECTION, partition.0);
        let names = match store.children(&dir) {
            Ok(names) => names,
            Err(Error::NoNode(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut candidates = Vec::with_capacity(names.len());
        for name in names {
            let Some(sequence) = sequence_of(&name) else {
                continue;
            };
            match get_json::<SiteRecord>(store, &paths::child(&dir, &name)) {
                Ok((record, _)) => candidates.push((sequence, record)),
                Err(Error::NoNode(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        candidates.sort_by_key(|(sequence, _)| *sequence);
        Ok(Some(candidates))
    }

    async fn appoint(&self, partition: PartitionId, sequence: u64, record: SiteRecord) -> Result<SiteId> {
        let elected = LeaderRecord {
            site: record.site,
            hsid: record.hsid,
            sequence,
        };
        {
            let mut states = self.states.lock();
            let state = states.entry(partition).or_default();
            match *state {
                LeaderState::Steady(current) if current.sequence >= sequence => {
                    return Ok(current.site);
                }
                LeaderState::LeaderElected(current) if current.sequence > sequence => {
                    return Ok(current.site);
                }
                _ => {}
            }
            if !matches!(*state, LeaderState::LeaderElected(c) if c == elected) {
                tracing::info!(partition = %partition, site = %record.site, sequence, "leader elected");
            }
            *state = LeaderState::LeaderElected(elected);
        }

        let durable = self
            .ctx
            .retry
            .run("publish leader", || self.publish(partition, elected))
            .await?;

        let mut states = self.states.lock();
        let state = states.entry(partition).or_default();
        let newer = state.record().is_some_and(|r| r.sequence > durable.sequence);
        if !newer {
            *state = LeaderState::Steady(durable);
        }
        Ok(durable.site)
    }

    /// Compare-and-set `/leaders/<partition>`, never lowering the sequence.
    /// Returns the durable record.
    fn publish(&self, partition: PartitionId, elected: LeaderRecord) -> Result<LeaderRecord> {
        let store = self.ctx.store.as_ref();
        let path = paths::child(paths::LEADERS, partition.0);
        let data = to_json(&elected)?;
        loop {
            match get_json::<LeaderRecord>(store, &path) {
                Ok((current, _)) if current.sequence >= elected.sequence => return Ok(current),
                Ok((_, stat)) => match store.set(&path, &data, Some(stat.version)) {
                    Ok(_) => return Ok(elected),
                    Err(Error::BadVersion { .. }) => continue,
                    Err(e) => return Err(e),
                },
                Err(Error::NoNode(_)) => match store.create(&path, &data, CreateMode::Persistent) {
                    Ok(_) => return Ok(elected),
                    Err(Error::NodeExists(_)) => continue,
                    Err(e) => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn on_no_replicas(self: &Arc<Self>, partition: PartitionId) -> Result<()> {
        {
            let mut suppressed = self.suppressed.lock();
            if !self.replay_complete.load(Ordering::SeqCst) {
                if suppressed.insert(partition) {
                    tracing::warn!(
                        partition = %partition,
                        "all replicas lost before replay completed, deferring check"
                    );
                }
                self.states.lock().insert(partition, LeaderState::Unassigned);
                return Ok(());
            }
        }

        self.states.lock().insert(partition, LeaderState::Unassigned);
        let grace = self.ctx.config.coordination.partition_loss_grace();
        if grace.is_zero() {
            return Err(Error::PartitionLost(partition.0));
        }
        self.defer_loss_check(partition, grace);
        Ok(())
    }

    /// Re-check a partition without replicas once `grace` has passed, on
    /// the worker pool so other partitions keep being served meanwhile.
    fn defer_loss_check(self: &Arc<Self>, partition: PartitionId, grace: Duration) {
        if !self.grace_pending.lock().insert(partition) {
            return;
        }
        tracing::warn!(
            partition = %partition,
            grace_ms = grace.as_millis() as u64,
            "all replicas gone, re-checking after grace period"
        );
        let this = self.clone();
        let mut shutdown = self.ctx.shutdown.listener();
        self.ctx.workers.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(grace) => {}
                _ = shutdown.triggered() => return,
            }
            this.grace_pending.lock().remove(&partition);
            let survivor = this
                .candidates(partition)
                .map(|c| c.and_then(|c| c.first().copied()));
            let result = match survivor {
                Ok(Some((sequence, record))) => {
                    tracing::info!(partition = %partition, "replica reappeared within grace period");
                    this.appoint(partition, sequence, record).await.map(|_| ())
                }
                Ok(None) => Err(Error::PartitionLost(partition.0)),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::error!(partition = %partition, error = %e, "partition check after grace period failed");
                this.ctx.escalate(COMPONENT, e);
            }
        });
    }

    /// Arm partition-loss checks and re-check losses recorded so far.
    /// Only the first call has an effect.
    pub async fn on_replay_completion(self: &Arc<Self>) -> Result<()> {
        let pending = {
            let mut suppressed = self.suppressed.lock();
            if self.replay_complete.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            std::mem::take(&mut *suppressed)
        };
        tracing::info!(deferred = pending.len(), "replay complete, partition loss checks armed");
        for partition in pending {
            self.check_partition(partition).await?;
        }
        Ok(())
    }

    pub fn is_replay_complete(&self) -> bool {
        self.replay_complete.load(Ordering::SeqCst)
    }

    pub fn state_of(&self, partition: PartitionId) -> LeaderState {
        self.states.lock().get(&partition).copied().unwrap_or_default()
    }

    pub fn leader_of(&self, partition: PartitionId) -> Option<SiteId> {
        self.state_of(partition).record().map(|r| r.site)
    }

    pub fn cartographer(&self) -> &Arc<Cartographer> {
        &self.cartographer
    }
}

/// Partition named by a path under `/leader_election`.
fn partition_of(path: &str) -> Option<PartitionId> {
    let rest = path.strip_prefix(paths::LEADER_ELECTION)?.strip_prefix('/')?;
    let name = rest.split('/').next()?;
    name.parse().ok().map(PartitionId)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Config;
    use crate::coordinator::context::Capabilities;
    use crate::coordinator::memstore::MemStore;
    use crate::coordinator::store::ensure_persistent_dirs;
    use crate::coordinator::types::NodeId;

    fn appointer(store: &MemStore) -> Arc<LeaderAppointer> {
        appointer_with(store, Config::default())
    }

    fn appointer_with(store: &MemStore, config: Config) -> Arc<LeaderAppointer> {
        let session: Arc<dyn CoordinationStore> = Arc::new(store.session());
        ensure_persistent_dirs(session.as_ref()).unwrap();
        let ctx = ClusterContext::new(config, session.clone(), Capabilities::none());
        LeaderAppointer::new(ctx, Cartographer::new(session))
    }

    fn with_grace(ms: u64) -> Config {
        let mut config = Config::default();
        config.coordination.partition_loss_grace_ms = ms;
        config
    }

    fn candidate(store: &MemStore, node: u32, partition: u32) -> (crate::coordinator::memstore::StoreSession, u64) {
        let session = store.session();
        let site = SiteId::new(NodeId(node), PartitionId(partition), 0);
        let sequence = register_candidate(&session, SiteRecord::new(site)).unwrap();
        (session, sequence)
    }

    #[test]
    fn test_partition_of() {
        assert_eq!(partition_of("/leader_election/3/c_0000000001"), Some(PartitionId(3)));
        assert_eq!(partition_of("/leader_election/12"), Some(PartitionId(12)));
        assert_eq!(partition_of("/leader_election"), None);
    }

    #[tokio::test]
    async fn test_lowest_sequence_wins_and_fails_over() {
        let store = MemStore::new();
        let appointer = appointer(&store);
        let (first, s1) = candidate(&store, 2, 0);
        let (_second, s2) = candidate(&store, 0, 0);
        assert!(s1 < s2);

        appointer.check_partition(PartitionId(0)).await.unwrap();
        assert_eq!(appointer.leader_of(PartitionId(0)).unwrap().node, NodeId(2));
        assert!(matches!(appointer.state_of(PartitionId(0)), LeaderState::Steady(_)));

        first.close().unwrap();
        appointer.check_partition(PartitionId(0)).await.unwrap();
        assert_eq!(appointer.leader_of(PartitionId(0)).unwrap().node, NodeId(0));

        // a late re-check does not move leadership backwards
        appointer.check_partition(PartitionId(0)).await.unwrap();
        let state = appointer.state_of(PartitionId(0));
        assert_eq!(state.record().unwrap().sequence, s2);
    }

    #[tokio::test]
    async fn test_leaders_node_only_moves_forward() {
        let store = MemStore::new();
        let a = appointer(&store);
        let b = appointer(&store);
        let (first, _) = candidate(&store, 1, 0);
        let (_second, s2) = candidate(&store, 2, 0);

        a.check_partition(PartitionId(0)).await.unwrap();
        first.close().unwrap();
        a.check_partition(PartitionId(0)).await.unwrap();
        // b never saw the first leader and agrees on the survivor
        b.check_partition(PartitionId(0)).await.unwrap();

        let observer = store.session();
        let (leader, _) =
            get_json::<LeaderRecord>(&observer, &paths::child(paths::LEADERS, 0)).unwrap();
        assert_eq!(leader.sequence, s2);
        assert_eq!(b.leader_of(PartitionId(0)), a.leader_of(PartitionId(0)));
    }

    #[tokio::test]
    async fn test_loss_suppressed_until_replay_completion() {
        let store = MemStore::new();
        let appointer = appointer(&store);
        let (only, _) = candidate(&store, 1, 4);
        appointer.check_partition(PartitionId(4)).await.unwrap();

        only.close().unwrap();
        appointer.check_partition(PartitionId(4)).await.unwrap();
        assert_eq!(appointer.state_of(PartitionId(4)), LeaderState::Unassigned);
        assert!(!appointer.ctx.fatal.is_raised());

        let err = appointer.on_replay_completion().await.unwrap_err();
        assert!(matches!(err, Error::PartitionLost(4)));
        assert!(appointer.ctx.fatal.is_raised());
        // lifted exactly once
        appointer.on_replay_completion().await.unwrap();
    }

    #[tokio::test]
    async fn test_unpopulated_partition_is_not_lost() {
        let store = MemStore::new();
        let appointer = appointer(&store);
        appointer.on_replay_completion().await.unwrap();
        appointer.check_partition(PartitionId(9)).await.unwrap();
        appointer.check_all().await.unwrap();
        assert!(!appointer.ctx.fatal.is_raised());
    }

    #[tokio::test]
    async fn test_grace_period_does_not_block_other_partitions() {
        let store = MemStore::new();
        let appointer = appointer_with(&store, with_grace(300));
        appointer.on_replay_completion().await.unwrap();
        let (only, _) = candidate(&store, 1, 4);
        let (_other, _) = candidate(&store, 2, 5);
        appointer.check_all().await.unwrap();

        only.close().unwrap();
        let started = std::time::Instant::now();
        appointer.check_partition(PartitionId(4)).await.unwrap();
        appointer.check_partition(PartitionId(5)).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(appointer.state_of(PartitionId(4)), LeaderState::Unassigned);
        assert_eq!(appointer.leader_of(PartitionId(5)).unwrap().node, NodeId(2));
        assert!(!appointer.ctx.fatal.is_raised());

        tokio::time::sleep(Duration::from_millis(700)).await;
        let report = appointer.ctx.fatal.report().unwrap();
        assert_eq!(report.reason, Error::PartitionLost(4).to_string());
    }

    #[tokio::test]
    async fn test_replica_back_within_grace_is_appointed() {
        let store = MemStore::new();
        let appointer = appointer_with(&store, with_grace(300));
        appointer.on_replay_completion().await.unwrap();
        let (only, _) = candidate(&store, 1, 4);
        appointer.check_partition(PartitionId(4)).await.unwrap();

        only.close().unwrap();
        appointer.check_partition(PartitionId(4)).await.unwrap();
        // a second loss notice does not schedule another re-check
        appointer.check_partition(PartitionId(4)).await.unwrap();
        let (_back, sequence) = candidate(&store, 0, 4);

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(!appointer.ctx.fatal.is_raised());
        let leader = appointer.state_of(PartitionId(4));
        assert_eq!(leader.record().unwrap().site.node, NodeId(0));
        assert_eq!(leader.record().unwrap().sequence, sequence);
    }
}
