//! Catalog version coordinator
//!
//! Schema and configuration changes arrive as versioned diffs tied to a
//! transaction id. Every local replica calls [`CatalogCoordinator::apply_update`]
//! for the same update; the first one computes the new snapshot, the others
//! get the cached value, and the cache entry is retired once every local
//! replica consumed it.
//!
//! Every applied snapshot is also kept under `/catalog` so nodes that rejoin
//! or join start from the cluster's current catalog instead of version 0.

use crate::common::{blake3_hash, short_hash, verify_hash, Blake3Hasher, Error, Result};
use crate::coordinator::store::{get_json, paths, to_json, CoordinationStore, CreateMode};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::watch;

/// Catalog key holding the cluster k-factor
pub const KFACTOR_KEY: &str = "cluster/kfactor";
/// Catalog key holding the partition count
pub const PARTITION_COUNT_KEY: &str = "cluster/partition_count";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatalogCommand {
    Set { path: String, value: String },
    Delete { path: String },
}

/// Mailbox payload of a catalog change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogUpdate {
    pub txn_id: u64,
    pub expected_version: u32,
    pub new_version: u32,
    pub diff: Vec<CatalogCommand>,
    pub diff_hash: String,
    pub deployment: String,
    pub deployment_hash: String,
}

impl CatalogUpdate {
    /// Build an update for `expected_version + 1`, hashing its payloads.
    pub fn new(
        txn_id: u64,
        expected_version: u32,
        diff: Vec<CatalogCommand>,
        deployment: impl Into<String>,
    ) -> Result<Self> {
        let deployment = deployment.into();
        let diff_hash = blake3_hash(&to_json(&diff)?);
        let deployment_hash = blake3_hash(deployment.as_bytes());
        Ok(Self {
            txn_id,
            expected_version,
            new_version: expected_version + 1,
            diff,
            diff_hash,
            deployment,
            deployment_hash,
        })
    }

    fn verify(&self) -> Result<()> {
        verify_hash(&to_json(&self.diff)?, &self.diff_hash)?;
        verify_hash(self.deployment.as_bytes(), &self.deployment_hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogVersion {
    pub version: u32,
    pub txn_id: u64,
    pub diff_hash: String,
    pub payload_hash: String,
}

/// Immutable catalog value shared by reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogSnapshot {
    pub version: CatalogVersion,
    pub entries: BTreeMap<String, String>,
    pub deployment: String,
}

impl CatalogSnapshot {
    pub fn empty() -> Self {
        Self {
            version: CatalogVersion {
                version: 0,
                txn_id: 0,
                diff_hash: blake3_hash(b"[]"),
                payload_hash: blake3_hash(b""),
            },
            entries: BTreeMap::new(),
            deployment: String::new(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    pub fn settings(&self) -> ClusterSettings {
        ClusterSettings {
            k_factor: self.get(KFACTOR_KEY).and_then(|v| v.parse().ok()),
            partition_count: self.get(PARTITION_COUNT_KEY).and_then(|v| v.parse().ok()),
        }
    }
}

/// Cluster settings carried in the catalog
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterSettings {
    pub k_factor: Option<u32>,
    pub partition_count: Option<u32>,
}

/// Snapshot handed to every local replica, with how many took it. The
/// replica count is fixed when the entry is created.
struct Dispensed {
    snapshot: Arc<CatalogSnapshot>,
    count: u32,
    replicas: u32,
}

struct CatalogState {
    local_replicas: u32,
    tracker: HashMap<u64, Dispensed>,
    diffs_applied: u64,
}

pub struct CatalogCoordinator {
    state: Mutex<CatalogState>,
    current: RwLock<Arc<CatalogSnapshot>>,
    settings: watch::Sender<ClusterSettings>,
}

impl CatalogCoordinator {
    pub fn new(local_replicas: u32) -> Self {
        Self::with_snapshot(CatalogSnapshot::empty(), local_replicas)
    }

    pub fn with_snapshot(snapshot: CatalogSnapshot, local_replicas: u32) -> Self {
        let (settings, _rx) = watch::channel(snapshot.settings());
        Self {
            state: Mutex::new(CatalogState {
                local_replicas: local_replicas.max(1),
                tracker: HashMap::new(),
                diffs_applied: 0,
            }),
            current: RwLock::new(Arc::new(snapshot)),
            settings,
        }
    }

    pub fn current(&self) -> Arc<CatalogSnapshot> {
        self.current.read().clone()
    }

    pub fn set_local_replicas(&self, local_replicas: u32) {
        self.state.lock().local_replicas = local_replicas.max(1);
    }

    pub fn subscribe_settings(&self) -> watch::Receiver<ClusterSettings> {
        self.settings.subscribe()
    }

    /// How many diffs this node actually computed
    pub fn diffs_applied(&self) -> u64 {
        self.state.lock().diffs_applied
    }

    /// Cache entries still waiting for local replicas
    pub fn pending_dispensations(&self) -> usize {
        self.state.lock().tracker.len()
    }

    /// Local replicas still owed the snapshot of `txn_id`.
    pub fn outstanding(&self, txn_id: u64) -> u32 {
        self.state
            .lock()
            .tracker
            .get(&txn_id)
            .map_or(0, |entry| entry.replicas.saturating_sub(entry.count))
    }

    /// Adopt a newer snapshot read from the store. Returns false when the
    /// local catalog is already at least as new.
    pub fn install(&self, snapshot: CatalogSnapshot) -> bool {
        let mut state = self.state.lock();
        let current = self.current();
        if snapshot.version.version <= current.version.version {
            return false;
        }
        state.tracker.clear();
        let snapshot = Arc::new(snapshot);
        *self.current.write() = snapshot.clone();
        drop(state);

        tracing::info!(
            txn_id = snapshot.version.txn_id,
            version = snapshot.version.version,
            "installed stored catalog"
        );
        self.publish_settings(&current, &snapshot);
        true
    }

    /// Apply `update` once per node, dispensing the result to every local
    /// replica. A version mismatch without a cache hit is fatal.
    pub fn apply_update(&self, update: &CatalogUpdate) -> Result<Arc<CatalogSnapshot>> {
        let mut state = self.state.lock();
        let current = self.current();

        if update.txn_id <= current.version.txn_id {
            if let Some(entry) = state.tracker.get_mut(&update.txn_id) {
                entry.count += 1;
                let snapshot = entry.snapshot.clone();
                if entry.count >= entry.replicas {
                    state.tracker.remove(&update.txn_id);
                }
                return Ok(snapshot);
            }
        }

        if update.expected_version != current.version.version {
            return Err(Error::CatalogVersionMismatch {
                txn_id: update.txn_id,
                expected: update.expected_version,
                actual: current.version.version,
            });
        }
        if update.new_version != update.expected_version + 1 {
            return Err(Error::InvalidTransition(format!(
                "catalog version {} cannot follow {}",
                update.new_version, update.expected_version
            )));
        }
        update.verify()?;

        let mut entries = current.entries.clone();
        for command in &update.diff {
            match command {
                CatalogCommand::Set { path, value } => {
                    entries.insert(path.clone(), value.clone());
                }
                CatalogCommand::Delete { path } => {
                    if entries.remove(path).is_none() {
                        tracing::debug!(path = %path, "catalog delete of missing entry");
                    }
                }
            }
        }

        let snapshot = Arc::new(CatalogSnapshot {
            version: CatalogVersion {
                version: update.new_version,
                txn_id: update.txn_id,
                diff_hash: update.diff_hash.clone(),
                payload_hash: update.deployment_hash.clone(),
            },
            entries,
            deployment: update.deployment.clone(),
        });
        *self.current.write() = snapshot.clone();
        state.diffs_applied += 1;
        let replicas = state.local_replicas;
        if replicas > 1 {
            state.tracker.insert(
                update.txn_id,
                Dispensed {
                    snapshot: snapshot.clone(),
                    count: 1,
                    replicas,
                },
            );
        }
        drop(state);

        tracing::info!(
            txn_id = update.txn_id,
            version = update.new_version,
            diff = short_hash(&update.diff_hash),
            "applied catalog update"
        );
        self.publish_settings(&current, &snapshot);
        Ok(snapshot)
    }

    fn publish_settings(&self, previous: &CatalogSnapshot, next: &CatalogSnapshot) {
        let before = previous.settings();
        let after = next.settings();
        if before == after {
            return;
        }
        if before.k_factor != after.k_factor {
            tracing::info!(from = ?before.k_factor, to = ?after.k_factor, "k-factor changed");
        }
        if before.partition_count != after.partition_count {
            tracing::info!(
                from = ?before.partition_count,
                to = ?after.partition_count,
                "partition count changed"
            );
        }
        self.settings.send_replace(after);
    }
}

/// Durable form of a snapshot under `/catalog`
#[derive(Debug, Serialize, Deserialize)]
struct StoredCatalog {
    version: CatalogVersion,
    entries: BTreeMap<String, String>,
    entries_hash: String,
    deployment: String,
}

fn entries_hash(entries: &BTreeMap<String, String>) -> String {
    let mut hasher = Blake3Hasher::new();
    for (path, value) in entries {
        hasher.update(path.as_bytes());
        hasher.update(value.as_bytes());
    }
    hasher.finalize()
}

/// Read the cluster catalog, verifying its content hashes. `None` when no
/// update was ever applied.
pub fn read_catalog(store: &dyn CoordinationStore) -> Result<Option<CatalogSnapshot>> {
    let stored = match get_json::<StoredCatalog>(store, paths::CATALOG) {
        Ok((stored, _)) => stored,
        Err(Error::NoNode(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    verify_hash(stored.deployment.as_bytes(), &stored.version.payload_hash)?;
    let actual = entries_hash(&stored.entries);
    if actual != stored.entries_hash {
        return Err(Error::ChecksumMismatch {
            expected: stored.entries_hash,
            actual,
        });
    }
    Ok(Some(CatalogSnapshot {
        version: stored.version,
        entries: stored.entries,
        deployment: stored.deployment,
    }))
}

/// Compare-and-set `/catalog` to `snapshot`, never lowering the version.
/// Returns true when this call wrote it.
pub fn publish_catalog(store: &dyn CoordinationStore, snapshot: &CatalogSnapshot) -> Result<bool> {
    let data = to_json(&StoredCatalog {
        version: snapshot.version.clone(),
        entries: snapshot.entries.clone(),
        entries_hash: entries_hash(&snapshot.entries),
        deployment: snapshot.deployment.clone(),
    })?;
    loop {
        match get_json::<StoredCatalog>(store, paths::CATALOG) {
            Ok((stored, _)) if stored.version.version >= snapshot.version.version => return Ok(false),
            Ok((_, stat)) => match store.set(paths::CATALOG, &data, Some(stat.version)) {
                Ok(_) => return Ok(true),
                Err(Error::BadVersion { .. }) => continue,
                Err(e) => return Err(e),
            },
            Err(Error::NoNode(_)) => match store.create(paths::CATALOG, &data, CreateMode::Persistent) {
                Ok(_) => return Ok(true),
                Err(Error::NodeExists(_)) => continue,
                Err(e) => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}
