//! Coordination store interface
//!
//! The store is a hierarchical, versioned key-value service with persistent,
//! ephemeral and sequential nodes, compare-and-set writes, and subtree watch
//! channels. Everything the coordination core knows about the cluster is
//! derived from it.
//!
//! Layout used by meshkeeper:
//!
//! ```text
//! /topology                              published Topology (JSON)
//! /start_action/<node>                   declared start action
//! /leader_election/<partition>/c_<seq>   leadership candidacy (ephemeral, sequential)
//! /leaders/<partition>                   appointed leader
//! /replicas/<partition>/<node>_<gen>     site endpoint registration (ephemeral)
//! /cluster_metadata/<node>               network metadata (ephemeral)
//! /hosts/<node>                          mesh membership (ephemeral)
//! /buildstring                           build compatibility race
//! /request_truncation_snapshot/r_<seq>   truncation checkpoint requests
//! /truncation_snapshot_completed         id of the last completed request
//! /rejoin_countdown/<node>               rejoin fan-in countdown
//! /init_completed                        end of startup replay
//! ```

use crate::common::{backoff_with_jitter, CoordinationConfig, Error, Result};
use crate::coordinator::context::ShutdownListener;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod paths {
    pub const TOPOLOGY: &str = "/topology";
    pub const START_ACTION: &str = "/start_action";
    pub const LEADER_ELECTION: &str = "/leader_election";
    pub const LEADERS: &str = "/leaders";
    pub const REPLICAS: &str = "/replicas";
    pub const CLUSTER_METADATA: &str = "/cluster_metadata";
    pub const HOSTS: &str = "/hosts";
    pub const BUILDSTRING: &str = "/buildstring";
    pub const REQUEST_TRUNCATION_SNAPSHOT: &str = "/request_truncation_snapshot";
    pub const TRUNCATION_SNAPSHOT_COMPLETED: &str = "/truncation_snapshot_completed";
    pub const REJOIN_COUNTDOWN: &str = "/rejoin_countdown";
    pub const INIT_COMPLETED: &str = "/init_completed";
    pub const CATALOG: &str = "/catalog";

    /// Directories every node creates (idempotently) after joining the mesh
    pub const PERSISTENT_DIRS: &[&str] = &[
        START_ACTION,
        LEADER_ELECTION,
        LEADERS,
        REPLICAS,
        CLUSTER_METADATA,
        HOSTS,
        REQUEST_TRUNCATION_SNAPSHOT,
        REJOIN_COUNTDOWN,
    ];

    pub fn child(parent: &str, name: impl std::fmt::Display) -> String {
        format!("{}/{}", parent, name)
    }
}

/// Width of the counter suffix appended to sequential node names
pub const SEQUENCE_WIDTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Node metadata returned with reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// Incremented by every successful `set`
    pub version: u32,
    /// Session owning an ephemeral node
    pub ephemeral_owner: Option<u64>,
    pub num_children: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Deleted,
    DataChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

/// Event channel for one watched subtree.
///
/// Events arrive in store order. Consumers re-read the subtree on every
/// event, so coalescing a burst with [`Watch::drain`] loses nothing.
pub struct Watch {
    path: String,
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl Watch {
    pub fn new(path: impl Into<String>, rx: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self {
            path: path.into(),
            rx,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the next event. `None` once the store dropped the watch.
    pub async fn changed(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    /// Discard already queued events, returning how many were pending.
    pub fn drain(&mut self) -> usize {
        let mut n = 0;
        while self.rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }
}

/// Client view of the coordination store, bound to one session.
pub trait CoordinationStore: Send + Sync {
    fn session_id(&self) -> u64;

    /// Create a node. Returns the actual path (with the counter suffix for
    /// sequential modes). Fails with `NodeExists` if the path is taken.
    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    fn get(&self, path: &str) -> Result<(Vec<u8>, Stat)>;

    fn exists(&self, path: &str) -> Result<Option<Stat>>;

    /// Overwrite data. With `Some(version)` this is a compare-and-set.
    fn set(&self, path: &str, data: &[u8], expected_version: Option<u32>) -> Result<Stat>;

    fn delete(&self, path: &str, expected_version: Option<u32>) -> Result<()>;

    /// Child names, sorted.
    fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Subscribe to changes of `path` and every node below it.
    fn watch(&self, path: &str) -> Result<Watch>;

    /// End the session; its ephemeral nodes disappear.
    fn close(&self) -> Result<()>;
}

/// Create the well-known persistent directories, ignoring ones that exist.
pub fn ensure_persistent_dirs(store: &dyn CoordinationStore) -> Result<()> {
    for dir in paths::PERSISTENT_DIRS {
        create_if_absent(store, dir, &[], CreateMode::Persistent)?;
    }
    Ok(())
}

/// Create-if-absent. `Ok(true)` when this call created the node.
pub fn create_if_absent(
    store: &dyn CoordinationStore,
    path: &str,
    data: &[u8],
    mode: CreateMode,
) -> Result<bool> {
    match store.create(path, data, mode) {
        Ok(_) => Ok(true),
        Err(Error::NodeExists(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn get_json<T: DeserializeOwned>(store: &dyn CoordinationStore, path: &str) -> Result<(T, Stat)> {
    let (bytes, stat) = store.get(path)?;
    let value = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Corrupted(format!("{}: {}", path, e)))?;
    Ok((value, stat))
}

pub fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Internal(format!("Serialize error: {}", e)))
}

/// Counter suffix of a sequential node name.
pub fn sequence_of(name: &str) -> Option<u64> {
    if name.len() < SEQUENCE_WIDTH {
        return None;
    }
    name[name.len() - SEQUENCE_WIDTH..].parse().ok()
}

/// Bounded retry for transient store failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &CoordinationConfig) -> Self {
        Self {
            attempts: config.store_retry_attempts.max(1),
            backoff: config.store_retry_backoff(),
        }
    }

    /// Run `op`, retrying only transient errors. Session loss and every
    /// other error class are returned immediately.
    pub async fn run<T, F>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < self.attempts => {
                    tracing::warn!(attempt, error = %e, "{} failed, retrying", what);
                    tokio::time::sleep(backoff_with_jitter(self.backoff, attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&CoordinationConfig::default())
    }
}

/// Countdown latch kept in a single persistent store node.
///
/// Every participant decrements with compare-and-set; waiters block until the
/// value reaches zero or the node shuts down.
pub struct StoreCountdown {
    store: Arc<dyn CoordinationStore>,
    path: String,
}

impl StoreCountdown {
    /// Create (or reset) the countdown at `path` with `count` pending parties.
    pub fn create(store: Arc<dyn CoordinationStore>, path: String, count: u64) -> Result<Self> {
        let data = count.to_string();
        if !create_if_absent(store.as_ref(), &path, data.as_bytes(), CreateMode::Persistent)? {
            store.set(&path, data.as_bytes(), None)?;
        }
        Ok(Self { store, path })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn read(&self) -> Result<(u64, Stat)> {
        let (bytes, stat) = self.store.get(&self.path)?;
        let text = String::from_utf8_lossy(&bytes);
        let value = text
            .trim()
            .parse()
            .map_err(|_| Error::Corrupted(format!("{}: bad countdown value {:?}", self.path, text)))?;
        Ok((value, stat))
    }

    pub fn remaining(&self) -> Result<u64> {
        Ok(self.read()?.0)
    }

    /// Decrement once; returns the remaining count.
    pub fn count_down(&self) -> Result<u64> {
        loop {
            let (value, stat) = self.read()?;
            if value == 0 {
                return Ok(0);
            }
            let next = value - 1;
            match self
                .store
                .set(&self.path, next.to_string().as_bytes(), Some(stat.version))
            {
                Ok(_) => return Ok(next),
                Err(Error::BadVersion { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Block until the count reaches zero. No timeout; cancelled by shutdown.
    pub async fn wait(&self, shutdown: &mut ShutdownListener) -> Result<()> {
        let mut watch = self.store.watch(&self.path)?;
        loop {
            if self.remaining()? == 0 {
                return Ok(());
            }
            tokio::select! {
                event = watch.changed() => {
                    if event.is_none() {
                        return Err(Error::Store(format!("watch on {} closed", self.path)));
                    }
                    watch.drain();
                }
                _ = shutdown.triggered() => {
                    return Err(Error::Cancelled(format!("waiting on {}", self.path)));
                }
            }
        }
    }
}
