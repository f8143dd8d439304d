//! Per-membership context shared by every coordination component
//!
//! One [`ClusterContext`] is built each time a node joins the mesh and is
//! passed explicitly to every component. It carries the configuration, the
//! store session, the optional-feature table, the worker pool, and the two
//! lifecycle signals: shutdown (owner → components) and fatal (components →
//! owner).

use crate::common::{Config, Error, Result};
use crate::coordinator::rejoin::{Rebalancer, SnapshotTransfer};
use crate::coordinator::store::{CoordinationStore, RetryPolicy};
use crate::coordinator::types::ClusterShape;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

/// Cooperative shutdown trigger, owned by the lifecycle owner.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown was requested (or its owner is gone).
    pub async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Why a node has to terminate itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalReport {
    pub component: &'static str,
    pub reason: String,
}

/// One-shot fatal cell. Components raise, the lifecycle owner waits.
///
/// Only the first report is kept: later ones are usually consequences of it.
#[derive(Clone)]
pub struct FatalSignal {
    tx: Arc<watch::Sender<Option<FatalReport>>>,
}

impl FatalSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn raise(&self, component: &'static str, error: &Error) {
        tracing::error!(component, error = %error, "fatal consistency violation, node must stop");
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(FatalReport {
                component,
                reason: error.to_string(),
            });
            true
        });
    }

    pub fn report(&self) -> Option<FatalReport> {
        self.tx.borrow().clone()
    }

    pub fn is_raised(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub async fn wait(&self) -> FatalReport {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(report) = rx.borrow_and_update().clone() {
                return report;
            }
            // the sender lives in `self`, so this cannot fail
            let _ = rx.changed().await;
        }
    }
}

impl Default for FatalSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded pool for follow-up work dispatched from watch and mailbox
/// handlers. `spawn` returns immediately; the task waits for a permit.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    pub fn spawn<F>(&self, task: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.ok()?;
            Some(task.await)
        })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// An optional feature: present, or explicitly disabled.
#[derive(Clone)]
pub enum Capability<T> {
    Enabled(T),
    Disabled,
}

impl<T> Capability<T> {
    /// The feature, or a configuration error naming it.
    pub fn require(&self, name: &'static str) -> Result<&T> {
        match self {
            Capability::Enabled(value) => Ok(value),
            Capability::Disabled => Err(Error::CapabilityDisabled(name)),
        }
    }
}

/// Registration table of optional collaborators.
#[derive(Clone)]
pub struct Capabilities {
    /// Copies a partition's data into a new replica (rejoin and join)
    pub snapshot_transfer: Capability<Arc<dyn SnapshotTransfer>>,
    /// Moves data for partition splits (join only)
    pub rebalancer: Capability<Arc<dyn Rebalancer>>,
}

impl Capabilities {
    pub fn none() -> Self {
        Self {
            snapshot_transfer: Capability::Disabled,
            rebalancer: Capability::Disabled,
        }
    }

    pub fn with_snapshot_transfer(mut self, transfer: Arc<dyn SnapshotTransfer>) -> Self {
        self.snapshot_transfer = Capability::Enabled(transfer);
        self
    }

    pub fn with_rebalancer(mut self, rebalancer: Arc<dyn Rebalancer>) -> Self {
        self.rebalancer = Capability::Enabled(rebalancer);
        self
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::none()
    }
}

/// Everything one membership lifetime of a node needs.
pub struct ClusterContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn CoordinationStore>,
    pub capabilities: Capabilities,
    pub workers: WorkerPool,
    pub retry: RetryPolicy,
    pub fatal: FatalSignal,
    pub shutdown: Shutdown,
}

impl ClusterContext {
    pub fn new(
        config: Config,
        store: Arc<dyn CoordinationStore>,
        capabilities: Capabilities,
    ) -> Arc<Self> {
        let workers = WorkerPool::new(config.coordination.worker_threads);
        let retry = RetryPolicy::from_config(&config.coordination);
        Arc::new(Self {
            config: Arc::new(config),
            store,
            capabilities,
            workers,
            retry,
            fatal: FatalSignal::new(),
            shutdown: Shutdown::new(),
        })
    }

    pub fn shape(&self) -> ClusterShape {
        self.config.cluster.shape()
    }

    /// Route an error: fatal ones go to the lifecycle owner. Returns the
    /// error for the caller to propagate.
    pub fn escalate(&self, component: &'static str, error: Error) -> Error {
        if error.is_fatal() {
            self.fatal.raise(component, &error);
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fatal_keeps_first_report() {
        let fatal = FatalSignal::new();
        assert!(!fatal.is_raised());
        fatal.raise("catalog", &Error::PartitionLost(1));
        fatal.raise("leader", &Error::PartitionLost(2));
        let report = fatal.wait().await;
        assert_eq!(report.component, "catalog");
        assert!(report.reason.contains("partition 1"));
    }

    #[tokio::test]
    async fn test_worker_pool_bounds_concurrency() {
        let pool = WorkerPool::new(1);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let first = pool.spawn(async move {
            let _ = rx.await;
            1
        });
        let second = pool.spawn(async { 2 });
        tokio::task::yield_now().await;
        assert_eq!(pool.available(), 0);
        assert!(!second.is_finished());
        tx.send(()).unwrap();
        assert_eq!(first.await.unwrap(), Some(1));
        assert_eq!(second.await.unwrap(), Some(2));
    }

    #[test]
    fn test_disabled_capability_is_config_error() {
        let caps = Capabilities::none();
        let err = caps.rebalancer.require("elastic join").unwrap_err();
        assert!(err.is_config());
    }
}
