//! In-process stand-ins for the snapshot transfer and rebalance
//! collaborators. They move no data; they record what was asked of them and
//! complete after an optional delay.

use crate::common::Result;
use crate::coordinator::rejoin::{Rebalancer, SnapshotTransfer, TransferRequest};
use crate::coordinator::topology::JoinRecord;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct LoopbackTransfer {
    delay: Duration,
    requests: Arc<Mutex<Vec<TransferRequest>>>,
}

impl LoopbackTransfer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            requests: Arc::default(),
        }
    }

    /// Requests seen so far, in completion order.
    pub fn requests(&self) -> Vec<TransferRequest> {
        self.requests.lock().clone()
    }
}

impl SnapshotTransfer for LoopbackTransfer {
    fn transfer(&self, request: TransferRequest) -> BoxFuture<'static, Result<()>> {
        let delay = self.delay;
        let requests = self.requests.clone();
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            tracing::debug!(site = %request.site, source = ?request.source, kind = ?request.kind, "loopback transfer");
            requests.lock().push(request);
            Ok(())
        }
        .boxed()
    }
}

#[derive(Debug, Default)]
pub struct LoopbackRebalancer {
    joins: Arc<Mutex<Vec<JoinRecord>>>,
}

impl LoopbackRebalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn joins(&self) -> Vec<JoinRecord> {
        self.joins.lock().clone()
    }
}

impl Rebalancer for LoopbackRebalancer {
    fn rebalance(&self, join: JoinRecord) -> BoxFuture<'static, Result<()>> {
        let joins = self.joins.clone();
        async move {
            tracing::debug!(node = %join.node, added = join.added.len(), moved = join.moved.len(), "loopback rebalance");
            joins.lock().push(join);
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::rejoin::TransferKind;
    use crate::coordinator::types::{NodeId, PartitionId, SiteId};

    #[tokio::test]
    async fn test_transfer_records_requests() {
        let transfer = LoopbackTransfer::new(Duration::from_millis(5));
        let request = TransferRequest {
            site: SiteId::new(NodeId(1), PartitionId(2), 1),
            source: Some(SiteId::new(NodeId(0), PartitionId(2), 0)),
            kind: TransferKind::Replicate,
        };
        transfer.transfer(request).await.unwrap();
        assert_eq!(transfer.requests(), vec![request]);
    }
}
