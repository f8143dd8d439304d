//! Host-to-host mailbox messaging
//!
//! The mesh transport is external; this module fixes the message semantics
//! and ships [`LocalMesh`], an in-process mesh that encodes envelopes with
//! bincode, delivers in order per link and reports link loss to the
//! surviving nodes' coordination endpoints.

use crate::common::{Error, Result};
use crate::coordinator::catalog::CatalogUpdate;
use crate::coordinator::types::{HsId, NodeId, PartitionId, SiteId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// The published topology changed (creation or join extension)
    TopologyAnnounce { host_count: u32, partition_count: u32 },
    /// A site registered as leadership candidate
    LeaderCandidacy {
        site: SiteId,
        sequence: u64,
    },
    /// A mesh link was lost
    SiteFailure { failed: HsId },
    /// Schema/configuration diff; applied in txn id order
    CatalogUpdate(CatalogUpdate),
    /// Rejoining site asks the partition leader to stream data
    RejoinDataRequest { site: SiteId, partition: PartitionId },
    RejoinDataAck {
        site: SiteId,
        source: SiteId,
        accepted: bool,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::TopologyAnnounce { .. } => "topology-announce",
            Message::LeaderCandidacy { .. } => "leader-candidacy",
            Message::SiteFailure { .. } => "site-failure",
            Message::CatalogUpdate(_) => "catalog-update",
            Message::RejoinDataRequest { .. } => "rejoin-data-request",
            Message::RejoinDataAck { .. } => "rejoin-data-ack",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: HsId,
    pub to: HsId,
    pub message: Message,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Sending half of an endpoint.
pub trait Mailbox: Send + Sync {
    fn hsid(&self) -> HsId;

    fn send(&self, to: HsId, message: Message) -> Result<()>;
}

/// Mesh membership: endpoint registration and link teardown.
pub trait MeshTransport: Send + Sync {
    fn connect(&self, hsid: HsId) -> Result<(Arc<dyn Mailbox>, Inbox)>;

    /// Drop every endpoint of `node`; peers get a failure notice.
    fn disconnect(&self, node: NodeId);
}

/// Receiving half of an endpoint: encoded envelopes in link order.
pub struct Inbox {
    hsid: HsId,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Inbox {
    pub fn new(hsid: HsId, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { hsid, rx }
    }

    pub fn hsid(&self) -> HsId {
        self.hsid
    }

    /// Next envelope; `None` once the endpoint was disconnected.
    pub async fn recv(&mut self) -> Option<Result<Envelope>> {
        let bytes = self.rx.recv().await?;
        Some(Envelope::decode(&bytes))
    }
}

/// In-process mesh of endpoints
#[derive(Clone, Default)]
pub struct LocalMesh {
    endpoints: Arc<Mutex<HashMap<HsId, mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl LocalMesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hsid: HsId) -> Result<(LocalMailbox, Inbox)> {
        let mut endpoints = self.endpoints.lock();
        if endpoints.get(&hsid).is_some_and(|tx| !tx.is_closed()) {
            return Err(Error::Mailbox(format!("endpoint {} already registered", hsid)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        endpoints.insert(hsid, tx);
        Ok((
            LocalMailbox {
                hsid,
                mesh: self.clone(),
            },
            Inbox { hsid, rx },
        ))
    }

    pub fn is_registered(&self, hsid: HsId) -> bool {
        self.endpoints.lock().contains_key(&hsid)
    }

    /// Drop every endpoint of `node` and tell the surviving nodes'
    /// coordination endpoints which addresses failed.
    pub fn disconnect_node(&self, node: NodeId) {
        let mut endpoints = self.endpoints.lock();
        let failed: Vec<HsId> = endpoints.keys().filter(|h| h.node == node).copied().collect();
        for hsid in &failed {
            endpoints.remove(hsid);
        }
        let survivors: Vec<(HsId, mpsc::UnboundedSender<Vec<u8>>)> = endpoints
            .iter()
            .filter(|(h, _)| h.slot == 0)
            .map(|(h, tx)| (*h, tx.clone()))
            .collect();
        drop(endpoints);

        for failed in failed {
            for (to, tx) in &survivors {
                let envelope = Envelope {
                    from: failed,
                    to: *to,
                    message: Message::SiteFailure { failed },
                };
                match envelope.encode() {
                    Ok(bytes) => {
                        let _ = tx.send(bytes);
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to encode failure notice"),
                }
            }
        }
    }

    fn deliver(&self, envelope: Envelope) -> Result<()> {
        let bytes = envelope.encode()?;
        let endpoints = self.endpoints.lock();
        let tx = endpoints
            .get(&envelope.to)
            .ok_or_else(|| Error::UnknownEndpoint(envelope.to.to_string()))?;
        tx.send(bytes)
            .map_err(|_| Error::Mailbox(format!("endpoint {} is gone", envelope.to)))
    }
}

impl MeshTransport for LocalMesh {
    fn connect(&self, hsid: HsId) -> Result<(Arc<dyn Mailbox>, Inbox)> {
        let (mailbox, inbox) = self.register(hsid)?;
        Ok((Arc::new(mailbox), inbox))
    }

    fn disconnect(&self, node: NodeId) {
        self.disconnect_node(node);
    }
}

/// Sending half of a [`LocalMesh`] endpoint.
pub struct LocalMailbox {
    hsid: HsId,
    mesh: LocalMesh,
}

impl Mailbox for LocalMailbox {
    fn hsid(&self) -> HsId {
        self.hsid
    }

    fn send(&self, to: HsId, message: Message) -> Result<()> {
        self.mesh.deliver(Envelope {
            from: self.hsid,
            to,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivery_in_order() {
        let mesh = LocalMesh::new();
        let a = HsId::coordinator(NodeId(0));
        let b = HsId::coordinator(NodeId(1));
        let (mailbox_a, _inbox_a) = mesh.register(a).unwrap();
        let (_mailbox_b, mut inbox_b) = mesh.register(b).unwrap();

        for host_count in 0..3 {
            mailbox_a
                .send(b, Message::TopologyAnnounce { host_count, partition_count: 3 })
                .unwrap();
        }
        for host_count in 0..3 {
            let envelope = inbox_b.recv().await.unwrap().unwrap();
            assert_eq!(envelope.from, a);
            assert_eq!(
                envelope.message,
                Message::TopologyAnnounce { host_count, partition_count: 3 }
            );
        }
    }

    #[tokio::test]
    async fn test_disconnect_notifies_survivors() {
        let mesh = LocalMesh::new();
        let (_m0, mut inbox0) = mesh.register(HsId::coordinator(NodeId(0))).unwrap();
        let (_m1, _inbox1) = mesh.register(HsId::coordinator(NodeId(1))).unwrap();

        mesh.disconnect_node(NodeId(1));
        let envelope = inbox0.recv().await.unwrap().unwrap();
        assert_eq!(
            envelope.message,
            Message::SiteFailure {
                failed: HsId::coordinator(NodeId(1))
            }
        );
        assert!(!mesh.is_registered(HsId::coordinator(NodeId(1))));
    }

    #[test]
    fn test_unknown_endpoint() {
        let mesh = LocalMesh::new();
        let (mailbox, _inbox) = mesh.register(HsId::coordinator(NodeId(0))).unwrap();
        let err = mailbox
            .send(
                HsId::coordinator(NodeId(9)),
                Message::SiteFailure {
                    failed: HsId::coordinator(NodeId(0)),
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::UnknownEndpoint(_)));
    }
}
