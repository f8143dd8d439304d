//! Cluster coordination core
//!
//! The coordinator is responsible for:
//! - Topology (partition → replica hosts) published once per cluster
//! - The live partition map (sites, generations, leaders)
//! - Leader appointment and partition-loss detection
//! - Join and rejoin of nodes into a running cluster
//! - Catalog version updates dispensed to local replicas
//! - Node startup and shutdown over a coordination store and mailbox mesh

pub mod cartographer;
pub mod catalog;
pub mod context;
pub mod leader;
pub mod loopback;
pub mod mailbox;
pub mod memstore;
pub mod rejoin;
pub mod server;
pub mod simulation;
pub mod store;
pub mod topology;
pub mod types;

pub use cartographer::{Cartographer, CartographerSnapshot, LeaderRecord, SiteRecord};
pub use catalog::{CatalogCommand, CatalogCoordinator, CatalogSnapshot, CatalogUpdate};
pub use context::{Capabilities, Capability, ClusterContext, Shutdown};
pub use leader::{LeaderAppointer, LeaderState};
pub use loopback::{LoopbackRebalancer, LoopbackTransfer};
pub use mailbox::{LocalMesh, Mailbox, MeshTransport, Message};
pub use memstore::MemStore;
pub use rejoin::{
    spawn_truncation_responder, MembershipPhase, Rebalancer, RejoinCoordinator, RejoinState,
    SnapshotTransfer, TrafficGate, TransferKind, TransferRequest,
};
pub use server::{ClusterNode, NodeMetadata};
pub use simulation::LocalCluster;
pub use store::{CoordinationStore, CreateMode};
pub use topology::{Topology, TopologyRegistry};
pub use types::{ClusterShape, HsId, NodeId, PartitionId, SiteId};
