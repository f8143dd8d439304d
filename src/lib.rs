//! # meshkeeper
//!
//! Cluster coordination core for a partitioned, replicated in-memory
//! database:
//! - Deterministic topology derived from the declared cluster shape
//! - A watched, versioned map of partitions, sites and leaders
//! - Leader appointment with partition-loss detection
//! - Join and rejoin with snapshot transfer and truncation fencing
//! - Catalog updates applied once per node, shared by local replicas
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            Coordination store                │
//! │  /hosts /topology /replicas /leaders ...     │
//! └──────┬──────────────────┬────────────────────┘
//!        │ watches          │ watches
//! ┌──────▼──────┐    ┌──────▼──────┐
//! │   Node 0    │    │   Node 1    │   ...
//! │ cartographer│◄──►│ cartographer│   mailbox mesh
//! │ appointer   │    │ appointer   │   (candidacies, catalog,
//! │ sites P0 P1 │    │ sites P0 P2 │    rejoin data requests)
//! └─────────────┘    └─────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Print the topology for a shape
//! ```bash
//! meshkeeper topology --hosts 3 --sites-per-host 2 --kfactor 1
//! ```
//!
//! ### Simulate a cluster in-process
//! ```bash
//! meshkeeper simulate --hosts 3 --sites-per-host 2 --kfactor 1 --kill 2 --join
//! ```

pub mod common;
pub mod coordinator;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::ClusterNode;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
