//! Identifiers and the declarative cluster shape

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mesh member id. The node that forms the cluster gets 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Partition id in `[0, partition_count)`, or the multi-partition sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl PartitionId {
    /// Reserved id of the cross-partition coordinator
    pub const MULTI_PARTITION: PartitionId = PartitionId(16383);

    pub fn is_multi_partition(&self) -> bool {
        *self == Self::MULTI_PARTITION
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_multi_partition() {
            f.write_str("MP")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// One replica of one partition on one node.
///
/// `generation` grows every time the replica is recreated on that node, so
/// messages from a replaced replica can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteId {
    pub node: NodeId,
    pub partition: PartitionId,
    pub generation: u32,
}

impl SiteId {
    pub fn new(node: NodeId, partition: PartitionId, generation: u32) -> Self {
        Self {
            node,
            partition,
            generation,
        }
    }

    /// Mailbox address of this site
    pub fn hsid(&self) -> HsId {
        HsId::for_site(self.node, self.partition)
    }

    /// Child name used under `/replicas/<partition>`
    pub fn registry_name(&self) -> String {
        format!("{}_{}", self.node.0, self.generation)
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.node, self.partition, self.generation)
    }
}

/// Opaque mailbox endpoint address: slot 0 is the node's coordination
/// endpoint, slot `partition + 1` a site endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HsId {
    pub node: NodeId,
    pub slot: u32,
}

impl HsId {
    pub fn coordinator(node: NodeId) -> Self {
        Self { node, slot: 0 }
    }

    pub fn for_site(node: NodeId, partition: PartitionId) -> Self {
        Self {
            node,
            slot: partition.0 + 1,
        }
    }
}

impl fmt::Display for HsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.slot, self.node)
    }
}

/// Declarative cluster shape from the deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterShape {
    pub host_count: u32,
    pub sites_per_host: u32,
    pub k_factor: u32,
}

impl ClusterShape {
    pub fn new(host_count: u32, sites_per_host: u32, k_factor: u32) -> Self {
        Self {
            host_count,
            sites_per_host,
            k_factor,
        }
    }

    /// Replicas per partition (k + 1)
    pub fn replication_factor(&self) -> u32 {
        self.k_factor + 1
    }

    pub fn total_sites(&self) -> u32 {
        self.host_count * self.sites_per_host
    }

    /// Reject shapes that cannot be laid out. Runs before any store write.
    pub fn validate(&self) -> Result<()> {
        if self.host_count == 0 {
            return Err(Error::InvalidShape("host count must be at least 1".into()));
        }
        if self.sites_per_host == 0 {
            return Err(Error::InvalidShape("sites per host must be at least 1".into()));
        }
        if self.host_count < self.replication_factor() {
            return Err(Error::InvalidShape(format!(
                "{} hosts cannot hold {} replicas of each partition (k-factor {})",
                self.host_count,
                self.replication_factor(),
                self.k_factor
            )));
        }
        if self.total_sites() % self.replication_factor() != 0 {
            return Err(Error::InvalidShape(format!(
                "{} hosts with {} sites each is not divisible by replication factor {}",
                self.host_count,
                self.sites_per_host,
                self.replication_factor()
            )));
        }
        if self.total_sites() / self.replication_factor() >= PartitionId::MULTI_PARTITION.0 {
            return Err(Error::InvalidShape("too many partitions".into()));
        }
        Ok(())
    }

    pub fn partition_count(&self) -> Result<u32> {
        self.validate()?;
        Ok(self.total_sites() / self.replication_factor())
    }
}

impl fmt::Display for ClusterShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} hosts x {} sites, k={}",
            self.host_count, self.sites_per_host, self.k_factor
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_count() {
        assert_eq!(ClusterShape::new(3, 2, 1).partition_count().unwrap(), 3);
        assert_eq!(ClusterShape::new(1, 8, 0).partition_count().unwrap(), 8);
        assert_eq!(ClusterShape::new(4, 6, 2).partition_count().unwrap(), 8);
    }

    #[test]
    fn test_invalid_shapes() {
        // not divisible
        assert!(ClusterShape::new(3, 1, 1).validate().is_err());
        // not enough hosts for k
        assert!(ClusterShape::new(2, 4, 2).validate().is_err());
        assert!(ClusterShape::new(0, 4, 0).validate().is_err());
        assert!(ClusterShape::new(2, 0, 0).validate().is_err());
        let err = ClusterShape::new(3, 1, 1).partition_count().unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_hsid_slots() {
        let site = SiteId::new(NodeId(2), PartitionId(5), 1);
        assert_eq!(site.hsid(), HsId { node: NodeId(2), slot: 6 });
        assert_eq!(HsId::coordinator(NodeId(2)).slot, 0);
        assert_eq!(site.registry_name(), "2_1");
        assert_eq!(PartitionId::MULTI_PARTITION.to_string(), "MP");
    }
}
