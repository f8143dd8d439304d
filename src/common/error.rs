//! Error types for meshkeeper

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// How the node lifecycle must react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operator mistake: report and exit before joining the mesh, never retry.
    Config,
    /// Lost a create-if-absent or compare-and-set race: re-read and retry.
    Race,
    /// Local state can no longer be trusted: terminate the node.
    Fatal,
    /// Infrastructure hiccup: bounded retry.
    Transient,
    /// Anything else; surfaced to the caller.
    Other,
}

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid cluster shape: {0}")]
    InvalidShape(String),

    #[error(
        "The cluster already has enough nodes to satisfy the requested k-safety factor of {k_factor}. No more nodes can join"
    )]
    NoCapacity { k_factor: u32 },

    #[error("Node {node} was started with start action {action} during cluster creation")]
    StartActionRejected { node: u32, action: String },

    #[error("Unable to rejoin a node to itself: node id {0} was assigned to a rejoining node")]
    RejoinToSelf(u32),

    #[error("Capability disabled: {0}")]
    CapabilityDisabled(&'static str),

    // === Coordination Store Errors ===
    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("No such node: {0}")]
    NoNode(String),

    #[error("Version conflict on {path}: expected {expected}, actual {actual}")]
    BadVersion {
        path: String,
        expected: u32,
        actual: u32,
    },

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Coordination store error: {0}")]
    Store(String),

    #[error("Coordination session {0} expired")]
    SessionExpired(u64),

    // === Mailbox Errors ===
    #[error("Mailbox error: {0}")]
    Mailbox(String),

    #[error("Unknown mailbox endpoint: {0}")]
    UnknownEndpoint(String),

    // === Consistency Errors ===
    #[error(
        "Catalog update at txn {txn_id} was generated for an out-of-date catalog: expected version {expected}, actual {actual}"
    )]
    CatalogVersionMismatch {
        txn_id: u64,
        expected: u32,
        actual: u32,
    },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("All replicas of partition {0} have been lost")]
    PartitionLost(u32),

    #[error("Local build string {local:?} does not match cluster build string {cluster:?}")]
    BuildMismatch { local: String, cluster: String },

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    // === Generic ===
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidConfig(_)
            | Error::InvalidShape(_)
            | Error::NoCapacity { .. }
            | Error::StartActionRejected { .. }
            | Error::RejoinToSelf(_)
            | Error::CapabilityDisabled(_) => ErrorKind::Config,
            Error::NodeExists(_) | Error::BadVersion { .. } => ErrorKind::Race,
            Error::CatalogVersionMismatch { .. }
            | Error::ChecksumMismatch { .. }
            | Error::PartitionLost(_)
            | Error::BuildMismatch { .. }
            | Error::SessionExpired(_)
            | Error::Corrupted(_)
            | Error::InvalidTransition(_) => ErrorKind::Fatal,
            Error::Io(_) | Error::Store(_) | Error::Mailbox(_) | Error::Timeout(_) => {
                ErrorKind::Transient
            }
            _ => ErrorKind::Other,
        }
    }

    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Must the node terminate itself?
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal)
    }

    pub fn is_config(&self) -> bool {
        matches!(self.kind(), ErrorKind::Config)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Corrupted(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Corrupted(format!("envelope: {}", e))
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::Store("connection reset".into()).is_retryable());
        assert!(Error::SessionExpired(7).is_fatal());
        assert!(!Error::SessionExpired(7).is_retryable());
        assert!(Error::NoCapacity { k_factor: 1 }.is_config());
        assert_eq!(Error::NodeExists("/topology".into()).kind(), ErrorKind::Race);
        assert!(Error::CatalogVersionMismatch {
            txn_id: 10,
            expected: 1,
            actual: 2
        }
        .is_fatal());
    }
}
