//! Common utilities and types shared across meshkeeper

pub mod config;
pub mod error;
pub mod hash;
pub mod utils;

pub use config::{ClusterConfig, Config, CoordinationConfig, NodeConfig, StartAction};
pub use error::{Error, ErrorKind, Result};
pub use hash::{blake3_hash, short_hash, verify_hash, Blake3Hasher};
pub use utils::{backoff_with_jitter, parse_duration};
