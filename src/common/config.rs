//! Configuration for meshkeeper nodes

use crate::common::{Error, Result};
use crate::coordinator::types::ClusterShape;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Declarative cluster shape
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Per-node settings
    #[serde(default)]
    pub node: NodeConfig,

    /// Coordination actor tuning
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            node: NodeConfig::default(),
            coordination: CoordinationConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then `MESHKEEPER__*`
    /// environment variables (e.g. `MESHKEEPER__CLUSTER__K_FACTOR=1`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("MESHKEEPER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.cluster.shape().validate()?;
        if self.coordination.worker_threads == 0 {
            return Err(Error::InvalidConfig("worker_threads must be at least 1".into()));
        }
        if self.node.build_string.is_empty() {
            return Err(Error::InvalidConfig("build_string must not be empty".into()));
        }
        Ok(())
    }
}

/// Cluster shape as declared by the deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_host_count")]
    pub host_count: u32,

    #[serde(default = "default_sites_per_host")]
    pub sites_per_host: u32,

    /// Redundant replicas per partition beyond the leader
    #[serde(default)]
    pub k_factor: u32,
}

fn default_host_count() -> u32 {
    1
}
fn default_sites_per_host() -> u32 {
    8
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            host_count: default_host_count(),
            sites_per_host: default_sites_per_host(),
            k_factor: 0,
        }
    }
}

impl ClusterConfig {
    pub fn shape(&self) -> ClusterShape {
        ClusterShape::new(self.host_count, self.sites_per_host, self.k_factor)
    }
}

/// How a node enters the cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartAction {
    #[default]
    Create,
    Recover,
    Rejoin,
    LiveRejoin,
    Join,
}

impl StartAction {
    pub fn does_rejoin(&self) -> bool {
        matches!(self, StartAction::Rejoin | StartAction::LiveRejoin)
    }

    pub fn is_join(&self) -> bool {
        matches!(self, StartAction::Join)
    }

    /// Only legal against an already running cluster.
    pub fn requires_running_cluster(&self) -> bool {
        self.does_rejoin() || self.is_join()
    }
}

impl fmt::Display for StartAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StartAction::Create => "create",
            StartAction::Recover => "recover",
            StartAction::Rejoin => "rejoin",
            StartAction::LiveRejoin => "live_rejoin",
            StartAction::Join => "join",
        };
        f.write_str(name)
    }
}

impl FromStr for StartAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(StartAction::Create),
            "recover" => Ok(StartAction::Recover),
            "rejoin" => Ok(StartAction::Rejoin),
            "live_rejoin" | "liverejoin" => Ok(StartAction::LiveRejoin),
            "join" => Ok(StartAction::Join),
            other => Err(Error::InvalidConfig(format!("unknown start action: {}", other))),
        }
    }
}

/// Node identity and network metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub start_action: StartAction,

    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default = "default_internal_port")]
    pub internal_port: u16,

    #[serde(default = "default_client_port")]
    pub client_port: u16,

    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Must be identical on every node of the mesh
    #[serde(default = "default_build_string")]
    pub build_string: String,
}

fn default_hostname() -> String {
    "localhost".to_string()
}
fn default_internal_port() -> u16 {
    3021
}
fn default_client_port() -> u16 {
    21212
}
fn default_admin_port() -> u16 {
    21211
}
fn default_build_string() -> String {
    crate::BUILD_INFO.to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            start_action: StartAction::default(),
            hostname: default_hostname(),
            internal_port: default_internal_port(),
            client_port: default_client_port(),
            admin_port: default_admin_port(),
            build_string: default_build_string(),
        }
    }
}

/// Coordination actor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Bounded worker pool for watch/mailbox follow-up work
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Attempts for transient coordination-store failures
    #[serde(default = "default_store_retry_attempts")]
    pub store_retry_attempts: u32,

    #[serde(default = "default_store_retry_backoff")]
    pub store_retry_backoff_ms: u64,

    /// Polls while waiting for peers' cluster metadata
    #[serde(default = "default_metadata_retry_limit")]
    pub metadata_retry_limit: u32,

    #[serde(default = "default_metadata_retry_interval")]
    pub metadata_retry_interval_ms: u64,

    /// Re-check delay before declaring a partition lost (0 = immediate)
    #[serde(default)]
    pub partition_loss_grace_ms: u64,

    /// How long a rejoining site waits for the source's data acknowledgement
    #[serde(default = "default_rejoin_ack_timeout")]
    pub rejoin_ack_timeout_ms: u64,
}

fn default_worker_threads() -> usize {
    4
}
fn default_store_retry_attempts() -> u32 {
    5
}
fn default_store_retry_backoff() -> u64 {
    50
}
fn default_metadata_retry_limit() -> u32 {
    200
}
fn default_metadata_retry_interval() -> u64 {
    25
}
fn default_rejoin_ack_timeout() -> u64 {
    2000
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            store_retry_attempts: default_store_retry_attempts(),
            store_retry_backoff_ms: default_store_retry_backoff(),
            metadata_retry_limit: default_metadata_retry_limit(),
            metadata_retry_interval_ms: default_metadata_retry_interval(),
            partition_loss_grace_ms: 0,
            rejoin_ack_timeout_ms: default_rejoin_ack_timeout(),
        }
    }
}

impl CoordinationConfig {
    pub fn store_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.store_retry_backoff_ms)
    }

    pub fn metadata_retry_interval(&self) -> Duration {
        Duration::from_millis(self.metadata_retry_interval_ms)
    }

    pub fn partition_loss_grace(&self) -> Duration {
        Duration::from_millis(self.partition_loss_grace_ms)
    }

    pub fn rejoin_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.rejoin_ack_timeout_ms)
    }
}
