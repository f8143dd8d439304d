//! meshkeeper binary

use clap::{Parser, Subcommand};
use meshkeeper::common::{parse_duration, Config, StartAction};
use meshkeeper::coordinator::catalog::{CatalogCommand, CatalogUpdate, KFACTOR_KEY};
use meshkeeper::coordinator::topology::derive_initial_topology;
use meshkeeper::coordinator::{ClusterShape, LocalCluster, NodeId};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "meshkeeper")]
#[command(about = "Cluster coordination core: topology, leaders, rejoin and catalog versions")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the initial topology for a cluster shape
    Topology {
        #[arg(long)]
        hosts: Option<u32>,

        #[arg(long)]
        sites_per_host: Option<u32>,

        #[arg(long)]
        kfactor: Option<u32>,
    },

    /// Run a cluster in-process and exercise failover, rejoin and join
    Simulate {
        #[arg(long)]
        hosts: Option<u32>,

        #[arg(long)]
        sites_per_host: Option<u32>,

        #[arg(long)]
        kfactor: Option<u32>,

        /// Kill this node after boot, then rejoin a replacement
        #[arg(long)]
        kill: Option<u32>,

        /// Add one node with the join action at the end
        #[arg(long)]
        join: bool,

        /// Catalog updates to broadcast after boot
        #[arg(long, default_value = "3")]
        catalog_updates: u32,

        /// Simulated snapshot transfer time (e.g. "50ms")
        #[arg(long, default_value = "10ms")]
        transfer_delay: String,

        /// Deadline for each convergence step
        #[arg(long, default_value = "10s")]
        timeout: String,
    },
}

fn load_config(
    path: Option<&PathBuf>,
    hosts: Option<u32>,
    sites_per_host: Option<u32>,
    kfactor: Option<u32>,
) -> anyhow::Result<Config> {
    let mut config = Config::load(path.map(PathBuf::as_path))?;
    // CLI arguments win over file and environment
    if let Some(hosts) = hosts {
        config.cluster.host_count = hosts;
    }
    if let Some(sites_per_host) = sites_per_host {
        config.cluster.sites_per_host = sites_per_host;
    }
    if let Some(kfactor) = kfactor {
        config.cluster.k_factor = kfactor;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Topology {
            hosts,
            sites_per_host,
            kfactor,
        } => {
            let config = load_config(cli.config.as_ref(), hosts, sites_per_host, kfactor)?;
            let shape = config.cluster.shape();
            let nodes: Vec<NodeId> = (0..shape.host_count).map(NodeId).collect();
            let topology = derive_initial_topology(shape, &nodes)?;
            println!("{}", serde_json::to_string_pretty(&topology)?);
        }
        Commands::Simulate {
            hosts,
            sites_per_host,
            kfactor,
            kill,
            join,
            catalog_updates,
            transfer_delay,
            timeout,
        } => {
            let config = load_config(cli.config.as_ref(), hosts, sites_per_host, kfactor)?;
            let transfer_delay = parse_duration(&transfer_delay)?;
            let timeout = parse_duration(&timeout)?;
            simulate(config, kill.map(NodeId), join, catalog_updates, transfer_delay, timeout).await?;
        }
    }

    Ok(())
}

async fn simulate(
    config: Config,
    kill: Option<NodeId>,
    join: bool,
    catalog_updates: u32,
    transfer_delay: Duration,
    timeout: Duration,
) -> anyhow::Result<()> {
    let shape = config.cluster.shape();
    let mut cluster = LocalCluster::new(config, transfer_delay)?;
    cluster.boot().await?;
    print_partition_map("after boot", &cluster, NodeId(0), shape, timeout).await?;

    let origin = cluster
        .node(NodeId(0))
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("node 0 did not start"))?;
    for i in 0..catalog_updates {
        let diff = vec![
            CatalogCommand::Set {
                path: format!("tables/t{}", i),
                value: "id bigint".into(),
            },
            CatalogCommand::Set {
                path: KFACTOR_KEY.into(),
                value: shape.k_factor.to_string(),
            },
        ];
        let update = CatalogUpdate::new(100 + u64::from(i), i, diff, format!("deployment-{}", i))?;
        origin.broadcast_catalog_update(update)?;
    }
    let deadline = tokio::time::Instant::now() + timeout;
    while cluster
        .nodes()
        .any(|n| n.catalog().current().version.version < catalog_updates)
    {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("catalog updates did not reach every node");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    println!("Catalog:");
    for node in cluster.nodes() {
        let catalog = node.catalog();
        println!(
            "  node {}: version {} ({} diffs computed)",
            node.node_id(),
            catalog.current().version.version,
            catalog.diffs_applied()
        );
    }

    if let Some(victim) = kill {
        if victim == NodeId(0) {
            anyhow::bail!("node 0 is the observer; kill another node");
        }
        cluster.kill(victim)?;
        print_partition_map("after kill", &cluster, NodeId(0), shape, timeout).await?;

        let replacement = cluster.start_node(StartAction::Rejoin).await?;
        println!(
            "Rejoined as node {} with sites {:?}",
            replacement.node_id(),
            replacement.sites()
        );
        print_partition_map("after rejoin", &cluster, NodeId(0), shape, timeout).await?;
    }

    if join {
        let joiner = cluster.start_node(StartAction::Join).await?;
        println!("Joined as node {} with sites {:?}", joiner.node_id(), joiner.sites());
        print_partition_map("after join", &cluster, NodeId(0), shape, timeout).await?;
    }

    println!("Transfers: {}", cluster.transfer().requests().len());
    cluster.shutdown();
    Ok(())
}

async fn print_partition_map(
    label: &str,
    cluster: &LocalCluster,
    observer: NodeId,
    shape: ClusterShape,
    timeout: Duration,
) -> anyhow::Result<()> {
    let snapshot = cluster.wait_for_leaders(observer, timeout).await?;
    println!("Partition map {} ({}):", label, shape);
    for (partition, sites) in &snapshot.replicas {
        let leader = snapshot
            .leaders
            .get(partition)
            .map(|l| l.site.to_string())
            .unwrap_or_else(|| "-".into());
        let replicas: Vec<String> = sites.iter().map(|r| r.site.to_string()).collect();
        println!("  P{}: leader {} replicas [{}]", partition.0, leader, replicas.join(", "));
    }
    Ok(())
}
