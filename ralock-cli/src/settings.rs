use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, ensure, Context};
use clap::Args;

use ralock_core::executor::{parse_timezone, FileAccessLog, LoggedAccess};
use ralock_core::topology::{parse_node_id, Topology};
use ralock_core::types::NodeId;

/// Node id variable read by older container deployments.
const LEGACY_NODE_ID_VAR: &str = "DEVICE_ID";

// ─── Cluster Arguments ──────────────────────────────────────────────────────

#[derive(Args, Debug, Clone, Default)]
pub struct ClusterArgs {
    /// Cluster members as `<id>=<host>:<port>`, comma separated.
    /// Defaults to node1:5001 … node4:5004.
    #[arg(long, env = "RALOCK_PEERS", conflicts_with = "topology_file")]
    pub peers: Option<String>,

    /// JSON file mapping node ids to `host:port`
    #[arg(long, env = "RALOCK_TOPOLOGY_FILE")]
    pub topology_file: Option<PathBuf>,
}

impl ClusterArgs {
    pub fn resolve(&self) -> anyhow::Result<Topology> {
        if let Some(peers) = &self.peers {
            return Topology::parse_list(peers).context("invalid --peers");
        }
        if let Some(path) = &self.topology_file {
            return Topology::from_json_file(path)
                .with_context(|| format!("invalid topology file {}", path.display()));
        }
        Ok(Topology::default_cluster())
    }
}

// ─── Node Arguments ─────────────────────────────────────────────────────────

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// This node's id (falls back to DEVICE_ID)
    #[arg(long, env = "RALOCK_NODE_ID")]
    pub node_id: Option<String>,

    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Listen address; defaults to 0.0.0.0 on this node's topology port
    #[arg(long, env = "RALOCK_LISTEN")]
    pub listen: Option<String>,

    /// Shared append-only access log
    #[arg(long, env = "RALOCK_ACCESS_LOG", default_value = "/app/logs/access_log.txt")]
    pub access_log: PathBuf,

    /// Lock file guarding the access log; defaults to `<access-log>.lock`
    #[arg(long, env = "RALOCK_LOCK_FILE")]
    pub lock_file: Option<PathBuf>,

    /// Seconds spent inside the critical section
    #[arg(long, env = "RALOCK_HOLD_SECS", default_value_t = 10)]
    pub hold_secs: u64,

    /// IANA zone for access-log timestamps
    #[arg(long, env = "RALOCK_TIMEZONE", default_value = "America/Sao_Paulo")]
    pub timezone: String,

    /// Give up on a request after this many seconds. Unset waits forever.
    #[arg(long, env = "RALOCK_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,

    /// Connect timeout for outbound messages
    #[arg(long, env = "RALOCK_CONNECT_TIMEOUT_MS", default_value_t = 3000)]
    pub connect_timeout_ms: u64,

    /// Minimum pause between requests, in seconds
    #[arg(long, default_value_t = 4)]
    pub min_interval_secs: u64,

    /// Maximum pause between requests, in seconds
    #[arg(long, default_value_t = 6)]
    pub max_interval_secs: u64,

    /// Maximum random delay before the first request, in seconds
    #[arg(long, default_value_t = 10)]
    pub max_startup_delay_secs: u64,

    /// Stop requesting after this many cycles; keeps answering peers
    #[arg(long)]
    pub requests: Option<usize>,

    /// Serve /health and /state over HTTP on this port
    #[arg(long, env = "RALOCK_STATUS_PORT")]
    pub status_port: Option<u16>,
}

/// When the client loop asks for access.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub startup_delay: RangeInclusive<u64>,
    pub interval: RangeInclusive<u64>,
    pub requests: Option<usize>,
}

pub struct NodeSettings {
    pub node_id: NodeId,
    pub topology: Topology,
    pub listen: String,
    pub section: LoggedAccess<FileAccessLog>,
    pub request_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub schedule: Schedule,
    pub status_port: Option<u16>,
}

impl NodeArgs {
    pub fn resolve(self) -> anyhow::Result<NodeSettings> {
        let node_id = resolve_node_id(self.node_id.as_deref())?;
        let topology = self.cluster.resolve()?;

        let Some(own_address) = topology.get(node_id) else {
            bail!("node {node_id} is not part of the topology");
        };
        let listen = self
            .listen
            .unwrap_or_else(|| format!("0.0.0.0:{}", own_address.port));

        validate_interval(self.min_interval_secs, self.max_interval_secs)?;
        ensure!(self.connect_timeout_ms > 0, "--connect-timeout-ms must be positive");
        if let Some(secs) = self.request_timeout_secs {
            ensure!(secs > 0, "--request-timeout-secs must be positive");
        }

        let timezone = parse_timezone(&self.timezone)?;
        let log = match self.lock_file {
            Some(lock_file) => FileAccessLog::new(self.access_log, lock_file),
            None => FileAccessLog::beside(self.access_log),
        };
        let section = LoggedAccess::new(log)
            .with_hold(Duration::from_secs(self.hold_secs))
            .with_timezone(timezone);

        Ok(NodeSettings {
            node_id,
            topology,
            listen,
            section,
            request_timeout: self.request_timeout_secs.map(Duration::from_secs),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            schedule: Schedule {
                startup_delay: 1.min(self.max_startup_delay_secs)..=self.max_startup_delay_secs,
                interval: self.min_interval_secs..=self.max_interval_secs,
                requests: self.requests,
            },
            status_port: self.status_port,
        })
    }
}

// ─── Validation Helpers ─────────────────────────────────────────────────────

fn resolve_node_id(explicit: Option<&str>) -> anyhow::Result<NodeId> {
    let raw = match explicit {
        Some(raw) => raw.to_string(),
        None => std::env::var(LEGACY_NODE_ID_VAR)
            .context("node id missing: pass --node-id or set RALOCK_NODE_ID")?,
    };
    Ok(parse_node_id(&raw)?)
}

pub fn validate_interval(min: u64, max: u64) -> anyhow::Result<()> {
    ensure!(
        min <= max,
        "--min-interval-secs ({min}) must not exceed --max-interval-secs ({max})"
    );
    Ok(())
}
