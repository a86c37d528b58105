mod handlers;
mod node;
mod server;
mod settings;

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use ralock_core::infrastructure::Messenger;
use ralock_core::infrastructure_tcp::TcpMessenger;
use ralock_core::topology::parse_node_id;
use ralock_core::types::{Message, SendOutcome};

use crate::settings::{ClusterArgs, NodeArgs};

#[derive(Parser)]
#[command(
    name = "ralock",
    about = "ralock: permission-based distributed mutual exclusion",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one cluster member: answer peers and request the shared resource
    Node(NodeArgs),

    /// Send one raw protocol message (e.g. `REQ:3:12345.0`) to a node
    Send {
        /// Recipient node id
        to: String,

        /// Message text, `REQ:<id>:<timestamp>` or `GRANT:<id>`
        message: String,

        #[command(flatten)]
        cluster: ClusterArgs,
    },

    /// Print the resolved cluster topology as JSON
    Topology {
        #[command(flatten)]
        cluster: ClusterArgs,
    },

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Node(args) => {
            let settings = args.resolve()?;
            node::run(settings).await?;
        }
        Commands::Send {
            to,
            message,
            cluster,
        } => {
            let topology = Arc::new(cluster.resolve()?);
            let to = parse_node_id(&to)?;
            let message: Message = message
                .parse()
                .with_context(|| format!("invalid message {message:?}"))?;

            match TcpMessenger::new(topology).send(to, message).await {
                SendOutcome::Delivered => println!("sent {message} to node {to}"),
                SendOutcome::Failed { reason } => bail!("sending to node {to} failed: {reason}"),
            }
        }
        Commands::Topology { cluster } => {
            let topology = cluster.resolve()?;
            println!("{}", serde_json::to_string_pretty(&topology)?);
        }
        Commands::Version => {
            println!("ralock {}", env!("CARGO_PKG_VERSION"));
            println!("Ricart-Agrawala mutual exclusion over TCP");
        }
    }

    Ok(())
}
