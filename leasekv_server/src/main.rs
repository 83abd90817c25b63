//! LeaseKV storage node executable.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;

use env_logger::Env;

use leasekv::{
    pl_error, pl_info, LeaseKvError, NodeId, ServerConfig, StorageNode,
};

use tokio::runtime::Builder;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Key-value API port to listen on.
    #[arg(short, long, default_value_t = 9009)]
    port: u16,

    /// Master node address. Leave unset to run as the master.
    #[arg(short, long)]
    master: Option<SocketAddr>,

    /// Number of nodes in the ring, including the master.
    #[arg(short, long, default_value_t = 1)]
    num_nodes: usize,

    /// 32-bit ring position of this node; 0 picks a random one.
    #[arg(short, long, default_value_t = 0)]
    id: NodeId,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// Node configuration in TOML format.
    #[arg(short, long)]
    config: Option<String>,
}

impl CliArgs {
    /// Sanitizes command line arguments.
    fn sanitize(&self) -> Result<(), LeaseKvError> {
        if self.port <= 1024 {
            Err(LeaseKvError(format!("invalid port {}", self.port)))
        } else if self.num_nodes == 0 {
            Err(LeaseKvError("num_nodes must be at least 1".into()))
        } else if self.threads < 2 {
            Err(LeaseKvError(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

// Node executable main entrance.
fn node_main() -> Result<(), LeaseKvError> {
    let args = CliArgs::parse();
    args.sanitize()?;

    // ID 0 on the command line means "pick one at random"
    let mut id = args.id;
    while id == 0 {
        id = rand::random();
    }

    let config = ServerConfig::from_toml(args.config.as_deref())?;
    let bind_addr: SocketAddr = format!("127.0.0.1:{}", args.port)
        .parse()
        .map_err(|e| {
            LeaseKvError(format!(
                "failed to parse bind addr: port {}: {}",
                args.port, e
            ))
        })?;

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name(format!("tokio-worker-node{}", id))
        .build()?;

    runtime.block_on(async move {
        let mut node = StorageNode::new_and_setup(
            id,
            bind_addr,
            args.master,
            args.num_nodes,
            config,
        )
        .await?;
        pl_info!(id; "node serving at {}", node.addr());

        node.run().await?;

        Ok::<(), LeaseKvError>(())
    })
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = node_main() {
        pl_error!("node"; "node_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
