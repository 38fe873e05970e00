use clap::Parser;
use fluxframe::error::StoreError;
use fluxframe::{FluxNode, NodeConfig};
use log::Level;

/// A node of a `fluxframe` cluster
#[derive(Parser)]
#[command(version, about)]
struct Opts {
    /// A TOML file with the configuration of this node, flags override it
    #[arg(short = 'c', long = "config")]
    config: Option<String>,
    /// The `IP:Port` of the registration server
    #[arg(short = 's', long = "server_addr")]
    server_addr: Option<String>,
    /// The `IP` to listen on for other nodes
    #[arg(short = 'i', long = "my_ip")]
    my_ip: Option<String>,
    /// The port to listen on, picked by the OS when not given
    #[arg(short = 'p', long = "my_port")]
    my_port: Option<u16>,
    /// The number of nodes in the cluster
    #[arg(short = 'n', long = "num_nodes")]
    num_nodes: Option<usize>,
    /// The number of threads running chunk tasks, one per core when 0
    #[arg(short = 't', long = "task_threads")]
    task_threads: Option<usize>,
    /// The log level
    #[arg(short = 'l', long = "log_level", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), StoreError> {
    let opts = Opts::parse();
    let level: Level = opts
        .log_level
        .parse()
        .map_err(|e| StoreError::Config(format!("bad log level: {}", e)))?;
    simple_logger::init_with_level(level)
        .map_err(|e| StoreError::Config(e.to_string()))?;
    let mut config = match &opts.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(addr) = opts.server_addr {
        config.server_addr = addr;
    }
    if let Some(ip) = opts.my_ip {
        config.my_ip = ip;
    }
    if opts.my_port.is_some() {
        config.my_port = opts.my_port;
    }
    if let Some(n) = opts.num_nodes {
        config.num_nodes = n;
    }
    if let Some(t) = opts.task_threads {
        config.task_threads = t;
    }
    let node = FluxNode::connect(config).await?;
    node.run().await;
    Ok(())
}
