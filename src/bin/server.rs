use clap::Parser;
use fluxframe::error::StoreError;
use fluxframe::network::Server;
use log::{info, Level};

/// The registration server of a `fluxframe` cluster
#[derive(Parser)]
#[command(version, about)]
struct Opts {
    /// The `IP:Port` to listen for nodes on
    #[arg(short = 'a', long = "address", default_value = "127.0.0.1:9000")]
    address: String,
    /// The number of nodes in the cluster
    #[arg(short = 'n', long = "num_nodes", default_value_t = 3)]
    num_nodes: usize,
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
    let mut server = Server::new(&opts.address).await?;
    server.accept_new_connections(opts.num_nodes).await?;
    info!("All {} nodes registered, ctrl-c stops the cluster", opts.num_nodes);
    tokio::signal::ctrl_c().await?;
    server.broadcast_kill().await?;
    Ok(())
}
