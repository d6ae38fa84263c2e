use clap::Parser;
use isoworld_server::config::ServerConfig;
use isoworld_server::game_server::GameServer;
use isoworld_server::store::MemoryStore;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Parses command-line arguments, starts the game server and keeps
/// accepting connections until a shutdown signal stops the process.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "5555")]
        port: u16,
        /// Tick rate (updates per second)
        #[clap(short, long, default_value = "20")]
        tick_rate: u32,
        /// Seconds between two periodic saves
        #[clap(long, default_value = "300")]
        save_interval_secs: u64,
        /// Identifier reported in metrics
        #[clap(long, default_value = "server-1")]
        server_id: String,
        /// JSON file the in-memory store is loaded from and saved to
        #[clap(long)]
        snapshot: Option<PathBuf>,
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = ServerConfig {
        server_id: args.server_id,
        host: args.host,
        port: args.port,
        tick_rate: args.tick_rate,
        save_interval: Duration::from_secs(args.save_interval_secs),
        snapshot_path: args.snapshot,
        install_signal_handlers: true,
    };

    let store = match &config.snapshot_path {
        Some(path) => Arc::new(MemoryStore::with_snapshot(path)),
        None => Arc::new(MemoryStore::new()),
    };
    let server = Arc::new(GameServer::with_local_subsystems(config, store));

    if let Err(e) = server.start().await {
        error!("Server failed to start: {}", e);
        return Err(e.into());
    }

    // No wire protocol here: connections are held open until the peer leaves.
    if let Some(mut connections) = server.take_connections().await {
        while let Some((stream, peer)) = connections.recv().await {
            info!("Client connected from {}", peer);
            tokio::spawn(async move {
                let mut stream = stream;
                let mut sink = tokio::io::sink();
                if let Err(e) = tokio::io::copy(&mut stream, &mut sink).await {
                    info!("Client {} disconnected: {}", peer, e);
                }
            });
        }
    }

    Ok(())
}
