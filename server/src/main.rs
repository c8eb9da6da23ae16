use clap::Parser;
use log::{error, info};
use server::network::{Server, ServerConfig, ServerMessage};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// View broadcast rate (ticks per second)
    #[arg(short, long, default_value = "10")]
    tick_rate: u32,

    /// Maximum number of connected clients, spectators included
    #[arg(short, long, default_value = "16")]
    max_clients: usize,

    /// Identifier of the hosted game
    #[arg(short, long, default_value = "main")]
    game_id: String,

    /// Comma separated player names, one seat each
    #[arg(long, value_delimiter = ',', default_value = "alice,bob")]
    players: Vec<String>,

    /// Default wire protocol (json or bincode)
    #[arg(long, default_value = "bincode")]
    protocol: String,

    /// Seconds between automatic snapshots
    #[arg(long, default_value = "30")]
    snapshot_interval: u64,

    /// Seconds of silence before a client is dropped
    #[arg(long, default_value = "60")]
    client_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    let mut config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        tick_duration: Duration::from_secs_f64(1.0 / args.tick_rate.max(1) as f64),
        max_clients: args.max_clients,
        client_timeout: Duration::from_secs(args.client_timeout),
        game_id: args.game_id,
        players: args.players,
        ..Default::default()
    };
    config.protocol.default_protocol = args.protocol;
    config.registry.snapshot.capture_interval = Duration::from_secs(args.snapshot_interval);

    info!("Starting server on {}", config.bind_addr);
    info!("Hosting game {} for {:?}", config.game_id, config.players);

    let mut server = Server::new(config).await?;

    let shutdown = server.shutdown_sender();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
            if let Err(e) = shutdown.send(ServerMessage::Shutdown) {
                error!("Failed to signal shutdown: {}", e);
            }
        }
    });

    server.run().await?;

    Ok(())
}
