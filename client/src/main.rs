use clap::Parser;
use client::network::{Client, ClientConfig};
use log::info;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Game to join
    #[arg(short = 'g', long, default_value = "main")]
    game: String,

    /// Seat to claim; omit to spectate
    #[arg(long)]
    seat: Option<usize>,

    /// Pass priority automatically
    #[arg(long)]
    auto_pass: bool,

    /// Wire protocol (json or bincode), must match the server
    #[arg(long, default_value = "bincode")]
    protocol: String,

    /// Reconnection attempts before giving up
    #[arg(long, default_value = "5")]
    max_attempts: u32,

    /// Initial reconnection delay in milliseconds
    #[arg(long, default_value = "1000")]
    initial_delay: u64,

    /// Longest reconnection delay in milliseconds
    #[arg(long, default_value = "16000")]
    max_delay: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut config = ClientConfig {
        server_addr: args.server,
        game_id: args.game,
        seat: args.seat,
        auto_pass: args.auto_pass,
        ..Default::default()
    };
    config.protocol.default_protocol = args.protocol;
    config.connection.reconnect.max_attempts = args.max_attempts;
    config.connection.reconnect.initial_delay = Duration::from_millis(args.initial_delay);
    config.connection.reconnect.max_delay = Duration::from_millis(args.max_delay);
    config.recovery.timeout =
        config.connection.reconnect.worst_case_wait() + Duration::from_secs(10);

    info!("Starting client...");
    info!("Connecting to: {}", config.server_addr);
    match config.seat {
        Some(seat) => info!("Joining game {} in seat {}", config.game_id, seat),
        None => info!("Spectating game {}", config.game_id),
    }

    let mut client = Client::new(config)?;

    tokio::select! {
        result = client.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    Ok(())
}
