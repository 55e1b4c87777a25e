use clap::Parser;
use log::{error, info};
use server::app;
use server::config::ServerConfig;
use server::store::{MemoryStore, Store};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file; defaults are used when omitted
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Override Tick:IntervalMs
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Override Account:Port
    #[arg(long)]
    account_port: Option<u16>,

    /// Override Game:Port
    #[arg(long)]
    game_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(tick_ms) = args.tick_ms {
        config.tick.interval_ms = tick_ms;
    }
    if let Some(port) = args.account_port {
        config.account.port = port;
    }
    if let Some(port) = args.game_port {
        config.game.port = port;
    }
    config.validate()?;

    info!("Starting servers...");
    let store = Store::spawn(MemoryStore::seeded());
    let running = match app::start(&config, store).await {
        Ok(running) => running,
        Err(e) => {
            error!("Startup failed: {}", e);
            return Err(e.into());
        }
    };

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    running.shutdown().await;

    Ok(())
}
