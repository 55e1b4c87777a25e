use clap::Parser;
use client::bot::{self, BotConfig};
use log::{error, info};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Account server address
    #[arg(short = 'a', long, default_value = "127.0.0.1:7029")]
    account: String,

    /// Game server address
    #[arg(short = 'g', long, default_value = "127.0.0.1:7607")]
    game: String,

    #[arg(short = 'u', long, default_value = "tamer")]
    username: String,

    #[arg(short = 'p', long, default_value = "tamer")]
    password: String,

    /// Avatar to enter the world with
    #[arg(long, default_value = "100")]
    avatar: u32,

    /// How long to stay in the world, in seconds
    #[arg(short = 't', long, default_value = "60")]
    seconds: u64,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting bot...");
    info!("Account server: {}, game server: {}", args.account, args.game);
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }

    let config = BotConfig {
        account_addr: args.account,
        game_addr: args.game,
        username: args.username,
        password: args.password,
        avatar_id: args.avatar,
        run_for: Duration::from_secs(args.seconds),
        fake_ping_ms: args.fake_ping,
    };

    match bot::run(&config).await {
        Ok(report) => {
            info!("{:?}", report);
            Ok(())
        }
        Err(e) => {
            error!("Bot failed: {}", e);
            Err(e.into())
        }
    }
}
