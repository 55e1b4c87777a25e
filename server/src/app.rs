//! Wires the store, world and both hosts together.

use crate::capture::CaptureSink;
use crate::config::ServerConfig;
use crate::network::{HostHandle, TcpHost};
use crate::router::RouterError;
use crate::servers::{AccountServer, GameServer};
use crate::store::{Store, StoreError};
use crate::world::World;
use log::info;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum StartError {
    Io(io::Error),
    Store(StoreError),
    Router(RouterError),
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartError::Io(e) => write!(f, "failed to open listener: {}", e),
            StartError::Store(e) => write!(f, "failed to load world data: {}", e),
            StartError::Router(e) => write!(f, "bad handler table: {}", e),
        }
    }
}

impl std::error::Error for StartError {}

impl From<io::Error> for StartError {
    fn from(e: io::Error) -> Self {
        StartError::Io(e)
    }
}

impl From<StoreError> for StartError {
    fn from(e: StoreError) -> Self {
        StartError::Store(e)
    }
}

impl From<RouterError> for StartError {
    fn from(e: RouterError) -> Self {
        StartError::Router(e)
    }
}

/// Both hosts up and accepting.
pub struct Running {
    pub account_addr: SocketAddr,
    pub game_addr: SocketAddr,
    pub account: HostHandle,
    pub game: HostHandle,
    pub world: Arc<World>,
    tasks: Vec<JoinHandle<()>>,
}

impl Running {
    /// Stops accepting, stops the sweeper and every map tick. Open
    /// connections are left to close on their own.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.world.shutdown().await;
        info!("Servers stopped");
    }
}

pub async fn start(config: &ServerConfig, store: Store) -> Result<Running, StartError> {
    let capture = CaptureSink::new(config.capture_dir.clone());
    let world = World::load(store.clone(), config.tick.clone()).await?;

    let account = Arc::new(AccountServer::new(store.clone(), &config.throttle)?);
    let game = Arc::new(GameServer::new(store, Arc::clone(&world))?);

    let account_host =
        TcpHost::listen("Account", &config.account, Arc::clone(&account), capture.clone()).await?;
    let game_host = TcpHost::listen("Game", &config.game, game, capture).await?;

    let running = Running {
        account_addr: account_host.local_addr()?,
        game_addr: game_host.local_addr()?,
        account: account_host.handle(),
        game: game_host.handle(),
        world,
        tasks: vec![
            account.spawn_sweeper(config.throttle.sweep_interval()),
            tokio::spawn(account_host.run()),
            tokio::spawn(game_host.run()),
        ],
    };
    info!(
        "Account server on {}, game server on {}",
        running.account_addr, running.game_addr
    );
    Ok(running)
}
