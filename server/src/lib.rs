//! # Tamer Server Library
//!
//! Server core for a tamer-and-companion MMO: an account host that checks
//! credentials and a game host that runs the world. Both speak the framed
//! binary protocol from the `shared` crate over TCP.
//!
//! ## Core Responsibilities
//!
//! ### Connection Handling
//! Every accepted socket gets its own reader and writer task. Reads may
//! carry several frames back to back; each one is decoded, checked and
//! routed by packet type. The account host refuses clients that reconnect
//! too quickly from the same address, and both hosts enforce a hard
//! connection cap.
//!
//! ### World Simulation
//! Each map instance ticks on its own task. A tick updates who can see
//! whom, runs companion and mob auto-attacks, regenerates vitals, expires
//! buffs and pushes periodic syncs and attendance records.
//!
//! ### Persistence
//! Account, avatar and spawn data sit behind a `Store` that runs on its
//! own task. Handlers await lookups; saves on disconnect and attendance
//! updates are queued without waiting.
//!
//! ## Module Organization
//!
//! ### Wiring (`app`, `servers`, `config`)
//! - `config` loads the JSON config with per-section defaults
//! - `servers` implements the host callbacks for the account and game hosts
//! - `app` starts the store-backed world and both listeners
//!
//! ### Networking (`network`, `connection`, `router`, `throttle`, `capture`)
//! - TCP accept loop, frame slicing and the disconnect path
//! - Per-connection state and the bounded connection registry
//! - Packet dispatch with built-in handshake and keep-alive handling
//! - Per-IP reconnect throttling
//! - Forensic dumps of reads that killed a connection
//!
//! ### Game (`world`, `map`, `session`, `combat`, `buff`, `handlers`)
//! - Lazily opened map instances and their tick tasks
//! - Visibility, auto-attack and respawn within one map
//! - Avatar and companion state carried by a connected player
//! - Hit, critical, block and damage resolution
//! - Timed buffs and their stat effects
//! - Packet handlers for login, entering the world, movement and combat
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::app;
//! use server::config::ServerConfig;
//! use server::store::{MemoryStore, Store};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::load(None)?;
//!     let store = Store::spawn(MemoryStore::seeded());
//!
//!     // Binds both hosts and starts ticking maps as avatars arrive.
//!     let running = app::start(&config, store).await?;
//!     println!("Game server on {}", running.game_addr);
//!
//!     tokio::signal::ctrl_c().await?;
//!     running.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod buff;
pub mod capture;
pub mod combat;
pub mod config;
pub mod connection;
pub mod handlers;
pub mod map;
pub mod network;
pub mod router;
pub mod servers;
pub mod session;
pub mod store;
pub mod throttle;
pub mod utils;
pub mod world;
