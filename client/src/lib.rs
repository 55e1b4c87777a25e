//! # Tamer Client Library
//!
//! Headless client for the tamer servers. It speaks the same framed
//! protocol as the server crate and is used both by the integration tests
//! and by the `client` bot binary.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! A single TCP connection to either host:
//! - Frame reassembly across partial and coalesced reads
//! - Typed send and receive on top of the `shared` payloads
//! - Handshake and login helpers
//! - Reading the plaintext notice sent to throttled clients
//!
//! ### Bot Module (`bot`)
//! Logs in on the account host, enters the world on the game host and
//! attacks the first mob that comes into view, counting what happens.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::GameClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut account = GameClient::connect("127.0.0.1:7029").await?;
//!     let result = account.login("tamer", "tamer").await?;
//!     println!("Logged in as account {}", result.account_id);
//!     Ok(())
//! }
//! ```

pub mod bot;
pub mod network;
