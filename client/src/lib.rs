//! # Relay Client Library
//!
//! This library implements the client side of the relay: it connects to a
//! server, answers its handshake, and shuttles state updates between the
//! server and an external application that exchanges files with it.
//!
//! ## Module Organization
//!
//! ### Connection Module (`connection`)
//! The protocol engine:
//! - Receive loop dispatching every server message kind
//! - Bounded queues for chat text and relayed updates, dropping the oldest
//! - Serialized sends for updates, chat, watch requests and screenshots
//!
//! ### Bridge Module (`bridge`)
//! File exchange with the external application. Outgoing updates are read
//! from `out.txt` and forwarded without their format-version header;
//! incoming updates are written to `in.txt` once the application has
//! consumed the previous batch.
//!
//! ### Chat Module (`chat`)
//! Prints incoming text and sends typed lines; `/quit` leaves the server.
//!
//! ### Network Module (`network`)
//! Runs one session: the receive loop, the bridge loop at the cadence the
//! server dictates, and optionally the chat loop.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::config::ClientConfig;
//! use client::network::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("alice", "127.0.0.1:2075", "PluginData/kerballivefeed/");
//!     let client = Client::connect(&config).await?;
//!
//!     let end = client.run(Some(client::chat::spawn_stdin_reader())).await?;
//!     println!("{}", end);
//!
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod chat;
pub mod config;
pub mod connection;
pub mod network;

pub use config::ClientConfig;
pub use connection::{ClientError, InTextMessage, ProtocolEngine, SessionEnd};
pub use network::Client;
