//! # Relay Server Library
//!
//! This library provides the relay server that lets a group of clients share
//! state updates, chat and screenshots over TCP. The server never interprets
//! the state it forwards: it owns connection bookkeeping, routing and
//! liveness, and leaves the payloads to the clients.
//!
//! ## Core Responsibilities
//!
//! ### Connection Management
//! Handles the complete lifecycle of a client connection:
//! - Claiming one of a fixed number of slots on accept, or refusing when full
//! - Handshake with case-insensitive unique usernames
//! - Disconnection with a reason string sent to the peer before the socket closes
//!
//! ### Relaying
//! State updates are forwarded verbatim to every other handshaken client.
//! Chat lines are prefixed with the sender's name. Screenshots go only to
//! the client currently watching the sender.
//!
//! ### Cadence Control
//! Whenever membership changes the server recomputes how often each client
//! should send updates and pushes the new settings to every connection.
//!
//! ## Architecture Design
//!
//! ### Tasks
//! Every concern runs as its own tokio task:
//! - **Accept loop** (`supervisor`): claims slots and starts sessions
//! - **Session reader** (`session`): decodes frames and dispatches them
//! - **Session writer** (`session`): flushes the slot's outgoing queue
//! - **Timeout monitor** (`monitor`): drops silent or half-dead connections
//! - **Console** (`console`): operator commands from stdin
//!
//! ### Shared State
//! The slot table is the only contended state. Each slot keeps its write
//! path, its liveness fields and its watch fields behind separate locks,
//! and a generation counter makes late work against a reused slot a no-op.
//!
//! ### Failure Handling
//! Expected failures (peers vanishing, malformed payloads) end only the
//! affected connection. Anything else is reported into a single fault cell
//! that the main loop polls; the first fault shuts the server down.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//! use server::settings::ServerSettings;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = ServerSettings {
//!         port: 2075,
//!         max_clients: 16,
//!         ..ServerSettings::default()
//!     };
//!
//!     let server = Server::new(settings).await?.with_console(true);
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod console;
pub mod fault;
pub mod monitor;
pub mod network;
pub mod screenshots;
pub mod session;
pub mod settings;
pub mod slot;
pub mod state;
pub mod supervisor;

pub use network::Server;
pub use settings::ServerSettings;
pub use state::ServerState;
