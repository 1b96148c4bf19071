//! # Card Event Relay Server
//!
//! This library provides a WebSocket hub sitting between a card game and a
//! gaze-tracking robot. Every inbound JSON event is relayed to the other
//! connected peers, and the fragments describing one card are correlated
//! until a complete row can be appended to the CSV log.
//!
//! ## Core Responsibilities
//!
//! ### Relaying
//! Event text is forwarded verbatim to every peer except the sender.
//! `RobotsMove` events are the exception: they are consumed by the server.
//!
//! ### Correlation
//! `cardReveal`, `cardDropped` and `RobotsMove` fragments that share a
//! `cardId` are merged into one record. Arrival order does not matter; once
//! a drop or robot move leaves the record with every required field, the
//! record is persisted and removed.
//!
//! ### Persistence
//! Completed records become rows in an append-only CSV file with a fixed
//! eleven-column header. The server adds two columns of its own: the
//! arrival time of the completing event and the reveal-to-drop duration.
//!
//! ## Architecture Design
//!
//! ### Single Dispatch Loop
//! Each connection runs a reader task and a writer task. Readers forward
//! decoded text to one loop in [`network::Server::run`], which owns the
//! client registry, the record store and the sink. Messages are handled
//! one at a time, so a card's merge and eviction never interleave with
//! another message for the same card.
//!
//! ## Module Organization
//!
//! - [`client_manager`]: connected peers and their outbound queues
//! - [`config`]: listener, CSV and correlation settings
//! - [`correlator`]: per-event decision table and record completion
//! - [`network`]: WebSocket accept loop and dispatch
//! - [`record_store`]: in-memory records keyed by card id
//! - [`relay`]: fan-out to every peer except the sender
//! - [`sink`]: CSV row formatting and the append-only writer
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//! use server::sink::CsvSink;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let sink = CsvSink::new(&config.csv_path);
//!     sink.ensure_header()?;
//!
//!     let server = Server::bind(&config, Box::new(sink)).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod correlator;
pub mod network;
pub mod record_store;
pub mod relay;
pub mod sink;
