//! Connection registry for the relay server
//!
//! This module tracks which peers are currently connected, including:
//! - Peer registration and idempotent removal
//! - Capacity enforcement for new connections
//! - "Everyone except the sender" iteration used by the relay fan-out
//! - Direct delivery of status replies to a single peer
//!
//! Each registered client owns the sending half of an unbounded channel that
//! feeds its socket writer task. A failed send means the writer is gone,
//! which is how the rest of the server learns that a peer has disconnected.

use log::{error, info};
use shared::StatusReply;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Returned when a peer's writer task has already shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerGone;

/// Represents a connected peer and the channel used to reach it
#[derive(Debug)]
pub struct Client {
    /// Unique client identifier assigned by the acceptor
    pub id: u32,
    /// Remote address, used for logging
    pub addr: SocketAddr,
    /// When the connection was registered
    pub connected_at: Instant,
    /// Outbound queue drained by the connection's writer task
    sender: mpsc::UnboundedSender<Message>,
}

impl Client {
    /// Creates a client record for a freshly accepted connection
    ///
    /// # Arguments
    /// * `id` - Unique identifier assigned by the acceptor
    /// * `addr` - Remote address of the peer
    /// * `sender` - Outbound queue drained by the connection's writer task
    pub fn new(id: u32, addr: SocketAddr, sender: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            addr,
            connected_at: Instant::now(),
            sender,
        }
    }

    /// Queues a text frame for this peer.
    ///
    /// Never blocks; the only failure is a closed writer.
    pub fn send_text(&self, text: &str) -> Result<(), PeerGone> {
        self.sender
            .send(Message::Text(text.to_owned().into()))
            .map_err(|_| PeerGone)
    }

    /// Queues a JSON status reply for this peer
    ///
    /// A reply that cannot be encoded is logged and skipped; it does not
    /// count as the peer being gone.
    pub fn send_reply(&self, reply: &StatusReply) -> Result<(), PeerGone> {
        match reply.to_json() {
            Ok(json) => self.send_text(&json),
            Err(e) => {
                error!("Failed to encode status reply for client {}: {}", self.id, e);
                Ok(())
            }
        }
    }

    /// Time since the connection was registered
    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Manages all connected peers
///
/// The ClientManager is owned by the server's dispatch loop, so every
/// mutation (connect, disconnect, relay cleanup) is serialized with event
/// processing. Iteration order over peers is unspecified.
pub struct ClientManager {
    /// Connected clients indexed by their unique ID
    clients: HashMap<u32, Client>,
    /// Maximum number of concurrent clients allowed
    max_clients: usize,
}

impl ClientManager {
    /// Creates an empty registry
    ///
    /// # Arguments
    /// * `max_clients` - Maximum number of simultaneous peers; further
    ///   connections are refused
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            max_clients,
        }
    }

    /// Registers a new peer
    ///
    /// Hands the client back if the server is at capacity or the ID is
    /// already taken, so the caller can tell it why before dropping it.
    pub fn add_client(&mut self, client: Client) -> Result<(), Client> {
        if self.clients.len() >= self.max_clients || self.clients.contains_key(&client.id) {
            return Err(client);
        }

        info!("Client {} connected from {}", client.id, client.addr);
        self.clients.insert(client.id, client);
        info!("Connected clients: {}", self.clients.len());
        Ok(())
    }

    /// Removes a peer from the registry
    ///
    /// Returns true if the client was found and removed, false if it was
    /// already gone. Removing an absent client is a no-op.
    pub fn remove_client(&mut self, client_id: &u32) -> bool {
        if let Some(client) = self.clients.remove(client_id) {
            info!(
                "Connection closed for client {} ({}) after {:.1}s. Remaining clients: {}",
                client.id,
                client.addr,
                client.connected_for().as_secs_f64(),
                self.clients.len()
            );
            true
        } else {
            false
        }
    }

    /// Returns true if `client_id` is registered
    ///
    /// Connections refused at capacity are never registered, so their
    /// messages are ignored by the dispatch loop.
    pub fn contains(&self, client_id: u32) -> bool {
        self.clients.contains_key(&client_id)
    }

    /// Calls `f` for every registered client except `sender`
    pub fn for_each_except<F>(&self, sender: u32, mut f: F)
    where
        F: FnMut(&Client),
    {
        for client in self.clients.values().filter(|client| client.id != sender) {
            f(client);
        }
    }

    /// Sends a status reply to one client
    ///
    /// A client whose writer has shut down is deregistered. Returns true if
    /// the reply was queued.
    pub fn send_reply(&mut self, client_id: u32, reply: &StatusReply) -> bool {
        let Some(client) = self.clients.get(&client_id) else {
            return false;
        };

        if client.send_reply(reply).is_ok() {
            true
        } else {
            self.remove_client(&client_id);
            false
        }
    }

    /// Returns the number of currently connected clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true if no clients are currently connected
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
