//! Server network layer handling WebSocket connections and event dispatch

use crate::client_manager::{Client, ClientManager};
use crate::config::{ServerConfig, StaleRecordPolicy};
use crate::correlator::Correlator;
use crate::relay;
use crate::sink::{RecordSink, SinkError};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{EventMessage, StatusReply};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// Longest prefix of an inbound message written to the debug log
const LOG_PREVIEW_CHARS: usize = 150;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Messages sent from connection tasks to the dispatch loop
#[derive(Debug)]
pub enum ServerMessage {
    ClientConnected {
        client_id: u32,
        addr: SocketAddr,
        sender: mpsc::UnboundedSender<Message>,
    },
    TextReceived {
        client_id: u32,
        text: String,
        arrival: DateTime<Utc>,
    },
    ClientDisconnected {
        client_id: u32,
    },
}

/// Relay server
///
/// Connection tasks only move frames; the registry, the record store and
/// the sink are owned by [`Server::run`], which handles one message at a
/// time. That keeps every card's merge-then-evict sequence atomic.
pub struct Server {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    clients: ClientManager,
    correlator: Correlator<Box<dyn RecordSink + Send>>,
    stale_records: Option<StaleRecordPolicy>,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Server {
    pub async fn bind(
        config: &ServerConfig,
        sink: Box<dyn RecordSink + Send>,
    ) -> Result<Self, ServerError> {
        let listener =
            TcpListener::bind(&config.bind_addr)
                .await
                .map_err(|source| ServerError::Bind {
                    addr: config.bind_addr.clone(),
                    source,
                })?;
        let local_addr = listener.local_addr()?;
        info!("Server listening on {}", local_addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();

        Ok(Server {
            listener: Some(listener),
            local_addr,
            clients: ClientManager::new(config.max_clients),
            correlator: Correlator::new(sink, config.adjustment.clone()),
            stale_records: config.stale_records,
            server_tx,
            server_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns task that accepts TCP connections and assigns client IDs
    fn spawn_acceptor(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut next_client_id: u32 = 1;

            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let client_id = next_client_id;
                        next_client_id = next_client_id.wrapping_add(1).max(1);
                        tokio::spawn(handle_connection(stream, addr, client_id, server_tx.clone()));
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                }

                if server_tx.is_closed() {
                    break;
                }
            }
        });
    }

    fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::ClientConnected {
                client_id,
                addr,
                sender,
            } => {
                if let Err(refused) = self.clients.add_client(Client::new(client_id, addr, sender)) {
                    warn!(
                        "Refusing connection from {}: server full ({} clients)",
                        refused.addr,
                        self.clients.len()
                    );
                    let _ = refused.send_reply(&StatusReply::server_full());
                }
            }
            ServerMessage::TextReceived {
                client_id,
                text,
                arrival,
            } => self.handle_text(client_id, text, arrival),
            ServerMessage::ClientDisconnected { client_id } => {
                self.clients.remove_client(&client_id);
            }
        }
    }

    /// Decodes one inbound message, runs it through the correlator, then
    /// relays and replies as the correlator decided
    fn handle_text(&mut self, client_id: u32, text: String, arrival: DateTime<Utc>) {
        if !self.clients.contains(client_id) {
            debug!("Ignoring message from unregistered client {}", client_id);
            return;
        }

        debug!(
            "Message received from client {} at {}: {}",
            client_id,
            arrival.to_rfc3339(),
            preview(&text)
        );

        let message = match EventMessage::parse(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "Dropping malformed message from client {}: {} ({})",
                    client_id,
                    e,
                    preview(&text)
                );
                return;
            }
        };

        let dispatch = self.correlator.handle(message, arrival);

        if dispatch.relay {
            relay::fan_out(&mut self.clients, client_id, &text);
        }

        if let Some(reply) = dispatch.reply {
            if !self.clients.send_reply(client_id, &reply) {
                debug!("Client {} left before its reply was sent", client_id);
            }
        }
    }

    fn sweep_stale_records(&mut self) {
        let Some(policy) = self.stale_records else {
            return;
        };

        let evicted = self.correlator.evict_stale(policy.max_age);
        if !evicted.is_empty() {
            info!(
                "Evicted {} stale record(s); {} still pending",
                evicted.len(),
                self.correlator.records().len()
            );
        }
    }

    /// Main server loop; returns when the message channel closes
    pub async fn run(mut self) -> Result<(), ServerError> {
        self.spawn_acceptor();

        let mut sweep = self.stale_records.map(|policy| {
            info!(
                "Evicting incomplete records older than {:?}",
                policy.max_age
            );
            let mut timer = interval(policy.sweep_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            timer
        });

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(message) => self.handle_message(message),
                        None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = next_sweep(&mut sweep) => {
                    self.sweep_stale_records();
                },
            }
        }

        Ok(())
    }
}

async fn next_sweep(sweep: &mut Option<Interval>) {
    match sweep {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Runs one WebSocket connection: a writer task drains the client's outbound
/// queue while this task forwards inbound frames to the dispatch loop.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    client_id: u32,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();
    let (sender, mut outbound) = mpsc::unbounded_channel::<Message>();

    if server_tx
        .send(ServerMessage::ClientConnected {
            client_id,
            addr,
            sender,
        })
        .is_err()
    {
        return;
    }

    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if let Err(e) = write.send(message).await {
                debug!("Failed to write to client {}: {}", client_id, e);
                break;
            }
        }
        let _ = write.close().await;
    });

    while let Some(frame) = read.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    warn!("Dropping non-UTF-8 binary frame from client {}", client_id);
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                info!("Client {} ({}) disconnected: {:?}", client_id, addr, frame);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("Connection error from client {} ({}): {}", client_id, addr, e);
                break;
            }
        };

        let arrival = Utc::now();
        if server_tx
            .send(ServerMessage::TextReceived {
                client_id,
                text,
                arrival,
            })
            .is_err()
        {
            break;
        }
    }

    let _ = server_tx.send(ServerMessage::ClientDisconnected { client_id });
}

fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(LOG_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}
