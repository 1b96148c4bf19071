//! Fan-out of raw event text to every other connected peer

use crate::client_manager::ClientManager;
use log::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// Peers the message was queued for
    pub delivered: usize,
    /// Peers found closed and removed from the registry
    pub dropped: Vec<u32>,
}

/// Forwards `text` verbatim to all clients except `sender`.
///
/// Closed peers are deregistered after the pass; delivery to the others
/// continues regardless.
pub fn fan_out(clients: &mut ClientManager, sender: u32, text: &str) -> RelayReport {
    let mut report = RelayReport::default();

    clients.for_each_except(sender, |client| match client.send_text(text) {
        Ok(()) => report.delivered += 1,
        Err(_) => report.dropped.push(client.id),
    });

    for client_id in &report.dropped {
        warn!("Removing closed connection {} during relay", client_id);
        clients.remove_client(client_id);
    }

    debug!(
        "Relayed message from client {} to {} peer(s)",
        sender, report.delivered
    );
    report
}
