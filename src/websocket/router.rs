use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::protocol::{encode_frame, ControlMessage, Opcode};
use crate::websocket::registry::{ConnectionId, ConnectionRegistry};

/// Decides which registered sessions receive an outbound message.
///
/// Every message is encoded into a frame once and the same bytes are
/// queued for each recipient. A failed recipient is logged and skipped.
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<ConnectionRegistry>,
}

impl Router {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Queue `message` for every open session except `exclude`.
    /// Returns the number of sessions it was queued for.
    pub async fn broadcast(&self, message: &ControlMessage, exclude: Option<ConnectionId>) -> usize {
        let Some(frame) = encode_message(message) else {
            return 0;
        };

        let mut delivered = 0;
        for handle in self.registry.snapshot().await {
            if Some(handle.id()) == exclude || !handle.is_open() {
                continue;
            }
            match handle.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Failed to broadcast to connection {}: {}", handle.id(), e),
            }
        }

        debug!("Broadcast '{}' to {} connection(s)", message.kind, delivered);
        delivered
    }

    /// Queue `message` for one session. Returns whether delivery was
    /// attempted; there is no acknowledgement from the peer.
    pub async fn send_to(&self, id: ConnectionId, message: &ControlMessage) -> bool {
        let Some(handle) = self.registry.get(&id).await else {
            debug!("Connection {} not found for '{}'", id, message.kind);
            return false;
        };
        if !handle.is_open() {
            return false;
        }
        let Some(frame) = encode_message(message) else {
            return false;
        };

        match handle.send(frame) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send to connection {}: {}", id, e);
                false
            }
        }
    }

    /// Relay a message received from `sender`: to the peer named in `to`
    /// if there is one, otherwise to everybody else.
    pub async fn relay(&self, sender: ConnectionId, message: &ControlMessage) -> usize {
        if message.signal_kind().is_none() {
            debug!("Relaying non-signaling message '{}' from {}", message.kind, sender);
        }
        match message.to.as_deref() {
            Some(target) => match target.parse::<ConnectionId>() {
                Ok(target) if target != sender => usize::from(self.send_to(target, message).await),
                Ok(_) => {
                    debug!("Connection {} addressed a message to itself; dropped", sender);
                    0
                }
                Err(_) => {
                    warn!("Connection {} addressed unknown peer '{}'", sender, target);
                    0
                }
            },
            None => self.broadcast(message, Some(sender)).await,
        }
    }
}

fn encode_message(message: &ControlMessage) -> Option<Arc<[u8]>> {
    match message.to_json() {
        Ok(json) => Some(encode_frame(Opcode::Text, json.as_bytes()).into()),
        Err(e) => {
            error!("Failed to serialize '{}' message: {}", message.kind, e);
            None
        }
    }
}
