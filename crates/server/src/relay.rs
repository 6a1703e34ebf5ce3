use std::net::SocketAddr;
use std::sync::mpsc;

use packline::{ClientId, Packet, ServerHandler, ServerRegistry, TextMessage};

use crate::events::{DisconnectReason, ServerEvent};

/// Resends every text line a client sends to all other clients.
pub struct TextRelay {
    events: mpsc::Sender<ServerEvent>,
    retries: u8,
}

impl TextRelay {
    pub fn new(events: mpsc::Sender<ServerEvent>) -> Self {
        Self { events, retries: 3 }
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }
}

impl ServerHandler for TextRelay {
    fn on_packet(
        &mut self,
        server: &mut ServerRegistry,
        sender: SocketAddr,
        client: Option<ClientId>,
        packet: &Packet,
    ) {
        let Some(client_id) = client else {
            log::debug!("Ignoring {:?} from unconnected {}", packet.packet_type, sender);
            return;
        };

        let message = match TextMessage::from_packet(packet) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Bad payload from client {}: {}", client_id, e);
                return;
            }
        };

        let relayed = TextMessage::new(Some(client_id.0), message.body.clone());
        let result = relayed
            .to_packet()
            .map_err(|e| e.to_string())
            .and_then(|packet| {
                server
                    .broadcast(&packet, true, self.retries, Some(client_id))
                    .map_err(|e| e.to_string())
            });

        match result {
            Ok(delivered) => {
                log::debug!("Relayed message from {} to {} clients", client_id, delivered);
                self.emit(ServerEvent::Message {
                    client_id,
                    body: message.body,
                });
            }
            Err(message) => self.emit(ServerEvent::Error {
                message: format!("Relay from client {} failed: {}", client_id, message),
            }),
        }
    }

    fn on_timeout(&mut self, client_id: ClientId) {
        self.emit(ServerEvent::ClientDisconnected {
            client_id,
            reason: DisconnectReason::Timeout,
        });
    }

    fn on_connect(&mut self, client_id: ClientId, addr: SocketAddr) {
        self.emit(ServerEvent::ClientConnected { client_id, addr });
    }

    fn on_disconnect(&mut self, client_id: ClientId) {
        self.emit(ServerEvent::ClientDisconnected {
            client_id,
            reason: DisconnectReason::Graceful,
        });
    }
}
