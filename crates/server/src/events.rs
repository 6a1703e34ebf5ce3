use std::net::SocketAddr;

use packline::ClientId;

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ClientConnected {
        client_id: ClientId,
        addr: SocketAddr,
    },
    ClientDisconnected {
        client_id: ClientId,
        reason: DisconnectReason,
    },
    Message {
        client_id: ClientId,
        body: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    Kicked,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Kicked => "kicked",
        }
    }
}
