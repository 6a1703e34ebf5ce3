use std::io;
use std::net::SocketAddr;

use super::connection::ClientId;
use super::protocol::{DecodeError, PacketType};

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("already running")]
    AlreadyRunning,
    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddr),
    #[error("not connected")]
    NotConnected,
    #[error("no reply from {0} before the connect timeout")]
    ConnectTimeout(SocketAddr),
    #[error("server refused the connection: server full")]
    ServerFull,
    #[error("unknown client {0}")]
    UnknownClient(ClientId),
    #[error("packet type {0:?} is reserved for connection management")]
    ReservedPacketType(PacketType),
}
