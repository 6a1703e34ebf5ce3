mod ack;
mod client;
mod connection;
mod endpoint;
mod error;
mod payload;
mod protocol;
mod sequence;
mod server;
mod stats;
mod window;

pub use ack::{AckConfig, AckEngine};
pub use client::{ClientConfig, ClientHandler, ClientSession, DisconnectReason, SessionState};
pub use connection::{ClientId, ClientInfo, EntryState};
pub use error::NetError;
pub use payload::{PayloadError, TextMessage};
pub use protocol::{
    AckHeader, Datagram, DecodeError, Packet, PacketType, DEFAULT_PORT, HEADER_SIZE,
    HIGHEST_TIMESTAMP, MAX_PACKET_SIZE, PROTOCOL_ID,
};
pub use sequence::{DEFAULT_MAX_SEQUENCE, SequenceId, bit_index, is_more_recent};
pub use server::{ServerConfig, ServerHandler, ServerRegistry};
pub use stats::{LinkStats, LossSimulation};
pub use window::{DEFAULT_RETENTION, PacketRecord, PacketWindow};
