use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use super::protocol::{Packet, PacketType};

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("expected packet type {expected:?}, got {actual:?}")]
    WrongType {
        expected: PacketType,
        actual: PacketType,
    },
}

/// Line of text relayed between clients through the server.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct TextMessage {
    /// Originating client, `None` when the server speaks.
    pub sender: Option<u32>,
    pub body: String,
}

impl TextMessage {
    pub const PACKET_TYPE: PacketType = PacketType::Custom(16);

    pub fn new(sender: Option<u32>, body: impl Into<String>) -> Self {
        Self {
            sender,
            body: body.into(),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PayloadError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PayloadError::Serialize)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PayloadError> {
        // inbound payloads sit at arbitrary offsets
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(PayloadError::Deserialize)
    }

    pub fn to_packet(&self) -> Result<Packet, PayloadError> {
        Ok(Packet::new(Self::PACKET_TYPE, self.serialize()?))
    }

    pub fn from_packet(packet: &Packet) -> Result<Self, PayloadError> {
        if packet.packet_type != Self::PACKET_TYPE {
            return Err(PayloadError::WrongType {
                expected: Self::PACKET_TYPE,
                actual: packet.packet_type,
            });
        }
        Self::deserialize(&packet.payload)
    }
}
