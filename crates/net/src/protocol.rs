use super::sequence::SequenceId;

pub const MAX_PACKET_SIZE: usize = 1200;
pub const PROTOCOL_ID: u32 = 0x504B_4C4E;
pub const DEFAULT_PORT: u16 = 20715;
/// Server timestamps travel as milliseconds in a `u32` but are kept below
/// `i32::MAX` so both ends agree on where they wrap.
pub const HIGHEST_TIMESTAMP: u32 = i32::MAX as u32;

pub const HEADER_SIZE: usize = 4 + AckHeader::SIZE + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckHeader {
    pub sequence: SequenceId,
    pub ack: SequenceId,
    pub ack_bits: u32,
}

impl AckHeader {
    pub const SIZE: usize = 8;

    pub fn new(sequence: SequenceId, ack: SequenceId, ack_bits: u32) -> Self {
        Self {
            sequence,
            ack,
            ack_bits,
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sequence.0.to_be_bytes());
        out.extend_from_slice(&self.ack.0.to_be_bytes());
        out.extend_from_slice(&self.ack_bits.to_be_bytes());
    }

    pub fn read(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < Self::SIZE {
            return Err(DecodeError::Truncated(data.len()));
        }
        Ok(Self {
            sequence: SequenceId(u16::from_be_bytes([data[0], data[1]])),
            ack: SequenceId(u16::from_be_bytes([data[2], data[3]])),
            ack_bits: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Connect,
    ServerFull,
    Disconnect,
    HeartBeat,
    /// Application-defined, forwarded verbatim. Ids start at
    /// [`PacketType::FIRST_CUSTOM`].
    Custom(u8),
}

impl PacketType {
    pub const FIRST_CUSTOM: u8 = 4;

    pub fn id(self) -> u8 {
        match self {
            PacketType::Connect => 0,
            PacketType::ServerFull => 1,
            PacketType::Disconnect => 2,
            PacketType::HeartBeat => 3,
            PacketType::Custom(id) => id,
        }
    }

    /// Connection-management types, including custom ids that collide
    /// with them.
    pub fn is_reserved(self) -> bool {
        self.id() < Self::FIRST_CUSTOM
    }
}

impl From<u8> for PacketType {
    fn from(id: u8) -> Self {
        match id {
            0 => PacketType::Connect,
            1 => PacketType::ServerFull,
            2 => PacketType::Disconnect,
            3 => PacketType::HeartBeat,
            id => PacketType::Custom(id),
        }
    }
}

/// A packet type plus its type-specific payload, before stamping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(packet_type: PacketType, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            payload,
        }
    }

    pub fn empty(packet_type: PacketType) -> Self {
        Self::new(packet_type, Vec::new())
    }

    /// Prefixes the packet with the protocol id and `header`.
    pub fn stamp(&self, header: AckHeader) -> Result<Vec<u8>, DecodeError> {
        let size = HEADER_SIZE + self.payload.len();
        if size > MAX_PACKET_SIZE {
            return Err(DecodeError::TooLarge(size));
        }

        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
        header.write(&mut out);
        out.push(self.packet_type.id());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn read_u32(&self) -> Result<u32, DecodeError> {
        let bytes: [u8; 4] = self
            .payload
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or(DecodeError::Truncated(self.payload.len()))?;
        Ok(u32::from_be_bytes(bytes))
    }
}

/// One wire datagram: protocol id, ack header, packet type and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub header: AckHeader,
    pub packet: Packet,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram truncated at {0} bytes")]
    Truncated(usize),
    #[error("invalid or missing protocol id {0:#010x}")]
    ProtocolId(u32),
    #[error("datagram of {0} bytes exceeds MTU")]
    TooLarge(usize),
}

impl Datagram {
    pub fn new(header: AckHeader, packet: Packet) -> Self {
        Self { header, packet }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        self.packet.stamp(self.header)
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < 4 {
            return Err(DecodeError::Truncated(data.len()));
        }
        let protocol_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if protocol_id != PROTOCOL_ID {
            return Err(DecodeError::ProtocolId(protocol_id));
        }
        if data.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated(data.len()));
        }

        let header = AckHeader::read(&data[4..])?;
        let packet_type = PacketType::from(data[4 + AckHeader::SIZE]);
        let payload = data[HEADER_SIZE..].to_vec();

        Ok(Self {
            header,
            packet: Packet::new(packet_type, payload),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_layout() {
        let header = AckHeader::new(SequenceId(0x0102), SequenceId(0x0304), 0x0506_0708);
        let packet = Packet::new(PacketType::Custom(9), vec![0xAA, 0xBB]);
        let bytes = Datagram::new(header, packet).encode().unwrap();

        assert_eq!(&bytes[..4], &PROTOCOL_ID.to_be_bytes());
        assert_eq!(&bytes[4..12], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(bytes[12], 9);
        assert_eq!(&bytes[13..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_decode_rejects_wrong_protocol_id() {
        let mut bytes = Datagram::new(AckHeader::default(), Packet::empty(PacketType::HeartBeat))
            .encode()
            .unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            Datagram::decode(&bytes),
            Err(DecodeError::ProtocolId(_))
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_header() {
        let bytes = Datagram::new(AckHeader::default(), Packet::empty(PacketType::Connect))
            .encode()
            .unwrap();
        assert_eq!(
            Datagram::decode(&bytes[..HEADER_SIZE - 1]),
            Err(DecodeError::Truncated(HEADER_SIZE - 1))
        );
        assert_eq!(Datagram::decode(&[]), Err(DecodeError::Truncated(0)));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let packet = Packet::new(PacketType::Custom(4), vec![0; MAX_PACKET_SIZE]);
        assert!(matches!(
            Datagram::new(AckHeader::default(), packet).encode(),
            Err(DecodeError::TooLarge(_))
        ));
    }

    #[test]
    fn test_packet_type_ids() {
        assert_eq!(PacketType::from(0), PacketType::Connect);
        assert_eq!(PacketType::from(3), PacketType::HeartBeat);
        assert_eq!(PacketType::from(200), PacketType::Custom(200));
        assert_eq!(PacketType::Disconnect.id(), 2);
        assert!(PacketType::ServerFull.is_reserved());
        assert!(!PacketType::Custom(4).is_reserved());
        assert!(PacketType::Custom(1).is_reserved());
    }

    #[test]
    fn test_read_u32_payload() {
        let packet = Packet::new(PacketType::Connect, 7u32.to_be_bytes().to_vec());
        assert_eq!(packet.read_u32(), Ok(7));
        assert!(Packet::empty(PacketType::Connect).read_u32().is_err());
    }
}
