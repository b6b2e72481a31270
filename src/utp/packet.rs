//! UTP packet wire format
//!
//! BEP-29 shaped header, 20 bytes:
//!
//! ```text
//! type/ver(1) | extension(1) | connection_id(2) | timestamp_us(4) |
//! timestamp_diff_us(4) | wnd_size(4) | seq_nr(2) | ack_nr(2) | payload...
//! ```
//!
//! All integers big-endian. Extensions are not used; the extension byte is
//! always zero. Anything that does not parse here is not UTP traffic on the
//! shared socket (hole-punch probes, framed tracker datagrams) and is left
//! to the endpoint to dispose of.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Header size
pub const HEADER_LEN: usize = 20;

/// Protocol version
pub const VERSION: u8 = 1;

/// Largest payload carried in one packet
pub const MAX_SEGMENT: usize = 1350;

/// UTP packet types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Data = 0,
    Fin = 1,
    State = 2,
    Reset = 3,
    Syn = 4,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Data),
            1 => Ok(Self::Fin),
            2 => Ok(Self::State),
            3 => Ok(Self::Reset),
            4 => Ok(Self::Syn),
            _ => Err(ProtocolError::InvalidMessageType {
                msg_type: value as i32,
            }),
        }
    }
}

/// One UTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub ty: PacketType,
    pub connection_id: u16,
    pub timestamp: u32,
    pub timestamp_diff: u32,
    pub wnd_size: u32,
    pub seq_nr: u16,
    pub ack_nr: u16,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(ty: PacketType, connection_id: u16, seq_nr: u16, ack_nr: u16) -> Self {
        Packet {
            ty,
            connection_id,
            timestamp: 0,
            timestamp_diff: 0,
            wnd_size: 0,
            seq_nr,
            ack_nr,
            payload: Bytes::new(),
        }
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(((self.ty as u8) << 4) | VERSION);
        buf.put_u8(0);
        buf.put_u16(self.connection_id);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.timestamp_diff);
        buf.put_u32(self.wnd_size);
        buf.put_u16(self.seq_nr);
        buf.put_u16(self.ack_nr);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parse from wire bytes
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::FrameTooLarge {
                size: data.len(),
                max: HEADER_LEN,
            });
        }
        let version = data[0] & 0x0f;
        if version != VERSION {
            return Err(ProtocolError::InvalidMessageType {
                msg_type: version as i32,
            });
        }
        let ty = PacketType::try_from(data[0] >> 4)?;

        Ok(Packet {
            ty,
            connection_id: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            timestamp_diff: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            wnd_size: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            seq_nr: u16::from_be_bytes([data[16], data[17]]),
            ack_nr: u16::from_be_bytes([data[18], data[19]]),
            payload: Bytes::copy_from_slice(&data[HEADER_LEN..]),
        })
    }
}

/// Wrapping sequence comparison: a <= b within half the sequence space
pub fn seq_lte(a: u16, b: u16) -> bool {
    b.wrapping_sub(a) < 0x8000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let packet = Packet {
            ty: PacketType::Data,
            connection_id: 0xbeef,
            timestamp: 12345,
            timestamp_diff: 67,
            wnd_size: 256 * 1024,
            seq_nr: 42,
            ack_nr: 41,
            payload: Bytes::from_static(b"hello"),
        };
        let wire = packet.encode();
        assert_eq!(wire.len(), HEADER_LEN + 5);
        assert_eq!(Packet::decode(&wire).unwrap(), packet);
    }

    #[test]
    fn test_decode_rejects_short() {
        assert!(Packet::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let mut wire = Packet::new(PacketType::Syn, 1, 1, 0).encode().to_vec();
        wire[0] = (4 << 4) | 2;
        assert!(Packet::decode(&wire).is_err());
    }

    #[test]
    fn test_decode_rejects_framed_datagram() {
        // A length-prefixed protobuf datagram starts with 0x00 0x00, which
        // is Data/version-0 and must not parse as UTP
        let mut frame = vec![0u8; 24];
        frame[3] = 20;
        assert!(Packet::decode(&frame).is_err());
    }

    #[test]
    fn test_seq_compare_wraps() {
        assert!(seq_lte(1, 2));
        assert!(seq_lte(2, 2));
        assert!(!seq_lte(3, 2));
        assert!(seq_lte(0xfffe, 1));
        assert!(!seq_lte(1, 0xfffe));
    }
}
