use crate::{
    Error, Result,
    constants::{HEADER_SIZE, MAGIC},
    seq_nr::SeqNr,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Type {
    #[default]
    Heartbeat,
    Data,
    RateAnnounce,
    RateAck,
    Unknown(u16),
}

impl Type {
    fn from_number(num: u16) -> Type {
        match num {
            0 => Type::Heartbeat,
            1 => Type::Data,
            10 => Type::RateAnnounce,
            11 => Type::RateAck,
            other => Type::Unknown(other),
        }
    }

    fn to_number(self) -> u16 {
        match self {
            Type::Heartbeat => 0,
            Type::Data => 1,
            Type::RateAnnounce => 10,
            Type::RateAck => 11,
            Type::Unknown(n) => n,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelHeader {
    pub connection_id: u32,
    pub htype: Type,
    pub payload_len: u16,
    pub seq_nr: SeqNr,
    pub ack_nr: SeqNr,
}

impl TunnelHeader {
    pub fn short_repr(&self) -> impl std::fmt::Display + '_ {
        struct D<'a>(&'a TunnelHeader);
        impl std::fmt::Display for D<'_> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(
                    f,
                    "{:?}:id={}:seq_nr={}:ack_nr={}:len={}",
                    self.0.htype,
                    self.0.connection_id,
                    self.0.seq_nr,
                    self.0.ack_nr,
                    self.0.payload_len
                )
            }
        }
        D(self)
    }

    pub fn serialize(&self, buffer: &mut [u8]) -> Result<usize> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::BugTooSmallBuffer {
                len: HEADER_SIZE,
                capacity: buffer.len(),
            });
        }
        buffer[0..4].copy_from_slice(&MAGIC);
        buffer[4..8].copy_from_slice(&self.connection_id.to_be_bytes());
        buffer[8..10].copy_from_slice(&self.htype.to_number().to_be_bytes());
        buffer[10..12].copy_from_slice(&self.payload_len.to_be_bytes());
        buffer[12..14].copy_from_slice(&self.seq_nr.0.to_be_bytes());
        buffer[14..16].copy_from_slice(&self.ack_nr.0.to_be_bytes());
        Ok(HEADER_SIZE)
    }

    /// Serialize header followed by payload.
    pub fn serialize_with_payload(&self, out_buf: &mut [u8], payload: &[u8]) -> Result<usize> {
        let total = HEADER_SIZE + payload.len();
        if out_buf.len() < total {
            return Err(Error::BugTooSmallBuffer {
                len: total,
                capacity: out_buf.len(),
            });
        }
        let mut header = *self;
        header.payload_len = payload.len() as u16;
        header.serialize(out_buf)?;
        out_buf[HEADER_SIZE..total].copy_from_slice(payload);
        Ok(total)
    }

    /// Parse a header. Doesn't look at the payload; see [`crate::message::Segment`] for that.
    pub fn deserialize(buffer: &[u8]) -> Option<Self> {
        if buffer.len() < HEADER_SIZE || buffer[0..4] != MAGIC {
            return None;
        }
        let u16_at = |idx: usize| u16::from_be_bytes([buffer[idx], buffer[idx + 1]]);
        Some(TunnelHeader {
            connection_id: u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]),
            htype: Type::from_number(u16_at(8)),
            payload_len: u16_at(10),
            seq_nr: SeqNr(u16_at(12)),
            ack_nr: SeqNr(u16_at(14)),
        })
    }
}

/// Rewrite the ack field of an already serialized segment.
pub fn rewrite_ack_nr(segment: &mut [u8], ack_nr: SeqNr) {
    segment[14..16].copy_from_slice(&ack_nr.0.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use crate::{constants::HEADER_SIZE, seq_nr::SeqNr};

    use super::{TunnelHeader, Type, rewrite_ack_nr};

    #[test]
    fn test_serialize_layout() {
        let header = TunnelHeader {
            connection_id: 0x01020304,
            htype: Type::RateAck,
            payload_len: 0,
            seq_nr: SeqNr(0xaabb),
            ack_nr: SeqNr(0xccdd),
        };
        let mut buf = [0u8; HEADER_SIZE];
        assert_eq!(header.serialize(&mut buf).unwrap(), HEADER_SIZE);
        assert_eq!(
            buf,
            [
                b'D', b'T', b'T', b'2', 1, 2, 3, 4, 0, 11, 0, 0, 0xaa, 0xbb, 0xcc, 0xdd
            ]
        );
        assert_eq!(TunnelHeader::deserialize(&buf), Some(header));
    }

    #[test]
    fn test_serialize_with_payload_sets_len() {
        let header = TunnelHeader {
            connection_id: 7,
            htype: Type::Data,
            seq_nr: SeqNr(3),
            ..Default::default()
        };
        let mut buf = [0u8; 64];
        let len = header.serialize_with_payload(&mut buf, b"hello").unwrap();
        assert_eq!(len, HEADER_SIZE + 5);
        assert_eq!(&buf[10..12], &[0, 5]);
        assert_eq!(&buf[HEADER_SIZE..len], b"hello");

        assert!(header.serialize_with_payload(&mut buf[..20], b"hello").is_err());
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        assert_eq!(TunnelHeader::deserialize(b"DTT2"), None);
        let mut buf = [0u8; HEADER_SIZE];
        TunnelHeader::default().serialize(&mut buf).unwrap();
        buf[3] = b'1';
        assert_eq!(TunnelHeader::deserialize(&buf), None);
    }

    #[test]
    fn test_unknown_type_survives() {
        let header = TunnelHeader {
            htype: Type::Unknown(42),
            ..Default::default()
        };
        let mut buf = [0u8; HEADER_SIZE];
        header.serialize(&mut buf).unwrap();
        assert_eq!(
            TunnelHeader::deserialize(&buf).unwrap().htype,
            Type::Unknown(42)
        );
    }

    #[test]
    fn test_rewrite_ack() {
        let mut buf = [0u8; HEADER_SIZE];
        TunnelHeader::default().serialize(&mut buf).unwrap();
        rewrite_ack_nr(&mut buf, SeqNr(65535));
        assert_eq!(
            TunnelHeader::deserialize(&buf).unwrap().ack_nr,
            SeqNr(u16::MAX)
        );
    }
}
