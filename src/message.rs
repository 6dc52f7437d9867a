use crate::{
    constants::{HEADER_SIZE, MAGIC, MAX_PAYLOAD},
    raw::TunnelHeader,
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum InvalidSegment {
    #[error("datagram too short ({0} bytes)")]
    TooShort(usize),
    #[error("not tunnel traffic (bad magic)")]
    BadMagic,
    #[error("declared payload length {declared} doesn't match actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("payload of {0} bytes is over the limit")]
    PayloadTooLarge(usize),
}

/// A validated inbound datagram, borrowing the receive buffer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub header: TunnelHeader,
    pub payload: &'a [u8],
}

impl std::fmt::Debug for Segment<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.header.short_repr())?;
        if cfg!(test) {
            write!(f, ":payload={:?}", String::from_utf8_lossy(self.payload))
        } else {
            Ok(())
        }
    }
}

impl<'a> Segment<'a> {
    pub fn deserialize(buf: &'a [u8]) -> Result<Self, InvalidSegment> {
        if buf.len() < HEADER_SIZE {
            return Err(InvalidSegment::TooShort(buf.len()));
        }
        if buf[0..4] != MAGIC {
            return Err(InvalidSegment::BadMagic);
        }
        let header = TunnelHeader::deserialize(buf).ok_or(InvalidSegment::BadMagic)?;

        let declared = header.payload_len as usize;
        let actual = buf.len() - HEADER_SIZE;
        if declared != actual {
            return Err(InvalidSegment::LengthMismatch { declared, actual });
        }
        if declared > MAX_PAYLOAD {
            return Err(InvalidSegment::PayloadTooLarge(declared));
        }

        Ok(Self {
            header,
            payload: &buf[HEADER_SIZE..],
        })
    }
}
