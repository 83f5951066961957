//! STUN message detection.
use super::SniffedMetadata;
use crate::error::SniffError;
use sb_types::protocol;

const MAGIC_COOKIE: u32 = 0x2112_a442;
const HEADER_LEN: usize = 20;

/// Packet detector: magic cookie at bytes 4..8 and a declared attribute
/// length that fits in the datagram.
pub fn sniff_stun(buf: &[u8]) -> Result<SniffedMetadata, SniffError> {
    if buf.len() < HEADER_LEN {
        return Err(SniffError::InvalidInput);
    }
    if u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) != MAGIC_COOKIE {
        return Err(SniffError::InvalidInput);
    }
    let declared = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if buf.len() < HEADER_LEN + declared {
        return Err(SniffError::InvalidInput);
    }
    Ok(SniffedMetadata::new(protocol::STUN))
}
