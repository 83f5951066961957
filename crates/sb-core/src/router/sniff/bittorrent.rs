//! BitTorrent detection: peer-wire handshake over TCP, uTP over UDP.
use super::SniffedMetadata;
use crate::error::SniffError;
use sb_types::protocol;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const HANDSHAKE_HEADER: &[u8] = b"BitTorrent protocol";
const UTP_HEADER_LEN: usize = 20;
const UTP_MAX_TYPE: u8 = 4;
const UTP_VERSION: u8 = 1;
const UTP_EXT_SELECTIVE_ACK: u8 = 1;
const TIMESTAMP_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Stream detector: `\x13BitTorrent protocol`.
pub fn sniff_bittorrent_tcp(buf: &[u8]) -> Result<SniffedMetadata, SniffError> {
    if buf.len() < 1 + HANDSHAKE_HEADER.len() {
        return Err(SniffError::InvalidInput);
    }
    if buf[0] != HANDSHAKE_HEADER.len() as u8
        || &buf[1..1 + HANDSHAKE_HEADER.len()] != HANDSHAKE_HEADER
    {
        return Err(SniffError::InvalidInput);
    }
    Ok(SniffedMetadata::new(protocol::BITTORRENT))
}

/// Packet detector for uTP (BEP 29).
///
/// Header: `[type:4|ver:4][extension][conn_id:2][timestamp_us:4]...` (20
/// bytes), followed by `[next][len][data]` extension records.
pub fn sniff_utp(buf: &[u8]) -> Result<SniffedMetadata, SniffError> {
    if buf.len() < UTP_HEADER_LEN {
        return Err(SniffError::InvalidInput);
    }
    if buf[0] >> 4 > UTP_MAX_TYPE || buf[0] & 0x0f != UTP_VERSION {
        return Err(SniffError::InvalidInput);
    }
    let mut extension = buf[1];
    if extension > UTP_EXT_SELECTIVE_ACK {
        return Err(SniffError::InvalidInput);
    }
    let mut offset = UTP_HEADER_LEN;
    while extension != 0 {
        if extension != UTP_EXT_SELECTIVE_ACK {
            return Err(SniffError::InvalidInput);
        }
        let (next, len) = match buf.get(offset..offset + 2) {
            Some(&[next, len]) => (next, len as usize),
            _ => return Err(SniffError::InvalidInput),
        };
        offset += 2 + len;
        if offset > buf.len() {
            return Err(SniffError::InvalidInput);
        }
        extension = next;
    }

    let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if !timestamp_plausible(timestamp) {
        return Err(SniffError::InvalidInput);
    }
    Ok(SniffedMetadata::new(protocol::BITTORRENT))
}

// The field holds the low 32 bits of a microsecond clock, which wraps about
// every 71 minutes, so the distance is taken modulo 2^32 and any value lands
// inside the 24h window.
fn timestamp_plausible(timestamp: u32) -> bool {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u32)
        .unwrap_or_default();
    let distance = now.wrapping_sub(timestamp).min(timestamp.wrapping_sub(now));
    Duration::from_micros(u64::from(distance)) <= TIMESTAMP_WINDOW
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_handshake() {
        let mut payload = vec![19];
        payload.extend_from_slice(HANDSHAKE_HEADER);
        payload.extend_from_slice(&[0u8; 8]);
        assert_eq!(
            sniff_bittorrent_tcp(&payload).unwrap().protocol,
            protocol::BITTORRENT
        );
        payload[0] = 18;
        assert!(sniff_bittorrent_tcp(&payload).is_err());
    }

    #[test]
    fn utp_syn() {
        let mut buf = vec![0u8; 20];
        buf[0] = 0x41; // ST_SYN, version 1
        assert!(sniff_utp(&buf).is_ok());
        buf[0] = 0x11;
        assert!(sniff_utp(&buf).is_ok());
    }

    #[test]
    fn utp_rejects_bad_type_or_version() {
        let mut buf = vec![0u8; 20];
        buf[0] = 0x51;
        assert!(sniff_utp(&buf).is_err());
        buf[0] = 0x12;
        assert!(sniff_utp(&buf).is_err());
    }

    #[test]
    fn utp_extension_walk() {
        let mut buf = vec![0u8; 20];
        buf[0] = 0x21;
        buf[1] = 1;
        // selective ack: next=0, len=4
        buf.extend_from_slice(&[0, 4, 0xff, 0xff, 0xff, 0xff]);
        assert!(sniff_utp(&buf).is_ok());
        // truncated extension data
        assert!(sniff_utp(&buf[..buf.len() - 1]).is_err());
        // chained to an unknown extension
        buf[20] = 2;
        assert!(sniff_utp(&buf).is_err());
    }
}
