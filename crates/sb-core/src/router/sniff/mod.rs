//! Protocol sniffing
//!
//! Classifies a connection or datagram from its first bytes. Streams are
//! peeked with exactly one bounded read; the bytes are then handed to every
//! detector concurrently and the first detector producing metadata wins.
//!
//! ## Supported Protocols
//! - TLS (SNI, ALPN)
//! - HTTP/1.x (Host without port)
//! - QUIC Initial (decrypted ClientHello SNI)
//! - DNS (UDP and length-prefixed TCP)
//! - STUN, BitTorrent (TCP handshake and uTP)

use crate::error::SniffError;
use bytes::{Bytes, BytesMut};
use sb_types::{protocol, InboundContext};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

pub mod bittorrent;
pub mod dns;
pub mod http;
pub mod quic;
pub mod stun;
pub mod tls;

pub use tls::{sniff_tls_client_hello, TlsClientHelloInfo};

/// Bound on the initial read when an inbound does not configure one.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_millis(300);

/// Capacity reserved for the peeked prefix.
const PEEK_BUFFER_SIZE: usize = 8 * 1024;

/// What a detector learned about the traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SniffedMetadata {
    /// One of [`sb_types::protocol`].
    pub protocol: &'static str,
    /// Extracted host; empty when the protocol carries none.
    pub domain: String,
}

impl SniffedMetadata {
    pub fn new(protocol: &'static str) -> Self {
        Self {
            protocol,
            domain: String::new(),
        }
    }

    pub fn with_domain(protocol: &'static str, domain: impl Into<String>) -> Self {
        Self {
            protocol,
            domain: domain.into(),
        }
    }

    /// Copy the findings onto routing metadata.
    pub fn apply(&self, metadata: &mut InboundContext) {
        metadata.protocol = self.protocol.to_string();
        if !self.domain.is_empty() {
            metadata.domain = self.domain.clone();
        }
    }
}

/// Pure classifier over a byte prefix. Never panics on any input.
pub type Detector = fn(&[u8]) -> Result<SniffedMetadata, SniffError>;

/// Detectors applied to TCP streams.
pub const STREAM_DETECTORS: &[Detector] = &[
    tls::sniff_tls,
    http::sniff_http,
    dns::sniff_dns_stream,
    bittorrent::sniff_bittorrent_tcp,
];

/// Detectors applied to UDP datagrams.
pub const PACKET_DETECTORS: &[Detector] = &[
    quic::sniff_quic,
    stun::sniff_stun,
    dns::sniff_dns_packet,
    bittorrent::sniff_utp,
];

/// Read once from `conn` under `timeout` and classify what arrived.
///
/// The bytes read stay in `buffer` so the caller can replay them ahead of the
/// stream. A zero `timeout` uses [`DEFAULT_SNIFF_TIMEOUT`].
pub async fn peek_stream<S>(
    conn: &mut S,
    buffer: &mut BytesMut,
    timeout: Duration,
    detectors: &[Detector],
) -> Result<SniffedMetadata, SniffError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let timeout = if timeout.is_zero() {
        DEFAULT_SNIFF_TIMEOUT
    } else {
        timeout
    };
    buffer.reserve(PEEK_BUFFER_SIZE);
    let n = match tokio::time::timeout(timeout, conn.read_buf(buffer)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(SniffError::Read(e)),
        Err(_) => return Err(SniffError::Timeout),
    };
    if n == 0 {
        return Err(SniffError::Read(std::io::ErrorKind::UnexpectedEof.into()));
    }
    dispatch(Bytes::copy_from_slice(&buffer[..]), detectors).await
}

/// Classify one datagram.
pub async fn peek_packet(
    packet: &[u8],
    detectors: &[Detector],
) -> Result<SniffedMetadata, SniffError> {
    dispatch(Bytes::copy_from_slice(packet), detectors).await
}

/// Fan the bytes out to every detector and take the first metadata.
///
/// The channel holds one slot per detector, so detectors still running after
/// a winner is picked finish without blocking.
async fn dispatch(data: Bytes, detectors: &[Detector]) -> Result<SniffedMetadata, SniffError> {
    let (tx, mut rx) = mpsc::channel(detectors.len().max(1));
    for detector in detectors.iter().copied() {
        let tx = tx.clone();
        let data = data.clone();
        tokio::spawn(async move {
            let _ = tx.send(detector(&data)).await;
        });
    }
    drop(tx);

    let mut errors = Vec::new();
    for _ in 0..detectors.len() {
        match rx.recv().await {
            Some(Ok(metadata)) => {
                tracing::debug!(
                    target: "sb_core::sniff",
                    protocol = metadata.protocol,
                    domain = %metadata.domain,
                    "sniffed"
                );
                return Ok(metadata);
            }
            Some(Err(e)) => errors.push(e),
            None => break,
        }
    }
    Err(SniffError::Aggregate(errors))
}

/// Whether a protocol name is one this module can produce.
pub fn is_known_protocol(name: &str) -> bool {
    matches!(
        name,
        protocol::HTTP
            | protocol::TLS
            | protocol::QUIC
            | protocol::DNS
            | protocol::STUN
            | protocol::BITTORRENT
    )
}

/// Read a QUIC variable-length integer; returns the value and bytes consumed.
pub(crate) fn read_varint(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    let len = 1usize << (first >> 6);
    if data.len() < len {
        return None;
    }
    let mut value = u64::from(first & 0x3f);
    for b in &data[1..len] {
        value = (value << 8) | u64::from(*b);
    }
    Some((value, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn stun_packet_is_classified() {
        let packet = hex("000100002112a44224b1a025d0c180c484341306");
        let metadata = peek_packet(&packet, PACKET_DETECTORS).await.unwrap();
        assert_eq!(metadata.protocol, protocol::STUN);
    }

    #[tokio::test]
    async fn http_stream_keeps_bytes_for_replay() {
        let payload = b"GET / HTTP/1.1\r\nHost: www.google.com\r\nAccept: */*\r\n\r\n";
        let mut conn = &payload[..];
        let mut buffer = BytesMut::new();
        let metadata = peek_stream(&mut conn, &mut buffer, Duration::ZERO, STREAM_DETECTORS)
            .await
            .unwrap();
        assert_eq!(metadata.protocol, protocol::HTTP);
        assert_eq!(metadata.domain, "www.google.com");
        assert_eq!(&buffer[..], &payload[..]);
    }

    #[tokio::test]
    async fn garbage_aggregates_every_error() {
        let err = peek_packet(b"\xff\xff\xff", PACKET_DETECTORS)
            .await
            .unwrap_err();
        match err {
            SniffError::Aggregate(errs) => assert_eq!(errs.len(), PACKET_DETECTORS.len()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_stream_is_an_error() {
        let mut conn: &[u8] = &[];
        let mut buffer = BytesMut::new();
        let err = peek_stream(&mut conn, &mut buffer, Duration::ZERO, STREAM_DETECTORS)
            .await
            .unwrap_err();
        assert!(matches!(err, SniffError::Read(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_stream_times_out() {
        let (mut client, _server) = tokio::io::duplex(64);
        let mut buffer = BytesMut::new();
        let err = peek_stream(&mut client, &mut buffer, Duration::ZERO, STREAM_DETECTORS)
            .await
            .unwrap_err();
        assert!(matches!(err, SniffError::Timeout));
    }

    #[test]
    fn varint_lengths() {
        assert_eq!(read_varint(&[0x25]), Some((37, 1)));
        assert_eq!(read_varint(&[0x7b, 0xbd]), Some((15293, 2)));
        assert_eq!(read_varint(&[0x9d, 0x7f, 0x3e, 0x7d]), Some((494_878_333, 4)));
        assert_eq!(read_varint(&[0x7b]), None);
        assert_eq!(read_varint(&[]), None);
    }
}
