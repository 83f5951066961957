//! Minimal TLS ClientHello parsing
//!
//! Zero-copy walk over a TLS record carrying a ClientHello to extract SNI and
//! ALPN. Also used on the CRYPTO stream reassembled from QUIC Initial packets.
use super::SniffedMetadata;
use crate::error::SniffError;
use sb_types::protocol;

/// Fields extracted from a ClientHello.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsClientHelloInfo {
    pub sni: Option<String>,
    pub alpn: Option<String>,
}

/// Stream detector: a ClientHello record yields protocol `tls` and its SNI.
pub fn sniff_tls(buf: &[u8]) -> Result<SniffedMetadata, SniffError> {
    let info = sniff_tls_client_hello(buf)?;
    Ok(SniffedMetadata::with_domain(
        protocol::TLS,
        info.sni.unwrap_or_default(),
    ))
}

/// Parse a TLS ClientHello from the provided buffer.
///
/// Truncated records report [`SniffError::NeedMoreData`]; anything that is
/// not a handshake record carrying a ClientHello is [`SniffError::InvalidInput`].
pub fn sniff_tls_client_hello(buf: &[u8]) -> Result<TlsClientHelloInfo, SniffError> {
    // TLS record header: [ContentType(1)=22][Version(2)][Length(2)]
    if buf.len() < 5 {
        return Err(SniffError::NeedMoreData);
    }
    if buf[0] != 22 {
        return Err(SniffError::InvalidInput);
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if record_len < 4 {
        return Err(SniffError::InvalidInput);
    }
    if buf.len() < 5 + record_len {
        return Err(SniffError::NeedMoreData);
    }
    let mut p = 5;
    // Handshake header: [msg_type(1)=1][length(3)]
    if buf[p] != 1 {
        return Err(SniffError::InvalidInput);
    }
    let hs_len =
        ((buf[p + 1] as usize) << 16) | ((buf[p + 2] as usize) << 8) | (buf[p + 3] as usize);
    p += 4;
    if p + hs_len > buf.len() {
        return Err(SniffError::NeedMoreData);
    }
    let end = p + hs_len;

    // version(2) + random(32)
    if p + 2 + 32 > end {
        return Err(SniffError::InvalidInput);
    }
    p += 2 + 32;
    // session_id
    let sid_len = *buf.get(p).ok_or(SniffError::InvalidInput)? as usize;
    p += 1 + sid_len;
    // cipher_suites
    if p + 2 > end {
        return Err(SniffError::InvalidInput);
    }
    let cs_len = u16::from_be_bytes([buf[p], buf[p + 1]]) as usize;
    p += 2 + cs_len;
    // compression_methods
    let cm_len = *buf.get(p).ok_or(SniffError::InvalidInput)? as usize;
    p += 1 + cm_len;
    if p > end {
        return Err(SniffError::InvalidInput);
    }

    let mut info = TlsClientHelloInfo::default();
    // extensions are optional
    if p + 2 > end {
        return Ok(info);
    }
    let ext_total = u16::from_be_bytes([buf[p], buf[p + 1]]) as usize;
    p += 2;
    if p + ext_total > end {
        return Err(SniffError::InvalidInput);
    }
    let ext_end = p + ext_total;

    while p + 4 <= ext_end {
        let ext_type = u16::from_be_bytes([buf[p], buf[p + 1]]);
        let ext_len = u16::from_be_bytes([buf[p + 2], buf[p + 3]]) as usize;
        p += 4;
        if p + ext_len > ext_end {
            return Err(SniffError::InvalidInput);
        }
        let ext_data = &buf[p..p + ext_len];
        p += ext_len;

        match ext_type {
            0x0000 => info.sni = parse_server_name(ext_data),
            0x0010 => info.alpn = parse_first_alpn(ext_data),
            _ => {}
        }
    }
    Ok(info)
}

// server_name_list: u16 len, entries: [u8 name_type=0][u16 name_len][name]
fn parse_server_name(ext_data: &[u8]) -> Option<String> {
    let mut q = 2;
    while q + 3 <= ext_data.len() {
        let name_type = ext_data[q];
        let nlen = u16::from_be_bytes([ext_data[q + 1], ext_data[q + 2]]) as usize;
        q += 3;
        if q + nlen > ext_data.len() {
            return None;
        }
        if name_type == 0 {
            return std::str::from_utf8(&ext_data[q..q + nlen])
                .ok()
                .map(str::to_string);
        }
        q += nlen;
    }
    None
}

// protocol_name_list: u16 len, then [len][name]...; first entry only
fn parse_first_alpn(ext_data: &[u8]) -> Option<String> {
    let nlen = *ext_data.get(2)? as usize;
    let name = ext_data.get(3..3 + nlen)?;
    std::str::from_utf8(name).ok().map(str::to_string)
}
