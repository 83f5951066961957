//! HTTP/1.x request sniffing
use super::SniffedMetadata;
use crate::error::SniffError;
use sb_types::protocol;

const MAX_HEADERS: usize = 64;

/// Stream detector: a complete request head yields protocol `http` and the
/// `Host` header without its port.
pub fn sniff_http(buf: &[u8]) -> Result<SniffedMetadata, SniffError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(SniffError::NeedMoreData),
        Err(_) => return Err(SniffError::InvalidInput),
    }
    let host = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(str::trim)
        .unwrap_or_default();
    Ok(SniffedMetadata::with_domain(
        protocol::HTTP,
        strip_port(host),
    ))
}

/// `host:port`, `[v6]:port` and `[v6]` lose the port and brackets; bare IPv6
/// literals are kept as-is.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port))
            if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            name
        }
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_header() {
        let m = sniff_http(b"GET / HTTP/1.1\r\nHost: www.google.com\r\nAccept: */*\r\n\r\n")
            .unwrap();
        assert_eq!(m.protocol, protocol::HTTP);
        assert_eq!(m.domain, "www.google.com");
    }

    #[test]
    fn host_header_with_port() {
        let m = sniff_http(b"GET / HTTP/1.1\r\nHost: www.gov.cn:8080\r\nAccept: */*\r\n\r\n")
            .unwrap();
        assert_eq!(m.domain, "www.gov.cn");
    }

    #[test]
    fn partial_and_garbage() {
        assert!(matches!(
            sniff_http(b"GET / HTTP/1.1\r\nHost: a"),
            Err(SniffError::NeedMoreData)
        ));
        assert!(matches!(
            sniff_http(b"\x16\x03\x01\x00"),
            Err(SniffError::InvalidInput)
        ));
    }

    #[test]
    fn strip_port_variants() {
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "::1");
        assert_eq!(strip_port("[2001:db8::1]"), "2001:db8::1");
        assert_eq!(strip_port("2001:db8::1"), "2001:db8::1");
    }
}
