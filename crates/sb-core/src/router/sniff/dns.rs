//! DNS query sniffing over UDP and length-prefixed TCP.
use super::SniffedMetadata;
use crate::error::SniffError;
use hickory_proto::op::Message;
use hickory_proto::rr::DNSClass;
use sb_types::protocol;

/// Packet detector: a DNS message with an IN-class question.
pub fn sniff_dns_packet(buf: &[u8]) -> Result<SniffedMetadata, SniffError> {
    let msg = Message::from_vec(buf).map_err(|_| SniffError::InvalidInput)?;
    let question = msg.queries().first().ok_or(SniffError::InvalidInput)?;
    if question.query_class() != DNSClass::IN {
        return Err(SniffError::InvalidInput);
    }
    let name = question.name().to_ascii();
    if !is_domain_name(&name) {
        return Err(SniffError::InvalidInput);
    }
    Ok(SniffedMetadata::with_domain(
        protocol::DNS,
        name.trim_end_matches('.'),
    ))
}

/// Stream detector: 2-byte big-endian length followed by one message.
pub fn sniff_dns_stream(buf: &[u8]) -> Result<SniffedMetadata, SniffError> {
    if buf.len() < 2 {
        return Err(SniffError::NeedMoreData);
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if len == 0 {
        return Err(SniffError::InvalidInput);
    }
    let msg = buf.get(2..2 + len).ok_or(SniffError::NeedMoreData)?;
    sniff_dns_packet(msg)
}

// Presentation-form check: at most 255 octets, labels 1..=63.
fn is_domain_name(name: &str) -> bool {
    if name == "." {
        return true;
    }
    let name = name.trim_end_matches('.');
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|l| !l.is_empty() && l.len() <= 63)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn query(domain: &str) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(7)
            .set_message_type(MessageType::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(Name::from_str(domain).unwrap(), RecordType::A));
        msg.to_vec().unwrap()
    }

    #[test]
    fn udp_query() {
        let m = sniff_dns_packet(&query("example.com.")).unwrap();
        assert_eq!(m.protocol, protocol::DNS);
        assert_eq!(m.domain, "example.com");
    }

    #[test]
    fn tcp_query() {
        let q = query("example.org.");
        let mut buf = (q.len() as u16).to_be_bytes().to_vec();
        buf.extend_from_slice(&q);
        assert_eq!(sniff_dns_stream(&buf).unwrap().domain, "example.org");
        assert!(matches!(
            sniff_dns_stream(&[0, 0, 1]),
            Err(SniffError::InvalidInput)
        ));
        assert!(matches!(
            sniff_dns_stream(&buf[..buf.len() - 1]),
            Err(SniffError::NeedMoreData)
        ));
    }

    #[test]
    fn no_question_is_invalid() {
        let msg = Message::new().to_vec().unwrap();
        assert!(sniff_dns_packet(&msg).is_err());
    }
}
