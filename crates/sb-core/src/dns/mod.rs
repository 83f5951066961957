//! DNS resolution pipeline
//! DNS 解析流水线
//!
//! - [`DnsTransport`]: upstream capability supplied by the transport layer
//!   (UDP/DoH/DoT/FakeIP live outside this crate).
//! - [`DnsClient`]: exact-match response cache, rejection cache, strategy
//!   filtering and per-request overrides.
//! - [`DnsRouter`]: rule dispatch, concurrent transport racing, fallback
//!   re-query and reverse mapping.

use crate::error::DnsError;
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use sb_types::DomainStrategy;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub mod client;
pub mod reverse;
pub mod router;

pub use client::{DnsClient, DnsClientOptions};
pub use reverse::ReverseMapping;
pub use router::DnsRouter;

/// Per transport call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default TTL applied to cached entries whose answers carry none.
pub(crate) const DEFAULT_TTL: u32 = 600;

/// Upstream DNS transport.
#[async_trait]
pub trait DnsTransport: Send + Sync {
    fn tag(&self) -> &str;

    /// FakeIP issuers answer with synthetic addresses.
    fn is_fakeip(&self) -> bool {
        false
    }

    /// Raw transports speak DNS messages and are cached by the client;
    /// others (system resolver, FakeIP) only answer `lookup`.
    fn is_raw(&self) -> bool {
        true
    }

    async fn exchange(&self, message: &Message) -> Result<Message, DnsError>;

    /// Address lookup for non-raw transports.
    async fn lookup(&self, domain: &str, strategy: DomainStrategy) -> Result<Vec<IpAddr>, DnsError> {
        let _ = (domain, strategy);
        Err(DnsError::Transport(format!("{}: lookup not supported", self.tag())))
    }
}

/// Validates decoded answer addresses before a response is accepted.
pub type ResponseChecker = Arc<dyn Fn(&[IpAddr]) -> bool + Send + Sync>;

/// Request-scoped resolution options, threaded explicitly through the
/// router and the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DnsQueryOptions {
    pub strategy: DomainStrategy,
    pub disable_cache: bool,
    pub rewrite_ttl: Option<u32>,
    pub client_subnet: Option<IpAddr>,
}

impl DnsQueryOptions {
    pub fn with_strategy(strategy: DomainStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }
}

/// A/AAAA addresses carried in the answer section.
pub fn message_addresses(message: &Message) -> Vec<IpAddr> {
    message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

/// Smallest TTL across answer, authority and additional records.
pub(crate) fn min_ttl(message: &Message) -> Option<u32> {
    message
        .answers()
        .iter()
        .chain(message.name_servers())
        .chain(message.additionals())
        .map(|r| r.ttl())
        .min()
}

pub(crate) fn is_address_query(message: &Message) -> bool {
    message
        .queries()
        .first()
        .is_some_and(|q| matches!(q.query_type(), RecordType::A | RecordType::AAAA))
}

/// Fully-qualified name without the trailing dot.
pub(crate) fn fqdn_to_domain(name: &Name) -> String {
    name.to_ascii().trim_end_matches('.').to_string()
}

/// Recursive query for `domain`.
pub fn new_query(domain: &str, record_type: RecordType) -> Result<Message, DnsError> {
    let mut name = Name::from_str(domain)?;
    name.set_fqdn(true);
    let mut message = Message::new();
    message
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, record_type));
    Ok(message)
}

/// NOERROR response echoing the question, with no answers.
pub(crate) fn empty_response(request: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .add_queries(request.queries().iter().cloned());
    response
}
