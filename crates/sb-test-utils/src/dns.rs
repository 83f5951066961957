//! Mock DNS transport
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use parking_lot::Mutex;
use sb_core::dns::DnsTransport;
use sb_core::DnsError;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Raw transport answering from a table; unknown names get `default`.
pub struct MockDnsTransport {
    tag: String,
    answers: Mutex<HashMap<String, Vec<IpAddr>>>,
    default: Vec<IpAddr>,
    ttl: u32,
    delay: Duration,
    fail: Option<DnsError>,
    calls: AtomicUsize,
}

impl MockDnsTransport {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            answers: Mutex::new(HashMap::new()),
            default: Vec::new(),
            ttl: 300,
            delay: Duration::ZERO,
            fail: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Answer every name not in the table with `addrs`.
    pub fn answering(mut self, addrs: &[&str]) -> Self {
        self.default = parse(addrs);
        self
    }

    pub fn with_answer(self, domain: &str, addrs: &[&str]) -> Self {
        self.answers.lock().insert(domain.to_string(), parse(addrs));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, error: DnsError) -> Self {
        self.fail = Some(error);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn parse(addrs: &[&str]) -> Vec<IpAddr> {
    addrs.iter().filter_map(|a| a.parse().ok()).collect()
}

#[async_trait]
impl DnsTransport for MockDnsTransport {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn exchange(&self, message: &Message) -> Result<Message, DnsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(e) = &self.fail {
            return Err(e.clone());
        }
        let query = message.queries().first().ok_or(DnsError::NoQuestion)?;
        let domain = query.name().to_ascii().trim_end_matches('.').to_string();
        let addrs = self.answers.lock().get(&domain).cloned().unwrap_or_else(|| self.default.clone());

        let mut response = Message::new();
        response
            .set_id(message.id())
            .set_message_type(MessageType::Response)
            .set_op_code(message.op_code())
            .set_recursion_desired(message.recursion_desired())
            .set_recursion_available(true)
            .add_queries(message.queries().iter().cloned());
        for ip in addrs {
            let rdata = match (ip, query.query_type()) {
                (IpAddr::V4(v4), RecordType::A) => RData::A(A(v4)),
                (IpAddr::V6(v6), RecordType::AAAA) => RData::AAAA(AAAA(v6)),
                _ => continue,
            };
            response.add_answer(Record::from_rdata(query.name().clone(), self.ttl, rdata));
        }
        Ok(response)
    }
}
