//! Address → domain mapping fed by successful exchanges.
//! 地址到域名的反向映射
//!
//! Entries expire with the TTL of the answer record that produced them, so a
//! stale address never reports a domain longer than the upstream allowed.

use super::fqdn_to_domain;
use hickory_proto::op::Message;
use hickory_proto::rr::RData;
use lru::LruCache;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_CAPACITY: usize = 1024;

struct Entry {
    domain: String,
    expires_at: Instant,
}

pub struct ReverseMapping {
    entries: Mutex<LruCache<IpAddr, Entry>>,
}

impl Default for ReverseMapping {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ReverseMapping {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Record every A/AAAA answer of `response` under its question name.
    pub fn save(&self, response: &Message) {
        let Some(question) = response.queries().first() else {
            return;
        };
        let domain = fqdn_to_domain(question.name());
        let now = Instant::now();
        let mut entries = self.entries.lock();
        for record in response.answers() {
            let ip = match record.data() {
                Some(RData::A(a)) => IpAddr::V4(a.0),
                Some(RData::AAAA(aaaa)) => IpAddr::V6(aaaa.0),
                _ => continue,
            };
            entries.put(
                ip,
                Entry {
                    domain: domain.clone(),
                    expires_at: now + Duration::from_secs(u64::from(record.ttl())),
                },
            );
        }
    }

    pub fn query(&self, ip: IpAddr) -> Option<String> {
        let mut entries = self.entries.lock();
        let entry = entries.get(&ip)?;
        if entry.expires_at <= Instant::now() {
            entries.pop(&ip);
            return None;
        }
        Some(entry.domain.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::new_query;
    use crate::dns::tests::answer;
    use hickory_proto::rr::RecordType;

    #[tokio::test(start_paused = true)]
    async fn expires_with_ttl() {
        let mapping = ReverseMapping::default();
        let q = new_query("www.example.com", RecordType::A).unwrap();
        let ip: IpAddr = "93.184.216.34".parse().unwrap();
        mapping.save(&answer(&q, &[ip], 30));
        assert_eq!(mapping.query(ip).as_deref(), Some("www.example.com"));
        assert_eq!(mapping.query("1.1.1.1".parse().unwrap()), None);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(mapping.query(ip), None);
        assert!(mapping.is_empty());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mapping = ReverseMapping::new(1);
        let q = new_query("a.test", RecordType::AAAA).unwrap();
        mapping.save(&answer(&q, &["::1".parse().unwrap(), "::2".parse().unwrap()], 60));
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.query("::2".parse().unwrap()).as_deref(), Some("a.test"));
    }
}
