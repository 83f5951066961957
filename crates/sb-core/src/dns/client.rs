//! DNS client: caching and per-request policy in front of a transport.
//!
//! Every transport answer is cached under (transport, name, type, class), so
//! a fallback re-query or the next rule's transport always asks its own
//! server. The answer the router settles on is published to a shared entry
//! keyed by question alone ([`DnsClient::commit_exchange`],
//! [`DnsClient::commit_lookup`]); that layer is off when `independent_cache`
//! is set. Cached TTLs count down unless `disable_expire` is set. A response
//! rejected by an address-limit check is remembered per transport, so the
//! next identical check fails fast with [`DnsError::ResponseRejectedCached`].

use super::{
    empty_response, message_addresses, min_ttl, new_query, DnsQueryOptions, DnsTransport,
    DEFAULT_TTL,
};
use crate::error::DnsError;
use hickory_proto::op::{Edns, Message, Query, ResponseCode};
use hickory_proto::rr::rdata::opt::EdnsOption;
use hickory_proto::rr::{DNSClass, Record, RecordType};
use lru::LruCache;
use parking_lot::Mutex;
use sb_config::DnsOptions;
use sb_types::DomainStrategy;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

const EDNS_CLIENT_SUBNET: u16 = 8;
const REJECTED_CAPACITY: usize = 1024;
/// Transport slot of the shared, router-level entries.
const SHARED: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsClientOptions {
    pub disable_cache: bool,
    pub disable_expire: bool,
    pub independent_cache: bool,
    pub cache_capacity: usize,
}

impl Default for DnsClientOptions {
    fn default() -> Self {
        Self {
            disable_cache: false,
            disable_expire: false,
            independent_cache: false,
            cache_capacity: 1024,
        }
    }
}

impl From<&DnsOptions> for DnsClientOptions {
    fn from(o: &DnsOptions) -> Self {
        Self {
            disable_cache: o.disable_cache,
            disable_expire: o.disable_expire,
            independent_cache: o.independent_cache,
            cache_capacity: o.cache_capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    transport: String,
    name: String,
    qtype: u16,
    qclass: u16,
}

impl CacheKey {
    fn new(transport: &str, query: &Query) -> Self {
        Self {
            transport: transport.to_string(),
            name: query.name().to_ascii().to_ascii_lowercase(),
            qtype: u16::from(query.query_type()),
            qclass: u16::from(query.query_class()),
        }
    }
}

#[derive(Clone)]
struct CachedResponse {
    message: Message,
    stored_at: Instant,
    expires_at: Instant,
}

pub struct DnsClient {
    options: DnsClientOptions,
    cache: Option<Mutex<LruCache<CacheKey, CachedResponse>>>,
    rejected: Mutex<LruCache<CacheKey, Instant>>,
}

impl DnsClient {
    pub fn new(options: DnsClientOptions) -> Self {
        let capacity = NonZeroUsize::new(options.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        let rejected = NonZeroUsize::new(REJECTED_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: (!options.disable_cache).then(|| Mutex::new(LruCache::new(capacity))),
            rejected: Mutex::new(LruCache::new(rejected)),
            options,
        }
    }

    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.lock().clear();
        }
        self.rejected.lock().clear();
    }

    fn shared_enabled(&self) -> bool {
        !self.options.independent_cache && self.cache.is_some()
    }

    /// Publish `transport`'s cached answer to `query` as the shared answer.
    fn promote(&self, transport: &str, query: &Query) {
        if !self.shared_enabled() {
            return;
        }
        let Some(cache) = &self.cache else { return };
        let mut cache = cache.lock();
        let Some(entry) = cache.peek(&CacheKey::new(transport, query)).cloned() else {
            return;
        };
        cache.put(CacheKey::new(SHARED, query), entry);
    }

    /// Make `transport`'s answer to `message` the one [`Self::exchange_cache`] serves.
    pub fn commit_exchange(&self, transport: &str, message: &Message) {
        if let Some(query) = message.queries().first() {
            self.promote(transport, query);
        }
    }

    /// Make `transport`'s answers for `domain` the ones [`Self::lookup_cache`] serves.
    pub fn commit_lookup(&self, transport: &str, domain: &str, strategy: DomainStrategy) {
        for record_type in record_types(strategy) {
            let Ok(query) = new_query(domain, record_type) else { continue };
            if let Some(question) = query.queries().first() {
                self.promote(transport, question);
            }
        }
    }

    fn load_cached(&self, key: &CacheKey, id: u16) -> Option<Message> {
        let cache = self.cache.as_ref()?;
        let mut cache = cache.lock();
        let now = Instant::now();
        let entry = cache.get(key)?;
        if !self.options.disable_expire && entry.expires_at <= now {
            cache.pop(key);
            return None;
        }
        let mut message = entry.message.clone();
        message.set_id(id);
        if !self.options.disable_expire {
            let elapsed = now.saturating_duration_since(entry.stored_at).as_secs() as u32;
            adjust_ttl(&mut message, |ttl| ttl.saturating_sub(elapsed));
        }
        Some(message)
    }

    fn store(&self, key: CacheKey, message: &Message) {
        let Some(cache) = &self.cache else { return };
        let ttl = min_ttl(message).unwrap_or(DEFAULT_TTL);
        let now = Instant::now();
        cache.lock().put(
            key,
            CachedResponse {
                message: message.clone(),
                stored_at: now,
                expires_at: now + Duration::from_secs(u64::from(ttl)),
            },
        );
    }

    fn is_rejected(&self, key: &CacheKey) -> bool {
        let mut rejected = self.rejected.lock();
        match rejected.get(key) {
            Some(expires_at) if *expires_at > Instant::now() => true,
            Some(_) => {
                rejected.pop(key);
                false
            }
            None => false,
        }
    }

    /// Committed answer for `message`, shared across transports.
    pub fn exchange_cache(&self, message: &Message) -> Option<Message> {
        if !self.shared_enabled() {
            return None;
        }
        let query = message.queries().first()?;
        self.load_cached(&CacheKey::new(SHARED, query), message.id())
    }

    /// Committed addresses for `domain` under `strategy`, shared across transports.
    pub fn lookup_cache(&self, domain: &str, strategy: DomainStrategy) -> Option<Vec<IpAddr>> {
        if !self.shared_enabled() {
            return None;
        }
        let mut addrs = Vec::new();
        for record_type in record_types(strategy) {
            let query = new_query(domain, record_type).ok()?;
            let question = query.queries().first()?;
            let cached = self.load_cached(&CacheKey::new(SHARED, question), query.id())?;
            addrs.extend(message_addresses(&cached));
        }
        Some(strategy.sort_addresses(addrs))
    }

    pub async fn exchange(
        &self,
        transport: &dyn DnsTransport,
        message: &Message,
        options: &DnsQueryOptions,
        checker: Option<&(dyn Fn(&[IpAddr]) -> bool + Send + Sync)>,
    ) -> Result<Message, DnsError> {
        let question = message.queries().first().cloned().ok_or(DnsError::NoQuestion)?;
        let qtype = question.query_type();
        if (qtype == RecordType::A && options.strategy == DomainStrategy::Ipv6Only)
            || (qtype == RecordType::AAAA && options.strategy == DomainStrategy::Ipv4Only)
        {
            return Ok(empty_response(message));
        }

        let mut request = message.clone();
        if let Some(subnet) = options.client_subnet {
            set_client_subnet(&mut request, subnet);
        }
        let key = CacheKey::new(transport.tag(), &question);
        let cacheable = question.query_class() == DNSClass::IN && !options.disable_cache;
        if cacheable {
            if let Some(response) = self.load_cached(&key, message.id()) {
                tracing::trace!(target: "sb_core::dns", transport = %transport.tag(), question = %question, "cached");
                if checker.is_some_and(|check| !check(&message_addresses(&response))) {
                    return Err(DnsError::ResponseRejectedCached);
                }
                return Ok(response);
            }
        }
        if checker.is_some() && self.is_rejected(&key) {
            return Err(DnsError::ResponseRejectedCached);
        }

        let mut response = transport.exchange(&request).await?;

        if let Some(check) = checker {
            let addrs = message_addresses(&response);
            if !check(&addrs) {
                let ttl = min_ttl(&response).unwrap_or(DEFAULT_TTL);
                self.rejected
                    .lock()
                    .put(key, Instant::now() + Duration::from_secs(u64::from(ttl)));
                return Err(DnsError::ResponseRejected);
            }
        }
        if let Some(ttl) = options.rewrite_ttl {
            adjust_ttl(&mut response, |_| ttl);
        }
        response.set_id(message.id());
        if cacheable && response.response_code() == ResponseCode::NoError {
            self.store(key, &response);
        }
        Ok(response)
    }

    /// Resolve `domain` to addresses, querying A and/or AAAA per strategy.
    pub async fn lookup(
        &self,
        transport: &dyn DnsTransport,
        domain: &str,
        options: &DnsQueryOptions,
        checker: Option<&(dyn Fn(&[IpAddr]) -> bool + Send + Sync)>,
    ) -> Result<Vec<IpAddr>, DnsError> {
        if let Ok(ip) = domain.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        if !transport.is_raw() {
            let addrs = transport.lookup(domain, options.strategy).await?;
            if checker.is_some_and(|check| !check(&addrs)) {
                return Err(DnsError::ResponseRejected);
            }
            return Ok(addrs);
        }
        let one = |record_type| self.lookup_type(transport, domain, record_type, options, checker);
        match options.strategy {
            DomainStrategy::Ipv4Only => one(RecordType::A).await,
            DomainStrategy::Ipv6Only => one(RecordType::AAAA).await,
            strategy => {
                let (v4, v6) = tokio::join!(one(RecordType::A), one(RecordType::AAAA));
                let addrs = match (v4, v6) {
                    (Err(e), Err(_)) => return Err(e),
                    (Ok(a), Err(_)) | (Err(_), Ok(a)) => a,
                    (Ok(mut a), Ok(b)) => {
                        a.extend(b);
                        a
                    }
                };
                Ok(strategy.sort_addresses(addrs))
            }
        }
    }

    async fn lookup_type(
        &self,
        transport: &dyn DnsTransport,
        domain: &str,
        record_type: RecordType,
        options: &DnsQueryOptions,
        checker: Option<&(dyn Fn(&[IpAddr]) -> bool + Send + Sync)>,
    ) -> Result<Vec<IpAddr>, DnsError> {
        let query = new_query(domain, record_type)?;
        let response = self.exchange(transport, &query, options, checker).await?;
        match response.response_code() {
            ResponseCode::NoError => Ok(message_addresses(&response)),
            ResponseCode::NXDomain => Err(DnsError::NameError),
            other => Err(DnsError::Transport(format!("response code {other}"))),
        }
    }
}

fn record_types(strategy: DomainStrategy) -> Vec<RecordType> {
    let mut types = Vec::with_capacity(2);
    if strategy.wants_ipv4() {
        types.push(RecordType::A);
    }
    if strategy.wants_ipv6() {
        types.push(RecordType::AAAA);
    }
    types
}

fn adjust_ttl(message: &mut Message, f: impl Fn(u32) -> u32) {
    let fix = |records: Vec<Record>| -> Vec<Record> {
        records
            .into_iter()
            .map(|mut r| {
                let ttl = f(r.ttl());
                r.set_ttl(ttl);
                r
            })
            .collect()
    };
    let answers = fix(message.take_answers());
    let authority = fix(message.take_name_servers());
    let additionals = fix(message.take_additionals());
    message.insert_answers(answers);
    message.insert_name_servers(authority);
    message.insert_additionals(additionals);
}

/// EDNS Client Subnet (RFC 7871) carrying the full address.
fn set_client_subnet(message: &mut Message, subnet: IpAddr) {
    let (family, prefix, addr): (u16, u8, Vec<u8>) = match subnet {
        IpAddr::V4(v4) => (1, 32, v4.octets().to_vec()),
        IpAddr::V6(v6) => (2, 128, v6.octets().to_vec()),
    };
    let mut data = Vec::with_capacity(4 + addr.len());
    data.extend_from_slice(&family.to_be_bytes());
    data.push(prefix);
    data.push(0);
    data.extend_from_slice(&addr);
    let mut edns = message.extensions().clone().unwrap_or_else(Edns::new);
    edns.options_mut()
        .insert(EdnsOption::Unknown(EDNS_CLIENT_SUBNET, data));
    message.set_edns(edns);
}
