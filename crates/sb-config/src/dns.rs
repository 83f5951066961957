//! DNS options / DNS 配置
use crate::rule::DnsRuleOptions;
use sb_types::DomainStrategy;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsServerOptions {
    pub tag: String,
    /// Transport address, interpreted by the external transport layer.
    pub address: String,
    /// Strategy used when this transport answers lookups; falls back to the global one.
    pub strategy: Option<DomainStrategy>,
    pub detour: String,
    /// Marks the transport as a FakeIP issuer.
    pub fakeip: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsOptions {
    pub servers: Vec<DnsServerOptions>,
    pub rules: Vec<DnsRuleOptions>,
    /// Default transport tag; the first server when empty.
    #[serde(rename = "final")]
    pub final_server: String,
    pub strategy: DomainStrategy,
    pub disable_cache: bool,
    pub disable_expire: bool,
    pub independent_cache: bool,
    pub reverse_mapping: bool,
    pub client_subnet: Option<IpAddr>,
    /// Maximum cached responses.
    pub cache_capacity: usize,
}

impl Default for DnsOptions {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            rules: Vec::new(),
            final_server: String::new(),
            strategy: DomainStrategy::AsIs,
            disable_cache: false,
            disable_expire: false,
            independent_cache: false,
            reverse_mapping: false,
            client_subnet: None,
            cache_capacity: 1024,
        }
    }
}
