//! Routing metadata passed through sniffing, rule matching and DNS resolution.
//!
//! An `InboundContext` is created at ingress, borrowed mutably by the rule
//! engine (which records per-partition match flags on it), and dropped once
//! routing completes. The match flags only live for one evaluation pass:
//! callers reset them before each independent rule.

use crate::{Destination, DomainStrategy, Network};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// Owning-process information attached by an external process searcher.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub process_path: String,
    pub package_name: String,
    pub user: String,
    pub user_id: Option<u32>,
}

/// Transient per-evaluation match cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RuleMatchCache {
    pub source_address_match: bool,
    pub source_port_match: bool,
    pub destination_address_match: bool,
    pub destination_port_match: bool,
    /// Set once any non-rule-set condition was evaluated.
    pub did_match: bool,
}

/// Per connection / per query routing metadata.
#[derive(Clone, Debug, Default)]
pub struct InboundContext {
    pub inbound: String,
    pub inbound_type: String,
    pub network: Option<Network>,
    pub source: Option<SocketAddr>,
    pub destination: Option<Destination>,
    /// Sniffed or queried domain; empty when unknown.
    pub domain: String,
    /// Sniffed application protocol; empty when unknown.
    pub protocol: String,
    /// Authenticated inbound user.
    pub user: String,
    /// Outbound tag that produced this request (for DNS rules).
    pub outbound: String,
    /// DNS query type of the question being routed (0 when not a DNS query).
    pub query_type: u16,
    /// 4 or 6 for A / AAAA questions, 0 otherwise.
    pub ip_version: u8,
    /// Resolved addresses checked after resolution (address-limit and fallback rules).
    pub destination_addresses: Vec<IpAddr>,
    pub process_info: Option<ProcessInfo>,
    pub domain_strategy: DomainStrategy,
    /// Set on metadata built for DNS fallback evaluation.
    pub dns_fallback: bool,

    /// Rule-set IP-CIDR items test the source address instead of the destination.
    pub ip_cidr_match_source: bool,
    /// DNS rules are evaluated before any destination address exists.
    pub ignore_destination_ip_cidr_match: bool,
    pub cache: RuleMatchCache,
}

impl InboundContext {
    pub fn new(inbound: impl Into<String>, network: Network) -> Self {
        Self {
            inbound: inbound.into(),
            network: Some(network),
            ..Default::default()
        }
    }

    /// Metadata used when checking resolved addresses against fallback rules.
    pub fn for_dns_fallback(addresses: Vec<IpAddr>) -> Self {
        Self {
            destination_addresses: addresses,
            dns_fallback: true,
            ..Default::default()
        }
    }

    /// Reset everything a previous rule evaluation may have recorded.
    pub fn reset_rule_cache(&mut self) {
        self.ip_cidr_match_source = false;
        self.reset_rule_match_cache();
    }

    /// Reset only the partition flags, as logical rules do between sub-rules.
    #[inline]
    pub fn reset_rule_match_cache(&mut self) {
        self.cache = RuleMatchCache::default();
    }

    /// Addresses the destination-IP predicates should look at.
    ///
    /// Resolved addresses win over the literal destination IP.
    pub fn destination_ips(&self) -> Vec<IpAddr> {
        if !self.destination_addresses.is_empty() {
            return self.destination_addresses.clone();
        }
        self.destination
            .as_ref()
            .and_then(Destination::ip_addr)
            .into_iter()
            .collect()
    }

    #[inline]
    pub fn destination_port(&self) -> Option<u16> {
        self.destination.as_ref().map(Destination::port)
    }

    /// Domain used for domain predicates: sniffed domain first, then a domain destination.
    pub fn match_domain(&self) -> Option<&str> {
        if !self.domain.is_empty() {
            return Some(&self.domain);
        }
        match &self.destination {
            Some(Destination::Domain(d, _)) => Some(d.as_str()),
            _ => None,
        }
    }
}
