//! Rule items: single predicates over routing metadata.
//!
//! Items are built once from options and never fail at match time. Every
//! item knows which partition of a default rule it belongs to; the rule
//! evaluates partitions in a fixed order (see [`super::Conditions`]).

use super::{ClashModeState, WifiStateProvider};
use crate::error::RuleError;
use crate::router::geo::{DomainMatcher, DomainSet, GeoIp, GeoSite};
use crate::router::rule_set::RuleSet;
use hickory_proto::rr::RecordType;
use ipnet::IpNet;
use parking_lot::RwLock;
use regex::Regex;
use sb_config::QueryTypeValue;
use sb_types::{InboundContext, Network};
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Where an item is evaluated inside a default rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    SourceAddress,
    SourcePort,
    DestinationAddress,
    DestinationIpCidr,
    DestinationPort,
    Other,
}

/// Cached GeoSite category matchers; refreshed by `update`.
#[derive(Debug)]
pub struct GeositeItem {
    codes: Vec<String>,
    db: Arc<GeoSite>,
    matchers: RwLock<Vec<Arc<DomainSet>>>,
}

impl GeositeItem {
    pub fn new(codes: Vec<String>, db: Arc<GeoSite>) -> Result<Self, RuleError> {
        let item = Self {
            codes,
            db,
            matchers: RwLock::new(Vec::new()),
        };
        item.update()?;
        Ok(item)
    }

    /// Re-resolve every category against the current database contents.
    pub fn update(&self) -> Result<(), RuleError> {
        let mut matchers = Vec::with_capacity(self.codes.len());
        for code in &self.codes {
            let set = self.db.category(code).ok_or_else(|| RuleError::Load {
                path: format!("geosite:{code}"),
                source: anyhow::anyhow!("category not found"),
            })?;
            matchers.push(set);
        }
        *self.matchers.write() = matchers;
        Ok(())
    }

    fn matches(&self, domain: &str) -> bool {
        self.matchers.read().iter().any(|m| m.matches(domain))
    }
}

/// One predicate of a rule.
pub enum RuleItem {
    Inbound(Vec<String>),
    IpVersion(u8),
    QueryType(Vec<u16>),
    Network(Vec<Network>),
    AuthUser(Vec<String>),
    Protocol(Vec<String>),
    Domain {
        exact: Vec<String>,
        suffix: Vec<String>,
        matcher: DomainMatcher,
    },
    DomainKeyword(Vec<String>),
    DomainRegex(Vec<Regex>),
    Geosite(GeositeItem),
    GeoIp {
        source: bool,
        codes: Vec<String>,
        db: Option<Arc<GeoIp>>,
    },
    IpCidr {
        source: bool,
        raw: Vec<String>,
        nets: Vec<IpNet>,
    },
    IpIsPrivate {
        source: bool,
    },
    Port {
        source: bool,
        ports: Vec<u16>,
    },
    PortRange {
        source: bool,
        raw: Vec<String>,
        ranges: Vec<(u16, u16)>,
    },
    ProcessName(Vec<String>),
    ProcessPath(Vec<String>),
    PackageName(Vec<String>),
    User(Vec<String>),
    UserId(Vec<u32>),
    /// `any` matches every request issued by some outbound.
    Outbound(Vec<String>),
    ClashMode {
        mode: String,
        state: Arc<ClashModeState>,
    },
    WifiSsid {
        ssids: Vec<String>,
        wifi: Arc<dyn WifiStateProvider>,
    },
    WifiBssid {
        bssids: Vec<String>,
        wifi: Arc<dyn WifiStateProvider>,
    },
    RuleSet {
        tags: Vec<String>,
        sets: Vec<Arc<RuleSet>>,
        ip_cidr_match_source: bool,
    },
}

impl RuleItem {
    pub fn partition(&self) -> Partition {
        match self {
            Self::Domain { .. } | Self::DomainKeyword(_) | Self::DomainRegex(_) | Self::Geosite(_) => {
                Partition::DestinationAddress
            }
            Self::GeoIp { source, .. } | Self::IpCidr { source, .. } | Self::IpIsPrivate { source } => {
                if *source {
                    Partition::SourceAddress
                } else {
                    Partition::DestinationIpCidr
                }
            }
            Self::Port { source, .. } | Self::PortRange { source, .. } => {
                if *source {
                    Partition::SourcePort
                } else {
                    Partition::DestinationPort
                }
            }
            _ => Partition::Other,
        }
    }

    #[inline]
    pub fn is_rule_set(&self) -> bool {
        matches!(self, Self::RuleSet { .. })
    }

    pub fn is_process(&self) -> bool {
        matches!(
            self,
            Self::ProcessName(_) | Self::ProcessPath(_) | Self::PackageName(_)
        )
    }

    pub fn is_wifi(&self) -> bool {
        matches!(self, Self::WifiSsid { .. } | Self::WifiBssid { .. })
    }

    /// Whether this item needs resolved destination addresses.
    pub fn contains_destination_ip_cidr(&self) -> bool {
        match self {
            Self::RuleSet {
                sets,
                ip_cidr_match_source,
                ..
            } => !ip_cidr_match_source && sets.iter().any(|s| s.metadata().contains_ip_cidr_rule),
            other => other.partition() == Partition::DestinationIpCidr,
        }
    }

    pub fn update_geosite(&self) -> Result<(), RuleError> {
        if let Self::Geosite(item) = self {
            item.update()?;
        }
        Ok(())
    }

    pub fn matches(&self, m: &mut InboundContext) -> bool {
        match self {
            Self::Inbound(tags) => tags.iter().any(|t| *t == m.inbound),
            Self::IpVersion(v) => {
                (m.ip_version != 0 && m.ip_version == *v)
                    || m
                        .destination
                        .as_ref()
                        .and_then(|d| d.ip_addr())
                        .is_some_and(|ip| ip.is_ipv6() == (*v == 6))
            }
            Self::QueryType(types) => m.query_type != 0 && types.contains(&m.query_type),
            Self::Network(networks) => m.network.is_some_and(|n| networks.contains(&n)),
            Self::AuthUser(users) => !m.user.is_empty() && users.contains(&m.user),
            Self::Protocol(protocols) => !m.protocol.is_empty() && protocols.contains(&m.protocol),
            Self::Domain { matcher, .. } => m.match_domain().is_some_and(|d| matcher.matches(d)),
            Self::DomainKeyword(keywords) => m.match_domain().is_some_and(|d| {
                let d = d.to_ascii_lowercase();
                keywords.iter().any(|k| d.contains(k.as_str()))
            }),
            Self::DomainRegex(regexes) => m
                .match_domain()
                .is_some_and(|d| regexes.iter().any(|r| r.is_match(d))),
            Self::Geosite(item) => m.match_domain().is_some_and(|d| item.matches(d)),
            Self::GeoIp { source, codes, db } => {
                let check = |ip: IpAddr| {
                    codes.iter().any(|code| {
                        if code == "private" {
                            is_private_ip(ip)
                        } else {
                            db.as_ref()
                                .and_then(|db| db.lookup(ip))
                                .is_some_and(|cc| cc == *code)
                        }
                    })
                };
                addresses(m, *source).into_iter().any(check)
            }
            Self::IpCidr { source, nets, .. } => addresses(m, *source)
                .into_iter()
                .any(|ip| nets.iter().any(|n| n.contains(&ip))),
            Self::IpIsPrivate { source } => {
                addresses(m, *source).into_iter().any(is_private_ip)
            }
            Self::Port { source, ports } => port(m, *source).is_some_and(|p| ports.contains(&p)),
            Self::PortRange { source, ranges, .. } => port(m, *source)
                .is_some_and(|p| ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&p))),
            Self::ProcessName(names) => process_path(m)
                .and_then(|p| Path::new(p).file_name())
                .and_then(|n| n.to_str())
                .is_some_and(|n| names.iter().any(|x| x == n)),
            Self::ProcessPath(paths) => process_path(m).is_some_and(|p| paths.iter().any(|x| x == p)),
            Self::PackageName(names) => m
                .process_info
                .as_ref()
                .is_some_and(|p| !p.package_name.is_empty() && names.contains(&p.package_name)),
            Self::User(users) => m
                .process_info
                .as_ref()
                .is_some_and(|p| !p.user.is_empty() && users.contains(&p.user)),
            Self::UserId(ids) => m
                .process_info
                .as_ref()
                .and_then(|p| p.user_id)
                .is_some_and(|uid| ids.contains(&uid)),
            Self::Outbound(tags) => {
                !m.outbound.is_empty() && tags.iter().any(|t| t == "any" || *t == m.outbound)
            }
            Self::ClashMode { mode, state } => state.get().eq_ignore_ascii_case(mode),
            Self::WifiSsid { ssids, wifi } => {
                let state = wifi.wifi_state();
                !state.ssid.is_empty() && ssids.contains(&state.ssid)
            }
            Self::WifiBssid { bssids, wifi } => {
                let state = wifi.wifi_state();
                !state.bssid.is_empty()
                    && bssids.iter().any(|b| b.eq_ignore_ascii_case(&state.bssid))
            }
            Self::RuleSet {
                sets,
                ip_cidr_match_source,
                ..
            } => {
                // The referenced rules run against their own match cache so the
                // outer rule's partition flags and did-match stay untouched. A
                // set that matched on, say, source address therefore never
                // satisfies the outer rule's own source-address items.
                let saved_cache = m.cache;
                let saved_source = m.ip_cidr_match_source;
                m.ip_cidr_match_source = *ip_cidr_match_source;
                let matched = sets.iter().any(|set| set.matches(m));
                m.cache = saved_cache;
                m.ip_cidr_match_source = saved_source;
                matched
            }
        }
    }
}

fn addresses(m: &InboundContext, source: bool) -> Vec<IpAddr> {
    if source || m.ip_cidr_match_source {
        m.source.map(|s| s.ip()).into_iter().collect()
    } else {
        m.destination_ips()
    }
}

fn port(m: &InboundContext, source: bool) -> Option<u16> {
    if source {
        m.source.map(|s| s.port())
    } else {
        m.destination_port()
    }
}

fn process_path(m: &InboundContext) -> Option<&str> {
    m.process_info
        .as_ref()
        .map(|p| p.process_path.as_str())
        .filter(|p| !p.is_empty())
}

/// Non-public unicast space: RFC 1918 / ULA, loopback, link-local, CGNAT,
/// unspecified, broadcast and multicast.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_multicast()
                || (o[0] == 100 && (o[1] & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_ip(IpAddr::V4(v4));
            }
            let seg = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || (seg[0] & 0xfe00) == 0xfc00
                || (seg[0] & 0xffc0) == 0xfe80
        }
    }
}

pub(crate) fn parse_cidrs(raw: &[String]) -> Result<Vec<IpNet>, RuleError> {
    raw.iter()
        .map(|s| {
            let s = s.trim();
            s.parse::<IpNet>()
                .or_else(|_| s.parse::<IpAddr>().map(IpNet::from))
                .map_err(|_| RuleError::Cidr(s.to_string()))
        })
        .collect()
}

/// `"a:b"`, `":b"` (from 0) or `"a:"` (to 65535).
pub(crate) fn parse_port_range(raw: &str) -> Result<(u16, u16), RuleError> {
    let err = || RuleError::PortRange(raw.to_string());
    let (lo, hi) = raw.split_once(':').ok_or_else(err)?;
    let lo = if lo.is_empty() { 0 } else { lo.parse().map_err(|_| err())? };
    let hi = if hi.is_empty() { u16::MAX } else { hi.parse().map_err(|_| err())? };
    if lo > hi {
        return Err(err());
    }
    Ok((lo, hi))
}

pub(crate) fn parse_query_type(v: &QueryTypeValue) -> Result<u16, RuleError> {
    match v {
        QueryTypeValue::Code(code) => Ok(*code),
        QueryTypeValue::Name(name) => RecordType::from_str(&name.to_ascii_uppercase())
            .map(u16::from)
            .map_err(|_| RuleError::QueryType(name.clone())),
    }
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, name: &str, items: &[T]) -> fmt::Result {
    if items.len() == 1 {
        write!(f, "{name}={}", items[0])
    } else {
        write!(f, "{name}=[")?;
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{item}")?;
        }
        f.write_str("]")
    }
}

fn prefixed(source: bool, name: &str) -> String {
    if source {
        format!("source_{name}")
    } else {
        name.to_string()
    }
}

impl fmt::Display for RuleItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound(v) => write_list(f, "inbound", v),
            Self::IpVersion(v) => write!(f, "ip_version={v}"),
            Self::QueryType(v) => {
                let names: Vec<String> = v
                    .iter()
                    .map(|code| RecordType::from(*code).to_string())
                    .collect();
                write_list(f, "query_type", &names)
            }
            Self::Network(v) => write_list(f, "network", v),
            Self::AuthUser(v) => write_list(f, "auth_user", v),
            Self::Protocol(v) => write_list(f, "protocol", v),
            Self::Domain { exact, suffix, .. } => {
                if !exact.is_empty() {
                    write_list(f, "domain", exact)?;
                    if !suffix.is_empty() {
                        f.write_str(" ")?;
                    }
                }
                if !suffix.is_empty() {
                    write_list(f, "domain_suffix", suffix)?;
                }
                Ok(())
            }
            Self::DomainKeyword(v) => write_list(f, "domain_keyword", v),
            Self::DomainRegex(v) => {
                let patterns: Vec<&str> = v.iter().map(Regex::as_str).collect();
                write_list(f, "domain_regex", &patterns)
            }
            Self::Geosite(item) => write_list(f, "geosite", &item.codes),
            Self::GeoIp { source, codes, .. } => write_list(f, &prefixed(*source, "geoip"), codes),
            Self::IpCidr { source, raw, .. } => write_list(f, &prefixed(*source, "ip_cidr"), raw),
            Self::IpIsPrivate { source } => write!(f, "{}=true", prefixed(*source, "ip_is_private")),
            Self::Port { source, ports } => write_list(f, &prefixed(*source, "port"), ports),
            Self::PortRange { source, raw, .. } => {
                write_list(f, &prefixed(*source, "port_range"), raw)
            }
            Self::ProcessName(v) => write_list(f, "process_name", v),
            Self::ProcessPath(v) => write_list(f, "process_path", v),
            Self::PackageName(v) => write_list(f, "package_name", v),
            Self::User(v) => write_list(f, "user", v),
            Self::UserId(v) => write_list(f, "user_id", v),
            Self::Outbound(v) => write_list(f, "outbound", v),
            Self::ClashMode { mode, .. } => write!(f, "clash_mode={mode}"),
            Self::WifiSsid { ssids, .. } => write_list(f, "wifi_ssid", ssids),
            Self::WifiBssid { bssids, .. } => write_list(f, "wifi_bssid", bssids),
            Self::RuleSet { tags, .. } => write_list(f, "rule_set", tags),
        }
    }
}

impl fmt::Debug for RuleItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RuleItem({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_types::{Destination, ProcessInfo};

    fn ctx_to(dest: Destination) -> InboundContext {
        let mut m = InboundContext::new("mixed-in", Network::Tcp);
        m.destination = Some(dest);
        m
    }

    #[test]
    fn private_ranges() {
        for ip in ["10.0.0.1", "192.168.1.1", "127.0.0.1", "100.64.0.1", "fd00::1", "fe80::1", "::ffff:10.1.1.1"] {
            assert!(is_private_ip(ip.parse().unwrap()), "{ip}");
        }
        for ip in ["8.8.8.8", "100.128.0.1", "2001:4860::8888"] {
            assert!(!is_private_ip(ip.parse().unwrap()), "{ip}");
        }
    }

    #[test]
    fn port_range_forms() {
        assert_eq!(parse_port_range("1000:2000").unwrap(), (1000, 2000));
        assert_eq!(parse_port_range(":80").unwrap(), (0, 80));
        assert_eq!(parse_port_range("8000:").unwrap(), (8000, 65535));
        assert!(parse_port_range("80").is_err());
        assert!(parse_port_range("90:80").is_err());
    }

    #[test]
    fn query_type_by_name_or_code() {
        assert_eq!(parse_query_type(&QueryTypeValue::Name("aaaa".into())).unwrap(), 28);
        assert_eq!(parse_query_type(&QueryTypeValue::Code(65)).unwrap(), 65);
        assert!(parse_query_type(&QueryTypeValue::Name("nope".into())).is_err());
    }

    #[test]
    fn ip_cidr_source_switch() {
        let item = RuleItem::IpCidr {
            source: false,
            raw: vec!["10.0.0.0/8".into()],
            nets: parse_cidrs(&["10.0.0.0/8".to_string()]).unwrap(),
        };
        let mut m = ctx_to(Destination::ip("1.1.1.1".parse().unwrap(), 443));
        m.source = Some("10.1.2.3:5555".parse().unwrap());
        assert!(!item.matches(&mut m));
        m.ip_cidr_match_source = true;
        assert!(item.matches(&mut m));
    }

    #[test]
    fn process_name_uses_basename() {
        let item = RuleItem::ProcessName(vec!["curl".into()]);
        let mut m = InboundContext::default();
        assert!(!item.matches(&mut m));
        m.process_info = Some(ProcessInfo {
            process_path: "/usr/bin/curl".into(),
            ..Default::default()
        });
        assert!(item.matches(&mut m));
    }

    #[test]
    fn outbound_any() {
        let item = RuleItem::Outbound(vec!["any".into()]);
        let mut m = InboundContext::default();
        assert!(!item.matches(&mut m));
        m.outbound = "proxy".into();
        assert!(item.matches(&mut m));
    }

    #[test]
    fn ip_version_from_destination() {
        let item = RuleItem::IpVersion(6);
        let mut m = ctx_to(Destination::ip("::1".parse().unwrap(), 80));
        assert!(item.matches(&mut m));
        let mut m = ctx_to(Destination::domain("example.com", 80));
        assert!(!item.matches(&mut m));
        m.ip_version = 6;
        assert!(item.matches(&mut m));
    }

    #[test]
    fn display_forms() {
        assert_eq!(RuleItem::Port { source: false, ports: vec![80, 443] }.to_string(), "port=[80 443]");
        assert_eq!(RuleItem::IpIsPrivate { source: true }.to_string(), "source_ip_is_private=true");
        assert_eq!(RuleItem::QueryType(vec![28]).to_string(), "query_type=AAAA");
        let domain = RuleItem::Domain {
            exact: vec!["a.com".into()],
            suffix: vec!["b.com".into(), "c.com".into()],
            matcher: DomainMatcher::default(),
        };
        assert_eq!(domain.to_string(), "domain=a.com domain_suffix=[b.com c.com]");
    }
}
