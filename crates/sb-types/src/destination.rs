//! Destination addresses and domain resolution strategies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Destination that is either an unresolved domain or a concrete socket address.
///
/// Domains are kept as-is until routing decides to resolve them.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// Domain name (not yet resolved).
    Domain(String, u16),
    /// IPv4/IPv6 socket address.
    Socket(SocketAddr),
}

impl Destination {
    #[inline]
    pub fn domain(host: impl Into<String>, port: u16) -> Self {
        Self::Domain(host.into(), port)
    }

    #[inline]
    pub fn ip(ip: IpAddr, port: u16) -> Self {
        Self::Socket(SocketAddr::new(ip, port))
    }

    #[inline]
    pub fn port(&self) -> u16 {
        match self {
            Self::Domain(_, port) => *port,
            Self::Socket(addr) => addr.port(),
        }
    }

    /// Host as text (domain or IP literal).
    pub fn host(&self) -> String {
        match self {
            Self::Domain(domain, _) => domain.clone(),
            Self::Socket(addr) => addr.ip().to_string(),
        }
    }

    #[inline]
    pub fn is_domain(&self) -> bool {
        matches!(self, Self::Domain(..))
    }

    /// IP address when the destination is already resolved.
    #[inline]
    pub fn ip_addr(&self) -> Option<IpAddr> {
        match self {
            Self::Domain(..) => None,
            Self::Socket(addr) => Some(addr.ip()),
        }
    }

    /// Replace the host with a domain, keeping the port.
    pub fn with_domain(&self, domain: impl Into<String>) -> Self {
        Self::Domain(domain.into(), self.port())
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain(host, port) => write!(f, "{}:{}", host, port),
            Self::Socket(addr) => write!(f, "{}", addr),
        }
    }
}

impl From<SocketAddr> for Destination {
    fn from(addr: SocketAddr) -> Self {
        Self::Socket(addr)
    }
}

impl From<(&str, u16)> for Destination {
    fn from((host, port): (&str, u16)) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Self::ip(ip, port),
            Err(_) => Self::Domain(host.to_string(), port),
        }
    }
}

/// Which address families to resolve and in what order to prefer them.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStrategy {
    #[default]
    #[serde(alias = "")]
    AsIs,
    PreferIpv4,
    PreferIpv6,
    Ipv4Only,
    Ipv6Only,
}

impl DomainStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AsIs => "as_is",
            Self::PreferIpv4 => "prefer_ipv4",
            Self::PreferIpv6 => "prefer_ipv6",
            Self::Ipv4Only => "ipv4_only",
            Self::Ipv6Only => "ipv6_only",
        }
    }

    /// Whether A records are queried under this strategy.
    #[inline]
    pub fn wants_ipv4(&self) -> bool {
        !matches!(self, Self::Ipv6Only)
    }

    /// Whether AAAA records are queried under this strategy.
    #[inline]
    pub fn wants_ipv6(&self) -> bool {
        !matches!(self, Self::Ipv4Only)
    }

    /// Order addresses by the preferred family; `*Only` strategies drop the other family.
    pub fn sort_addresses(&self, mut addrs: Vec<IpAddr>) -> Vec<IpAddr> {
        match self {
            Self::AsIs => addrs,
            Self::PreferIpv4 => {
                addrs.sort_by_key(|a| !a.is_ipv4());
                addrs
            }
            Self::PreferIpv6 => {
                addrs.sort_by_key(|a| !a.is_ipv6());
                addrs
            }
            Self::Ipv4Only => addrs.into_iter().filter(IpAddr::is_ipv4).collect(),
            Self::Ipv6Only => addrs.into_iter().filter(IpAddr::is_ipv6).collect(),
        }
    }
}

impl fmt::Display for DomainStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DomainStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "as_is" => Ok(Self::AsIs),
            "prefer_ipv4" => Ok(Self::PreferIpv4),
            "prefer_ipv6" => Ok(Self::PreferIpv6),
            "ipv4_only" => Ok(Self::Ipv4Only),
            "ipv6_only" => Ok(Self::Ipv6Only),
            other => Err(format!("unknown domain strategy: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_display() {
        let domain = Destination::domain("example.com", 443);
        assert_eq!(domain.to_string(), "example.com:443");

        let socket = Destination::ip("127.0.0.1".parse().unwrap(), 8080);
        assert_eq!(socket.to_string(), "127.0.0.1:8080");
        assert_eq!(Destination::from(("10.0.0.1", 53)).ip_addr(), Some("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn strategy_sorting() {
        let v4: IpAddr = "1.1.1.1".parse().unwrap();
        let v6: IpAddr = "::1".parse().unwrap();
        assert_eq!(DomainStrategy::PreferIpv6.sort_addresses(vec![v4, v6]), vec![v6, v4]);
        assert_eq!(DomainStrategy::Ipv4Only.sort_addresses(vec![v6, v4]), vec![v4]);
        assert_eq!("prefer_ipv4".parse::<DomainStrategy>().unwrap(), DomainStrategy::PreferIpv4);
    }
}
