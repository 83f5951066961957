//! Network kinds and sniffed protocol names.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport network a connection or datagram travels on.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }

    /// Both networks, in the order groups report them when nothing narrower is known.
    pub const ALL: [Network; 2] = [Network::Tcp, Network::Udp];
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(format!("unknown network: {other}")),
        }
    }
}

/// Application protocol names written into `InboundContext::protocol` by sniffers.
pub mod protocol {
    pub const HTTP: &str = "http";
    pub const TLS: &str = "tls";
    pub const QUIC: &str = "quic";
    pub const DNS: &str = "dns";
    pub const STUN: &str = "stun";
    pub const BITTORRENT: &str = "bittorrent";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        assert_eq!("TCP".parse::<Network>().unwrap(), Network::Tcp);
        assert_eq!(Network::Udp.to_string(), "udp");
        assert!("icmp".parse::<Network>().is_err());
    }
}
