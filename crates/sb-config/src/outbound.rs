//! Outbound 配置模型
//!
//! Only the outbounds the decision core constructs itself are modeled:
//! direct (racing dialer), block, and the selector / relay groups. Proxy
//! protocol outbounds are registered by their own crates.
use crate::de::{duration, Listable};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum OutboundOptions {
    /// 直连
    Direct(DirectOptions),
    /// 拒绝
    Block(BlockOptions),
    /// 手动选择器
    Selector(SelectorOptions),
    /// 链式代理
    Relay(RelayOptions),
}

impl OutboundOptions {
    pub fn tag(&self) -> &str {
        match self {
            Self::Direct(o) => &o.tag,
            Self::Block(o) => &o.tag,
            Self::Selector(o) => &o.tag,
            Self::Relay(o) => &o.tag,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Direct(_) => "direct",
            Self::Block(_) => "block",
            Self::Selector(_) => "selector",
            Self::Relay(_) => "relay",
        }
    }
}

/// Socket options applied by the racing dialer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialerOptions {
    /// Dial through another outbound instead of the system stack.
    pub detour: String,
    pub bind_interface: String,
    pub inet4_bind_address: Option<Ipv4Addr>,
    pub inet6_bind_address: Option<Ipv6Addr>,
    /// SO_MARK (Linux only).
    pub routing_mark: u32,
    #[serde(with = "duration")]
    pub connect_timeout: Option<Duration>,
    pub tcp_fast_open: bool,
    pub tcp_multi_path: bool,
    /// `Some(false)` disables IP fragmentation on UDP sockets.
    pub udp_fragment: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectOptions {
    pub tag: String,
    #[serde(flatten)]
    pub dialer: DialerOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockOptions {
    pub tag: String,
}

/// Membership shared by group outbounds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupOutboundOptions {
    pub outbounds: Listable<String>,
    #[serde(alias = "uses")]
    pub providers: Listable<String>,
    /// Provider outbound tags must match at least one of these patterns.
    pub includes: Listable<String>,
    /// Provider outbound tags matching this pattern are dropped.
    pub excludes: String,
    /// Provider outbound types to keep.
    pub types: Listable<String>,
    /// Provider outbound server ports to keep: "443" or "1000:2000".
    pub ports: Listable<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorOptions {
    pub tag: String,
    #[serde(flatten)]
    pub group: GroupOutboundOptions,
    pub default: String,
    pub interrupt_exist_connections: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayOptions {
    pub tag: String,
    pub outbounds: Listable<String>,
    pub interrupt_exist_connections: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_with_uses_alias() {
        let o: OutboundOptions = serde_json::from_str(
            r#"{"type":"selector","tag":"sel","uses":["P"],"ports":"80","default":"a"}"#,
        )
        .unwrap();
        let OutboundOptions::Selector(s) = o else {
            panic!("expected selector")
        };
        assert_eq!(s.tag, "sel");
        assert_eq!(s.group.providers.0, vec!["P"]);
        assert_eq!(s.group.ports.0, vec!["80"]);
        assert_eq!(s.default, "a");
    }

    #[test]
    fn direct_with_dialer_fields() {
        let o: OutboundOptions = serde_json::from_str(
            r#"{"type":"direct","tag":"d","routing_mark":255,"connect_timeout":"3s","udp_fragment":false}"#,
        )
        .unwrap();
        let OutboundOptions::Direct(d) = o else {
            panic!("expected direct")
        };
        assert_eq!(d.dialer.routing_mark, 255);
        assert_eq!(d.dialer.connect_timeout, Some(Duration::from_secs(3)));
        assert_eq!(d.dialer.udp_fragment, Some(false));
    }
}
