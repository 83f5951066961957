//! Rule option models shared by route rules, DNS rules and rule-sets.
//! 路由规则 / DNS 规则 / 规则集的配置模型。
use crate::de::Listable;
use serde::de::{DeserializeOwned, Error as DeError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::net::IpAddr;

pub const RULE_TYPE_DEFAULT: &str = "default";
pub const RULE_TYPE_LOGICAL: &str = "logical";
pub const LOGICAL_MODE_AND: &str = "and";
pub const LOGICAL_MODE_OR: &str = "or";

/// DNS query type written either by name ("AAAA") or by number (28).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryTypeValue {
    Code(u16),
    Name(String),
}

/// Condition items common to every default rule flavour.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConditions {
    pub inbound: Listable<String>,
    pub ip_version: u8,
    pub query_type: Listable<QueryTypeValue>,
    pub network: Listable<String>,
    pub auth_user: Listable<String>,
    pub protocol: Listable<String>,
    pub domain: Listable<String>,
    pub domain_suffix: Listable<String>,
    pub domain_keyword: Listable<String>,
    pub domain_regex: Listable<String>,
    pub geosite: Listable<String>,
    pub source_geoip: Listable<String>,
    pub geoip: Listable<String>,
    pub source_ip_cidr: Listable<String>,
    pub ip_cidr: Listable<String>,
    pub source_ip_is_private: bool,
    pub ip_is_private: bool,
    pub source_port: Listable<u16>,
    pub source_port_range: Listable<String>,
    pub port: Listable<u16>,
    pub port_range: Listable<String>,
    pub process_name: Listable<String>,
    pub process_path: Listable<String>,
    pub package_name: Listable<String>,
    pub user: Listable<String>,
    pub user_id: Listable<u32>,
    pub clash_mode: String,
    pub wifi_ssid: Listable<String>,
    pub wifi_bssid: Listable<String>,
    pub rule_set: Listable<String>,
    pub rule_set_ip_cidr_match_source: bool,
}

impl RuleConditions {
    /// True when at least one condition is configured.
    pub fn is_valid(&self) -> bool {
        *self != Self::default()
    }
}

/// Secondary condition consulted after the owning rule matched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackRuleOptions {
    pub match_all: bool,
    pub invert: bool,
    /// Replacement DNS server (DNS rules) or outbound (route rules).
    #[serde(alias = "outbound")]
    pub server: String,
    pub ip_cidr: Listable<String>,
    pub ip_is_private: bool,
    pub geoip: Listable<String>,
    pub rule_set: Listable<String>,
}

impl FallbackRuleOptions {
    pub fn is_valid(&self) -> bool {
        self.match_all
            || !self.ip_cidr.is_empty()
            || self.ip_is_private
            || !self.geoip.is_empty()
            || !self.rule_set.is_empty()
    }
}

/// Default route rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultRuleOptions {
    #[serde(flatten)]
    pub conditions: RuleConditions,
    pub invert: bool,
    pub outbound: String,
    pub tag: String,
    pub uuid: String,
    pub disabled: bool,
    pub skip_resolve: bool,
    pub fallback_rules: Vec<FallbackRuleOptions>,
}

/// Default DNS rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultDnsRuleOptions {
    #[serde(flatten)]
    pub conditions: RuleConditions,
    /// Matches the outbound that issued the query.
    pub outbound: Listable<String>,
    pub invert: bool,
    #[serde(alias = "servers")]
    pub server: Listable<String>,
    pub disable_cache: bool,
    pub rewrite_ttl: Option<u32>,
    pub client_subnet: Option<IpAddr>,
    pub tag: String,
    pub uuid: String,
    pub disabled: bool,
    pub fallback_rules: Vec<FallbackRuleOptions>,
}

/// Rule-set entry: conditions plus invert, no target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadlessDefaultOptions {
    #[serde(flatten)]
    pub conditions: RuleConditions,
    pub invert: bool,
}

/// Logical (and/or) combination of sub-rules of the same flavour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, bound(deserialize = "D: DeserializeOwned", serialize = "D: Serialize"))]
pub struct LogicalRuleOptions<D> {
    pub mode: String,
    pub rules: Vec<RuleOptions<D>>,
    pub invert: bool,
    pub outbound: String,
    #[serde(alias = "servers")]
    pub server: Listable<String>,
    pub disable_cache: bool,
    pub rewrite_ttl: Option<u32>,
    pub client_subnet: Option<IpAddr>,
    pub tag: String,
    pub uuid: String,
    pub disabled: bool,
    pub fallback_rules: Vec<FallbackRuleOptions>,
}

impl<D> Default for LogicalRuleOptions<D> {
    fn default() -> Self {
        Self {
            mode: String::new(),
            rules: Vec::new(),
            invert: false,
            outbound: String::new(),
            server: Listable::default(),
            disable_cache: false,
            rewrite_ttl: None,
            client_subnet: None,
            tag: String::new(),
            uuid: String::new(),
            disabled: false,
            fallback_rules: Vec::new(),
        }
    }
}

/// `{"type": "default" | "logical", ...}`; a missing type means default.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOptions<D> {
    Default(D),
    Logical(LogicalRuleOptions<D>),
}

pub type RouteRuleOptions = RuleOptions<DefaultRuleOptions>;
pub type DnsRuleOptions = RuleOptions<DefaultDnsRuleOptions>;
pub type HeadlessRuleOptions = RuleOptions<HeadlessDefaultOptions>;

impl<'de, D: DeserializeOwned> Deserialize<'de> for RuleOptions<D> {
    fn deserialize<De>(deserializer: De) -> Result<Self, De::Error>
    where
        De: Deserializer<'de>,
    {
        let mut value = serde_json::Value::deserialize(deserializer)?;
        let kind = match value.as_object_mut() {
            Some(obj) => match obj.remove("type") {
                None => String::new(),
                Some(serde_json::Value::String(s)) => s,
                Some(other) => {
                    return Err(De::Error::custom(format!("invalid rule type: {other}")))
                }
            },
            None => return Err(De::Error::custom("rule must be an object")),
        };
        match kind.as_str() {
            "" | RULE_TYPE_DEFAULT => serde_json::from_value(value)
                .map(RuleOptions::Default)
                .map_err(De::Error::custom),
            RULE_TYPE_LOGICAL => serde_json::from_value(value)
                .map(RuleOptions::Logical)
                .map_err(De::Error::custom),
            other => Err(De::Error::custom(format!("unknown rule type: {other}"))),
        }
    }
}

impl<D: Serialize> Serialize for RuleOptions<D> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let (kind, value) = match self {
            RuleOptions::Default(d) => (RULE_TYPE_DEFAULT, serde_json::to_value(d)),
            RuleOptions::Logical(l) => (RULE_TYPE_LOGICAL, serde_json::to_value(l)),
        };
        let mut value = value.map_err(serde::ser::Error::custom)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("type".into(), serde_json::Value::String(kind.into()));
        }
        value.serialize(serializer)
    }
}

/// Rule-set source declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSetOptions {
    pub tag: String,
    /// Only "local" sets are loaded by the core; remote fetching lives outside it.
    #[serde(rename = "type")]
    pub kind: String,
    /// "source" (JSON) or "binary".
    pub format: String,
    pub path: String,
}

/// Source-format rule-set file body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlainRuleSet {
    pub version: u8,
    pub rules: Vec<HeadlessRuleOptions>,
}
