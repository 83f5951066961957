//! Rule matching engine / 规则匹配引擎
//!
//! Route rules, DNS rules and rule-set (headless) rules share one evaluation
//! model:
//!
//! - A **default rule** holds condition items split into partitions: source
//!   address, source port, destination address, destination IP-CIDR,
//!   destination port, and "other". Items within a partition are OR'ed;
//!   partitions and "other" items are AND'ed.
//! - A **logical rule** combines sub-rules with `and` / `or`.
//!
//! Partition results are recorded on the metadata (`InboundContext::cache`)
//! so the evaluation order is observable. Callers reset the cache before
//! every independent rule.
//!
//! A rule carrying no items at all matches unconditionally, and so does a
//! rule whose evaluation never touched a non-rule-set item (did-match unset);
//! `invert` does not apply in either case.

use crate::error::RuleError;
use crate::router::geo::{DomainMatcher, GeoIp, GeoSite};
use crate::router::rule_set::RuleSet;
use parking_lot::RwLock;
use regex::Regex;
use sb_config::rule::{LOGICAL_MODE_AND, LOGICAL_MODE_OR};
use sb_config::{
    FallbackRuleOptions, HeadlessRuleOptions, LogicalRuleOptions, RouteRuleOptions,
    RuleConditions, RuleOptions,
};
use sb_types::{InboundContext, Network};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod dns;
pub mod fallback;
pub mod item;

pub use dns::DnsRule;
pub use fallback::{FallbackMatch, FallbackRule, FallbackRules};
pub use item::{is_private_ip, GeositeItem, Partition, RuleItem};

/// Runtime-switchable clash mode shared by every `clash_mode` item.
#[derive(Debug, Default)]
pub struct ClashModeState {
    mode: RwLock<String>,
}

impl ClashModeState {
    pub fn new(mode: impl Into<String>) -> Self {
        Self {
            mode: RwLock::new(mode.into()),
        }
    }

    pub fn get(&self) -> String {
        self.mode.read().clone()
    }

    pub fn set(&self, mode: impl Into<String>) {
        let mode = mode.into();
        tracing::info!(target: "sb_core::router::rule", mode = %mode, "clash mode changed");
        *self.mode.write() = mode;
    }
}

/// Current WiFi association as reported by the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WifiState {
    pub ssid: String,
    pub bssid: String,
}

/// Platform hook for WiFi items.
pub trait WifiStateProvider: Send + Sync {
    fn wifi_state(&self) -> WifiState;
}

/// Reports no WiFi association; WiFi items never match under it.
#[derive(Debug, Default)]
pub struct NoWifi;

impl WifiStateProvider for NoWifi {
    fn wifi_state(&self) -> WifiState {
        WifiState::default()
    }
}

/// Shared data and state handed to rule construction.
#[derive(Clone)]
pub struct RuleContext {
    pub geoip: Option<Arc<GeoIp>>,
    pub geosite: Option<Arc<GeoSite>>,
    pub rule_sets: HashMap<String, Arc<RuleSet>>,
    pub clash_mode: Arc<ClashModeState>,
    pub wifi: Arc<dyn WifiStateProvider>,
}

impl Default for RuleContext {
    fn default() -> Self {
        Self {
            geoip: None,
            geosite: None,
            rule_sets: HashMap::new(),
            clash_mode: Arc::new(ClashModeState::default()),
            wifi: Arc::new(NoWifi),
        }
    }
}

impl RuleContext {
    pub fn rule_set(&self, tag: &str) -> Result<Arc<RuleSet>, RuleError> {
        self.rule_sets
            .get(tag)
            .cloned()
            .ok_or_else(|| RuleError::RuleSetNotFound(tag.to_string()))
    }

    fn geoip_db(&self, codes: &[String]) -> Result<Option<Arc<GeoIp>>, RuleError> {
        if codes.iter().all(|c| c == "private") {
            return Ok(self.geoip.clone());
        }
        self.geoip.clone().map(Some).ok_or(RuleError::GeoNotLoaded("geoip"))
    }
}

/// Partitioned condition items of a default rule.
#[derive(Debug, Default)]
pub struct Conditions {
    source_address: Vec<RuleItem>,
    source_port: Vec<RuleItem>,
    destination_address: Vec<RuleItem>,
    destination_ip_cidr: Vec<RuleItem>,
    destination_port: Vec<RuleItem>,
    other: Vec<RuleItem>,
    descriptions: Vec<String>,
}

fn lower(v: &[String]) -> Vec<String> {
    v.iter().map(|s| s.to_ascii_lowercase()).collect()
}

impl Conditions {
    /// Build items in declaration order. `outbound` carries the DNS-rule
    /// `outbound` condition; route rules pass an empty slice.
    pub fn from_options(
        options: &RuleConditions,
        outbound: &[String],
        ctx: &RuleContext,
    ) -> Result<Self, RuleError> {
        let mut c = Conditions::default();
        let o = options;
        if !o.inbound.is_empty() {
            c.push(RuleItem::Inbound(o.inbound.0.clone()));
        }
        match o.ip_version {
            0 => {}
            4 | 6 => c.push(RuleItem::IpVersion(o.ip_version)),
            other => return Err(RuleError::IpVersion(other)),
        }
        if !o.query_type.is_empty() {
            let types = o
                .query_type
                .iter()
                .map(item::parse_query_type)
                .collect::<Result<Vec<_>, _>>()?;
            c.push(RuleItem::QueryType(types));
        }
        if !o.network.is_empty() {
            let networks = o
                .network
                .iter()
                .map(|n| n.parse::<Network>().map_err(|_| RuleError::Network(n.clone())))
                .collect::<Result<Vec<_>, _>>()?;
            c.push(RuleItem::Network(networks));
        }
        if !o.auth_user.is_empty() {
            c.push(RuleItem::AuthUser(o.auth_user.0.clone()));
        }
        if !o.protocol.is_empty() {
            c.push(RuleItem::Protocol(o.protocol.0.clone()));
        }
        if !o.domain.is_empty() || !o.domain_suffix.is_empty() {
            c.push(RuleItem::Domain {
                exact: o.domain.0.clone(),
                suffix: o.domain_suffix.0.clone(),
                matcher: DomainMatcher::new(&o.domain.0, &o.domain_suffix.0),
            });
        }
        if !o.domain_keyword.is_empty() {
            c.push(RuleItem::DomainKeyword(lower(&o.domain_keyword.0)));
        }
        if !o.domain_regex.is_empty() {
            let regexes = o
                .domain_regex
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|source| RuleError::Regex {
                        pattern: p.clone(),
                        source,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            c.push(RuleItem::DomainRegex(regexes));
        }
        if !o.geosite.is_empty() {
            let db = ctx.geosite.clone().ok_or(RuleError::GeoNotLoaded("geosite"))?;
            c.push(RuleItem::Geosite(GeositeItem::new(lower(&o.geosite.0), db)?));
        }
        if !o.source_geoip.is_empty() {
            let codes = lower(&o.source_geoip.0);
            let db = ctx.geoip_db(&codes)?;
            c.push(RuleItem::GeoIp { source: true, codes, db });
        }
        if !o.geoip.is_empty() {
            let codes = lower(&o.geoip.0);
            let db = ctx.geoip_db(&codes)?;
            c.push(RuleItem::GeoIp { source: false, codes, db });
        }
        if !o.source_ip_cidr.is_empty() {
            c.push(RuleItem::IpCidr {
                source: true,
                raw: o.source_ip_cidr.0.clone(),
                nets: item::parse_cidrs(&o.source_ip_cidr.0)?,
            });
        }
        if !o.ip_cidr.is_empty() {
            c.push(RuleItem::IpCidr {
                source: false,
                raw: o.ip_cidr.0.clone(),
                nets: item::parse_cidrs(&o.ip_cidr.0)?,
            });
        }
        if o.source_ip_is_private {
            c.push(RuleItem::IpIsPrivate { source: true });
        }
        if o.ip_is_private {
            c.push(RuleItem::IpIsPrivate { source: false });
        }
        if !o.source_port.is_empty() {
            c.push(RuleItem::Port { source: true, ports: o.source_port.0.clone() });
        }
        if !o.source_port_range.is_empty() {
            c.push(RuleItem::PortRange {
                source: true,
                raw: o.source_port_range.0.clone(),
                ranges: parse_ranges(&o.source_port_range.0)?,
            });
        }
        if !o.port.is_empty() {
            c.push(RuleItem::Port { source: false, ports: o.port.0.clone() });
        }
        if !o.port_range.is_empty() {
            c.push(RuleItem::PortRange {
                source: false,
                raw: o.port_range.0.clone(),
                ranges: parse_ranges(&o.port_range.0)?,
            });
        }
        if !o.process_name.is_empty() {
            c.push(RuleItem::ProcessName(o.process_name.0.clone()));
        }
        if !o.process_path.is_empty() {
            c.push(RuleItem::ProcessPath(o.process_path.0.clone()));
        }
        if !o.package_name.is_empty() {
            c.push(RuleItem::PackageName(o.package_name.0.clone()));
        }
        if !o.user.is_empty() {
            c.push(RuleItem::User(o.user.0.clone()));
        }
        if !o.user_id.is_empty() {
            c.push(RuleItem::UserId(o.user_id.0.clone()));
        }
        if !outbound.is_empty() {
            c.push(RuleItem::Outbound(outbound.to_vec()));
        }
        if !o.clash_mode.is_empty() {
            c.push(RuleItem::ClashMode {
                mode: o.clash_mode.clone(),
                state: ctx.clash_mode.clone(),
            });
        }
        if !o.wifi_ssid.is_empty() {
            c.push(RuleItem::WifiSsid {
                ssids: o.wifi_ssid.0.clone(),
                wifi: ctx.wifi.clone(),
            });
        }
        if !o.wifi_bssid.is_empty() {
            c.push(RuleItem::WifiBssid {
                bssids: o.wifi_bssid.0.clone(),
                wifi: ctx.wifi.clone(),
            });
        }
        if !o.rule_set.is_empty() {
            let sets = o
                .rule_set
                .iter()
                .map(|tag| ctx.rule_set(tag))
                .collect::<Result<Vec<_>, _>>()?;
            c.push(RuleItem::RuleSet {
                tags: o.rule_set.0.clone(),
                sets,
                ip_cidr_match_source: o.rule_set_ip_cidr_match_source,
            });
        }
        Ok(c)
    }

    /// Add an item to its partition; declaration order is kept for display.
    pub fn push(&mut self, item: RuleItem) {
        self.descriptions.push(item.to_string());
        match item.partition() {
            Partition::SourceAddress => self.source_address.push(item),
            Partition::SourcePort => self.source_port.push(item),
            Partition::DestinationAddress => self.destination_address.push(item),
            Partition::DestinationIpCidr => self.destination_ip_cidr.push(item),
            Partition::DestinationPort => self.destination_port.push(item),
            Partition::Other => self.other.push(item),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.descriptions.is_empty()
    }

    fn items(&self) -> impl Iterator<Item = &RuleItem> {
        self.source_address
            .iter()
            .chain(&self.source_port)
            .chain(&self.destination_address)
            .chain(&self.destination_ip_cidr)
            .chain(&self.destination_port)
            .chain(&self.other)
    }

    pub fn matches(&self, m: &mut InboundContext, invert: bool) -> bool {
        if self.is_empty() {
            return true;
        }

        if !self.source_address.is_empty() && !m.cache.source_address_match {
            m.cache.did_match = true;
            if any_match(&self.source_address, m) {
                m.cache.source_address_match = true;
            }
        }
        if !self.source_port.is_empty() && !m.cache.source_port_match {
            m.cache.did_match = true;
            if any_match(&self.source_port, m) {
                m.cache.source_port_match = true;
            }
        }
        if !self.destination_address.is_empty() && !m.cache.destination_address_match {
            m.cache.did_match = true;
            if any_match(&self.destination_address, m) {
                m.cache.destination_address_match = true;
            }
        }
        if !m.ignore_destination_ip_cidr_match
            && !self.destination_ip_cidr.is_empty()
            && !m.cache.destination_address_match
        {
            m.cache.did_match = true;
            if any_match(&self.destination_ip_cidr, m) {
                m.cache.destination_address_match = true;
            }
        }
        if !self.destination_port.is_empty() && !m.cache.destination_port_match {
            m.cache.did_match = true;
            if any_match(&self.destination_port, m) {
                m.cache.destination_port_match = true;
            }
        }

        for item in &self.other {
            if !item.is_rule_set() {
                m.cache.did_match = true;
            }
            if !item.matches(m) {
                return invert;
            }
        }

        if !self.source_address.is_empty() && !m.cache.source_address_match {
            return invert;
        }
        if !self.source_port.is_empty() && !m.cache.source_port_match {
            return invert;
        }
        let needs_address = !self.destination_address.is_empty()
            || (!m.ignore_destination_ip_cidr_match && !self.destination_ip_cidr.is_empty());
        if needs_address && !m.cache.destination_address_match {
            return invert;
        }
        if !self.destination_port.is_empty() && !m.cache.destination_port_match {
            return invert;
        }
        if !m.cache.did_match {
            return true;
        }
        !invert
    }

    pub fn contains_destination_ip_cidr(&self) -> bool {
        !self.destination_ip_cidr.is_empty()
            || self.other.iter().any(RuleItem::contains_destination_ip_cidr)
    }

    pub fn update_geosite(&self) -> Result<(), RuleError> {
        self.destination_address
            .iter()
            .try_for_each(RuleItem::update_geosite)
    }

    pub fn any_item(&self, pred: &dyn Fn(&RuleItem) -> bool) -> bool {
        self.items().any(pred)
    }
}

fn any_match(items: &[RuleItem], m: &mut InboundContext) -> bool {
    items.iter().any(|item| item.matches(m))
}

fn parse_ranges(raw: &[String]) -> Result<Vec<(u16, u16)>, RuleError> {
    raw.iter().map(|r| item::parse_port_range(r)).collect()
}

impl fmt::Display for Conditions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("match_all");
        }
        f.write_str(&self.descriptions.join(" "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalMode {
    And,
    Or,
}

impl LogicalMode {
    pub fn parse(mode: &str) -> Result<Self, RuleError> {
        match mode {
            LOGICAL_MODE_AND => Ok(Self::And),
            LOGICAL_MODE_OR => Ok(Self::Or),
            other => Err(RuleError::LogicalMode(other.to_string())),
        }
    }
}

#[derive(Debug)]
pub enum RuleBody {
    Default(Conditions),
    Logical { mode: LogicalMode, rules: Vec<Rule> },
}

/// A route, DNS or headless rule.
#[derive(Debug)]
pub struct Rule {
    body: RuleBody,
    invert: bool,
    tag: String,
    uuid: String,
    disabled: AtomicBool,
    outbound: String,
    skip_resolve: bool,
    fallback: FallbackRules,
}

impl Rule {
    /// Rule without target, used for headless rules and logical sub-rules.
    pub fn from_conditions(conditions: Conditions, invert: bool) -> Self {
        Self::new(RuleBody::Default(conditions), invert)
    }

    pub fn logical(mode: LogicalMode, rules: Vec<Rule>, invert: bool) -> Self {
        Self::new(RuleBody::Logical { mode, rules }, invert)
    }

    fn new(body: RuleBody, invert: bool) -> Self {
        Self {
            body,
            invert,
            tag: String::new(),
            uuid: uuid::Uuid::new_v4().to_string(),
            disabled: AtomicBool::new(false),
            outbound: String::new(),
            skip_resolve: false,
            fallback: FallbackRules::default(),
        }
    }

    fn with_meta(mut self, tag: &str, uuid: &str, disabled: bool) -> Self {
        self.tag = tag.to_string();
        if !uuid.is_empty() {
            self.uuid = uuid.to_string();
        }
        self.disabled = AtomicBool::new(disabled);
        self
    }

    pub(crate) fn with_fallback(mut self, fallback: FallbackRules) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn body(&self) -> &RuleBody {
        &self.body
    }

    pub fn invert(&self) -> bool {
        self.invert
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn outbound(&self) -> &str {
        &self.outbound
    }

    pub fn skip_resolve(&self) -> bool {
        self.skip_resolve
    }

    pub fn fallback(&self) -> &FallbackRules {
        &self.fallback
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }

    /// Flip the disabled flag, returning the new value.
    pub fn toggle(&self) -> bool {
        !self.disabled.fetch_xor(true, Ordering::Relaxed)
    }

    pub fn matches(&self, m: &mut InboundContext) -> bool {
        match &self.body {
            RuleBody::Default(conditions) => conditions.matches(m, self.invert),
            RuleBody::Logical { mode, rules } => {
                let matched = match mode {
                    LogicalMode::And => rules.iter().all(|rule| {
                        m.reset_rule_match_cache();
                        rule.matches(m)
                    }),
                    LogicalMode::Or => rules.iter().any(|rule| {
                        m.reset_rule_match_cache();
                        rule.matches(m)
                    }),
                };
                matched != self.invert
            }
        }
    }

    /// First fallback entry after `after` matching `m`.
    pub fn match_fallback(&self, m: &mut InboundContext, after: Option<usize>) -> Option<FallbackMatch> {
        self.fallback.match_fallback(m, after)
    }

    pub fn contains_destination_ip_cidr(&self) -> bool {
        match &self.body {
            RuleBody::Default(c) => c.contains_destination_ip_cidr(),
            RuleBody::Logical { rules, .. } => rules.iter().any(Rule::contains_destination_ip_cidr),
        }
    }

    pub fn update_geosite(&self) -> Result<(), RuleError> {
        match &self.body {
            RuleBody::Default(c) => c.update_geosite(),
            RuleBody::Logical { rules, .. } => rules.iter().try_for_each(Rule::update_geosite),
        }
    }

    pub fn any_item(&self, pred: &dyn Fn(&RuleItem) -> bool) -> bool {
        match &self.body {
            RuleBody::Default(c) => c.any_item(pred),
            RuleBody::Logical { rules, .. } => rules.iter().any(|r| r.any_item(pred)),
        }
    }

    fn describe_body(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            RuleBody::Default(c) => {
                if c.is_empty() {
                    f.write_str("match_all")
                } else if self.invert {
                    write!(f, "!({c})")
                } else {
                    write!(f, "{c}")
                }
            }
            RuleBody::Logical { mode, rules } => {
                let op = match mode {
                    LogicalMode::And => " && ",
                    LogicalMode::Or => " || ",
                };
                let parts: Vec<String> = rules.iter().map(|r| format!("({r})")).collect();
                if self.invert {
                    write!(f, "!({})", parts.join(op))
                } else {
                    f.write_str(&parts.join(op))
                }
            }
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tag.is_empty() {
            write!(f, "rule[{}]", self.tag)?;
        } else {
            self.describe_body(f)?;
        }
        if !self.fallback.is_empty() {
            write!(f, " {}", self.fallback)?;
        }
        Ok(())
    }
}

fn build_logical<D>(
    options: &LogicalRuleOptions<D>,
    ctx: &RuleContext,
    sub: fn(&RuleOptions<D>, &RuleContext) -> Result<Rule, RuleError>,
) -> Result<Rule, RuleError> {
    if options.rules.is_empty() {
        return Err(RuleError::MissingConditions);
    }
    let mode = LogicalMode::parse(&options.mode)?;
    let rules = options
        .rules
        .iter()
        .map(|r| sub(r, ctx))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Rule::logical(mode, rules, options.invert))
}

/// Logical sub-rules and rule-set entries carry no target.
fn build_route_conditions(options: &RouteRuleOptions, ctx: &RuleContext) -> Result<Rule, RuleError> {
    match options {
        RuleOptions::Default(d) => {
            let conditions = Conditions::from_options(&d.conditions, &[], ctx)?;
            if conditions.is_empty() {
                return Err(RuleError::MissingConditions);
            }
            Ok(Rule::from_conditions(conditions, d.invert))
        }
        RuleOptions::Logical(l) => build_logical(l, ctx, build_route_conditions),
    }
}

/// Build a top-level route rule; the outbound target is required.
pub fn build_route_rule(options: &RouteRuleOptions, ctx: &RuleContext) -> Result<Rule, RuleError> {
    let (rule, outbound, skip_resolve, fallbacks) = match options {
        RuleOptions::Default(d) => {
            let conditions = Conditions::from_options(&d.conditions, &[], ctx)?;
            if conditions.is_empty() && d.fallback_rules.is_empty() {
                return Err(RuleError::MissingConditions);
            }
            let rule = Rule::from_conditions(conditions, d.invert).with_meta(&d.tag, &d.uuid, d.disabled);
            (rule, &d.outbound, d.skip_resolve, &d.fallback_rules)
        }
        RuleOptions::Logical(l) => {
            let rule = build_logical(l, ctx, build_route_conditions)?.with_meta(&l.tag, &l.uuid, l.disabled);
            (rule, &l.outbound, false, &l.fallback_rules)
        }
    };
    if outbound.is_empty() {
        return Err(RuleError::MissingTarget("outbound"));
    }
    let mut rule = rule.with_fallback(build_fallbacks(fallbacks, ctx)?);
    rule.outbound = outbound.clone();
    rule.skip_resolve = skip_resolve;
    Ok(rule)
}

/// Build a rule-set entry.
pub fn build_headless_rule(options: &HeadlessRuleOptions, ctx: &RuleContext) -> Result<Rule, RuleError> {
    match options {
        RuleOptions::Default(d) => {
            let conditions = Conditions::from_options(&d.conditions, &[], ctx)?;
            if conditions.is_empty() {
                return Err(RuleError::MissingConditions);
            }
            Ok(Rule::from_conditions(conditions, d.invert))
        }
        RuleOptions::Logical(l) => build_logical(l, ctx, build_headless_rule),
    }
}

pub(crate) fn build_fallbacks(
    options: &[FallbackRuleOptions],
    ctx: &RuleContext,
) -> Result<FallbackRules, RuleError> {
    options
        .iter()
        .map(|o| FallbackRule::new(o, ctx))
        .collect::<Result<Vec<_>, _>>()
        .map(FallbackRules::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_config::DefaultRuleOptions;
    use sb_types::Destination;

    fn route(json: &str) -> Rule {
        let options: RouteRuleOptions = serde_json::from_str(json).unwrap();
        build_route_rule(&options, &RuleContext::default()).unwrap()
    }

    fn to(host: &str, port: u16) -> InboundContext {
        let mut m = InboundContext::new("in", Network::Tcp);
        m.destination = Some(Destination::from((host, port)));
        m
    }

    #[test]
    fn empty_rule_always_matches() {
        for invert in [false, true] {
            let rule = Rule::from_conditions(Conditions::default(), invert);
            assert!(rule.matches(&mut to("example.com", 1)));
        }
    }

    #[test]
    fn port_rule_with_invert() {
        let plain = route(r#"{"port":[80,443],"outbound":"proxy"}"#);
        let inverted = route(r#"{"port":[80,443],"invert":true,"outbound":"proxy"}"#);
        for (port, expect) in [(80, true), (443, true), (22, false)] {
            let mut m = to("1.1.1.1", port);
            assert_eq!(plain.matches(&mut m), expect, "port {port}");
            m.reset_rule_cache();
            assert_eq!(inverted.matches(&mut m), !expect, "inverted port {port}");
        }
    }

    #[test]
    fn partitions_and_together() {
        let rule = route(r#"{"domain_suffix":"example.com","port":443,"network":"tcp","outbound":"p"}"#);
        assert!(rule.matches(&mut to("www.example.com", 443)));
        assert!(!rule.matches(&mut to("www.example.com", 80)));
        assert!(!rule.matches(&mut to("example.org", 443)));
        let mut udp = to("www.example.com", 443);
        udp.network = Some(Network::Udp);
        assert!(!rule.matches(&mut udp));
    }

    #[test]
    fn domain_and_ip_cidr_share_destination_partition() {
        let rule = route(r#"{"domain":"a.com","ip_cidr":"10.0.0.0/8","outbound":"p"}"#);
        assert!(rule.matches(&mut to("a.com", 80)));
        assert!(rule.matches(&mut to("10.1.1.1", 80)));
        assert!(!rule.matches(&mut to("b.com", 80)));
        let mut m = to("b.com", 80);
        m.ignore_destination_ip_cidr_match = true;
        m.destination_addresses = vec!["10.0.0.1".parse().unwrap()];
        assert!(!rule.matches(&mut m));
    }

    #[test]
    fn partition_flags_are_recorded() {
        let rule = route(r#"{"source_port":1234,"port":80,"outbound":"p"}"#);
        let mut m = to("1.1.1.1", 80);
        m.source = Some("10.0.0.2:1234".parse().unwrap());
        assert!(rule.matches(&mut m));
        assert!(m.cache.source_port_match);
        assert!(m.cache.destination_port_match);
        assert!(m.cache.did_match);
        assert!(!m.cache.source_address_match);
    }

    #[test]
    fn logical_and_or() {
        let and = route(
            r#"{"type":"logical","mode":"and","rules":[{"domain":"a.com"},{"port":443}],"outbound":"p"}"#,
        );
        assert!(and.matches(&mut to("a.com", 443)));
        assert!(!and.matches(&mut to("a.com", 80)));

        let or = route(
            r#"{"type":"logical","mode":"or","invert":true,"rules":[{"domain":"a.com"},{"port":443}],"outbound":"p"}"#,
        );
        assert!(!or.matches(&mut to("b.com", 443)));
        assert!(or.matches(&mut to("b.com", 80)));
        assert_eq!(or.to_string(), "!((domain=a.com) || (port=443))");
    }

    #[test]
    fn construction_errors() {
        let ctx = RuleContext::default();
        let parse = |json: &str| -> Result<Rule, RuleError> {
            let options: RouteRuleOptions = serde_json::from_str(json).unwrap();
            build_route_rule(&options, &ctx)
        };
        assert!(matches!(parse(r#"{"outbound":"p"}"#), Err(RuleError::MissingConditions)));
        assert!(matches!(parse(r#"{"domain":"a"}"#), Err(RuleError::MissingTarget("outbound"))));
        assert!(matches!(parse(r#"{"domain_regex":"(","outbound":"p"}"#), Err(RuleError::Regex { .. })));
        assert!(matches!(parse(r#"{"ip_cidr":"10.0.0.0/33","outbound":"p"}"#), Err(RuleError::Cidr(_))));
        assert!(matches!(parse(r#"{"ip_version":5,"outbound":"p"}"#), Err(RuleError::IpVersion(5))));
        assert!(matches!(parse(r#"{"rule_set":"missing","outbound":"p"}"#), Err(RuleError::RuleSetNotFound(_))));
        assert!(matches!(
            parse(r#"{"type":"logical","mode":"xor","rules":[{"port":1}],"outbound":"p"}"#),
            Err(RuleError::LogicalMode(_))
        ));
        assert!(matches!(
            parse(r#"{"type":"logical","mode":"and","rules":[],"outbound":"p"}"#),
            Err(RuleError::MissingConditions)
        ));
        assert!(matches!(parse(r#"{"geosite":"cn","outbound":"p"}"#), Err(RuleError::GeoNotLoaded("geosite"))));
    }

    #[test]
    fn fallback_only_rule_is_allowed() {
        let rule = route(r#"{"outbound":"p","fallback_rules":[{"ip_is_private":true,"outbound":"direct"}]}"#);
        assert!(rule.matches(&mut to("x.com", 1)));
        assert_eq!(rule.to_string(), "match_all fallback_rule=[ip_is_private=true]=>direct");
    }

    #[test]
    fn display_and_metadata() {
        let rule = route(r#"{"domain":"a.com","invert":true,"outbound":"p","uuid":"fixed"}"#);
        assert_eq!(rule.to_string(), "!(domain=a.com)");
        assert_eq!(rule.uuid(), "fixed");
        let tagged = route(r#"{"port":1,"outbound":"p","tag":"ads"}"#);
        assert_eq!(tagged.to_string(), "rule[ads]");
        assert!(!tagged.uuid().is_empty());
    }

    #[test]
    fn toggle_disabled() {
        let rule = build_route_rule(
            &RuleOptions::Default(DefaultRuleOptions {
                conditions: RuleConditions {
                    port: vec![80].into(),
                    ..Default::default()
                },
                outbound: "p".into(),
                disabled: true,
                ..Default::default()
            }),
            &RuleContext::default(),
        )
        .unwrap();
        assert!(rule.is_disabled());
        assert!(!rule.toggle());
        assert!(!rule.is_disabled());
        assert!(rule.toggle());
    }

    #[test]
    fn clash_mode_is_shared() {
        let ctx = RuleContext::default();
        ctx.clash_mode.set("Rule");
        let options: RouteRuleOptions = serde_json::from_str(r#"{"clash_mode":"global","outbound":"p"}"#).unwrap();
        let rule = build_route_rule(&options, &ctx).unwrap();
        assert!(!rule.matches(&mut to("a.com", 1)));
        ctx.clash_mode.set("Global");
        assert!(rule.matches(&mut to("a.com", 1)));
    }

    #[test]
    fn wifi_items_use_injected_state() {
        struct Home;
        impl WifiStateProvider for Home {
            fn wifi_state(&self) -> WifiState {
                WifiState {
                    ssid: "home".into(),
                    bssid: "AA:BB:CC:DD:EE:FF".into(),
                }
            }
        }
        let ctx = RuleContext {
            wifi: Arc::new(Home),
            ..Default::default()
        };
        let options: RouteRuleOptions =
            serde_json::from_str(r#"{"wifi_ssid":"home","wifi_bssid":"aa:bb:cc:dd:ee:ff","outbound":"p"}"#).unwrap();
        let rule = build_route_rule(&options, &ctx).unwrap();
        assert!(rule.matches(&mut to("a.com", 1)));
        assert!(rule.any_item(&RuleItem::is_wifi));
    }
}
