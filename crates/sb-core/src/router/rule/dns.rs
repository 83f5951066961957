//! DNS rules: route queries to transports.
use super::{build_fallbacks, build_logical, Conditions, FallbackMatch, Rule, RuleContext};
use crate::error::RuleError;
use sb_config::{DnsRuleOptions, RuleOptions};
use sb_types::InboundContext;
use std::fmt;
use std::net::IpAddr;

/// A DNS rule with its transport targets and per-query overrides.
#[derive(Debug)]
pub struct DnsRule {
    rule: Rule,
    servers: Vec<String>,
    disable_cache: bool,
    rewrite_ttl: Option<u32>,
    client_subnet: Option<IpAddr>,
}

fn build_dns_conditions(options: &DnsRuleOptions, ctx: &RuleContext) -> Result<Rule, RuleError> {
    match options {
        RuleOptions::Default(d) => {
            let conditions = Conditions::from_options(&d.conditions, &d.outbound.0, ctx)?;
            if conditions.is_empty() {
                return Err(RuleError::MissingConditions);
            }
            Ok(Rule::from_conditions(conditions, d.invert))
        }
        RuleOptions::Logical(l) => build_logical(l, ctx, build_dns_conditions),
    }
}

impl DnsRule {
    pub fn new(options: &DnsRuleOptions, ctx: &RuleContext) -> Result<Self, RuleError> {
        let (rule, servers, disable_cache, rewrite_ttl, client_subnet, fallbacks) = match options {
            RuleOptions::Default(d) => {
                let conditions = Conditions::from_options(&d.conditions, &d.outbound.0, ctx)?;
                if conditions.is_empty() && d.fallback_rules.is_empty() {
                    return Err(RuleError::MissingConditions);
                }
                let rule = Rule::from_conditions(conditions, d.invert).with_meta(&d.tag, &d.uuid, d.disabled);
                (rule, &d.server, d.disable_cache, d.rewrite_ttl, d.client_subnet, &d.fallback_rules)
            }
            RuleOptions::Logical(l) => {
                let rule = build_logical(l, ctx, build_dns_conditions)?.with_meta(&l.tag, &l.uuid, l.disabled);
                (rule, &l.server, l.disable_cache, l.rewrite_ttl, l.client_subnet, &l.fallback_rules)
            }
        };
        if servers.is_empty() {
            return Err(RuleError::MissingTarget("server"));
        }
        Ok(Self {
            rule: rule.with_fallback(build_fallbacks(fallbacks, ctx)?),
            servers: servers.0.clone(),
            disable_cache,
            rewrite_ttl,
            client_subnet,
        })
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    /// Transport tags queried concurrently when this rule matches.
    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    pub fn disable_cache(&self) -> bool {
        self.disable_cache
    }

    pub fn rewrite_ttl(&self) -> Option<u32> {
        self.rewrite_ttl
    }

    pub fn client_subnet(&self) -> Option<IpAddr> {
        self.client_subnet
    }

    /// Pre-resolution match: destination IP-CIDR items are skipped because
    /// no answer exists yet.
    pub fn matches(&self, m: &mut InboundContext) -> bool {
        m.ignore_destination_ip_cidr_match = true;
        let matched = self.rule.matches(m);
        m.ignore_destination_ip_cidr_match = false;
        matched
    }

    /// Whether answers must be checked against the rule before acceptance.
    pub fn with_address_limit(&self) -> bool {
        self.rule.contains_destination_ip_cidr()
    }

    /// Full match against metadata carrying the decoded answer addresses.
    pub fn match_address_limit(&self, m: &mut InboundContext) -> bool {
        m.reset_rule_cache();
        self.rule.matches(m)
    }

    pub fn match_fallback(&self, m: &mut InboundContext, after: Option<usize>) -> Option<FallbackMatch> {
        self.rule.match_fallback(m, after)
    }

    pub fn has_fallback(&self) -> bool {
        !self.rule.fallback().is_empty()
    }
}

impl fmt::Display for DnsRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.rule, f)
    }
}
