//! Option models and validation for the routing decision core
//! 路由决策核心的配置模型与校验
//!
//! # Strategic Workflow / 战略工作流
//! `Raw JSON` -> `Deserialize (serde)` -> `Validate` -> consumed by `sb-core` builders.
//!
//! Validation only covers cross references the core can check on its own
//! (DNS servers, rule-sets, providers, relay chains). Outbound tags that are
//! registered by protocol crates at runtime are resolved when groups start.

use anyhow::Context;
use sb_types::IssueCode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

pub mod de;
pub mod dns;
pub mod inbound;
pub mod log;
pub mod outbound;
pub mod provider;
pub mod route;
pub mod rule;

pub use de::Listable;
pub use dns::{DnsOptions, DnsServerOptions};
pub use inbound::InboundOptions;
pub use log::{LogFormat, LogOptions};
pub use outbound::{
    BlockOptions, DialerOptions, DirectOptions, GroupOutboundOptions, OutboundOptions,
    RelayOptions, SelectorOptions,
};
pub use provider::{OutboundProviderOptions, ProviderKind};
pub use route::{CacheFileOptions, GeoDbOptions, RouteOptions};
pub use rule::{
    DefaultDnsRuleOptions, DefaultRuleOptions, DnsRuleOptions, FallbackRuleOptions,
    HeadlessDefaultOptions, HeadlessRuleOptions, LogicalRuleOptions, PlainRuleSet,
    QueryTypeValue, RouteRuleOptions, RuleConditions, RuleOptions, RuleSetOptions,
};

/// Validation failure with a JSON-pointer-like location.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{ptr}: {msg} ({code})")]
pub struct ConfigError {
    pub code: IssueCode,
    pub ptr: String,
    pub msg: String,
}

impl ConfigError {
    pub fn new(code: IssueCode, ptr: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            code,
            ptr: ptr.into(),
            msg: msg.into(),
        }
    }
}

/// Root options document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub log: LogOptions,
    pub dns: DnsOptions,
    pub route: RouteOptions,
    pub inbounds: Vec<InboundOptions>,
    pub outbounds: Vec<OutboundOptions>,
    pub outbound_providers: Vec<OutboundProviderOptions>,
    pub cache_file: CacheFileOptions,
}

impl Options {
    /// Parse and validate a JSON document.
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let options: Options = serde_json::from_str(text).context("parse options")?;
        options.validate()?;
        Ok(options)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read options {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // 1) 出站 / 提供者标签唯一
        let mut outbound_tags = HashSet::new();
        for (i, ob) in self.outbounds.iter().enumerate() {
            let ptr = format!("/outbounds/{i}/tag");
            if ob.tag().is_empty() {
                return Err(ConfigError::new(IssueCode::MissingRequired, ptr, "missing tag"));
            }
            if !outbound_tags.insert(ob.tag()) {
                return Err(ConfigError::new(
                    IssueCode::DuplicateTag,
                    ptr,
                    format!("duplicate outbound tag: {}", ob.tag()),
                ));
            }
        }
        let mut provider_tags = HashSet::new();
        for (i, p) in self.outbound_providers.iter().enumerate() {
            let ptr = format!("/outbound_providers/{i}");
            if p.tag.is_empty() {
                return Err(ConfigError::new(IssueCode::MissingRequired, ptr, "missing tag"));
            }
            if !provider_tags.insert(p.tag.as_str()) {
                return Err(ConfigError::new(
                    IssueCode::DuplicateTag,
                    ptr,
                    format!("duplicate provider tag: {}", p.tag),
                ));
            }
            if p.kind == ProviderKind::Http && p.download_url.is_empty() {
                return Err(ConfigError::new(
                    IssueCode::MissingRequired,
                    format!("{ptr}/download_url"),
                    "http provider requires download_url",
                ));
            }
        }

        // 2) 组出站的成员 / 提供者引用
        for (i, ob) in self.outbounds.iter().enumerate() {
            match ob {
                OutboundOptions::Relay(r) if r.outbounds.is_empty() => {
                    return Err(ConfigError::new(
                        IssueCode::MissingRequired,
                        format!("/outbounds/{i}/outbounds"),
                        "missing tags",
                    ));
                }
                OutboundOptions::Selector(s) => {
                    if s.group.outbounds.is_empty() && s.group.providers.is_empty() {
                        return Err(ConfigError::new(
                            IssueCode::MissingRequired,
                            format!("/outbounds/{i}"),
                            "missing tags and uses",
                        ));
                    }
                    for p in &s.group.providers {
                        if !provider_tags.contains(p.as_str()) {
                            return Err(ConfigError::new(
                                IssueCode::UnknownReference,
                                format!("/outbounds/{i}/providers"),
                                format!("outbound provider not found: {p}"),
                            ));
                        }
                    }
                    if !s.group.excludes.is_empty() {
                        regex::Regex::new(&s.group.excludes).map_err(|e| {
                            ConfigError::new(
                                IssueCode::InvalidValue,
                                format!("/outbounds/{i}/excludes"),
                                e.to_string(),
                            )
                        })?;
                    }
                }
                _ => {}
            }
        }

        // 3) DNS 服务器与规则引用
        let mut servers = HashSet::new();
        for (i, s) in self.dns.servers.iter().enumerate() {
            if !servers.insert(s.tag.as_str()) {
                return Err(ConfigError::new(
                    IssueCode::DuplicateTag,
                    format!("/dns/servers/{i}/tag"),
                    format!("duplicate dns server tag: {}", s.tag),
                ));
            }
        }
        if !self.dns.final_server.is_empty() && !servers.contains(self.dns.final_server.as_str()) {
            return Err(ConfigError::new(
                IssueCode::UnknownReference,
                "/dns/final",
                format!("default dns server not found: {}", self.dns.final_server),
            ));
        }
        let rule_sets: HashSet<&str> = self.route.rule_set.iter().map(|r| r.tag.as_str()).collect();
        for (i, rule) in self.dns.rules.iter().enumerate() {
            let ptr = format!("/dns/rules/{i}");
            check_dns_rule(rule, &servers, &rule_sets, &ptr)?;
        }

        // 4) 路由规则的规则集引用
        for (i, rule) in self.route.rules.iter().enumerate() {
            let ptr = format!("/route/rules/{i}");
            check_route_rule(rule, &rule_sets, &ptr)?;
        }
        Ok(())
    }
}

fn check_fallbacks(
    fallbacks: &[FallbackRuleOptions],
    rule_sets: &HashSet<&str>,
    ptr: &str,
) -> Result<(), ConfigError> {
    for (j, fb) in fallbacks.iter().enumerate() {
        let ptr = format!("{ptr}/fallback_rules/{j}");
        if !fb.is_valid() {
            return Err(ConfigError::new(IssueCode::MissingRequired, ptr, "missing conditions"));
        }
        check_rule_set_refs(&fb.rule_set, rule_sets, &ptr)?;
    }
    Ok(())
}

fn check_rule_set_refs(
    refs: &Listable<String>,
    rule_sets: &HashSet<&str>,
    ptr: &str,
) -> Result<(), ConfigError> {
    for tag in refs {
        if !rule_sets.contains(tag.as_str()) {
            return Err(ConfigError::new(
                IssueCode::UnknownReference,
                format!("{ptr}/rule_set"),
                format!("rule-set not found: {tag}"),
            ));
        }
    }
    Ok(())
}

fn check_route_rule(
    rule: &RouteRuleOptions,
    rule_sets: &HashSet<&str>,
    ptr: &str,
) -> Result<(), ConfigError> {
    match rule {
        RuleOptions::Default(d) => {
            check_rule_set_refs(&d.conditions.rule_set, rule_sets, ptr)?;
            check_fallbacks(&d.fallback_rules, rule_sets, ptr)
        }
        RuleOptions::Logical(l) => {
            for (j, sub) in l.rules.iter().enumerate() {
                check_route_rule(sub, rule_sets, &format!("{ptr}/rules/{j}"))?;
            }
            check_fallbacks(&l.fallback_rules, rule_sets, ptr)
        }
    }
}

fn check_dns_rule(
    rule: &DnsRuleOptions,
    servers: &HashSet<&str>,
    rule_sets: &HashSet<&str>,
    ptr: &str,
) -> Result<(), ConfigError> {
    let (targets, fallbacks) = match rule {
        RuleOptions::Default(d) => {
            check_rule_set_refs(&d.conditions.rule_set, rule_sets, ptr)?;
            (&d.server, &d.fallback_rules)
        }
        RuleOptions::Logical(l) => {
            for (j, sub) in l.rules.iter().enumerate() {
                check_dns_rule(sub, servers, rule_sets, &format!("{ptr}/rules/{j}"))?;
            }
            (&l.server, &l.fallback_rules)
        }
    };
    for t in targets {
        if !servers.contains(t.as_str()) {
            return Err(ConfigError::new(
                IssueCode::UnknownReference,
                format!("{ptr}/server"),
                format!("dns server not found: {t}"),
            ));
        }
    }
    for (j, fb) in fallbacks.iter().enumerate() {
        if !fb.server.is_empty() && !servers.contains(fb.server.as_str()) {
            return Err(ConfigError::new(
                IssueCode::UnknownReference,
                format!("{ptr}/fallback_rules/{j}/server"),
                format!("dns server not found: {}", fb.server),
            ));
        }
    }
    check_fallbacks(fallbacks, rule_sets, ptr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "log": {"level": "debug"},
        "dns": {
            "servers": [{"tag": "doh", "address": "https://10.0.0.53/dns-query"},
                        {"tag": "upstream", "address": "udp://8.8.8.8"}],
            "rules": [{
                "domain": "internal.example",
                "server": "doh",
                "fallback_rules": [{"ip_is_private": true, "server": "upstream"}]
            }],
            "final": "upstream"
        },
        "outbound_providers": [{"type": "file", "tag": "P", "path": "p.json"}],
        "outbounds": [
            {"type": "direct", "tag": "direct"},
            {"type": "selector", "tag": "sel", "outbounds": ["direct"], "uses": ["P"], "ports": ["80"]},
            {"type": "relay", "tag": "chain", "outbounds": ["sel", "direct"]}
        ]
    }"#;

    #[test]
    fn sample_validates() {
        let o = Options::from_json(SAMPLE).unwrap();
        assert_eq!(o.log.level, "debug");
        assert_eq!(o.outbounds.len(), 3);
        assert_eq!(o.outbounds[2].type_name(), "relay");
    }

    #[test]
    fn load_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(SAMPLE.as_bytes()).unwrap();
        let o = Options::load(f.path()).unwrap();
        assert_eq!(o.dns.servers.len(), 2);
        assert_eq!(o, Options::from_json(SAMPLE).unwrap());
    }

    #[test]
    fn duplicate_outbound_tag() {
        let o: Options = serde_json::from_str(
            r#"{"outbounds":[{"type":"direct","tag":"a"},{"type":"block","tag":"a"}]}"#,
        )
        .unwrap();
        let err = o.validate().unwrap_err();
        assert_eq!(err.code, IssueCode::DuplicateTag);
        assert_eq!(err.ptr, "/outbounds/1/tag");
    }

    #[test]
    fn empty_relay_rejected() {
        let o: Options =
            serde_json::from_str(r#"{"outbounds":[{"type":"relay","tag":"r"}]}"#).unwrap();
        assert_eq!(o.validate().unwrap_err().code, IssueCode::MissingRequired);
    }

    #[test]
    fn unknown_dns_server_rejected() {
        let o: Options = serde_json::from_str(
            r#"{"dns":{"servers":[{"tag":"a"}],"rules":[{"domain":"x","server":"b"}]}}"#,
        )
        .unwrap();
        let err = o.validate().unwrap_err();
        assert_eq!(err.code, IssueCode::UnknownReference);
        assert_eq!(err.ptr, "/dns/rules/0/server");
    }

    #[test]
    fn fallback_without_conditions_rejected() {
        let o: Options = serde_json::from_str(
            r#"{"route":{"rules":[{"domain":"x","outbound":"d","fallback_rules":[{"server":"y"}]}]}}"#,
        )
        .unwrap();
        let err = o.validate().unwrap_err();
        assert_eq!(err.ptr, "/route/rules/0/fallback_rules/0");
    }
}
