//! Fallback chains: secondary conditions consulted after a rule matched.
//!
//! The chain is scanned in declaration order. A caller that already used
//! entry `i` resumes with `after = Some(i)`, so every entry is matched at most
//! once per resolution and never before the resume point.

use super::item::{self, RuleItem};
use super::RuleContext;
use crate::error::RuleError;
use sb_config::FallbackRuleOptions;
use sb_types::InboundContext;
use std::fmt;

#[derive(Debug)]
pub struct FallbackRule {
    match_all: bool,
    items: Vec<RuleItem>,
    invert: bool,
    server: String,
}

impl FallbackRule {
    pub fn new(options: &FallbackRuleOptions, ctx: &RuleContext) -> Result<Self, RuleError> {
        if !options.is_valid() {
            return Err(RuleError::MissingFallbackConditions);
        }
        let mut items = Vec::new();
        if !options.ip_cidr.is_empty() {
            items.push(RuleItem::IpCidr {
                source: false,
                raw: options.ip_cidr.0.clone(),
                nets: item::parse_cidrs(&options.ip_cidr.0)?,
            });
        }
        if options.ip_is_private {
            items.push(RuleItem::IpIsPrivate { source: false });
        }
        if !options.geoip.is_empty() {
            let codes: Vec<String> = options.geoip.iter().map(|c| c.to_ascii_lowercase()).collect();
            let db = ctx.geoip_db(&codes)?;
            items.push(RuleItem::GeoIp {
                source: false,
                codes,
                db,
            });
        }
        if !options.rule_set.is_empty() {
            let sets = options
                .rule_set
                .iter()
                .map(|tag| ctx.rule_set(tag))
                .collect::<Result<Vec<_>, _>>()?;
            items.push(RuleItem::RuleSet {
                tags: options.rule_set.0.clone(),
                sets,
                ip_cidr_match_source: false,
            });
        }
        Ok(Self {
            match_all: options.match_all,
            items,
            invert: options.invert,
            server: options.server.clone(),
        })
    }

    /// Replacement DNS server or outbound tag; may be empty.
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn matches(&self, m: &mut InboundContext) -> bool {
        if self.match_all {
            return true;
        }
        for item in &self.items {
            if item.matches(m) {
                return !self.invert;
            }
        }
        self.invert
    }
}

impl fmt::Display for FallbackRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.match_all {
            f.write_str("match_all")?;
        } else {
            let items: Vec<String> = self.items.iter().map(ToString::to_string).collect();
            if self.invert {
                write!(f, "!({})", items.join(" "))?;
            } else {
                write!(f, "[{}]", items.join(" "))?;
            }
        }
        if !self.server.is_empty() {
            write!(f, "=>{}", self.server)?;
        }
        Ok(())
    }
}

/// Result of a fallback scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackMatch {
    pub server: String,
    pub description: String,
    /// Absolute position in the chain, for resuming.
    pub index: usize,
}

#[derive(Debug, Default)]
pub struct FallbackRules(Vec<FallbackRule>);

impl FallbackRules {
    pub fn new(rules: Vec<FallbackRule>) -> Self {
        Self(rules)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn match_fallback(&self, m: &mut InboundContext, after: Option<usize>) -> Option<FallbackMatch> {
        let start = after.map_or(0, |i| i + 1);
        let rest = self.0.get(start..)?;
        rest.iter().enumerate().find_map(|(offset, rule)| {
            m.reset_rule_match_cache();
            rule.matches(m).then(|| FallbackMatch {
                server: rule.server.clone(),
                description: rule.to_string(),
                index: start + offset,
            })
        })
    }
}

impl fmt::Display for FallbackRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [] => Ok(()),
            [one] => write!(f, "fallback_rule={one}"),
            many => {
                let parts: Vec<String> = many.iter().map(ToString::to_string).collect();
                write!(f, "fallback_rules=[{}]", parts.join(" "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(json: &str) -> FallbackRules {
        let options: Vec<FallbackRuleOptions> = serde_json::from_str(json).unwrap();
        super::super::build_fallbacks(&options, &RuleContext::default()).unwrap()
    }

    fn resolved(ip: &str) -> InboundContext {
        InboundContext::for_dns_fallback(vec![ip.parse().unwrap()])
    }

    #[test]
    fn first_match_after_index() {
        let rules = chain(
            r#"[{"ip_is_private":true,"server":"a"},
                {"ip_cidr":"10.0.0.0/8","server":"b"},
                {"match_all":true,"server":"c"}]"#,
        );
        let mut m = resolved("10.0.0.1");
        let first = rules.match_fallback(&mut m, None).unwrap();
        assert_eq!((first.index, first.server.as_str()), (0, "a"));
        let second = rules.match_fallback(&mut m, Some(first.index)).unwrap();
        assert_eq!((second.index, second.server.as_str()), (1, "b"));
        let third = rules.match_fallback(&mut m, Some(second.index)).unwrap();
        assert_eq!((third.index, third.server.as_str()), (2, "c"));
        assert!(rules.match_fallback(&mut m, Some(third.index)).is_none());
        assert!(rules.match_fallback(&mut m, Some(10)).is_none());
    }

    #[test]
    fn public_address_skips_private_entry() {
        let rules = chain(r#"[{"ip_is_private":true,"server":"a"},{"ip_is_private":true,"invert":true,"server":"b"}]"#);
        let hit = rules.match_fallback(&mut resolved("8.8.8.8"), None).unwrap();
        assert_eq!(hit.server, "b");
        assert_eq!(hit.description, "!(ip_is_private=true)=>b");
    }

    #[test]
    fn display() {
        assert_eq!(
            chain(r#"[{"match_all":true,"server":"x"}]"#).to_string(),
            "fallback_rule=match_all=>x"
        );
        assert_eq!(
            chain(r#"[{"ip_cidr":["1.0.0.0/8","2.0.0.0/8"]},{"match_all":true}]"#).to_string(),
            "fallback_rules=[[ip_cidr=[1.0.0.0/8 2.0.0.0/8]] match_all]"
        );
    }

    #[test]
    fn empty_fallback_rejected() {
        let err = FallbackRule::new(&FallbackRuleOptions::default(), &RuleContext::default()).unwrap_err();
        assert!(matches!(err, RuleError::MissingFallbackConditions));
    }
}
