//! Provider outbound filtering for groups
//!
//! An outbound pulled from a provider is kept when its tag matches one of
//! `includes` and not `excludes`, its type is listed in `types`, and its
//! server port falls within `ports`. Empty criteria accept everything.

use super::Outbound;
use crate::error::OutboundError;
use regex::Regex;
use sb_config::GroupOutboundOptions;
use std::ops::RangeInclusive;

#[derive(Debug, Clone, Default)]
pub struct OutboundFilter {
    includes: Vec<Regex>,
    excludes: Option<Regex>,
    types: Vec<String>,
    ports: Vec<RangeInclusive<u16>>,
}

impl OutboundFilter {
    pub fn new(options: &GroupOutboundOptions) -> Result<Self, OutboundError> {
        let includes = options
            .includes
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| compile(p))
            .collect::<Result<Vec<_>, _>>()?;
        let excludes = if options.excludes.is_empty() {
            None
        } else {
            Some(compile(&options.excludes)?)
        };
        let ports = options
            .ports
            .iter()
            .map(|p| parse_port_range(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            includes,
            excludes,
            types: options.types.iter().map(|t| t.to_ascii_lowercase()).collect(),
            ports,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_none() && self.types.is_empty() && self.ports.is_empty()
    }

    pub fn matches(&self, outbound: &dyn Outbound) -> bool {
        let tag = outbound.tag();
        if !self.includes.is_empty() && !self.includes.iter().any(|r| r.is_match(&tag)) {
            return false;
        }
        if self.excludes.as_ref().is_some_and(|r| r.is_match(&tag)) {
            return false;
        }
        if !self.types.is_empty() && !self.types.iter().any(|t| t.eq_ignore_ascii_case(outbound.kind())) {
            return false;
        }
        let port = outbound.port();
        // Outbounds without a server port are never filtered on it.
        self.ports.is_empty() || port == 0 || self.ports.iter().any(|r| r.contains(&port))
    }
}

fn compile(pattern: &str) -> Result<Regex, OutboundError> {
    Regex::new(pattern).map_err(|e| OutboundError::Filter(pattern.to_string(), e.to_string()))
}

/// "443" or "1000:2000".
fn parse_port_range(s: &str) -> Result<RangeInclusive<u16>, OutboundError> {
    let invalid = |why: &str| OutboundError::Filter(s.to_string(), why.to_string());
    let parse = |p: &str| p.trim().parse::<u16>().map_err(|e| invalid(&e.to_string()));
    match s.split_once(':') {
        Some((start, end)) => {
            let (start, end) = (parse(start)?, parse(end)?);
            if start > end {
                return Err(invalid("start is greater than end"));
            }
            Ok(start..=end)
        }
        None => {
            let port = parse(s)?;
            Ok(port..=port)
        }
    }
}
