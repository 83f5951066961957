//! Routing-relevant inbound settings.
//!
//! Listener details (addresses, protocol framing) belong to the inbound
//! implementations; only what the decision core consumes is modeled here.

use crate::de::duration;
use crate::rule::RouteRuleOptions;
use sb_types::DomainStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-inbound sniffing and resolution policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundOptions {
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sniff: bool,
    pub sniff_override_destination: bool,
    /// Bounded wait for the first bytes; 300ms when unset.
    #[serde(with = "duration")]
    pub sniff_timeout: Option<Duration>,
    /// Resolve domain destinations before rule matching.
    pub domain_strategy: Option<DomainStrategy>,
    /// Restricts destination override to matching connections; empty means all.
    pub sniff_override_rules: Vec<RouteRuleOptions>,
}
