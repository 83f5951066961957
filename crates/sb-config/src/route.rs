//! Route options / 路由配置
use crate::rule::{RouteRuleOptions, RuleSetOptions};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoDbOptions {
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteOptions {
    pub rules: Vec<RouteRuleOptions>,
    pub rule_set: Vec<RuleSetOptions>,
    /// Outbound used when no rule matches; the first outbound when empty.
    #[serde(rename = "final")]
    pub final_outbound: String,
    pub geoip: Option<GeoDbOptions>,
    pub geosite: Option<GeoDbOptions>,
}

/// Persisted selection and clash-mode state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheFileOptions {
    pub enabled: bool,
    pub path: String,
    /// Remember selector choices across restarts.
    pub store_selected: bool,
    /// Initial clash mode, e.g. "rule" / "global" / "direct".
    pub default_mode: String,
}
