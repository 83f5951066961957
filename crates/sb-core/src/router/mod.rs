//! Routing: sniffing, rule matching and the decision engine
//! 路由：协议嗅探、规则匹配与决策引擎

pub mod engine;
pub mod geo;
pub mod rule;
pub mod rule_set;
pub mod sniff;

pub use engine::{InboundPolicy, ReplayStream, RouteResult, Router};
pub use rule::{build_headless_rule, build_route_rule, ClashModeState, Rule, RuleContext};
pub use rule_set::RuleSet;
