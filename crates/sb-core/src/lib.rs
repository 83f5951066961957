//! sb-core: routing decision core
//! 路由决策核心
//!
//! # Strategic Workflow / 战略工作流
//! `inbound accept` -> `router::sniff` -> `router::rule` -> `dns` (when a
//! domain must be resolved) -> `outbound` groups -> `transport::dialer`.
//!
//! Protocol implementations live outside this crate and plug in through the
//! [`outbound::Outbound`] and [`dns::DnsTransport`] traits.

pub mod cache_store;
pub mod dns;
pub mod error;
pub mod log;
pub mod outbound;
pub mod provider;
pub mod router;
pub mod transport;

pub use error::{DnsError, OutboundError, ProviderError, RuleError, SniffError};
