//! Shared test utilities for the routing core
//!
//! Mocks that stand in for the pieces protocol crates provide at runtime:
//!
//! - [`outbound::MockOutbound`]: an echoing outbound that records every dial
//!   and can be chained behind a detour
//! - [`dns::MockDnsTransport`]: a raw DNS transport with canned answers
//! - [`provider::MockSource`] / [`provider::MockTester`]: scripted provider
//!   content and latency results
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sb_test_utils::outbound::MockOutbound;
//!
//! let node = MockOutbound::new("node-a").with_port(443);
//! ```

pub mod dns;
pub mod outbound;
pub mod provider;

pub use dns::MockDnsTransport;
pub use outbound::{DialLog, MockOutbound};
pub use provider::{MockSource, MockTester};
