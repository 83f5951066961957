//! Error types for the decision core.
//!
//! Construction errors (`RuleError`, `OutboundError`) abort building a
//! component. Runtime DNS and sniff errors are recovered by the callers and
//! only the terminal outcome reaches the user.
use std::io;
use thiserror::Error;

/// Rule / rule-set construction failures.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid regex {pattern:?}: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid ip cidr {0:?}")]
    Cidr(String),
    #[error("invalid port range {0:?}")]
    PortRange(String),
    #[error("invalid ip version {0}: must be 4 or 6")]
    IpVersion(u8),
    #[error("invalid query type {0:?}")]
    QueryType(String),
    #[error("invalid network {0:?}")]
    Network(String),
    #[error("unknown logical mode: {0}")]
    LogicalMode(String),
    #[error("missing conditions")]
    MissingConditions,
    #[error("missing fallback conditions")]
    MissingFallbackConditions,
    #[error("missing {0} field")]
    MissingTarget(&'static str),
    #[error("rule-set not found: {0}")]
    RuleSetNotFound(String),
    #[error("unsupported rule-set format {0:?}")]
    RuleSetFormat(String),
    #[error("geo database not loaded: {0}")]
    GeoNotLoaded(&'static str),
    #[error("load {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: anyhow::Error,
    },
}

/// DNS pipeline outcomes other than a usable response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DnsError {
    #[error("transport not found: {0}")]
    TransportNotFound(String),
    #[error("response rejected")]
    ResponseRejected,
    #[error("response rejected (cached)")]
    ResponseRejectedCached,
    #[error("name error: no addresses")]
    NameError,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error("missing question")]
    NoQuestion,
    #[error("invalid message: {0}")]
    Message(String),
    #[error("{0}")]
    Transport(String),
}

impl DnsError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::ResponseRejected | Self::ResponseRejectedCached)
    }
}

impl From<hickory_proto::error::ProtoError> for DnsError {
    fn from(e: hickory_proto::error::ProtoError) -> Self {
        Self::Message(e.to_string())
    }
}

/// Outbound construction and dispatch failures.
#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("outbound {index} not found: {tag}")]
    NotFound { index: usize, tag: String },
    #[error("outbound not found: {0}")]
    UnknownTag(String),
    #[error("default outbound not found: {0}")]
    DefaultNotFound(String),
    #[error("nested relay is not allowed: {0}")]
    NestedRelay(String),
    #[error("missing outbounds")]
    EmptyChain,
    #[error("missing tags and uses")]
    MissingMembers,
    #[error("duplicate outbound tag: {0}")]
    DuplicateTag(String),
    #[error("{0} has not been started")]
    NotStarted(String),
    #[error("{0} cannot be chained")]
    NotChainable(String),
    #[error("circular outbound dependency: {0}")]
    Cycle(String),
    #[error("missing destination")]
    MissingDestination,
    #[error("outbound provider not found: {0}")]
    ProviderNotFound(String),
    #[error("invalid filter {0:?}: {1}")]
    Filter(String, String),
    #[error("{tag} does not support {network}")]
    NetworkUnsupported { tag: String, network: &'static str },
    #[error("connection refused by {0}")]
    Refused(String),
    #[error("dial: {0}")]
    Dial(#[from] io::Error),
    #[error("resolve: {0}")]
    Resolve(#[from] DnsError),
}

/// Sniffer outcomes; "no protocol" is a soft negative, never fatal.
#[derive(Debug, Error)]
pub enum SniffError {
    #[error("invalid input")]
    InvalidInput,
    #[error("need more data")]
    NeedMoreData,
    #[error("read: {0}")]
    Read(#[source] io::Error),
    #[error("sniff timeout")]
    Timeout,
    #[error("no detector matched: {}", join_errors(.0))]
    Aggregate(Vec<SniffError>),
}

fn join_errors(errs: &[SniffError]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Provider update / health-check failures.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider is updating")]
    Updating,
    #[error("fetch: {0}")]
    Fetch(#[source] anyhow::Error),
    #[error("start outbound {tag}: {source}")]
    Start {
        tag: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("update group {tag}: {source}")]
    UpdateGroup {
        tag: String,
        #[source]
        source: anyhow::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_lists_every_error() {
        let e = SniffError::Aggregate(vec![SniffError::InvalidInput, SniffError::NeedMoreData]);
        assert_eq!(
            e.to_string(),
            "no detector matched: invalid input | need more data"
        );
    }

    #[test]
    fn dns_error_classes() {
        assert!(DnsError::DeadlineExceeded.is_timeout());
        assert!(DnsError::ResponseRejectedCached.is_rejected());
        assert!(!DnsError::NameError.is_rejected());
    }
}
