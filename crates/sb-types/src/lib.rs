//! sb-types: cross-crate routing contracts (metadata, networks, destinations, issue codes).
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

pub mod destination;
pub mod metadata;
pub mod network;

pub use destination::{Destination, DomainStrategy};
pub use metadata::{InboundContext, ProcessInfo, RuleMatchCache};
pub use network::{protocol, Network};

/// Stable issue codes used by option validation and construction diagnostics.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    MissingRequired,
    InvalidValue,
    InvalidEnum,
    DuplicateTag,
    UnknownReference,
    Conflict,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        use IssueCode::*;
        match self {
            MissingRequired => "MissingRequired",
            InvalidValue => "InvalidValue",
            InvalidEnum => "InvalidEnum",
            DuplicateTag => "DuplicateTag",
            UnknownReference => "UnknownReference",
            Conflict => "Conflict",
        }
    }
}

impl Display for IssueCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issuecode_serialization() {
        let j = serde_json::to_string(&IssueCode::DuplicateTag).unwrap();
        assert_eq!(j, r#""DUPLICATE_TAG""#);
        assert_eq!(IssueCode::UnknownReference.to_string(), "UnknownReference");
    }
}
