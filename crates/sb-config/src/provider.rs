//! Outbound provider options / 出站提供者配置
use crate::de::duration;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    File,
    Http,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Http => "http",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundProviderOptions {
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    /// Local copy of the subscription content.
    pub path: String,
    pub healthcheck_url: String,
    #[serde(with = "duration")]
    pub healthcheck_interval: Option<Duration>,
    /// Remote subscription URL (http providers).
    pub download_url: String,
    pub download_ua: String,
    #[serde(with = "duration")]
    pub download_interval: Option<Duration>,
    pub download_detour: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_provider() {
        let p: OutboundProviderOptions = serde_json::from_str(
            r#"{"type":"http","tag":"P","path":"p.json","download_url":"https://x/sub","healthcheck_interval":"5m"}"#,
        )
        .unwrap();
        assert_eq!(p.kind, ProviderKind::Http);
        assert_eq!(p.healthcheck_interval, Some(Duration::from_secs(300)));
    }
}
