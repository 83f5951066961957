//! Outbound providers / 出站提供者
//!
//! A provider owns a set of outbounds loaded from subscription content.
//! Fetching and parsing the content is injected through [`ProviderSource`],
//! latency probing through [`UrlTester`]; [`DefaultProvider`] implements the
//! update and health-check state machine on top of them.

pub mod default;

pub use default::{DefaultProvider, HealthHistory};

use crate::error::ProviderError;
use crate::outbound::{Outbound, OutboundManager};
use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use sb_config::ProviderKind;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, SystemTime};

/// Default health-check target.
pub const DEFAULT_HEALTHCHECK_URL: &str = "https://www.gstatic.com/generate_204";
pub const DEFAULT_HEALTHCHECK_INTERVAL: Duration = Duration::from_secs(180);
/// Shortest allowed download interval for http providers.
pub const MIN_DOWNLOAD_INTERVAL: Duration = Duration::from_secs(3600);

/// Traffic counters announced by a subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionInfo {
    pub upload: u64,
    pub download: u64,
    pub total: u64,
    pub expire: u64,
}

impl SubscriptionInfo {
    /// Parse `upload=N; download=N; total=N; expire=N`.
    pub fn parse(line: &str) -> Option<Self> {
        static RE: OnceLock<Option<Regex>> = OnceLock::new();
        let re = RE
            .get_or_init(|| {
                Regex::new(r"upload=(\d*);[ \t]*download=(\d*);[ \t]*total=(\d*);[ \t]*expire=(\d*)").ok()
            })
            .as_ref()?;
        let caps = re.captures(line)?;
        let field = |i: usize| caps.get(i).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        Some(Self {
            upload: field(1),
            download: field(2),
            total: field(3),
            expire: field(4),
        })
    }
}

/// Result of one fetch: fresh outbounds, not yet started.
pub struct ProviderContent {
    pub outbounds: Vec<Arc<dyn Outbound>>,
    pub info: SubscriptionInfo,
    pub updated_at: SystemTime,
}

/// Loads and parses subscription content.
#[async_trait]
pub trait ProviderSource: Send + Sync {
    /// `force` bypasses any freshness check of the source.
    async fn fetch(&self, force: bool) -> anyhow::Result<ProviderContent>;
}

/// Measures latency through an outbound, in milliseconds.
#[async_trait]
pub trait UrlTester: Send + Sync {
    async fn url_test(&self, link: &str, outbound: Arc<dyn Outbound>) -> anyhow::Result<u16>;
}

pub type OutboundParser = dyn Fn(&str) -> anyhow::Result<Vec<Arc<dyn Outbound>>> + Send + Sync;

/// Reads a local subscription file. An optional first line carries the
/// subscription info; the rest is handed to `parser`. A missing file yields
/// no outbounds.
pub struct FileSource {
    path: PathBuf,
    parser: Arc<OutboundParser>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, parser: Arc<OutboundParser>) -> Self {
        Self {
            path: path.into(),
            parser,
        }
    }
}

#[async_trait]
impl ProviderSource for FileSource {
    async fn fetch(&self, _force: bool) -> anyhow::Result<ProviderContent> {
        let empty = ProviderContent {
            outbounds: Vec::new(),
            info: SubscriptionInfo::default(),
            updated_at: SystemTime::UNIX_EPOCH,
        };
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(empty),
            Err(e) => return Err(e).with_context(|| format!("stat {}", self.path.display())),
        };
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("read {}", self.path.display()))?;
        let content = raw.trim_matches(|c: char| c.is_ascii_whitespace() || c == '\x07' || c == '\x08');
        let (first, rest) = content.split_once('\n').unwrap_or((content, ""));
        let (info, body) = match SubscriptionInfo::parse(first) {
            Some(info) => (info, rest),
            None => (SubscriptionInfo::default(), content),
        };
        Ok(ProviderContent {
            outbounds: (self.parser)(body)?,
            info,
            updated_at: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        })
    }
}

#[async_trait]
pub trait OutboundProvider: Send + Sync {
    fn tag(&self) -> &str;
    fn kind(&self) -> ProviderKind;
    fn path(&self) -> &str;

    async fn outbounds(&self) -> Vec<Arc<dyn Outbound>>;
    async fn outbound(&self, tag: &str) -> Option<Arc<dyn Outbound>>;
    async fn update_time(&self) -> SystemTime;
    async fn subscription_info(&self) -> SubscriptionInfo;

    /// De-duplicate tags against everything else the manager knows, then
    /// start the current outbounds.
    async fn start_outbounds(&self, manager: &OutboundManager) -> Result<(), ProviderError>;
    /// Spawn background work (health checks, periodic downloads).
    fn start(self: Arc<Self>, manager: Weak<OutboundManager>);
    async fn close(&self);

    /// Latency per outbound tag; `link` overrides the configured URL.
    async fn healthcheck(&self, link: &str, force: bool) -> HashMap<String, u16>;
    async fn update_provider(&self, manager: &OutboundManager, force: bool) -> Result<(), ProviderError>;
}
