//! 默认提供者：更新、回滚与健康检查
//!
//! One async `RwLock` guards the outbound list, the by-tag index and the
//! subscription info. An update holds it for writing across backup, fetch and
//! start, and downgrades to a read guard while groups rebuild, so groups can
//! read the new list but no other update interleaves. Any failure restores
//! the backup.

use super::{
    OutboundProvider, ProviderSource, SubscriptionInfo, UrlTester, DEFAULT_HEALTHCHECK_INTERVAL,
    DEFAULT_HEALTHCHECK_URL, MIN_DOWNLOAD_INTERVAL,
};
use crate::error::ProviderError;
use crate::outbound::{Outbound, OutboundManager};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use sb_config::{OutboundProviderOptions, ProviderKind};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Health checks running at once.
const HEALTHCHECK_CONCURRENCY: usize = 10;
const HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(5);
/// How often the background loop considers a health check.
const CHECK_TICK: Duration = Duration::from_secs(60);

#[derive(Clone, Default)]
struct ProviderState {
    outbounds: Vec<Arc<dyn Outbound>>,
    by_tag: HashMap<String, Arc<dyn Outbound>>,
    info: SubscriptionInfo,
    updated_at: Option<SystemTime>,
}

impl ProviderState {
    fn reindex(&mut self) {
        self.by_tag = self.outbounds.iter().map(|o| (o.tag(), o.clone())).collect();
    }
}

/// Last successful probe of one outbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthHistory {
    pub delay: u16,
    pub time: SystemTime,
}

/// Clears an atomic flag when dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    /// `None` when the flag was already set.
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct DefaultProvider {
    tag: String,
    kind: ProviderKind,
    path: String,
    healthcheck_url: String,
    healthcheck_interval: Duration,
    download_interval: Duration,
    source: Arc<dyn ProviderSource>,
    tester: Arc<dyn UrlTester>,
    state: RwLock<ProviderState>,
    history: Mutex<HashMap<String, HealthHistory>>,
    last_check: Mutex<Option<Instant>>,
    updating: AtomicBool,
    checking: AtomicBool,
    started: AtomicBool,
    close: CancellationToken,
}

impl DefaultProvider {
    /// Build the provider and load its current content without starting it.
    pub async fn create(
        options: &OutboundProviderOptions,
        source: Arc<dyn ProviderSource>,
        tester: Arc<dyn UrlTester>,
    ) -> Result<Arc<Self>, ProviderError> {
        let provider = Self {
            tag: options.tag.clone(),
            kind: options.kind,
            path: options.path.clone(),
            healthcheck_url: if options.healthcheck_url.is_empty() {
                DEFAULT_HEALTHCHECK_URL.to_string()
            } else {
                options.healthcheck_url.clone()
            },
            healthcheck_interval: options
                .healthcheck_interval
                .filter(|d| !d.is_zero())
                .unwrap_or(DEFAULT_HEALTHCHECK_INTERVAL),
            download_interval: options
                .download_interval
                .unwrap_or(MIN_DOWNLOAD_INTERVAL)
                .max(MIN_DOWNLOAD_INTERVAL),
            source,
            tester,
            state: RwLock::new(ProviderState::default()),
            history: Mutex::new(HashMap::new()),
            last_check: Mutex::new(None),
            updating: AtomicBool::new(false),
            checking: AtomicBool::new(false),
            started: AtomicBool::new(false),
            close: CancellationToken::new(),
        };
        let content = provider.source.fetch(false).await.map_err(ProviderError::Fetch)?;
        {
            let mut state = provider.state.write().await;
            state.outbounds = content.outbounds;
            state.info = content.info;
            state.updated_at = Some(content.updated_at);
            state.reindex();
        }
        Ok(Arc::new(provider))
    }

    pub fn history(&self, tag: &str) -> Option<HealthHistory> {
        self.history.lock().get(tag).copied()
    }

    pub fn is_updating(&self) -> bool {
        self.updating.load(Ordering::Acquire)
    }

    /// Tags owned by the manager and every other provider.
    async fn taken_tags(&self, manager: &OutboundManager) -> HashSet<String> {
        let mut taken: HashSet<String> = manager.outbounds().iter().map(|o| o.tag()).collect();
        for provider in manager.providers() {
            if provider.tag() == self.tag {
                continue;
            }
            taken.extend(provider.outbounds().await.iter().map(|o| o.tag()));
        }
        taken
    }

    /// Rename clashes with `[n]` suffixes and start every outbound.
    async fn start_state(&self, state: &mut ProviderState, manager: &OutboundManager) -> Result<(), ProviderError> {
        let mut taken = self.taken_tags(manager).await;
        for (index, outbound) in state.outbounds.iter().enumerate() {
            let original = outbound.tag();
            let base = if original.is_empty() {
                format!("[{}]{index}", self.tag)
            } else {
                original.clone()
            };
            let mut tag = base.clone();
            let mut n = 1;
            while taken.contains(&tag) {
                tag = format!("{base}[{n}]");
                n += 1;
            }
            if tag != original {
                outbound.set_tag(&tag);
            }
            taken.insert(tag.clone());
            tracing::trace!(target: "sb_core::provider", provider = %self.tag, kind = outbound.kind(), tag = %tag, "initializing outbound");
            outbound.start().await.map_err(|e| ProviderError::Start {
                tag: tag.clone(),
                source: e.into(),
            })?;
        }
        state.reindex();
        Ok(())
    }

    async fn close_outbounds(outbounds: &[Arc<dyn Outbound>]) {
        for outbound in outbounds {
            outbound.close().await;
        }
    }

    async fn run_checks(self: Arc<Self>, manager: Weak<OutboundManager>) {
        let mut tick = tokio::time::interval(CHECK_TICK);
        let mut download = tokio::time::interval(self.download_interval);
        // Both intervals fire immediately; the first tick runs a forced check.
        tick.tick().await;
        self.healthcheck("", true).await;
        download.tick().await;
        loop {
            tokio::select! {
                _ = self.close.cancelled() => return,
                _ = tick.tick() => {
                    self.healthcheck("", false).await;
                }
                _ = download.tick(), if self.kind == ProviderKind::Http => {
                    let Some(manager) = manager.upgrade() else { return };
                    if let Err(e) = self.update_provider(&manager, false).await {
                        tracing::warn!(target: "sb_core::provider", provider = %self.tag, error = %e, "scheduled update failed");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl OutboundProvider for DefaultProvider {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn path(&self) -> &str {
        &self.path
    }

    async fn outbounds(&self) -> Vec<Arc<dyn Outbound>> {
        self.state.read().await.outbounds.clone()
    }

    async fn outbound(&self, tag: &str) -> Option<Arc<dyn Outbound>> {
        self.state.read().await.by_tag.get(tag).cloned()
    }

    async fn update_time(&self) -> SystemTime {
        self.state.read().await.updated_at.unwrap_or(SystemTime::UNIX_EPOCH)
    }

    async fn subscription_info(&self) -> SubscriptionInfo {
        self.state.read().await.info
    }

    async fn start_outbounds(&self, manager: &OutboundManager) -> Result<(), ProviderError> {
        let mut state = self.state.write().await;
        self.start_state(&mut state, manager).await
    }

    fn start(self: Arc<Self>, manager: Weak<OutboundManager>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(self.run_checks(manager));
    }

    async fn close(&self) {
        self.close.cancel();
        let state = self.state.read().await;
        Self::close_outbounds(&state.outbounds).await;
    }

    async fn healthcheck(&self, link: &str, force: bool) -> HashMap<String, u16> {
        let mut results = HashMap::new();
        let Some(_checking) = FlagGuard::acquire(&self.checking) else {
            return results;
        };
        {
            let mut last = self.last_check.lock();
            if !force && last.is_some_and(|t| t.elapsed() < self.healthcheck_interval) {
                return results;
            }
            *last = Some(Instant::now());
        }
        let link = if link.is_empty() { self.healthcheck_url.as_str() } else { link };

        let state = self.state.read().await;
        let mut seen = HashSet::new();
        let targets: Vec<(String, Arc<dyn Outbound>)> = state
            .outbounds
            .iter()
            .map(|o| o.tag())
            .filter(|tag| seen.insert(tag.clone()))
            .filter_map(|tag| state.by_tag.get(&tag).cloned().map(|o| (tag, o)))
            .collect();
        // Boxed: unboxed `async move` closures are not general enough here.
        let probes: Vec<BoxFuture<'_, (String, anyhow::Result<u16>)>> = targets
            .into_iter()
            .map(|(tag, outbound)| {
                let tester = self.tester.clone();
                async move {
                    let result = tokio::time::timeout(HEALTHCHECK_TIMEOUT, tester.url_test(link, outbound))
                        .await
                        .unwrap_or_else(|_| Err(anyhow::anyhow!("health check timeout")));
                    (tag, result)
                }
                .boxed()
            })
            .collect();
        let probes = stream::iter(probes)
            .buffer_unordered(HEALTHCHECK_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;
        drop(state);

        let mut history = self.history.lock();
        for (tag, result) in probes {
            match result {
                Ok(delay) => {
                    tracing::debug!(target: "sb_core::provider", outbound = %tag, delay, "outbound available");
                    history.insert(
                        tag.clone(),
                        HealthHistory {
                            delay,
                            time: SystemTime::now(),
                        },
                    );
                    results.insert(tag, delay);
                }
                Err(e) => {
                    tracing::debug!(target: "sb_core::provider", outbound = %tag, error = %e, "outbound unavailable");
                    history.remove(&tag);
                }
            }
        }
        results
    }

    async fn update_provider(&self, manager: &OutboundManager, force: bool) -> Result<(), ProviderError> {
        let Some(_updating) = FlagGuard::acquire(&self.updating) else {
            return Err(ProviderError::Updating);
        };
        let mut state = self.state.write().await;
        let backup = state.clone();

        let staged = async {
            let content = self.source.fetch(force).await.map_err(ProviderError::Fetch)?;
            *state = ProviderState {
                outbounds: content.outbounds,
                info: content.info,
                updated_at: Some(content.updated_at),
                by_tag: HashMap::new(),
            };
            self.start_state(&mut state, manager).await
        }
        .await;
        let result = match staged {
            Ok(()) => {
                let state = state.downgrade();
                let groups = manager.update_groups(&self.tag).await;
                drop(state);
                groups.map_err(|e| ProviderError::UpdateGroup {
                    tag: self.tag.clone(),
                    source: e.into(),
                })
            }
            Err(e) => {
                drop(state);
                Err(e)
            }
        };

        if let Err(e) = &result {
            tracing::error!(target: "sb_core::provider", provider = %self.tag, error = %e, "update failed, reverting");
            let mut state = self.state.write().await;
            let failed = std::mem::replace(&mut *state, backup);
            let kept: HashSet<usize> = state.outbounds.iter().map(address).collect();
            let fresh: Vec<_> = failed
                .outbounds
                .into_iter()
                .filter(|o| !kept.contains(&address(o)))
                .collect();
            let state = state.downgrade();
            Self::close_outbounds(&fresh).await;
            if let Err(e) = manager.update_groups(&self.tag).await {
                tracing::warn!(target: "sb_core::provider", provider = %self.tag, error = %e, "restore groups");
            }
            drop(state);
        } else {
            tracing::info!(target: "sb_core::provider", provider = %self.tag, "provider updated");
        }

        self.healthcheck("", true).await;
        result
    }
}

fn address(outbound: &Arc<dyn Outbound>) -> usize {
    Arc::as_ptr(outbound) as *const () as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::BlockOutbound;
    use crate::provider::ProviderContent;
    use std::sync::atomic::AtomicUsize;

    struct Fixed(Mutex<Vec<Vec<&'static str>>>);

    #[async_trait]
    impl ProviderSource for Fixed {
        async fn fetch(&self, _force: bool) -> anyhow::Result<ProviderContent> {
            let mut batches = self.0.lock();
            let tags = if batches.len() > 1 { batches.remove(0) } else { batches[0].clone() };
            Ok(ProviderContent {
                outbounds: tags
                    .into_iter()
                    .map(|t| Arc::new(BlockOutbound::new(t)) as Arc<dyn Outbound>)
                    .collect(),
                info: SubscriptionInfo::default(),
                updated_at: SystemTime::now(),
            })
        }
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl UrlTester for Counting {
        async fn url_test(&self, _link: &str, outbound: Arc<dyn Outbound>) -> anyhow::Result<u16> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if outbound.tag().starts_with("bad") {
                anyhow::bail!("unreachable")
            }
            Ok(42)
        }
    }

    fn options(tag: &str) -> OutboundProviderOptions {
        OutboundProviderOptions {
            tag: tag.into(),
            ..Default::default()
        }
    }

    async fn provider(batches: Vec<Vec<&'static str>>) -> (Arc<DefaultProvider>, Arc<Counting>) {
        let tester = Arc::new(Counting(AtomicUsize::new(0)));
        let p = DefaultProvider::create(&options("P"), Arc::new(Fixed(Mutex::new(batches))), tester.clone())
            .await
            .unwrap();
        (p, tester)
    }

    #[tokio::test]
    async fn healthcheck_records_history_and_gates() {
        let (p, tester) = provider(vec![vec!["a", "bad", "a"]]).await;
        let results = p.healthcheck("", true).await;
        assert_eq!(results.get("a"), Some(&42));
        assert!(!results.contains_key("bad"));
        assert_eq!(tester.0.load(Ordering::SeqCst), 2, "duplicate tags probed once");
        assert_eq!(p.history("a").map(|h| h.delay), Some(42));
        assert!(p.history("bad").is_none());

        assert!(p.healthcheck("", false).await.is_empty(), "within interval");
        assert_eq!(tester.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn tags_are_deduplicated() {
        let manager = OutboundManager::new(None);
        manager.register(Arc::new(BlockOutbound::new("a"))).unwrap();
        let (p, _) = provider(vec![vec!["a", "a", ""]]).await;
        p.start_outbounds(&manager).await.unwrap();
        let tags: Vec<_> = p.outbounds().await.iter().map(|o| o.tag()).collect();
        assert_eq!(tags, vec!["a[1]", "a[2]", "[P]2"]);
        assert!(p.outbound("a[2]").await.is_some());
    }

    #[tokio::test]
    async fn concurrent_update_is_refused() {
        let (p, _) = provider(vec![vec!["a"]]).await;
        let _held = FlagGuard::acquire(&p.updating).unwrap();
        let manager = OutboundManager::new(None);
        assert!(matches!(
            p.update_provider(&manager, true).await,
            Err(ProviderError::Updating)
        ));
    }
}
