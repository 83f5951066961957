//! Outbound registry / 出站注册表
//!
//! Holds every registered outbound and provider by tag, builds the outbounds
//! the core implements itself from options, and starts them in dependency
//! order. Groups keep a `Weak` handle back to the manager and resolve their
//! members when they start.

use super::{BlockOutbound, DirectOutbound, Outbound, Relay, Selector, OUTBOUNDLESS};
use crate::cache_store::CacheStore;
use crate::dns::DnsRouter;
use crate::error::{OutboundError, ProviderError};
use crate::provider::OutboundProvider;
use parking_lot::RwLock;
use sb_config::OutboundOptions;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
struct Registry {
    order: Vec<Arc<dyn Outbound>>,
    by_tag: HashMap<String, Arc<dyn Outbound>>,
}

pub struct OutboundManager {
    registry: RwLock<Registry>,
    providers: RwLock<Vec<Arc<dyn OutboundProvider>>>,
    default_tag: RwLock<String>,
    cache: Option<Arc<dyn CacheStore>>,
}

impl OutboundManager {
    /// Empty manager with only the [`OUTBOUNDLESS`] sentinel registered.
    pub fn new(cache: Option<Arc<dyn CacheStore>>) -> Arc<Self> {
        let manager = Self {
            registry: RwLock::new(Registry::default()),
            providers: RwLock::new(Vec::new()),
            default_tag: RwLock::new(String::new()),
            cache,
        };
        let sentinel: Arc<dyn Outbound> = Arc::new(BlockOutbound::new(OUTBOUNDLESS));
        let mut registry = manager.registry.write();
        registry.by_tag.insert(OUTBOUNDLESS.to_string(), sentinel.clone());
        registry.order.push(sentinel);
        drop(registry);
        Arc::new(manager)
    }

    pub fn cache_store(&self) -> Option<&Arc<dyn CacheStore>> {
        self.cache.as_ref()
    }

    pub fn register(&self, outbound: Arc<dyn Outbound>) -> Result<(), OutboundError> {
        let tag = outbound.tag();
        let mut registry = self.registry.write();
        if registry.by_tag.contains_key(&tag) {
            return Err(OutboundError::DuplicateTag(tag));
        }
        tracing::debug!(target: "sb_core::outbound", tag = %tag, kind = outbound.kind(), "registered outbound");
        registry.by_tag.insert(tag, outbound.clone());
        registry.order.push(outbound);
        Ok(())
    }

    pub fn register_provider(&self, provider: Arc<dyn OutboundProvider>) -> Result<(), OutboundError> {
        let mut providers = self.providers.write();
        if providers.iter().any(|p| p.tag() == provider.tag()) {
            return Err(OutboundError::DuplicateTag(provider.tag().to_string()));
        }
        providers.push(provider);
        Ok(())
    }

    /// Build one of the outbounds the core implements and register it.
    pub fn create(
        self: &Arc<Self>,
        options: &OutboundOptions,
        resolver: Option<Arc<DnsRouter>>,
    ) -> Result<Arc<dyn Outbound>, OutboundError> {
        let outbound: Arc<dyn Outbound> = match options {
            OutboundOptions::Direct(o) => Arc::new(DirectOutbound::new(o, resolver, Arc::downgrade(self))),
            OutboundOptions::Block(o) => Arc::new(BlockOutbound::new(&o.tag)),
            OutboundOptions::Selector(o) => Arc::new(Selector::new(o, Arc::downgrade(self))?),
            OutboundOptions::Relay(o) => Arc::new(Relay::new(o, Arc::downgrade(self))?),
        };
        self.register(outbound.clone())?;
        Ok(outbound)
    }

    /// Registered outbound by tag. Provider outbounds are not included.
    pub fn outbound(&self, tag: &str) -> Option<Arc<dyn Outbound>> {
        self.registry.read().by_tag.get(tag).cloned()
    }

    /// Registered outbound or, failing that, one owned by a provider.
    pub async fn find_outbound(&self, tag: &str) -> Option<Arc<dyn Outbound>> {
        if let Some(outbound) = self.outbound(tag) {
            return Some(outbound);
        }
        for provider in self.providers() {
            if let Some(outbound) = provider.outbound(tag).await {
                return Some(outbound);
            }
        }
        None
    }

    /// Registered outbounds in registration order.
    pub fn outbounds(&self) -> Vec<Arc<dyn Outbound>> {
        self.registry.read().order.clone()
    }

    pub fn provider(&self, tag: &str) -> Option<Arc<dyn OutboundProvider>> {
        self.providers.read().iter().find(|p| p.tag() == tag).cloned()
    }

    pub fn providers(&self) -> Vec<Arc<dyn OutboundProvider>> {
        self.providers.read().clone()
    }

    pub fn set_default(&self, tag: &str) {
        *self.default_tag.write() = tag.to_string();
    }

    /// The configured default, else the first registered outbound.
    pub fn default_outbound(&self) -> Option<Arc<dyn Outbound>> {
        let tag = self.default_tag.read().clone();
        if !tag.is_empty() {
            return self.outbound(&tag);
        }
        self.registry
            .read()
            .order
            .iter()
            .find(|o| o.tag() != OUTBOUNDLESS)
            .cloned()
    }

    /// Start provider outbounds, then every registered outbound once all of
    /// its registered dependencies have started, then provider background work.
    pub async fn start_all(self: &Arc<Self>) -> anyhow::Result<()> {
        for provider in self.providers() {
            provider.start_outbounds(self).await.map_err(|e| match e {
                ProviderError::Start { tag, source } => {
                    anyhow::anyhow!("provider {}: start outbound {tag}: {source}", provider.tag())
                }
                e => anyhow::anyhow!("provider {}: {e}", provider.tag()),
            })?;
        }

        let mut pending = self.outbounds();
        let mut started: HashSet<String> = HashSet::new();
        while !pending.is_empty() {
            let known = self.registry.read().by_tag.keys().cloned().collect::<HashSet<_>>();
            let (ready, blocked): (Vec<_>, Vec<_>) = pending.into_iter().partition(|o| {
                o.dependencies()
                    .iter()
                    .all(|d| started.contains(d) || !known.contains(d))
            });
            if ready.is_empty() {
                let tags = blocked.iter().map(|o| o.tag()).collect::<Vec<_>>().join(", ");
                return Err(OutboundError::Cycle(tags).into());
            }
            for outbound in ready {
                let tag = outbound.tag();
                outbound
                    .start()
                    .await
                    .map_err(|e| anyhow::anyhow!("start outbound/{}[{tag}]: {e}", outbound.kind()))?;
                started.insert(tag);
            }
            pending = blocked;
        }

        for provider in self.providers() {
            provider.start(Arc::downgrade(self));
        }
        Ok(())
    }

    /// Let every group that uses `provider` rebuild its membership.
    pub async fn update_groups(&self, provider: &str) -> Result<(), OutboundError> {
        for outbound in self.outbounds() {
            if let Some(group) = outbound.as_group() {
                group.update_outbounds(provider).await?;
            }
        }
        Ok(())
    }

    pub async fn close_all(&self) {
        for provider in self.providers() {
            provider.close().await;
        }
        for outbound in self.outbounds().iter().rev() {
            outbound.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_config::{BlockOptions, GroupOutboundOptions, Listable, SelectorOptions};

    #[test]
    fn sentinel_is_registered() {
        let manager = OutboundManager::new(None);
        let sentinel = manager.outbound(OUTBOUNDLESS).unwrap();
        assert_eq!(sentinel.kind(), "block");
        assert!(manager.default_outbound().is_none());
    }

    #[test]
    fn duplicate_tags_are_rejected() {
        let manager = OutboundManager::new(None);
        let block = OutboundOptions::Block(BlockOptions { tag: "b".into() });
        manager.create(&block, None).unwrap();
        assert!(matches!(manager.create(&block, None), Err(OutboundError::DuplicateTag(t)) if t == "b"));
        assert_eq!(manager.default_outbound().unwrap().tag(), "b");
    }

    #[tokio::test]
    async fn starts_dependencies_first() {
        let manager = OutboundManager::new(None);
        // The selector is registered before its member.
        let selector = OutboundOptions::Selector(SelectorOptions {
            tag: "sel".into(),
            group: GroupOutboundOptions {
                outbounds: Listable(vec!["b".into()]),
                ..Default::default()
            },
            ..Default::default()
        });
        manager.create(&selector, None).unwrap();
        manager
            .create(&OutboundOptions::Block(BlockOptions { tag: "b".into() }), None)
            .unwrap();
        manager.start_all().await.unwrap();
        let sel = manager.outbound("sel").unwrap();
        assert_eq!(sel.as_group().unwrap().now(), "b");
    }

    #[tokio::test]
    async fn dependency_cycle_fails() {
        let manager = OutboundManager::new(None);
        for (tag, member) in [("x", "y"), ("y", "x")] {
            let options = OutboundOptions::Selector(SelectorOptions {
                tag: tag.into(),
                group: GroupOutboundOptions {
                    outbounds: Listable(vec![member.into()]),
                    ..Default::default()
                },
                ..Default::default()
            });
            manager.create(&options, None).unwrap();
        }
        let err = manager.start_all().await.unwrap_err();
        assert!(err.to_string().contains("circular"));
    }
}
