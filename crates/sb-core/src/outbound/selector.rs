//! 手动选择器 (Selector)
//!
//! Members are the declared outbound tags followed by every outbound of the
//! used providers that passes the group filter. The initial pick is, in
//! order: the selection persisted in the cache store, the configured
//! default, the first member. A group with no members selects the
//! [`OUTBOUNDLESS`] sentinel.
//!
//! Switching members interrupts connections dialed through the group:
//! internal ones always, client connections only with
//! `interrupt_exist_connections`.

use super::filter::OutboundFilter;
use super::{
    same_outbound, BoxPacketConn, BoxStream, DialContext, InterruptGroup, Outbound, OutboundGroup,
    OutboundManager, OUTBOUNDLESS,
};
use crate::error::OutboundError;
use async_trait::async_trait;
use parking_lot::RwLock;
use sb_config::SelectorOptions;
use sb_types::{Destination, InboundContext, Network};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

struct Members {
    outbounds: Vec<Arc<dyn Outbound>>,
    by_tag: HashMap<String, Arc<dyn Outbound>>,
    selected: Arc<dyn Outbound>,
}

pub struct Selector {
    tag: String,
    tags: Vec<String>,
    uses: Vec<String>,
    filter: OutboundFilter,
    default_tag: String,
    interrupt_external: bool,
    interrupt: InterruptGroup,
    manager: Weak<OutboundManager>,
    members: RwLock<Option<Members>>,
}

impl Selector {
    pub fn new(options: &SelectorOptions, manager: Weak<OutboundManager>) -> Result<Self, OutboundError> {
        let group = &options.group;
        if group.outbounds.is_empty() && group.providers.is_empty() {
            return Err(OutboundError::MissingMembers);
        }
        Ok(Self {
            tag: options.tag.clone(),
            tags: group.outbounds.0.clone(),
            uses: group.providers.0.clone(),
            filter: OutboundFilter::new(group)?,
            default_tag: options.default.clone(),
            interrupt_external: options.interrupt_exist_connections,
            interrupt: InterruptGroup::new(),
            manager,
            members: RwLock::new(None),
        })
    }

    fn manager(&self) -> Result<Arc<OutboundManager>, OutboundError> {
        self.manager
            .upgrade()
            .ok_or_else(|| OutboundError::NotStarted(self.tag.clone()))
    }

    async fn build_members(&self) -> Result<Members, OutboundError> {
        let manager = self.manager()?;
        let mut outbounds = Vec::new();
        let mut by_tag = HashMap::new();
        for (index, tag) in self.tags.iter().enumerate() {
            let outbound = manager.outbound(tag).ok_or_else(|| OutboundError::NotFound {
                index,
                tag: tag.clone(),
            })?;
            by_tag.insert(tag.clone(), outbound.clone());
            outbounds.push(outbound);
        }
        for tag in &self.uses {
            let provider = manager
                .provider(tag)
                .ok_or_else(|| OutboundError::ProviderNotFound(tag.clone()))?;
            for outbound in provider.outbounds().await {
                if self.filter.matches(outbound.as_ref()) {
                    by_tag.insert(outbound.tag(), outbound.clone());
                    outbounds.push(outbound);
                }
            }
        }

        if outbounds.is_empty() {
            let sentinel = manager
                .outbound(OUTBOUNDLESS)
                .ok_or_else(|| OutboundError::UnknownTag(OUTBOUNDLESS.to_string()))?;
            by_tag.insert(OUTBOUNDLESS.to_string(), sentinel.clone());
            return Ok(Members {
                outbounds: vec![sentinel.clone()],
                by_tag,
                selected: sentinel,
            });
        }

        let stored = if self.tag.is_empty() {
            None
        } else {
            manager
                .cache_store()
                .and_then(|store| store.load_selected(&self.tag))
                .and_then(|tag| by_tag.get(&tag).cloned())
        };
        let selected = match stored {
            Some(selected) => selected,
            None if !self.default_tag.is_empty() => by_tag
                .get(&self.default_tag)
                .cloned()
                .ok_or_else(|| OutboundError::DefaultNotFound(self.default_tag.clone()))?,
            None => outbounds[0].clone(),
        };
        Ok(Members {
            outbounds,
            by_tag,
            selected,
        })
    }

    /// Switch to `tag`. Unknown tags are ignored and return false.
    pub fn select_outbound(&self, tag: &str) -> bool {
        let mut guard = self.members.write();
        let Some(members) = guard.as_mut() else {
            return false;
        };
        let Some(detour) = members.by_tag.get(tag).cloned() else {
            return false;
        };
        if same_outbound(&members.selected, &detour) {
            return true;
        }
        members.selected = detour;
        drop(guard);

        if !self.tag.is_empty() {
            if let Some(store) = self.manager.upgrade().and_then(|m| m.cache_store().cloned()) {
                if let Err(e) = store.store_selected(&self.tag, tag) {
                    tracing::error!(target: "sb_core::outbound", group = %self.tag, error = %e, "store selected");
                }
            }
        }
        tracing::debug!(target: "sb_core::outbound", group = %self.tag, selected = %tag, "selected outbound");
        self.interrupt.interrupt(self.interrupt_external);
        true
    }

    /// UI expand flag persisted alongside the selection.
    pub fn is_expand(&self) -> bool {
        self.manager
            .upgrade()
            .and_then(|m| m.cache_store().and_then(|s| s.load_group_expand(&self.tag)))
            .unwrap_or(false)
    }

    pub fn set_expand(&self, expand: bool) -> anyhow::Result<()> {
        match self.manager.upgrade().and_then(|m| m.cache_store().cloned()) {
            Some(store) => store.store_group_expand(&self.tag, expand),
            None => Ok(()),
        }
    }

    fn current(&self) -> Result<Arc<dyn Outbound>, OutboundError> {
        self.selected()
            .ok_or_else(|| OutboundError::NotStarted(self.tag.clone()))
    }
}

#[async_trait]
impl Outbound for Selector {
    fn kind(&self) -> &str {
        "selector"
    }

    fn tag(&self) -> String {
        self.tag.clone()
    }

    fn network(&self) -> Vec<Network> {
        match self.selected() {
            Some(selected) => selected.network(),
            None => Network::ALL.to_vec(),
        }
    }

    fn dependencies(&self) -> Vec<String> {
        self.tags.clone()
    }

    async fn start(&self) -> Result<(), OutboundError> {
        let members = self.build_members().await?;
        tracing::debug!(
            target: "sb_core::outbound",
            group = %self.tag,
            members = members.outbounds.len(),
            selected = %members.selected.tag(),
            "selector started"
        );
        *self.members.write() = Some(members);
        Ok(())
    }

    async fn dial(&self, ctx: DialContext, destination: &Destination) -> Result<BoxStream, OutboundError> {
        let conn = self.current()?.dial(ctx, destination).await?;
        Ok(self.interrupt.new_conn(conn, ctx.external))
    }

    async fn listen_packet(
        &self,
        ctx: DialContext,
        destination: &Destination,
    ) -> Result<BoxPacketConn, OutboundError> {
        let conn = self.current()?.listen_packet(ctx, destination).await?;
        Ok(self.interrupt.new_packet_conn(conn, ctx.external))
    }

    async fn new_connection(
        &self,
        _ctx: DialContext,
        conn: BoxStream,
        metadata: InboundContext,
    ) -> Result<(), OutboundError> {
        self.current()?
            .new_connection(DialContext::EXTERNAL, conn, metadata)
            .await
    }

    async fn new_packet_connection(
        &self,
        _ctx: DialContext,
        conn: BoxPacketConn,
        metadata: InboundContext,
    ) -> Result<(), OutboundError> {
        self.current()?
            .new_packet_connection(DialContext::EXTERNAL, conn, metadata)
            .await
    }

    fn as_group(&self) -> Option<&dyn OutboundGroup> {
        Some(self)
    }
}

#[async_trait]
impl OutboundGroup for Selector {
    fn now(&self) -> String {
        self.members
            .read()
            .as_ref()
            .map(|m| m.selected.tag())
            .unwrap_or_default()
    }

    fn all(&self) -> Vec<String> {
        self.members
            .read()
            .as_ref()
            .map(|m| m.outbounds.iter().map(|o| o.tag()).collect())
            .unwrap_or_default()
    }

    fn selected(&self) -> Option<Arc<dyn Outbound>> {
        self.members.read().as_ref().map(|m| m.selected.clone())
    }

    /// Rebuild when `provider` is used; the previous members stay on failure.
    async fn update_outbounds(&self, provider: &str) -> Result<(), OutboundError> {
        if !self.uses.iter().any(|u| u == provider) {
            return Ok(());
        }
        match self.build_members().await {
            Ok(members) => {
                *self.members.write() = Some(members);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(target: "sb_core::outbound", group = %self.tag, provider, error = %e, "update outbounds reverted");
                Err(e)
            }
        }
    }
}
