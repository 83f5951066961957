//! 链式代理 (Relay)
//!
//! The chain is rebuilt for every dial from the current selection of each
//! hop, so a selector inside the chain switches the path of new connections
//! only. Hop `i` is chained onto hop `i - 1` through [`Outbound::with_detour`].

use super::{
    resolve_real, BoxPacketConn, BoxStream, DetourDialer, DialContext, InterruptGroup, Outbound,
    OutboundGroup, OutboundManager,
};
use crate::error::OutboundError;
use async_trait::async_trait;
use sb_config::RelayOptions;
use sb_types::{Destination, InboundContext, Network};
use std::sync::{Arc, Weak};

pub struct Relay {
    tag: String,
    tags: Vec<String>,
    interrupt_external: bool,
    interrupt: InterruptGroup,
    manager: Weak<OutboundManager>,
}

impl Relay {
    pub fn new(options: &RelayOptions, manager: Weak<OutboundManager>) -> Result<Self, OutboundError> {
        if options.outbounds.is_empty() {
            return Err(OutboundError::EmptyChain);
        }
        Ok(Self {
            tag: options.tag.clone(),
            tags: options.outbounds.0.clone(),
            interrupt_external: options.interrupt_exist_connections,
            interrupt: InterruptGroup::new(),
            manager,
        })
    }

    fn manager(&self) -> Result<Arc<OutboundManager>, OutboundError> {
        self.manager
            .upgrade()
            .ok_or_else(|| OutboundError::NotStarted(self.tag.clone()))
    }

    async fn hop(&self, manager: &OutboundManager, index: usize) -> Result<Arc<dyn Outbound>, OutboundError> {
        let tag = &self.tags[index];
        let outbound = manager.find_outbound(tag).await.ok_or_else(|| OutboundError::NotFound {
            index,
            tag: tag.clone(),
        })?;
        Ok(resolve_real(outbound))
    }

    /// Outbound for the last hop, dialing through all previous ones.
    async fn chain(&self) -> Result<Arc<dyn Outbound>, OutboundError> {
        let manager = self.manager()?;
        let mut detour = self.hop(&manager, 0).await?;
        for index in 1..self.tags.len() {
            let hop = self.hop(&manager, index).await?;
            detour = hop
                .with_detour(Arc::new(DetourDialer::new(detour)))
                .ok_or_else(|| OutboundError::NotChainable(hop.tag()))?;
        }
        Ok(detour)
    }
}

#[async_trait]
impl Outbound for Relay {
    fn kind(&self) -> &str {
        "relay"
    }

    fn tag(&self) -> String {
        self.tag.clone()
    }

    /// Networks of the first hop, which carries everything.
    fn network(&self) -> Vec<Network> {
        match self.manager.upgrade().and_then(|m| m.outbound(&self.tags[0])) {
            Some(first) => first.network(),
            None => Network::ALL.to_vec(),
        }
    }

    fn dependencies(&self) -> Vec<String> {
        self.tags.clone()
    }

    async fn start(&self) -> Result<(), OutboundError> {
        let manager = self.manager()?;
        for (index, tag) in self.tags.iter().enumerate() {
            let outbound = manager.find_outbound(tag).await.ok_or_else(|| OutboundError::NotFound {
                index,
                tag: tag.clone(),
            })?;
            if outbound.is_relay() {
                return Err(OutboundError::NestedRelay(tag.clone()));
            }
        }
        tracing::debug!(target: "sb_core::outbound", group = %self.tag, hops = self.tags.len(), "relay started");
        Ok(())
    }

    async fn dial(&self, ctx: DialContext, destination: &Destination) -> Result<BoxStream, OutboundError> {
        let conn = self.chain().await?.dial(ctx, destination).await?;
        Ok(self.interrupt.new_conn(conn, ctx.external))
    }

    async fn listen_packet(
        &self,
        ctx: DialContext,
        destination: &Destination,
    ) -> Result<BoxPacketConn, OutboundError> {
        let conn = self.chain().await?.listen_packet(ctx, destination).await?;
        Ok(self.interrupt.new_packet_conn(conn, ctx.external))
    }

    async fn new_connection(
        &self,
        _ctx: DialContext,
        conn: BoxStream,
        metadata: InboundContext,
    ) -> Result<(), OutboundError> {
        let destination = metadata.destination.clone().ok_or(OutboundError::MissingDestination)?;
        let remote = self.dial(DialContext::EXTERNAL, &destination).await?;
        super::relay_stream(conn, remote).await
    }

    async fn new_packet_connection(
        &self,
        _ctx: DialContext,
        conn: BoxPacketConn,
        metadata: InboundContext,
    ) -> Result<(), OutboundError> {
        let destination = metadata.destination.clone().ok_or(OutboundError::MissingDestination)?;
        let remote = self.listen_packet(DialContext::EXTERNAL, &destination).await?;
        super::relay_packets(conn, remote).await
    }

    fn as_group(&self) -> Option<&dyn OutboundGroup> {
        Some(self)
    }

    fn is_relay(&self) -> bool {
        true
    }
}

#[async_trait]
impl OutboundGroup for Relay {
    fn now(&self) -> String {
        String::new()
    }

    fn all(&self) -> Vec<String> {
        self.tags.clone()
    }

    fn selected(&self) -> Option<Arc<dyn Outbound>> {
        let manager = self.manager.upgrade()?;
        let last = self.tags.last()?;
        manager.outbound(last).map(resolve_real)
    }

    /// Chains are built per dial, so membership never changes. Connections
    /// through hops owned by `provider` are closed because the provider has
    /// replaced those outbounds.
    async fn update_outbounds(&self, provider: &str) -> Result<(), OutboundError> {
        let Some(provider) = self.manager.upgrade().and_then(|m| m.provider(provider)) else {
            return Ok(());
        };
        for tag in &self.tags {
            if provider.outbound(tag).await.is_some() {
                self.interrupt.interrupt(self.interrupt_external);
                break;
            }
        }
        Ok(())
    }
}
