//! 路由决策引擎 / Routing decision engine
//!
//! Glue between inbounds and outbounds: optional sniffing, optional domain
//! resolution, the route rule walk with its fallback chain, and dispatch to
//! the chosen outbound. The rule list is an `Arc` snapshot, so a hot swap
//! never blocks connections already being routed.

use super::rule::{build_route_rule, Rule, RuleContext};
use super::sniff::{self, SniffedMetadata, DEFAULT_SNIFF_TIMEOUT, PACKET_DETECTORS, STREAM_DETECTORS};
use crate::dns::{DnsQueryOptions, DnsRouter};
use crate::error::{OutboundError, RuleError};
use crate::outbound::{BoxPacketConn, BoxStream, DialContext, Outbound, OutboundManager, PacketConn};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use sb_config::{InboundOptions, RouteRuleOptions};
use sb_types::{Destination, DomainStrategy, InboundContext, Network};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Outcome of one routing decision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteResult {
    /// Outbound tag the connection is handed to
    /// 连接交给的出站标签
    pub outbound: String,
    /// Index of the matched rule; `None` when the final outbound was used
    /// 命中规则的序号；走最终出站时为 `None`
    pub matched_rule: Option<usize>,
    /// Fallback entry that replaced the rule outbound
    /// 替换规则出站的回退条目
    pub fallback: Option<String>,
    /// Addresses resolved while routing
    /// 路由过程中解析出的地址
    pub resolved_ips: Vec<IpAddr>,
    /// Sniffed protocol, if any
    /// 嗅探到的协议
    pub sniffed_protocol: Option<String>,
    /// Sniffed domain, if any
    /// 嗅探到的域名
    pub sniffed_domain: Option<String>,
}

/// Per-inbound sniff and resolve policy.
pub struct InboundPolicy {
    pub sniff: bool,
    pub sniff_override_destination: bool,
    pub sniff_timeout: Duration,
    pub domain_strategy: Option<DomainStrategy>,
    /// Empty means every sniffed connection may override its destination.
    pub override_rules: Vec<Rule>,
}

impl InboundPolicy {
    pub fn new(options: &InboundOptions, ctx: &RuleContext) -> Result<Self, RuleError> {
        let override_rules = options
            .sniff_override_rules
            .iter()
            .map(|r| build_route_rule(r, ctx))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            sniff: options.sniff,
            sniff_override_destination: options.sniff_override_destination,
            sniff_timeout: options.sniff_timeout.unwrap_or(DEFAULT_SNIFF_TIMEOUT),
            domain_strategy: options.domain_strategy,
            override_rules,
        })
    }

    fn allows_override(&self, metadata: &mut InboundContext) -> bool {
        if !self.sniff_override_destination {
            return false;
        }
        if self.override_rules.is_empty() {
            return true;
        }
        let matched = self.override_rules.iter().any(|rule| {
            metadata.reset_rule_cache();
            rule.matches(metadata)
        });
        metadata.reset_rule_cache();
        matched
    }
}

pub struct Router {
    rules: RwLock<Arc<Vec<Rule>>>,
    inbounds: HashMap<String, InboundPolicy>,
    final_outbound: String,
    outbounds: Arc<OutboundManager>,
    dns: Option<Arc<DnsRouter>>,
    ctx: RuleContext,
}

impl Router {
    pub fn new(
        rules: &[RouteRuleOptions],
        final_outbound: impl Into<String>,
        inbounds: &[InboundOptions],
        outbounds: Arc<OutboundManager>,
        dns: Option<Arc<DnsRouter>>,
        ctx: RuleContext,
    ) -> Result<Self, RuleError> {
        let inbounds = inbounds
            .iter()
            .map(|options| Ok((options.tag.clone(), InboundPolicy::new(options, &ctx)?)))
            .collect::<Result<HashMap<_, _>, RuleError>>()?;
        let router = Self {
            rules: RwLock::new(Arc::new(Vec::new())),
            inbounds,
            final_outbound: final_outbound.into(),
            outbounds,
            dns,
            ctx,
        };
        router.update_rules(rules)?;
        Ok(router)
    }

    /// Hot-swap the route rules. On error the previous rules stay active.
    pub fn update_rules(&self, options: &[RouteRuleOptions]) -> Result<(), RuleError> {
        let rules = options
            .iter()
            .map(|r| build_route_rule(r, &self.ctx))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::info!(target: "sb_core::router", count = rules.len(), "route rules updated");
        *self.rules.write() = Arc::new(rules);
        Ok(())
    }

    /// Current rule snapshot, for toggling and inspection.
    pub fn rules(&self) -> Arc<Vec<Rule>> {
        self.rules.read().clone()
    }

    pub fn outbounds(&self) -> &Arc<OutboundManager> {
        &self.outbounds
    }

    pub fn context(&self) -> &RuleContext {
        &self.ctx
    }

    /// Decide the outbound for `metadata` without dispatching anything.
    pub async fn route(&self, metadata: &mut InboundContext) -> RouteResult {
        let strategy = self.inbounds.get(&metadata.inbound).and_then(|p| p.domain_strategy);
        if let Some(strategy) = strategy {
            metadata.domain_strategy = strategy;
            self.resolve_destination(metadata, strategy).await;
        }

        let mut result = RouteResult {
            sniffed_protocol: Some(metadata.protocol.clone()).filter(|p| !p.is_empty()),
            sniffed_domain: Some(metadata.domain.clone()).filter(|d| !d.is_empty()),
            ..Default::default()
        };
        let rules = self.rules();
        for (index, rule) in rules.iter().enumerate() {
            if rule.is_disabled() {
                continue;
            }
            metadata.reset_rule_cache();
            if !rule.matches(metadata) {
                continue;
            }
            tracing::debug!(target: "sb_core::router", index, rule = %rule, outbound = rule.outbound(), "match rule");
            result.matched_rule = Some(index);
            result.outbound = rule.outbound().to_string();
            if !rule.fallback().is_empty() {
                if metadata.destination_addresses.is_empty() && !rule.skip_resolve() {
                    let strategy = metadata.domain_strategy;
                    self.resolve_destination(metadata, strategy).await;
                }
                if let Some((outbound, description)) = self.follow_fallback(rule, metadata).await {
                    result.outbound = outbound;
                    result.fallback = Some(description);
                }
            }
            break;
        }
        metadata.reset_rule_cache();

        if result.outbound.is_empty() {
            result.outbound = if self.final_outbound.is_empty() {
                self.outbounds.default_outbound().map(|o| o.tag()).unwrap_or_default()
            } else {
                self.final_outbound.clone()
            };
        }
        result.resolved_ips = metadata.destination_addresses.clone();
        metadata.outbound = result.outbound.clone();
        result
    }

    /// Scan the rule's fallback chain against the resolved addresses. An entry
    /// naming a missing outbound is skipped and the scan resumes after it.
    async fn follow_fallback(&self, rule: &Rule, metadata: &InboundContext) -> Option<(String, String)> {
        if metadata.destination_addresses.is_empty() {
            return None;
        }
        let mut probe = InboundContext::for_dns_fallback(metadata.destination_addresses.clone());
        let mut after = None;
        while let Some(hit) = rule.match_fallback(&mut probe, after) {
            if hit.server.is_empty() {
                return None;
            }
            if self.outbounds.find_outbound(&hit.server).await.is_some() {
                tracing::debug!(target: "sb_core::router", fallback = %hit.description, outbound = %hit.server, "match fallback");
                return Some((hit.server, hit.description));
            }
            tracing::warn!(target: "sb_core::router", outbound = %hit.server, "fallback outbound not found");
            after = Some(hit.index);
        }
        None
    }

    async fn resolve_destination(&self, metadata: &mut InboundContext, strategy: DomainStrategy) {
        let Some(dns) = &self.dns else {
            return;
        };
        let Some(Destination::Domain(host, _)) = metadata.destination.clone() else {
            return;
        };
        match dns.lookup(&host, metadata, DnsQueryOptions::with_strategy(strategy)).await {
            Ok(addresses) => metadata.destination_addresses = addresses,
            Err(e) => {
                tracing::debug!(target: "sb_core::router", domain = %host, error = %e, "resolve destination failed")
            }
        }
    }

    fn sniff_applied(&self, metadata: &mut InboundContext, sniffed: &SniffedMetadata) {
        sniffed.apply(metadata);
        let Some(policy) = self.inbounds.get(&metadata.inbound) else {
            return;
        };
        if sniffed.domain.is_empty() || !policy.allows_override(metadata) {
            return;
        }
        if let Some(destination) = &metadata.destination {
            let overridden = destination.with_domain(sniffed.domain.clone());
            tracing::debug!(target: "sb_core::router", from = %destination, to = %overridden, "override destination");
            metadata.destination = Some(overridden);
        }
    }

    async fn dispatch_target(&self, result: &RouteResult) -> Result<Arc<dyn Outbound>, OutboundError> {
        self.outbounds
            .find_outbound(&result.outbound)
            .await
            .ok_or_else(|| OutboundError::UnknownTag(result.outbound.clone()))
    }

    /// Route a stream connection and relay it until either side closes.
    pub async fn route_connection(
        &self,
        mut conn: BoxStream,
        mut metadata: InboundContext,
    ) -> Result<(), OutboundError> {
        metadata.network = Some(Network::Tcp);
        let mut buffer = BytesMut::new();
        let policy = self.inbounds.get(&metadata.inbound).map(|p| (p.sniff, p.sniff_timeout));
        if let Some((true, timeout)) = policy {
            match sniff::peek_stream(&mut conn, &mut buffer, timeout, STREAM_DETECTORS).await {
                Ok(sniffed) => self.sniff_applied(&mut metadata, &sniffed),
                Err(e) => tracing::trace!(target: "sb_core::router", inbound = %metadata.inbound, error = %e, "sniff stream"),
            }
        }

        let result = self.route(&mut metadata).await;
        let outbound = self.dispatch_target(&result).await?;
        tracing::info!(
            target: "sb_core::router",
            inbound = %metadata.inbound,
            destination = ?metadata.destination,
            outbound = %result.outbound,
            "route connection"
        );
        let conn: BoxStream = if buffer.is_empty() {
            conn
        } else {
            Box::new(ReplayStream::new(buffer.freeze(), conn))
        };
        outbound.new_connection(DialContext::EXTERNAL, conn, metadata).await
    }

    /// Route a packet connection. The first datagram is sniffed and replayed.
    pub async fn route_packet_connection(
        &self,
        conn: BoxPacketConn,
        mut metadata: InboundContext,
    ) -> Result<(), OutboundError> {
        metadata.network = Some(Network::Udp);
        let sniff_enabled = self.inbounds.get(&metadata.inbound).map_or(false, |p| p.sniff);
        let conn: BoxPacketConn = if sniff_enabled {
            let mut buf = vec![0u8; 64 * 1024];
            let (n, from) = conn.recv_from(&mut buf).await?;
            buf.truncate(n);
            match sniff::peek_packet(&buf, PACKET_DETECTORS).await {
                Ok(sniffed) => self.sniff_applied(&mut metadata, &sniffed),
                Err(e) => tracing::trace!(target: "sb_core::router", inbound = %metadata.inbound, error = %e, "sniff packet"),
            }
            Box::new(ReplayPacketConn::new(Bytes::from(buf), from, conn))
        } else {
            conn
        };

        let result = self.route(&mut metadata).await;
        let outbound = self.dispatch_target(&result).await?;
        tracing::info!(
            target: "sb_core::router",
            inbound = %metadata.inbound,
            destination = ?metadata.destination,
            outbound = %result.outbound,
            "route packet connection"
        );
        outbound.new_packet_connection(DialContext::EXTERNAL, conn, metadata).await
    }
}

/// Stream that yields already-read bytes before reading from `inner`.
pub struct ReplayStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> ReplayStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.prefix.has_remaining() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Packet connection that returns one already-received datagram first.
struct ReplayPacketConn {
    first: Mutex<Option<(Bytes, Destination)>>,
    inner: BoxPacketConn,
}

impl ReplayPacketConn {
    fn new(packet: Bytes, from: Destination, inner: BoxPacketConn) -> Self {
        Self {
            first: Mutex::new(Some((packet, from))),
            inner,
        }
    }
}

#[async_trait]
impl PacketConn for ReplayPacketConn {
    async fn send_to(&self, buf: &[u8], target: &Destination) -> io::Result<usize> {
        self.inner.send_to(buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Destination)> {
        let first = self.first.lock().take();
        if let Some((packet, from)) = first {
            let n = packet.len().min(buf.len());
            buf[..n].copy_from_slice(&packet[..n]);
            return Ok((n, from));
        }
        self.inner.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_config::{BlockOptions, OutboundOptions};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn rule(json: &str) -> RouteRuleOptions {
        serde_json::from_str(json).unwrap()
    }

    fn manager(tags: &[&str]) -> Arc<OutboundManager> {
        let manager = OutboundManager::new(None);
        for tag in tags {
            manager
                .create(&OutboundOptions::Block(BlockOptions { tag: tag.to_string() }), None)
                .unwrap();
        }
        manager
    }

    fn context(domain: &str, port: u16) -> InboundContext {
        let mut m = InboundContext::new("in", Network::Tcp);
        m.destination = Some(Destination::domain(domain, port));
        m
    }

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let rules = [
            rule(r#"{"domain_suffix": "example.com", "outbound": "a"}"#),
            rule(r#"{"port": 443, "outbound": "b"}"#),
        ];
        let router = Router::new(&rules, "fin", &[], manager(&["a", "b", "fin"]), None, RuleContext::default()).unwrap();

        let result = router.route(&mut context("www.example.com", 443)).await;
        assert_eq!(result.outbound, "a");
        assert_eq!(result.matched_rule, Some(0));

        let result = router.route(&mut context("other.org", 443)).await;
        assert_eq!((result.outbound.as_str(), result.matched_rule), ("b", Some(1)));

        let result = router.route(&mut context("other.org", 80)).await;
        assert_eq!((result.outbound.as_str(), result.matched_rule), ("fin", None));
    }

    #[tokio::test]
    async fn disabled_rule_is_skipped() {
        let rules = [
            rule(r#"{"domain": "x.test", "outbound": "a"}"#),
            rule(r#"{"domain": "x.test", "outbound": "b"}"#),
        ];
        let router = Router::new(&rules, "", &[], manager(&["a", "b"]), None, RuleContext::default()).unwrap();
        router.rules()[0].set_disabled(true);
        assert_eq!(router.route(&mut context("x.test", 1)).await.outbound, "b");
    }

    #[tokio::test]
    async fn falls_back_to_manager_default() {
        let router = Router::new(&[], "", &[], manager(&["first", "second"]), None, RuleContext::default()).unwrap();
        assert_eq!(router.route(&mut context("x.test", 1)).await.outbound, "first");
    }

    #[tokio::test]
    async fn fallback_chain_skips_missing_outbound() {
        let rules = [rule(
            r#"{"domain": "x.test", "outbound": "a",
                "fallback_rules": [
                    {"ip_is_private": true, "server": "gone"},
                    {"ip_cidr": ["10.0.0.0/8"], "server": "b"}
                ]}"#,
        )];
        let router = Router::new(&rules, "", &[], manager(&["a", "b"]), None, RuleContext::default()).unwrap();
        let mut m = context("x.test", 80);
        m.destination_addresses = vec!["10.1.2.3".parse().unwrap()];
        let result = router.route(&mut m).await;
        assert_eq!(result.outbound, "b");
        assert!(result.fallback.is_some());

        let mut m = context("x.test", 80);
        m.destination_addresses = vec!["1.1.1.1".parse().unwrap()];
        assert_eq!(router.route(&mut m).await.outbound, "a");
    }

    #[tokio::test]
    async fn replay_stream_yields_prefix_first() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(b" world").await.unwrap();
        drop(server);
        let mut stream = ReplayStream::new(Bytes::from_static(b"hello"), client);
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn sniffed_domain_overrides_destination() {
        let inbound: InboundOptions = serde_json::from_str(
            r#"{"tag": "in", "type": "mixed", "sniff": true, "sniff_override_destination": true}"#,
        )
        .unwrap();
        let rules = [rule(r#"{"domain": "sniffed.test", "outbound": "a"}"#)];
        let router = Router::new(&rules, "fin", &[inbound], manager(&["a", "fin"]), None, RuleContext::default()).unwrap();

        let mut m = InboundContext::new("in", Network::Tcp);
        m.destination = Some(Destination::ip("93.184.216.34".parse().unwrap(), 80));
        router.sniff_applied(&mut m, &SniffedMetadata::with_domain("http", "sniffed.test"));
        assert_eq!(m.destination, Some(Destination::domain("sniffed.test", 80)));
        assert_eq!(m.protocol, "http");
        assert_eq!(router.route(&mut m).await.outbound, "a");
    }

    #[tokio::test]
    async fn routed_stream_reaches_outbound() {
        let inbound: InboundOptions =
            serde_json::from_str(r#"{"tag": "in", "type": "mixed", "sniff": true}"#).unwrap();
        let router = Router::new(&[], "blk", &[inbound], manager(&["blk"]), None, RuleContext::default()).unwrap();
        let (client, mut peer) = tokio::io::duplex(1024);
        peer.write_all(b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\n").await.unwrap();
        let err = router
            .route_connection(Box::new(client), context("a.test", 80))
            .await
            .unwrap_err();
        assert!(matches!(err, OutboundError::Refused(tag) if tag == "blk"));
    }
}
