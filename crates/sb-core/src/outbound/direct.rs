//! 直连出站
//!
//! Domains are resolved through the DNS router when one is configured,
//! else the system resolver. Each resolved address is tried in order with
//! the racing dialer. With `detour` set, dialing goes through that outbound
//! instead of the system stack.

use super::{BoxPacketConn, BoxStream, DialContext, Outbound, OutboundManager};
use crate::dns::{DnsQueryOptions, DnsRouter};
use crate::error::OutboundError;
use crate::transport::RacingDialer;
use async_trait::async_trait;
use parking_lot::RwLock;
use sb_config::DirectOptions;
use sb_types::{Destination, InboundContext};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

pub struct DirectOutbound {
    tag: RwLock<String>,
    dialer: RacingDialer,
    resolver: Option<Arc<DnsRouter>>,
    detour: String,
    manager: Weak<OutboundManager>,
}

impl DirectOutbound {
    pub fn new(options: &DirectOptions, resolver: Option<Arc<DnsRouter>>, manager: Weak<OutboundManager>) -> Self {
        Self {
            tag: RwLock::new(options.tag.clone()),
            dialer: RacingDialer::new(&options.dialer),
            resolver,
            detour: options.dialer.detour.clone(),
            manager,
        }
    }

    async fn detour(&self) -> Result<Option<Arc<dyn Outbound>>, OutboundError> {
        if self.detour.is_empty() {
            return Ok(None);
        }
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| OutboundError::NotStarted(self.tag()))?;
        manager
            .find_outbound(&self.detour)
            .await
            .map(Some)
            .ok_or_else(|| OutboundError::UnknownTag(self.detour.clone()))
    }

    async fn resolve(&self, destination: &Destination) -> Result<Vec<SocketAddr>, OutboundError> {
        match destination {
            Destination::Socket(addr) => Ok(vec![*addr]),
            Destination::Domain(host, port) => match &self.resolver {
                Some(resolver) => {
                    let ips = resolver
                        .lookup(host, &InboundContext::default(), DnsQueryOptions::default())
                        .await?;
                    Ok(ips.into_iter().map(|ip| SocketAddr::new(ip, *port)).collect())
                }
                None => Ok(tokio::net::lookup_host((host.as_str(), *port)).await?.collect()),
            },
        }
    }
}

#[async_trait]
impl Outbound for DirectOutbound {
    fn kind(&self) -> &str {
        "direct"
    }

    fn tag(&self) -> String {
        self.tag.read().clone()
    }

    fn set_tag(&self, tag: &str) {
        *self.tag.write() = tag.to_string();
    }

    fn dependencies(&self) -> Vec<String> {
        if self.detour.is_empty() {
            Vec::new()
        } else {
            vec![self.detour.clone()]
        }
    }

    async fn dial(&self, ctx: DialContext, destination: &Destination) -> Result<BoxStream, OutboundError> {
        if let Some(detour) = self.detour().await? {
            return detour.dial(ctx, destination).await;
        }
        let mut last_error = None;
        for addr in self.resolve(destination).await? {
            match self.dialer.connect(addr).await {
                Ok(stream) => {
                    tracing::trace!(target: "sb_core::outbound", tag = %self.tag(), %addr, "direct connected");
                    return Ok(Box::new(stream));
                }
                Err(e) => {
                    tracing::debug!(target: "sb_core::outbound", %addr, error = %e, "direct connect failed");
                    last_error = Some(e);
                }
            }
        }
        Err(OutboundError::Dial(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for {destination}"))
        })))
    }

    async fn listen_packet(
        &self,
        ctx: DialContext,
        destination: &Destination,
    ) -> Result<BoxPacketConn, OutboundError> {
        if let Some(detour) = self.detour().await? {
            return detour.listen_packet(ctx, destination).await;
        }
        let family = match destination {
            Destination::Socket(addr) => Some(addr.ip()),
            Destination::Domain(..) => None,
        };
        Ok(Box::new(self.dialer.listen_packet(family).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_config::{BlockOptions, DialerOptions, OutboundOptions};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dials_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let direct = DirectOutbound::new(&DirectOptions::default(), None, Weak::new());
        let accept = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            buf
        });
        let mut conn = direct.dial(DialContext::default(), &Destination::Socket(addr)).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn detour_is_followed() {
        let manager = OutboundManager::new(None);
        manager
            .create(&OutboundOptions::Block(BlockOptions { tag: "blk".into() }), None)
            .unwrap();
        let options = DirectOptions {
            tag: "d".into(),
            dialer: DialerOptions {
                detour: "blk".into(),
                ..Default::default()
            },
        };
        let direct = manager.create(&OutboundOptions::Direct(options), None).unwrap();
        assert_eq!(direct.dependencies(), vec!["blk"]);
        let err = direct
            .dial(DialContext::default(), &Destination::domain("example.com", 80))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, OutboundError::Refused(tag) if tag == "blk"));
    }

    #[test]
    fn tag_can_be_renamed() {
        let direct = DirectOutbound::new(&DirectOptions::default(), None, Weak::new());
        direct.set_tag("direct[1]");
        assert_eq!(direct.tag(), "direct[1]");
    }
}
