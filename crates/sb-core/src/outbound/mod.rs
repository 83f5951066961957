//! Outbound 抽象与分组
//!
//! Every outbound exposes dial / listen-packet plus the connection handoff
//! entry points the router uses. Groups (selector, relay) are outbounds that
//! additionally implement [`OutboundGroup`]; the router and other groups see
//! through them with [`resolve_real`].
//!
//! Connections handed out by a group are wrapped by its [`InterruptGroup`], so
//! switching the active member can close what was dialed through the old one.

pub mod block;
pub mod direct;
pub mod filter;
pub mod interrupt;
pub mod manager;
pub mod relay;
pub mod selector;

pub use block::BlockOutbound;
pub use direct::DirectOutbound;
pub use filter::OutboundFilter;
pub use interrupt::InterruptGroup;
pub use manager::OutboundManager;
pub use relay::Relay;
pub use selector::Selector;

use crate::error::OutboundError;
use async_trait::async_trait;
use sb_types::{Destination, InboundContext, Network};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;

/// Selector member used when a group has nothing to select.
pub const OUTBOUNDLESS: &str = "OUTBOUNDLESS";

/// Idle time after which a relayed packet session is dropped.
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Bidirectional byte stream produced by an outbound.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

/// Datagram session addressed per packet.
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn send_to(&self, buf: &[u8], target: &Destination) -> io::Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Destination)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

pub type BoxPacketConn = Box<dyn PacketConn>;

#[async_trait]
impl PacketConn for UdpSocket {
    async fn send_to(&self, buf: &[u8], target: &Destination) -> io::Result<usize> {
        match target {
            Destination::Socket(addr) => UdpSocket::send_to(self, buf, addr).await,
            Destination::Domain(host, _) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("udp target {host} is not resolved"),
            )),
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Destination)> {
        let (n, from) = UdpSocket::recv_from(self, buf).await?;
        Ok((n, Destination::Socket(from)))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Per-dial flags carried from the router down through groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialContext {
    /// The connection was accepted from a client rather than opened by the core.
    pub external: bool,
}

impl DialContext {
    pub const EXTERNAL: Self = Self { external: true };
}

/// Transport an outbound reaches its server through.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, destination: &Destination) -> Result<BoxStream, OutboundError>;
    async fn listen_packet(&self, destination: &Destination) -> Result<BoxPacketConn, OutboundError>;
}

/// Uses an outbound as the dialer of the next hop in a chain.
pub struct DetourDialer {
    outbound: Arc<dyn Outbound>,
}

impl DetourDialer {
    pub fn new(outbound: Arc<dyn Outbound>) -> Self {
        Self { outbound }
    }
}

#[async_trait]
impl Dialer for DetourDialer {
    async fn dial(&self, destination: &Destination) -> Result<BoxStream, OutboundError> {
        self.outbound.dial(DialContext::default(), destination).await
    }

    async fn listen_packet(&self, destination: &Destination) -> Result<BoxPacketConn, OutboundError> {
        self.outbound.listen_packet(DialContext::default(), destination).await
    }
}

#[async_trait]
pub trait Outbound: Send + Sync {
    /// Protocol name ("direct", "selector", ...).
    fn kind(&self) -> &str;
    fn tag(&self) -> String;
    /// Rename; used when provider outbounds are de-duplicated.
    fn set_tag(&self, _tag: &str) {}
    /// Server port, 0 when the outbound has none.
    fn port(&self) -> u16 {
        0
    }
    fn network(&self) -> Vec<Network> {
        Network::ALL.to_vec()
    }
    /// Tags that must be started before this outbound.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn start(&self) -> Result<(), OutboundError> {
        Ok(())
    }

    async fn close(&self) {}

    async fn dial(&self, ctx: DialContext, destination: &Destination) -> Result<BoxStream, OutboundError>;

    async fn listen_packet(
        &self,
        ctx: DialContext,
        destination: &Destination,
    ) -> Result<BoxPacketConn, OutboundError>;

    /// Take over an accepted stream: dial its destination and pipe both ways.
    async fn new_connection(
        &self,
        ctx: DialContext,
        conn: BoxStream,
        metadata: InboundContext,
    ) -> Result<(), OutboundError> {
        let destination = metadata.destination.clone().ok_or(OutboundError::MissingDestination)?;
        let remote = self.dial(ctx, &destination).await?;
        relay_stream(conn, remote).await
    }

    /// Take over an accepted packet session.
    async fn new_packet_connection(
        &self,
        ctx: DialContext,
        conn: BoxPacketConn,
        metadata: InboundContext,
    ) -> Result<(), OutboundError> {
        let destination = metadata.destination.clone().ok_or(OutboundError::MissingDestination)?;
        let remote = self.listen_packet(ctx, &destination).await?;
        relay_packets(conn, remote).await
    }

    fn as_group(&self) -> Option<&dyn OutboundGroup> {
        None
    }

    fn is_relay(&self) -> bool {
        false
    }

    /// Copy of this outbound that reaches its server through `detour`.
    /// `None` when the protocol cannot be chained.
    fn with_detour(&self, _detour: Arc<dyn Dialer>) -> Option<Arc<dyn Outbound>> {
        None
    }
}

/// Outbound made of other outbounds.
#[async_trait]
pub trait OutboundGroup: Send + Sync {
    /// Tag of the active member, empty when there is none.
    fn now(&self) -> String;
    fn all(&self) -> Vec<String>;
    /// Member connections currently go through.
    fn selected(&self) -> Option<Arc<dyn Outbound>>;
    /// Rebuild membership after `provider` changed its outbounds.
    async fn update_outbounds(&self, provider: &str) -> Result<(), OutboundError>;
}

/// Max group nesting followed by [`resolve_real`].
const MAX_GROUP_DEPTH: usize = 16;

/// Follow group selections down to a concrete outbound. Relays are concrete.
pub fn resolve_real(mut outbound: Arc<dyn Outbound>) -> Arc<dyn Outbound> {
    for _ in 0..MAX_GROUP_DEPTH {
        if outbound.is_relay() {
            break;
        }
        let next = outbound.as_group().and_then(|g| g.selected());
        match next {
            Some(next) if !same_outbound(&next, &outbound) => outbound = next,
            _ => break,
        }
    }
    outbound
}

/// Identity comparison that ignores vtable addresses.
pub(crate) fn same_outbound(a: &Arc<dyn Outbound>, b: &Arc<dyn Outbound>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Copy both directions until either side closes.
pub async fn relay_stream(mut client: BoxStream, mut remote: BoxStream) -> Result<(), OutboundError> {
    match tokio::io::copy_bidirectional(&mut client, &mut remote).await {
        Ok((up, down)) => {
            tracing::trace!(target: "sb_core::outbound", up, down, "stream closed");
            Ok(())
        }
        Err(e) if is_closed(&e) => Ok(()),
        Err(e) => Err(OutboundError::Dial(e)),
    }
}

/// Forward datagrams both ways until a side fails or the session idles out.
pub async fn relay_packets(client: BoxPacketConn, remote: BoxPacketConn) -> Result<(), OutboundError> {
    let mut up = vec![0u8; 65535];
    let mut down = vec![0u8; 65535];
    loop {
        let step = async {
            tokio::select! {
                r = client.recv_from(&mut up) => {
                    let (n, target) = r?;
                    remote.send_to(&up[..n], &target).await.map(|_| ())
                }
                r = remote.recv_from(&mut down) => {
                    let (n, source) = r?;
                    client.send_to(&down[..n], &source).await.map(|_| ())
                }
            }
        };
        match tokio::time::timeout(UDP_IDLE_TIMEOUT, step).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if is_closed(&e) => return Ok(()),
            Ok(Err(e)) => return Err(OutboundError::Dial(e)),
            Err(_) => {
                tracing::trace!(target: "sb_core::outbound", "packet session idle");
                return Ok(());
            }
        }
    }
}

fn is_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
