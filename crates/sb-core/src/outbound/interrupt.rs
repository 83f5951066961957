//! Connection interruption for groups / 分组连接中断
//!
//! A group hands out every stream and packet session wrapped with a token
//! from one of two generations: internal (opened by the core) or external
//! (accepted from clients). [`InterruptGroup::interrupt`] cancels the internal
//! generation, and the external one when asked, then starts fresh tokens so
//! later connections are unaffected.

use super::{BoxPacketConn, BoxStream, PacketConn};
use async_trait::async_trait;
use parking_lot::Mutex;
use sb_types::Destination;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

#[derive(Debug, Default)]
pub struct InterruptGroup {
    internal: Mutex<CancellationToken>,
    external: Mutex<CancellationToken>,
}

impl InterruptGroup {
    pub fn new() -> Self {
        Self::default()
    }

    fn token(&self, external: bool) -> CancellationToken {
        if external {
            self.external.lock().clone()
        } else {
            self.internal.lock().clone()
        }
    }

    pub fn new_conn(&self, conn: BoxStream, external: bool) -> BoxStream {
        Box::new(InterruptStream::new(conn, self.token(external)))
    }

    pub fn new_packet_conn(&self, conn: BoxPacketConn, external: bool) -> BoxPacketConn {
        Box::new(InterruptPacketConn {
            inner: conn,
            token: self.token(external),
        })
    }

    /// Close internal connections, and external ones when `external` is set.
    pub fn interrupt(&self, external: bool) {
        std::mem::take(&mut *self.internal.lock()).cancel();
        if external {
            std::mem::take(&mut *self.external.lock()).cancel();
        }
        tracing::debug!(target: "sb_core::outbound", external, "interrupted group connections");
    }
}

fn interrupted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection interrupted")
}

/// Stream that fails every operation once its token is cancelled.
pub struct InterruptStream<S> {
    inner: S,
    token: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<S> InterruptStream<S> {
    pub fn new(inner: S, token: CancellationToken) -> Self {
        let cancelled = Box::pin(token.clone().cancelled_owned());
        Self {
            inner,
            token,
            cancelled,
        }
    }

    /// Registers the waker so a pending operation wakes up on interrupt.
    fn poll_interrupted(&mut self, cx: &mut Context<'_>) -> bool {
        self.token.is_cancelled() || self.cancelled.as_mut().poll(cx).is_ready()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for InterruptStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_interrupted(cx) {
            return Poll::Ready(Err(interrupted()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for InterruptStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_interrupted(cx) {
            return Poll::Ready(Err(interrupted()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_interrupted(cx) {
            return Poll::Ready(Err(interrupted()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

struct InterruptPacketConn {
    inner: BoxPacketConn,
    token: CancellationToken,
}

#[async_trait]
impl PacketConn for InterruptPacketConn {
    async fn send_to(&self, buf: &[u8], target: &Destination) -> io::Result<usize> {
        if self.token.is_cancelled() {
            return Err(interrupted());
        }
        self.inner.send_to(buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Destination)> {
        tokio::select! {
            _ = self.token.cancelled() => Err(interrupted()),
            r = self.inner.recv_from(buf) => r,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
