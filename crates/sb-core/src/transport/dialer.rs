//! 竞速拨号：并行尝试，保留首个成功连接
//!
//! A logical dial launches [`ATTEMPTS`] identical attempts at once, each
//! retrying up to [`RETRIES`] times. Results are consumed in arrival order.
//! The first success is returned and a background task drains the remaining
//! attempts, dropping (and so closing) every late success. When all attempts
//! fail the last error received is returned.

use super::socket::{self, SocketConfig};
use sb_config::DialerOptions;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;

/// Parallel attempts per logical dial.
pub const ATTEMPTS: usize = 3;
/// Tries per attempt before it reports failure.
pub const RETRIES: usize = 4;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Race [`ATTEMPTS`] runs of `attempt`; the argument is the attempt index.
pub async fn race<T, F, Fut>(attempt: F) -> io::Result<T>
where
    T: Send + 'static,
    F: Fn(usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<T>> + Send + 'static,
{
    let attempt = Arc::new(attempt);
    let (tx, mut rx) = mpsc::channel(ATTEMPTS);
    for index in 0..ATTEMPTS {
        let attempt = attempt.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut result = Err(io::Error::other("dial not attempted"));
            for retry in 0..RETRIES {
                result = attempt(index).await;
                match &result {
                    Ok(_) => break,
                    Err(e) => {
                        tracing::trace!(target: "sb_core::transport", index, retry, error = %e, "dial attempt failed")
                    }
                }
            }
            let _ = tx.send(result).await;
        });
    }
    drop(tx);

    let mut last_error = None;
    while let Some(result) = rx.recv().await {
        match result {
            Ok(conn) => {
                tokio::spawn(async move {
                    while let Some(late) = rx.recv().await {
                        if late.is_ok() {
                            tracing::trace!(target: "sb_core::transport", "closing redundant connection");
                        }
                    }
                });
                return Ok(conn);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| io::Error::other("all dial attempts failed")))
}

/// System-stack dialer applying [`DialerOptions`] to every socket.
#[derive(Debug, Clone)]
pub struct RacingDialer {
    config: Arc<SocketConfig>,
    connect_timeout: Duration,
}

impl Default for RacingDialer {
    fn default() -> Self {
        Self::new(&DialerOptions::default())
    }
}

impl RacingDialer {
    pub fn new(options: &DialerOptions) -> Self {
        Self {
            config: Arc::new(SocketConfig::from(options)),
            connect_timeout: options.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        }
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    pub async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let config = self.config.clone();
        let timeout = self.connect_timeout;
        race(move |_| {
            let config = config.clone();
            async move {
                let socket = socket::tcp_socket(&config, addr)?;
                tokio::time::timeout(timeout, socket.connect(addr))
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))?
            }
        })
        .await
    }

    /// UDP socket in the family of `destination` (IPv4 when unknown).
    pub async fn listen_packet(&self, destination: Option<IpAddr>) -> io::Result<UdpSocket> {
        let config = self.config.clone();
        let ipv6 = destination.is_some_and(|ip| ip.is_ipv6());
        race(move |_| {
            let config = config.clone();
            async move { socket::udp_socket(&config, ipv6) }
        })
        .await
    }
}
