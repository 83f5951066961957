//! Mock outbound
use async_trait::async_trait;
use parking_lot::Mutex;
use sb_core::outbound::{BoxPacketConn, BoxStream, DialContext, Dialer, Outbound};
use sb_core::OutboundError;
use sb_types::{Destination, Network};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Tags of the outbounds that dialed, in completion order. Shared between a
/// mock and the copies `with_detour` makes of it.
pub type DialLog = Arc<Mutex<Vec<String>>>;

/// Outbound whose connections echo back whatever is written.
pub struct MockOutbound {
    tag: parking_lot::RwLock<String>,
    port: u16,
    network: Vec<Network>,
    refuse: bool,
    detour: Option<Arc<dyn Dialer>>,
    log: DialLog,
    dials: Arc<AtomicUsize>,
}

impl MockOutbound {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: parking_lot::RwLock::new(tag.to_string()),
            port: 0,
            network: Network::ALL.to_vec(),
            refuse: false,
            detour: None,
            log: DialLog::default(),
            dials: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_network(mut self, network: &[Network]) -> Self {
        self.network = network.to_vec();
        self
    }

    pub fn with_log(mut self, log: DialLog) -> Self {
        self.log = log;
        self
    }

    /// Every dial fails with `OutboundError::Refused`.
    pub fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }

    pub fn into_arc(self) -> Arc<dyn Outbound> {
        Arc::new(self)
    }

    /// Successful and failed dials, including those made through chained copies.
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    fn record(&self) -> Result<(), OutboundError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(OutboundError::Refused(self.tag()));
        }
        self.log.lock().push(self.tag());
        Ok(())
    }
}

/// One end of an in-memory pipe whose far end echoes.
pub fn echo_stream() -> BoxStream {
    let (near, mut far) = tokio::io::duplex(16 * 1024);
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match far.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if far.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    Box::new(near)
}

#[async_trait]
impl Outbound for MockOutbound {
    fn kind(&self) -> &str {
        "mock"
    }

    fn tag(&self) -> String {
        self.tag.read().clone()
    }

    fn set_tag(&self, tag: &str) {
        *self.tag.write() = tag.to_string();
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn network(&self) -> Vec<Network> {
        self.network.clone()
    }

    async fn dial(&self, _ctx: DialContext, destination: &Destination) -> Result<BoxStream, OutboundError> {
        let stream = match &self.detour {
            Some(detour) => Some(detour.dial(destination).await?),
            None => None,
        };
        self.record()?;
        Ok(stream.unwrap_or_else(echo_stream))
    }

    async fn listen_packet(
        &self,
        _ctx: DialContext,
        destination: &Destination,
    ) -> Result<BoxPacketConn, OutboundError> {
        if let Some(detour) = &self.detour {
            let conn = detour.listen_packet(destination).await?;
            self.record()?;
            return Ok(conn);
        }
        self.record()?;
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await?;
        Ok(Box::new(socket))
    }

    fn with_detour(&self, detour: Arc<dyn Dialer>) -> Option<Arc<dyn Outbound>> {
        Some(Arc::new(Self {
            tag: parking_lot::RwLock::new(self.tag()),
            port: self.port,
            network: self.network.clone(),
            refuse: self.refuse,
            detour: Some(detour),
            log: self.log.clone(),
            dials: self.dials.clone(),
        }))
    }
}
