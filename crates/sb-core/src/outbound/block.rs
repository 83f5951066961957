//! Block 出站：拒绝所有连接
//!
//! Also serves as the [`OUTBOUNDLESS`](super::OUTBOUNDLESS) sentinel that
//! member-less selectors select.
use super::{BoxPacketConn, BoxStream, DialContext, Outbound};
use crate::error::OutboundError;
use async_trait::async_trait;
use parking_lot::RwLock;
use sb_types::{Destination, InboundContext};

#[derive(Debug)]
pub struct BlockOutbound {
    tag: RwLock<String>,
}

impl BlockOutbound {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: RwLock::new(tag.to_string()),
        }
    }

    fn refuse(&self, destination: &Destination) -> OutboundError {
        let tag = self.tag();
        tracing::debug!(target: "sb_core::outbound", tag = %tag, destination = %destination, "blocked");
        OutboundError::Refused(tag)
    }
}

#[async_trait]
impl Outbound for BlockOutbound {
    fn kind(&self) -> &str {
        "block"
    }

    fn tag(&self) -> String {
        self.tag.read().clone()
    }

    fn set_tag(&self, tag: &str) {
        *self.tag.write() = tag.to_string();
    }

    async fn dial(&self, _ctx: DialContext, destination: &Destination) -> Result<BoxStream, OutboundError> {
        Err(self.refuse(destination))
    }

    async fn listen_packet(
        &self,
        _ctx: DialContext,
        destination: &Destination,
    ) -> Result<BoxPacketConn, OutboundError> {
        Err(self.refuse(destination))
    }

    /// Dropping `conn` closes the client side.
    async fn new_connection(
        &self,
        _ctx: DialContext,
        conn: BoxStream,
        metadata: InboundContext,
    ) -> Result<(), OutboundError> {
        drop(conn);
        let destination = metadata.destination.unwrap_or(Destination::domain(metadata.domain, 0));
        Err(self.refuse(&destination))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn refuses_and_closes() {
        let block = BlockOutbound::new("reject");
        let dst = Destination::domain("ads.example", 443);
        assert!(matches!(
            block.dial(DialContext::default(), &dst).await,
            Err(OutboundError::Refused(tag)) if tag == "reject"
        ));

        let (conn, mut peer) = tokio::io::duplex(16);
        let mut metadata = InboundContext::default();
        metadata.destination = Some(dst);
        assert!(block
            .new_connection(DialContext::EXTERNAL, Box::new(conn), metadata)
            .await
            .is_err());
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }
}
