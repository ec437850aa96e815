use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use crate::error::DisconnectReason;

/// The packet transport below a channel, e.g. an ACL link's scheduler. It preserves the order
///  of PDUs but does not guarantee their delivery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn transmit_pdu(&self, pdu: Bytes);

    /// The number of I-frames the transport is willing to take right now. The channel holds
    ///  back the rest until its next event.
    fn write_budget(&self) -> usize;

    async fn on_channel_closed(&self, reason: DisconnectReason);
}
