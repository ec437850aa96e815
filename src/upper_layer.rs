use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use crate::error::DisconnectReason;
use crate::transmit_window::SduId;

/// The protocol or application using a channel
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UpperLayer: Send + Sync + 'static {
    /// SDUs are delivered in order, and (except in Flow-Control and Streaming mode) exactly once
    async fn deliver_sdu(&self, sdu: Bytes);

    async fn on_sdu_sent(&self, id: SduId);

    /// This is the last call for a channel
    async fn on_disconnected(&self, reason: DisconnectReason);
}
