//! The reliable-delivery sublayer of a connection-oriented L2CAP channel on BR/EDR.
//!
//! A [channel::Channel] turns an order-preserving but lossy packet transport into a channel
//!  for SDUs of up to MTU bytes. Depending on the negotiated [config::ChannelMode] it
//!  segments SDUs into I-frames of at most MPS bytes, runs a sliding window with go-back-N
//!  (REJ) and selective (SREJ) retransmission, polls the peer when acknowledgements are
//!  overdue, and reassembles and delivers inbound SDUs in order and exactly once.
//!
//! The channel itself does no I/O: it consumes events and emits [channel::ChannelAction]s.
//!  [channel_driver] runs it on a tokio task, wiring it to a [transport::Transport] and an
//!  [upper_layer::UpperLayer].
//!
//! Negotiating the configuration is not part of this crate: a channel is created with the
//!  result of configuration negotiation.

pub mod channel;
pub mod channel_driver;
pub mod config;
pub mod error;
pub mod frame;
pub mod receive_sequencer;
pub mod safe_converter;
pub mod segmentation;
pub mod seq_num;
pub mod stats;
pub mod timer;
pub mod transmit_window;
pub mod transport;
pub mod upper_layer;

#[cfg(test)] pub mod test_util;
