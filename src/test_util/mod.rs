//! Utilities for testing channels end to end: an in-memory link between two channels that can
//!  drop, corrupt and duplicate PDUs, and helpers for building raw peer PDUs.

pub mod link;

use bytes::Bytes;
use crate::config::{ChannelConfig, ChannelMode};
use crate::frame::control_field::{IControl, SControl};
use crate::frame::{Frame, FrameCodec, SarType, SupervisoryType};
use crate::seq_num::SeqNum;

pub const LOCAL_CID: u16 = 0x0040;
pub const REMOTE_CID: u16 = 0x0041;

/// a small-window configuration with short timeouts and a small MPS, so that tests exercise
///  segmentation and window limits with little data
pub fn test_config(mode: ChannelMode) -> ChannelConfig {
    let mut config = ChannelConfig::default_ertm(LOCAL_CID, REMOTE_CID)
        .with_timeouts_ms(100, 300);
    config.mode = mode;
    config.window_size = 5;
    config.mps = 16;
    config.mtu = 200;
    config
}

/// the configuration of the other end of a channel
pub fn peer_config(config: &ChannelConfig) -> ChannelConfig {
    let mut peer = config.clone();
    peer.local_cid = config.remote_cid;
    peer.remote_cid = config.local_cid;
    peer
}

/// Encodes frames the way the peer of a channel with `config` would
pub struct PeerFrames {
    codec: FrameCodec,
}

impl PeerFrames {
    pub fn new(config: &ChannelConfig) -> PeerFrames {
        PeerFrames {
            codec: FrameCodec::new(&peer_config(config)),
        }
    }

    /// decodes a PDU sent by the channel
    pub fn decode(&self, pdu: &[u8]) -> Frame {
        self.codec.decode(pdu).unwrap()
    }

    pub fn i_frame(&self, tx_seq: u16, req_seq: u16, sdu_byte: u8) -> Bytes {
        self.codec.encode(&Frame::Information {
            control: IControl {
                tx_seq: SeqNum::from_raw(tx_seq),
                req_seq: SeqNum::from_raw(req_seq),
                f_bit: false,
                r_bit: false,
                sar: SarType::Unsegmented,
            },
            payload: Bytes::from(vec![1, 0, sdu_byte]),
        })
    }

    pub fn s_frame(&self, s_type: SupervisoryType, req_seq: u16, p_bit: bool, f_bit: bool) -> Bytes {
        self.s_frame_with_r(s_type, req_seq, p_bit, f_bit, false)
    }

    pub fn s_frame_with_r(&self, s_type: SupervisoryType, req_seq: u16, p_bit: bool, f_bit: bool, r_bit: bool) -> Bytes {
        self.codec.encode(&Frame::Supervisory(SControl {
            s_type,
            req_seq: SeqNum::from_raw(req_seq),
            f_bit,
            p_bit,
            r_bit,
        }))
    }
}

/// convenience accessors for decoded frames in assertions
impl Frame {
    pub fn tx_seq(&self) -> Option<u16> {
        match self {
            Frame::Information { control, .. } => Some(control.tx_seq.to_raw()),
            _ => None,
        }
    }

    pub fn s_control(&self) -> Option<SControl> {
        match self {
            Frame::Supervisory(control) => Some(*control),
            _ => None,
        }
    }

    pub fn is_s_type(&self, s_type: SupervisoryType) -> bool {
        self.s_control().map(|c| c.s_type == s_type).unwrap_or(false)
    }
}
