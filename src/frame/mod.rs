//! Encoding and decoding of complete PDUs: basic header, control field, payload and FCS.
//!
//! ```ascii
//! 0: length (u16 LE) - number of bytes after the basic header, including the FCS
//! 2: channel id (u16 LE) - the destination CID
//! 4: control field (2 or 4 bytes, see [ControlField]) - absent in Basic mode
//! *: payload - for Start / Unsegmented I-frames this begins with the SDU length prefix
//! *: FCS (u16 LE) - optional, CRC-16 over everything before it
//! ```

pub mod control_field;
pub mod fcs;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;
use crate::config::{ChannelConfig, ControlFieldKind};
use crate::error::ChannelError;
use crate::frame::control_field::{ControlField, IControl, SControl};
use crate::frame::fcs::FCS_LEN;
use crate::safe_converter::{PrecheckedCast, SafeCast};

pub use control_field::{SarType, SupervisoryType};
pub use fcs::{compute_fcs, verify_fcs};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Frame {
    Basic { payload: Bytes },
    Information { control: IControl, payload: Bytes },
    Supervisory(SControl),
}

impl Frame {
    pub fn control(&self) -> Option<ControlField> {
        match self {
            Frame::Basic { .. } => None,
            Frame::Information { control, .. } => Some(ControlField::I(*control)),
            Frame::Supervisory(control) => Some(ControlField::S(*control)),
        }
    }
}


/// Stateless per-channel codec: the encoding is fixed by the channel's configuration
#[derive(Clone, Debug)]
pub struct FrameCodec {
    control_field_kind: Option<ControlFieldKind>,
    fcs_enabled: bool,
    local_cid: u16,
    remote_cid: u16,
}

impl FrameCodec {
    pub const BASIC_HEADER_LEN: usize = 4;

    pub fn new(config: &ChannelConfig) -> FrameCodec {
        FrameCodec {
            control_field_kind: config.control_field_kind(),
            fcs_enabled: config.fcs_in_use(),
            local_cid: config.local_cid,
            remote_cid: config.remote_cid,
        }
    }

    /// The number of bytes a PDU carries in addition to its I-frame payload
    pub fn overhead(&self) -> usize {
        Self::BASIC_HEADER_LEN
            + self.control_field_kind.map(|k| k.len()).unwrap_or(0)
            + if self.fcs_enabled { FCS_LEN } else { 0 }
    }

    pub fn encode(&self, frame: &Frame) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.overhead() + Self::payload(frame).len());

        buf.put_u16_le(0); // length is patched below
        buf.put_u16_le(self.remote_cid);

        match (frame.control(), self.control_field_kind) {
            (Some(control), Some(kind)) => control.ser(kind, &mut buf),
            (None, None) => {}
            (Some(_), None) => panic!("this is a bug: control field in a Basic mode channel"),
            (None, Some(_)) => panic!("this is a bug: Basic frame on a channel with a control field"),
        }
        buf.put_slice(Self::payload(frame));

        let fcs_len = if self.fcs_enabled { FCS_LEN } else { 0 };
        let length: u16 = (buf.len() - Self::BASIC_HEADER_LEN + fcs_len).prechecked_cast();
        buf[..2].copy_from_slice(&length.to_le_bytes());

        if self.fcs_enabled {
            let fcs = compute_fcs(&buf);
            buf.put_u16_le(fcs);
        }

        trace!("encoded {:?} as {:?}", frame, buf.as_ref());
        buf.freeze()
    }

    pub fn decode(&self, pdu: &[u8]) -> Result<Frame, ChannelError> {
        let mut buf = pdu;
        if buf.remaining() < Self::BASIC_HEADER_LEN {
            return Err(ChannelError::MalformedFrame("truncated basic header"));
        }
        let length: usize = buf.get_u16_le().safe_cast();
        let cid = buf.get_u16_le();

        if length != buf.remaining() {
            return Err(ChannelError::MalformedFrame("length field does not match PDU size"));
        }
        if cid != self.local_cid {
            return Err(ChannelError::MalformedFrame("PDU addressed to a different channel"));
        }

        let kind = match self.control_field_kind {
            None => return Ok(Frame::Basic { payload: Bytes::copy_from_slice(buf) }),
            Some(kind) => kind,
        };

        if self.fcs_enabled {
            if buf.remaining() < kind.len() + FCS_LEN {
                return Err(ChannelError::MalformedFrame("truncated frame"));
            }
            let (received, calculated) = fcs::received_and_calculated(pdu)
                .ok_or(ChannelError::MalformedFrame("truncated frame"))?;
            if received != calculated {
                return Err(ChannelError::FcsMismatch { received, calculated });
            }
            buf = &buf[..buf.len() - FCS_LEN];
        }

        let frame = match ControlField::deser(kind, &mut buf)? {
            ControlField::I(control) => Frame::Information { control, payload: Bytes::copy_from_slice(buf) },
            ControlField::S(control) => {
                if buf.has_remaining() {
                    return Err(ChannelError::MalformedFrame("S-frame with payload"));
                }
                Frame::Supervisory(control)
            }
        };
        trace!("decoded {:?}", frame);
        Ok(frame)
    }

    fn payload(frame: &Frame) -> &[u8] {
        match frame {
            Frame::Basic { payload } | Frame::Information { payload, .. } => payload.as_ref(),
            Frame::Supervisory(_) => &[],
        }
    }
}
