use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::config::ControlFieldKind;
use crate::error::ChannelError;
use crate::seq_num::{SeqNum, SequenceSpace};

/// Segmentation and reassembly marker of an I-frame
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SarType {
    Unsegmented = 0,
    Start = 1,
    End = 2,
    Continue = 3,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SupervisoryType {
    /// receiver ready
    Rr = 0,
    /// reject, go-back-N
    Rej = 1,
    /// receiver not ready
    Rnr = 2,
    /// selective reject of a single frame
    Srej = 3,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IControl {
    pub tx_seq: SeqNum,
    pub req_seq: SeqNum,
    /// Enhanced / Extended only
    pub f_bit: bool,
    /// Standard only: retransmission disable
    pub r_bit: bool,
    pub sar: SarType,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SControl {
    pub s_type: SupervisoryType,
    pub req_seq: SeqNum,
    /// Enhanced / Extended only
    pub f_bit: bool,
    /// Enhanced / Extended only
    pub p_bit: bool,
    /// Standard only: retransmission disable
    pub r_bit: bool,
}

/// The three wire layouts of the control field behind a single entry point.
///
/// ```ascii
/// Standard   I: b0=0 | TxSeq b1-6 | R b7 | ReqSeq b8-13 | SAR b14-15
///            S: b0=1 b1=0 | S b2-3 | reserved b4-6 | R b7 | ReqSeq b8-13 | reserved b14-15
/// Enhanced   I: b0=0 | TxSeq b1-6 | F b7 | ReqSeq b8-13 | SAR b14-15
///            S: b0=1 b1=0 | S b2-3 | P b4 | reserved b5-6 | F b7 | ReqSeq b8-13 | reserved b14-15
/// Extended   I: b0=0 | F b1 | ReqSeq b2-15 | SAR b16-17 | TxSeq b18-31
///            S: b0=1 | F b1 | ReqSeq b2-15 | S b16-17 | P b18 | reserved b19-31
/// ```
///
/// All control fields are transmitted little endian.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControlField {
    I(IControl),
    S(SControl),
}

impl ControlField {
    const SEQ_MASK_16: u16 = 0x3f;
    const SEQ_MASK_32: u32 = 0x3fff;

    pub fn ser(&self, kind: ControlFieldKind, buf: &mut BytesMut) {
        match kind {
            ControlFieldKind::Standard => buf.put_u16_le(self.raw_standard()),
            ControlFieldKind::Enhanced => buf.put_u16_le(self.raw_enhanced()),
            ControlFieldKind::Extended => buf.put_u32_le(self.raw_extended()),
        }
    }

    pub fn deser(kind: ControlFieldKind, buf: &mut impl Buf) -> Result<ControlField, ChannelError> {
        if buf.remaining() < kind.len() {
            return Err(ChannelError::MalformedFrame("truncated control field"));
        }
        match kind {
            ControlFieldKind::Standard => Self::from_raw_standard(buf.get_u16_le()),
            ControlFieldKind::Enhanced => Self::from_raw_enhanced(buf.get_u16_le()),
            ControlFieldKind::Extended => Self::from_raw_extended(buf.get_u32_le()),
        }
    }

    fn raw_standard(&self) -> u16 {
        match self {
            ControlField::I(i) => {
                debug_assert!(!i.f_bit, "the standard control field has no F bit");
                ((i.tx_seq.to_raw() & Self::SEQ_MASK_16) << 1)
                    | ((i.r_bit as u16) << 7)
                    | ((i.req_seq.to_raw() & Self::SEQ_MASK_16) << 8)
                    | ((u8::from(i.sar) as u16) << 14)
            }
            ControlField::S(s) => {
                debug_assert!(matches!(s.s_type, SupervisoryType::Rr | SupervisoryType::Rej), "the standard control field supports only RR and REJ");
                debug_assert!(!s.f_bit && !s.p_bit, "the standard control field has no P / F bits");
                0x0001
                    | ((u8::from(s.s_type) as u16) << 2)
                    | ((s.r_bit as u16) << 7)
                    | ((s.req_seq.to_raw() & Self::SEQ_MASK_16) << 8)
            }
        }
    }

    fn raw_enhanced(&self) -> u16 {
        match self {
            ControlField::I(i) => {
                ((i.tx_seq.to_raw() & Self::SEQ_MASK_16) << 1)
                    | ((i.f_bit as u16) << 7)
                    | ((i.req_seq.to_raw() & Self::SEQ_MASK_16) << 8)
                    | ((u8::from(i.sar) as u16) << 14)
            }
            ControlField::S(s) => {
                0x0001
                    | ((u8::from(s.s_type) as u16) << 2)
                    | ((s.p_bit as u16) << 4)
                    | ((s.f_bit as u16) << 7)
                    | ((s.req_seq.to_raw() & Self::SEQ_MASK_16) << 8)
            }
        }
    }

    fn raw_extended(&self) -> u32 {
        match self {
            ControlField::I(i) => {
                ((i.f_bit as u32) << 1)
                    | ((i.req_seq.to_raw() as u32 & Self::SEQ_MASK_32) << 2)
                    | ((u8::from(i.sar) as u32) << 16)
                    | ((i.tx_seq.to_raw() as u32 & Self::SEQ_MASK_32) << 18)
            }
            ControlField::S(s) => {
                0x0000_0001
                    | ((s.f_bit as u32) << 1)
                    | ((s.req_seq.to_raw() as u32 & Self::SEQ_MASK_32) << 2)
                    | ((u8::from(s.s_type) as u32) << 16)
                    | ((s.p_bit as u32) << 18)
            }
        }
    }

    fn from_raw_standard(raw: u16) -> Result<ControlField, ChannelError> {
        let space = SequenceSpace::STANDARD;
        let r_bit = raw & 0x0080 != 0;
        let req_seq = space.seq((raw >> 8) & Self::SEQ_MASK_16);

        if raw & 0x0001 == 0 {
            return Ok(ControlField::I(IControl {
                tx_seq: space.seq((raw >> 1) & Self::SEQ_MASK_16),
                req_seq,
                f_bit: false,
                r_bit,
                sar: Self::sar((raw >> 14) as u8),
            }));
        }

        if raw & 0xc072 != 0 {
            return Err(ChannelError::MalformedFrame("reserved bits set in standard S-frame"));
        }
        let s_type = match Self::s_type((raw >> 2) as u8) {
            s @ (SupervisoryType::Rr | SupervisoryType::Rej) => s,
            _ => return Err(ChannelError::MalformedFrame("S-frame type not supported by the standard control field")),
        };
        Ok(ControlField::S(SControl {
            s_type,
            req_seq,
            f_bit: false,
            p_bit: false,
            r_bit,
        }))
    }

    fn from_raw_enhanced(raw: u16) -> Result<ControlField, ChannelError> {
        let space = SequenceSpace::STANDARD;
        let f_bit = raw & 0x0080 != 0;
        let req_seq = space.seq((raw >> 8) & Self::SEQ_MASK_16);

        if raw & 0x0001 == 0 {
            return Ok(ControlField::I(IControl {
                tx_seq: space.seq((raw >> 1) & Self::SEQ_MASK_16),
                req_seq,
                f_bit,
                r_bit: false,
                sar: Self::sar((raw >> 14) as u8),
            }));
        }

        if raw & 0xc062 != 0 {
            return Err(ChannelError::MalformedFrame("reserved bits set in enhanced S-frame"));
        }
        Ok(ControlField::S(SControl {
            s_type: Self::s_type((raw >> 2) as u8),
            req_seq,
            f_bit,
            p_bit: raw & 0x0010 != 0,
            r_bit: false,
        }))
    }

    fn from_raw_extended(raw: u32) -> Result<ControlField, ChannelError> {
        let space = SequenceSpace::EXTENDED;
        let f_bit = raw & 0x0000_0002 != 0;
        let req_seq = space.seq(((raw >> 2) & Self::SEQ_MASK_32) as u16);

        if raw & 0x0000_0001 == 0 {
            return Ok(ControlField::I(IControl {
                tx_seq: space.seq(((raw >> 18) & Self::SEQ_MASK_32) as u16),
                req_seq,
                f_bit,
                r_bit: false,
                sar: Self::sar((raw >> 16) as u8),
            }));
        }

        if raw & 0xfff8_0000 != 0 {
            return Err(ChannelError::MalformedFrame("reserved bits set in extended S-frame"));
        }
        Ok(ControlField::S(SControl {
            s_type: Self::s_type((raw >> 16) as u8),
            req_seq,
            f_bit,
            p_bit: raw & 0x0004_0000 != 0,
            r_bit: false,
        }))
    }

    /// Both SAR and S-type are two bit fields with all four values assigned, so masking makes
    ///  the conversion infallible
    fn sar(bits: u8) -> SarType {
        SarType::try_from(bits & 0x03)
            .unwrap_or(SarType::Unsegmented)
    }

    fn s_type(bits: u8) -> SupervisoryType {
        SupervisoryType::try_from(bits & 0x03)
            .unwrap_or(SupervisoryType::Rr)
    }
}
