use std::time::Duration;
use anyhow::bail;
use crate::seq_num::SequenceSpace;

/// The operating mode of a channel, as selected by configuration negotiation
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelMode {
    /// no ARQ, no segmentation: one SDU per PDU
    Basic,
    /// legacy retransmission mode with the standard control field and the R bit
    Retransmission,
    /// legacy flow control mode: windowed, but lost frames are never retransmitted
    FlowControl,
    EnhancedRetransmission,
    /// no acknowledgements and no retransmission, gaps are skipped
    Streaming,
}

impl ChannelMode {
    pub fn uses_timers(&self) -> bool {
        matches!(self, ChannelMode::Retransmission | ChannelMode::FlowControl | ChannelMode::EnhancedRetransmission)
    }

    pub fn retransmits(&self) -> bool {
        matches!(self, ChannelMode::Retransmission | ChannelMode::EnhancedRetransmission)
    }
}

/// There are three control field layouts, selected by `(mode, extended_control)`
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControlFieldKind {
    /// 16 bits, TxSeq / ReqSeq / R / SAR - Retransmission and Flow-Control mode
    Standard,
    /// 16 bits, adds S-type, P and F - Enhanced-Retransmission and Streaming mode
    Enhanced,
    /// 32 bits, same fields as Enhanced with 14 bit sequence numbers
    Extended,
}

impl ControlFieldKind {
    pub fn len(&self) -> usize {
        match self {
            ControlFieldKind::Standard | ControlFieldKind::Enhanced => 2,
            ControlFieldKind::Extended => 4,
        }
    }
}


/// Channel configuration as it results from configuration negotiation. This crate does not
///  negotiate anything, it consumes the result once when a channel is opened.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub mode: ChannelMode,

    /// our own CID: inbound PDUs must be addressed to it
    pub local_cid: u16,
    /// the peer's CID: the destination of all outbound PDUs
    pub remote_cid: u16,

    /// This is the maximum number of unacknowledged I-frames (not bytes) in flight. It is
    ///  bounded by the sequence space: at most 63 for the 16-bit control fields, 16383 for
    ///  the extended control field.
    pub window_size: u16,

    /// maximum payload of a single I-frame, including the SDU length prefix of Start frames
    pub mps: u16,
    /// maximum SDU size
    pub mtu: u16,

    pub retransmission_timeout: Duration,
    pub monitor_timeout: Duration,

    pub fcs_enabled: bool,
    pub extended_control: bool,

    /// The maximum number of transmissions of a single I-frame (and of unanswered polls).
    ///  Zero means there is no upper limit.
    pub max_transmit: u8,
}

impl ChannelConfig {
    /// The BR/EDR minimum MTU for connection-oriented channels
    pub const MIN_MTU: u16 = 48;

    pub fn default_ertm(local_cid: u16, remote_cid: u16) -> ChannelConfig {
        ChannelConfig {
            mode: ChannelMode::EnhancedRetransmission,
            local_cid,
            remote_cid,
            window_size: 10,
            mps: 1010,
            mtu: 1691,
            retransmission_timeout: Duration::from_millis(2000),
            monitor_timeout: Duration::from_millis(12000),
            fcs_enabled: true,
            extended_control: false,
            max_transmit: 3,
        }
    }

    pub fn with_timeouts_ms(mut self, retransmission_timeout_ms: u64, monitor_timeout_ms: u64) -> ChannelConfig {
        self.retransmission_timeout = Duration::from_millis(retransmission_timeout_ms);
        self.monitor_timeout = Duration::from_millis(monitor_timeout_ms);
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.local_cid == 0 || self.remote_cid == 0 {
            bail!("CID 0 is not a valid channel identifier");
        }
        if self.mtu < Self::MIN_MTU {
            bail!("MTU {} is below the minimum of {}", self.mtu, Self::MIN_MTU);
        }
        if self.extended_control && !matches!(self.mode, ChannelMode::EnhancedRetransmission | ChannelMode::Streaming) {
            bail!("the extended control field is only supported in Enhanced-Retransmission and Streaming mode");
        }

        if self.mode == ChannelMode::Basic {
            return Ok(());
        }

        let max_window = self.seq_modulus() - 1;
        if self.window_size == 0 || self.window_size > max_window {
            bail!("window size {} is outside the valid range 1..={}", self.window_size, max_window);
        }
        // a Start frame must fit the SDU length prefix plus at least one byte of payload
        if (self.mps as usize) <= crate::segmentation::SDU_LENGTH_PREFIX_LEN {
            bail!("MPS {} is too small", self.mps);
        }
        // the PDU length field covers control field, payload and FCS
        let fcs_len = if self.fcs_in_use() { crate::frame::fcs::FCS_LEN } else { 0 };
        let max_mps = u16::MAX as usize - self.control_field_kind().map(|k| k.len()).unwrap_or(0) - fcs_len;
        if self.mps as usize > max_mps {
            bail!("MPS {} exceeds the maximum of {} for this control field and FCS setting", self.mps, max_mps);
        }
        if self.mode.uses_timers() && (self.retransmission_timeout.is_zero() || self.monitor_timeout.is_zero()) {
            bail!("timeouts must be non-zero in {:?} mode", self.mode);
        }

        Ok(())
    }

    pub fn seq_modulus(&self) -> u16 {
        self.sequence_space().modulus()
    }

    pub fn sequence_space(&self) -> SequenceSpace {
        if self.extended_control {
            SequenceSpace::EXTENDED
        }
        else {
            SequenceSpace::STANDARD
        }
    }

    /// `None` in Basic mode, which has no control field
    pub fn control_field_kind(&self) -> Option<ControlFieldKind> {
        match self.mode {
            ChannelMode::Basic => None,
            ChannelMode::Retransmission | ChannelMode::FlowControl => Some(ControlFieldKind::Standard),
            ChannelMode::EnhancedRetransmission | ChannelMode::Streaming => {
                if self.extended_control {
                    Some(ControlFieldKind::Extended)
                }
                else {
                    Some(ControlFieldKind::Enhanced)
                }
            }
        }
    }

    /// FCS is not available in Basic mode
    pub fn fcs_in_use(&self) -> bool {
        self.fcs_enabled && self.mode != ChannelMode::Basic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config(mode: ChannelMode, extended_control: bool, window_size: u16) -> ChannelConfig {
        let mut config = ChannelConfig::default_ertm(0x40, 0x41);
        config.mode = mode;
        config.extended_control = extended_control;
        config.window_size = window_size;
        config
    }

    #[rstest]
    #[case::ertm(ChannelMode::EnhancedRetransmission, false, 10, true)]
    #[case::ertm_max_window(ChannelMode::EnhancedRetransmission, false, 63, true)]
    #[case::ertm_window_too_big(ChannelMode::EnhancedRetransmission, false, 64, false)]
    #[case::zero_window(ChannelMode::Retransmission, false, 0, false)]
    #[case::extended_big_window(ChannelMode::EnhancedRetransmission, true, 1000, true)]
    #[case::extended_window_too_big(ChannelMode::Streaming, true, 16384, false)]
    #[case::extended_in_legacy_mode(ChannelMode::FlowControl, true, 10, false)]
    #[case::basic_ignores_window(ChannelMode::Basic, false, 0, true)]
    fn test_validate(#[case] mode: ChannelMode, #[case] extended_control: bool, #[case] window_size: u16, #[case] expected_ok: bool) {
        assert_eq!(config(mode, extended_control, window_size).validate().is_ok(), expected_ok);
    }

    #[test]
    fn test_validate_small_mtu() {
        let mut config = ChannelConfig::default_ertm(0x40, 0x41);
        config.mtu = 47;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_tiny_mps() {
        let mut config = ChannelConfig::default_ertm(0x40, 0x41);
        config.mps = 2;
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::enhanced_with_fcs(false, true, 65531, true)]
    #[case::enhanced_with_fcs_too_big(false, true, 65532, false)]
    #[case::enhanced_without_fcs(false, false, 65533, true)]
    #[case::extended_with_fcs_too_big(true, true, 65530, false)]
    #[case::max_u16(false, true, u16::MAX, false)]
    fn test_validate_large_mps(#[case] extended_control: bool, #[case] fcs_enabled: bool, #[case] mps: u16, #[case] expected_ok: bool) {
        let mut config = ChannelConfig::default_ertm(0x40, 0x41);
        config.extended_control = extended_control;
        config.fcs_enabled = fcs_enabled;
        config.mps = mps;
        assert_eq!(config.validate().is_ok(), expected_ok);
    }

    #[test]
    fn test_validate_zero_timeout() {
        let config = ChannelConfig::default_ertm(0x40, 0x41).with_timeouts_ms(0, 100);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::basic(ChannelMode::Basic, false, None, 64)]
    #[case::retransmission(ChannelMode::Retransmission, false, Some(ControlFieldKind::Standard), 64)]
    #[case::flow_control(ChannelMode::FlowControl, false, Some(ControlFieldKind::Standard), 64)]
    #[case::ertm(ChannelMode::EnhancedRetransmission, false, Some(ControlFieldKind::Enhanced), 64)]
    #[case::streaming(ChannelMode::Streaming, false, Some(ControlFieldKind::Enhanced), 64)]
    #[case::ertm_extended(ChannelMode::EnhancedRetransmission, true, Some(ControlFieldKind::Extended), 16384)]
    fn test_control_field_kind(#[case] mode: ChannelMode, #[case] extended_control: bool, #[case] expected: Option<ControlFieldKind>, #[case] modulus: u16) {
        let config = config(mode, extended_control, 10);
        assert_eq!(config.control_field_kind(), expected);
        assert_eq!(config.seq_modulus(), modulus);
    }
}
