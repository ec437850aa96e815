use crate::seq_num::SeqNum;

/// Everything that can go wrong on a channel.
///
/// Recoverable conditions (malformed frames, FCS mismatches, duplicates) never leave the
///  channel: they are logged, counted and left to the ARQ machinery to recover from. Fatal
///  conditions funnel into a single disconnect. The remaining variants are returned to callers
///  of the send API.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error("frame check sequence mismatch: received {received:04x}, calculated {calculated:04x}")]
    FcsMismatch { received: u16, calculated: u16 },
    #[error("duplicate frame with TxSeq {0}")]
    DuplicateFrame(SeqNum),
    #[error("sequence number {seq} outside the valid range [{lower}, {upper}]")]
    SequenceError { seq: SeqNum, lower: SeqNum, upper: SeqNum },
    #[error("retransmission limit of {max_transmit} exceeded")]
    RetryExhausted { max_transmit: u8 },
    #[error("SDU length mismatch: declared {declared}, received {received}")]
    SduLengthMismatch { declared: usize, received: usize },
    #[error("SDU of {len} bytes exceeds the MTU of {mtu}")]
    SduTooLarge { len: usize, mtu: u16 },
    #[error("channel is closed")]
    ChannelClosed,
}

impl ChannelError {
    pub fn is_fatal(&self) -> bool {
        matches!(self,
            ChannelError::SequenceError { .. } |
            ChannelError::RetryExhausted { .. } |
            ChannelError::SduLengthMismatch { .. }
        )
    }
}


/// The single terminal reason reported to the upper layer and the transport when a channel
///  goes down
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DisconnectReason {
    LocalRequest,
    SequenceError,
    RetryExhausted,
    SduLengthMismatch,
}

impl DisconnectReason {
    /// This is the reason code carried in disconnect notifications
    pub fn code(&self) -> u16 {
        match self {
            DisconnectReason::LocalRequest => 0x0000,
            DisconnectReason::SequenceError => 0x0001,
            DisconnectReason::RetryExhausted => 0x0002,
            DisconnectReason::SduLengthMismatch => 0x0003,
        }
    }
}

impl TryFrom<&ChannelError> for DisconnectReason {
    type Error = ();

    fn try_from(value: &ChannelError) -> Result<Self, Self::Error> {
        match value {
            ChannelError::SequenceError { .. } => Ok(DisconnectReason::SequenceError),
            ChannelError::RetryExhausted { .. } => Ok(DisconnectReason::RetryExhausted),
            ChannelError::SduLengthMismatch { .. } => Ok(DisconnectReason::SduLengthMismatch),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::malformed(ChannelError::MalformedFrame("truncated"), false)]
    #[case::fcs(ChannelError::FcsMismatch { received: 1, calculated: 2 }, false)]
    #[case::duplicate(ChannelError::DuplicateFrame(SeqNum::from_raw(3)), false)]
    #[case::sequence(ChannelError::SequenceError { seq: SeqNum::from_raw(9), lower: SeqNum::from_raw(1), upper: SeqNum::from_raw(4) }, true)]
    #[case::retry(ChannelError::RetryExhausted { max_transmit: 3 }, true)]
    #[case::length(ChannelError::SduLengthMismatch { declared: 10, received: 12 }, true)]
    #[case::too_large(ChannelError::SduTooLarge { len: 100, mtu: 48 }, false)]
    #[case::closed(ChannelError::ChannelClosed, false)]
    fn test_is_fatal(#[case] error: ChannelError, #[case] expected: bool) {
        assert_eq!(error.is_fatal(), expected);
        assert_eq!(DisconnectReason::try_from(&error).is_ok(), expected);
    }
}
