use bytes::Bytes;
use tracing::{debug, trace};
use crate::config::{ChannelConfig, ChannelMode};
use crate::error::ChannelError;
use crate::frame::SarType;
use crate::segmentation::{ReassembleResult, Reassembler};
use crate::seq_num::{SeqNum, SequenceSpace};

#[derive(Debug, Eq, PartialEq)]
pub enum IFrameOutcome {
    /// The frame was the next one in sequence (possibly after skipping `lost` frames in modes
    ///  without retransmission), and its payload was handed to reassembly.
    Accepted { sdu: Option<Bytes>, lost: u16 },
    Duplicate,
    /// Enhanced-Retransmission only: the frame is discarded, and the first frame of each gap
    ///  triggers a REJ
    OutOfOrder { send_reject: bool },
    /// Enhanced-Retransmission only: the frame is discarded while locally busy
    DroppedBusy,
}

/// The receive side of a channel: classifies incoming I-frames by TxSeq, feeds in-sequence
///  payloads to reassembly and keeps track of what must be acknowledged.
///
/// ```ascii
///   buffer_seq           expected_tx_seq          buffer_seq + window_size
///       v                      v                           v
///  ...  | duplicate .......... | out of order ............ | beyond the window
/// ```
///
/// `buffer_seq` is the ReqSeq last sent to the peer. Frames before it can only be stale
///  retransmissions, and frames in `[buffer_seq, expected_tx_seq)` were received already.
pub struct ReceiveSequencer {
    mode: ChannelMode,
    space: SequenceSpace,
    window_size: u16,

    expected_tx_seq: SeqNum,
    buffer_seq: SeqNum,

    reject_pending: bool,
    ack_pending: bool,

    reassembler: Reassembler,
}

impl ReceiveSequencer {
    pub fn new(config: &ChannelConfig) -> ReceiveSequencer {
        ReceiveSequencer {
            mode: config.mode,
            space: config.sequence_space(),
            window_size: config.window_size,
            expected_tx_seq: SeqNum::ZERO,
            buffer_seq: SeqNum::ZERO,
            reject_pending: false,
            ack_pending: false,
            reassembler: Reassembler::new(config.mtu),
        }
    }

    pub fn expected_tx_seq(&self) -> SeqNum {
        self.expected_tx_seq
    }

    pub fn buffer_seq(&self) -> SeqNum {
        self.buffer_seq
    }

    pub fn ack_pending(&self) -> bool {
        self.ack_pending
    }

    pub fn reject_pending(&self) -> bool {
        self.reject_pending
    }

    /// The ReqSeq for an outgoing frame. Sending it acknowledges everything received so far.
    pub fn take_ack(&mut self) -> SeqNum {
        self.buffer_seq = self.expected_tx_seq;
        self.ack_pending = false;
        self.expected_tx_seq
    }

    pub fn on_iframe(&mut self, tx_seq: SeqNum, sar: SarType, payload: &[u8], local_busy: bool) -> Result<IFrameOutcome, ChannelError> {
        if self.mode == ChannelMode::Streaming {
            // no acknowledgements and no retransmissions: any gap is final. A frame from the
            //  half of the sequence space behind expected_tx_seq was seen already.
            let lost = self.space.offset(self.expected_tx_seq, tx_seq);
            if lost >= self.space.modulus() / 2 {
                debug!("duplicate frame {} - expected {}", tx_seq, self.expected_tx_seq);
                return Ok(IFrameOutcome::Duplicate);
            }
            if lost > 0 {
                debug!("missed {} frames before {} - resynchronizing", lost, tx_seq);
                self.reassembler.abort_partial();
            }
            self.expected_tx_seq = self.space.next(tx_seq);
            self.buffer_seq = self.expected_tx_seq;
            return self.reassemble(payload, sar, lost);
        }

        if tx_seq == self.expected_tx_seq {
            if local_busy && self.mode == ChannelMode::EnhancedRetransmission {
                debug!("locally busy - dropping frame {}", tx_seq);
                self.ack_pending = true;
                return Ok(IFrameOutcome::DroppedBusy);
            }
            return self.accept(payload, sar, 0);
        }

        let distance = self.space.offset(self.buffer_seq, tx_seq);
        if distance < self.space.offset(self.buffer_seq, self.expected_tx_seq) {
            debug!("duplicate frame {} - expected {}", tx_seq, self.expected_tx_seq);
            return Ok(IFrameOutcome::Duplicate);
        }
        if distance >= self.window_size {
            if self.window_size <= self.space.modulus() / 2 {
                debug!("frame {} is outside the receive window - treating it as a duplicate", tx_seq);
                return Ok(IFrameOutcome::Duplicate);
            }
            return Err(ChannelError::SequenceError {
                seq: tx_seq,
                lower: self.buffer_seq,
                upper: self.space.add(self.buffer_seq, self.window_size - 1),
            });
        }

        match self.mode {
            ChannelMode::EnhancedRetransmission => {
                if local_busy {
                    debug!("locally busy - dropping out-of-sequence frame {}", tx_seq);
                    return Ok(IFrameOutcome::DroppedBusy);
                }
                let send_reject = !self.reject_pending;
                self.reject_pending = true;
                debug!("out-of-sequence frame {}, expected {}{}", tx_seq, self.expected_tx_seq, if send_reject { " - rejecting" } else { "" });
                Ok(IFrameOutcome::OutOfOrder { send_reject })
            }
            _ => {
                let lost = self.space.offset(self.expected_tx_seq, tx_seq);
                debug!("frames {} to {} are lost", self.expected_tx_seq, self.space.add(tx_seq, self.space.modulus() - 1));
                self.reassembler.abort_partial();
                self.expected_tx_seq = tx_seq;
                self.accept(payload, sar, lost)
            }
        }
    }

    fn accept(&mut self, payload: &[u8], sar: SarType, lost: u16) -> Result<IFrameOutcome, ChannelError> {
        trace!("received frame {} ({:?}, {} bytes)", self.expected_tx_seq, sar, payload.len());
        self.expected_tx_seq = self.space.next(self.expected_tx_seq);
        self.reject_pending = false;
        self.ack_pending = true;
        self.reassemble(payload, sar, lost)
    }

    fn reassemble(&mut self, payload: &[u8], sar: SarType, lost: u16) -> Result<IFrameOutcome, ChannelError> {
        match self.reassembler.reassemble(payload, sar) {
            ReassembleResult::Complete(sdu) => Ok(IFrameOutcome::Accepted { sdu: Some(sdu), lost }),
            ReassembleResult::InProgress | ReassembleResult::Skipped => Ok(IFrameOutcome::Accepted { sdu: None, lost }),
            ReassembleResult::Fatal(e) => Err(e),
        }
    }

    pub fn clear(&mut self) {
        self.reassembler.clear();
        self.ack_pending = false;
        self.reject_pending = false;
    }
}
