use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use bytes::Bytes;
use tracing::{debug, trace};
use crate::config::{ChannelConfig, ChannelMode};
use crate::error::ChannelError;
use crate::frame::SarType;
use crate::segmentation::Segmenter;
use crate::seq_num::{SeqNum, SequenceSpace};

/// Identifies an outbound SDU for the lifetime of its channel. Ids are handed out by the
///  channel in increasing order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SduId(u64);

impl Display for SduId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SDU#{}", self.0)
    }
}

impl SduId {
    pub fn from_raw(value: u64) -> SduId {
        SduId(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }
}

/// One transmitted, unacknowledged I-frame
#[derive(Debug)]
struct TxSlot {
    tx_seq: SeqNum,
    sar: SarType,
    payload: Bytes,
    /// number of transmissions so far, starting at 1 for the first send
    retry_count: u8,
    sdu: SduId,
    last_of_sdu: bool,
    selected_for_retransmission: bool,
}

/// The ring position a new I-frame will occupy
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SlotRef {
    pub index: usize,
    pub tx_seq: SeqNum,
}

/// An I-frame ready to be sent, without the receive-side fields of its control field
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutboundIFrame {
    pub tx_seq: SeqNum,
    pub sar: SarType,
    pub payload: Bytes,
    pub retransmission: bool,
    /// set if sending this frame completes an SDU - only for channels that do not wait for
    ///  acknowledgements
    pub completed_sdu: Option<SduId>,
}


/// The send side of the sliding window.
///
/// In-flight I-frames live in a fixed ring of `window_size` slots that is allocated once. The
///  slot for `expected_ack_seq` is at `head`, and the others follow in sequence order, so
///  there are never more than `window_size` frames in flight:
///
/// ```ascii
///      expected_ack_seq       next_tx_seq
///            v                    v
///  ... acked | in flight ........ | free ...
/// ```
///
/// REJ and retransmission timeouts do not move `next_tx_seq` back. They set a retransmission
///  cursor that walks from the requested sequence number up to `next_tx_seq` instead, which
///  keeps the in-flight count equal to `next_tx_seq - expected_ack_seq` at all times.
pub struct TransmitWindow {
    space: SequenceSpace,
    window_size: u16,
    mps: u16,
    max_transmit: u8,
    /// Streaming mode forgets frames once they are sent
    retains_slots: bool,
    /// Flow-Control mode tracks acknowledgements but never retransmits
    retransmits: bool,

    slots: Vec<Option<TxSlot>>,
    head: usize,

    next_tx_seq: SeqNum,
    expected_ack_seq: SeqNum,

    retransmit_cursor: Option<SeqNum>,
    selective: VecDeque<SeqNum>,

    pending_sdus: VecDeque<(SduId, Bytes)>,
    current_sdu: Option<(SduId, Segmenter)>,
}

impl TransmitWindow {
    pub fn new(config: &ChannelConfig) -> TransmitWindow {
        let retains_slots = config.mode != ChannelMode::Streaming;
        let num_slots = if retains_slots { config.window_size as usize } else { 0 };

        TransmitWindow {
            space: config.sequence_space(),
            window_size: config.window_size,
            mps: config.mps,
            max_transmit: config.max_transmit,
            retains_slots,
            retransmits: config.mode.retransmits(),
            slots: (0..num_slots).map(|_| None).collect(),
            head: 0,
            next_tx_seq: SeqNum::ZERO,
            expected_ack_seq: SeqNum::ZERO,
            retransmit_cursor: None,
            selective: VecDeque::with_capacity(num_slots),
            pending_sdus: VecDeque::new(),
            current_sdu: None,
        }
    }

    pub fn next_tx_seq(&self) -> SeqNum {
        self.next_tx_seq
    }

    pub fn expected_ack_seq(&self) -> SeqNum {
        self.expected_ack_seq
    }

    pub fn in_flight(&self) -> u16 {
        self.space.offset(self.expected_ack_seq, self.next_tx_seq)
    }

    pub fn has_pending_data(&self) -> bool {
        self.current_sdu.is_some() || !self.pending_sdus.is_empty()
    }

    pub fn is_retransmitting(&self) -> bool {
        self.retransmit_cursor.is_some() || !self.selective.is_empty()
    }

    /// the number of transmissions of an in-flight frame
    pub fn retry_count(&self, tx_seq: SeqNum) -> Option<u8> {
        if !self.space.in_range(self.expected_ack_seq, self.next_tx_seq, tx_seq) {
            return None;
        }
        self.slots.get(self.slot_index(tx_seq))
            .and_then(|s| s.as_ref())
            .map(|s| s.retry_count)
    }

    pub fn enqueue_sdu(&mut self, id: SduId, sdu: Bytes) {
        trace!("queueing {} with {} bytes", id, sdu.len());
        self.pending_sdus.push_back((id, sdu));
    }

    /// Reserves the slot for the next new I-frame. This fails if the window is full, and the
    ///  caller has to try again after the next acknowledgement.
    pub fn acquire_slot(&self) -> Option<SlotRef> {
        if self.retains_slots && self.in_flight() >= self.window_size {
            return None;
        }
        Some(SlotRef {
            index: self.slot_index(self.next_tx_seq),
            tx_seq: self.next_tx_seq,
        })
    }

    /// The next I-frame to put on the wire: selectively rejected frames first, then a
    ///  go-back-N retransmission in progress, then the next segment of a queued SDU.
    ///
    /// Nothing is sent while the peer is busy. New segments additionally wait for the final
    ///  response to an outstanding poll and for a free slot.
    pub fn next_to_send(&mut self, remote_busy: bool, awaiting_final: bool) -> Result<Option<OutboundIFrame>, ChannelError> {
        if remote_busy {
            return Ok(None);
        }

        while let Some(tx_seq) = self.selective.pop_front() {
            if self.space.in_range(self.expected_ack_seq, self.next_tx_seq, tx_seq) {
                return self.retransmit(tx_seq).map(Some);
            }
            trace!("selectively rejected frame {} was acknowledged in the meantime", tx_seq);
        }

        if let Some(cursor) = self.retransmit_cursor {
            if cursor != self.next_tx_seq {
                self.retransmit_cursor = Some(self.space.next(cursor));
                return self.retransmit(cursor).map(Some);
            }
            self.retransmit_cursor = None;
        }

        if awaiting_final {
            return Ok(None);
        }
        Ok(self.next_new_segment())
    }

    fn retransmit(&mut self, tx_seq: SeqNum) -> Result<OutboundIFrame, ChannelError> {
        let index = self.slot_index(tx_seq);
        let max_transmit = self.max_transmit;

        let slot = self.slots[index].as_mut()
            .expect("this is a bug: in-flight frame without a slot");
        debug_assert_eq!(slot.tx_seq, tx_seq);

        if max_transmit != 0 && slot.retry_count >= max_transmit {
            debug!("frame {} was sent {} times without being acknowledged", tx_seq, slot.retry_count);
            return Err(ChannelError::RetryExhausted { max_transmit });
        }
        slot.retry_count = slot.retry_count.saturating_add(1);
        slot.selected_for_retransmission = false;

        debug!("retransmitting frame {} (transmission #{})", tx_seq, slot.retry_count);
        Ok(OutboundIFrame {
            tx_seq,
            sar: slot.sar,
            payload: slot.payload.clone(),
            retransmission: true,
            completed_sdu: None,
        })
    }

    fn next_new_segment(&mut self) -> Option<OutboundIFrame> {
        let slot_ref = self.acquire_slot()?;

        if self.current_sdu.is_none() {
            let (id, sdu) = self.pending_sdus.pop_front()?;
            self.current_sdu = Some((id, Segmenter::new(sdu, self.mps)));
        }
        let (sdu, segment) = match &mut self.current_sdu {
            Some((id, segmenter)) => (*id, segmenter.next()?),
            None => return None,
        };
        if segment.is_last {
            self.current_sdu = None;
        }

        let tx_seq = slot_ref.tx_seq;
        self.next_tx_seq = self.space.next(tx_seq);

        let completed_sdu = if self.retains_slots {
            let prev = self.slots[slot_ref.index].replace(TxSlot {
                tx_seq,
                sar: segment.sar,
                payload: segment.payload.clone(),
                retry_count: 1,
                sdu,
                last_of_sdu: segment.is_last,
                selected_for_retransmission: false,
            });
            debug_assert!(prev.is_none(), "slot {} is still occupied", slot_ref.index);
            None
        }
        else {
            // nothing is ever acknowledged, so the window base follows the send position
            self.expected_ack_seq = self.next_tx_seq;
            segment.is_last.then_some(sdu)
        };

        trace!("sending frame {} ({:?}) of {} - {} in flight", tx_seq, segment.sar, sdu, self.in_flight());
        debug_assert!(!self.retains_slots || self.in_flight() <= self.window_size);

        Some(OutboundIFrame {
            tx_seq,
            sar: segment.sar,
            payload: segment.payload,
            retransmission: false,
            completed_sdu,
        })
    }

    /// Processes a cumulative acknowledgement: all frames before `req_seq` are acknowledged.
    ///  `on_sdu_complete` is called for each SDU whose last frame is released. A reject
    ///  additionally triggers retransmission of all frames from `req_seq` on. That is the
    ///  go-back-N rewind of the send sequence, done by pointing the retransmission cursor at
    ///  `req_seq`: `next_tx_seq` itself stays where it is, and [TransmitWindow::next_to_send]
    ///  resends from the cursor up to it before taking new segments.
    ///
    /// Returns the number of newly acknowledged frames.
    pub fn on_ack(&mut self, req_seq: SeqNum, is_reject: bool, mut on_sdu_complete: impl FnMut(SduId)) -> Result<u16, ChannelError> {
        if !self.space.in_range_inclusive(self.expected_ack_seq, self.next_tx_seq, req_seq) {
            return Err(ChannelError::SequenceError {
                seq: req_seq,
                lower: self.expected_ack_seq,
                upper: self.next_tx_seq,
            });
        }

        let num_acked = self.space.offset(self.expected_ack_seq, req_seq);
        for _ in 0..num_acked {
            if let Some(slot) = self.slots.get_mut(self.head).and_then(|s| s.take()) {
                if slot.last_of_sdu {
                    on_sdu_complete(slot.sdu);
                }
            }
            if !self.slots.is_empty() {
                self.head = (self.head + 1) % self.slots.len();
            }
        }
        self.expected_ack_seq = req_seq;

        if num_acked > 0 {
            trace!("acknowledged {} frames up to {}, {} still in flight", num_acked, req_seq, self.in_flight());
        }

        if let Some(cursor) = self.retransmit_cursor {
            if !self.space.in_range_inclusive(self.expected_ack_seq, self.next_tx_seq, cursor) {
                self.retransmit_cursor = Some(self.expected_ack_seq);
            }
        }

        if is_reject && self.retransmits {
            self.retransmit_unacked();
        }
        Ok(num_acked)
    }

    /// go-back-N from the oldest unacknowledged frame
    pub fn retransmit_unacked(&mut self) {
        if !self.retransmits || self.in_flight() == 0 {
            return;
        }
        debug!("retransmitting all {} unacknowledged frames from {}", self.in_flight(), self.expected_ack_seq);
        self.retransmit_cursor = Some(self.expected_ack_seq);
    }

    /// Schedules the retransmission of a single frame without acknowledging anything
    pub fn mark_selective(&mut self, tx_seq: SeqNum) -> Result<(), ChannelError> {
        if !self.space.in_range(self.expected_ack_seq, self.next_tx_seq, tx_seq) {
            return Err(ChannelError::SequenceError {
                seq: tx_seq,
                lower: self.expected_ack_seq,
                upper: self.next_tx_seq,
            });
        }

        let index = self.slot_index(tx_seq);
        if let Some(slot) = self.slots[index].as_mut() {
            if !slot.selected_for_retransmission {
                slot.selected_for_retransmission = true;
                self.selective.push_back(tx_seq);
            }
        }
        Ok(())
    }

    /// An acknowledgement for frames that were already given up on. Flow-Control mode ignores
    ///  these rather than treating them as a protocol violation.
    pub fn is_stale_ack(&self, req_seq: SeqNum) -> bool {
        !self.space.in_range_inclusive(self.expected_ack_seq, self.next_tx_seq, req_seq)
            && self.space.offset(req_seq, self.expected_ack_seq) <= self.window_size
    }

    /// Gives up on all in-flight frames without retransmitting them. Returns the number of
    ///  frames lost.
    pub fn declare_lost(&mut self) -> u16 {
        let num_lost = self.in_flight();
        for _ in 0..num_lost {
            if let Some(slot) = self.slots.get_mut(self.head) {
                *slot = None;
                self.head = (self.head + 1) % self.slots.len();
            }
        }
        self.expected_ack_seq = self.next_tx_seq;
        self.retransmit_cursor = None;
        self.selective.clear();

        if num_lost > 0 {
            debug!("declared {} unacknowledged frames lost", num_lost);
        }
        num_lost
    }

    /// Releases all slots and queued SDUs
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.head = 0;
        self.expected_ack_seq = self.next_tx_seq;
        self.selective.clear();
        self.retransmit_cursor = None;
        self.pending_sdus.clear();
        self.current_sdu = None;
    }

    fn slot_index(&self, tx_seq: SeqNum) -> usize {
        if self.slots.is_empty() {
            return 0;
        }
        (self.head + self.space.offset(self.expected_ack_seq, tx_seq) as usize) % self.slots.len()
    }
}
