use std::collections::VecDeque;
use std::time::Duration;
use bytes::Bytes;
use tracing::{debug, info, trace, warn};
use crate::config::{ChannelConfig, ChannelMode};
use crate::error::{ChannelError, DisconnectReason};
use crate::frame::control_field::{IControl, SControl};
use crate::frame::{Frame, FrameCodec, SupervisoryType};
use crate::receive_sequencer::{IFrameOutcome, ReceiveSequencer};
use crate::seq_num::SeqNum;
use crate::stats::ChannelStats;
use crate::timer::{TimerKind, TimerState, TimerSupervisor, TimerToken, TimerTransition};
use crate::transmit_window::{SduId, TransmitWindow};

/// Idle and Configuring happen before a [Channel] exists: it is created with the result of
///  configuration negotiation and starts out `Open`
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelState {
    Open,
    Closing,
    Closed,
}

/// The channel's instructions to its environment, in the order they must be executed
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChannelAction {
    /// hand an encoded PDU to the transport
    Transmit(Bytes),
    /// hand a reassembled SDU to the upper layer
    DeliverSdu(Bytes),
    /// arm a timer that reports back through [Channel::on_timer_expired] with `kind` and `token`
    StartTimer { kind: TimerKind, after: Duration, token: TimerToken },
    CancelTimer { token: TimerToken },
    /// an outbound SDU was transmitted completely and acknowledged, as far as the mode goes
    SduSent(SduId),
    /// This is always the last action of a channel
    Disconnected(DisconnectReason),
}


/// A single channel's ARQ engine, without any I/O.
///
/// Every input is an event: an inbound PDU, a send request, a local-busy change, a timer
///  expiry or a request to transmit. Each event is processed to completion, and the resulting
///  [ChannelAction]s are queued for the caller to pick up via [Channel::poll_action] and
///  execute in order.
///
/// New I-frames are only sent from [Channel::poll_transmit], which also flushes pending
///  acknowledgements. Callers should invoke it after every other event, so that
///  acknowledgements can piggyback on outgoing I-frames where possible.
pub struct Channel {
    config: ChannelConfig,
    codec: FrameCodec,
    state: ChannelState,

    window: TransmitWindow,
    sequencer: ReceiveSequencer,
    timers: TimerSupervisor,

    remote_busy: bool,
    local_busy: bool,
    /// we polled the peer and are waiting for the final response
    p_bit_pending: bool,
    /// the peer polled us, so the next frame we send carries the F bit
    f_bit_pending: bool,
    /// a REJ arrived while waiting for the final response, so the final response does not
    ///  trigger another retransmission
    rej_actioned: bool,
    /// the current event acknowledged frames, so the retransmission timer starts over
    ack_progress: bool,

    next_sdu_id: u64,
    basic_queue: VecDeque<(SduId, Bytes)>,

    actions: VecDeque<ChannelAction>,
    stats: ChannelStats,
}

impl Channel {
    pub fn new(config: ChannelConfig) -> anyhow::Result<Channel> {
        config.validate()?;

        info!("opening channel {:#06x} -> {:#06x} in {:?} mode", config.local_cid, config.remote_cid, config.mode);
        Ok(Channel {
            codec: FrameCodec::new(&config),
            state: ChannelState::Open,
            window: TransmitWindow::new(&config),
            sequencer: ReceiveSequencer::new(&config),
            timers: TimerSupervisor::new(&config),
            remote_busy: false,
            local_busy: false,
            p_bit_pending: false,
            f_bit_pending: false,
            rej_actioned: false,
            ack_progress: false,
            next_sdu_id: 0,
            basic_queue: VecDeque::new(),
            actions: VecDeque::new(),
            stats: ChannelStats::default(),
            config,
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    pub fn in_flight(&self) -> u16 {
        self.window.in_flight()
    }

    pub fn next_tx_seq(&self) -> SeqNum {
        self.window.next_tx_seq()
    }

    pub fn expected_ack_seq(&self) -> SeqNum {
        self.window.expected_ack_seq()
    }

    pub fn expected_tx_seq(&self) -> SeqNum {
        self.sequencer.expected_tx_seq()
    }

    pub fn timer_state(&self) -> TimerState {
        self.timers.state()
    }

    pub fn armed_timer(&self) -> Option<(TimerKind, TimerToken)> {
        self.timers.armed()
    }

    pub fn is_remote_busy(&self) -> bool {
        self.remote_busy
    }

    pub fn is_local_busy(&self) -> bool {
        self.local_busy
    }

    pub fn has_pending_data(&self) -> bool {
        !self.basic_queue.is_empty() || self.window.has_pending_data() || self.window.is_retransmitting()
    }

    pub fn poll_action(&mut self) -> Option<ChannelAction> {
        self.actions.pop_front()
    }

    /// Accepts an SDU for transmission. It is sent by subsequent calls to
    ///  [Channel::poll_transmit] as the window permits.
    pub fn send_sdu(&mut self, sdu: Bytes) -> Result<SduId, ChannelError> {
        if self.state != ChannelState::Open {
            return Err(ChannelError::ChannelClosed);
        }
        if sdu.len() > self.config.mtu as usize {
            return Err(ChannelError::SduTooLarge { len: sdu.len(), mtu: self.config.mtu });
        }

        let id = SduId::from_raw(self.next_sdu_id);
        self.next_sdu_id += 1;

        if self.config.mode == ChannelMode::Basic {
            self.basic_queue.push_back((id, sdu));
        }
        else {
            self.window.enqueue_sdu(id, sdu);
        }
        Ok(id)
    }

    pub fn on_pdu_received(&mut self, pdu: &[u8]) {
        if self.state != ChannelState::Open {
            debug!("channel {:#06x} is closed - dropping inbound PDU", self.config.local_cid);
            return;
        }

        let result = self.codec.decode(pdu)
            .and_then(|frame| {
                self.stats.frames_received += 1;
                self.on_frame(frame)
            });
        self.complete_event(result);
    }

    /// Signals (or clears) local resource pressure. A busy channel asks its peer to pause.
    pub fn set_local_busy(&mut self, busy: bool) {
        if self.state != ChannelState::Open || busy == self.local_busy {
            return;
        }
        debug!("local busy: {}", busy);
        self.local_busy = busy;

        match self.config.mode {
            ChannelMode::EnhancedRetransmission => {
                let s_type = if busy { SupervisoryType::Rnr } else { SupervisoryType::Rr };
                self.send_supervisory(s_type, false);
            }
            ChannelMode::Retransmission | ChannelMode::FlowControl => {
                // the R bit carries the busy state
                self.send_supervisory(SupervisoryType::Rr, false);
            }
            ChannelMode::Basic | ChannelMode::Streaming => {
                debug!("{:?} mode has no way to signal local busy to the peer", self.config.mode);
            }
        }
        self.complete_event(Ok(()));
    }

    pub fn on_timer_expired(&mut self, kind: TimerKind, token: TimerToken) {
        if self.state != ChannelState::Open {
            debug!("channel {:#06x} is closed - ignoring {:?} timer", self.config.local_cid, kind);
            return;
        }
        if !self.timers.on_expired(kind, token) {
            return;
        }

        let result = match (self.config.mode, kind) {
            (ChannelMode::EnhancedRetransmission, TimerKind::Retransmission) => {
                let transition = self.timers.on_retransmission_expire();
                self.apply_timer_transition(transition);
                self.send_poll();
                Ok(())
            }
            (ChannelMode::EnhancedRetransmission, TimerKind::Monitor) => {
                match self.timers.on_monitor_expire() {
                    Ok(transition) => {
                        self.apply_timer_transition(transition);
                        self.send_poll();
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            (ChannelMode::Retransmission, TimerKind::Retransmission) => {
                self.window.retransmit_unacked();
                Ok(())
            }
            (ChannelMode::Retransmission, TimerKind::Monitor) => {
                // probe whether the peer is still busy
                self.send_supervisory(SupervisoryType::Rr, false);
                Ok(())
            }
            (ChannelMode::FlowControl, TimerKind::Retransmission) => {
                self.stats.lost_frames += self.window.declare_lost() as u64;
                Ok(())
            }
            (mode, kind) => {
                debug!("ignoring {:?} timer in {:?} mode", kind, mode);
                Ok(())
            }
        };
        self.complete_event(result);
    }

    /// Transmits up to `budget` I-frames, then flushes acknowledgements and poll responses.
    ///  Supervisory frames are not limited by the budget. Returns the number of I-frames sent.
    pub fn poll_transmit(&mut self, budget: usize) -> usize {
        if self.state != ChannelState::Open {
            return 0;
        }

        let mut num_sent = 0;
        let mut result = Ok(());
        while num_sent < budget {
            match self.next_outbound() {
                Ok(Some((frame, completed_sdu))) => {
                    self.transmit(&frame);
                    if let Some(id) = completed_sdu {
                        self.stats.sdus_completed += 1;
                        self.actions.push_back(ChannelAction::SduSent(id));
                    }
                    num_sent += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        if result.is_ok() {
            self.flush_ack();
        }
        self.complete_event(result);
        num_sent
    }

    /// Tears the channel down. Closing is idempotent: only the first call has an effect.
    pub fn close(&mut self, reason: DisconnectReason) {
        if self.state != ChannelState::Open {
            debug!("channel {:#06x} is already closed", self.config.local_cid);
            return;
        }
        self.state = ChannelState::Closing;

        // the timer goes first so that no expiry can refer to released state
        if let Some(token) = self.timers.cancel() {
            self.actions.push_back(ChannelAction::CancelTimer { token });
        }

        self.window.clear();
        self.sequencer.clear();
        self.basic_queue.clear();
        self.remote_busy = false;
        self.p_bit_pending = false;
        self.f_bit_pending = false;
        self.rej_actioned = false;

        self.state = ChannelState::Closed;
        info!("channel {:#06x} closed: {:?} (reason code {:#06x})", self.config.local_cid, reason, reason.code());
        self.actions.push_back(ChannelAction::Disconnected(reason));
    }

    fn is_ertm(&self) -> bool {
        self.config.mode == ChannelMode::EnhancedRetransmission
    }

    fn is_legacy(&self) -> bool {
        matches!(self.config.mode, ChannelMode::Retransmission | ChannelMode::FlowControl)
    }

    fn complete_event(&mut self, result: Result<(), ChannelError>) {
        if let Err(e) = result {
            match DisconnectReason::try_from(&e) {
                Ok(reason) => {
                    warn!("channel {:#06x}: {} - disconnecting", self.config.local_cid, e);
                    self.close(reason);
                    return;
                }
                Err(()) => self.on_recoverable_error(&e),
            }
        }
        if self.state == ChannelState::Open {
            self.update_timers();
        }
    }

    fn on_recoverable_error(&mut self, e: &ChannelError) {
        debug!("discarding frame: {}", e);
        match e {
            ChannelError::MalformedFrame(_) => self.stats.malformed_frames += 1,
            ChannelError::FcsMismatch { .. } => self.stats.fcs_errors += 1,
            ChannelError::DuplicateFrame(_) => self.stats.duplicates += 1,
            _ => {}
        }
    }

    fn on_frame(&mut self, frame: Frame) -> Result<(), ChannelError> {
        match frame {
            Frame::Basic { payload } => self.on_basic_frame(payload),
            Frame::Information { control, payload } => self.on_iframe(control, payload),
            Frame::Supervisory(control) => self.on_sframe(control),
        }
    }

    fn on_basic_frame(&mut self, payload: Bytes) -> Result<(), ChannelError> {
        if payload.len() > self.config.mtu as usize {
            return Err(ChannelError::MalformedFrame("SDU exceeds the MTU"));
        }
        self.deliver(payload);
        Ok(())
    }

    fn on_iframe(&mut self, control: IControl, payload: Bytes) -> Result<(), ChannelError> {
        if self.config.mode != ChannelMode::Streaming {
            if self.is_legacy() {
                self.set_remote_busy(control.r_bit);
            }
            self.process_ack(control.req_seq, false)?;
            if control.f_bit && self.is_ertm() {
                self.on_f_bit(false);
            }
        }

        match self.sequencer.on_iframe(control.tx_seq, control.sar, &payload, self.local_busy)? {
            IFrameOutcome::Accepted { sdu, lost } => {
                self.stats.lost_frames += lost as u64;
                if let Some(sdu) = sdu {
                    self.deliver(sdu);
                }
            }
            IFrameOutcome::Duplicate => return Err(ChannelError::DuplicateFrame(control.tx_seq)),
            IFrameOutcome::OutOfOrder { send_reject } => {
                if send_reject {
                    self.send_supervisory(SupervisoryType::Rej, false);
                }
            }
            IFrameOutcome::DroppedBusy => {}
        }
        Ok(())
    }

    fn on_sframe(&mut self, control: SControl) -> Result<(), ChannelError> {
        if self.config.mode == ChannelMode::Streaming {
            return Err(ChannelError::MalformedFrame("S-frame on a streaming channel"));
        }
        if control.p_bit && control.f_bit {
            return Err(ChannelError::MalformedFrame("S-frame with both P and F bit"));
        }
        trace!("received {:?}", control);

        if self.is_legacy() {
            self.set_remote_busy(control.r_bit);
        }

        match control.s_type {
            SupervisoryType::Rr => {
                if self.is_ertm() {
                    self.set_remote_busy(false);
                }
                self.process_ack(control.req_seq, false)?;
            }
            SupervisoryType::Rnr => {
                self.stats.rnr_received += 1;
                self.set_remote_busy(true);
                self.process_ack(control.req_seq, false)?;
            }
            SupervisoryType::Rej => {
                self.stats.rej_received += 1;
                if self.is_ertm() {
                    self.set_remote_busy(false);
                }
                self.process_ack(control.req_seq, true)?;
                if self.p_bit_pending && !control.f_bit {
                    self.rej_actioned = true;
                }
            }
            SupervisoryType::Srej => {
                self.stats.srej_received += 1;
                debug!("peer selectively rejected frame {}", control.req_seq);
                self.window.mark_selective(control.req_seq)?;
            }
        }

        if control.f_bit {
            self.on_f_bit(matches!(control.s_type, SupervisoryType::Rej | SupervisoryType::Srej));
        }
        if control.p_bit {
            debug!("peer polled - the next frame carries the F bit");
            self.f_bit_pending = true;
        }
        Ok(())
    }

    /// the final response to a poll: the peer's ReqSeq was processed already, and frames it
    ///  did not acknowledge are retransmitted unless a reject took care of that
    fn on_f_bit(&mut self, retransmission_requested: bool) {
        if !self.p_bit_pending {
            debug!("ignoring F bit without an outstanding poll");
            return;
        }
        debug!("received final response to poll");
        self.p_bit_pending = false;
        self.timers.on_final_received();

        if !self.rej_actioned && !retransmission_requested {
            self.window.retransmit_unacked();
        }
        self.rej_actioned = false;
    }

    fn set_remote_busy(&mut self, busy: bool) {
        if busy != self.remote_busy {
            debug!("remote busy: {}", busy);
            self.remote_busy = busy;
        }
    }

    fn process_ack(&mut self, req_seq: SeqNum, is_reject: bool) -> Result<(), ChannelError> {
        if self.config.mode == ChannelMode::FlowControl && self.window.is_stale_ack(req_seq) {
            debug!("ignoring stale acknowledgement {}", req_seq);
            self.stats.stale_acks += 1;
            return Ok(());
        }

        let actions = &mut self.actions;
        let stats = &mut self.stats;
        let num_acked = self.window.on_ack(req_seq, is_reject, |id| {
            trace!("{} was acknowledged", id);
            stats.sdus_completed += 1;
            actions.push_back(ChannelAction::SduSent(id));
        })?;

        if num_acked > 0 {
            self.ack_progress = true;
        }
        Ok(())
    }

    fn deliver(&mut self, sdu: Bytes) {
        trace!("delivering SDU with {} bytes", sdu.len());
        self.stats.sdus_delivered += 1;
        self.actions.push_back(ChannelAction::DeliverSdu(sdu));
    }

    fn next_outbound(&mut self) -> Result<Option<(Frame, Option<SduId>)>, ChannelError> {
        if self.config.mode == ChannelMode::Basic {
            return Ok(self.basic_queue.pop_front()
                .map(|(id, payload)| (Frame::Basic { payload }, Some(id))));
        }

        let frame = match self.window.next_to_send(self.remote_busy, self.p_bit_pending)? {
            Some(frame) => frame,
            None => return Ok(None),
        };
        if frame.retransmission {
            self.stats.retransmissions += 1;
        }

        let req_seq = if self.config.mode == ChannelMode::Streaming {
            SeqNum::ZERO
        }
        else {
            self.sequencer.take_ack()
        };
        let control = IControl {
            tx_seq: frame.tx_seq,
            req_seq,
            f_bit: self.is_ertm() && std::mem::take(&mut self.f_bit_pending),
            r_bit: self.is_legacy() && self.local_busy,
            sar: frame.sar,
        };
        Ok(Some((Frame::Information { control, payload: frame.payload }, frame.completed_sdu)))
    }

    /// sends an explicit acknowledgement or poll response unless an I-frame took care of it
    fn flush_ack(&mut self) {
        let needs_ack = match self.config.mode {
            ChannelMode::Basic | ChannelMode::Streaming => false,
            ChannelMode::EnhancedRetransmission => self.f_bit_pending || self.sequencer.ack_pending(),
            ChannelMode::Retransmission | ChannelMode::FlowControl => self.sequencer.ack_pending(),
        };
        if needs_ack {
            self.send_supervisory(self.receiver_status(), false);
        }
    }

    fn receiver_status(&self) -> SupervisoryType {
        if self.local_busy && self.is_ertm() {
            SupervisoryType::Rnr
        }
        else {
            SupervisoryType::Rr
        }
    }

    fn send_poll(&mut self) {
        self.p_bit_pending = true;
        self.stats.polls_sent += 1;
        debug!("polling peer");
        self.send_supervisory(self.receiver_status(), true);
    }

    fn send_supervisory(&mut self, s_type: SupervisoryType, p_bit: bool) {
        match s_type {
            SupervisoryType::Rej => self.stats.rej_sent += 1,
            SupervisoryType::Rnr => self.stats.rnr_sent += 1,
            _ => {}
        }

        let control = SControl {
            s_type,
            req_seq: self.sequencer.take_ack(),
            f_bit: !p_bit && self.is_ertm() && std::mem::take(&mut self.f_bit_pending),
            p_bit,
            r_bit: self.is_legacy() && self.local_busy,
        };
        self.transmit(&Frame::Supervisory(control));
    }

    fn transmit(&mut self, frame: &Frame) {
        let pdu = self.codec.encode(frame);
        self.stats.frames_sent += 1;
        self.actions.push_back(ChannelAction::Transmit(pdu));
    }

    fn update_timers(&mut self) {
        let in_flight = self.window.in_flight() > 0;
        let desired = match self.config.mode {
            ChannelMode::EnhancedRetransmission => {
                if self.p_bit_pending { TimerState::MonitorArmed }
                else if in_flight { TimerState::RetransmissionArmed }
                else { TimerState::Idle }
            }
            ChannelMode::Retransmission => {
                if self.remote_busy { TimerState::MonitorArmed }
                else if in_flight { TimerState::RetransmissionArmed }
                else { TimerState::Idle }
            }
            ChannelMode::FlowControl => {
                if in_flight { TimerState::RetransmissionArmed }
                else { TimerState::Idle }
            }
            ChannelMode::Basic | ChannelMode::Streaming => TimerState::Idle,
        };

        let restart = std::mem::take(&mut self.ack_progress) && desired == TimerState::RetransmissionArmed;
        let transition = self.timers.reevaluate(desired, restart);
        self.apply_timer_transition(transition);
    }

    fn apply_timer_transition(&mut self, transition: TimerTransition) {
        if let Some(token) = transition.cancel {
            self.actions.push_back(ChannelAction::CancelTimer { token });
        }
        if let Some(start) = transition.start {
            self.actions.push_back(ChannelAction::StartTimer { kind: start.kind, after: start.after, token: start.token });
        }
    }
}
