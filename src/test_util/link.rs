use std::collections::VecDeque;
use bytes::{Bytes, BytesMut};
use crate::channel::{Channel, ChannelAction};
use crate::config::ChannelConfig;
use crate::error::DisconnectReason;
use crate::frame::{Frame, FrameCodec};
use crate::test_util::peer_config;
use crate::timer::TimerToken;
use crate::transmit_window::SduId;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Side {
    A,
    B,
}

impl Side {
    fn idx(&self) -> usize {
        match self {
            Side::A => 0,
            Side::B => 1,
        }
    }

    fn other(&self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Fault {
    Drop,
    /// flips a bit in the last byte before the FCS
    Corrupt,
    Duplicate,
}

struct FaultRule {
    from: Side,
    matches: Box<dyn Fn(&Frame) -> bool>,
    fault: Fault,
    /// `None` for rules that never wear off
    remaining: Option<usize>,
}

/// Two channels connected back to back. PDUs are delivered in FIFO order and fault rules
///  decide which of them are dropped, corrupted or duplicated on the way.
///
/// Timers do not run by themselves: tests fire them explicitly or let [LossyLink::settle]
///  fire whatever is armed once the link is quiet. The link tracks the timer actions of both
///  channels and panics if a channel ever arms a second timer while one is running.
pub struct LossyLink {
    channels: [Channel; 2],
    codecs: [FrameCodec; 2],
    in_transit: VecDeque<(Side, Bytes)>,
    rules: Vec<FaultRule>,

    /// all frames put on the link by each side, decoded, including those that were then lost
    pub sent_frames: [Vec<Frame>; 2],
    pub delivered: [Vec<Bytes>; 2],
    pub completed: [Vec<SduId>; 2],
    pub disconnected: [Option<DisconnectReason>; 2],

    armed: [Option<TimerToken>; 2],
    pub budget: usize,
}

impl LossyLink {
    pub fn new(config: ChannelConfig) -> LossyLink {
        let peer = peer_config(&config);
        LossyLink {
            // each codec decodes what the *other* side sends
            codecs: [FrameCodec::new(&peer), FrameCodec::new(&config)],
            channels: [Channel::new(config).unwrap(), Channel::new(peer).unwrap()],
            in_transit: VecDeque::new(),
            rules: Vec::new(),
            sent_frames: Default::default(),
            delivered: Default::default(),
            completed: Default::default(),
            disconnected: Default::default(),
            armed: Default::default(),
            budget: usize::MAX,
        }
    }

    pub fn channel(&mut self, side: Side) -> &mut Channel {
        &mut self.channels[side.idx()]
    }

    /// applies `fault` to the next `count` frames sent by `from` that match
    pub fn add_fault(&mut self, from: Side, count: usize, fault: Fault, matches: impl Fn(&Frame) -> bool + 'static) {
        self.rules.push(FaultRule { from, matches: Box::new(matches), fault, remaining: Some(count) });
    }

    pub fn add_permanent_fault(&mut self, from: Side, fault: Fault, matches: impl Fn(&Frame) -> bool + 'static) {
        self.rules.push(FaultRule { from, matches: Box::new(matches), fault, remaining: None });
    }

    pub fn send_sdu(&mut self, side: Side, sdu: &[u8]) -> SduId {
        self.channel(side).send_sdu(Bytes::copy_from_slice(sdu)).unwrap()
    }

    /// lets a channel transmit and executes its actions
    pub fn collect(&mut self, side: Side) {
        let budget = self.budget;
        self.channel(side).poll_transmit(budget);
        self.drain_actions(side);
    }

    fn drain_actions(&mut self, side: Side) {
        while let Some(action) = self.channels[side.idx()].poll_action() {
            match action {
                ChannelAction::Transmit(pdu) => self.on_transmit(side, pdu),
                ChannelAction::DeliverSdu(sdu) => self.delivered[side.idx()].push(sdu),
                ChannelAction::SduSent(id) => self.completed[side.idx()].push(id),
                ChannelAction::Disconnected(reason) => {
                    assert!(self.disconnected[side.idx()].is_none(), "second disconnect on side {:?}", side);
                    self.disconnected[side.idx()] = Some(reason);
                }
                ChannelAction::StartTimer { token, .. } => {
                    assert!(self.armed[side.idx()].is_none(), "side {:?} armed a second timer", side);
                    self.armed[side.idx()] = Some(token);
                }
                ChannelAction::CancelTimer { token } => {
                    assert_eq!(self.armed[side.idx()], Some(token), "side {:?} cancelled a timer that is not armed", side);
                    self.armed[side.idx()] = None;
                }
            }
        }
    }

    fn on_transmit(&mut self, from: Side, pdu: Bytes) {
        let frame = self.codecs[from.other().idx()].decode(&pdu)
            .expect("channel sent an undecodable PDU");

        let fault = self.rules.iter_mut()
            .filter(|r| r.from == from && r.remaining != Some(0))
            .find(|r| (r.matches)(&frame))
            .map(|r| {
                if let Some(n) = r.remaining.as_mut() {
                    *n -= 1;
                }
                r.fault
            });
        self.sent_frames[from.idx()].push(frame);

        match fault {
            None => self.in_transit.push_back((from, pdu)),
            Some(Fault::Drop) => {}
            Some(Fault::Corrupt) => {
                let mut corrupted = BytesMut::from(pdu.as_ref());
                let idx = corrupted.len() - 3;
                corrupted[idx] ^= 0x01;
                self.in_transit.push_back((from, corrupted.freeze()));
            }
            Some(Fault::Duplicate) => {
                self.in_transit.push_back((from, pdu.clone()));
                self.in_transit.push_back((from, pdu));
            }
        }
    }

    /// Transmits and delivers until neither side has anything more to say
    pub fn run(&mut self) {
        for _ in 0..100_000 {
            self.collect(Side::A);
            self.collect(Side::B);

            match self.in_transit.pop_front() {
                None => return,
                Some((from, pdu)) => {
                    let to = from.other();
                    self.channel(to).on_pdu_received(&pdu);
                    self.collect(to);
                }
            }
        }
        panic!("link did not settle");
    }

    /// Fires the armed timer of `side`, if any
    pub fn fire_timer(&mut self, side: Side) -> bool {
        match self.channel(side).armed_timer() {
            Some((kind, token)) => {
                assert_eq!(self.armed[side.idx()], Some(token));
                self.armed[side.idx()] = None;
                self.channel(side).on_timer_expired(kind, token);
                self.drain_actions(side);
                true
            }
            None => false,
        }
    }

    /// Runs the link, firing timers whenever it goes quiet, until no timer is armed any more
    ///  (or `max_timeouts` timers fired)
    pub fn settle(&mut self, max_timeouts: usize) {
        self.run();
        for _ in 0..max_timeouts {
            if !self.fire_timer(Side::A) && !self.fire_timer(Side::B) {
                return;
            }
            self.run();
        }
    }

    pub fn sent_i_frames(&self, side: Side) -> Vec<u16> {
        self.sent_frames[side.idx()].iter()
            .filter_map(|f| f.tx_seq())
            .collect()
    }
}
