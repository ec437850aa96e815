use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};
use crate::error::ChannelError;
use crate::frame::SarType;
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// Start and Unsegmented I-frames carry the total SDU length (u16 LE) in front of their payload
pub const SDU_LENGTH_PREFIX_LEN: usize = std::mem::size_of::<u16>();

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Segment {
    /// the I-frame payload, including the SDU length prefix for the first segment
    pub payload: Bytes,
    pub sar: SarType,
    pub is_last: bool,
}

/// Cuts the next segment of at most `mps` bytes from `remaining`, which is the part of an SDU
///  that was not segmented yet. `sdu_len` is the SDU's total length, which is written into the
///  first segment's length prefix.
pub fn segment(remaining: &mut Bytes, sdu_len: usize, mps: usize, is_first: bool) -> Segment {
    debug_assert!(mps > SDU_LENGTH_PREFIX_LEN);

    if is_first {
        let mut payload = BytesMut::with_capacity(mps);
        payload.put_u16_le(sdu_len.prechecked_cast());

        if SDU_LENGTH_PREFIX_LEN + remaining.len() <= mps {
            payload.put_slice(remaining);
            remaining.clear();
            return Segment { payload: payload.freeze(), sar: SarType::Unsegmented, is_last: true };
        }

        let chunk = remaining.split_to(mps - SDU_LENGTH_PREFIX_LEN);
        payload.put_slice(&chunk);
        return Segment { payload: payload.freeze(), sar: SarType::Start, is_last: false };
    }

    if remaining.len() <= mps {
        let payload = std::mem::take(remaining);
        return Segment { payload, sar: SarType::End, is_last: true };
    }

    let payload = remaining.split_to(mps);
    Segment { payload, sar: SarType::Continue, is_last: false }
}


/// Walks an outbound SDU segment by segment
#[derive(Debug)]
pub struct Segmenter {
    remaining: Bytes,
    sdu_len: usize,
    mps: usize,
    is_first: bool,
    done: bool,
}

impl Segmenter {
    pub fn new(sdu: Bytes, mps: u16) -> Segmenter {
        Segmenter {
            sdu_len: sdu.len(),
            remaining: sdu,
            mps: mps.safe_cast(),
            is_first: true,
            done: false,
        }
    }
}

impl Iterator for Segmenter {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if self.done {
            return None;
        }
        let segment = segment(&mut self.remaining, self.sdu_len, self.mps, self.is_first);
        self.is_first = false;
        self.done = segment.is_last;
        Some(segment)
    }
}


#[derive(Debug, Eq, PartialEq)]
pub enum ReassembleResult {
    InProgress,
    Complete(Bytes),
    Fatal(ChannelError),
    /// a Continue / End segment was dropped while waiting for the next SDU start after a gap
    Skipped,
}

/// The per-channel reassembly buffer for the SDU currently being received
#[derive(Debug)]
pub struct Reassembler {
    mtu: usize,
    /// declared total length and the bytes received so far - `None` between SDUs
    in_progress: Option<(usize, BytesMut)>,
    /// set after a gap in the lossy modes: continuation segments are dropped until the next
    ///  Start / Unsegmented segment
    resync: bool,
}

impl Reassembler {
    pub fn new(mtu: u16) -> Reassembler {
        Reassembler {
            mtu: mtu.safe_cast(),
            in_progress: None,
            resync: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.in_progress.is_none()
    }

    /// `(declared, received)` for the SDU in progress
    pub fn progress(&self) -> Option<(usize, usize)> {
        self.in_progress.as_ref()
            .map(|(declared, buf)| (*declared, buf.len()))
    }

    /// Discards a partial SDU, e.g. because a frame belonging to it was lost for good
    pub fn abort_partial(&mut self) {
        if let Some((declared, buf)) = self.in_progress.take() {
            debug!("discarding partially received SDU ({} of {} bytes)", buf.len(), declared);
        }
        self.resync = true;
    }

    pub fn clear(&mut self) {
        self.in_progress = None;
        self.resync = false;
    }

    pub fn reassemble(&mut self, payload: &[u8], sar: SarType) -> ReassembleResult {
        match sar {
            SarType::Unsegmented | SarType::Start => self.on_first_segment(payload, sar),
            SarType::Continue | SarType::End => self.on_subsequent_segment(payload, sar),
        }
    }

    fn on_first_segment(&mut self, payload: &[u8], sar: SarType) -> ReassembleResult {
        if let Some((declared, buf)) = self.in_progress.take() {
            debug!("new SDU starts while {} of {} bytes of the previous SDU were received - discarding the partial SDU", buf.len(), declared);
        }
        self.resync = false;

        if payload.len() < SDU_LENGTH_PREFIX_LEN {
            warn!("{:?} segment too short for the SDU length prefix", sar);
            return ReassembleResult::Fatal(ChannelError::SduLengthMismatch { declared: 0, received: payload.len() });
        }
        let declared: usize = u16::from_le_bytes([payload[0], payload[1]]).safe_cast();
        let data = &payload[SDU_LENGTH_PREFIX_LEN..];

        if declared > self.mtu {
            warn!("declared SDU length {} exceeds the MTU of {}", declared, self.mtu);
            return ReassembleResult::Fatal(ChannelError::SduLengthMismatch { declared, received: data.len() });
        }

        match sar {
            SarType::Unsegmented => {
                if data.len() != declared {
                    warn!("unsegmented SDU declares {} bytes but carries {}", declared, data.len());
                    return ReassembleResult::Fatal(ChannelError::SduLengthMismatch { declared, received: data.len() });
                }
                ReassembleResult::Complete(Bytes::copy_from_slice(data))
            }
            _ => {
                if data.len() > declared {
                    warn!("start segment carries {} bytes of an SDU of declared length {}", data.len(), declared);
                    return ReassembleResult::Fatal(ChannelError::SduLengthMismatch { declared, received: data.len() });
                }
                let mut buf = BytesMut::with_capacity(declared);
                buf.put_slice(data);
                trace!("started reassembly of SDU with {} bytes, received {}", declared, buf.len());
                self.in_progress = Some((declared, buf));
                ReassembleResult::InProgress
            }
        }
    }

    fn on_subsequent_segment(&mut self, payload: &[u8], sar: SarType) -> ReassembleResult {
        let (declared, mut buf) = match self.in_progress.take() {
            Some(x) => x,
            None => {
                if self.resync {
                    trace!("dropping {:?} segment while waiting for the start of the next SDU", sar);
                    return ReassembleResult::Skipped;
                }
                warn!("{:?} segment without a preceding start segment", sar);
                return ReassembleResult::Fatal(ChannelError::SduLengthMismatch { declared: 0, received: payload.len() });
            }
        };

        let received = buf.len() + payload.len();
        if received > declared {
            warn!("SDU exceeds its declared length of {} bytes", declared);
            return ReassembleResult::Fatal(ChannelError::SduLengthMismatch { declared, received });
        }
        buf.put_slice(payload);

        if sar == SarType::Continue {
            trace!("reassembly in progress: {} of {} bytes", received, declared);
            self.in_progress = Some((declared, buf));
            return ReassembleResult::InProgress;
        }

        if received < declared {
            warn!("SDU ended after {} bytes, declared length is {}", received, declared);
            return ReassembleResult::Fatal(ChannelError::SduLengthMismatch { declared, received });
        }
        ReassembleResult::Complete(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sdu(len: usize) -> Bytes {
        (0..len).map(|n| (n * 7 % 251) as u8).collect::<Vec<_>>().into()
    }

    #[rstest]
    #[case::empty(0, 10, vec![(SarType::Unsegmented, 2)])]
    #[case::fits_exactly(8, 10, vec![(SarType::Unsegmented, 10)])]
    #[case::one_too_many(9, 10, vec![(SarType::Start, 10), (SarType::End, 1)])]
    #[case::three(25, 10, vec![(SarType::Start, 10), (SarType::Continue, 10), (SarType::End, 7)])]
    #[case::end_fills_mps(18, 10, vec![(SarType::Start, 10), (SarType::End, 10)])]
    fn test_segmenter(#[case] sdu_len: usize, #[case] mps: u16, #[case] expected: Vec<(SarType, usize)>) {
        let segments = Segmenter::new(sdu(sdu_len), mps).collect::<Vec<_>>();

        let actual = segments.iter()
            .map(|s| (s.sar, s.payload.len()))
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);

        assert_eq!(&segments[0].payload[..2], &(sdu_len as u16).to_le_bytes());
        assert!(segments.last().unwrap().is_last);
        assert!(segments[..segments.len()-1].iter().all(|s| !s.is_last));
    }

    #[test]
    fn test_round_trip_at_all_sar_boundaries() {
        let mps = 20usize;
        let mut sizes = vec![1];
        for k in 1..=10 {
            sizes.extend([k*mps - 1, k*mps, k*mps + 1]);
        }

        for size in sizes {
            let original = sdu(size);
            let mut reassembler = Reassembler::new(u16::MAX);

            let mut result = None;
            for segment in Segmenter::new(original.clone(), mps as u16) {
                assert!(segment.payload.len() <= mps);
                match reassembler.reassemble(&segment.payload, segment.sar) {
                    ReassembleResult::InProgress => assert!(!segment.is_last),
                    ReassembleResult::Complete(sdu) => {
                        assert!(segment.is_last);
                        result = Some(sdu);
                    }
                    other => panic!("unexpected reassembly result {:?} for SDU size {}", other, size),
                }
            }
            assert_eq!(result, Some(original), "SDU size {}", size);
            assert!(reassembler.is_idle());
        }
    }

    #[test]
    fn test_declared_length_exceeds_mtu() {
        let mut reassembler = Reassembler::new(48);
        match reassembler.reassemble(&[49, 0, 1, 2], SarType::Start) {
            ReassembleResult::Fatal(ChannelError::SduLengthMismatch { declared: 49, .. }) => {}
            other => panic!("{:?}", other),
        }
    }

    #[rstest]
    #[case::unsegmented_too_long(vec![(vec![2, 0, 1, 2, 3], SarType::Unsegmented)])]
    #[case::unsegmented_too_short(vec![(vec![4, 0, 1, 2, 3], SarType::Unsegmented)])]
    #[case::start_without_prefix(vec![(vec![4], SarType::Start)])]
    #[case::start_too_long(vec![(vec![1, 0, 1, 2], SarType::Start)])]
    #[case::continue_exceeds(vec![(vec![4, 0, 1, 2], SarType::Start), (vec![3, 4, 5], SarType::Continue)])]
    #[case::end_exceeds(vec![(vec![4, 0, 1, 2], SarType::Start), (vec![3, 4, 5], SarType::End)])]
    #[case::end_short(vec![(vec![4, 0, 1, 2], SarType::Start), (vec![3], SarType::End)])]
    #[case::continue_without_start(vec![(vec![1, 2], SarType::Continue)])]
    #[case::end_without_start(vec![(vec![1, 2], SarType::End)])]
    fn test_fatal_length_mismatch(#[case] segments: Vec<(Vec<u8>, SarType)>) {
        let mut reassembler = Reassembler::new(100);
        let (last, init) = segments.split_last().unwrap();
        for (payload, sar) in init {
            assert_eq!(reassembler.reassemble(payload, *sar), ReassembleResult::InProgress);
        }
        match reassembler.reassemble(&last.0, last.1) {
            ReassembleResult::Fatal(ChannelError::SduLengthMismatch { .. }) => {}
            other => panic!("{:?}", other),
        }
        assert!(reassembler.is_idle());
    }

    #[test]
    fn test_start_resets_partial_sdu() {
        let mut reassembler = Reassembler::new(100);
        assert_eq!(reassembler.reassemble(&[4, 0, 1, 2], SarType::Start), ReassembleResult::InProgress);
        assert_eq!(reassembler.progress(), Some((4, 2)));

        assert_eq!(reassembler.reassemble(&[3, 0, 7, 8, 9], SarType::Unsegmented), ReassembleResult::Complete(Bytes::from_static(&[7, 8, 9])));
        assert!(reassembler.is_idle());
    }

    #[test]
    fn test_resync_skips_until_start() {
        let mut reassembler = Reassembler::new(100);
        assert_eq!(reassembler.reassemble(&[6, 0, 1, 2], SarType::Start), ReassembleResult::InProgress);
        reassembler.abort_partial();

        assert_eq!(reassembler.reassemble(&[5, 6], SarType::End), ReassembleResult::Skipped);
        assert_eq!(reassembler.reassemble(&[2, 0, 1], SarType::Start), ReassembleResult::InProgress);
        assert_eq!(reassembler.reassemble(&[2], SarType::End), ReassembleResult::Complete(Bytes::from_static(&[1, 2])));
    }
}
