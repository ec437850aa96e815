/// Diagnostic counters of a single channel. Recoverable errors end up here and nowhere else.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub retransmissions: u64,

    pub malformed_frames: u64,
    pub fcs_errors: u64,
    pub duplicates: u64,
    /// frames skipped in modes without retransmission
    pub lost_frames: u64,
    /// acknowledgements for frames that were already given up on
    pub stale_acks: u64,

    pub rej_sent: u64,
    pub rej_received: u64,
    pub srej_received: u64,
    pub rnr_sent: u64,
    pub rnr_received: u64,
    pub polls_sent: u64,

    pub sdus_delivered: u64,
    pub sdus_completed: u64,
}
