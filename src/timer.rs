use std::time::Duration;
use tracing::{debug, trace};
use crate::config::ChannelConfig;
use crate::error::ChannelError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerKind {
    Retransmission,
    Monitor,
}

/// At most one of the two timers is armed at any time
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerState {
    Idle,
    RetransmissionArmed,
    MonitorArmed,
}

impl TimerState {
    fn kind(&self) -> Option<TimerKind> {
        match self {
            TimerState::Idle => None,
            TimerState::RetransmissionArmed => Some(TimerKind::Retransmission),
            TimerState::MonitorArmed => Some(TimerKind::Monitor),
        }
    }

    fn armed(kind: TimerKind) -> TimerState {
        match kind {
            TimerKind::Retransmission => TimerState::RetransmissionArmed,
            TimerKind::Monitor => TimerState::MonitorArmed,
        }
    }
}

/// Identifies one arming of a timer. Expiry events carry the token they were armed with, and
///  an expiry with any token other than the current one was overtaken by a cancel or re-arm
///  and is ignored.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TimerToken(u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimerStart {
    pub kind: TimerKind,
    pub after: Duration,
    pub token: TimerToken,
}

/// What the scheduler must do to get from the previous timer state to the new one
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TimerTransition {
    pub cancel: Option<TimerToken>,
    pub start: Option<TimerStart>,
}

impl TimerTransition {
    pub fn is_empty(&self) -> bool {
        self.cancel.is_none() && self.start.is_none()
    }
}


/// Owns the retransmission and monitor timer of a channel. The supervisor does not run timers
///  itself: it decides which timer should be armed and hands out [TimerTransition]s for a
///  scheduler to execute, and it validates expiry events against the currently armed timer.
pub struct TimerSupervisor {
    retransmission_timeout: Duration,
    monitor_timeout: Duration,
    max_transmit: u8,

    state: TimerState,
    token: TimerToken,
    next_token: u64,

    /// number of polls sent without receiving the final response
    retry_count: u8,
}

impl TimerSupervisor {
    pub fn new(config: &ChannelConfig) -> TimerSupervisor {
        TimerSupervisor {
            retransmission_timeout: config.retransmission_timeout,
            monitor_timeout: config.monitor_timeout,
            max_transmit: config.max_transmit,
            state: TimerState::Idle,
            token: TimerToken(0),
            next_token: 1,
            retry_count: 0,
        }
    }

    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    /// the currently armed timer with its token
    pub fn armed(&self) -> Option<(TimerKind, TimerToken)> {
        self.state.kind()
            .map(|kind| (kind, self.token))
    }

    /// Moves to `desired`. If that timer is already armed, it keeps running unless `restart`
    ///  is set, in which case it is cancelled and armed anew.
    pub fn reevaluate(&mut self, desired: TimerState, restart: bool) -> TimerTransition {
        if desired == self.state && !(restart && desired != TimerState::Idle) {
            return TimerTransition::default();
        }

        let cancel = self.state.kind().map(|_| self.token);

        let start = desired.kind().map(|kind| {
            let token = TimerToken(self.next_token);
            self.next_token += 1;
            self.token = token;
            let after = match kind {
                TimerKind::Retransmission => self.retransmission_timeout,
                TimerKind::Monitor => self.monitor_timeout,
            };
            TimerStart { kind, after, token }
        });

        debug!("timer transition {:?} -> {:?}", self.state, desired);
        self.state = desired;
        TimerTransition { cancel, start }
    }

    /// Cancels whatever timer is armed
    pub fn cancel(&mut self) -> Option<TimerToken> {
        self.reevaluate(TimerState::Idle, false).cancel
    }

    /// Checks an expiry event against the armed timer. Returns `false` for stale expiries,
    ///  otherwise the timer counts as no longer armed.
    pub fn on_expired(&mut self, kind: TimerKind, token: TimerToken) -> bool {
        if self.state.kind() != Some(kind) || self.token != token {
            trace!("ignoring stale {:?} timer expiry {:?}", kind, token);
            return false;
        }
        debug!("{:?} timer expired", kind);
        self.state = TimerState::Idle;
        true
    }

    /// The retransmission timer expired without an acknowledgement: the channel polls its peer,
    ///  and the monitor timer supervises the poll
    pub fn on_retransmission_expire(&mut self) -> TimerTransition {
        self.start_poll()
    }

    /// A poll was sent: the monitor timer runs until the final response arrives
    pub fn start_poll(&mut self) -> TimerTransition {
        self.retry_count = 1;
        self.reevaluate(TimerState::MonitorArmed, true)
    }

    /// The monitor timer expired without the final response to a poll: poll again, or give
    ///  up if the poll was already sent `max_transmit` times
    pub fn on_monitor_expire(&mut self) -> Result<TimerTransition, ChannelError> {
        self.retry_count = self.retry_count.saturating_add(1);
        if self.max_transmit != 0 && self.retry_count > self.max_transmit {
            debug!("poll retry limit exceeded after {} polls", self.max_transmit);
            return Err(ChannelError::RetryExhausted { max_transmit: self.max_transmit });
        }
        Ok(self.reevaluate(TimerState::MonitorArmed, true))
    }

    pub fn on_final_received(&mut self) {
        self.retry_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn supervisor(max_transmit: u8) -> TimerSupervisor {
        let mut config = ChannelConfig::default_ertm(0x40, 0x41)
            .with_timeouts_ms(100, 500);
        config.max_transmit = max_transmit;
        TimerSupervisor::new(&config)
    }

    #[test]
    fn test_arm_and_keep_running() {
        let mut timers = supervisor(3);

        let t = timers.reevaluate(TimerState::RetransmissionArmed, false);
        assert_eq!(t.cancel, None);
        let start = t.start.unwrap();
        assert_eq!(start.kind, TimerKind::Retransmission);
        assert_eq!(start.after, Duration::from_millis(100));
        assert_eq!(timers.armed(), Some((TimerKind::Retransmission, start.token)));

        assert!(timers.reevaluate(TimerState::RetransmissionArmed, false).is_empty());
    }

    #[test]
    fn test_restart_replaces_token() {
        let mut timers = supervisor(3);
        let first = timers.reevaluate(TimerState::RetransmissionArmed, false).start.unwrap().token;

        let t = timers.reevaluate(TimerState::RetransmissionArmed, true);
        assert_eq!(t.cancel, Some(first));
        let second = t.start.unwrap().token;
        assert_ne!(first, second);

        assert!(!timers.on_expired(TimerKind::Retransmission, first));
        assert!(timers.on_expired(TimerKind::Retransmission, second));
        assert_eq!(timers.state(), TimerState::Idle);
    }

    #[test]
    fn test_restart_idle_is_noop() {
        let mut timers = supervisor(3);
        assert!(timers.reevaluate(TimerState::Idle, true).is_empty());
    }

    #[rstest]
    #[case::retransmission_to_monitor(TimerState::RetransmissionArmed, TimerState::MonitorArmed)]
    #[case::monitor_to_retransmission(TimerState::MonitorArmed, TimerState::RetransmissionArmed)]
    fn test_switching_cancels_previous(#[case] from: TimerState, #[case] to: TimerState) {
        let mut timers = supervisor(3);
        let old = timers.reevaluate(from, false).start.unwrap().token;

        let t = timers.reevaluate(to, false);
        assert_eq!(t.cancel, Some(old));
        assert_eq!(t.start.unwrap().kind, to.kind().unwrap());
        assert_eq!(timers.state(), to);
    }

    #[test]
    fn test_expiry_of_wrong_kind_is_stale() {
        let mut timers = supervisor(3);
        let token = timers.reevaluate(TimerState::MonitorArmed, false).start.unwrap().token;
        assert!(!timers.on_expired(TimerKind::Retransmission, token));
        assert_eq!(timers.state(), TimerState::MonitorArmed);
    }

    #[test]
    fn test_cancel() {
        let mut timers = supervisor(3);
        let token = timers.reevaluate(TimerState::RetransmissionArmed, false).start.unwrap().token;
        assert_eq!(timers.cancel(), Some(token));
        assert_eq!(timers.cancel(), None);
        assert!(!timers.on_expired(TimerKind::Retransmission, token));
    }

    #[rstest]
    #[case::limited(3, Some(4))]
    #[case::single(1, Some(2))]
    #[case::unlimited(0, None)]
    fn test_poll_retries(#[case] max_transmit: u8, #[case] exhausted_at: Option<u8>) {
        let mut timers = supervisor(max_transmit);
        timers.reevaluate(TimerState::RetransmissionArmed, false);

        let t = timers.on_retransmission_expire();
        assert_eq!(t.start.unwrap().kind, TimerKind::Monitor);
        assert_eq!(t.start.unwrap().after, Duration::from_millis(500));
        assert_eq!(timers.retry_count(), 1);

        for _ in 0..20 {
            match timers.on_monitor_expire() {
                Ok(t) => {
                    assert_eq!(t.start.unwrap().kind, TimerKind::Monitor);
                    assert_eq!(timers.state(), TimerState::MonitorArmed);
                }
                Err(e) => {
                    assert_eq!(e, ChannelError::RetryExhausted { max_transmit });
                    assert_eq!(Some(timers.retry_count()), exhausted_at);
                    return;
                }
            }
        }
        assert_eq!(exhausted_at, None);
    }

    #[test]
    fn test_final_resets_retry_count() {
        let mut timers = supervisor(2);
        timers.start_poll();
        timers.on_monitor_expire().unwrap();
        assert_eq!(timers.retry_count(), 2);

        timers.on_final_received();
        assert_eq!(timers.retry_count(), 0);
    }
}
