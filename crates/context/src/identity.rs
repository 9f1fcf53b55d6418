// Identity acquisition.
//
// A context cannot attribute or own writes until the coordinator assigns it
// a context id. Acquisition walks a fixed short backoff schedule, then (for
// retryable failures) drops into a low-frequency loop bounded by an overall
// deadline. Absence of an identity is a first-class outcome: the engine keeps
// running in degraded mode with ownership explicitly unset.
//
// The machine is clock-injected: the runtime calls `poll_at` on its tick and
// sends an `acquire_context_id` request whenever `SendRequest` comes back.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::retry::{FailureClass, FixedSchedule};

/// What the runtime should do after a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityAction {
    /// Send an acquisition request now.
    SendRequest,
    /// Nothing to do until a later poll.
    Idle,
    /// The overall budget is exhausted; proceed unowned.
    Degrade,
}

/// Terminal result of acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityOutcome {
    Acquired(u32),
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Idle,
    /// Next attempt is scheduled.
    Waiting { attempt: u32, at: DateTime<Utc> },
    /// A request is in flight.
    Awaiting { attempt: u32, sent_at: DateTime<Utc> },
    Done(u32),
    Degraded,
}

pub struct IdentityAcquirer {
    schedule: FixedSchedule,
    extended_interval: Duration,
    overall_timeout: Duration,
    request_timeout: Duration,
    deadline: Option<DateTime<Utc>>,
    state: State,
}

impl IdentityAcquirer {
    pub fn new(
        schedule: FixedSchedule,
        extended_interval: Duration,
        overall_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            schedule,
            extended_interval,
            overall_timeout,
            request_timeout,
            deadline: None,
            state: State::Idle,
        }
    }

    /// Start acquisition. The first request goes out immediately.
    pub fn begin(&mut self, now: DateTime<Utc>) -> IdentityAction {
        self.deadline = now
            .checked_add_signed(
                chrono::Duration::from_std(self.overall_timeout).unwrap_or_default(),
            )
            .or(Some(now));
        self.state = State::Awaiting { attempt: 0, sent_at: now };
        IdentityAction::SendRequest
    }

    /// Drive timeouts and scheduled sends.
    pub fn poll_at(&mut self, now: DateTime<Utc>) -> IdentityAction {
        match self.state.clone() {
            State::Idle | State::Done(_) | State::Degraded => IdentityAction::Idle,

            State::Waiting { attempt, at } => {
                if self.past_deadline(now) {
                    return self.degrade("overall acquisition timeout");
                }
                if now >= at {
                    self.state = State::Awaiting { attempt, sent_at: now };
                    IdentityAction::SendRequest
                } else {
                    IdentityAction::Idle
                }
            }

            State::Awaiting { attempt, sent_at } => {
                let elapsed = (now - sent_at).to_std().unwrap_or_default();
                if elapsed >= self.request_timeout {
                    self.schedule_next(attempt, FailureClass::Retryable, now)
                } else {
                    IdentityAction::Idle
                }
            }
        }
    }

    /// The coordinator assigned an identity.
    pub fn on_assigned(&mut self, context_id: u32) {
        info!(context_id, "context identity acquired");
        self.state = State::Done(context_id);
    }

    /// The request failed with a classified error.
    pub fn on_failure(&mut self, class: FailureClass, now: DateTime<Utc>) -> IdentityAction {
        match self.state.clone() {
            State::Awaiting { attempt, .. } => self.schedule_next(attempt, class, now),
            // A failure while not awaiting (late reply) changes nothing.
            _ => IdentityAction::Idle,
        }
    }

    /// The channel just completed its handshake; a previously slow-starting
    /// coordinator is probably ready, so skip the remaining wait.
    pub fn on_channel_ready(&mut self, now: DateTime<Utc>) -> IdentityAction {
        match self.state {
            State::Waiting { attempt, .. } => {
                if self.past_deadline(now) {
                    return self.degrade("overall acquisition timeout");
                }
                self.state = State::Awaiting { attempt, sent_at: now };
                IdentityAction::SendRequest
            }
            _ => IdentityAction::Idle,
        }
    }

    pub fn outcome(&self) -> Option<IdentityOutcome> {
        match self.state {
            State::Done(context_id) => Some(IdentityOutcome::Acquired(context_id)),
            State::Degraded => Some(IdentityOutcome::Degraded),
            _ => None,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.outcome().is_some()
    }

    fn schedule_next(
        &mut self,
        attempt: u32,
        class: FailureClass,
        now: DateTime<Utc>,
    ) -> IdentityAction {
        if class == FailureClass::Terminal {
            return self.degrade("non-retryable acquisition failure");
        }
        if self.past_deadline(now) {
            return self.degrade("overall acquisition timeout");
        }

        // The just-failed attempt indexes the schedule; past its end the
        // low-frequency loop takes over until the deadline.
        let delay = self.schedule.delay_for_attempt(attempt).unwrap_or(self.extended_interval);
        let at = now + chrono::Duration::from_std(delay).unwrap_or_default();
        self.state = State::Waiting { attempt: attempt + 1, at };
        IdentityAction::Idle
    }

    fn degrade(&mut self, reason: &str) -> IdentityAction {
        warn!(reason, "identity acquisition degraded; writes will be unowned");
        self.state = State::Degraded;
        IdentityAction::Degrade
    }

    fn past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acquirer() -> IdentityAcquirer {
        IdentityAcquirer::new(
            FixedSchedule::new(vec![
                Duration::from_millis(250),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
            ]),
            Duration::from_secs(5),
            Duration::from_secs(45),
            Duration::from_secs(5),
        )
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp")
    }

    #[test]
    fn begin_sends_immediately() {
        let mut acq = acquirer();
        assert_eq!(acq.begin(t0()), IdentityAction::SendRequest);
        assert!(!acq.is_settled());
    }

    #[test]
    fn assignment_settles_with_the_context_id() {
        let mut acq = acquirer();
        acq.begin(t0());
        acq.on_assigned(7);
        assert_eq!(acq.outcome(), Some(IdentityOutcome::Acquired(7)));
        // Later polls are inert.
        assert_eq!(acq.poll_at(t0() + chrono::Duration::seconds(60)), IdentityAction::Idle);
    }

    #[test]
    fn retryable_failure_walks_the_fixed_schedule() {
        let mut acq = acquirer();
        let now = t0();
        acq.begin(now);

        // First failure: the retry waits schedule[0] = 250ms.
        acq.on_failure(FailureClass::Retryable, now);
        assert_eq!(acq.poll_at(now + chrono::Duration::milliseconds(100)), IdentityAction::Idle);
        assert_eq!(
            acq.poll_at(now + chrono::Duration::milliseconds(250)),
            IdentityAction::SendRequest
        );
    }

    #[test]
    fn terminal_failure_degrades_immediately() {
        let mut acq = acquirer();
        acq.begin(t0());
        assert_eq!(acq.on_failure(FailureClass::Terminal, t0()), IdentityAction::Degrade);
        assert_eq!(acq.outcome(), Some(IdentityOutcome::Degraded));
    }

    #[test]
    fn request_timeout_counts_as_retryable_failure() {
        let mut acq = acquirer();
        let now = t0();
        acq.begin(now);

        // No reply within the request timeout: next attempt gets scheduled.
        let later = now + chrono::Duration::seconds(6);
        assert_eq!(acq.poll_at(later), IdentityAction::Idle);
        // schedule[0] = 250ms after the timeout fired.
        assert_eq!(
            acq.poll_at(later + chrono::Duration::milliseconds(250)),
            IdentityAction::SendRequest
        );
    }

    #[test]
    fn exhausted_schedule_enters_low_frequency_loop() {
        let mut acq = acquirer();
        let mut now = t0();
        acq.begin(now);

        // Burn through the whole fixed schedule.
        for _ in 0..4 {
            acq.on_failure(FailureClass::Retryable, now);
            now += chrono::Duration::seconds(6);
            assert_eq!(acq.poll_at(now), IdentityAction::SendRequest);
        }

        // Now in the extended loop: retries every extended_interval.
        acq.on_failure(FailureClass::Retryable, now);
        assert_eq!(acq.poll_at(now + chrono::Duration::seconds(4)), IdentityAction::Idle);
        assert_eq!(acq.poll_at(now + chrono::Duration::seconds(5)), IdentityAction::SendRequest);
    }

    #[test]
    fn overall_deadline_degrades() {
        let mut acq = acquirer();
        let now = t0();
        acq.begin(now);
        acq.on_failure(FailureClass::Retryable, now);

        let past_deadline = now + chrono::Duration::seconds(46);
        assert_eq!(acq.poll_at(past_deadline), IdentityAction::Degrade);
        assert_eq!(acq.outcome(), Some(IdentityOutcome::Degraded));
    }

    #[test]
    fn channel_ready_short_circuits_a_scheduled_wait() {
        let mut acq = acquirer();
        let now = t0();
        acq.begin(now);
        acq.on_failure(FailureClass::Retryable, now);

        // Would normally wait 250ms; readiness skips the wait.
        assert_eq!(
            acq.on_channel_ready(now + chrono::Duration::milliseconds(100)),
            IdentityAction::SendRequest
        );
    }

    #[test]
    fn channel_ready_is_inert_while_awaiting_or_settled() {
        let mut acq = acquirer();
        let now = t0();
        acq.begin(now);
        assert_eq!(acq.on_channel_ready(now), IdentityAction::Idle);

        acq.on_assigned(3);
        assert_eq!(acq.on_channel_ready(now), IdentityAction::Idle);
    }
}
