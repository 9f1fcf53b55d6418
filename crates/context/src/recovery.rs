// Recovery and hydration.
//
// On cold start or page-cache restoration the context cannot trust its local
// view: the store record is read directly and checksum-verified (a mismatch
// forces a coordinator resync rather than trusting a possibly-truncated
// read), session-only windows are dropped after a resume, and if no store
// notification arrives within a bounded window a capped fallback poll runs.
// Operations that need consistent state queue behind the hydration gate until
// completion or a safety timeout, whichever comes first.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use quicktab_common::protocol::port::SyncReason;
use quicktab_common::record::BoardRecord;
use quicktab_common::types::QuickWindow;
use quicktab_common::window_id::WindowId;
use tracing::{info, warn};

use crate::create::PendingCreate;

/// What a direct store read yielded.
#[derive(Debug, PartialEq)]
pub enum HydrationOutcome {
    /// Verified state to swap in.
    Replace { windows: Vec<QuickWindow>, revision: u64, sequence_id: u64 },
    /// The record cannot be trusted; ask the coordinator instead.
    NeedsResync { reason: SyncReason },
    /// The store has never been written; an empty board is valid state.
    Empty,
}

/// Verify and filter a raw store read.
///
/// `resumed` marks restoration from a suspended/frozen page: session-only
/// windows are not expected to survive it and are dropped before the replace.
pub fn evaluate_record(record: Option<&BoardRecord>, resumed: bool) -> HydrationOutcome {
    let Some(record) = record else {
        return HydrationOutcome::Empty;
    };

    if let Err(mismatch) = record.verify_checksum() {
        warn!(%mismatch, "hydration read failed checksum verification");
        return HydrationOutcome::NeedsResync { reason: SyncReason::ChecksumMismatch };
    }

    let mut windows = record.windows.clone();
    if resumed {
        let before = windows.len();
        windows.retain(|w| !w.session_only);
        let dropped = before - windows.len();
        if dropped > 0 {
            info!(dropped, "filtered session-only windows after resume");
        }
    }

    HydrationOutcome::Replace {
        windows,
        revision: record.revision,
        sequence_id: record.sequence_id,
    }
}

// ── Supervisor ──────────────────────────────────────────────────────

/// An operation parked behind the hydration gate.
#[derive(Debug)]
pub enum DeferredOp {
    Create(PendingCreate),
    /// Restore (un-minimize) a window once state is consistent.
    Restore { window_id: WindowId },
}

/// What the runtime should do this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollAction {
    /// Nothing due.
    Wait,
    /// Read the store directly now.
    Poll,
    /// Poll budget exhausted; request a full resync from the coordinator.
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Subscribed; waiting for the first change notification.
    Waiting,
    /// Notification window elapsed; polling the store directly.
    Polling,
    Complete,
}

pub struct HydrationSupervisor {
    phase: Phase,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    polls: u32,
    next_poll_at: Option<DateTime<Utc>>,

    wait_window: Duration,
    poll_retries: u32,
    poll_delay: Duration,
    safety_timeout: Duration,

    deferred: VecDeque<DeferredOp>,
}

impl HydrationSupervisor {
    pub fn new(
        wait_window: Duration,
        poll_retries: u32,
        poll_delay: Duration,
        safety_timeout: Duration,
    ) -> Self {
        Self {
            phase: Phase::Idle,
            started_at: None,
            completed_at: None,
            polls: 0,
            next_poll_at: None,
            wait_window,
            poll_retries,
            poll_delay,
            safety_timeout,
            deferred: VecDeque::new(),
        }
    }

    /// Start (or restart, on resume) hydration.
    pub fn begin(&mut self, now: DateTime<Utc>) {
        self.phase = Phase::Waiting;
        self.started_at = Some(now);
        self.completed_at = None;
        self.polls = 0;
        self.next_poll_at = None;
    }

    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }

    /// A consistent state has been applied (via notification, poll, or
    /// coordinator snapshot).
    pub fn mark_complete(&mut self, now: DateTime<Utc>) {
        if self.phase != Phase::Complete {
            info!("hydration complete");
        }
        self.phase = Phase::Complete;
        self.completed_at = Some(now);
    }

    /// Drive the notification-wait and fallback-poll timers.
    pub fn poll_at(&mut self, now: DateTime<Utc>) -> PollAction {
        match self.phase {
            Phase::Idle | Phase::Complete => PollAction::Wait,

            Phase::Waiting => {
                let waited = self
                    .started_at
                    .map(|t| (now - t).to_std().unwrap_or_default())
                    .unwrap_or_default();
                if waited >= self.wait_window {
                    warn!(
                        waited_ms = waited.as_millis() as u64,
                        "no store notification within the wait window; falling back to polling"
                    );
                    self.phase = Phase::Polling;
                    self.polls = 1;
                    self.next_poll_at =
                        Some(now + chrono::Duration::from_std(self.poll_delay).unwrap_or_default());
                    PollAction::Poll
                } else {
                    PollAction::Wait
                }
            }

            Phase::Polling => {
                let due = self.next_poll_at.is_none_or(|at| now >= at);
                if !due {
                    return PollAction::Wait;
                }
                if self.polls >= self.poll_retries {
                    warn!(polls = self.polls, "hydration poll budget exhausted");
                    return PollAction::GiveUp;
                }
                self.polls += 1;
                self.next_poll_at =
                    Some(now + chrono::Duration::from_std(self.poll_delay).unwrap_or_default());
                PollAction::Poll
            }
        }
    }

    // ── Operation gating ────────────────────────────────────────────

    /// Whether operations that need consistent state may run now: hydration
    /// finished, or its safety timeout elapsed.
    pub fn gate_open_at(&self, now: DateTime<Utc>) -> bool {
        if self.phase == Phase::Complete {
            return true;
        }
        match self.started_at {
            Some(started) => {
                (now - started).to_std().unwrap_or_default() >= self.safety_timeout
            }
            // Hydration never began; do not hold operations hostage.
            None => true,
        }
    }

    /// Park an operation until the gate opens.
    pub fn defer(&mut self, op: DeferredOp) {
        self.deferred.push_back(op);
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Drain parked operations once the gate is open; empty otherwise.
    pub fn take_ready_at(&mut self, now: DateTime<Utc>) -> Vec<DeferredOp> {
        if !self.gate_open_at(now) {
            return Vec::new();
        }
        if !self.deferred.is_empty() && self.phase != Phase::Complete {
            warn!(
                count = self.deferred.len(),
                "hydration safety timeout elapsed; releasing deferred operations"
            );
        }
        self.deferred.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quicktab_common::record::compute_checksum;
    use quicktab_common::types::{PinTarget, VisibilitySet, WindowPosition, WindowSize};

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp")
    }

    fn window(counter: u64, session_only: bool) -> QuickWindow {
        QuickWindow {
            id: WindowId::new(5, counter, "ab".to_string()),
            url: "https://example.com".to_string(),
            title: "w".to_string(),
            position: WindowPosition { x: 0.0, y: 0.0 },
            size: WindowSize { width: 100.0, height: 100.0 },
            owner_context_id: Some(5),
            minimized: false,
            pin_target: PinTarget::Screen,
            scope: None,
            session_only,
            visibility: VisibilitySet::default(),
        }
    }

    fn record(windows: Vec<QuickWindow>) -> BoardRecord {
        BoardRecord {
            checksum: compute_checksum(&windows),
            windows,
            revision: 6,
            sequence_id: 60,
            timestamp_ms: t0().timestamp_millis(),
            save_id: "save-6".to_string(),
            writing_context_id: Some(2),
            writing_instance_id: Some("inst-2".to_string()),
            transaction_id: Some("txn-6".to_string()),
        }
    }

    fn supervisor() -> HydrationSupervisor {
        HydrationSupervisor::new(
            Duration::from_secs(3),
            5,
            Duration::from_millis(400),
            Duration::from_secs(10),
        )
    }

    // ── Record evaluation ───────────────────────────────────────────

    #[test]
    fn missing_record_hydrates_empty() {
        assert_eq!(evaluate_record(None, false), HydrationOutcome::Empty);
    }

    #[test]
    fn verified_record_replaces_state() {
        let rec = record(vec![window(1, false), window(2, false)]);
        match evaluate_record(Some(&rec), false) {
            HydrationOutcome::Replace { windows, revision, sequence_id } => {
                assert_eq!(windows.len(), 2);
                assert_eq!(revision, 6);
                assert_eq!(sequence_id, 60);
            }
            other => panic!("expected replace, got {other:?}"),
        }
    }

    #[test]
    fn checksum_mismatch_always_forces_resync() {
        let mut rec = record(vec![window(1, false), window(2, false)]);
        // Simulate a truncated read.
        rec.windows.pop();

        assert_eq!(
            evaluate_record(Some(&rec), false),
            HydrationOutcome::NeedsResync { reason: SyncReason::ChecksumMismatch }
        );
        // Resumed or not, divergent state is never silently accepted.
        assert_eq!(
            evaluate_record(Some(&rec), true),
            HydrationOutcome::NeedsResync { reason: SyncReason::ChecksumMismatch }
        );
    }

    #[test]
    fn resume_filters_session_only_windows() {
        let rec = record(vec![window(1, false), window(2, true)]);
        match evaluate_record(Some(&rec), true) {
            HydrationOutcome::Replace { windows, .. } => {
                assert_eq!(windows.len(), 1);
                assert_eq!(windows[0].id.counter(), 1);
            }
            other => panic!("expected replace, got {other:?}"),
        }
    }

    #[test]
    fn cold_start_keeps_session_only_windows() {
        let rec = record(vec![window(1, false), window(2, true)]);
        match evaluate_record(Some(&rec), false) {
            HydrationOutcome::Replace { windows, .. } => assert_eq!(windows.len(), 2),
            other => panic!("expected replace, got {other:?}"),
        }
    }

    // ── Poll scheduling ─────────────────────────────────────────────

    #[test]
    fn waits_for_notification_before_polling() {
        let mut sup = supervisor();
        sup.begin(t0());

        assert_eq!(sup.poll_at(t0() + chrono::Duration::seconds(1)), PollAction::Wait);
        assert_eq!(sup.poll_at(t0() + chrono::Duration::seconds(3)), PollAction::Poll);
    }

    #[test]
    fn polls_are_spaced_and_capped() {
        let mut sup = supervisor();
        sup.begin(t0());
        let mut now = t0() + chrono::Duration::seconds(3);

        // First poll fires on entering the polling phase.
        assert_eq!(sup.poll_at(now), PollAction::Poll);
        // Too soon for the next.
        now += chrono::Duration::milliseconds(100);
        assert_eq!(sup.poll_at(now), PollAction::Wait);

        // Remaining budget: retries - 1 more polls.
        for _ in 1..5 {
            now += chrono::Duration::milliseconds(400);
            assert_eq!(sup.poll_at(now), PollAction::Poll);
        }

        now += chrono::Duration::milliseconds(400);
        assert_eq!(sup.poll_at(now), PollAction::GiveUp);
    }

    #[test]
    fn completion_stops_the_timers() {
        let mut sup = supervisor();
        sup.begin(t0());
        sup.mark_complete(t0() + chrono::Duration::seconds(1));

        assert!(sup.is_complete());
        assert_eq!(sup.poll_at(t0() + chrono::Duration::seconds(10)), PollAction::Wait);
    }

    // ── Gating ──────────────────────────────────────────────────────

    #[test]
    fn gate_holds_operations_until_complete() {
        let mut sup = supervisor();
        sup.begin(t0());
        sup.defer(DeferredOp::Restore { window_id: "qt-5-1-ab".parse().unwrap() });

        let during = t0() + chrono::Duration::seconds(2);
        assert!(!sup.gate_open_at(during));
        assert!(sup.take_ready_at(during).is_empty());
        assert_eq!(sup.deferred_len(), 1);

        sup.mark_complete(during);
        let released = sup.take_ready_at(during);
        assert_eq!(released.len(), 1);
        assert!(matches!(released[0], DeferredOp::Restore { .. }));
    }

    #[test]
    fn safety_timeout_releases_deferred_operations() {
        let mut sup = supervisor();
        sup.begin(t0());
        sup.defer(DeferredOp::Restore { window_id: "qt-5-1-ab".parse().unwrap() });

        let past_timeout = t0() + chrono::Duration::seconds(10);
        assert!(sup.gate_open_at(past_timeout));
        assert_eq!(sup.take_ready_at(past_timeout).len(), 1);
    }
}
