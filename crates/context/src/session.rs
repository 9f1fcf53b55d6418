// Per-context session state.
//
// One `Session` is constructed at startup and passed to every component;
// nothing in this crate keeps module-level state.

use std::collections::HashSet;
use std::time::Duration;

use quicktab_common::window_id::WindowId;
use uuid::Uuid;

/// Where the channel currently stands, mirrored here for quick reads by
/// components that should not depend on the channel module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    Offline,
    Connecting,
    Ready,
}

/// The per-context, in-memory session.
#[derive(Debug)]
pub struct Session {
    /// Unique per page load; never reused across reloads.
    instance_id: String,
    /// Acquired from the coordinator; `None` until acquisition succeeds, or
    /// permanently `None` in degraded mode.
    context_id: Option<u32>,
    connection: ConnectionHealth,
    /// Last-applied shared-store markers.
    last_revision: u64,
    last_sequence: u64,
    /// Window ids this context currently owns (renders live or minimized).
    owned: HashSet<WindowId>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            context_id: None,
            connection: ConnectionHealth::Offline,
            last_revision: 0,
            last_sequence: 0,
            owned: HashSet::new(),
        }
    }

    /// Construct with a fixed instance id, for tests.
    pub fn with_instance_id(instance_id: impl Into<String>) -> Self {
        Self { instance_id: instance_id.into(), ..Self::new() }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn context_id(&self) -> Option<u32> {
        self.context_id
    }

    pub fn set_context_id(&mut self, context_id: u32) {
        self.context_id = Some(context_id);
    }

    pub fn connection(&self) -> ConnectionHealth {
        self.connection
    }

    pub fn set_connection(&mut self, health: ConnectionHealth) {
        self.connection = health;
    }

    pub fn last_revision(&self) -> u64 {
        self.last_revision
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Advance the last-applied markers. Never moves backwards.
    pub fn advance_markers(&mut self, revision: u64, sequence_id: u64) {
        self.last_revision = self.last_revision.max(revision);
        self.last_sequence = self.last_sequence.max(sequence_id);
    }

    /// Reset markers to a snapshot's values (full resync).
    pub fn reset_markers(&mut self, revision: u64, sequence_id: u64) {
        self.last_revision = revision;
        self.last_sequence = sequence_id;
    }

    pub fn note_owned(&mut self, id: WindowId) {
        self.owned.insert(id);
    }

    pub fn note_disowned(&mut self, id: &WindowId) {
        self.owned.remove(id);
    }

    pub fn owns_locally(&self, id: &WindowId) -> bool {
        self.owned.contains(id)
    }

    pub fn owned_count(&self) -> usize {
        self.owned.len()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

// ── Round-trip tracking ─────────────────────────────────────────────

/// EWMA smoothing weight for new samples.
const RTT_ALPHA: f64 = 0.3;

/// Exponentially weighted estimate of the coordinator round-trip latency.
///
/// Feeds the adoption TTL and the sync engine's duplicate-tolerance window;
/// both clamp the scaled value to their own safe ranges, so this tracker only
/// clamps raw samples.
#[derive(Debug, Clone)]
pub struct RttTracker {
    estimate: Duration,
    samples: u64,
}

impl RttTracker {
    pub fn new(initial: Duration) -> Self {
        Self { estimate: initial, samples: 0 }
    }

    /// Fold in an observed round trip. The caller clamps the sample first
    /// (see `Tuning::clamp_rtt`).
    pub fn record(&mut self, sample: Duration) {
        if self.samples == 0 {
            self.estimate = sample;
        } else {
            let blended = self.estimate.as_secs_f64() * (1.0 - RTT_ALPHA)
                + sample.as_secs_f64() * RTT_ALPHA;
            self.estimate = Duration::from_secs_f64(blended);
        }
        self.samples += 1;
    }

    pub fn current(&self) -> Duration {
        self.estimate
    }

    pub fn sample_count(&self) -> u64 {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sessions_get_distinct_instance_ids() {
        let a = Session::new();
        let b = Session::new();
        assert_ne!(a.instance_id(), b.instance_id());
    }

    #[test]
    fn markers_never_move_backwards() {
        let mut session = Session::new();
        session.advance_markers(5, 40);
        session.advance_markers(3, 50);
        assert_eq!(session.last_revision(), 5);
        assert_eq!(session.last_sequence(), 50);
    }

    #[test]
    fn reset_markers_can_move_backwards() {
        let mut session = Session::new();
        session.advance_markers(5, 40);
        session.reset_markers(2, 10);
        assert_eq!(session.last_revision(), 2);
        assert_eq!(session.last_sequence(), 10);
    }

    #[test]
    fn owned_set_tracks_membership() {
        let mut session = Session::new();
        let id = WindowId::new(1, 1, "aa".to_string());
        session.note_owned(id.clone());
        assert!(session.owns_locally(&id));
        session.note_disowned(&id);
        assert!(!session.owns_locally(&id));
    }

    #[test]
    fn first_rtt_sample_replaces_the_initial_estimate() {
        let mut rtt = RttTracker::new(Duration::from_millis(500));
        rtt.record(Duration::from_millis(100));
        assert_eq!(rtt.current(), Duration::from_millis(100));
    }

    #[test]
    fn rtt_estimate_moves_toward_new_samples() {
        let mut rtt = RttTracker::new(Duration::from_millis(500));
        rtt.record(Duration::from_millis(100));
        rtt.record(Duration::from_millis(200));

        let current = rtt.current();
        assert!(current > Duration::from_millis(100));
        assert!(current < Duration::from_millis(200));
    }
}
