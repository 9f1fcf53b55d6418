// State sync engine: ordering validation and self-write suppression.
//
// Every shared-store change notification lands here. The engine decides one
// of four things: this is our own write echoed back (bookkeeping only, never
// re-rendered), an acceptable newer state (forwarded as a full replace), a
// tolerable exact duplicate, or a stale/out-of-order record (rejected, the
// caller requests recovery).
//
// Self-write detection runs a priority chain of writer-attribution signals.
// The timestamp-window fallback at the bottom is best-effort by design; every
// hit is logged so its use stays observable.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use quicktab_common::record::BoardRecord;
use quicktab_common::types::QuickWindow;
use tracing::{debug, warn};

use crate::session::Session;

/// Own-write save ids are remembered for this many tolerance windows before
/// being pruned.
const SAVE_PRUNE_MULTIPLIER: u32 = 4;

/// Which signal identified a notification as this context's own write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfWriteSignal {
    /// Exact `transaction_id` match; primary, fully deterministic.
    TransactionId,
    /// `writing_instance_id` matches this page load.
    InstanceId,
    /// `writing_context_id` matches this context.
    ContextId,
    /// Timestamp-window match on a tracked `save_id`; best-effort fallback.
    SaveIdWindow,
}

/// Why a record was rejected. Every rejection asks for recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Revision lower than the last applied one.
    StaleRevision { incoming: u64, last: u64 },
    /// Same revision, but the sequence id moved backwards.
    SequenceRewind { incoming: u64, last: u64 },
    /// Exact duplicate of the last applied record, but it arrived outside
    /// the adaptive tolerance window, indistinguishable from a replay.
    LateDuplicate,
}

/// Outcome of one change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncDecision {
    /// Our own write echoed back; markers advanced, nothing re-rendered.
    SelfWrite { signal: SelfWriteSignal },
    /// A newer state to apply as a single full replace.
    Accept { windows: Vec<QuickWindow>, revision: u64, sequence_id: u64 },
    /// Exact duplicate of the last applied record inside the tolerance
    /// window; ignored.
    Duplicate,
    /// Stale or out-of-order; the caller must request recovery.
    Rejected { reason: RejectReason },
}

/// Per-context sync engine state.
#[derive(Debug, Default)]
pub struct SyncEngine {
    /// save_id → write time, for the timestamp-window fallback.
    recent_saves: HashMap<String, DateTime<Utc>>,
    /// The transaction id of this context's most recent write.
    last_transaction_id: Option<String>,
    /// When the last record (own or remote) was applied.
    last_applied_at: Option<DateTime<Utc>>,
}

impl SyncEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record attribution for a write this context just made, so the echoed
    /// notification is recognized.
    pub fn note_local_write(
        &mut self,
        session: &mut Session,
        record: &BoardRecord,
        now: DateTime<Utc>,
    ) {
        self.recent_saves.insert(record.save_id.clone(), now);
        self.last_transaction_id = record.transaction_id.clone();
        session.advance_markers(record.revision, record.sequence_id);
        self.last_applied_at = Some(now);
    }

    /// Classify one change notification.
    pub fn decide(
        &mut self,
        session: &mut Session,
        record: &BoardRecord,
        tolerance: Duration,
        now: DateTime<Utc>,
    ) -> SyncDecision {
        self.prune_saves(tolerance, now);

        if let Some(signal) = self.self_write_signal(session, record, tolerance, now) {
            // Bookkeeping only: this context already applied the change when
            // it wrote it.
            session.advance_markers(record.revision, record.sequence_id);
            self.recent_saves.remove(&record.save_id);
            debug!(save_id = %record.save_id, ?signal, "suppressed self-write notification");
            return SyncDecision::SelfWrite { signal };
        }

        let last_revision = session.last_revision();
        let last_sequence = session.last_sequence();

        if record.revision < last_revision {
            return SyncDecision::Rejected {
                reason: RejectReason::StaleRevision {
                    incoming: record.revision,
                    last: last_revision,
                },
            };
        }

        if record.revision == last_revision {
            if record.sequence_id < last_sequence {
                return SyncDecision::Rejected {
                    reason: RejectReason::SequenceRewind {
                        incoming: record.sequence_id,
                        last: last_sequence,
                    },
                };
            }
            if record.sequence_id == last_sequence {
                let within_window = self
                    .last_applied_at
                    .map(|at| (now - at).to_std().unwrap_or_default() <= tolerance)
                    .unwrap_or(false);
                if within_window {
                    debug!(
                        revision = record.revision,
                        sequence_id = record.sequence_id,
                        "tolerated exact duplicate notification"
                    );
                    return SyncDecision::Duplicate;
                }
                return SyncDecision::Rejected { reason: RejectReason::LateDuplicate };
            }
            // Same revision, higher sequence: a fine-grained advance from a
            // coalesced write.
        } else if record.sequence_id < last_sequence {
            // Revision moved forward while the fine-grained counter moved
            // back; revision dominates but the skew is worth seeing.
            warn!(
                revision = record.revision,
                sequence_id = record.sequence_id,
                last_sequence,
                "accepted record with regressed sequence id"
            );
        }

        session.advance_markers(record.revision, record.sequence_id);
        self.last_applied_at = Some(now);
        SyncDecision::Accept {
            windows: record.windows.clone(),
            revision: record.revision,
            sequence_id: record.sequence_id,
        }
    }

    /// Reset after a full resync; the snapshot becomes the new baseline.
    pub fn reset_to_snapshot(
        &mut self,
        session: &mut Session,
        record: &BoardRecord,
        now: DateTime<Utc>,
    ) {
        session.reset_markers(record.revision, record.sequence_id);
        self.last_applied_at = Some(now);
    }

    fn self_write_signal(
        &self,
        session: &Session,
        record: &BoardRecord,
        tolerance: Duration,
        now: DateTime<Utc>,
    ) -> Option<SelfWriteSignal> {
        // (1) Transaction id: only a positive match is conclusive; a
        // mismatch could be an older write of ours, so fall through.
        if let (Some(incoming), Some(ours)) =
            (record.transaction_id.as_ref(), self.last_transaction_id.as_ref())
        {
            if incoming == ours {
                return Some(SelfWriteSignal::TransactionId);
            }
        }

        // (2) Instance id: presence is conclusive either way.
        if let Some(instance) = record.writing_instance_id.as_deref() {
            return (instance == session.instance_id()).then_some(SelfWriteSignal::InstanceId);
        }

        // (3) Context id: presence is conclusive either way.
        if let Some(context) = record.writing_context_id {
            return (Some(context) == session.context_id()).then_some(SelfWriteSignal::ContextId);
        }

        // (4) No attribution at all: timestamp-window match against our own
        // recent save ids. Approximate by nature: notification latency is
        // unbounded.
        if let Some(written_at) = self.recent_saves.get(&record.save_id) {
            if (now - *written_at).to_std().unwrap_or_default() <= tolerance {
                warn!(
                    save_id = %record.save_id,
                    "self-write resolved via timestamp fallback"
                );
                return Some(SelfWriteSignal::SaveIdWindow);
            }
        }

        None
    }

    fn prune_saves(&mut self, tolerance: Duration, now: DateTime<Utc>) {
        let horizon = tolerance * SAVE_PRUNE_MULTIPLIER;
        self.recent_saves
            .retain(|_, written_at| (now - *written_at).to_std().unwrap_or_default() <= horizon);
    }

    #[cfg(test)]
    fn tracked_saves(&self) -> usize {
        self.recent_saves.len()
    }
}
