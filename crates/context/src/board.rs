// The context's in-memory view of the quick-window board.
//
// Remote updates arrive as full-state replaces (never diffs), so the board's
// apply path is a single swap. Local mutations go the other way: mutate the
// board, then build the successor shared-store record from it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use quicktab_common::record::{compute_checksum, BoardRecord};
use quicktab_common::types::QuickWindow;
use quicktab_common::window_id::WindowId;
use uuid::Uuid;

use crate::session::Session;

/// Attribution for one local write, handed to the sync engine so the echoed
/// store notification is recognized as a self-write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAttribution {
    pub save_id: String,
    pub transaction_id: String,
}

/// In-memory window collection, keyed by id.
#[derive(Debug, Default)]
pub struct LocalBoard {
    windows: BTreeMap<WindowId, QuickWindow>,
}

impl LocalBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &WindowId) -> Option<&QuickWindow> {
        self.windows.get(id)
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QuickWindow> {
        self.windows.values()
    }

    pub fn upsert(&mut self, window: QuickWindow) {
        self.windows.insert(window.id.clone(), window);
    }

    pub fn remove(&mut self, id: &WindowId) -> Option<QuickWindow> {
        self.windows.remove(id)
    }

    /// Swap in a full remote state. Returns the ids that disappeared, so the
    /// caller can destroy their renderings.
    pub fn replace_all(&mut self, windows: Vec<QuickWindow>) -> Vec<WindowId> {
        let incoming: BTreeMap<WindowId, QuickWindow> =
            windows.into_iter().map(|w| (w.id.clone(), w)).collect();
        let removed =
            self.windows.keys().filter(|id| !incoming.contains_key(*id)).cloned().collect();
        self.windows = incoming;
        removed
    }

    /// Update one window's owner field. Returns false if the id is unknown.
    pub fn set_owner(&mut self, id: &WindowId, owner: Option<u32>) -> bool {
        match self.windows.get_mut(id) {
            Some(window) => {
                window.owner_context_id = owner;
                true
            }
            None => false,
        }
    }

    /// Update one window's minimized flag. Returns false if the id is unknown.
    pub fn set_minimized(&mut self, id: &WindowId, minimized: bool) -> bool {
        match self.windows.get_mut(id) {
            Some(window) => {
                window.minimized = minimized;
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<QuickWindow> {
        self.windows.values().cloned().collect()
    }

    /// Build the successor shared-store record for the current board state:
    /// revision and sequence advance past the session's last-applied markers,
    /// attribution fields identify this context, and the checksum is
    /// recomputed from the windows actually in the record.
    pub fn next_record(
        &self,
        session: &Session,
        now: DateTime<Utc>,
    ) -> (BoardRecord, WriteAttribution) {
        let windows = self.snapshot();
        let attribution = WriteAttribution {
            save_id: Uuid::new_v4().to_string(),
            transaction_id: Uuid::new_v4().to_string(),
        };
        let checksum = compute_checksum(&windows);
        let record = BoardRecord {
            windows,
            revision: session.last_revision() + 1,
            sequence_id: session.last_sequence() + 1,
            timestamp_ms: now.timestamp_millis(),
            save_id: attribution.save_id.clone(),
            writing_context_id: session.context_id(),
            writing_instance_id: Some(session.instance_id().to_string()),
            transaction_id: Some(attribution.transaction_id.clone()),
            checksum,
        };
        (record, attribution)
    }
}
