// The shared-store seam.
//
// The real store is the host's key/value area: asynchronously notified, no
// write-ordering guarantee, unpredictable delivery latency. The engine only
// needs read/write; change notifications are delivered to the runtime as
// events, not pulled through this trait.

use std::sync::{Arc, Mutex};

use quicktab_common::record::BoardRecord;
use thiserror::Error;
use tokio::sync::mpsc;

/// Narrow interface over the shared key/value store.
pub trait SharedStore {
    /// Read the current board record, if any has ever been written.
    fn read(&self) -> Result<Option<BoardRecord>, StoreError>;

    /// Write a full board record. The store notifies every subscribed
    /// context, including the writer.
    fn write(&self, record: &BoardRecord) -> Result<(), StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("shared store unavailable: {0}")]
    Unavailable(String),
    #[error("shared store returned a corrupt record: {0}")]
    Corrupt(String),
}

/// In-memory shared store with change fan-out.
///
/// Mirrors the host store's one observable quirk: the writer receives its own
/// change notification, which is exactly why self-write suppression exists.
/// Used by tests and by embedders that want a single-process board.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    record: Option<BoardRecord>,
    watchers: Vec<mpsc::UnboundedSender<BoardRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to change notifications. Every write after this call is
    /// delivered to the returned receiver.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BoardRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().watchers.push(tx);
        rx
    }

    /// Overwrite the stored record without notifying watchers. Tests use this
    /// to fabricate pre-existing (possibly corrupt) store contents.
    pub fn seed(&self, record: BoardRecord) {
        self.lock().record = Some(record);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SharedStore for MemoryStore {
    fn read(&self) -> Result<Option<BoardRecord>, StoreError> {
        Ok(self.lock().record.clone())
    }

    fn write(&self, record: &BoardRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.record = Some(record.clone());
        inner.watchers.retain(|watcher| watcher.send(record.clone()).is_ok());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quicktab_common::record::compute_checksum;

    fn record(revision: u64) -> BoardRecord {
        BoardRecord {
            windows: vec![],
            revision,
            sequence_id: revision,
            timestamp_ms: 0,
            save_id: format!("save-{revision}"),
            writing_context_id: None,
            writing_instance_id: None,
            transaction_id: None,
            checksum: compute_checksum(&[]),
        }
    }

    #[test]
    fn read_returns_none_before_any_write() {
        let store = MemoryStore::new();
        assert!(store.read().expect("read").is_none());
    }

    #[test]
    fn write_then_read_round_trips() {
        let store = MemoryStore::new();
        store.write(&record(1)).expect("write");
        let loaded = store.read().expect("read").expect("record present");
        assert_eq!(loaded.revision, 1);
    }

    #[test]
    fn writes_notify_every_subscriber_including_the_writer() {
        let store = MemoryStore::new();
        let mut a = store.subscribe();
        let mut b = store.subscribe();

        store.write(&record(1)).expect("write");

        assert_eq!(a.try_recv().expect("a notified").revision, 1);
        assert_eq!(b.try_recv().expect("b notified").revision, 1);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let store = MemoryStore::new();
        let rx = store.subscribe();
        drop(rx);

        store.write(&record(1)).expect("write");
        assert_eq!(store.lock().watchers.len(), 0);
    }

    #[test]
    fn seed_does_not_notify() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();
        store.seed(record(7));
        assert!(rx.try_recv().is_err());
        assert_eq!(store.read().expect("read").expect("record").revision, 7);
    }
}
