// The shared-store board record and its integrity checksum.
//
// One record per logical collection. The store gives no write-ordering
// guarantee, so every record carries enough versioning (`revision`,
// `sequence_id`) and attribution (`save_id`, writer ids, `transaction_id`)
// for receivers to order, deduplicate, and self-write-filter on their own.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::QuickWindow;

/// The full shared-store record for one quick-window board.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoardRecord {
    pub windows: Vec<QuickWindow>,
    /// Coarse monotonic version; bumped once per logical write.
    pub revision: u64,
    /// Fine-grained monotonic version; assigned per physical write.
    pub sequence_id: u64,
    /// Wall-clock write time, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Per-write correlation token.
    pub save_id: String,
    /// Context id of the writer, when one was acquired.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writing_context_id: Option<u32>,
    /// Instance id (unique per page load) of the writer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writing_instance_id: Option<String>,
    /// Strongest self-write signal: unique per write, echoed verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    /// Integrity checksum over window identities/ownership/minimized flags.
    pub checksum: String,
}

impl BoardRecord {
    /// Recompute the checksum from this record's own window list and compare
    /// it to the stored value.
    pub fn verify_checksum(&self) -> Result<(), ChecksumMismatch> {
        let computed = compute_checksum(&self.windows);
        if computed == self.checksum {
            Ok(())
        } else {
            Err(ChecksumMismatch { stored: self.checksum.clone(), computed })
        }
    }
}

/// Checksum over the identity-bearing fields of a window list.
///
/// Covers id, owner, and minimized flag per window, in id order, so the value
/// is independent of the list's storage order. Content fields (url, title,
/// geometry) are deliberately excluded: the checksum guards against truncated
/// or divergent reads, not against benign content edits racing each other.
pub fn compute_checksum(windows: &[QuickWindow]) -> String {
    let mut lines: Vec<String> = windows
        .iter()
        .map(|w| {
            format!(
                "{}|{}|{}",
                w.id,
                w.owner_context_id.map(|id| id.to_string()).unwrap_or_default(),
                w.minimized as u8
            )
        })
        .collect();
    lines.sort();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    STANDARD_NO_PAD.encode(hasher.finalize())
}

/// Stored and recomputed checksums disagree; the record cannot be trusted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("board checksum mismatch: stored `{stored}`, computed `{computed}`")]
pub struct ChecksumMismatch {
    pub stored: String,
    pub computed: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PinTarget, VisibilitySet, WindowPosition, WindowSize};
    use crate::window_id::WindowId;

    fn window(ctx: u32, counter: u64) -> QuickWindow {
        QuickWindow {
            id: WindowId::new(ctx, counter, "ab".to_string()),
            url: "https://example.com".to_string(),
            title: "w".to_string(),
            position: WindowPosition { x: 0.0, y: 0.0 },
            size: WindowSize { width: 100.0, height: 100.0 },
            owner_context_id: Some(ctx),
            minimized: false,
            pin_target: PinTarget::Screen,
            scope: None,
            session_only: false,
            visibility: VisibilitySet::default(),
        }
    }

    fn record(windows: Vec<QuickWindow>) -> BoardRecord {
        let checksum = compute_checksum(&windows);
        BoardRecord {
            windows,
            revision: 3,
            sequence_id: 14,
            timestamp_ms: 1_700_000_000_000,
            save_id: "save-1".to_string(),
            writing_context_id: Some(5),
            writing_instance_id: Some("inst-1".to_string()),
            transaction_id: Some("txn-1".to_string()),
            checksum,
        }
    }

    #[test]
    fn checksum_is_order_independent() {
        let a = window(1, 1);
        let b = window(2, 1);
        assert_eq!(
            compute_checksum(&[a.clone(), b.clone()]),
            compute_checksum(&[b, a]),
            "storage order must not change the checksum",
        );
    }

    #[test]
    fn checksum_tracks_ownership_and_minimized() {
        let base = window(1, 1);
        let mut adopted = base.clone();
        adopted.owner_context_id = Some(9);
        let mut minimized = base.clone();
        minimized.minimized = true;

        let original = compute_checksum(std::slice::from_ref(&base));
        assert_ne!(original, compute_checksum(&[adopted]));
        assert_ne!(original, compute_checksum(&[minimized]));
    }

    #[test]
    fn checksum_ignores_content_fields() {
        let base = window(1, 1);
        let mut moved = base.clone();
        moved.position = WindowPosition { x: 500.0, y: 500.0 };
        moved.title = "renamed".to_string();

        assert_eq!(
            compute_checksum(std::slice::from_ref(&base)),
            compute_checksum(&[moved]),
            "geometry and title edits must not invalidate the checksum",
        );
    }

    #[test]
    fn verify_accepts_consistent_record() {
        let rec = record(vec![window(1, 1), window(2, 2)]);
        assert!(rec.verify_checksum().is_ok());
    }

    #[test]
    fn verify_rejects_truncated_record() {
        let mut rec = record(vec![window(1, 1), window(2, 2)]);
        rec.windows.pop();
        let err = rec.verify_checksum().expect_err("truncated record must fail");
        assert_eq!(err.stored, rec.checksum);
    }

    #[test]
    fn record_serde_round_trips() {
        let rec = record(vec![window(1, 1)]);
        let json = serde_json::to_string(&rec).expect("serialize record");
        let back: BoardRecord = serde_json::from_str(&json).expect("deserialize record");
        assert_eq!(back, rec);
    }

    #[test]
    fn optional_attribution_fields_are_omitted_when_absent() {
        let mut rec = record(vec![]);
        rec.writing_context_id = None;
        rec.writing_instance_id = None;
        rec.transaction_id = None;
        let json = serde_json::to_string(&rec).expect("serialize record");
        assert!(!json.contains("writing_context_id"));
        assert!(!json.contains("transaction_id"));
    }
}
