// Message types for the quicktab-port.v1 coordinator protocol.
//
// One closed enum covers both directions; the doc comment on each variant
// names the sender. Messages travel inside a `PortEnvelope` carrying the
// per-channel outbound sequence number.

use serde::{Deserialize, Serialize};

use crate::record::BoardRecord;
use crate::types::QuickWindow;
use crate::window_id::WindowId;

/// Error code for a coordinator that is up but has not finished initializing.
/// Identity acquisition treats this as retryable.
pub const CODE_COORDINATOR_NOT_READY: &str = "COORDINATOR_NOT_READY";

/// Error code for operations targeting a window the caller does not own.
pub const CODE_CROSS_CONTEXT_FILTERED: &str = "CROSS_CONTEXT_FILTERED";

/// Error code for an unknown window id.
pub const CODE_WINDOW_NOT_FOUND: &str = "WINDOW_NOT_FOUND";

/// Why a context is asking the coordinator for a full state snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncReason {
    /// Cold start with no usable local state.
    ColdStart,
    /// A stale or out-of-order store notification was rejected.
    OrderingRejected,
    /// The store record failed checksum verification on hydration.
    ChecksumMismatch,
    /// The coordinator's generation changed mid-session.
    CoordinatorRestart,
}

/// All message types in the quicktab-port.v1 protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PortMessage {
    /// Context -> Coordinator: first handshake phase.
    InitRequest {
        #[serde(skip_serializing_if = "Option::is_none")]
        context_id: Option<u32>,
        instance_id: String,
    },

    /// Coordinator -> Context: second handshake phase. `generation` increments
    /// on every coordinator restart.
    InitResponse { generation: u64 },

    /// Context -> Coordinator: third handshake phase; the channel is READY
    /// once this is sent.
    InitComplete { ack_generation: u64 },

    /// Context -> Coordinator: liveness probe.
    Heartbeat { last_known_generation: u64 },

    /// Coordinator -> Context: heartbeat reply. A `generation` differing from
    /// the probe's `last_known_generation` signals a silent restart.
    HeartbeatAck { generation: u64 },

    /// Context -> Coordinator: request a unique context identifier.
    AcquireContextId { instance_id: String },

    /// Coordinator -> Context: identity assignment.
    ContextIdAssigned { context_id: u32 },

    /// Context -> Coordinator: ask for a full state snapshot.
    RequestFullStateSync { reason: SyncReason },

    /// Coordinator -> Context: authoritative full state.
    StateSnapshot { record: BoardRecord },

    /// Context -> Coordinator: persist a newly created window.
    CreateWindow { window: QuickWindow, save_id: String },

    /// Coordinator -> Context: creation persisted.
    WindowCreated { save_id: String, revision: u64 },

    /// Context -> Coordinator: transfer a window's ownership.
    RequestAdoption { window_id: WindowId, new_owner_context_id: u32 },

    /// Coordinator -> Context: an ownership transfer committed. Broadcast to
    /// every connected context, including the requester.
    AdoptionCompleted {
        window_id: WindowId,
        #[serde(skip_serializing_if = "Option::is_none")]
        previous_owner: Option<u32>,
        new_owner: u32,
    },

    /// Coordinator -> Context: structured failure reply.
    Error { code: String, message: String, retryable: bool },
}

/// Transport envelope: every outbound message carries a monotonic per-channel
/// sequence number. Receivers log order violations but do not hard-fail on
/// them; the shared store, not the channel, is the source of truth for data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortEnvelope {
    pub seq: u64,
    #[serde(flatten)]
    pub message: PortMessage,
}

impl PortEnvelope {
    pub fn new(seq: u64, message: PortMessage) -> Self {
        Self { seq, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_tag_with_snake_case_type() {
        let msg = PortMessage::Heartbeat { last_known_generation: 4 };
        let json = serde_json::to_string(&msg).expect("serialize");
        assert_eq!(json, r#"{"type":"heartbeat","last_known_generation":4}"#);
    }

    #[test]
    fn envelope_flattens_the_message() {
        let env = PortEnvelope::new(9, PortMessage::InitComplete { ack_generation: 2 });
        let json = serde_json::to_string(&env).expect("serialize");
        assert_eq!(json, r#"{"seq":9,"type":"init_complete","ack_generation":2}"#);

        let back: PortEnvelope = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, env);
    }

    #[test]
    fn init_request_omits_absent_context_id() {
        let msg = PortMessage::InitRequest { context_id: None, instance_id: "i-1".to_string() };
        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(!json.contains("context_id"));
    }

    #[test]
    fn error_reply_round_trips() {
        let msg = PortMessage::Error {
            code: CODE_COORDINATOR_NOT_READY.to_string(),
            message: "still loading".to_string(),
            retryable: true,
        };
        let json = serde_json::to_string(&msg).expect("serialize");
        let back: PortMessage = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, msg);
    }

    #[test]
    fn sync_reason_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&SyncReason::ChecksumMismatch).unwrap(),
            "\"checksum_mismatch\""
        );
        assert_eq!(
            serde_json::to_string(&SyncReason::CoordinatorRestart).unwrap(),
            "\"coordinator_restart\""
        );
    }
}
