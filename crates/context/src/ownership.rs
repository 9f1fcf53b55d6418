// Ownership and adoption tracking.
//
// Adoptions are TTL-driven only:
// - an ADOPTION_COMPLETED notification creates/overwrites a record with
//   `expires_at = now + ttl` (ttl ≈ 3× observed round trip, clamped)
// - ownership checks consult records before the identifier fragment
// - expired records are purged lazily and by the periodic sweep
//
// While an unexpired adoption record exists for an id, it alone decides
// ownership; the identifier's embedded creator fragment only applies in the
// absence of any record, because the fragment reflects the original creator
// while adoption reflects the latest authoritative transfer.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use quicktab_common::window_id::WindowId;
use thiserror::Error;
use tracing::{debug, warn};

use crate::session::Session;

/// A time-bounded ownership override for one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdoptionRecord {
    pub new_owner: u32,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl AdoptionRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let age = (now - self.created_at).to_std().unwrap_or_default();
        age >= self.ttl
    }
}

/// Structured rejection for operations on windows this context does not own.
/// Logged and surfaced, never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("operation on {window_id} rejected: {reason}")]
pub struct OwnershipDenied {
    pub window_id: WindowId,
    pub reason: &'static str,
}

impl OwnershipDenied {
    pub fn cross_context(window_id: WindowId) -> Self {
        Self { window_id, reason: "cross-context-filtered" }
    }
}

/// Per-context ownership state.
#[derive(Debug, Default)]
pub struct OwnershipTracker {
    /// Windows currently rendered live in this context.
    live: HashSet<WindowId>,
    /// Windows minimized here (still owned, not painted).
    minimized: HashSet<WindowId>,
    adoptions: HashMap<WindowId, AdoptionRecord>,
}

impl OwnershipTracker {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Local caches ────────────────────────────────────────────────

    pub fn note_rendered(&mut self, id: WindowId) {
        self.minimized.remove(&id);
        self.live.insert(id);
    }

    pub fn note_minimized(&mut self, id: WindowId) {
        self.live.remove(&id);
        self.minimized.insert(id);
    }

    pub fn note_destroyed(&mut self, id: &WindowId) {
        self.live.remove(id);
        self.minimized.remove(id);
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, id: &WindowId) -> bool {
        self.live.contains(id)
    }

    pub fn is_minimized(&self, id: &WindowId) -> bool {
        self.minimized.contains(id)
    }

    // ── Ownership decision ──────────────────────────────────────────

    /// Whether this context currently owns `id`.
    ///
    /// Priority: local live/minimized caches, then an unexpired adoption
    /// record, then (only with no record present) the identifier's embedded
    /// creator fragment.
    pub fn owns_at(&self, session: &Session, id: &WindowId, now: DateTime<Utc>) -> bool {
        if self.live.contains(id) || self.minimized.contains(id) {
            return true;
        }

        let Some(context_id) = session.context_id() else {
            // Degraded mode: nothing is owned by fragment; an adoption could
            // still not name us (we have no id to be named by).
            return false;
        };

        if let Some(record) = self.adoptions.get(id) {
            if !record.is_expired_at(now) {
                if id.creator_context() != record.new_owner {
                    // Expected while adopted away from the creator; worth a
                    // trace when the fragment would have decided differently.
                    warn!(
                        window_id = %id,
                        fragment = id.creator_context(),
                        adopted_owner = record.new_owner,
                        "identifier fragment diverges from active adoption"
                    );
                }
                return record.new_owner == context_id;
            }
        }

        id.creator_context() == context_id
    }

    /// Guard an operation that requires ownership.
    pub fn require_owned_at(
        &self,
        session: &Session,
        id: &WindowId,
        now: DateTime<Utc>,
    ) -> Result<(), OwnershipDenied> {
        if self.owns_at(session, id, now) {
            Ok(())
        } else {
            Err(OwnershipDenied::cross_context(id.clone()))
        }
    }

    // ── Adoption lifecycle ──────────────────────────────────────────

    /// Record a completed transfer. `ttl` comes from the tuning's RTT-scaled
    /// clamp (see `Tuning::adoption_ttl_for_rtt`).
    pub fn on_adoption_completed(
        &mut self,
        id: WindowId,
        new_owner: u32,
        ttl: Duration,
        now: DateTime<Utc>,
    ) {
        debug!(window_id = %id, new_owner, ttl_ms = ttl.as_millis() as u64, "adoption recorded");
        self.adoptions
            .insert(id, AdoptionRecord { new_owner, created_at: now, ttl });
    }

    /// The record for an id, if present and unexpired.
    pub fn active_adoption(&self, id: &WindowId, now: DateTime<Utc>) -> Option<&AdoptionRecord> {
        self.adoptions.get(id).filter(|record| !record.is_expired_at(now))
    }

    /// Purge expired records. Returns how many were removed.
    pub fn sweep_at(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.adoptions.len();
        self.adoptions.retain(|_, record| !record.is_expired_at(now));
        let removed = before - self.adoptions.len();
        if removed > 0 {
            debug!(removed, "swept expired adoption records");
        }
        removed
    }
}
