// Creation serializer: collision-free identifier allocation and FIFO
// creation processing.
//
// Two rapid user-triggered creations must never interleave their local-apply
// and coordinator-notify steps, so requests go through one bounded queue that
// the runtime drains strictly in submission order. Each item applies locally
// first (the UI never blocks on a round trip), then notifies the coordinator;
// a notify failure rolls the entity back out of pending-save tracking without
// un-rendering it.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use quicktab_common::types::{PinTarget, VisibilitySet};
use quicktab_common::window_id::{WindowId, SUFFIX_LEN, UNATTRIBUTED_CONTEXT};
use rand::Rng;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

/// Everything the UI supplies for a new window; the engine fills in identity
/// and ownership.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSpec {
    pub url: String,
    pub title: String,
    pub position: (f64, f64),
    pub size: (f64, f64),
    pub pin_target: PinTarget,
    pub scope: Option<String>,
    pub session_only: bool,
    pub visibility: VisibilitySet,
}

/// A committed creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCommit {
    pub window_id: WindowId,
    pub revision: u64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CreateError {
    #[error("creation queue full ({limit} pending)")]
    QueueFull { limit: usize },
    #[error("could not allocate a unique identifier after {attempts} attempts")]
    SuffixExhausted { attempts: u32 },
    #[error("invalid window url: {0}")]
    InvalidUrl(String),
    #[error("coordinator notify failed: {0}")]
    NotifyFailed(String),
    #[error("creation abandoned at teardown")]
    Cancelled,
}

/// Quick windows only load http(s) content; anything else (javascript:,
/// file:, extension schemes) is refused before it reaches the board.
pub fn validate_window_url(value: &str) -> Result<(), CreateError> {
    let parsed =
        url::Url::parse(value).map_err(|e| CreateError::InvalidUrl(format!("{value}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(CreateError::InvalidUrl(format!("unsupported scheme `{scheme}`"))),
    }
}

// ── Identifier allocation ───────────────────────────────────────────

/// Allocates `qt-<ctx>-<counter>-<suffix>` identifiers.
///
/// The per-context counter makes collisions vanishingly unlikely on its own;
/// the issued-set check plus bounded suffix retries rule them out entirely
/// within one context's lifetime.
#[derive(Debug, Default)]
pub struct IdAllocator {
    counter: u64,
    issued: HashSet<WindowId>,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next identifier. `context_id = None` produces an
    /// unattributed (degraded-mode) id with fragment 0.
    pub fn allocate(
        &mut self,
        context_id: Option<u32>,
        suffix_retries: u32,
    ) -> Result<WindowId, CreateError> {
        let fragment = context_id.unwrap_or(UNATTRIBUTED_CONTEXT);
        self.counter += 1;

        let mut rng = rand::thread_rng();
        for _ in 0..suffix_retries.max(1) {
            let id = WindowId::new(fragment, self.counter, random_suffix(&mut rng));
            if self.issued.insert(id.clone()) {
                return Ok(id);
            }
        }
        Err(CreateError::SuffixExhausted { attempts: suffix_retries.max(1) })
    }

    pub fn issued_count(&self) -> usize {
        self.issued.len()
    }
}

fn random_suffix<R: Rng>(rng: &mut R) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    (0..SUFFIX_LEN).map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char).collect()
}

// ── Creation queue ──────────────────────────────────────────────────

/// One queued creation request.
#[derive(Debug)]
pub struct PendingCreate {
    pub spec: WindowSpec,
    pub enqueued_at: DateTime<Utc>,
    pub reply: oneshot::Sender<Result<CreateCommit, CreateError>>,
}

/// Bounded FIFO queue of creation requests.
#[derive(Debug, Default)]
pub struct CreationQueue {
    queue: VecDeque<PendingCreate>,
    limit: usize,
}

impl CreationQueue {
    pub fn new(limit: usize) -> Self {
        Self { queue: VecDeque::new(), limit: limit.max(1) }
    }

    /// Enqueue a request. Past the bound the request is rejected immediately
    /// through its reply channel rather than queued without limit.
    pub fn enqueue(&mut self, pending: PendingCreate) {
        if self.queue.len() >= self.limit {
            warn!(limit = self.limit, "creation queue full; rejecting request");
            let _ = pending.reply.send(Err(CreateError::QueueFull { limit: self.limit }));
            return;
        }
        self.queue.push_back(pending);
    }

    /// Next request in submission order.
    pub fn pop(&mut self) -> Option<PendingCreate> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Fail everything still queued (teardown).
    pub fn cancel_all(&mut self) {
        while let Some(pending) = self.queue.pop_front() {
            let _ = pending.reply.send(Err(CreateError::Cancelled));
        }
    }
}

// ── Pending-save tracking ───────────────────────────────────────────

/// A creation applied locally and sent to the coordinator, awaiting its
/// `window_created` ack.
#[derive(Debug)]
pub struct PendingAck {
    pub window_id: WindowId,
    pub sent_at: DateTime<Utc>,
    pub reply: oneshot::Sender<Result<CreateCommit, CreateError>>,
}

/// save_id → in-flight creation.
#[derive(Debug, Default)]
pub struct PendingSaves {
    inflight: HashMap<String, PendingAck>,
}

impl PendingSaves {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, save_id: String, pending: PendingAck) {
        self.inflight.insert(save_id, pending);
    }

    /// Resolve a coordinator ack. Returns the window id on a match.
    pub fn resolve(&mut self, save_id: &str, revision: u64) -> Option<WindowId> {
        let pending = self.inflight.remove(save_id)?;
        let window_id = pending.window_id.clone();
        let _ = pending
            .reply
            .send(Ok(CreateCommit { window_id: pending.window_id, revision }));
        Some(window_id)
    }

    /// Roll a creation back out of tracking after a notify failure. The
    /// entity stays rendered; only the pending-save entry dies.
    pub fn roll_back(&mut self, save_id: &str, error: CreateError) -> Option<WindowId> {
        let pending = self.inflight.remove(save_id)?;
        warn!(save_id, window_id = %pending.window_id, %error, "creation notify failed; rolled back from pending saves");
        let window_id = pending.window_id.clone();
        let _ = pending.reply.send(Err(error));
        Some(window_id)
    }

    /// Fail every in-flight creation older than `timeout`. Returns the
    /// affected window ids.
    pub fn sweep_timeouts_at(
        &mut self,
        now: DateTime<Utc>,
        timeout: std::time::Duration,
    ) -> Vec<WindowId> {
        let expired: Vec<String> = self
            .inflight
            .iter()
            .filter(|(_, pending)| {
                (now - pending.sent_at).to_std().unwrap_or_default() >= timeout
            })
            .map(|(save_id, _)| save_id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|save_id| {
                self.roll_back(save_id, CreateError::NotifyFailed("ack timeout".to_string()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    /// Snapshot of in-flight saves, for re-notifying after a coordinator
    /// restart.
    pub fn inflight_list(&self) -> Vec<(String, WindowId)> {
        self.inflight
            .iter()
            .map(|(save_id, pending)| (save_id.clone(), pending.window_id.clone()))
            .collect()
    }
}
