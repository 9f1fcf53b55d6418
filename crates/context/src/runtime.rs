// The context runtime: single-task event loop wiring every component.
//
// All protocol state lives in one `ContextEngine`; handlers are synchronous,
// clock-injected methods that run to completion before the loop yields, so no
// two handlers for the same context ever run concurrently. The async shell
// only multiplexes inputs (store notifications, UI events, creation requests,
// the shutdown signal) and a periodic tick that drives every timer.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use quicktab_common::protocol::port::{
    PortMessage, SyncReason, CODE_COORDINATOR_NOT_READY,
};
use quicktab_common::record::BoardRecord;
use quicktab_common::types::{NoticeKind, QuickWindow, VisibilitySet, WindowPosition, WindowSize};
use quicktab_common::window_id::WindowId;

use crate::board::LocalBoard;
use crate::channel::{
    ChannelConfig, ChannelError, ChannelEvent, ChannelManager, ConnectOutcome, HeartbeatTick,
    PortTransport,
};
use crate::config::Tuning;
use crate::create::{
    CreateCommit, CreateError, CreationQueue, IdAllocator, PendingAck, PendingCreate, PendingSaves,
    WindowSpec,
};
use crate::identity::{IdentityAcquirer, IdentityAction};
use crate::ownership::OwnershipTracker;
use crate::recovery::{evaluate_record, DeferredOp, HydrationOutcome, HydrationSupervisor, PollAction};
use crate::render::{Renderer, UiEvent};
use crate::retry::{FailureClass, FixedSchedule};
use crate::session::{ConnectionHealth, RttTracker, Session};
use crate::store::SharedStore;
use crate::sync::{SyncDecision, SyncEngine};

/// Default spawn geometry when the UI supplies no pointer position.
const DEFAULT_SPAWN_OFFSET: (f64, f64) = (60.0, 60.0);
const DEFAULT_WINDOW_SIZE: (f64, f64) = (420.0, 320.0);

/// Cap on messages drained from the channel per tick, so one busy tick cannot
/// starve the other event sources.
const MAX_INCOMING_PER_TICK: u32 = 32;

type CreateReply = oneshot::Sender<Result<CreateCommit, CreateError>>;

/// Handle held by the embedder. Dropping it (or calling `shutdown`) stops
/// the runtime.
pub struct ContextHandle {
    ui: mpsc::UnboundedSender<UiEvent>,
    create: mpsc::UnboundedSender<(WindowSpec, CreateReply)>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl ContextHandle {
    /// Queue a creation and wait for its committed result.
    pub async fn create_window(&self, spec: WindowSpec) -> Result<CreateCommit, CreateError> {
        let (tx, rx) = oneshot::channel();
        self.create.send((spec, tx)).map_err(|_| CreateError::Cancelled)?;
        rx.await.map_err(|_| CreateError::Cancelled)?
    }

    /// Forward a UI collaborator event.
    pub fn send_ui(&self, event: UiEvent) {
        let _ = self.ui.send(event);
    }

    /// Stop the runtime.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Receiving ends owned by the run loop.
pub struct ContextInbox {
    ui: mpsc::UnboundedReceiver<UiEvent>,
    create: mpsc::UnboundedReceiver<(WindowSpec, CreateReply)>,
    shutdown: oneshot::Receiver<()>,
}

/// Build the handle/inbox pair for one context.
pub fn context_channels() -> (ContextHandle, ContextInbox) {
    let (ui_tx, ui_rx) = mpsc::unbounded_channel();
    let (create_tx, create_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    (
        ContextHandle { ui: ui_tx, create: create_tx, shutdown: Some(shutdown_tx) },
        ContextInbox { ui: ui_rx, create: create_rx, shutdown: shutdown_rx },
    )
}

/// Per-context runtime options.
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    /// True when this page load came back from the host's page cache.
    pub resumed: bool,
    /// Isolation scope (container/profile key) this context renders for.
    /// Windows from another scope are never rendered here.
    pub scope: Option<String>,
}

/// One context's complete protocol engine.
pub struct ContextEngine<T: PortTransport, S: SharedStore> {
    tuning: Tuning,
    session: Session,
    rtt: RttTracker,
    board: LocalBoard,
    channel: ChannelManager<T>,
    identity: IdentityAcquirer,
    sync: SyncEngine,
    ownership: OwnershipTracker,
    creations: CreationQueue,
    allocator: IdAllocator,
    pending_saves: PendingSaves,
    hydration: HydrationSupervisor,
    store: S,
    renderer: Box<dyn Renderer + Send>,

    next_reconnect_at: Option<DateTime<Utc>>,
    last_sweep_at: Option<DateTime<Utc>>,
    options: ContextOptions,
}

impl<T: PortTransport, S: SharedStore> ContextEngine<T, S> {
    pub fn new(
        tuning: Tuning,
        transport: T,
        store: S,
        renderer: Box<dyn Renderer + Send>,
        options: ContextOptions,
    ) -> Self {
        let session = Session::new();
        let channel = ChannelManager::new(
            ChannelConfig::from_tuning(&tuning),
            transport,
            session.instance_id().to_string(),
        );
        let identity = IdentityAcquirer::new(
            FixedSchedule::new(tuning.identity_schedule()),
            tuning.identity_extended_interval(),
            tuning.identity_overall_timeout(),
            tuning.request_timeout(),
        );
        let hydration = HydrationSupervisor::new(
            tuning.hydration_wait(),
            tuning.hydration_poll_retries,
            tuning.hydration_poll_delay(),
            tuning.hydration_safety_timeout(),
        );
        let rtt = RttTracker::new(tuning.rtt_initial());
        let creations = CreationQueue::new(tuning.create_queue_limit);

        Self {
            session,
            rtt,
            board: LocalBoard::new(),
            channel,
            identity,
            sync: SyncEngine::new(),
            ownership: OwnershipTracker::new(),
            creations,
            allocator: IdAllocator::new(),
            pending_saves: PendingSaves::new(),
            hydration,
            store,
            renderer,
            next_reconnect_at: None,
            last_sweep_at: None,
            options,
            tuning,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn board(&self) -> &LocalBoard {
        &self.board
    }

    /// Whether this context currently owns `id` (local caches, adoption
    /// override, or identifier fragment, in that order).
    pub fn owns_window(&self, id: &WindowId, now: DateTime<Utc>) -> bool {
        self.ownership.owns_at(&self.session, id, now)
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydration.is_complete()
    }

    // ── Startup ─────────────────────────────────────────────────────

    /// Cold-start / resume orchestration: begin identity acquisition, attempt
    /// the first connect, and hydrate from the store.
    pub fn start_at(&mut self, now: DateTime<Utc>) {
        info!(
            instance_id = %self.session.instance_id(),
            resumed = self.options.resumed,
            "context starting"
        );

        if self.identity.begin(now) == IdentityAction::SendRequest {
            self.send_identity_request(now);
        }
        self.try_connect(now);

        self.hydration.begin(now);
        self.hydrate_from_store(now);
    }

    fn hydrate_from_store(&mut self, now: DateTime<Utc>) {
        match self.store.read() {
            Ok(record) => match evaluate_record(record.as_ref(), self.options.resumed) {
                HydrationOutcome::Replace { windows, revision, sequence_id } => {
                    self.session.reset_markers(revision, sequence_id);
                    self.apply_full_state(windows, now);
                    self.hydration.mark_complete(now);
                    self.release_deferred(now);
                }
                HydrationOutcome::Empty => {
                    self.hydration.mark_complete(now);
                    self.release_deferred(now);
                }
                HydrationOutcome::NeedsResync { reason } => {
                    self.request_recovery(reason, now);
                }
            },
            Err(e) => {
                // Notification wait and fallback polls take over from here.
                warn!(%e, "initial store read failed; deferring to polls");
            }
        }
    }

    // ── Store notifications ─────────────────────────────────────────

    pub fn handle_store_change(&mut self, record: BoardRecord, now: DateTime<Utc>) {
        let tolerance = self.tuning.tolerance_for_rtt(self.rtt.current());
        match self.sync.decide(&mut self.session, &record, tolerance, now) {
            SyncDecision::SelfWrite { .. } | SyncDecision::Duplicate => {}
            SyncDecision::Accept { windows, revision, sequence_id } => {
                debug!(revision, sequence_id, "applying remote board state");
                self.apply_full_state(windows, now);
                if !self.hydration.is_complete() {
                    self.hydration.mark_complete(now);
                    self.release_deferred(now);
                }
            }
            SyncDecision::Rejected { reason } => {
                warn!(?reason, "store notification rejected; requesting recovery");
                self.request_recovery(SyncReason::OrderingRejected, now);
            }
        }
    }

    /// Forward accepted state to the renderer as a single full replace.
    fn apply_full_state(&mut self, windows: Vec<QuickWindow>, now: DateTime<Utc>) {
        let removed = self.board.replace_all(windows);
        for id in removed {
            if self.ownership.is_live(&id) || self.ownership.is_minimized(&id) {
                self.renderer.destroy(&id);
            }
            self.ownership.note_destroyed(&id);
            self.session.note_disowned(&id);
        }

        let snapshot = self.board.snapshot();
        for window in snapshot {
            let should_render = self.should_render(&window, now);
            let id = window.id.clone();
            if should_render && !window.minimized {
                self.renderer.render(&window);
                self.ownership.note_rendered(id.clone());
                self.session.note_owned(id);
            } else if should_render {
                // Owned but minimized: tracked, not painted.
                if self.ownership.is_live(&id) {
                    self.renderer.destroy(&id);
                }
                self.ownership.note_minimized(id.clone());
                self.session.note_owned(id);
            } else {
                if self.ownership.is_live(&id) || self.ownership.is_minimized(&id) {
                    self.renderer.destroy(&id);
                }
                self.ownership.note_destroyed(&id);
                self.session.note_disowned(&id);
            }
        }
    }

    /// Render decision for one window in this context: an active adoption
    /// override wins; otherwise the record's owner field decides. Visibility
    /// lists apply either way.
    fn should_render(&self, window: &QuickWindow, now: DateTime<Utc>) -> bool {
        let Some(context_id) = self.session.context_id() else {
            return false;
        };
        if window.scope != self.options.scope {
            return false;
        }
        if !window.visibility.visible_to(context_id) {
            return false;
        }
        match self.ownership.active_adoption(&window.id, now) {
            Some(record) => record.new_owner == context_id,
            None => window.owner_context_id == Some(context_id),
        }
    }

    // ── Channel ─────────────────────────────────────────────────────

    fn try_connect(&mut self, now: DateTime<Utc>) {
        match self.channel.connect_at(now) {
            Ok(ConnectOutcome::Ready { restarted, .. }) => {
                self.session.set_connection(ConnectionHealth::Ready);
                self.next_reconnect_at = None;
                if self.identity.on_channel_ready(now) == IdentityAction::SendRequest {
                    self.send_identity_request(now);
                }
                if restarted {
                    self.request_recovery(SyncReason::CoordinatorRestart, now);
                    self.renotify_inflight(now);
                }
            }
            Ok(ConnectOutcome::Failed { reason, circuit_opened }) => {
                self.session.set_connection(ConnectionHealth::Offline);
                if circuit_opened {
                    error!(%reason, "coordinator channel circuit open");
                }
                let delay = self.channel.jittered_reconnect_delay();
                self.next_reconnect_at =
                    Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            }
            Err(ChannelError::CircuitOpen { until }) => {
                self.next_reconnect_at = Some(until);
            }
        }
    }

    fn handle_channel_event(&mut self, event: ChannelEvent, now: DateTime<Utc>) {
        match event {
            ChannelEvent::Message(message) => self.handle_channel_message(message, now),
            ChannelEvent::HeartbeatAck { generation_changed, rtt, previous } => {
                self.rtt.record(self.tuning.clamp_rtt(rtt));
                if generation_changed {
                    warn!(?previous, "coordinator restarted silently; recovering");
                    self.request_recovery(SyncReason::CoordinatorRestart, now);
                }
            }
            ChannelEvent::Disconnected { reason } => {
                debug!(%reason, "channel dropped; scheduling reconnect");
                self.session.set_connection(ConnectionHealth::Offline);
                let delay = self.channel.jittered_reconnect_delay();
                self.next_reconnect_at =
                    Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            }
        }
    }

    fn handle_channel_message(&mut self, message: PortMessage, now: DateTime<Utc>) {
        match message {
            PortMessage::ContextIdAssigned { context_id } => {
                self.session.set_context_id(context_id);
                self.channel.set_context_id(context_id);
                self.identity.on_assigned(context_id);
                // Ownership may have been undecidable before identity arrived.
                let snapshot = self.board.snapshot();
                if !snapshot.is_empty() {
                    self.apply_full_state(snapshot, now);
                }
            }

            PortMessage::StateSnapshot { record } => {
                if record.verify_checksum().is_err() {
                    error!("coordinator snapshot failed checksum verification; ignoring");
                    return;
                }
                info!(revision = record.revision, "applying coordinator snapshot");
                self.sync.reset_to_snapshot(&mut self.session, &record, now);
                self.apply_full_state(record.windows, now);
                self.hydration.mark_complete(now);
                self.release_deferred(now);
            }

            PortMessage::WindowCreated { save_id, revision } => {
                if self.pending_saves.resolve(&save_id, revision).is_none() {
                    debug!(%save_id, "ack for an unknown or already-settled save");
                }
            }

            PortMessage::AdoptionCompleted { window_id, previous_owner, new_owner } => {
                let ttl = self.tuning.adoption_ttl_for_rtt(self.rtt.current());
                self.ownership.on_adoption_completed(window_id.clone(), new_owner, ttl, now);
                self.board.set_owner(&window_id, Some(new_owner));
                self.reevaluate_window(&window_id, now);
                debug!(%window_id, ?previous_owner, new_owner, "adoption applied");
            }

            PortMessage::Error { code, message, retryable } => {
                if code == CODE_COORDINATOR_NOT_READY && !self.identity.is_settled() {
                    let class =
                        if retryable { FailureClass::Retryable } else { FailureClass::Terminal };
                    self.identity.on_failure(class, now);
                } else {
                    warn!(%code, %message, retryable, "coordinator reported an error");
                }
            }

            other => {
                warn!(?other, "unexpected message on coordinator channel");
            }
        }
    }

    /// Re-render or tear down one window after its ownership changed.
    fn reevaluate_window(&mut self, id: &WindowId, now: DateTime<Utc>) {
        let Some(window) = self.board.get(id).cloned() else {
            return;
        };
        if self.should_render(&window, now) && !window.minimized {
            if !self.ownership.is_live(id) {
                self.renderer.render(&window);
            }
            self.ownership.note_rendered(id.clone());
            self.session.note_owned(id.clone());
        } else {
            if self.ownership.is_live(id) {
                self.renderer.destroy(id);
            }
            self.ownership.note_destroyed(id);
            self.session.note_disowned(id);
        }
    }

    fn request_recovery(&mut self, reason: SyncReason, now: DateTime<Utc>) {
        self.channel.send(PortMessage::RequestFullStateSync { reason }, now);
    }

    /// A restarted coordinator lost our un-acked notifies; send them again.
    /// Creation is idempotent on the coordinator side (keyed by window id).
    fn renotify_inflight(&mut self, now: DateTime<Utc>) {
        for (save_id, window_id) in self.pending_saves.inflight_list() {
            if let Some(window) = self.board.get(&window_id).cloned() {
                debug!(%save_id, %window_id, "re-notifying in-flight creation after restart");
                self.channel.send(PortMessage::CreateWindow { window, save_id }, now);
            }
        }
    }

    fn send_identity_request(&mut self, now: DateTime<Utc>) {
        self.channel.send(
            PortMessage::AcquireContextId {
                instance_id: self.session.instance_id().to_string(),
            },
            now,
        );
    }

    // ── UI events ───────────────────────────────────────────────────

    pub fn handle_ui_event(&mut self, event: UiEvent, now: DateTime<Utc>) {
        match event {
            UiEvent::CreateRequested { url, title } => {
                let position = self.renderer.pointer_position().unwrap_or(DEFAULT_SPAWN_OFFSET);
                let spec = WindowSpec {
                    url,
                    title,
                    position,
                    size: DEFAULT_WINDOW_SIZE,
                    pin_target: quicktab_common::types::PinTarget::Screen,
                    scope: None,
                    session_only: false,
                    visibility: VisibilitySet::default(),
                };
                // Fire-and-forget: the UI gets failures via notices.
                let (tx, _rx) = oneshot::channel();
                self.submit_create(spec, tx, now);
            }

            UiEvent::AdoptRequested { window_id, new_owner_context_id } => {
                match self.ownership.require_owned_at(&self.session, &window_id, now) {
                    Ok(()) => {
                        self.channel.send(
                            PortMessage::RequestAdoption {
                                window_id,
                                new_owner_context_id,
                            },
                            now,
                        );
                    }
                    Err(denied) => {
                        warn!(%denied, "adoption request filtered");
                        self.renderer.show_notice(
                            "That window belongs to another tab",
                            NoticeKind::Warning,
                        );
                    }
                }
            }

            UiEvent::CloseRequested { window_id } => {
                match self.ownership.require_owned_at(&self.session, &window_id, now) {
                    Ok(()) => {
                        if self.board.remove(&window_id).is_some() {
                            self.renderer.destroy(&window_id);
                            self.ownership.note_destroyed(&window_id);
                            self.session.note_disowned(&window_id);
                            self.write_board(now);
                        }
                    }
                    Err(denied) => warn!(%denied, "close request filtered"),
                }
            }

            UiEvent::MinimizeToggled { window_id } => {
                if self.ownership.require_owned_at(&self.session, &window_id, now).is_err() {
                    warn!(%window_id, "minimize toggle filtered: not owned here");
                    return;
                }
                let Some(window) = self.board.get(&window_id).cloned() else { return };
                if window.minimized && !self.hydration.gate_open_at(now) {
                    // Restores need consistent state; park until hydrated.
                    self.hydration.defer(DeferredOp::Restore { window_id });
                    return;
                }
                self.toggle_minimized(&window_id, now);
            }
        }
    }

    fn toggle_minimized(&mut self, window_id: &WindowId, now: DateTime<Utc>) {
        let Some(window) = self.board.get(window_id).cloned() else { return };
        let minimized = !window.minimized;
        self.board.set_minimized(window_id, minimized);
        if minimized {
            self.renderer.destroy(window_id);
            self.ownership.note_minimized(window_id.clone());
        } else if let Some(updated) = self.board.get(window_id).cloned() {
            self.renderer.render(&updated);
            self.ownership.note_rendered(window_id.clone());
        }
        self.write_board(now);
    }

    /// Persist the current board and register the write for self-write
    /// suppression.
    fn write_board(&mut self, now: DateTime<Utc>) -> Option<String> {
        let (record, attribution) = self.board.next_record(&self.session, now);
        if let Err(e) = self.store.write(&record) {
            warn!(%e, "shared-store write failed");
            self.renderer.show_notice("Could not save windows", NoticeKind::Error);
            return None;
        }
        self.sync.note_local_write(&mut self.session, &record, now);
        Some(attribution.save_id)
    }

    // ── Creation ────────────────────────────────────────────────────

    pub fn submit_create(&mut self, spec: WindowSpec, reply: CreateReply, now: DateTime<Utc>) {
        let pending = PendingCreate { spec, enqueued_at: now, reply };
        if !self.hydration.gate_open_at(now) {
            debug!("creation deferred until hydration completes");
            self.hydration.defer(DeferredOp::Create(pending));
            return;
        }
        self.creations.enqueue(pending);
        self.drain_creations(now);
    }

    /// Drain queued creations strictly in FIFO order. Each item finishes its
    /// local-apply and coordinator-notify steps before the next starts.
    fn drain_creations(&mut self, now: DateTime<Utc>) {
        if !self.hydration.gate_open_at(now) {
            return;
        }
        while let Some(pending) = self.creations.pop() {
            self.process_create(pending, now);
        }
    }

    fn process_create(&mut self, pending: PendingCreate, now: DateTime<Utc>) {
        if let Err(e) = crate::create::validate_window_url(&pending.spec.url) {
            self.renderer.show_notice("That link cannot be opened here", NoticeKind::Warning);
            let _ = pending.reply.send(Err(e));
            return;
        }

        let context_id = self.session.context_id();
        if context_id.is_none() {
            warn!("creating window in degraded mode; ownership left unset");
        }

        let id = match self.allocator.allocate(context_id, self.tuning.create_suffix_retries) {
            Ok(id) => id,
            Err(e) => {
                self.renderer.show_notice("Could not create window", NoticeKind::Error);
                let _ = pending.reply.send(Err(e));
                return;
            }
        };

        let spec = pending.spec;
        let window = QuickWindow {
            id: id.clone(),
            url: spec.url,
            title: spec.title,
            position: WindowPosition { x: spec.position.0, y: spec.position.1 },
            size: WindowSize { width: spec.size.0, height: spec.size.1 },
            owner_context_id: context_id,
            minimized: false,
            pin_target: spec.pin_target,
            // New windows live in their creating context's scope unless the
            // UI asked for one explicitly.
            scope: spec.scope.or_else(|| self.options.scope.clone()),
            session_only: spec.session_only,
            visibility: spec.visibility,
        };

        // Local apply first: the UI never waits on a round trip.
        self.renderer.render(&window);
        self.ownership.note_rendered(id.clone());
        self.session.note_owned(id.clone());
        self.board.upsert(window.clone());

        let Some(save_id) = self.write_board(now) else {
            let _ = pending
                .reply
                .send(Err(CreateError::NotifyFailed("shared-store write failed".to_string())));
            return;
        };

        self.pending_saves.insert(
            save_id.clone(),
            PendingAck { window_id: id, sent_at: now, reply: pending.reply },
        );
        self.channel.send(PortMessage::CreateWindow { window, save_id }, now);
    }

    // ── Tick ────────────────────────────────────────────────────────

    pub fn tick(&mut self, now: DateTime<Utc>) {
        // Heartbeat and grace-reset timers.
        match self.channel.tick_at(now) {
            HeartbeatTick::SuspectedRestart => {
                self.session.set_connection(ConnectionHealth::Offline);
                self.next_reconnect_at = Some(now);
            }
            HeartbeatTick::TimedOut { missed } => {
                debug!(missed, "heartbeat timed out");
            }
            HeartbeatTick::Sent | HeartbeatTick::Idle => {}
        }

        // Reconnection.
        if !self.channel.is_ready() {
            let due = self.next_reconnect_at.is_none_or(|at| now >= at);
            if due {
                self.try_connect(now);
            }
        }

        // Drain incoming channel traffic, bounded per tick.
        for _ in 0..MAX_INCOMING_PER_TICK {
            match self.channel.poll_incoming(now) {
                Ok(Some(event)) => self.handle_channel_event(event, now),
                Ok(None) => break,
                Err(e) => {
                    warn!(%e, "error polling coordinator channel");
                    break;
                }
            }
        }

        // Identity schedule.
        match self.identity.poll_at(now) {
            IdentityAction::SendRequest => self.send_identity_request(now),
            IdentityAction::Degrade | IdentityAction::Idle => {}
        }

        // Hydration fallback polls.
        match self.hydration.poll_at(now) {
            PollAction::Poll => self.hydrate_from_store(now),
            PollAction::GiveUp => self.request_recovery(SyncReason::ColdStart, now),
            PollAction::Wait => {}
        }

        // Adoption sweep.
        let sweep_due = self
            .last_sweep_at
            .map(|at| {
                (now - at).to_std().unwrap_or_default() >= self.tuning.adoption_sweep_interval()
            })
            .unwrap_or(true);
        if sweep_due {
            self.ownership.sweep_at(now);
            self.last_sweep_at = Some(now);
        }

        // In-flight creation acks that timed out.
        let timed_out = self.pending_saves.sweep_timeouts_at(now, self.tuning.request_timeout());
        for window_id in timed_out {
            self.renderer.show_notice("Window not saved to other tabs yet", NoticeKind::Warning);
            debug!(%window_id, "creation ack timed out");
        }

        // Deferred operations and queued creations.
        self.release_deferred(now);
        self.drain_creations(now);
    }

    fn release_deferred(&mut self, now: DateTime<Utc>) {
        for op in self.hydration.take_ready_at(now) {
            match op {
                DeferredOp::Create(pending) => self.creations.enqueue(pending),
                DeferredOp::Restore { window_id } => {
                    if self.board.get(&window_id).map(|w| w.minimized).unwrap_or(false) {
                        self.toggle_minimized(&window_id, now);
                    }
                }
            }
        }
    }

    // ── Teardown ────────────────────────────────────────────────────

    fn teardown(&mut self) {
        info!("context tearing down");
        self.creations.cancel_all();
        self.channel.disconnect("page teardown");
    }

    // ── Async shell ─────────────────────────────────────────────────

    /// Run the event loop until shutdown. `store_changes` is the shared
    /// store's notification stream.
    pub async fn run(
        mut self,
        mut inbox: ContextInbox,
        mut store_changes: mpsc::UnboundedReceiver<BoardRecord>,
    ) -> Result<()> {
        self.start_at(Utc::now());

        let mut tick = tokio::time::interval(self.tuning.tick_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut inbox.shutdown => break,
                Some(record) = store_changes.recv() => {
                    self.handle_store_change(record, Utc::now());
                }
                Some(event) = inbox.ui.recv() => {
                    self.handle_ui_event(event, Utc::now());
                }
                Some((spec, reply)) = inbox.create.recv() => {
                    self.submit_create(spec, reply, Utc::now());
                }
                _ = tick.tick() => {
                    self.tick(Utc::now());
                }
            }
        }

        self.teardown();
        Ok(())
    }
}
