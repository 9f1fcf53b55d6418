// End-to-end protocol scenarios: several contexts converging through a
// shared in-memory store and a loopback coordinator, driven with injected
// clocks and manual notification pumping so every interleaving is exact.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;

use quicktab_common::record::BoardRecord;
use quicktab_common::types::{NoticeKind, PinTarget, QuickWindow, VisibilitySet};
use quicktab_common::window_id::WindowId;
use quicktab_context::config::Tuning;
use quicktab_context::create::WindowSpec;
use quicktab_context::render::{RecordingRenderer, Renderer, UiEvent};
use quicktab_context::runtime::{ContextEngine, ContextOptions};
use quicktab_context::store::{MemoryStore, SharedStore};
use quicktab_coordinator::{Coordinator, LoopbackTransport};

// ── Harness ─────────────────────────────────────────────────────────

/// Renderer that shares its recording with the test body.
#[derive(Clone, Default)]
struct SharedRenderer {
    inner: Arc<Mutex<RecordingRenderer>>,
}

impl SharedRenderer {
    fn rendered_ids(&self) -> Vec<WindowId> {
        self.inner.lock().unwrap().rendered_ids()
    }

    fn rendered_count(&self) -> usize {
        self.inner.lock().unwrap().rendered.len()
    }

    fn destroyed(&self) -> Vec<WindowId> {
        self.inner.lock().unwrap().destroyed.clone()
    }

    fn notices(&self) -> Vec<(String, NoticeKind)> {
        self.inner.lock().unwrap().notices.clone()
    }
}

impl Renderer for SharedRenderer {
    fn render(&mut self, window: &QuickWindow) {
        self.inner.lock().unwrap().render(window);
    }

    fn destroy(&mut self, id: &WindowId) {
        self.inner.lock().unwrap().destroy(id);
    }

    fn show_notice(&mut self, message: &str, kind: NoticeKind) {
        self.inner.lock().unwrap().show_notice(message, kind);
    }

    fn pointer_position(&self) -> Option<(f64, f64)> {
        self.inner.lock().unwrap().pointer_position()
    }
}

struct TestContext {
    engine: ContextEngine<LoopbackTransport, MemoryStore>,
    renderer: SharedRenderer,
    store_rx: UnboundedReceiver<BoardRecord>,
}

impl TestContext {
    fn start(coordinator: &Coordinator, store: &MemoryStore, now: DateTime<Utc>) -> Self {
        let renderer = SharedRenderer::default();
        let store_rx = store.subscribe();
        let mut engine = ContextEngine::new(
            Tuning::default(),
            coordinator.transport(),
            store.clone(),
            Box::new(renderer.clone()),
            ContextOptions::default(),
        );
        engine.start_at(now);
        // Drain the identity assignment queued during the handshake.
        engine.tick(now);
        Self { engine, renderer, store_rx }
    }

    /// Deliver queued store notifications to this context.
    fn pump_store(&mut self, now: DateTime<Utc>) {
        while let Ok(record) = self.store_rx.try_recv() {
            self.engine.handle_store_change(record, now);
        }
    }

    fn create(
        &mut self,
        url: &str,
        now: DateTime<Utc>,
    ) -> oneshot::Receiver<Result<quicktab_context::create::CreateCommit, quicktab_context::create::CreateError>>
    {
        let (tx, rx) = oneshot::channel();
        let spec = WindowSpec {
            url: url.to_string(),
            title: "test window".to_string(),
            position: (40.0, 40.0),
            size: (420.0, 320.0),
            pin_target: PinTarget::Screen,
            scope: None,
            session_only: false,
            visibility: VisibilitySet::default(),
        };
        self.engine.submit_create(spec, tx, now);
        rx
    }
}

fn t0() -> DateTime<Utc> {
    init_tracing();
    DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp")
}

/// RUST_LOG=debug makes interleaving failures readable.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── End-to-end create / accept / adopt ──────────────────────────────

#[test]
fn create_propagates_and_adoption_moves_ownership() {
    let coordinator = Coordinator::new();
    let store = MemoryStore::new();
    let now = t0();

    let mut a = TestContext::start(&coordinator, &store, now);
    let mut b = TestContext::start(&coordinator, &store, now);
    let mut c = TestContext::start(&coordinator, &store, now);

    let ctx_a = a.engine.session().context_id().expect("a acquired identity");
    let ctx_c = c.engine.session().context_id().expect("c acquired identity");
    assert_ne!(ctx_a, ctx_c);

    // Context A creates a window: applied locally first.
    let t1 = now + ChronoDuration::seconds(1);
    let _rx = a.create("https://example.com/article", t1);
    assert_eq!(a.renderer.rendered_count(), 1);
    let window_id = a.renderer.rendered_ids()[0].clone();
    assert_eq!(window_id.creator_context(), ctx_a);

    // The store notification reaches everyone, including the writer.
    a.pump_store(t1);
    b.pump_store(t1);
    c.pump_store(t1);

    // Self-write suppressed: A rendered exactly once.
    assert_eq!(a.renderer.rendered_count(), 1);
    // B and C accepted the state into their boards but do not paint a window
    // owned elsewhere.
    assert_eq!(b.engine.board().len(), 1);
    assert_eq!(c.engine.board().len(), 1);
    assert_eq!(b.renderer.rendered_count(), 0);
    assert!(a.engine.owns_window(&window_id, t1));
    assert!(!b.engine.owns_window(&window_id, t1));

    // A adopts the window over to C.
    let t2 = t1 + ChronoDuration::seconds(1);
    a.engine.handle_ui_event(
        UiEvent::AdoptRequested { window_id: window_id.clone(), new_owner_context_id: ctx_c },
        t2,
    );

    // The coordinator broadcast lands on every channel.
    a.engine.tick(t2);
    b.engine.tick(t2);
    c.engine.tick(t2);

    assert!(c.engine.owns_window(&window_id, t2), "new owner takes over immediately");
    assert!(!a.engine.owns_window(&window_id, t2), "previous owner released");
    assert!(!b.engine.owns_window(&window_id, t2));

    // A tore its rendering down; C painted it.
    assert!(a.renderer.destroyed().contains(&window_id));
    assert_eq!(c.renderer.rendered_count(), 1);
    assert_eq!(coordinator.owner_of(&window_id), Some(ctx_c));
}

#[test]
fn creation_ack_commits_the_request() {
    let coordinator = Coordinator::new();
    let store = MemoryStore::new();
    let now = t0();

    let mut a = TestContext::start(&coordinator, &store, now);
    let mut rx = a.create("https://example.com", now);

    // The ack arrives over the channel on the next tick.
    a.engine.tick(now);
    let commit = rx
        .try_recv()
        .expect("reply delivered")
        .expect("creation committed");
    assert_eq!(commit.window_id.creator_context(), a.engine.session().context_id().unwrap());
    assert_eq!(coordinator.window_count(), 1);
}

#[test]
fn cross_context_adoption_request_is_filtered() {
    let coordinator = Coordinator::new();
    let store = MemoryStore::new();
    let now = t0();

    let mut a = TestContext::start(&coordinator, &store, now);
    let mut b = TestContext::start(&coordinator, &store, now);

    let t1 = now + ChronoDuration::seconds(1);
    let _ = a.create("https://example.com", t1);
    a.pump_store(t1);
    b.pump_store(t1);
    let window_id = a.renderer.rendered_ids()[0].clone();

    // B does not own the window; its adoption request short-circuits with a
    // notice instead of reaching the coordinator.
    b.engine.handle_ui_event(
        UiEvent::AdoptRequested { window_id: window_id.clone(), new_owner_context_id: 9 },
        t1,
    );
    assert_eq!(b.renderer.notices().len(), 1);
    assert_eq!(coordinator.owner_of(&window_id), a.engine.session().context_id());
}

// ── Hydration ───────────────────────────────────────────────────────

#[test]
fn checksum_mismatch_on_hydration_forces_coordinator_resync() {
    let coordinator = Coordinator::new();
    let store = MemoryStore::new();
    let now = t0();

    // Seed the coordinator with one persisted window.
    let mut seeder = TestContext::start(&coordinator, &store, now);
    let _ = seeder.create("https://example.com/good", now);
    seeder.pump_store(now);

    // Corrupt the stored record (simulated truncated read).
    let mut corrupt = store.read().expect("read").expect("record");
    corrupt.windows.clear();
    store.seed(corrupt);

    // A fresh context hydrates, rejects the corrupt record, and recovers via
    // the coordinator snapshot instead.
    let late = TestContext::start(&coordinator, &store, now + ChronoDuration::seconds(2));
    assert!(late.engine.is_hydrated());
    assert_eq!(late.engine.board().len(), 1, "snapshot replaced the divergent local read");
}

#[test]
fn empty_store_hydrates_to_an_empty_board() {
    let coordinator = Coordinator::new();
    let store = MemoryStore::new();
    let a = TestContext::start(&coordinator, &store, t0());
    assert!(a.engine.is_hydrated());
    assert!(a.engine.board().is_empty());
}

// ── Coordinator restarts ────────────────────────────────────────────

#[test]
fn silent_restart_is_detected_and_recovered() {
    let coordinator = Coordinator::new();
    let store = MemoryStore::new();
    let now = t0();

    let mut a = TestContext::start(&coordinator, &store, now);
    let _ = a.create("https://example.com", now);
    a.pump_store(now);
    assert_eq!(coordinator.window_count(), 1);

    // The host silently restarts the coordinator.
    coordinator.restart();
    assert_eq!(coordinator.generation(), 2);

    // The next heartbeat attempt fails over the dead connection, the channel
    // reconnects, sees the new generation, and recovers full state.
    let later = now + ChronoDuration::seconds(20);
    a.engine.tick(later);

    assert_eq!(a.engine.session().last_revision(), 1);
    assert_eq!(a.engine.board().len(), 1);
}

// ── Degraded identity ───────────────────────────────────────────────

#[test]
fn unready_coordinator_degrades_identity_and_creates_unattributed() {
    let coordinator = Coordinator::new();
    coordinator.set_ready(false);
    let store = MemoryStore::new();
    let now = t0();

    let mut a = TestContext::start(&coordinator, &store, now);
    assert_eq!(a.engine.session().context_id(), None);

    // Walk far past the overall acquisition deadline.
    let mut clock = now;
    for _ in 0..12 {
        clock += ChronoDuration::seconds(5);
        a.engine.tick(clock);
    }
    assert_eq!(a.engine.session().context_id(), None);

    // Creation still works; the identifier carries the reserved fragment and
    // ownership stays unset.
    let _ = a.create("https://example.com", clock);
    let id = a.renderer.rendered_ids()[0].clone();
    assert!(id.is_unattributed());
    assert_eq!(a.engine.board().get(&id).unwrap().owner_context_id, None);
}
