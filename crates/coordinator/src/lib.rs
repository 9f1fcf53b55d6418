// quicktab-coordinator: the coordinator contract, in memory.
//
// This crate implements the port protocol's coordinator side (identity
// allocation, the generation counter, snapshot persistence, adoption
// routing) the way the contexts expect it to behave, without prescribing a
// persistence engine. It doubles as the harness the context integration
// tests run against: `restart()` simulates the host silently killing and
// relaunching the process, and `set_ready(false)` simulates the
// slow-starting window that identity acquisition must survive.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use chrono::Utc;
use tracing::{debug, info};

use quicktab_common::protocol::port::{
    PortEnvelope, PortMessage, CODE_COORDINATOR_NOT_READY, CODE_WINDOW_NOT_FOUND,
};
use quicktab_common::record::{compute_checksum, BoardRecord};
use quicktab_common::types::QuickWindow;
use quicktab_common::window_id::WindowId;
use quicktab_context::channel::{PortTransport, TryRecv};

/// First context id handed out. Zero is reserved for unattributed writes.
const FIRST_CONTEXT_ID: u32 = 1;

#[derive(Debug)]
struct ConnState {
    epoch: u64,
    out_seq: u64,
    queue: VecDeque<PortEnvelope>,
}

#[derive(Debug)]
struct CoordState {
    generation: u64,
    /// Bumped on restart; connections from an older epoch are dead.
    epoch: u64,
    ready: bool,
    next_context_id: u32,
    windows: BTreeMap<WindowId, QuickWindow>,
    revision: u64,
    sequence: u64,
    next_conn_id: u64,
    conns: HashMap<u64, ConnState>,
}

impl CoordState {
    fn reply(&mut self, conn_id: u64, message: PortMessage) {
        if let Some(conn) = self.conns.get_mut(&conn_id) {
            let envelope = PortEnvelope::new(conn.out_seq, message);
            conn.out_seq += 1;
            conn.queue.push_back(envelope);
        }
    }

    fn broadcast(&mut self, message: PortMessage) {
        let conn_ids: Vec<u64> = self.conns.keys().copied().collect();
        for conn_id in conn_ids {
            self.reply(conn_id, message.clone());
        }
    }

    fn snapshot_record(&self) -> BoardRecord {
        let windows: Vec<QuickWindow> = self.windows.values().cloned().collect();
        BoardRecord {
            checksum: compute_checksum(&windows),
            windows,
            revision: self.revision,
            sequence_id: self.sequence,
            timestamp_ms: Utc::now().timestamp_millis(),
            save_id: format!("coordinator-snapshot-{}", self.revision),
            writing_context_id: None,
            writing_instance_id: None,
            transaction_id: None,
        }
    }

    fn not_ready_error(&mut self, conn_id: u64) {
        self.reply(
            conn_id,
            PortMessage::Error {
                code: CODE_COORDINATOR_NOT_READY.to_string(),
                message: "coordinator is still initializing".to_string(),
                retryable: true,
            },
        );
    }

    fn handle(&mut self, conn_id: u64, message: PortMessage) {
        match message {
            PortMessage::InitRequest { context_id, instance_id } => {
                debug!(conn_id, ?context_id, %instance_id, "init request");
                if !self.ready {
                    self.not_ready_error(conn_id);
                    return;
                }
                let generation = self.generation;
                self.reply(conn_id, PortMessage::InitResponse { generation });
            }

            PortMessage::InitComplete { ack_generation } => {
                debug!(conn_id, ack_generation, "handshake complete");
            }

            PortMessage::Heartbeat { last_known_generation } => {
                let generation = self.generation;
                if last_known_generation != generation {
                    debug!(
                        conn_id,
                        last_known_generation, generation, "heartbeat from a stale generation"
                    );
                }
                self.reply(conn_id, PortMessage::HeartbeatAck { generation });
            }

            PortMessage::AcquireContextId { instance_id } => {
                if !self.ready {
                    self.not_ready_error(conn_id);
                    return;
                }
                let context_id = self.next_context_id;
                self.next_context_id += 1;
                info!(conn_id, %instance_id, context_id, "context id assigned");
                self.reply(conn_id, PortMessage::ContextIdAssigned { context_id });
            }

            PortMessage::RequestFullStateSync { reason } => {
                debug!(conn_id, ?reason, "full state sync requested");
                let record = self.snapshot_record();
                self.reply(conn_id, PortMessage::StateSnapshot { record });
            }

            PortMessage::CreateWindow { window, save_id } => {
                self.revision += 1;
                self.sequence += 1;
                let revision = self.revision;
                debug!(conn_id, window_id = %window.id, %save_id, revision, "window persisted");
                self.windows.insert(window.id.clone(), window);
                self.reply(conn_id, PortMessage::WindowCreated { save_id, revision });
            }

            PortMessage::RequestAdoption { window_id, new_owner_context_id } => {
                if !self.windows.contains_key(&window_id) {
                    self.reply(
                        conn_id,
                        PortMessage::Error {
                            code: CODE_WINDOW_NOT_FOUND.to_string(),
                            message: format!("no window {window_id}"),
                            retryable: false,
                        },
                    );
                    return;
                }
                let mut previous_owner = None;
                if let Some(window) = self.windows.get_mut(&window_id) {
                    previous_owner = window.owner_context_id;
                    window.owner_context_id = Some(new_owner_context_id);
                }
                self.revision += 1;
                self.sequence += 1;
                info!(
                    %window_id,
                    ?previous_owner,
                    new_owner = new_owner_context_id,
                    "adoption committed"
                );
                self.broadcast(PortMessage::AdoptionCompleted {
                    window_id,
                    previous_owner,
                    new_owner: new_owner_context_id,
                });
            }

            other => {
                self.reply(
                    conn_id,
                    PortMessage::Error {
                        code: "UNEXPECTED_MESSAGE".to_string(),
                        message: format!("coordinator cannot handle {other:?}"),
                        retryable: false,
                    },
                );
            }
        }
    }
}

/// Shared in-memory coordinator.
#[derive(Clone)]
pub struct Coordinator {
    state: Arc<Mutex<CoordState>>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CoordState {
                generation: 1,
                epoch: 1,
                ready: true,
                next_context_id: FIRST_CONTEXT_ID,
                windows: BTreeMap::new(),
                revision: 0,
                sequence: 0,
                next_conn_id: 1,
                conns: HashMap::new(),
            })),
        }
    }

    /// Simulate a slow start: requests get `COORDINATOR_NOT_READY` until
    /// `set_ready(true)`.
    pub fn set_ready(&self, ready: bool) {
        self.lock().ready = ready;
    }

    /// Simulate the host silently killing and relaunching the process:
    /// the generation increments and every open connection dies. Persisted
    /// windows survive, as the contexts' contract expects.
    pub fn restart(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.epoch += 1;
        state.conns.clear();
        info!(generation = state.generation, "coordinator restarted");
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn window_count(&self) -> usize {
        self.lock().windows.len()
    }

    pub fn owner_of(&self, id: &WindowId) -> Option<u32> {
        self.lock().windows.get(id).and_then(|w| w.owner_context_id)
    }

    /// Open a loopback transport to this coordinator.
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport { state: Arc::clone(&self.state), conn_id: None, epoch: 0 }
    }

    fn lock(&self) -> MutexGuard<'_, CoordState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// In-process `PortTransport` backed directly by a `Coordinator`.
pub struct LoopbackTransport {
    state: Arc<Mutex<CoordState>>,
    conn_id: Option<u64>,
    epoch: u64,
}

impl LoopbackTransport {
    fn lock(&self) -> MutexGuard<'_, CoordState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_alive(&self, state: &CoordState) -> Result<u64> {
        let conn_id = self.conn_id.ok_or_else(|| anyhow!("transport not connected"))?;
        if self.epoch != state.epoch || !state.conns.contains_key(&conn_id) {
            return Err(anyhow!("coordinator restarted; connection lost"));
        }
        Ok(conn_id)
    }
}

impl PortTransport for LoopbackTransport {
    fn connect(&mut self) -> Result<()> {
        let mut state = self.lock();
        let conn_id = state.next_conn_id;
        state.next_conn_id += 1;
        let epoch = state.epoch;
        state
            .conns
            .insert(conn_id, ConnState { epoch, out_seq: 0, queue: VecDeque::new() });
        drop(state);
        self.conn_id = Some(conn_id);
        self.epoch = epoch;
        Ok(())
    }

    fn send(&mut self, envelope: &PortEnvelope) -> Result<()> {
        let mut state = self.lock();
        let conn_id = self.check_alive(&state)?;
        state.handle(conn_id, envelope.message.clone());
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<PortEnvelope>> {
        let mut state = self.lock();
        let conn_id = self.check_alive(&state)?;
        Ok(state.conns.get_mut(&conn_id).and_then(|conn| conn.queue.pop_front()))
    }

    fn try_recv(&mut self) -> Result<TryRecv> {
        let mut state = self.lock();
        let Some(conn_id) = self.conn_id else {
            return Ok(TryRecv::Closed);
        };
        if self.epoch != state.epoch || !state.conns.contains_key(&conn_id) {
            return Ok(TryRecv::Closed);
        }
        match state.conns.get_mut(&conn_id).and_then(|conn| conn.queue.pop_front()) {
            Some(envelope) => Ok(TryRecv::Message(envelope)),
            None => Ok(TryRecv::Empty),
        }
    }

    fn close(&mut self) {
        if let Some(conn_id) = self.conn_id.take() {
            self.lock().conns.remove(&conn_id);
        }
    }
}
