// Coordinator channel: reconnecting point-to-point connection manager.
//
// The coordinator process can be silently killed and restarted by its host at
// any time, so the channel runs a three-phase handshake that carries the
// coordinator's generation counter, a fixed-interval heartbeat that spots
// generation changes without a disconnect event, and a circuit breaker over
// reconnection attempts.
//
// State machine:
//   DISCONNECTED → CONNECTING → CONNECTED → READY
//   READY → DISCONNECTED        (transport failure, heartbeat misses)
//   DISCONNECTED → CIRCUIT_OPEN (after N consecutive failed attempts)
//   CIRCUIT_OPEN → READY        (successful connect after the cooldown)
//
// Transport is abstracted via `PortTransport` for testability, mirroring how
// the rest of the engine treats the shared store.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use quicktab_common::protocol::port::{PortEnvelope, PortMessage};

use crate::config::Tuning;
use crate::retry::RetryPolicy;

// ── Transport trait ─────────────────────────────────────────────────

/// Non-blocking receive result for the event loop.
#[derive(Debug)]
pub enum TryRecv {
    Message(PortEnvelope),
    Empty,
    Closed,
}

/// Abstraction over the point-to-point channel to the coordinator.
///
/// `recv` blocks and is used only during the handshake; the event loop drains
/// messages through `try_recv`.
pub trait PortTransport {
    fn connect(&mut self) -> Result<()>;
    fn send(&mut self, envelope: &PortEnvelope) -> Result<()>;
    fn recv(&mut self) -> Result<Option<PortEnvelope>>;
    fn try_recv(&mut self) -> Result<TryRecv>;
    fn close(&mut self);
}

// ── Configuration ───────────────────────────────────────────────────

/// Channel timings, extracted from the engine-wide tuning.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_miss_threshold: u32,
    pub request_timeout: Duration,
    pub circuit_failure_threshold: u32,
    pub circuit_grace: Duration,
    pub pending_buffer_limit: usize,
}

impl ChannelConfig {
    pub fn from_tuning(tuning: &Tuning) -> Self {
        Self {
            heartbeat_interval: tuning.heartbeat_interval(),
            heartbeat_miss_threshold: tuning.heartbeat_miss_threshold,
            request_timeout: tuning.request_timeout(),
            circuit_failure_threshold: tuning.circuit_failure_threshold,
            circuit_grace: tuning.circuit_grace(),
            pending_buffer_limit: tuning.pending_buffer_limit,
        }
    }
}

// ── States and events ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Ready,
    /// Circuit broken after too many consecutive failures. Exited only by a
    /// successful connection (or page reload, which discards the manager).
    CircuitOpen,
}

/// Result of a connection attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectOutcome {
    Ready {
        generation: u64,
        /// The coordinator's generation differs from the last one seen: it
        /// restarted while we were away. The caller must trigger full-state
        /// recovery.
        restarted: bool,
    },
    Failed {
        reason: String,
        circuit_opened: bool,
    },
}

/// Incoming activity surfaced to the runtime.
#[derive(Debug, PartialEq)]
pub enum ChannelEvent {
    /// An application-level message (snapshot, acks, adoption, errors).
    Message(PortMessage),
    /// A heartbeat completed its round trip.
    HeartbeatAck {
        generation_changed: bool,
        previous: Option<u64>,
        rtt: Duration,
    },
    /// The transport dropped; the caller schedules a reconnect.
    Disconnected { reason: String },
}

/// Result of a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatTick {
    Idle,
    Sent,
    TimedOut { missed: u32 },
    /// Consecutive misses reached the threshold; the channel marked itself
    /// disconnected and the caller must reconnect and run recovery.
    SuspectedRestart,
}

/// What happened to an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Channel not ready; buffered for the next flush.
    Buffered,
    /// Buffer was full; the oldest pending message was dropped to make room.
    DroppedOldest,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("circuit open until {until}; reconnection refused")]
    CircuitOpen { until: DateTime<Utc> },
}

#[derive(Debug)]
struct PendingMessage {
    message: PortMessage,
    enqueued_at: DateTime<Utc>,
}

// ── Channel manager ─────────────────────────────────────────────────

pub struct ChannelManager<T: PortTransport> {
    config: ChannelConfig,
    reconnect_policy: RetryPolicy,
    transport: T,
    instance_id: String,
    context_id: Option<u32>,

    state: ChannelState,
    generation: Option<u64>,

    outbound_seq: u64,
    last_incoming_seq: Option<u64>,
    pending: VecDeque<PendingMessage>,

    consecutive_failures: u32,
    circuit_opened_at: Option<DateTime<Utc>>,
    ready_since: Option<DateTime<Utc>>,

    heartbeat_sent_at: Option<DateTime<Utc>>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    heartbeat_missed: u32,
}

impl<T: PortTransport> ChannelManager<T> {
    pub fn new(config: ChannelConfig, transport: T, instance_id: impl Into<String>) -> Self {
        let reconnect_policy = RetryPolicy::default();
        Self {
            config,
            reconnect_policy,
            transport,
            instance_id: instance_id.into(),
            context_id: None,
            state: ChannelState::Disconnected,
            generation: None,
            outbound_seq: 0,
            last_incoming_seq: None,
            pending: VecDeque::new(),
            consecutive_failures: 0,
            circuit_opened_at: None,
            ready_since: None,
            heartbeat_sent_at: None,
            last_heartbeat_at: None,
            heartbeat_missed: 0,
        }
    }

    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ChannelState::Ready
    }

    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Identity becomes known after acquisition; subsequent handshakes carry
    /// it so the coordinator can correlate reconnects.
    pub fn set_context_id(&mut self, context_id: u32) {
        self.context_id = Some(context_id);
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Attempt to connect (or reconnect) and run the three-phase handshake.
    ///
    /// While the circuit is open, attempts before the cooldown elapses are
    /// refused with `ChannelError::CircuitOpen`.
    pub fn connect_at(&mut self, now: DateTime<Utc>) -> Result<ConnectOutcome, ChannelError> {
        if self.state == ChannelState::CircuitOpen {
            if let Some(opened_at) = self.circuit_opened_at {
                let until = opened_at
                    + chrono::Duration::from_std(self.config.circuit_grace).unwrap_or_default();
                if now < until {
                    return Err(ChannelError::CircuitOpen { until });
                }
            }
        }

        self.state = ChannelState::Connecting;

        if let Err(e) = self.transport.connect() {
            return Ok(self.fail_attempt(format!("transport connect failed: {e}"), now));
        }
        // Sequence numbering is per connection on the coordinator side.
        self.last_incoming_seq = None;

        // Phase 1: init request.
        let init = PortMessage::InitRequest {
            context_id: self.context_id,
            instance_id: self.instance_id.clone(),
        };
        if let Err(e) = self.send_raw(init) {
            return Ok(self.fail_attempt(format!("failed to send init request: {e}"), now));
        }

        // Phase 2: coordinator generation.
        let generation = match self.transport.recv() {
            Ok(Some(envelope)) => {
                self.check_incoming_seq(envelope.seq);
                match envelope.message {
                    PortMessage::InitResponse { generation } => generation,
                    PortMessage::Error { code, message, .. } => {
                        return Ok(self.fail_attempt(
                            format!("init rejected: {code}: {message}"),
                            now,
                        ));
                    }
                    other => {
                        return Ok(self.fail_attempt(
                            format!("unexpected handshake reply: {other:?}"),
                            now,
                        ));
                    }
                }
            }
            Ok(None) => {
                return Ok(self.fail_attempt("channel closed during handshake".to_string(), now));
            }
            Err(e) => {
                return Ok(self.fail_attempt(format!("handshake receive failed: {e}"), now));
            }
        };

        self.state = ChannelState::Connected;

        // Phase 3: completion ack; the channel is READY once this is out.
        if let Err(e) = self.send_raw(PortMessage::InitComplete { ack_generation: generation }) {
            return Ok(self.fail_attempt(format!("failed to send init complete: {e}"), now));
        }

        let restarted = self.generation.is_some_and(|previous| previous != generation);
        if restarted {
            info!(
                previous = self.generation,
                current = generation,
                "coordinator restart detected during handshake"
            );
        }

        self.generation = Some(generation);
        self.state = ChannelState::Ready;
        self.circuit_opened_at = None;
        self.ready_since = Some(now);
        self.heartbeat_sent_at = None;
        self.last_heartbeat_at = Some(now);
        self.heartbeat_missed = 0;

        info!(generation, restarted, "coordinator channel ready");
        self.flush_pending(now);

        Ok(ConnectOutcome::Ready { generation, restarted })
    }

    /// Unjittered delay before the next reconnection attempt.
    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_policy.delay_for_attempt(self.consecutive_failures)
    }

    /// Jittered delay before the next reconnection attempt, so many tabs do
    /// not storm the coordinator in lockstep.
    pub fn jittered_reconnect_delay(&self) -> Duration {
        self.reconnect_policy.jittered_delay(self.consecutive_failures)
    }

    pub fn disconnect(&mut self, reason: &str) {
        debug!(reason, "closing coordinator channel");
        self.transport.close();
        self.state = ChannelState::Disconnected;
        self.heartbeat_sent_at = None;
    }

    // ── Outbound ────────────────────────────────────────────────────

    /// Send a message now, or buffer it until the channel is ready.
    pub fn send(&mut self, message: PortMessage, now: DateTime<Utc>) -> SendOutcome {
        if self.state == ChannelState::Ready {
            match self.send_raw(message.clone()) {
                Ok(()) => return SendOutcome::Sent,
                Err(e) => {
                    self.mark_disconnected(format!("send failed: {e}"));
                    return self.buffer(message, now);
                }
            }
        }
        self.buffer(message, now)
    }

    fn buffer(&mut self, message: PortMessage, now: DateTime<Utc>) -> SendOutcome {
        let mut outcome = SendOutcome::Buffered;
        if self.pending.len() >= self.config.pending_buffer_limit {
            if let Some(dropped) = self.pending.pop_front() {
                warn!(
                    enqueued_at = %dropped.enqueued_at,
                    "pending buffer full; dropping oldest queued message"
                );
                outcome = SendOutcome::DroppedOldest;
            }
        }
        self.pending.push_back(PendingMessage { message, enqueued_at: now });
        outcome
    }

    fn flush_pending(&mut self, _now: DateTime<Utc>) {
        while let Some(pending) = self.pending.pop_front() {
            if let Err(e) = self.send_raw(pending.message.clone()) {
                warn!("flush failed, re-buffering remaining messages: {e}");
                self.pending.push_front(pending);
                self.mark_disconnected("flush failed".to_string());
                return;
            }
        }
    }

    fn send_raw(&mut self, message: PortMessage) -> Result<()> {
        let envelope = PortEnvelope::new(self.outbound_seq, message);
        self.outbound_seq += 1;
        self.transport.send(&envelope)
    }

    // ── Incoming ────────────────────────────────────────────────────

    /// Drain one incoming message, if any.
    pub fn poll_incoming(&mut self, now: DateTime<Utc>) -> Result<Option<ChannelEvent>> {
        if self.state != ChannelState::Ready {
            return Ok(None);
        }

        match self.transport.try_recv()? {
            TryRecv::Empty => Ok(None),
            TryRecv::Closed => {
                self.mark_disconnected("channel closed by coordinator".to_string());
                Ok(Some(ChannelEvent::Disconnected {
                    reason: "channel closed by coordinator".to_string(),
                }))
            }
            TryRecv::Message(envelope) => {
                self.check_incoming_seq(envelope.seq);
                match envelope.message {
                    PortMessage::HeartbeatAck { generation } => {
                        Ok(Some(self.on_heartbeat_ack(generation, now)))
                    }
                    message => Ok(Some(ChannelEvent::Message(message))),
                }
            }
        }
    }

    fn on_heartbeat_ack(&mut self, generation: u64, now: DateTime<Utc>) -> ChannelEvent {
        let rtt = self
            .heartbeat_sent_at
            .map(|sent| (now - sent).to_std().unwrap_or_default())
            .unwrap_or_default();
        self.heartbeat_sent_at = None;
        self.heartbeat_missed = 0;

        let previous = self.generation;
        let generation_changed = previous.is_some_and(|p| p != generation);
        if generation_changed {
            warn!(
                previous,
                current = generation,
                "heartbeat revealed a coordinator restart"
            );
            self.generation = Some(generation);
        }

        ChannelEvent::HeartbeatAck { generation_changed, previous, rtt }
    }

    // ── Timers ──────────────────────────────────────────────────────

    /// Periodic tick: failure-counter grace reset plus heartbeat scheduling
    /// and timeout detection.
    pub fn tick_at(&mut self, now: DateTime<Utc>) -> HeartbeatTick {
        self.maybe_reset_failures(now);

        if self.state != ChannelState::Ready {
            return HeartbeatTick::Idle;
        }

        // An in-flight heartbeat that outlived the request timeout counts as
        // a miss.
        if let Some(sent_at) = self.heartbeat_sent_at {
            let elapsed = (now - sent_at).to_std().unwrap_or_default();
            if elapsed >= self.config.request_timeout {
                self.heartbeat_sent_at = None;
                self.heartbeat_missed += 1;
                if self.heartbeat_missed >= self.config.heartbeat_miss_threshold {
                    warn!(
                        missed = self.heartbeat_missed,
                        "heartbeat miss threshold reached; treating as coordinator restart"
                    );
                    self.mark_disconnected("heartbeat timeouts".to_string());
                    return HeartbeatTick::SuspectedRestart;
                }
                return HeartbeatTick::TimedOut { missed: self.heartbeat_missed };
            }
            return HeartbeatTick::Idle;
        }

        // Send the next probe when the interval elapses.
        let due = self
            .last_heartbeat_at
            .map(|last| (now - last).to_std().unwrap_or_default() >= self.config.heartbeat_interval)
            .unwrap_or(true);
        if due {
            let probe =
                PortMessage::Heartbeat { last_known_generation: self.generation.unwrap_or(0) };
            match self.send_raw(probe) {
                Ok(()) => {
                    self.heartbeat_sent_at = Some(now);
                    self.last_heartbeat_at = Some(now);
                    return HeartbeatTick::Sent;
                }
                Err(e) => {
                    self.mark_disconnected(format!("heartbeat send failed: {e}"));
                    return HeartbeatTick::Idle;
                }
            }
        }

        HeartbeatTick::Idle
    }

    fn maybe_reset_failures(&mut self, now: DateTime<Utc>) {
        if self.state != ChannelState::Ready || self.consecutive_failures == 0 {
            return;
        }
        let sustained = self
            .ready_since
            .is_some_and(|since| (now - since).to_std().unwrap_or_default() >= self.config.circuit_grace);
        if sustained {
            debug!(
                failures = self.consecutive_failures,
                "connectivity sustained through grace period; resetting failure counter"
            );
            self.consecutive_failures = 0;
        }
    }

    // ── Internal ────────────────────────────────────────────────────

    fn fail_attempt(&mut self, reason: String, now: DateTime<Utc>) -> ConnectOutcome {
        self.transport.close();
        self.consecutive_failures += 1;

        let opens_circuit = self.consecutive_failures >= self.config.circuit_failure_threshold;
        if opens_circuit {
            let newly_opened = self.state != ChannelState::CircuitOpen;
            self.state = ChannelState::CircuitOpen;
            self.circuit_opened_at = Some(now);
            if newly_opened {
                warn!(
                    failures = self.consecutive_failures,
                    %reason,
                    "circuit breaker opened on coordinator channel"
                );
            }
            return ConnectOutcome::Failed { reason, circuit_opened: true };
        }

        self.state = ChannelState::Disconnected;
        debug!(failures = self.consecutive_failures, %reason, "connection attempt failed");
        ConnectOutcome::Failed { reason, circuit_opened: false }
    }

    fn mark_disconnected(&mut self, reason: String) {
        warn!(%reason, "coordinator channel disconnected");
        self.transport.close();
        self.state = ChannelState::Disconnected;
        self.heartbeat_sent_at = None;
    }

    fn check_incoming_seq(&mut self, seq: u64) {
        if let Some(last) = self.last_incoming_seq {
            if seq <= last {
                // The shared store, not the channel, is the source of truth
                // for data; log and carry on.
                warn!(seq, last, "incoming channel message out of sequence");
                return;
            }
        }
        self.last_incoming_seq = Some(seq);
    }
}
