// Protocol tuning for a context.
//
// Everything time-based in the engine is driven from this one struct so
// embedders (and tests) can tighten or relax the protocol without touching
// component code. Out-of-range values clamp instead of erroring: a bad config
// file should degrade to safe timings, not take the sync layer down.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Clamp ranges ────────────────────────────────────────────────────

const MIN_HEARTBEAT_MS: u64 = 1_000;
const MAX_HEARTBEAT_MS: u64 = 120_000;
const MIN_TOLERANCE_MS: u64 = 250;
const MAX_TOLERANCE_MS: u64 = 10_000;
const MIN_ADOPTION_TTL_MS: u64 = 2_000;
const MAX_ADOPTION_TTL_MS: u64 = 30_000;
const MIN_RTT_MS: u64 = 50;
const MAX_RTT_MS: u64 = 10_000;

/// Protocol tuning, loadable from TOML. All fields have defaults; a missing
/// file or missing keys fall back to them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Tuning {
    /// Event-loop tick cadence.
    pub tick_interval_ms: u64,

    // ── Coordinator channel ─────────────────────────────────────────
    /// Fixed heartbeat interval.
    pub heartbeat_interval_ms: u64,
    /// Consecutive heartbeat timeouts treated as a coordinator restart.
    pub heartbeat_miss_threshold: u32,
    /// Timeout for any single pending coordinator request.
    pub request_timeout_ms: u64,
    /// Reconnection backoff base delay.
    pub reconnect_base_delay_ms: u64,
    /// Reconnection backoff cap.
    pub reconnect_max_delay_ms: u64,
    /// Consecutive connection failures that open the circuit breaker.
    pub circuit_failure_threshold: u32,
    /// Sustained-connectivity window that resets the failure counter; also
    /// the cooldown before a manual reconnect is honored while the circuit
    /// is open.
    pub circuit_grace_ms: u64,
    /// Maximum buffered outbound envelopes while the channel is not ready.
    pub pending_buffer_limit: usize,

    // ── Identity acquisition ────────────────────────────────────────
    /// Fixed short backoff schedule for the first acquisition attempts.
    pub identity_schedule_ms: Vec<u64>,
    /// Interval of the extended low-frequency retry loop.
    pub identity_extended_interval_ms: u64,
    /// Overall deadline for acquisition before degrading.
    pub identity_overall_timeout_ms: u64,

    // ── Sync engine ─────────────────────────────────────────────────
    /// Duplicate-tolerance window = observed RTT × this multiplier, clamped.
    pub tolerance_rtt_multiplier: f64,
    /// Starting RTT estimate before any heartbeat has been observed.
    pub rtt_initial_ms: u64,

    // ── Ownership / adoption ────────────────────────────────────────
    /// Adoption TTL = observed RTT × this multiplier, clamped.
    pub adoption_ttl_multiplier: f64,
    /// Adoption sweep cadence.
    pub adoption_sweep_interval_ms: u64,

    // ── Creation ────────────────────────────────────────────────────
    /// Maximum queued creation requests.
    pub create_queue_limit: usize,
    /// Suffix regeneration attempts before giving up on an allocation.
    pub create_suffix_retries: u32,

    // ── Hydration ───────────────────────────────────────────────────
    /// How long to wait for a store notification before polling.
    pub hydration_wait_ms: u64,
    /// Fallback poll attempts.
    pub hydration_poll_retries: u32,
    /// Delay between fallback polls.
    pub hydration_poll_delay_ms: u64,
    /// Deferred create/restore operations run unconditionally after this.
    pub hydration_safety_timeout_ms: u64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            heartbeat_interval_ms: 15_000,
            heartbeat_miss_threshold: 3,
            request_timeout_ms: 5_000,
            reconnect_base_delay_ms: 250,
            reconnect_max_delay_ms: 30_000,
            circuit_failure_threshold: 5,
            circuit_grace_ms: 10_000,
            pending_buffer_limit: 64,
            identity_schedule_ms: vec![250, 1_000, 2_000, 5_000],
            identity_extended_interval_ms: 5_000,
            identity_overall_timeout_ms: 45_000,
            tolerance_rtt_multiplier: 2.0,
            rtt_initial_ms: 500,
            adoption_ttl_multiplier: 3.0,
            adoption_sweep_interval_ms: 5_000,
            create_queue_limit: 32,
            create_suffix_retries: 4,
            hydration_wait_ms: 3_000,
            hydration_poll_retries: 5,
            hydration_poll_delay_ms: 400,
            hydration_safety_timeout_ms: 10_000,
        }
    }
}

impl Tuning {
    /// Load from a TOML file, clamping out-of-range values.
    pub fn load_from(path: &Path) -> Result<Self, TuningError> {
        let contents = std::fs::read_to_string(path).map_err(TuningError::Io)?;
        let parsed: Self = toml::from_str(&contents).map_err(TuningError::Parse)?;
        Ok(parsed.clamped())
    }

    /// Load from a path, falling back to defaults if the file is missing or
    /// unparseable.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load_from(path).unwrap_or_default()
    }

    /// Apply all range clamps.
    pub fn clamped(mut self) -> Self {
        self.tick_interval_ms = self.tick_interval_ms.clamp(10, 1_000);
        self.heartbeat_interval_ms =
            self.heartbeat_interval_ms.clamp(MIN_HEARTBEAT_MS, MAX_HEARTBEAT_MS);
        self.heartbeat_miss_threshold = self.heartbeat_miss_threshold.clamp(1, 10);
        self.request_timeout_ms = self.request_timeout_ms.clamp(500, 60_000);
        self.reconnect_base_delay_ms = self.reconnect_base_delay_ms.clamp(50, 5_000);
        self.reconnect_max_delay_ms =
            self.reconnect_max_delay_ms.clamp(self.reconnect_base_delay_ms, 300_000);
        self.circuit_failure_threshold = self.circuit_failure_threshold.clamp(2, 20);
        self.circuit_grace_ms = self.circuit_grace_ms.clamp(1_000, 120_000);
        self.tolerance_rtt_multiplier = self.tolerance_rtt_multiplier.clamp(1.0, 10.0);
        self.rtt_initial_ms = self.rtt_initial_ms.clamp(MIN_RTT_MS, MAX_RTT_MS);
        self.adoption_ttl_multiplier = self.adoption_ttl_multiplier.clamp(1.0, 10.0);
        self.create_suffix_retries = self.create_suffix_retries.clamp(1, 16);
        self
    }

    // Duration accessors so component code never multiplies milliseconds
    // by hand.

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn circuit_grace(&self) -> Duration {
        Duration::from_millis(self.circuit_grace_ms)
    }

    pub fn identity_schedule(&self) -> Vec<Duration> {
        self.identity_schedule_ms.iter().map(|ms| Duration::from_millis(*ms)).collect()
    }

    pub fn identity_extended_interval(&self) -> Duration {
        Duration::from_millis(self.identity_extended_interval_ms)
    }

    pub fn identity_overall_timeout(&self) -> Duration {
        Duration::from_millis(self.identity_overall_timeout_ms)
    }

    pub fn rtt_initial(&self) -> Duration {
        Duration::from_millis(self.rtt_initial_ms)
    }

    /// Duplicate-tolerance window for a given observed round-trip latency.
    pub fn tolerance_for_rtt(&self, rtt: Duration) -> Duration {
        scale_clamped(rtt, self.tolerance_rtt_multiplier, MIN_TOLERANCE_MS, MAX_TOLERANCE_MS)
    }

    /// Adoption-record TTL for a given observed round-trip latency.
    pub fn adoption_ttl_for_rtt(&self, rtt: Duration) -> Duration {
        scale_clamped(rtt, self.adoption_ttl_multiplier, MIN_ADOPTION_TTL_MS, MAX_ADOPTION_TTL_MS)
    }

    pub fn adoption_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.adoption_sweep_interval_ms)
    }

    pub fn hydration_wait(&self) -> Duration {
        Duration::from_millis(self.hydration_wait_ms)
    }

    pub fn hydration_poll_delay(&self) -> Duration {
        Duration::from_millis(self.hydration_poll_delay_ms)
    }

    pub fn hydration_safety_timeout(&self) -> Duration {
        Duration::from_millis(self.hydration_safety_timeout_ms)
    }

    /// Clamp an RTT sample into the trusted range.
    pub fn clamp_rtt(&self, rtt: Duration) -> Duration {
        rtt.clamp(Duration::from_millis(MIN_RTT_MS), Duration::from_millis(MAX_RTT_MS))
    }
}

fn scale_clamped(base: Duration, multiplier: f64, min_ms: u64, max_ms: u64) -> Duration {
    let scaled_ms = (base.as_millis() as f64 * multiplier) as u64;
    Duration::from_millis(scaled_ms.clamp(min_ms, max_ms))
}

#[derive(Debug, Error)]
pub enum TuningError {
    #[error("failed to read tuning file: {0}")]
    Io(std::io::Error),
    #[error("failed to parse tuning file: {0}")]
    Parse(toml::de::Error),
}
