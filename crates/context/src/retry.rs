// Reusable retry policy: exponential backoff with jitter, plus the fixed
// short schedules used for identity acquisition.
//
// Consumed by the identity acquirer, the coordinator channel, and the
// hydration supervisor so the repo has exactly one place that knows how to
// wait.

use std::time::Duration;

use rand::Rng;

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Coordinator not yet initialized, channel disconnects, timeouts.
    Retryable,
    /// Protocol violations, permanent rejections.
    Terminal,
}

/// Exponential backoff: `base * 2^attempt`, capped, with ±`jitter` relative
/// spread so many tabs reconnecting at once do not synchronize.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Relative jitter, e.g. 0.2 for ±20%.
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
            max_attempts: u32::MAX,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self { base_delay, max_delay, ..Self::default() }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Raw (unjittered) delay for a 0-based attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.min(7); // cap exponent to avoid overflow
        saturating_mul(self.base_delay, 1u64 << exp).min(self.max_delay)
    }

    /// Delay with an explicit jitter sample in `[-1, 1]`, for tests.
    pub fn delay_with_jitter(&self, attempt: u32, sample: f64) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let spread = base.as_secs_f64() * self.jitter * sample.clamp(-1.0, 1.0);
        let jittered = (base.as_secs_f64() + spread).max(0.0);
        Duration::from_secs_f64(jittered).min(self.max_delay)
    }

    /// Delay with a random jitter sample.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let sample = rand::thread_rng().gen_range(-1.0..=1.0);
        self.delay_with_jitter(attempt, sample)
    }

    /// Whether the attempt budget is used up.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// A fixed escalating schedule: attempt N waits `steps[N]`; `None` once the
/// schedule runs out.
#[derive(Debug, Clone)]
pub struct FixedSchedule {
    steps: Vec<Duration>,
}

impl FixedSchedule {
    pub fn new(steps: Vec<Duration>) -> Self {
        Self { steps }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        self.steps.get(attempt as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

fn saturating_mul(duration: Duration, rhs: u64) -> Duration {
    let nanos = duration.as_nanos().saturating_mul(rhs as u128);
    if nanos > u64::MAX as u128 {
        Duration::from_secs(u64::MAX)
    } else {
        Duration::from_nanos(nanos as u64)
    }
}
