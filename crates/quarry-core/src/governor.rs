//! Global request pacing and throttle cooldown.
//!
//! A single [`RateGovernor`] is shared by every worker. It combines:
//!
//! - a token bucket (`burst` tokens, refilled at `rate_per_sec`),
//! - an optional minimum interval between two requests for the same identifier,
//! - a global cooldown entered whenever any fetch is throttled.
//!
//! All state sits behind one mutex so admission checks are linearizable: two
//! workers can never spend the same token.
//!
//! # Cooldown schedule
//!
//! ```text
//! delay(n) = min(max_delay, base_delay * 2^n + jitter)    jitter in [0, min(jitter, base_delay))
//! ```
//!
//! where `n` is the number of consecutive throttles before this one. Keeping
//! the jitter below `base_delay` makes consecutive delays non-decreasing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::AppError;
use crate::models::Identifier;

/// Configuration for the rate governor.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Token refill rate (requests per second across all workers).
    pub rate_per_sec: f64,

    /// Bucket capacity; the largest burst admitted at once.
    pub burst: u32,

    /// Minimum spacing between two requests for the same identifier.
    /// `Duration::ZERO` disables per-identifier pacing.
    pub per_identifier_interval: Duration,

    /// Cooldown after the first throttle signal.
    pub base_delay: Duration,

    /// Upper bound for any cooldown or retry delay.
    pub max_delay: Duration,

    /// Maximum random jitter added to each delay (clamped below `base_delay`).
    pub jitter: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: 10.0,
            burst: 10,
            per_identifier_interval: Duration::ZERO,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: Duration::from_millis(500),
        }
    }
}

impl GovernorConfig {
    pub fn with_rate(mut self, rate_per_sec: f64, burst: u32) -> Self {
        self.rate_per_sec = rate_per_sec;
        self.burst = burst;
        self
    }

    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_per_identifier_interval(mut self, interval: Duration) -> Self {
        self.per_identifier_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !self.rate_per_sec.is_finite() || self.rate_per_sec <= 0.0 {
            return Err(AppError::InvalidConfig(format!(
                "rate_per_sec must be a positive number, got {}",
                self.rate_per_sec
            )));
        }
        if self.burst == 0 {
            return Err(AppError::InvalidConfig("burst must be at least 1".into()));
        }
        if self.max_delay < self.base_delay {
            return Err(AppError::InvalidConfig(
                "max_delay must not be shorter than base_delay".into(),
            ));
        }
        Ok(())
    }

    /// Backoff without jitter after `consecutive` earlier throttles.
    pub fn backoff_for(&self, consecutive: u32) -> Duration {
        let factor = 1u32.checked_shl(consecutive).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn jitter_bound(&self) -> Duration {
        self.jitter.min(self.base_delay)
    }

    /// Backoff plus jitter, capped at `max_delay`.
    fn jittered(&self, consecutive: u32) -> Duration {
        let bound = self.jitter_bound().as_millis() as u64;
        let jitter = Duration::from_millis(rand_jitter_ms(bound));
        (self.backoff_for(consecutive) + jitter).min(self.max_delay)
    }
}

/// Result of a non-blocking admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Permit,
    /// Try again after this long.
    Wait(Duration),
}

/// Snapshot of governor state for monitoring.
#[derive(Debug, Clone)]
pub struct GovernorStats {
    pub consecutive_throttles: u32,
    pub cooldown_remaining: Option<Duration>,
    pub tokens_available: f64,
}

#[derive(Debug)]
struct GovernorState {
    tokens: f64,
    last_refill: Instant,
    cooldown_until: Option<Instant>,
    consecutive_throttles: u32,
    /// Delay applied for the previous throttle in the current streak.
    last_throttle_delay: Duration,
    last_admit: HashMap<Identifier, Instant>,
}

impl GovernorState {
    fn refill(&mut self, config: &GovernorConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.rate_per_sec).min(f64::from(config.burst));
        self.last_refill = now;
    }
}

/// Thread-safe rate governor shared across workers.
#[derive(Debug, Clone)]
pub struct RateGovernor {
    config: GovernorConfig,
    state: Arc<Mutex<GovernorState>>,
}

impl RateGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        let state = GovernorState {
            tokens: f64::from(config.burst),
            last_refill: Instant::now(),
            cooldown_until: None,
            consecutive_throttles: 0,
            last_throttle_delay: Duration::ZERO,
            last_admit: HashMap::new(),
        };
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Acquires the state lock, recovering from poison if necessary.
    fn lock_state(&self) -> MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned governor mutex");
            poisoned.into_inner()
        })
    }

    /// Non-blocking admission check. A `Permit` consumes one token.
    pub fn try_admit(&self, identifier: &Identifier) -> Admission {
        let mut state = self.lock_state();
        let now = Instant::now();

        if let Some(until) = state.cooldown_until {
            if until > now {
                return Admission::Wait(until - now);
            }
            state.cooldown_until = None;
        }

        let interval = self.config.per_identifier_interval;
        if !interval.is_zero()
            && let Some(&last) = state.last_admit.get(identifier)
        {
            let next = last + interval;
            if next > now {
                return Admission::Wait(next - now);
            }
        }

        state.refill(&self.config, now);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            if !interval.is_zero() {
                state.last_admit.insert(identifier.clone(), now);
            }
            Admission::Permit
        } else {
            let missing = 1.0 - state.tokens;
            Admission::Wait(Duration::from_secs_f64(missing / self.config.rate_per_sec))
        }
    }

    /// Waits until a request for `identifier` may be sent.
    ///
    /// Returns the total time spent waiting.
    pub async fn admit(&self, identifier: &Identifier) -> Duration {
        let mut waited = Duration::ZERO;
        loop {
            match self.try_admit(identifier) {
                Admission::Permit => return waited,
                Admission::Wait(delay) => {
                    tracing::debug!(
                        identifier = %identifier,
                        sleep_ms = %delay.as_millis(),
                        "Waiting for admission"
                    );
                    tokio::time::sleep(delay).await;
                    waited += delay;
                }
            }
        }
    }

    /// Records a throttle signal and starts (or extends) the global cooldown.
    ///
    /// A server-provided `retry_after` raises the delay, still capped at
    /// `max_delay`. Within a streak the delay never drops below the previous
    /// one, hint included. Returns the cooldown applied.
    pub fn report_throttle(&self, retry_after: Option<Duration>) -> Duration {
        let mut state = self.lock_state();
        let delay = self
            .config
            .jittered(state.consecutive_throttles)
            .max(retry_after.unwrap_or_default())
            .max(state.last_throttle_delay)
            .min(self.config.max_delay);
        state.consecutive_throttles = state.consecutive_throttles.saturating_add(1);
        state.last_throttle_delay = delay;

        let until = Instant::now() + delay;
        state.cooldown_until = Some(match state.cooldown_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });

        tracing::warn!(
            consecutive = state.consecutive_throttles,
            delay_ms = %delay.as_millis(),
            "Throttled by upstream; pausing admissions"
        );
        delay
    }

    /// Records a successful fetch, clearing the throttle streak.
    pub fn report_success(&self) {
        let mut state = self.lock_state();
        if state.consecutive_throttles > 0 {
            tracing::info!(
                after = state.consecutive_throttles,
                "Upstream accepting requests again"
            );
            state.consecutive_throttles = 0;
        }
        state.last_throttle_delay = Duration::ZERO;
    }

    /// Delay before retry number `attempt` (0-based) of a transient failure.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.config.jittered(attempt)
    }

    /// Forgets per-identifier pacing state once an identifier is finished.
    pub fn release(&self, identifier: &Identifier) {
        if !self.config.per_identifier_interval.is_zero() {
            self.lock_state().last_admit.remove(identifier);
        }
    }

    pub fn stats(&self) -> GovernorStats {
        let mut state = self.lock_state();
        let now = Instant::now();
        state.refill(&self.config, now);
        GovernorStats {
            consecutive_throttles: state.consecutive_throttles,
            cooldown_remaining: state
                .cooldown_until
                .filter(|until| *until > now)
                .map(|until| until - now),
            tokens_available: state.tokens,
        }
    }
}

// ---------------------------------------------------------------------------
// Jitter based on std, no `rand` dependency.
// Uses a simple xorshift seeded from the current time.
// ---------------------------------------------------------------------------

fn rand_jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    // Seed from high-resolution clock; good enough for jitter, not crypto.
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    x |= 1;
    // xorshift64
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max_ms
}
