//! Retry strategies
//!
//! A [`RetryStrategy`] is a pure policy object: it decides whether a failed
//! attempt is retried and how long to wait first. It never sleeps itself.

use std::collections::BTreeSet;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

/// Names accepted by [`RetryStrategy::named`]
pub const PRESET_NAMES: [&str; 5] = [
    "interactive",
    "background_sync",
    "immediate",
    "external",
    "critical",
];

/// Invalid strategy parameters
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StrategyError {
    #[error("max_attempts must be at least 1")]
    NoAttempts,

    #[error("multiplier must be a finite number >= 1.0, got {0}")]
    InvalidMultiplier(f64),

    #[error("jitter ratio must be within [0, 1], got {0}")]
    InvalidJitter(f64),

    #[error("max_delay ({max:?}) is shorter than base_delay ({base:?})")]
    MaxBelowBase { base: Duration, max: Duration },
}

/// Retry policy with exponential backoff and symmetric jitter
///
/// Built with the `with_*` methods and immutable afterwards; share it by
/// reference or clone it.
///
/// # Example
///
/// ```
/// use docforge_resilience::{ErrorKind, RetryStrategy};
/// use std::time::Duration;
///
/// let strategy = RetryStrategy::interactive()
///     .with_max_attempts(4)
///     .with_jitter(0.0);
///
/// assert_eq!(strategy.backoff_for(1), Duration::from_millis(200));
/// assert_eq!(strategy.backoff_for(2), Duration::from_millis(400));
/// assert!(strategy.should_retry(ErrorKind::Network, 3));
/// assert!(!strategy.should_retry(ErrorKind::Network, 4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryStrategy {
    name: String,

    max_attempts: u32,

    #[serde(with = "crate::serde_millis")]
    base_delay: Duration,

    multiplier: f64,

    #[serde(with = "crate::serde_millis")]
    max_delay: Duration,

    /// 0.2 means the delay moves by up to ±20%
    jitter_ratio: f64,

    retryable_kinds: BTreeSet<ErrorKind>,

    /// Deadline for a single invocation of the operation
    #[serde(with = "crate::serde_millis::option", default)]
    attempt_timeout: Option<Duration>,

    /// Whether attempts go through the per-key circuit breaker
    #[serde(default = "default_circuit_breaker")]
    circuit_breaker: bool,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::interactive()
    }
}

impl RetryStrategy {
    /// Create a strategy with the given name and no backoff
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_attempts: 1,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter_ratio: 0.0,
            retryable_kinds: default_retryable_kinds(),
            attempt_timeout: None,
            circuit_breaker: true,
        }
    }

    /// For calls a user is waiting on
    ///
    /// - 3 attempts
    /// - 200 ms base delay, x2, capped at 5 seconds
    /// - 20% jitter
    pub fn interactive() -> Self {
        Self::new("interactive")
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(200))
            .with_multiplier(2.0)
            .with_max_delay(Duration::from_secs(5))
            .with_jitter(0.2)
            .with_attempt_timeout(Duration::from_secs(30))
    }

    /// For background synchronisation that nobody watches
    ///
    /// - 5 attempts
    /// - 500 ms base delay, x2, capped at 30 seconds
    /// - 20% jitter
    pub fn background_sync() -> Self {
        Self::new("background_sync")
            .with_max_attempts(5)
            .with_base_delay(Duration::from_millis(500))
            .with_multiplier(2.0)
            .with_max_delay(Duration::from_secs(30))
            .with_jitter(0.2)
            .with_attempt_timeout(Duration::from_secs(30))
    }

    /// One immediate retry for cache-like reads
    ///
    /// Bypasses the circuit breaker: a cheap read must neither trip it nor
    /// be refused by it.
    pub fn immediate() -> Self {
        Self::new("immediate")
            .with_max_attempts(2)
            .with_retryable_kinds([ErrorKind::Network, ErrorKind::Server])
            .with_attempt_timeout(Duration::from_secs(2))
            .without_circuit_breaker()
    }

    /// For third-party APIs (webhooks, e-mail, AI providers)
    pub fn external() -> Self {
        Self::new("external")
            .with_max_attempts(5)
            .with_base_delay(Duration::from_secs(1))
            .with_multiplier(2.0)
            .with_max_delay(Duration::from_secs(60))
            .with_jitter(0.1)
            .with_attempt_timeout(Duration::from_secs(15))
    }

    /// Single attempt; the circuit breaker is the only protection
    pub fn critical() -> Self {
        Self::new("critical").with_attempt_timeout(Duration::from_secs(5))
    }

    /// Look up a preset by name
    pub fn named(name: &str) -> Option<Self> {
        match name {
            "interactive" => Some(Self::interactive()),
            "background_sync" => Some(Self::background_sync()),
            "immediate" => Some(Self::immediate()),
            "external" => Some(Self::external()),
            "critical" => Some(Self::critical()),
            _ => None,
        }
    }

    /// Set the maximum number of attempts (including the first)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the delay after the first failed attempt
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self.max_delay = self.max_delay.max(delay);
        self
    }

    /// Set the backoff multiplier (values below 1 are raised to 1)
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        self
    }

    /// Set the delay cap
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter ratio (0.0-1.0)
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = if ratio.is_nan() {
            0.0
        } else {
            ratio.clamp(0.0, 1.0)
        };
        self
    }

    /// Replace the set of kinds that may be retried
    pub fn with_retryable_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_kinds = kinds.into_iter().collect();
        self
    }

    /// Allow retrying one more kind
    pub fn with_retryable_kind(mut self, kind: ErrorKind) -> Self {
        self.retryable_kinds.insert(kind);
        self
    }

    /// Never retry this kind
    pub fn without_retryable_kind(mut self, kind: ErrorKind) -> Self {
        self.retryable_kinds.remove(&kind);
        self
    }

    /// Set a deadline for each invocation
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Remove the per-invocation deadline
    pub fn without_attempt_timeout(mut self) -> Self {
        self.attempt_timeout = None;
        self
    }

    /// Run attempts without asking the circuit breaker and without
    /// reporting outcomes to it
    pub fn without_circuit_breaker(mut self) -> Self {
        self.circuit_breaker = false;
        self
    }

    /// Route attempts through the circuit breaker again
    pub fn with_circuit_breaker(mut self) -> Self {
        self.circuit_breaker = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter_ratio(&self) -> f64 {
        self.jitter_ratio
    }

    pub fn retryable_kinds(&self) -> &BTreeSet<ErrorKind> {
        &self.retryable_kinds
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }

    pub fn uses_circuit_breaker(&self) -> bool {
        self.circuit_breaker
    }

    /// Check parameters that deserialization could have bypassed
    pub fn validate(&self) -> Result<(), StrategyError> {
        if self.max_attempts == 0 {
            return Err(StrategyError::NoAttempts);
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(StrategyError::InvalidMultiplier(self.multiplier));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(StrategyError::InvalidJitter(self.jitter_ratio));
        }
        if self.max_delay < self.base_delay {
            return Err(StrategyError::MaxBelowBase {
                base: self.base_delay,
                max: self.max_delay,
            });
        }
        Ok(())
    }

    /// Backoff after the given failed attempt (1-based), without jitter
    ///
    /// `min(max_delay, base_delay * multiplier^(attempt - 1))`
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay to wait after the given failed attempt (1-based)
    ///
    /// Applies symmetric jitter to [`backoff_for`](Self::backoff_for) and
    /// clamps the result to `[0, max_delay]`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let backoff = self.backoff_for(attempt);
        if self.jitter_ratio <= 0.0 || backoff.is_zero() {
            return backoff;
        }

        let base = backoff.as_secs_f64();
        let range = base * self.jitter_ratio;
        let offset = rand::thread_rng().gen_range(-range..=range);
        let jittered = (base + offset).clamp(0.0, self.max_delay.as_secs_f64());
        Duration::from_secs_f64(jittered)
    }

    /// Delay before the next attempt, honouring a server retry-after hint
    ///
    /// The hint can lengthen the wait but never beyond `max_delay`.
    pub fn delay_before_retry(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let delay = self.next_delay(attempt);
        match retry_after {
            Some(hint) => delay.max(hint.min(self.max_delay)),
            None => delay,
        }
    }

    /// Whether a failure of `kind` on `attempt` (1-based) is retried
    pub fn should_retry(&self, kind: ErrorKind, attempt: u32) -> bool {
        if !self.has_attempts_remaining(attempt) {
            return false;
        }
        match kind {
            ErrorKind::CircuitOpen => false,
            ErrorKind::Network
            | ErrorKind::Timeout
            | ErrorKind::Server
            | ErrorKind::Client
            | ErrorKind::Validation
            | ErrorKind::Unknown => self.retryable_kinds.contains(&kind),
        }
    }

    /// Check if there are remaining attempts after `attempt`
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

fn default_circuit_breaker() -> bool {
    true
}

fn default_retryable_kinds() -> BTreeSet<ErrorKind> {
    ErrorKind::ALL
        .into_iter()
        .filter(|kind| kind.is_recoverable())
        .collect()
}
