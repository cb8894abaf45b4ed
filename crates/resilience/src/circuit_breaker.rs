//! Per-operation circuit breakers
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐  window failures >= threshold  ┌─────────┐  cooldown elapsed  ┌──────────┐
//! │ Closed  │ ─────────────────────────────► │  Open   │ ─────────────────► │ HalfOpen │
//! └─────────┘                                └─────────┘                    └──────────┘
//!      ▲                                          ▲        probe failed          │
//!      │                                          └──────────────────────────────┤
//!      │                    probe succeeded                                      │
//!      └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Failures are counted in a time-based sliding window that a success clears.
//! Each failed probe multiplies the cooldown (up to `max_cooldown`); closing
//! the circuit restores the base cooldown.
//!
//! Breakers live in a [`BreakerRegistry`], created lazily per key and guarded
//! by one mutex per key. Admission hands out a [`CircuitPermit`]; dropping a
//! probe permit without reporting an outcome frees the probe slot without
//! counting a failure, which is what cancellation relies on.
//!
//! Every open and close starts a new generation. A permit only acts on the
//! generation it was admitted in; results arriving after the circuit moved on
//! are ignored.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold exceeded - all calls rejected
    Open,

    /// Testing if service recovered - a single probe allowed
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// A change of breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitTransition {
    pub from: CircuitState,
    pub to: CircuitState,
}

impl CircuitTransition {
    fn new(from: CircuitState, to: CircuitState) -> Self {
        Self { from, to }
    }
}

/// Circuit breaker configuration
///
/// # Example
///
/// ```
/// use docforge_resilience::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(3)
///     .with_cooldown(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of failures within the window required to open the circuit
    pub failure_threshold: u32,

    /// Sliding window for failure counting
    #[serde(with = "crate::serde_millis")]
    pub failure_window: Duration,

    /// Time to wait before transitioning from open to half-open
    #[serde(with = "crate::serde_millis")]
    pub cooldown: Duration,

    /// Cooldown growth factor after each failed probe
    pub cooldown_multiplier: f64,

    /// Upper bound for the grown cooldown
    #[serde(with = "crate::serde_millis")]
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
            cooldown_multiplier: 2.0,
            max_cooldown: Duration::from_secs(300),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold to open the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the sliding window for failure counting
    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }

    /// Set the cooldown (time before a probe is allowed after opening)
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self.max_cooldown = self.max_cooldown.max(cooldown);
        self
    }

    /// Set the cooldown growth factor (1.0 keeps it fixed)
    pub fn with_cooldown_multiplier(mut self, multiplier: f64) -> Self {
        self.cooldown_multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        self
    }

    /// Set the cooldown cap
    pub fn with_max_cooldown(mut self, max: Duration) -> Self {
        self.max_cooldown = max.max(self.cooldown);
        self
    }

    fn grown_cooldown(&self, current: Duration) -> Duration {
        // Deserialized configs skip the builder clamps
        let factor = if self.cooldown_multiplier.is_finite() {
            self.cooldown_multiplier.max(1.0)
        } else {
            1.0
        };
        let cap = self.max_cooldown.max(current).as_secs_f64();
        let grown = (current.as_secs_f64() * factor).min(cap);
        Duration::try_from_secs_f64(grown).unwrap_or(current)
    }
}

/// Why an attempt was not admitted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CircuitBreakerError {
    /// Circuit is open, calls are not allowed
    #[error("circuit breaker for {key} is open (probe allowed in {retry_in:?})")]
    Open { key: String, retry_in: Duration },

    /// Circuit is half-open and the probe slot is taken
    #[error("circuit breaker for {key} is half-open, probe already in flight")]
    HalfOpenExhausted { key: String },
}

impl CircuitBreakerError {
    /// State the breaker was in when it refused the attempt
    pub fn state(&self) -> CircuitState {
        match self {
            CircuitBreakerError::Open { .. } => CircuitState::Open,
            CircuitBreakerError::HalfOpenExhausted { .. } => CircuitState::HalfOpen,
        }
    }
}

/// Mutable per-key breaker state
#[derive(Debug)]
struct BreakerState {
    config: Arc<CircuitBreakerConfig>,
    state: CircuitState,
    consecutive_failures: u32,
    window_failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    cooldown: Duration,
    trips: u64,
    generation: u64,
}

impl BreakerState {
    fn new(config: Arc<CircuitBreakerConfig>) -> Self {
        let cooldown = config.cooldown;
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            window_failures: VecDeque::new(),
            opened_at: None,
            opened_at_wall: None,
            probe_in_flight: false,
            cooldown,
            trips: 0,
            generation: 0,
        }
    }

    fn prune_window(&mut self, now: Instant) {
        let window = self.config.failure_window;
        while let Some(&oldest) = self.window_failures.front() {
            if now.saturating_duration_since(oldest) > window {
                self.window_failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.opened_at_wall = Some(Utc::now());
        self.probe_in_flight = false;
        self.window_failures.clear();
        self.trips += 1;
        self.generation += 1;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.window_failures.clear();
        self.opened_at = None;
        self.opened_at_wall = None;
        self.probe_in_flight = false;
        self.cooldown = self.config.cooldown;
        self.generation += 1;
    }

    fn remaining_cooldown(&self, now: Instant) -> Duration {
        match self.opened_at {
            Some(opened_at) => self
                .cooldown
                .saturating_sub(now.saturating_duration_since(opened_at)),
            None => Duration::ZERO,
        }
    }

    fn snapshot(&self, now: Instant) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            window_failures: self
                .window_failures
                .iter()
                .filter(|&&at| now.saturating_duration_since(at) <= self.config.failure_window)
                .count() as u32,
            opened_at: self.opened_at_wall,
            cooldown: self.cooldown,
            retry_in: match self.state {
                CircuitState::Open => Some(self.remaining_cooldown(now)),
                CircuitState::Closed | CircuitState::HalfOpen => None,
            },
            probe_in_flight: self.probe_in_flight,
            trips: self.trips,
        }
    }
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub window_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(with = "crate::serde_millis")]
    pub cooldown: Duration,
    #[serde(with = "crate::serde_millis::option")]
    pub retry_in: Option<Duration>,
    pub probe_in_flight: bool,
    /// How many times the circuit opened
    pub trips: u64,
}

/// Registry of circuit breakers keyed by operation name
///
/// Pass it around by `Arc`; every test can build its own.
///
/// # Example
///
/// ```
/// use docforge_resilience::{BreakerRegistry, CircuitBreakerConfig};
///
/// let registry = BreakerRegistry::new(CircuitBreakerConfig::default());
///
/// match registry.try_acquire("fetch-contracts") {
///     Ok(permit) => {
///         // call the backend, then report the outcome
///         permit.success();
///     }
///     Err(rejected) => {
///         // fail fast
///         println!("{rejected}");
///     }
/// }
/// ```
#[derive(Debug)]
pub struct BreakerRegistry {
    default_config: Arc<CircuitBreakerConfig>,
    breakers: DashMap<String, Arc<Mutex<BreakerState>>>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl BreakerRegistry {
    /// Create a registry whose breakers use `config` unless configured otherwise
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            default_config: Arc::new(config),
            breakers: DashMap::new(),
        }
    }

    /// Default configuration for lazily created breakers
    pub fn default_config(&self) -> &CircuitBreakerConfig {
        &self.default_config
    }

    /// Use a dedicated configuration for one key
    ///
    /// Resets the breaker for that key.
    pub fn configure(&self, key: impl Into<String>, config: CircuitBreakerConfig) {
        let key = key.into();
        debug!(operation_key = %key, ?config, "configuring circuit breaker");
        self.breakers.insert(
            key,
            Arc::new(Mutex::new(BreakerState::new(Arc::new(config)))),
        );
    }

    fn entry(&self, key: &str) -> Arc<Mutex<BreakerState>> {
        if let Some(existing) = self.breakers.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(BreakerState::new(Arc::clone(
                    &self.default_config,
                ))))
            });
        Arc::clone(entry.value())
    }

    /// Ask whether an attempt for `key` may run
    ///
    /// The check and the state change happen under the key's lock, so at
    /// most one caller can ever hold the Half-Open probe.
    pub fn try_acquire(&self, key: &str) -> Result<CircuitPermit, CircuitBreakerError> {
        let entry = self.entry(key);
        let now = Instant::now();

        let admission = {
            let mut breaker = entry.lock();
            let generation = breaker.generation;
            let admitted = match breaker.state {
                CircuitState::Closed => Ok((CircuitState::Closed, false, None)),
                CircuitState::Open => {
                    let remaining = breaker.remaining_cooldown(now);
                    if remaining.is_zero() {
                        breaker.state = CircuitState::HalfOpen;
                        breaker.probe_in_flight = true;
                        Ok((
                            CircuitState::HalfOpen,
                            true,
                            Some(CircuitTransition::new(
                                CircuitState::Open,
                                CircuitState::HalfOpen,
                            )),
                        ))
                    } else {
                        Err(CircuitBreakerError::Open {
                            key: key.to_string(),
                            retry_in: remaining,
                        })
                    }
                }
                CircuitState::HalfOpen => {
                    if breaker.probe_in_flight {
                        Err(CircuitBreakerError::HalfOpenExhausted {
                            key: key.to_string(),
                        })
                    } else {
                        breaker.probe_in_flight = true;
                        Ok((CircuitState::HalfOpen, true, None))
                    }
                }
            };
            admitted.map(|(state, probe, transition)| (state, probe, transition, generation))
        };

        let (state, probe, transition, generation) = admission?;
        if transition.is_some() {
            info!(operation_key = %key, "circuit half-open, admitting probe");
        }

        Ok(CircuitPermit {
            key: key.to_string(),
            entry,
            state,
            probe,
            transition,
            generation,
            resolved: false,
        })
    }

    /// Current state of a breaker (`Closed` for unknown keys)
    pub fn state(&self, key: &str) -> CircuitState {
        self.breakers
            .get(key)
            .map(|entry| entry.lock().state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Detailed view of one breaker, if it exists
    pub fn snapshot(&self, key: &str) -> Option<BreakerSnapshot> {
        let now = Instant::now();
        self.breakers
            .get(key)
            .map(|entry| entry.lock().snapshot(now))
    }

    /// Detailed view of every breaker, ordered by key
    pub fn snapshot_all(&self) -> BTreeMap<String, BreakerSnapshot> {
        let now = Instant::now();
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().lock().snapshot(now)))
            .collect()
    }

    /// Keys with a breaker, ordered
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Number of breakers currently open
    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|entry| entry.value().lock().state == CircuitState::Open)
            .count()
    }

    /// Force a breaker closed (operator recovery)
    ///
    /// Returns the transition if the breaker existed and was not closed.
    pub fn reset(&self, key: &str) -> Option<CircuitTransition> {
        let entry = self.breakers.get(key).map(|e| Arc::clone(e.value()))?;
        let mut breaker = entry.lock();
        let previous = breaker.state;
        breaker.close();
        warn!(operation_key = %key, from = %previous, "circuit breaker manually reset");

        (previous != CircuitState::Closed)
            .then(|| CircuitTransition::new(previous, CircuitState::Closed))
    }
}

/// What reporting an outcome did to the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermitReport {
    /// Transition caused by the report, if any
    pub transition: Option<CircuitTransition>,

    /// Breaker state right after the report, read under the key's lock
    pub state: CircuitState,
}

impl PermitReport {
    fn new(transition: Option<CircuitTransition>, state: CircuitState) -> Self {
        Self { transition, state }
    }
}

/// Admission ticket for one attempt
///
/// Report the outcome with [`success`](Self::success) or
/// [`failure`](Self::failure). Dropping the permit without reporting (for
/// example because the call was cancelled) counts as neither and frees the
/// probe slot. A permit from an earlier generation of the breaker (before a
/// trip, a close or an operator reset) has no effect at all.
#[derive(Debug)]
pub struct CircuitPermit {
    key: String,
    entry: Arc<Mutex<BreakerState>>,
    state: CircuitState,
    probe: bool,
    transition: Option<CircuitTransition>,
    generation: u64,
    resolved: bool,
}

impl CircuitPermit {
    /// Operation key this permit belongs to
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Breaker state the attempt was admitted in
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether this attempt is the Half-Open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Transition performed while admitting (Open → HalfOpen)
    pub fn admission_transition(&self) -> Option<CircuitTransition> {
        self.transition
    }

    /// Report that the call succeeded
    pub fn success(mut self) -> PermitReport {
        self.resolved = true;
        let mut breaker = self.entry.lock();
        if breaker.generation != self.generation {
            debug!(operation_key = %self.key, "stale success ignored");
            return PermitReport::new(None, breaker.state);
        }

        let transition = match breaker.state {
            CircuitState::Closed => {
                breaker.consecutive_failures = 0;
                breaker.window_failures.clear();
                None
            }
            CircuitState::HalfOpen if self.probe => {
                breaker.close();
                info!(operation_key = %self.key, "probe succeeded, circuit closed");
                Some(CircuitTransition::new(
                    CircuitState::HalfOpen,
                    CircuitState::Closed,
                ))
            }
            CircuitState::HalfOpen | CircuitState::Open => None,
        };
        PermitReport::new(transition, breaker.state)
    }

    /// Report that the call failed
    pub fn failure(mut self) -> PermitReport {
        self.resolved = true;
        let now = Instant::now();
        let mut breaker = self.entry.lock();
        if breaker.generation != self.generation {
            debug!(operation_key = %self.key, "stale failure ignored");
            return PermitReport::new(None, breaker.state);
        }

        let transition = match breaker.state {
            CircuitState::Closed => {
                breaker.consecutive_failures += 1;
                breaker.window_failures.push_back(now);
                breaker.prune_window(now);

                let failures = breaker.window_failures.len() as u32;
                if failures >= breaker.config.failure_threshold {
                    breaker.cooldown = breaker.config.cooldown;
                    breaker.open(now);
                    warn!(
                        operation_key = %self.key,
                        failures,
                        cooldown_ms = breaker.cooldown.as_millis() as u64,
                        "failure threshold reached, circuit opened"
                    );
                    Some(CircuitTransition::new(
                        CircuitState::Closed,
                        CircuitState::Open,
                    ))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen if self.probe => {
                breaker.consecutive_failures += 1;
                let grown = breaker.config.grown_cooldown(breaker.cooldown);
                breaker.cooldown = grown;
                breaker.open(now);
                warn!(
                    operation_key = %self.key,
                    cooldown_ms = grown.as_millis() as u64,
                    "probe failed, circuit reopened"
                );
                Some(CircuitTransition::new(
                    CircuitState::HalfOpen,
                    CircuitState::Open,
                ))
            }
            CircuitState::HalfOpen | CircuitState::Open => None,
        };
        PermitReport::new(transition, breaker.state)
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if self.resolved || !self.probe {
            return;
        }
        let mut breaker = self.entry.lock();
        if breaker.generation == self.generation
            && breaker.state == CircuitState::HalfOpen
            && breaker.probe_in_flight
        {
            breaker.probe_in_flight = false;
            debug!(operation_key = %self.key, "probe abandoned, slot released");
        }
    }
}
