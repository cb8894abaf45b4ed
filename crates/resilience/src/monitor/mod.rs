//! Attempt monitoring
//!
//! The [`Monitor`] receives an [`AttemptRecord`] for every attempt the
//! executor makes and keeps the last `capacity_per_key` records per operation
//! key. Metrics are recomputed from that buffer on read.
//!
//! # Data Flow
//!
//! ```text
//! RetryExecutor ──record()──► Monitor ──► per-key ring buffer (append, evict oldest)
//!                                │
//!                                ├──► alert log (bounded)
//!                                └──► broadcast channel ──► live dashboards
//!
//! Dashboards ──snapshot() / snapshot_all() / health_report()──► Monitor
//! ```
//!
//! Percentiles use the nearest-rank method over the sorted latencies of
//! attempts that actually invoked the operation, so a fixed sequence of
//! records always yields the same numbers.
//!
//! Operator resets enter the same history as [`AttemptOutcome::OperatorReset`]
//! entries so breaker flapping can be charted from [`Monitor::records`]; they
//! are not attempts and never count towards the metrics.

pub mod alerts;
pub mod health;

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, trace};
use uuid::Uuid;

use crate::circuit_breaker::{CircuitState, CircuitTransition, PermitReport};
use crate::error::ErrorKind;

pub use alerts::{Alert, AlertKind, AlertThresholds, Severity};
pub use health::{HealthReport, HealthStatus};

use alerts::AlertLog;

/// Outcome of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    /// Refused by the circuit breaker; the operation was not invoked
    ShortCircuited,
    /// Breaker forced closed by an operator; not an attempt
    OperatorReset,
}

impl AttemptOutcome {
    /// Whether this entry stands for an attempt of the operation
    pub fn is_attempt(self) -> bool {
        !matches!(self, AttemptOutcome::OperatorReset)
    }
}

/// Record of a single attempt
///
/// Created once by the executor and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Identifies the logical call the attempt belongs to
    pub call_id: Uuid,
    pub operation_key: String,
    /// 1-based attempt number within the call (0 for operator resets)
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub error_kind: Option<ErrorKind>,
    #[serde(with = "crate::serde_millis")]
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
    /// Breaker state the attempt was admitted (or refused) in
    pub circuit_state: CircuitState,
    /// Breaker transitions caused by this attempt, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<CircuitTransition>,
    /// Breaker state right after the outcome was reported, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_state: Option<CircuitState>,
}

impl AttemptRecord {
    /// Create a record stamped with the current time
    pub fn new(
        operation_key: impl Into<String>,
        attempt: u32,
        outcome: AttemptOutcome,
        circuit_state: CircuitState,
    ) -> Self {
        Self {
            call_id: Uuid::now_v7(),
            operation_key: operation_key.into(),
            attempt,
            outcome,
            error_kind: None,
            latency: Duration::ZERO,
            timestamp: Utc::now(),
            circuit_state,
            transitions: Vec::new(),
            settled_state: None,
        }
    }

    pub fn with_call_id(mut self, call_id: Uuid) -> Self {
        self.call_id = call_id;
        self
    }

    pub fn with_error_kind(mut self, kind: ErrorKind) -> Self {
        self.error_kind = Some(kind);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_transition(mut self, transition: Option<CircuitTransition>) -> Self {
        self.transitions.extend(transition);
        self
    }

    /// Take the transition and the resulting state from a breaker report
    pub fn with_report(mut self, report: PermitReport) -> Self {
        self.transitions.extend(report.transition);
        self.settled_state = Some(report.state);
        self
    }

    /// Breaker state once this attempt was done
    pub fn circuit_state_after(&self) -> CircuitState {
        self.settled_state
            .or_else(|| self.transitions.last().map(|t| t.to))
            .unwrap_or(self.circuit_state)
    }
}

/// Metrics derived from the retained records of one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    pub operation_key: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub short_circuit_count: u64,
    /// Successes over all retained attempts
    pub success_rate: f64,
    #[serde(with = "crate::serde_millis")]
    pub mean_latency: Duration,
    #[serde(with = "crate::serde_millis")]
    pub p50_latency: Duration,
    #[serde(with = "crate::serde_millis")]
    pub p95_latency: Duration,
    #[serde(with = "crate::serde_millis")]
    pub p99_latency: Duration,
    pub error_kinds: BTreeMap<ErrorKind, u64>,
    pub current_circuit_state: CircuitState,
    /// Breaker transitions seen since the key was first recorded
    pub transitions: u64,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl AggregatedMetrics {
    /// Metrics of a key nothing was recorded for
    pub fn empty(operation_key: impl Into<String>) -> Self {
        Self {
            operation_key: operation_key.into(),
            success_count: 0,
            failure_count: 0,
            short_circuit_count: 0,
            success_rate: 0.0,
            mean_latency: Duration::ZERO,
            p50_latency: Duration::ZERO,
            p95_latency: Duration::ZERO,
            p99_latency: Duration::ZERO,
            error_kinds: BTreeMap::new(),
            current_circuit_state: CircuitState::Closed,
            transitions: 0,
            last_attempt_at: None,
        }
    }

    /// Number of retained attempts (operator resets excluded)
    pub fn total(&self) -> u64 {
        self.success_count + self.failure_count + self.short_circuit_count
    }
}

/// Event pushed to subscribers
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Attempt(AttemptRecord),
    Alert(Alert),
    CircuitReset {
        operation_key: String,
        transition: CircuitTransition,
    },
}

/// Monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Records retained per operation key
    pub capacity_per_key: usize,

    /// Alerts retained
    pub alert_capacity: usize,

    pub alert_thresholds: AlertThresholds,

    /// Events buffered per subscriber before it starts lagging
    pub event_buffer: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            capacity_per_key: 200,
            alert_capacity: 100,
            alert_thresholds: AlertThresholds::default(),
            event_buffer: 256,
        }
    }
}

impl MonitorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity_per_key(mut self, capacity: usize) -> Self {
        self.capacity_per_key = capacity.max(1);
        self
    }

    pub fn with_alert_capacity(mut self, capacity: usize) -> Self {
        self.alert_capacity = capacity.max(1);
        self
    }

    pub fn with_alert_thresholds(mut self, thresholds: AlertThresholds) -> Self {
        self.alert_thresholds = thresholds;
        self
    }
}

#[derive(Debug)]
struct KeyBuffer {
    records: VecDeque<AttemptRecord>,
    circuit_state: CircuitState,
    transitions: u64,
    error_rate_alerting: bool,
}

impl KeyBuffer {
    fn new() -> Self {
        Self {
            records: VecDeque::new(),
            circuit_state: CircuitState::Closed,
            transitions: 0,
            error_rate_alerting: false,
        }
    }

    fn push(&mut self, record: AttemptRecord, capacity: usize) {
        while self.records.len() >= capacity.max(1) {
            self.records.pop_front();
        }
        self.circuit_state = record.circuit_state_after();
        self.transitions += record.transitions.len() as u64;
        self.records.push_back(record);
    }

    fn attempts(&self) -> impl Iterator<Item = &AttemptRecord> {
        self.records.iter().filter(|r| r.outcome.is_attempt())
    }

    fn failure_rate(&self) -> (f64, usize) {
        let (mut samples, mut failed) = (0usize, 0usize);
        for record in self.attempts() {
            samples += 1;
            if record.outcome != AttemptOutcome::Success {
                failed += 1;
            }
        }
        (failed as f64 / samples.max(1) as f64, samples)
    }

    fn aggregate(&self, key: &str) -> AggregatedMetrics {
        let mut metrics = AggregatedMetrics::empty(key);
        let mut latencies = Vec::with_capacity(self.records.len());

        for record in self.attempts() {
            match record.outcome {
                AttemptOutcome::Success => metrics.success_count += 1,
                AttemptOutcome::Failure => metrics.failure_count += 1,
                AttemptOutcome::ShortCircuited => metrics.short_circuit_count += 1,
                AttemptOutcome::OperatorReset => {}
            }
            if record.outcome != AttemptOutcome::ShortCircuited {
                latencies.push(record.latency);
            }
            if let Some(kind) = record.error_kind {
                *metrics.error_kinds.entry(kind).or_insert(0) += 1;
            }
        }

        let total = metrics.total();
        if total > 0 {
            metrics.success_rate = metrics.success_count as f64 / total as f64;
        }

        latencies.sort_unstable();
        if !latencies.is_empty() {
            let sum: Duration = latencies.iter().sum();
            metrics.mean_latency = sum / latencies.len() as u32;
        }
        metrics.p50_latency = percentile(&latencies, 0.50);
        metrics.p95_latency = percentile(&latencies, 0.95);
        metrics.p99_latency = percentile(&latencies, 0.99);

        metrics.current_circuit_state = self.circuit_state;
        metrics.transitions = self.transitions;
        metrics.last_attempt_at = self.attempts().last().map(|r| r.timestamp);
        metrics
    }
}

/// Nearest-rank percentile of sorted samples (`p` in 0.0-1.0)
fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// In-memory attempt monitor
///
/// Append-only per key with eviction of the oldest record; queries never
/// change state.
///
/// # Example
///
/// ```
/// use docforge_resilience::monitor::{AttemptOutcome, AttemptRecord, Monitor};
/// use docforge_resilience::CircuitState;
///
/// let monitor = Monitor::default();
/// monitor.record(AttemptRecord::new(
///     "fetch-contracts",
///     1,
///     AttemptOutcome::Success,
///     CircuitState::Closed,
/// ));
///
/// assert_eq!(monitor.snapshot("fetch-contracts").success_count, 1);
/// ```
pub struct Monitor {
    config: MonitorConfig,
    buffers: DashMap<String, KeyBuffer>,
    alerts: Mutex<AlertLog>,
    events: broadcast::Sender<MonitorEvent>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("config", &self.config)
            .field("keys", &self.buffers.len())
            .finish()
    }
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let alerts = Mutex::new(AlertLog::new(config.alert_capacity));
        Self {
            config,
            buffers: DashMap::new(),
            alerts,
            events,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Append an attempt record
    ///
    /// Evicts the oldest record of the key when its buffer is full, raises
    /// alerts and notifies subscribers. Never blocks on subscribers.
    pub fn record(&self, record: AttemptRecord) {
        let key = record.operation_key.clone();
        let mut raised = Vec::new();

        for transition in &record.transitions {
            raised.extend(Alert::for_transition(&key, *transition));
        }

        {
            let mut buffer = self
                .buffers
                .entry(key.clone())
                .or_insert_with(KeyBuffer::new);
            buffer.push(record.clone(), self.config.capacity_per_key);

            let thresholds = &self.config.alert_thresholds;
            let (rate, samples) = buffer.failure_rate();
            if samples >= thresholds.min_samples && rate > thresholds.error_rate {
                if !buffer.error_rate_alerting {
                    buffer.error_rate_alerting = true;
                    raised.push(Alert::high_error_rate(&key, rate, samples));
                }
            } else if rate <= thresholds.error_rate {
                buffer.error_rate_alerting = false;
            }
        }

        trace!(
            operation_key = %key,
            attempt = record.attempt,
            outcome = ?record.outcome,
            "attempt recorded"
        );

        let _ = self.events.send(MonitorEvent::Attempt(record));

        if !raised.is_empty() {
            let mut log = self.alerts.lock();
            for alert in raised {
                info!(
                    operation_key = %alert.operation_key,
                    kind = ?alert.kind,
                    severity = ?alert.severity,
                    "{}",
                    alert.message
                );
                log.push(alert.clone());
                let _ = self.events.send(MonitorEvent::Alert(alert));
            }
        }
    }

    /// Note an operator reset that happened outside any attempt
    ///
    /// The reset is appended to the key's history as an
    /// [`AttemptOutcome::OperatorReset`] entry.
    pub fn record_circuit_reset(&self, key: &str, transition: CircuitTransition) {
        let entry = AttemptRecord::new(key, 0, AttemptOutcome::OperatorReset, transition.from)
            .with_transition(Some(transition));
        self.buffers
            .entry(key.to_string())
            .or_insert_with(KeyBuffer::new)
            .push(entry, self.config.capacity_per_key);

        let _ = self.events.send(MonitorEvent::CircuitReset {
            operation_key: key.to_string(),
            transition,
        });
    }

    /// Metrics for one key (empty metrics for unknown keys)
    pub fn snapshot(&self, key: &str) -> AggregatedMetrics {
        self.buffers
            .get(key)
            .map(|buffer| buffer.aggregate(key))
            .unwrap_or_else(|| AggregatedMetrics::empty(key))
    }

    /// Metrics for every key, ordered by key
    pub fn snapshot_all(&self) -> BTreeMap<String, AggregatedMetrics> {
        self.buffers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().aggregate(entry.key())))
            .collect()
    }

    /// Records retained for a key, oldest first, operator resets included
    pub fn records(&self, key: &str) -> Vec<AttemptRecord> {
        self.buffers
            .get(key)
            .map(|buffer| buffer.records.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of keys whose last known circuit state is open
    pub fn open_circuit_count(&self) -> usize {
        self.buffers
            .iter()
            .filter(|entry| entry.value().circuit_state == CircuitState::Open)
            .count()
    }

    /// Most recent alerts, newest first
    pub fn alerts(&self, limit: usize) -> Vec<Alert> {
        self.alerts.lock().recent(limit)
    }

    /// Subscribe to records, alerts and resets as they happen
    ///
    /// A subscriber that falls more than `event_buffer` events behind
    /// loses the oldest ones.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Score every monitored key
    pub fn health_report(&self) -> HealthReport {
        let metrics = self.snapshot_all();
        health::assess(metrics.values(), self.alerts(5))
    }

    /// Drop all records and alerts
    pub fn reset(&self) {
        let keys = self.buffers.len();
        self.buffers.clear();
        self.alerts.lock().clear();
        info!(keys, "monitor reset, attempt buffers and alerts cleared");
    }
}
