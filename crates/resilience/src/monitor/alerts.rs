//! Alerts raised from attempt records
//!
//! Alerts are kept in a bounded log; the oldest is evicted once the log is
//! full.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::{CircuitState, CircuitTransition};

/// How urgent an alert is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// What an alert is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// A circuit went from closed to open
    CircuitOpened,
    /// A Half-Open probe failed and the circuit opened again
    CircuitReopened,
    /// Failure ratio over the retained window crossed the threshold
    HighErrorRate,
}

/// One alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub operation_key: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// When to raise error-rate alerts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Failure ratio (0.0-1.0) above which an alert is raised
    pub error_rate: f64,

    /// Minimum retained records before the ratio is trusted
    pub min_samples: usize,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate: 0.1,
            min_samples: 10,
        }
    }
}

impl Alert {
    /// Alert for a transition into `Open`, if it is one
    pub(crate) fn for_transition(key: &str, transition: CircuitTransition) -> Option<Self> {
        let (kind, severity, message) = match (transition.from, transition.to) {
            (CircuitState::Closed, CircuitState::Open) => (
                AlertKind::CircuitOpened,
                Severity::High,
                format!("circuit breaker {key} opened"),
            ),
            (CircuitState::HalfOpen, CircuitState::Open) => (
                AlertKind::CircuitReopened,
                Severity::High,
                format!("circuit breaker {key} probe failed, reopened"),
            ),
            _ => return None,
        };

        Some(Self {
            kind,
            severity,
            operation_key: key.to_string(),
            message,
            raised_at: Utc::now(),
        })
    }

    pub(crate) fn high_error_rate(key: &str, rate: f64, samples: usize) -> Self {
        let severity = if rate >= 0.5 {
            Severity::Critical
        } else {
            Severity::High
        };
        Self {
            kind: AlertKind::HighErrorRate,
            severity,
            operation_key: key.to_string(),
            message: format!(
                "high failure rate for {key}: {:.1}% over {samples} attempts",
                rate * 100.0
            ),
            raised_at: Utc::now(),
        }
    }
}

/// Bounded alert history
#[derive(Debug)]
pub(crate) struct AlertLog {
    capacity: usize,
    alerts: VecDeque<Alert>,
}

impl AlertLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            alerts: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, alert: Alert) {
        if self.alerts.len() == self.capacity {
            self.alerts.pop_front();
        }
        self.alerts.push_back(alert);
    }

    /// Most recent alerts, newest first
    pub(crate) fn recent(&self, limit: usize) -> Vec<Alert> {
        self.alerts.iter().rev().take(limit).cloned().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.alerts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_openings_raise_alerts() {
        let opened = CircuitTransition {
            from: CircuitState::Closed,
            to: CircuitState::Open,
        };
        let closed = CircuitTransition {
            from: CircuitState::HalfOpen,
            to: CircuitState::Closed,
        };

        let alert = Alert::for_transition("fetch-contracts", opened).unwrap();
        assert_eq!(alert.kind, AlertKind::CircuitOpened);
        assert_eq!(alert.severity, Severity::High);
        assert!(Alert::for_transition("fetch-contracts", closed).is_none());
    }

    #[test]
    fn test_error_rate_severity() {
        assert_eq!(Alert::high_error_rate("k", 0.2, 10).severity, Severity::High);
        assert_eq!(Alert::high_error_rate("k", 0.8, 10).severity, Severity::Critical);
    }

    #[test]
    fn test_log_evicts_oldest_and_lists_newest_first() {
        let mut log = AlertLog::new(2);
        for key in ["a", "b", "c"] {
            log.push(Alert::high_error_rate(key, 0.2, 10));
        }

        let keys: Vec<_> = log
            .recent(10)
            .into_iter()
            .map(|a| a.operation_key)
            .collect();
        assert_eq!(keys, vec!["c", "b"]);
        assert_eq!(log.recent(1).len(), 1);
    }
}
