//! Health report for dashboards

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::alerts::{Alert, AlertKind, Severity};
use super::AggregatedMetrics;
use crate::circuit_breaker::CircuitState;

/// Overall health bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            HealthStatus::Healthy
        } else if score >= 50.0 {
            HealthStatus::Warning
        } else {
            HealthStatus::Critical
        }
    }
}

/// Summary of every monitored operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// 0-100, higher is better
    pub score: f64,
    pub status: HealthStatus,
    pub total_attempts: u64,
    /// Failed plus short-circuited attempts over all attempts
    pub failure_rate: f64,
    pub open_circuits: Vec<String>,
    pub recent_alerts: Vec<Alert>,
    pub recommendations: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

/// Penalty per failure ratio point
const FAILURE_RATE_WEIGHT: f64 = 50.0;
const CRITICAL_ALERT_PENALTY: f64 = 20.0;
const OPEN_CIRCUIT_PENALTY: f64 = 10.0;

/// Build a report from per-key metrics and the most recent alerts
pub(crate) fn assess<'a>(
    metrics: impl IntoIterator<Item = &'a AggregatedMetrics>,
    recent_alerts: Vec<Alert>,
) -> HealthReport {
    let mut total_attempts = 0u64;
    let mut failed = 0u64;
    let mut open_circuits = Vec::new();

    for m in metrics {
        total_attempts += m.total();
        failed += m.failure_count + m.short_circuit_count;
        if m.current_circuit_state == CircuitState::Open {
            open_circuits.push(m.operation_key.clone());
        }
    }

    let failure_rate = failed as f64 / total_attempts.max(1) as f64;
    let critical_alerts = recent_alerts
        .iter()
        .filter(|a| a.severity == Severity::Critical)
        .count();

    let score = (100.0
        - failure_rate * FAILURE_RATE_WEIGHT
        - critical_alerts as f64 * CRITICAL_ALERT_PENALTY
        - open_circuits.len() as f64 * OPEN_CIRCUIT_PENALTY)
        .clamp(0.0, 100.0);

    let recommendations = recommend(failure_rate, &open_circuits, &recent_alerts);

    HealthReport {
        score,
        status: HealthStatus::from_score(score),
        total_attempts,
        failure_rate,
        open_circuits,
        recent_alerts,
        recommendations,
        generated_at: Utc::now(),
    }
}

fn recommend(failure_rate: f64, open_circuits: &[String], alerts: &[Alert]) -> Vec<String> {
    let mut out = Vec::new();

    if failure_rate > 0.1 {
        out.push(
            "High failure rate. Review which error kinds the strategies retry.".to_string(),
        );
    }
    if !open_circuits.is_empty() {
        out.push(format!(
            "Open circuits: {}. Investigate the backends before resetting them.",
            open_circuits.join(", ")
        ));
    }

    let has = |kind: AlertKind| alerts.iter().any(|a| a.kind == kind);
    if has(AlertKind::CircuitReopened) {
        out.push(
            "Probes keep failing. Consider a longer cooldown or a fallback path.".to_string(),
        );
    }
    if has(AlertKind::HighErrorRate) {
        out.push("Recovery rate is low. Consider caching or graceful degradation.".to_string());
    }

    out
}
