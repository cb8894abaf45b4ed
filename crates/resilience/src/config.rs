// Resilience configuration
//
// Breaker, monitor and default strategy settings, loaded from environment
// variables.

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::monitor::{AlertThresholds, MonitorConfig};
use crate::strategy::{RetryStrategy, PRESET_NAMES};

/// Semantically invalid configuration
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("failure threshold must be at least 1")]
    ZeroThreshold,

    #[error("{name} must be at least 1")]
    ZeroCapacity { name: &'static str },

    #[error("cooldown multiplier must be a finite number >= 1.0, got {0}")]
    InvalidMultiplier(f64),

    #[error("max cooldown ({max:?}) is shorter than cooldown ({cooldown:?})")]
    MaxCooldownBelowCooldown { cooldown: Duration, max: Duration },

    #[error("error rate alert threshold must be within [0, 1], got {0}")]
    InvalidErrorRate(f64),

    #[error("unknown retry strategy {name:?}, expected one of {expected:?}")]
    UnknownStrategy {
        name: String,
        expected: &'static [&'static str],
    },
}

/// Configuration for the executor, its breakers and its monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Failures within the window that open a circuit
    pub failure_threshold: u32,

    #[serde(with = "crate::serde_millis")]
    pub failure_window: Duration,

    #[serde(with = "crate::serde_millis")]
    pub cooldown: Duration,

    #[serde(with = "crate::serde_millis")]
    pub max_cooldown: Duration,

    pub cooldown_multiplier: f64,

    /// Attempt records retained per operation key
    pub monitor_capacity: usize,

    pub alert_capacity: usize,

    /// Failure ratio above which a high error rate alert is raised
    pub error_rate_alert: f64,

    pub alert_min_samples: usize,

    /// Preset used when a caller does not pick a strategy
    pub default_strategy: String,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        let breaker = CircuitBreakerConfig::default();
        let monitor = MonitorConfig::default();
        Self {
            failure_threshold: breaker.failure_threshold,
            failure_window: breaker.failure_window,
            cooldown: breaker.cooldown,
            max_cooldown: breaker.max_cooldown,
            cooldown_multiplier: breaker.cooldown_multiplier,
            monitor_capacity: monitor.capacity_per_key,
            alert_capacity: monitor.alert_capacity,
            error_rate_alert: monitor.alert_thresholds.error_rate,
            alert_min_samples: monitor.alert_thresholds.min_samples,
            default_strategy: "interactive".to_string(),
        }
    }
}

impl ResilienceConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `RESILIENCE_FAILURE_THRESHOLD`: failures that open a circuit (default: 5)
    /// - `RESILIENCE_FAILURE_WINDOW_MS`: failure counting window (default: 60000)
    /// - `RESILIENCE_COOLDOWN_MS`: wait before a Half-Open probe (default: 60000)
    /// - `RESILIENCE_MAX_COOLDOWN_MS`: cap for the grown cooldown (default: 300000)
    /// - `RESILIENCE_COOLDOWN_MULTIPLIER`: growth after a failed probe (default: 2.0)
    /// - `RESILIENCE_MONITOR_CAPACITY`: records kept per key (default: 200)
    /// - `RESILIENCE_ALERT_CAPACITY`: alerts kept (default: 100)
    /// - `RESILIENCE_ERROR_RATE_ALERT`: failure ratio that raises an alert (default: 0.1)
    /// - `RESILIENCE_ALERT_MIN_SAMPLES`: records needed before alerting (default: 10)
    /// - `RESILIENCE_DEFAULT_STRATEGY`: preset name (default: interactive)
    ///
    /// Unparseable values are logged and replaced by the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |name: &str, default: Duration| {
            Duration::from_millis(parse_or(&lookup, name, default.as_millis() as u64))
        };

        Self {
            failure_threshold: parse_or(
                &lookup,
                "RESILIENCE_FAILURE_THRESHOLD",
                defaults.failure_threshold,
            ),
            failure_window: millis("RESILIENCE_FAILURE_WINDOW_MS", defaults.failure_window),
            cooldown: millis("RESILIENCE_COOLDOWN_MS", defaults.cooldown),
            max_cooldown: millis("RESILIENCE_MAX_COOLDOWN_MS", defaults.max_cooldown),
            cooldown_multiplier: parse_or(
                &lookup,
                "RESILIENCE_COOLDOWN_MULTIPLIER",
                defaults.cooldown_multiplier,
            ),
            monitor_capacity: parse_or(
                &lookup,
                "RESILIENCE_MONITOR_CAPACITY",
                defaults.monitor_capacity,
            ),
            alert_capacity: parse_or(&lookup, "RESILIENCE_ALERT_CAPACITY", defaults.alert_capacity),
            error_rate_alert: parse_or(
                &lookup,
                "RESILIENCE_ERROR_RATE_ALERT",
                defaults.error_rate_alert,
            ),
            alert_min_samples: parse_or(
                &lookup,
                "RESILIENCE_ALERT_MIN_SAMPLES",
                defaults.alert_min_samples,
            ),
            default_strategy: lookup("RESILIENCE_DEFAULT_STRATEGY")
                .map(|v| v.trim().to_lowercase())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.default_strategy),
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_max_cooldown(mut self, max: Duration) -> Self {
        self.max_cooldown = max;
        self
    }

    pub fn with_monitor_capacity(mut self, capacity: usize) -> Self {
        self.monitor_capacity = capacity;
        self
    }

    pub fn with_default_strategy(mut self, name: impl Into<String>) -> Self {
        self.default_strategy = name.into();
        self
    }

    /// Check values that parse but make no sense
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::ZeroThreshold);
        }
        if self.monitor_capacity == 0 {
            return Err(ConfigError::ZeroCapacity {
                name: "monitor capacity",
            });
        }
        if self.alert_capacity == 0 {
            return Err(ConfigError::ZeroCapacity {
                name: "alert capacity",
            });
        }
        if !self.cooldown_multiplier.is_finite() || self.cooldown_multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier(self.cooldown_multiplier));
        }
        if self.max_cooldown < self.cooldown {
            return Err(ConfigError::MaxCooldownBelowCooldown {
                cooldown: self.cooldown,
                max: self.max_cooldown,
            });
        }
        if !(0.0..=1.0).contains(&self.error_rate_alert) {
            return Err(ConfigError::InvalidErrorRate(self.error_rate_alert));
        }
        self.default_strategy().map(|_| ())
    }

    /// Resolve the default strategy preset
    pub fn default_strategy(&self) -> Result<RetryStrategy, ConfigError> {
        RetryStrategy::named(&self.default_strategy).ok_or_else(|| ConfigError::UnknownStrategy {
            name: self.default_strategy.clone(),
            expected: &PRESET_NAMES,
        })
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            failure_window: self.failure_window,
            cooldown: self.cooldown,
            cooldown_multiplier: self.cooldown_multiplier,
            max_cooldown: self.max_cooldown,
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            capacity_per_key: self.monitor_capacity,
            alert_capacity: self.alert_capacity,
            alert_thresholds: AlertThresholds {
                error_rate: self.error_rate_alert,
                min_samples: self.alert_min_samples,
            },
            ..MonitorConfig::default()
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match lookup(name) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(err) => {
                warn!(variable = name, value = %raw, %default, error = %err, "invalid value, using default");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_vars(vars: &[(&str, &str)]) -> ResilienceConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ResilienceConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_vars(&[]);
        assert_eq!(config, ResilienceConfig::default());
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.cooldown, Duration::from_secs(60));
        assert_eq!(config.monitor_capacity, 200);
        assert!(config.validate().is_ok());
        assert_eq!(config.default_strategy().unwrap().name(), "interactive");
    }

    #[test]
    fn test_reads_variables() {
        let config = from_vars(&[
            ("RESILIENCE_FAILURE_THRESHOLD", "3"),
            ("RESILIENCE_COOLDOWN_MS", "1500"),
            ("RESILIENCE_COOLDOWN_MULTIPLIER", "1.5"),
            ("RESILIENCE_ERROR_RATE_ALERT", "0.25"),
            ("RESILIENCE_DEFAULT_STRATEGY", " Background_Sync "),
        ]);

        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.cooldown, Duration::from_millis(1500));
        assert_eq!(config.default_strategy, "background_sync");

        let breaker = config.breaker_config();
        assert_eq!(breaker.failure_threshold, 3);
        assert_eq!(breaker.cooldown_multiplier, 1.5);

        let monitor = config.monitor_config();
        assert_eq!(monitor.alert_thresholds.error_rate, 0.25);
        assert_eq!(monitor.event_buffer, MonitorConfig::default().event_buffer);
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let config = from_vars(&[
            ("RESILIENCE_FAILURE_THRESHOLD", "many"),
            ("RESILIENCE_COOLDOWN_MS", "-1"),
        ]);
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.cooldown, Duration::from_secs(60));
    }

    #[test]
    fn test_validate() {
        let base = ResilienceConfig::default();

        assert_eq!(
            base.clone().with_failure_threshold(0).validate(),
            Err(ConfigError::ZeroThreshold)
        );
        assert!(matches!(
            base.clone().with_monitor_capacity(0).validate(),
            Err(ConfigError::ZeroCapacity { .. })
        ));
        assert!(matches!(
            base.clone()
                .with_max_cooldown(Duration::from_secs(1))
                .validate(),
            Err(ConfigError::MaxCooldownBelowCooldown { .. })
        ));
        assert!(matches!(
            base.clone().with_default_strategy("aggressive").validate(),
            Err(ConfigError::UnknownStrategy { .. })
        ));

        let mut bad_rate = base;
        bad_rate.error_rate_alert = 1.5;
        assert_eq!(bad_rate.validate(), Err(ConfigError::InvalidErrorRate(1.5)));
    }

    #[test]
    fn test_serialization_uses_millis() {
        let json = serde_json::to_value(ResilienceConfig::default()).unwrap();
        assert_eq!(json["cooldown"], 60_000);
        assert_eq!(json["default_strategy"], "interactive");
    }
}
