//! # Resilient Call Execution
//!
//! Process-local retry, circuit breaking and attempt monitoring for calls to
//! flaky backends.
//!
//! ## Features
//!
//! - **Error classification**: every failure is bucketed into a closed [`ErrorKind`]
//! - **Retry strategies**: exponential backoff with jitter and named presets
//! - **Circuit breakers**: per-operation state machine with a single Half-Open probe
//! - **Monitoring**: rolling per-key metrics, alerts, health reports and live events
//! - **Degradation**: fallback values for failed calls and compensating actions
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       RetryExecutor                          │
//! │  (attempt loop, backoff waits, cancellation, admin reset)    │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                      │
//!          ▼                    ▼                      ▼
//! ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────┐
//! │ BreakerRegistry │  │ classify +      │  │      Monitor        │
//! │ (per-key state, │  │ RetryStrategy   │  │ (records, metrics,  │
//! │  permits)       │  │ (pure policy)   │  │  alerts, events)    │
//! └─────────────────┘  └─────────────────┘  └─────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use docforge_resilience::prelude::*;
//!
//! # tokio_test::block_on(async {
//! let executor = RetryExecutor::default();
//!
//! let result = executor
//!     .execute(
//!         "fetch-contracts",
//!         || async { Err::<(), _>(OperationError::validation("missing template id")) },
//!         &RetryStrategy::interactive(),
//!     )
//!     .await;
//!
//! let error = result.unwrap_err();
//! assert_eq!(error.kind, ErrorKind::Validation);
//! assert_eq!(error.attempts, 1);
//! # });
//! ```

pub mod circuit_breaker;
pub mod classifier;
pub mod compensation;
pub mod config;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod serde_millis;
pub mod strategy;

/// Prelude for common imports
pub mod prelude {
    pub use crate::circuit_breaker::{BreakerRegistry, CircuitBreakerConfig, CircuitState};
    pub use crate::classifier::classify;
    pub use crate::compensation::Compensations;
    pub use crate::config::ResilienceConfig;
    pub use crate::error::{ApplicationError, ErrorKind, ExecutionError, OperationError};
    pub use crate::executor::RetryExecutor;
    pub use crate::monitor::{AggregatedMetrics, AttemptOutcome, AttemptRecord, Monitor};
    pub use crate::strategy::RetryStrategy;
}

// Re-export key types at crate root
pub use circuit_breaker::{
    BreakerRegistry, BreakerSnapshot, CircuitBreakerConfig, CircuitBreakerError, CircuitPermit,
    CircuitState, CircuitTransition, PermitReport,
};
pub use classifier::classify;
pub use compensation::{CompensationFailure, CompensationReport, Compensations};
pub use config::{ConfigError, ResilienceConfig};
pub use error::{ApplicationError, ErrorKind, ExecutionError, FailedAttempt, OperationError};
pub use executor::RetryExecutor;
pub use monitor::{
    AggregatedMetrics, Alert, AlertKind, AttemptOutcome, AttemptRecord, HealthReport,
    HealthStatus, Monitor, MonitorConfig, MonitorEvent,
};
pub use strategy::{RetryStrategy, StrategyError};
