//! Retry executor
//!
//! Runs one logical call: asks the breaker for admission, invokes the
//! operation, classifies failures, waits out the backoff and records every
//! attempt with the monitor.
//!
//! # Attempt Loop
//!
//! ```text
//!            ┌──────────────────────────────────────────────────────┐
//!            ▼                                                      │
//!   try_acquire(key) ──refused──► record short_circuited ──► Err(circuit_open)
//!            │
//!         admitted
//!            ▼
//!   operation() [+ attempt timeout] ──ok──► permit.success() ──► record ──► Ok(T)
//!            │
//!          error
//!            ▼
//!   classify ──► permit.failure() ──► record ──► should_retry? ──no──► Err(kind)
//!                                                      │
//!                                                     yes
//!                                                      ▼
//!                                        sleep(delay) or cancel ────────┘
//! ```
//!
//! Strategies that opt out of circuit breaking skip `try_acquire` and the
//! outcome reports; their records carry the breaker state as it was read.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::circuit_breaker::{BreakerRegistry, CircuitState, CircuitTransition, PermitReport};
use crate::classifier::classify;
use crate::config::{ConfigError, ResilienceConfig};
use crate::error::{ApplicationError, ErrorKind, ExecutionError, FailedAttempt, OperationError};
use crate::monitor::{AttemptOutcome, AttemptRecord, Monitor};
use crate::strategy::RetryStrategy;

/// Why the attempt loop stopped without a value
enum Halt<C> {
    Failed(ApplicationError),
    /// Cancelled with the reason and the number of completed attempts
    Cancelled(C, u32),
}

/// Executes operations under a retry strategy and per-key circuit breakers
///
/// Cheap to clone; clones share the breaker registry and the monitor.
///
/// # Example
///
/// ```
/// use docforge_resilience::{OperationError, RetryExecutor, RetryStrategy};
///
/// # tokio_test::block_on(async {
/// let executor = RetryExecutor::default();
///
/// let contracts = executor
///     .execute(
///         "fetch-contracts",
///         || async { Ok::<_, OperationError>(vec!["c-1", "c-2"]) },
///         &RetryStrategy::interactive(),
///     )
///     .await
///     .unwrap();
///
/// assert_eq!(contracts.len(), 2);
/// assert_eq!(executor.monitor().snapshot("fetch-contracts").success_count, 1);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    registry: Arc<BreakerRegistry>,
    monitor: Arc<Monitor>,
    default_strategy: RetryStrategy,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(Arc::new(BreakerRegistry::default()), Arc::new(Monitor::default()))
    }
}

impl RetryExecutor {
    /// Create an executor over an existing registry and monitor
    pub fn new(registry: Arc<BreakerRegistry>, monitor: Arc<Monitor>) -> Self {
        Self {
            registry,
            monitor,
            default_strategy: RetryStrategy::default(),
        }
    }

    /// Build the registry, monitor and default strategy from configuration
    pub fn from_config(config: &ResilienceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = Arc::new(BreakerRegistry::new(config.breaker_config()));
        let monitor = Arc::new(Monitor::new(config.monitor_config()));
        Ok(Self::new(registry, monitor).with_default_strategy(config.default_strategy()?))
    }

    /// Strategy used by [`execute_default`](Self::execute_default)
    pub fn with_default_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn registry(&self) -> &Arc<BreakerRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn default_strategy(&self) -> &RetryStrategy {
        &self.default_strategy
    }

    /// Run `operation` under `strategy` and the breaker for `key`
    ///
    /// `operation` is called once per admitted attempt. The call makes at most
    /// `strategy.max_attempts()` attempts and never invokes the operation
    /// while the breaker refuses admission.
    pub async fn execute<T, E, F, Fut>(
        &self,
        key: &str,
        operation: F,
        strategy: &RetryStrategy,
    ) -> Result<T, ApplicationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<OperationError>,
    {
        match self
            .run(key, operation, strategy, std::future::pending::<Infallible>())
            .await
        {
            Ok(value) => Ok(value),
            Err(Halt::Failed(error)) => Err(error),
            Err(Halt::Cancelled(never, _)) => match never {},
        }
    }

    /// [`execute`](Self::execute) with the executor's default strategy
    pub async fn execute_default<T, E, F, Fut>(
        &self,
        key: &str,
        operation: F,
    ) -> Result<T, ApplicationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<OperationError>,
    {
        self.execute(key, operation, &self.default_strategy).await
    }

    /// [`execute`](Self::execute) that degrades to a fallback value
    ///
    /// Once the call has failed (retries exhausted, a non-recoverable error
    /// or an open circuit) the value built by `fallback` is returned instead.
    /// The failure is still recorded by the monitor and counted by the
    /// breaker.
    pub async fn execute_with_fallback<T, E, F, Fut, G>(
        &self,
        key: &str,
        operation: F,
        strategy: &RetryStrategy,
        fallback: G,
    ) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<OperationError>,
        G: FnOnce(&ApplicationError) -> T,
    {
        match self.execute(key, operation, strategy).await {
            Ok(value) => value,
            Err(error) => {
                warn!(
                    operation_key = %key,
                    kind = %error.kind,
                    attempts = error.attempts,
                    "call failed, serving fallback"
                );
                fallback(&error)
            }
        }
    }

    /// [`execute`](Self::execute) that stops as soon as `cancel` fires
    ///
    /// Cancelling drops the in-flight attempt or aborts the backoff wait. It
    /// counts as neither success nor failure for the breaker, and a held
    /// Half-Open probe slot is released.
    pub async fn execute_cancellable<T, E, F, Fut>(
        &self,
        key: &str,
        operation: F,
        strategy: &RetryStrategy,
        cancel: &CancellationToken,
    ) -> Result<T, ExecutionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<OperationError>,
    {
        match self.run(key, operation, strategy, cancel.cancelled()).await {
            Ok(value) => Ok(value),
            Err(Halt::Failed(error)) => Err(ExecutionError::Failed(error)),
            Err(Halt::Cancelled((), attempts)) => {
                info!(operation_key = %key, attempts, "call cancelled");
                Err(ExecutionError::Cancelled {
                    operation_key: key.to_string(),
                    attempts,
                })
            }
        }
    }

    /// Force the breaker for `key` closed
    ///
    /// Returns the transition if the breaker was not already closed.
    pub fn reset_circuit(&self, key: &str) -> Option<CircuitTransition> {
        let transition = self.registry.reset(key);
        match transition {
            Some(transition) => self.monitor.record_circuit_reset(key, transition),
            None => debug!(operation_key = %key, "reset requested for a closed circuit"),
        }
        transition
    }

    #[instrument(skip_all, fields(operation_key = %key, strategy = %strategy.name()))]
    async fn run<T, E, F, Fut, C>(
        &self,
        key: &str,
        mut operation: F,
        strategy: &RetryStrategy,
        cancel: C,
    ) -> Result<T, Halt<C::Output>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<OperationError>,
        C: Future,
    {
        tokio::pin!(cancel);

        let call_id = Uuid::now_v7();
        let mut history = Vec::new();
        let mut last_error: Option<OperationError> = None;
        let mut attempt = 0u32;

        loop {
            if let Some(reason) = (&mut cancel).now_or_never() {
                return Err(Halt::Cancelled(reason, attempt));
            }
            attempt += 1;

            let permit = if !strategy.uses_circuit_breaker() {
                None
            } else {
                match self.registry.try_acquire(key) {
                    Ok(permit) => Some(permit),
                    Err(rejected) => {
                        debug!(attempt, reason = %rejected, "attempt short-circuited");
                        self.monitor.record(
                            AttemptRecord::new(
                                key,
                                attempt,
                                AttemptOutcome::ShortCircuited,
                                rejected.state(),
                            )
                            .with_call_id(call_id)
                            .with_error_kind(ErrorKind::CircuitOpen),
                        );
                        history.push(FailedAttempt {
                            attempt,
                            kind: ErrorKind::CircuitOpen,
                            message: rejected.to_string(),
                        });
                        return Err(Halt::Failed(ApplicationError {
                            operation_key: key.to_string(),
                            kind: ErrorKind::CircuitOpen,
                            attempts: attempt,
                            cause: last_error,
                            history,
                        }));
                    }
                }
            };

            let (admitted_in, admission) = match &permit {
                Some(permit) => (permit.state(), permit.admission_transition()),
                None => (self.registry.state(key), None),
            };
            let started = Instant::now();

            let result = tokio::select! {
                biased;
                reason = &mut cancel => return Err(Halt::Cancelled(reason, attempt - 1)),
                result = invoke(operation(), strategy.attempt_timeout()) => result,
            };
            let latency = started.elapsed();

            let record = AttemptRecord::new(key, attempt, AttemptOutcome::Success, admitted_in)
                .with_call_id(call_id)
                .with_latency(latency)
                .with_transition(admission);

            let error = match result {
                Ok(value) => {
                    let report = match permit {
                        Some(permit) => permit.success(),
                        None => self.unguarded_report(key),
                    };
                    self.monitor.record(record.with_report(report));
                    if attempt > 1 {
                        info!(attempt, "succeeded after retry");
                    } else {
                        debug!(attempt, latency_ms = latency.as_millis() as u64, "attempt succeeded");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let kind = classify(&error);
            let report = match permit {
                Some(permit) => permit.failure(),
                None => self.unguarded_report(key),
            };
            self.monitor.record(AttemptRecord {
                outcome: AttemptOutcome::Failure,
                ..record.with_error_kind(kind).with_report(report)
            });
            history.push(FailedAttempt {
                attempt,
                kind,
                message: error.message.clone(),
            });
            debug!(attempt, %kind, error = %error, "attempt failed");

            if !strategy.should_retry(kind, attempt) {
                if kind.is_recoverable() {
                    warn!(attempts = attempt, %kind, "retries exhausted");
                }
                return Err(Halt::Failed(ApplicationError {
                    operation_key: key.to_string(),
                    kind,
                    attempts: attempt,
                    cause: Some(error),
                    history,
                }));
            }

            let tripped = report.transition.is_some_and(|t| t.to == CircuitState::Open);
            let delay = if tripped {
                Duration::ZERO
            } else {
                strategy.delay_before_retry(attempt, error.retry_after)
            };
            last_error = Some(error);

            if delay.is_zero() {
                continue;
            }

            debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after delay");
            tokio::select! {
                biased;
                reason = &mut cancel => return Err(Halt::Cancelled(reason, attempt)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Breaker state for an attempt that bypassed the breaker
    fn unguarded_report(&self, key: &str) -> PermitReport {
        PermitReport {
            transition: None,
            state: self.registry.state(key),
        }
    }
}

/// Await one invocation, bounded by the attempt timeout
async fn invoke<T, E, Fut>(
    invocation: Fut,
    timeout: Option<Duration>,
) -> Result<T, OperationError>
where
    Fut: Future<Output = Result<T, E>>,
    E: Into<OperationError>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, invocation).await {
            Ok(result) => result.map_err(Into::into),
            Err(elapsed) => Err(OperationError::timeout(format!(
                "attempt timed out after {limit:?}"
            ))
            .with_source(elapsed)),
        },
        None => invocation.await.map_err(Into::into),
    }
}
