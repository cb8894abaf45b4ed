//! Compensating actions
//!
//! A [`Compensations`] stack collects undo steps while a multi-step call
//! makes progress. If the call fails, the steps run newest first; a step that
//! fails is logged and the rest still run. On success the stack is discarded.

use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::OperationError;

/// Compensating action type
pub type CompensationFn = Box<
    dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<(), OperationError>> + Send>> + Send,
>;

/// One compensating action that failed
#[derive(Debug, Clone, Serialize)]
pub struct CompensationFailure {
    pub name: String,
    pub message: String,
}

/// What running the compensations did
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompensationReport {
    /// Actions run, newest first
    pub executed: Vec<String>,
    pub failures: Vec<CompensationFailure>,
}

impl CompensationReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Stack of compensating actions for one logical call
///
/// # Example
///
/// ```
/// use docforge_resilience::{Compensations, OperationError};
///
/// # tokio_test::block_on(async {
/// let mut compensations = Compensations::new("issue-contract");
/// compensations.push("release-number", || async { Ok::<_, OperationError>(()) });
///
/// let result = compensations
///     .run(async { Err::<(), _>(OperationError::http(500, "render failed")) })
///     .await;
/// assert!(result.is_err());
/// # });
/// ```
pub struct Compensations {
    label: String,
    actions: Vec<(String, CompensationFn)>,
}

impl std::fmt::Debug for Compensations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compensations")
            .field("label", &self.label)
            .field(
                "actions",
                &self.actions.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Compensations {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            actions: Vec::new(),
        }
    }

    /// Register an undo step; the newest step runs first
    pub fn push<F, Fut, E>(&mut self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<OperationError> + Send + 'static,
    {
        let wrapped: CompensationFn = Box::new(
            move || -> Pin<Box<dyn Future<Output = Result<(), OperationError>> + Send>> {
                let pending = action();
                Box::pin(async move { pending.await.map_err(Into::into) })
            },
        );
        self.actions.push((name.into(), wrapped));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Await `operation`; compensate if it fails, then hand its result back
    pub async fn run<T, E, Fut>(self, operation: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        match operation.await {
            Ok(value) => {
                debug!(
                    label = %self.label,
                    discarded = self.actions.len(),
                    "call succeeded, compensations discarded"
                );
                Ok(value)
            }
            Err(error) => {
                self.compensate().await;
                Err(error)
            }
        }
    }

    /// Run every action newest first, continuing past failures
    pub async fn compensate(self) -> CompensationReport {
        let mut report = CompensationReport::default();
        let total = self.actions.len();

        for (name, action) in self.actions.into_iter().rev() {
            if let Err(error) = action().await {
                warn!(
                    label = %self.label,
                    compensation = %name,
                    error = %error,
                    "compensation failed"
                );
                report.failures.push(CompensationFailure {
                    name: name.clone(),
                    message: error.message,
                });
            }
            report.executed.push(name);
        }

        if report.is_clean() {
            info!(label = %self.label, total, "compensations completed");
        } else {
            warn!(
                label = %self.label,
                total,
                failed = report.failures.len(),
                "compensations completed with failures"
            );
        }
        report
    }
}
