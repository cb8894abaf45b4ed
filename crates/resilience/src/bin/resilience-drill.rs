//! Operator drill
//!
//! Drives a simulated contract backend through transient failures, an outage
//! with a cached fallback, recovery and an operator reset, then prints the
//! metrics and the health report as JSON.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use docforge_resilience::{
    CircuitBreakerConfig, OperationError, ResilienceConfig, RetryExecutor, RetryStrategy,
};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const FETCH_CONTRACTS: &str = "fetch-contracts";

#[derive(Debug, Clone, Serialize)]
struct Contract {
    id: String,
    status: &'static str,
}

/// Contract store that can be told to misbehave
#[derive(Debug, Default)]
struct SimulatedBackend {
    down: AtomicBool,
    transient_failures: AtomicU32,
    calls: AtomicU32,
}

impl SimulatedBackend {
    async fn fetch_contracts(&self) -> Result<Vec<Contract>, OperationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;

        if self.down.load(Ordering::SeqCst) {
            return Err(OperationError::http(503, "service unavailable")
                .with_retry_after(Duration::from_millis(20)));
        }
        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(OperationError::network("connection reset by peer"));
        }

        Ok((1..=3)
            .map(|n| Contract {
                id: format!("ctr-{n:03}"),
                status: "active",
            })
            .collect())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load before the subscriber so RUST_LOG from .env applies
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docforge_resilience=debug,resilience_drill=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Ok(path) = dotenv {
        tracing::info!("Loaded .env from {:?}", path);
    }

    let config = ResilienceConfig::from_env();
    let executor = RetryExecutor::from_config(&config).context("invalid resilience configuration")?;
    executor.registry().configure(
        FETCH_CONTRACTS,
        CircuitBreakerConfig::default()
            .with_failure_threshold(3)
            .with_cooldown(Duration::from_millis(250))
            .with_max_cooldown(Duration::from_secs(1)),
    );

    tracing::info!(default_strategy = %executor.default_strategy().name(), "resilience drill starting");

    let backend = Arc::new(SimulatedBackend::default());
    let fast = |strategy: RetryStrategy| {
        strategy
            .with_base_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(100))
    };
    let fetch = || {
        let backend = Arc::clone(&backend);
        async move { backend.fetch_contracts().await }
    };

    // Transient failures are absorbed by retries
    backend.transient_failures.store(2, Ordering::SeqCst);
    let contracts = executor
        .execute(FETCH_CONTRACTS, fetch, &fast(RetryStrategy::interactive()))
        .await
        .context("transient failures should be retried away")?;
    tracing::info!(count = contracts.len(), "contracts fetched after transient failures");

    // An outage trips the breaker and later calls fail fast
    backend.down.store(true, Ordering::SeqCst);
    for round in 1..=3 {
        match executor
            .execute(FETCH_CONTRACTS, fetch, &fast(RetryStrategy::background_sync()))
            .await
        {
            Ok(_) => tracing::warn!(round, "outage call unexpectedly succeeded"),
            Err(error) => tracing::info!(
                round,
                kind = %error.kind,
                attempts = error.attempts,
                "outage call failed"
            ),
        }
    }
    let calls_during_outage = backend.calls.load(Ordering::SeqCst);

    // Readers degrade to a cached listing while the circuit is open
    let cached = executor
        .execute_with_fallback(
            FETCH_CONTRACTS,
            fetch,
            &fast(RetryStrategy::interactive()),
            |_| {
                vec![Contract {
                    id: "ctr-cached".to_string(),
                    status: "stale",
                }]
            },
        )
        .await;
    tracing::info!(count = cached.len(), "served cached contracts during outage");

    // After the cooldown a single probe closes the circuit again
    backend.down.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    executor
        .execute(FETCH_CONTRACTS, fetch, &RetryStrategy::critical())
        .await
        .context("probe after recovery should succeed")?;
    tracing::info!(state = %executor.registry().state(FETCH_CONTRACTS), "backend recovered");

    // Trip it once more and let the operator force it closed
    backend.down.store(true, Ordering::SeqCst);
    let _ = executor
        .execute(FETCH_CONTRACTS, fetch, &fast(RetryStrategy::external()))
        .await;
    backend.down.store(false, Ordering::SeqCst);
    if let Some(transition) = executor.reset_circuit(FETCH_CONTRACTS) {
        tracing::info!(from = %transition.from, "operator reset circuit");
    }
    executor
        .execute_default(FETCH_CONTRACTS, fetch)
        .await
        .context("call after operator reset should succeed")?;

    let report = serde_json::json!({
        "backend_calls": backend.calls.load(Ordering::SeqCst),
        "backend_calls_during_outage": calls_during_outage,
        "metrics": executor.monitor().snapshot_all(),
        "breakers": executor.registry().snapshot_all(),
        "alerts": executor.monitor().alerts(10),
        "health": executor.monitor().health_report(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    tracing::info!("resilience drill complete");
    Ok(())
}
