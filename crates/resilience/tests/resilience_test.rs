//! End-to-end tests for the executor, breakers and monitor
//!
//! Run with: cargo test -p docforge-resilience --test resilience_test

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use docforge_resilience::monitor::{AttemptOutcome, MonitorEvent};
use docforge_resilience::{
    BreakerRegistry, CircuitBreakerConfig, CircuitState, Compensations, ErrorKind,
    ExecutionError, Monitor, MonitorConfig, OperationError, RetryExecutor, RetryStrategy,
};
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

const KEY: &str = "fetch-contracts";

/// Executor with an isolated registry and monitor
fn create_test_executor(config: CircuitBreakerConfig) -> RetryExecutor {
    RetryExecutor::new(
        Arc::new(BreakerRegistry::new(config)),
        Arc::new(Monitor::default()),
    )
}

fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreakerConfig {
    CircuitBreakerConfig::default()
        .with_failure_threshold(threshold)
        .with_cooldown(Duration::from_millis(cooldown_ms))
}

fn no_jitter(max_attempts: u32) -> RetryStrategy {
    RetryStrategy::interactive()
        .with_max_attempts(max_attempts)
        .with_jitter(0.0)
}

/// Trip the breaker for `KEY` with single-attempt network failures
async fn trip(executor: &RetryExecutor, failures: u32) {
    for _ in 0..failures {
        let _ = executor
            .execute(
                KEY,
                || async { Err::<(), _>(OperationError::network("connection refused")) },
                &RetryStrategy::critical(),
            )
            .await;
    }
    assert_eq!(executor.registry().state(KEY), CircuitState::Open);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_network_failures_exhaust_all_attempts() {
    let executor = create_test_executor(breaker(10, 1_000));
    let calls = AtomicU32::new(0);

    let error = executor
        .execute(
            KEY,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(OperationError::network("connection reset")) }
            },
            &no_jitter(3),
        )
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(error.kind, ErrorKind::Network);
    assert_eq!(error.attempts, 3);
    assert_eq!(error.operation_key, KEY);
    assert!(error.is_recoverable());

    let attempts: Vec<_> = error.history.iter().map(|h| h.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(error.to_string(), "fetch-contracts failed after 3 attempt(s): network");
}

#[tokio::test(start_paused = true)]
async fn test_validation_failure_is_not_retried() {
    let executor = create_test_executor(CircuitBreakerConfig::default());
    let calls = AtomicU32::new(0);

    let error = executor
        .execute(
            KEY,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(OperationError::http(422, "template id is required")) }
            },
            &RetryStrategy::background_sync(),
        )
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(error.kind, ErrorKind::Validation);
    assert_eq!(error.attempts, 1);
    assert!(!error.is_recoverable());
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_once_and_short_circuits() {
    let executor = create_test_executor(breaker(3, 5_000));
    let calls = AtomicU32::new(0);
    let op = || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err::<(), _>(OperationError::http(502, "bad gateway")) }
    };

    for _ in 0..8 {
        let _ = executor.execute(KEY, op, &RetryStrategy::critical()).await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let records = executor.monitor().records(KEY);
    let openings = records
        .iter()
        .flat_map(|r| r.transitions.iter())
        .filter(|t| t.from == CircuitState::Closed && t.to == CircuitState::Open)
        .count();
    assert_eq!(openings, 1);
    assert!(records[3..]
        .iter()
        .all(|r| r.outcome == AttemptOutcome::ShortCircuited
            && r.error_kind == Some(ErrorKind::CircuitOpen)));

    let metrics = executor.monitor().snapshot(KEY);
    assert_eq!(metrics.failure_count, 3);
    assert_eq!(metrics.short_circuit_count, 5);
    assert_eq!(metrics.current_circuit_state, CircuitState::Open);
    assert_eq!(executor.monitor().open_circuit_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_half_open_probe_under_concurrency() {
    const CALLERS: usize = 16;

    let executor = create_test_executor(breaker(1, 50));
    trip(&executor, 1).await;
    tokio::time::sleep(Duration::from_millis(80)).await;

    let calls = Arc::new(AtomicU32::new(0));
    let barrier = Arc::new(Barrier::new(CALLERS));
    let mut handles = Vec::with_capacity(CALLERS);

    for _ in 0..CALLERS {
        let executor = executor.clone();
        let calls = Arc::clone(&calls);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            executor
                .execute(
                    KEY,
                    || {
                        let calls = Arc::clone(&calls);
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(300)).await;
                            Ok::<_, OperationError>(())
                        }
                    },
                    &RetryStrategy::critical(),
                )
                .await
        }));
    }

    let mut admitted = 0;
    let mut short_circuited = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => admitted += 1,
            Err(error) if error.is_circuit_open() => short_circuited += 1,
            Err(error) => panic!("unexpected failure: {error}"),
        }
    }

    assert_eq!(admitted, 1);
    assert_eq!(short_circuited, CALLERS - 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(executor.registry().state(KEY), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_successful_probe_resets_counters() {
    let executor = create_test_executor(breaker(3, 200));
    trip(&executor, 3).await;
    assert_eq!(
        executor.registry().snapshot(KEY).unwrap().consecutive_failures,
        3
    );

    tokio::time::advance(Duration::from_millis(200)).await;
    executor
        .execute(KEY, || async { Ok::<_, OperationError>(()) }, &RetryStrategy::critical())
        .await
        .unwrap();

    let snapshot = executor.registry().snapshot(KEY).unwrap();
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.consecutive_failures, 0);
    assert_eq!(snapshot.window_failures, 0);
    assert_eq!(snapshot.trips, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_probe_reopens_with_grown_cooldown() {
    let executor = create_test_executor(
        breaker(1, 100)
            .with_cooldown_multiplier(2.0)
            .with_max_cooldown(Duration::from_millis(1_000)),
    );
    trip(&executor, 1).await;

    tokio::time::advance(Duration::from_millis(100)).await;
    trip(&executor, 1).await;
    assert_eq!(
        executor.registry().snapshot(KEY).unwrap().cooldown,
        Duration::from_millis(200)
    );

    // Still open at the old cooldown
    tokio::time::advance(Duration::from_millis(100)).await;
    let error = executor
        .execute(KEY, || async { Ok::<_, OperationError>(()) }, &RetryStrategy::critical())
        .await
        .unwrap_err();
    assert!(error.is_circuit_open());

    let kinds: Vec<_> = executor
        .monitor()
        .alerts(10)
        .into_iter()
        .map(|a| a.kind)
        .collect();
    assert!(kinds.contains(&docforge_resilience::AlertKind::CircuitReopened));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_cancellation_releases_probe_slot() {
    let executor = create_test_executor(breaker(1, 100));
    trip(&executor, 1).await;
    tokio::time::advance(Duration::from_millis(100)).await;

    let token = CancellationToken::new();
    let canceller = {
        let token = token.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        }
    };
    let strategy = RetryStrategy::critical().without_attempt_timeout();
    let hung_probe = executor.execute_cancellable(
        KEY,
        || std::future::pending::<Result<(), OperationError>>(),
        &strategy,
        &token,
    );

    let (result, ()) = tokio::join!(hung_probe, canceller);
    assert!(matches!(
        result,
        Err(ExecutionError::Cancelled { attempts: 0, .. })
    ));

    let snapshot = executor.registry().snapshot(KEY).unwrap();
    assert_eq!(snapshot.state, CircuitState::HalfOpen);
    assert!(!snapshot.probe_in_flight);
    // Cancellation is not a failure
    assert_eq!(snapshot.trips, 1);

    executor
        .execute(KEY, || async { Ok::<_, OperationError>(()) }, &RetryStrategy::critical())
        .await
        .unwrap();
    assert_eq!(executor.registry().state(KEY), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_operator_reset_reopens_traffic() {
    let executor = create_test_executor(breaker(1, 60_000));
    trip(&executor, 1).await;

    let transition = executor.reset_circuit(KEY).unwrap();
    assert_eq!(transition.from, CircuitState::Open);

    let value = executor
        .execute(KEY, || async { Ok::<_, OperationError>(7) }, &RetryStrategy::critical())
        .await
        .unwrap();
    assert_eq!(value, 7);
    assert_eq!(
        executor.monitor().snapshot(KEY).current_circuit_state,
        CircuitState::Closed
    );

    let outcomes: Vec<_> = executor
        .monitor()
        .records(KEY)
        .iter()
        .map(|r| r.outcome)
        .collect();
    assert_eq!(
        outcomes,
        vec![
            AttemptOutcome::Failure,
            AttemptOutcome::OperatorReset,
            AttemptOutcome::Success
        ]
    );
    let metrics = executor.monitor().snapshot(KEY);
    assert_eq!(metrics.total(), 2);
    assert_eq!(metrics.transitions, 2);
}

#[tokio::test(start_paused = true)]
async fn test_late_failure_during_outage_keeps_circuit_visible() {
    let executor = create_test_executor(breaker(2, 60_000));

    let slow = tokio::spawn({
        let executor = executor.clone();
        async move {
            executor
                .execute(
                    KEY,
                    || async {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        Err::<(), _>(OperationError::http(500, "upstream crashed"))
                    },
                    &RetryStrategy::critical(),
                )
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    trip(&executor, 2).await;
    let error = slow.await.unwrap().unwrap_err();
    assert_eq!(error.kind, ErrorKind::Server);

    assert_eq!(executor.registry().state(KEY), CircuitState::Open);
    assert_eq!(
        executor.monitor().snapshot(KEY).current_circuit_state,
        CircuitState::Open
    );
    assert_eq!(executor.monitor().open_circuit_count(), 1);
    assert_eq!(
        executor.monitor().health_report().open_circuits,
        vec![KEY.to_string()]
    );
}

/// Start a call whose operation never finishes and wait until it holds the
/// Half-Open slot
async fn hang_in_half_open(
    executor: &RetryExecutor,
    token: &CancellationToken,
) -> tokio::task::JoinHandle<Result<(), ExecutionError>> {
    let handle = tokio::spawn({
        let executor = executor.clone();
        let token = token.clone();
        async move {
            executor
                .execute_cancellable(
                    KEY,
                    || std::future::pending::<Result<(), OperationError>>(),
                    &RetryStrategy::critical().without_attempt_timeout(),
                    &token,
                )
                .await
        }
    });
    while !executor
        .registry()
        .snapshot(KEY)
        .is_some_and(|s| s.probe_in_flight)
    {
        tokio::task::yield_now().await;
    }
    handle
}

#[tokio::test(start_paused = true)]
async fn test_call_from_before_reset_cannot_free_new_half_open_slot() {
    let executor = create_test_executor(breaker(1, 100));
    trip(&executor, 1).await;
    tokio::time::advance(Duration::from_millis(100)).await;

    let before_reset = CancellationToken::new();
    let stale = hang_in_half_open(&executor, &before_reset).await;

    executor.reset_circuit(KEY).unwrap();
    trip(&executor, 1).await;
    tokio::time::advance(Duration::from_millis(100)).await;

    let after_reset = CancellationToken::new();
    let current = hang_in_half_open(&executor, &after_reset).await;

    before_reset.cancel();
    assert!(stale.await.unwrap().unwrap_err().is_cancelled());
    assert!(executor.registry().snapshot(KEY).unwrap().probe_in_flight);

    let calls = AtomicU32::new(0);
    let error = executor
        .execute(
            KEY,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, OperationError>(()) }
            },
            &RetryStrategy::critical(),
        )
        .await
        .unwrap_err();
    assert!(error.is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    after_reset.cancel();
    assert!(current.await.unwrap().unwrap_err().is_cancelled());
    executor
        .execute(KEY, || async { Ok::<_, OperationError>(()) }, &RetryStrategy::critical())
        .await
        .unwrap();
    assert_eq!(executor.registry().state(KEY), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_failed_call_runs_compensations_and_serves_fallback() {
    let executor = create_test_executor(breaker(10, 1_000));
    let undone = Arc::new(AtomicU32::new(0));

    let mut compensations = Compensations::new("issue-contract");
    for _ in 0..2 {
        let undone = Arc::clone(&undone);
        compensations.push("release-reservation", move || async move {
            undone.fetch_add(1, Ordering::SeqCst);
            Ok::<_, OperationError>(())
        });
    }

    let result = compensations
        .run(executor.execute(
            KEY,
            || async { Err::<(), _>(OperationError::http(502, "bad gateway")) },
            &no_jitter(2),
        ))
        .await;
    assert_eq!(result.unwrap_err().attempts, 2);
    assert_eq!(undone.load(Ordering::SeqCst), 2);

    let contracts = executor
        .execute_with_fallback(
            KEY,
            || async { Err::<Vec<String>, _>(OperationError::http(502, "bad gateway")) },
            &no_jitter(1),
            |_| vec!["ctr-cached".to_string()],
        )
        .await;
    assert_eq!(contracts, vec!["ctr-cached".to_string()]);
    assert_eq!(executor.monitor().snapshot(KEY).failure_count, 3);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_counts_match_retained_records() {
    let monitor = Arc::new(Monitor::new(MonitorConfig::default().with_capacity_per_key(10)));
    let executor = RetryExecutor::new(
        Arc::new(BreakerRegistry::new(breaker(100, 1_000))),
        Arc::clone(&monitor),
    );
    let calls = AtomicU32::new(0);

    for _ in 0..25 {
        let _ = executor
            .execute(
                KEY,
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n % 3 == 0 {
                            Err(OperationError::timeout("read timed out"))
                        } else {
                            Ok(n)
                        }
                    }
                },
                &RetryStrategy::critical(),
            )
            .await;
    }

    let metrics = monitor.snapshot(KEY);
    let records = monitor.records(KEY);
    assert_eq!(records.len(), 10);
    assert_eq!(metrics.total(), records.len() as u64);
    assert_eq!(
        metrics.failure_count,
        records
            .iter()
            .filter(|r| r.outcome == AttemptOutcome::Failure)
            .count() as u64
    );
    assert_eq!(
        metrics.error_kinds.get(&ErrorKind::Timeout).copied().unwrap_or(0),
        metrics.failure_count
    );
}

#[tokio::test(start_paused = true)]
async fn test_subscribers_see_attempts_in_order() {
    let executor = create_test_executor(breaker(10, 1_000));
    let mut events = executor.monitor().subscribe();

    let _ = executor
        .execute(
            KEY,
            || async { Err::<(), _>(OperationError::http(503, "unavailable")) },
            &no_jitter(3),
        )
        .await;

    let mut attempts = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let MonitorEvent::Attempt(record) = event {
            attempts.push(record.attempt);
        }
    }
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[test]
fn test_delays_bounded_and_non_decreasing() {
    for name in docforge_resilience::strategy::PRESET_NAMES {
        let strategy = RetryStrategy::named(name).unwrap();

        let mut previous = Duration::ZERO;
        for attempt in 1..=20 {
            let backoff = strategy.backoff_for(attempt);
            assert!(backoff >= previous, "{name}: attempt {attempt}");
            assert!(backoff <= strategy.max_delay(), "{name}: attempt {attempt}");
            assert!(strategy.next_delay(attempt) <= strategy.max_delay());
            previous = backoff;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_health_report_reflects_outage() {
    let executor = create_test_executor(breaker(2, 60_000));
    trip(&executor, 2).await;
    for _ in 0..3 {
        let _ = executor
            .execute(KEY, || async { Ok::<_, OperationError>(()) }, &RetryStrategy::critical())
            .await;
    }

    let report = executor.monitor().health_report();
    assert_eq!(report.total_attempts, 5);
    assert_eq!(report.open_circuits, vec![KEY.to_string()]);
    assert!(report.score < 80.0);
    assert!(!report.recommendations.is_empty());
}
