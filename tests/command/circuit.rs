//! Circuit breaker behavior observed through the executor.

use super::TestError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tower_command::{CircuitState, CommandConfig, CommandExecutor, ExecutionOutcome};

fn breaker_config(key: &str) -> CommandConfig {
    CommandConfig::builder(key)
        .request_volume_threshold(4)
        .error_threshold_percentage(50)
        .sleep_window(Duration::from_millis(500))
        .window_duration(Duration::from_secs(10))
        .num_buckets(10)
        .build()
        .unwrap()
}

async fn fail(executor: &CommandExecutor, config: &CommandConfig) -> ExecutionOutcome {
    executor
        .execute_without_fallback(config, |_| async { Err::<(), _>(TestError("down")) })
        .await
        .outcome()
}

async fn succeed(executor: &CommandExecutor, config: &CommandConfig) -> ExecutionOutcome {
    executor
        .execute_without_fallback(config, |_| async { Ok::<_, TestError>(()) })
        .await
        .outcome()
}

#[tokio::test(start_paused = true)]
async fn opens_at_volume_and_error_threshold() {
    let executor = CommandExecutor::new();
    let config = breaker_config("opens");

    for _ in 0..3 {
        assert_eq!(fail(&executor, &config).await, ExecutionOutcome::Failure);
    }
    assert_eq!(
        executor.registry().circuit_state("opens"),
        Some(CircuitState::Closed)
    );

    assert_eq!(fail(&executor, &config).await, ExecutionOutcome::Failure);
    assert_eq!(
        executor.registry().circuit_state("opens"),
        Some(CircuitState::Open)
    );
}

#[tokio::test(start_paused = true)]
async fn never_opens_below_volume_threshold() {
    let executor = CommandExecutor::new();
    let config = CommandConfig::builder("low-volume").build().unwrap();

    for _ in 0..19 {
        assert_eq!(fail(&executor, &config).await, ExecutionOutcome::Failure);
    }

    assert_eq!(
        executor.registry().circuit_state("low-volume"),
        Some(CircuitState::Closed)
    );
    assert_eq!(
        executor
            .registry()
            .execution_events("low-volume")
            .unwrap()
            .error_percentage(),
        100
    );
}

#[tokio::test(start_paused = true)]
async fn stays_closed_below_error_percentage() {
    let executor = CommandExecutor::new();
    let config = breaker_config("healthy-enough");

    // 2 errors in 5 requests is 40%.
    for _ in 0..3 {
        succeed(&executor, &config).await;
    }
    for _ in 0..2 {
        fail(&executor, &config).await;
    }

    assert_eq!(
        executor.registry().circuit_state("healthy-enough"),
        Some(CircuitState::Closed)
    );
}

#[tokio::test(start_paused = true)]
async fn open_circuit_short_circuits_without_pool_slot() {
    let executor = CommandExecutor::new();
    let config = breaker_config("short");
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..4 {
        fail(&executor, &config).await;
    }
    let completed = executor.registry().pool_metrics("short").unwrap().completed;

    for _ in 0..10 {
        let calls = Arc::clone(&calls);
        let execution = executor
            .execute(
                &config,
                move |_| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TestError>(1)
                },
                |trigger| async move {
                    assert_eq!(trigger, ExecutionOutcome::ShortCircuited);
                    Ok(0)
                },
            )
            .await;
        assert_eq!(
            execution.events(),
            vec![
                ExecutionOutcome::ShortCircuited,
                ExecutionOutcome::FallbackSuccess
            ]
        );
    }

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        executor.registry().pool_metrics("short").unwrap().completed,
        completed
    );
    assert_eq!(
        executor
            .registry()
            .execution_events("short")
            .unwrap()
            .get(ExecutionOutcome::ShortCircuited),
        10
    );
}

async fn hold_single_slot(
    executor: &CommandExecutor,
    config: &CommandConfig,
    release: Arc<Notify>,
) -> tokio::task::JoinHandle<ExecutionOutcome> {
    let holder = {
        let executor = executor.clone();
        let config = config.clone();
        tokio::spawn(async move {
            executor
                .execute_without_fallback(&config, move |_| async move {
                    release.notified().await;
                    Ok::<_, TestError>(())
                })
                .await
                .outcome()
        })
    };
    while executor
        .registry()
        .pool_metrics(config.pool_key().as_str())
        .map_or(0, |m| m.active)
        == 0
    {
        tokio::task::yield_now().await;
    }
    holder
}

#[tokio::test]
async fn pool_rejections_open_the_circuit() {
    let executor = CommandExecutor::new();
    let config = CommandConfig::builder("saturated")
        .core_size(1)
        .timeout_enabled(false)
        .request_volume_threshold(5)
        .build()
        .unwrap();
    let release = Arc::new(Notify::new());
    let holder = hold_single_slot(&executor, &config, Arc::clone(&release)).await;

    for _ in 0..5 {
        assert_eq!(succeed(&executor, &config).await, ExecutionOutcome::Rejected);
    }
    assert_eq!(
        executor.registry().circuit_state("saturated"),
        Some(CircuitState::Open)
    );

    // Later callers never reach the pool.
    for _ in 0..5 {
        assert_eq!(
            succeed(&executor, &config).await,
            ExecutionOutcome::ShortCircuited
        );
    }
    assert_eq!(
        executor.registry().pool_metrics("saturated").unwrap().rejected,
        5
    );

    release.notify_one();
    assert_eq!(holder.await.unwrap(), ExecutionOutcome::Success);
}

#[tokio::test]
async fn disabled_circuit_leaves_every_caller_to_the_pool() {
    let executor = CommandExecutor::new();
    let config = CommandConfig::builder("unguarded")
        .core_size(1)
        .timeout_enabled(false)
        .circuit_enabled(false)
        .request_volume_threshold(5)
        .build()
        .unwrap();
    let release = Arc::new(Notify::new());
    let holder = hold_single_slot(&executor, &config, Arc::clone(&release)).await;

    for _ in 0..30 {
        assert_eq!(succeed(&executor, &config).await, ExecutionOutcome::Rejected);
    }
    assert_eq!(
        executor.registry().pool_metrics("unguarded").unwrap().rejected,
        30
    );

    release.notify_one();
    assert_eq!(holder.await.unwrap(), ExecutionOutcome::Success);
}

#[tokio::test(start_paused = true)]
async fn successful_probe_closes_and_resets_window() {
    let executor = CommandExecutor::new();
    let config = breaker_config("probe-ok");

    for _ in 0..4 {
        fail(&executor, &config).await;
    }
    tokio::time::sleep(Duration::from_millis(499)).await;
    assert_eq!(succeed(&executor, &config).await, ExecutionOutcome::ShortCircuited);

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(succeed(&executor, &config).await, ExecutionOutcome::Success);
    assert_eq!(
        executor.registry().circuit_state("probe-ok"),
        Some(CircuitState::Closed)
    );

    // Old failures no longer count after closing.
    let snapshot = executor.registry().execution_events("probe-ok").unwrap();
    assert_eq!(snapshot.total_requests(), 0);
    assert_eq!(fail(&executor, &config).await, ExecutionOutcome::Failure);
    assert_eq!(
        executor.registry().circuit_state("probe-ok"),
        Some(CircuitState::Closed)
    );
}

#[tokio::test(start_paused = true)]
async fn failed_probe_reopens_for_another_sleep_window() {
    let executor = CommandExecutor::new();
    let config = breaker_config("probe-fail");

    for _ in 0..4 {
        fail(&executor, &config).await;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(fail(&executor, &config).await, ExecutionOutcome::Failure);
    assert_eq!(
        executor.registry().circuit_state("probe-fail"),
        Some(CircuitState::Open)
    );

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(succeed(&executor, &config).await, ExecutionOutcome::ShortCircuited);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(succeed(&executor, &config).await, ExecutionOutcome::Success);
}

#[tokio::test(start_paused = true)]
async fn only_one_concurrent_probe() {
    let executor = CommandExecutor::new();
    let config = breaker_config("one-probe");

    for _ in 0..4 {
        fail(&executor, &config).await;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let probe = {
        let executor = executor.clone();
        let config = config.clone();
        tokio::spawn(async move {
            executor
                .execute_without_fallback(&config, move |_| async move {
                    let _ = entered_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, TestError>(())
                })
                .await
                .outcome()
        })
    };
    entered_rx.await.unwrap();
    assert_eq!(
        executor.registry().circuit_state("one-probe"),
        Some(CircuitState::HalfOpen)
    );

    for _ in 0..5 {
        assert_eq!(succeed(&executor, &config).await, ExecutionOutcome::ShortCircuited);
    }

    release_tx.send(()).unwrap();
    assert_eq!(probe.await.unwrap(), ExecutionOutcome::Success);
    assert_eq!(
        executor.registry().circuit_state("one-probe"),
        Some(CircuitState::Closed)
    );
}

#[tokio::test(start_paused = true)]
async fn failures_age_out_of_the_window() {
    let executor = CommandExecutor::new();
    let config = breaker_config("aging");

    for _ in 0..3 {
        fail(&executor, &config).await;
    }
    tokio::time::sleep(Duration::from_secs(11)).await;

    // The three old failures have left the window.
    assert_eq!(fail(&executor, &config).await, ExecutionOutcome::Failure);
    assert_eq!(
        executor.registry().circuit_state("aging"),
        Some(CircuitState::Closed)
    );
    assert_eq!(
        executor
            .registry()
            .cumulative_events("aging")
            .unwrap()
            .get(ExecutionOutcome::Failure),
        4
    );
}

#[tokio::test]
async fn forced_states() {
    let executor = CommandExecutor::new();

    let open = CommandConfig::builder("forced-open")
        .force_open(true)
        .build()
        .unwrap();
    assert_eq!(succeed(&executor, &open).await, ExecutionOutcome::ShortCircuited);

    let closed = CommandConfig::builder("forced-closed")
        .force_closed(true)
        .request_volume_threshold(1)
        .build()
        .unwrap();
    for _ in 0..10 {
        assert_eq!(fail(&executor, &closed).await, ExecutionOutcome::Failure);
    }

    let disabled = CommandConfig::builder("disabled")
        .circuit_enabled(false)
        .request_volume_threshold(1)
        .build()
        .unwrap();
    for _ in 0..10 {
        assert_eq!(fail(&executor, &disabled).await, ExecutionOutcome::Failure);
    }
}

#[tokio::test(start_paused = true)]
async fn transitions_are_reported() {
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&transitions);
    let executor = CommandExecutor::new();
    let config = CommandConfig::builder("observed")
        .request_volume_threshold(2)
        .sleep_window(Duration::from_millis(100))
        .on_state_transition(move |from, to| log.lock().unwrap().push((from, to)))
        .build()
        .unwrap();

    fail(&executor, &config).await;
    fail(&executor, &config).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    succeed(&executor, &config).await;

    assert_eq!(
        *transitions.lock().unwrap(),
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
        ]
    );
}
