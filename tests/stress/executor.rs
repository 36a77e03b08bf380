//! Executor stress tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tower_command::{CommandConfig, CommandExecutor, CommandRegistry, ExecutionOutcome};

use super::get_memory_usage_mb;

/// Test: 100k sequential executions of one command
#[tokio::test]
#[ignore]
async fn stress_hundred_thousand_executions() {
    let executor = CommandExecutor::new();
    let config = CommandConfig::builder("stress.sequential").build().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    for _ in 0..100_000 {
        let calls = Arc::clone(&calls);
        let execution = executor
            .execute_without_fallback(&config, move |_| async move {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok::<_, ()>(())
            })
            .await;
        assert_eq!(execution.outcome(), ExecutionOutcome::Success);
    }
    let elapsed = start.elapsed();

    println!("100k executions completed in {:?}", elapsed);
    println!(
        "Throughput: {:.0} executions/sec",
        100_000.0 / elapsed.as_secs_f64()
    );

    assert_eq!(calls.load(Ordering::Relaxed), 100_000);
    let cumulative = executor
        .registry()
        .cumulative_events("stress.sequential")
        .unwrap();
    assert_eq!(cumulative.get(ExecutionOutcome::Success), 100_000);
}

/// Test: many concurrent callers with a mix of outcomes
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore]
async fn stress_concurrent_mixed_outcomes() {
    let executor = CommandExecutor::new();
    let config = CommandConfig::builder("stress.mixed")
        .core_size(64)
        .force_closed(true)
        .build()
        .unwrap();

    let start = Instant::now();
    let handles: Vec<_> = (0..10_000u32)
        .map(|i| {
            let executor = executor.clone();
            let config = config.clone();
            tokio::spawn(async move {
                executor
                    .execute(
                        &config,
                        move |_| async move {
                            if i % 4 == 0 {
                                Err("odd one out")
                            } else {
                                Ok(i)
                            }
                        },
                        |_| async { Ok(0) },
                    )
                    .await
                    .events()
            })
        })
        .collect();

    let mut finished = 0;
    for handle in handles {
        let events = handle.await.unwrap();
        assert!(!events.is_empty());
        finished += 1;
    }
    println!("10k concurrent executions in {:?}", start.elapsed());

    assert_eq!(finished, 10_000);
    let cumulative = executor
        .registry()
        .cumulative_events("stress.mixed")
        .unwrap();
    let count = |outcomes: &[ExecutionOutcome]| -> u64 {
        outcomes.iter().map(|o| cumulative.get(*o)).sum()
    };
    let primary = count(&[
        ExecutionOutcome::Success,
        ExecutionOutcome::Failure,
        ExecutionOutcome::Timeout,
        ExecutionOutcome::Rejected,
    ]);
    assert_eq!(primary, 10_000);
    assert_eq!(
        primary - cumulative.get(ExecutionOutcome::Success),
        count(&[
            ExecutionOutcome::FallbackSuccess,
            ExecutionOutcome::FallbackRejected,
        ])
    );
}

/// Test: thousands of distinct commands in one registry
#[tokio::test]
#[ignore]
async fn stress_many_commands() {
    let registry = Arc::new(CommandRegistry::new());
    let executor = CommandExecutor::with_registry(Arc::clone(&registry));

    let initial_memory = get_memory_usage_mb();
    let start = Instant::now();

    for i in 0..5_000 {
        let config = CommandConfig::builder(format!("stress.command.{}", i))
            .pool_key(format!("stress.pool.{}", i % 50))
            .build()
            .unwrap();
        let _ = executor
            .execute_without_fallback(&config, |_| async { Ok::<_, ()>(()) })
            .await;
    }

    let final_memory = get_memory_usage_mb();
    println!("5k commands registered in {:?}", start.elapsed());
    println!(
        "Memory: {:.2} MB -> {:.2} MB (delta: {:.2} MB)",
        initial_memory,
        final_memory,
        final_memory - initial_memory
    );

    assert_eq!(registry.command_keys().len(), 5_000);
    for i in 0..50 {
        let metrics = registry
            .pool_metrics(&format!("stress.pool.{}", i))
            .unwrap();
        assert_eq!(metrics.completed, 100);
        assert_eq!(metrics.active, 0);
    }
}

/// Test: a flood of timeouts leaves no slots occupied
#[tokio::test(start_paused = true)]
#[ignore]
async fn stress_timeout_flood() {
    let executor = CommandExecutor::new();
    let config = CommandConfig::builder("stress.timeouts")
        .core_size(200)
        .timeout(Duration::from_millis(10))
        .force_closed(true)
        .build()
        .unwrap();

    let handles: Vec<_> = (0..1_000)
        .map(|_| {
            let executor = executor.clone();
            let config = config.clone();
            tokio::spawn(async move {
                executor
                    .execute_without_fallback(&config, |_| async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok::<_, ()>(())
                    })
                    .await
                    .outcome()
            })
        })
        .collect();

    for handle in handles {
        let outcome = handle.await.unwrap();
        assert!(matches!(
            outcome,
            ExecutionOutcome::Timeout | ExecutionOutcome::Rejected
        ));
    }

    let metrics = executor.registry().pool_metrics("stress.timeouts").unwrap();
    assert_eq!(metrics.active, 0);
    assert_eq!(metrics.queued, 0);
}
