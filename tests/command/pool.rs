//! Pool admission observed through the executor.

use super::TestError;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tower_command::{CommandConfig, CommandExecutor, ExecutionOutcome, PoolProperties};

// Pools are registered lazily, so a missing pool counts as empty.
async fn wait_for_queued(executor: &CommandExecutor, pool: &str, queued: usize) {
    while executor
        .registry()
        .pool_metrics(pool)
        .map_or(0, |m| m.queued)
        < queued
    {
        tokio::task::yield_now().await;
    }
}

async fn wait_for_active(executor: &CommandExecutor, pool: &str, active: usize) {
    while executor
        .registry()
        .pool_metrics(pool)
        .map_or(0, |m| m.active)
        < active
    {
        tokio::task::yield_now().await;
    }
}

/// Releases holders one at a time and collects their outcomes.
async fn release_all(
    release: &Notify,
    holders: Vec<tokio::task::JoinHandle<ExecutionOutcome>>,
) -> Vec<ExecutionOutcome> {
    let mut outcomes = Vec::new();
    for holder in holders {
        while !holder.is_finished() {
            release.notify_one();
            tokio::task::yield_now().await;
        }
        outcomes.push(holder.await.unwrap());
    }
    outcomes
}

/// Spawns an invocation that holds its slot until `release` is notified.
fn spawn_holder(
    executor: &CommandExecutor,
    config: &CommandConfig,
    release: Arc<Notify>,
) -> tokio::task::JoinHandle<ExecutionOutcome> {
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
}

#[tokio::test]
async fn queued_callers_run_in_arrival_order() {
    let executor = CommandExecutor::new();
    let config = CommandConfig::builder("fifo")
        .core_size(1)
        .max_queue_size(Some(5))
        .queue_rejection_threshold(5)
        .build()
        .unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let release = Arc::new(Notify::new());

    let holder = spawn_holder(&executor, &config, Arc::clone(&release));
    wait_for_active(&executor, "fifo", 1).await;

    let mut waiters = Vec::new();
    for id in 1..=3 {
        let waiter = executor.clone();
        let config = config.clone();
        let order = Arc::clone(&order);
        waiters.push(tokio::spawn(async move {
            waiter
                .execute_without_fallback(&config, move |_| async move {
                    order.lock().unwrap().push(id);
                    Ok::<_, TestError>(())
                })
                .await
                .outcome()
        }));
        wait_for_queued(&executor, "fifo", id).await;
    }

    release.notify_one();
    assert_eq!(holder.await.unwrap(), ExecutionOutcome::Success);
    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), ExecutionOutcome::Success);
    }
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn rejection_threshold_caps_queue() {
    let executor = CommandExecutor::new();
    let config = CommandConfig::builder("threshold")
        .core_size(1)
        .max_queue_size(Some(10))
        .queue_rejection_threshold(2)
        .build()
        .unwrap();
    let release = Arc::new(Notify::new());

    let holder = spawn_holder(&executor, &config, Arc::clone(&release));
    wait_for_active(&executor, "threshold", 1).await;
    let queued: Vec<_> = (0..2)
        .map(|_| spawn_holder(&executor, &config, Arc::clone(&release)))
        .collect();
    wait_for_queued(&executor, "threshold", 2).await;

    let rejected = executor
        .execute_without_fallback(&config, |_| async { Ok::<_, TestError>(()) })
        .await;
    assert_eq!(rejected.outcome(), ExecutionOutcome::Rejected);

    let mut holders = vec![holder];
    holders.extend(queued);
    assert_eq!(
        release_all(&release, holders).await,
        vec![ExecutionOutcome::Success; 3]
    );

    let metrics = executor.registry().pool_metrics("threshold").unwrap();
    assert_eq!(metrics.rejected, 1);
    assert_eq!(metrics.active, 0);
    assert_eq!(metrics.queued, 0);
}

#[tokio::test(start_paused = true)]
async fn queue_wait_is_bounded_by_the_timeout() {
    let executor = CommandExecutor::new();
    let holder_config = CommandConfig::builder("holder")
        .pool_key("shared")
        .timeout(Duration::from_secs(10))
        .core_size(1)
        .max_queue_size(Some(5))
        .build()
        .unwrap();
    let waiter_config = CommandConfig::builder("waiter")
        .pool_key("shared")
        .timeout(Duration::from_millis(100))
        .core_size(1)
        .max_queue_size(Some(5))
        .build()
        .unwrap();
    let release = Arc::new(Notify::new());

    let holder = spawn_holder(&executor, &holder_config, Arc::clone(&release));
    wait_for_active(&executor, "shared", 1).await;

    let start = tokio::time::Instant::now();
    let execution = executor
        .execute(
            &waiter_config,
            |_| async { Ok::<_, TestError>("primary") },
            |trigger| async move {
                assert_eq!(trigger, ExecutionOutcome::Timeout);
                Ok("fallback")
            },
        )
        .await;

    assert_eq!(execution.outcome(), ExecutionOutcome::Timeout);
    assert_eq!(execution.into_result().unwrap(), "fallback");
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(
        executor.registry().pool_metrics("shared").unwrap().queued,
        0
    );

    release.notify_one();
    assert_eq!(holder.await.unwrap(), ExecutionOutcome::Success);
}

#[tokio::test]
async fn commands_share_a_pool_by_key() {
    let executor = CommandExecutor::new();
    let first = CommandConfig::builder("MainUserService.getUser")
        .group_key("UserGroupKey")
        .pool_key("Test")
        .core_size(1)
        .build()
        .unwrap();
    let second = CommandConfig::builder("SecondaryUserService.getUser")
        .group_key("UserGroupKey")
        .pool_key("Test")
        .core_size(1)
        .build()
        .unwrap();
    let release = Arc::new(Notify::new());

    let holder = spawn_holder(&executor, &first, Arc::clone(&release));
    wait_for_active(&executor, "Test", 1).await;

    let rejected = executor
        .execute_without_fallback(&second, |_| async { Ok::<_, TestError>(()) })
        .await;
    assert_eq!(rejected.outcome(), ExecutionOutcome::Rejected);

    release.notify_one();
    assert_eq!(holder.await.unwrap(), ExecutionOutcome::Success);

    let metrics = executor.registry().pool_metrics("Test").unwrap();
    assert_eq!(metrics.completed, 1);
    assert_eq!(metrics.rejected, 1);
    assert_eq!(metrics.window.get(ExecutionOutcome::Success), 1);
    assert_eq!(metrics.window.get(ExecutionOutcome::Rejected), 1);
}

#[tokio::test]
async fn pool_grows_up_to_max_size() {
    let executor = CommandExecutor::new();
    let config = CommandConfig::builder("growing")
        .core_size(1)
        .max_size(3)
        .allow_max_diverge_from_core(true)
        .build()
        .unwrap();
    let release = Arc::new(Notify::new());

    let holders: Vec<_> = (0..3)
        .map(|_| spawn_holder(&executor, &config, Arc::clone(&release)))
        .collect();
    wait_for_active(&executor, "growing", 3).await;

    let rejected = executor
        .execute_without_fallback(&config, |_| async { Ok::<_, TestError>(()) })
        .await;
    assert_eq!(rejected.outcome(), ExecutionOutcome::Rejected);

    let metrics = executor.registry().pool_metrics("growing").unwrap();
    assert_eq!(metrics.pool_size, 3);
    assert_eq!(metrics.largest_pool_size, 3);

    assert_eq!(
        release_all(&release, holders).await,
        vec![ExecutionOutcome::Success; 3]
    );
}

#[tokio::test]
async fn resizing_at_runtime() {
    let executor = CommandExecutor::new();
    let config = CommandConfig::builder("resized")
        .core_size(1)
        .build()
        .unwrap();

    // Registers the command and its pool.
    let _ = executor
        .execute_without_fallback(&config, |_| async { Ok::<_, TestError>(()) })
        .await;

    let bigger = PoolProperties {
        core_size: 2,
        max_size: 2,
        ..config.pool().clone()
    };
    executor.registry().reconfigure_pool("resized", bigger).unwrap();

    let release = Arc::new(Notify::new());
    let holders: Vec<_> = (0..2)
        .map(|_| spawn_holder(&executor, &config, Arc::clone(&release)))
        .collect();
    wait_for_active(&executor, "resized", 2).await;
    assert_eq!(
        executor.registry().pool_properties("resized").unwrap().core_size,
        2
    );

    assert_eq!(
        release_all(&release, holders).await,
        vec![ExecutionOutcome::Success; 2]
    );

    let invalid = PoolProperties {
        core_size: 0,
        ..config.pool().clone()
    };
    assert!(executor.registry().reconfigure_pool("resized", invalid).is_err());
    assert!(executor
        .registry()
        .reconfigure_pool("missing", config.pool().clone())
        .is_err());
}
