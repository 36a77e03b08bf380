//! Runs a user lookup as a command with a timeout, a fallback and a circuit.
//! Run with: cargo run --example command
//! With tracing: RUST_LOG=debug cargo run --example command

use std::time::Duration;
use tokio::time::sleep;
use tower_command::{CommandConfig, CommandExecutor, RequestLog};

#[derive(Debug, Clone)]
struct User {
    #[allow(dead_code)]
    id: u64,
    name: String,
}

async fn get_user(id: u64, delay: Duration) -> Result<User, String> {
    sleep(delay).await;
    if id == 0 {
        return Err("no such user".to_string());
    }
    Ok(User {
        id,
        name: format!("name: {}", id),
    })
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let executor = CommandExecutor::global();

    // 110ms timeout, opens after 4 requests at 50% errors, probes again after 1s.
    let config = CommandConfig::builder("MainUserService.getUser")
        .group_key("UserGroupKey")
        .pool_key("Test")
        .timeout(Duration::from_millis(110))
        .request_volume_threshold(4)
        .error_threshold_percentage(50)
        .sleep_window(Duration::from_secs(1))
        .core_size(10)
        .on_state_transition(|from, to| println!("Circuit: {} -> {}", from.as_str(), to.as_str()))
        .build()
        .expect("valid command configuration");

    let log = RequestLog::new();
    log.scope(async {
        // (user id, latency): fast, slow, missing
        let calls = [(1, 50), (2, 200), (0, 10), (0, 10), (3, 10), (4, 10)];
        for (id, delay) in calls {
            let execution = executor
                .execute(
                    &config,
                    move |_| get_user(id, Duration::from_millis(delay)),
                    move |trigger| async move {
                        println!("Fallback for user {} after {}", id, trigger.as_str());
                        Ok(User {
                            id,
                            name: "anonymous".to_string(),
                        })
                    },
                )
                .await;
            println!(
                "User {}: events {:?}, latency {:?}, result {:?}",
                id,
                execution.events(),
                execution.latency(),
                execution.result()
            );
        }

        println!("Waiting out the sleep window");
        sleep(Duration::from_millis(1100)).await;

        let execution = executor
            .execute_without_fallback(&config, |_| get_user(5, Duration::from_millis(10)))
            .await;
        println!("Probe: {:?}", execution.into_result().map(|u| u.name));
    })
    .await;

    println!("\nRequest log:");
    for command in log.all_executed_commands() {
        println!(
            "  {} {:?} in {:?}",
            command.command_key, command.events, command.latency
        );
    }

    let registry = executor.registry();
    if let Some(events) = registry.cumulative_events("MainUserService.getUser") {
        println!("\nCumulative events:");
        for (outcome, count) in events.iter() {
            println!("  {}: {}", outcome.as_str(), count);
        }
    }
    if let Some(pool) = registry.pool_metrics("Test") {
        println!(
            "Pool 'Test': completed {}, rejected {}, largest {}",
            pool.completed, pool.rejected, pool.largest_pool_size
        );
    }
}
