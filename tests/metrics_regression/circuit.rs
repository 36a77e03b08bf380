//! Circuit metrics regression tests

use super::helpers::*;
use serial_test::serial;
use tower_command::{CircuitState, CommandConfig, CommandExecutor};

#[tokio::test]
#[serial]
async fn circuit_metrics_exist() {
    init_recorder();

    let executor = CommandExecutor::new();
    let config = CommandConfig::builder("metrics_circuit")
        .request_volume_threshold(2)
        .error_threshold_percentage(50)
        .build()
        .unwrap();

    for _ in 0..3 {
        let _ = executor
            .execute_without_fallback(&config, |_| async { Err::<(), _>("down") })
            .await;
    }
    assert_eq!(
        executor.registry().circuit_state("metrics_circuit"),
        Some(CircuitState::Open)
    );
    let _ = executor
        .execute_without_fallback(&config, |_| async { Ok::<_, &str>(()) })
        .await;

    assert_counter_exists("command_circuit_transitions_total");
    assert_metric_has_label(
        "command_circuit_transitions_total",
        "command",
        "metrics_circuit",
    );
    assert_metric_has_label("command_circuit_transitions_total", "from", "closed");
    assert_metric_has_label("command_circuit_transitions_total", "to", "open");

    assert_gauge_exists("command_circuit_state");
    assert_metric_has_label("command_circuit_state", "command", "metrics_circuit");

    assert_metric_has_label("command_executions_total", "outcome", "short_circuited");
}
