//! Command execution with timeouts, isolation pools, circuit breaking and
//! fallbacks.
//!
//! A *command* is a named unit of async work. Each invocation of a command:
//!
//! - runs under a deadline that covers queueing and execution,
//! - occupies a slot in a bounded [`IsolationPool`] shared by every command
//!   with the same pool key,
//! - records exactly one primary [`ExecutionOutcome`] in the command's
//!   [`RollingWindow`],
//! - is short-circuited while the command's [`CircuitBreaker`] is open, and
//! - falls back to an alternate code path when the primary path fails, times
//!   out, is rejected or is short-circuited.
//!
//! ## Usage
//!
//! ```rust
//! use tower_command::{CommandConfig, CommandExecutor, ExecutionOutcome};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let executor = CommandExecutor::new();
//!
//! let config = CommandConfig::builder("MainUserService.getUser")
//!     .group_key("UserGroupKey")
//!     .pool_key("Test")
//!     .timeout(Duration::from_millis(110))
//!     .core_size(30)
//!     .build()
//!     .expect("valid configuration");
//!
//! let execution = executor
//!     .execute(
//!         &config,
//!         |_cancel| async { Ok::<_, std::io::Error>("user-1") },
//!         |_trigger| async { Ok("anonymous") },
//!     )
//!     .await;
//!
//! assert_eq!(execution.outcome(), ExecutionOutcome::Success);
//! assert_eq!(execution.into_result().unwrap(), "user-1");
//! # }
//! ```
//!
//! ## As a Tower layer
//!
//! [`CommandLayer`] runs every call of a `tower::Service` as a command. Its
//! error type is [`CommandError<S::Error>`](CommandError).
//!
//! ```rust
//! use tower::{ServiceBuilder, service_fn};
//! use tower_command::{CommandConfig, CommandExecutor, CommandLayer};
//!
//! let config = CommandConfig::builder("getUser").build().unwrap();
//! let service = ServiceBuilder::new()
//!     .layer(CommandLayer::new(CommandExecutor::new(), config))
//!     .service(service_fn(|id: u64| async move { Ok::<_, std::io::Error>(id) }));
//! ```
//!
//! ## Property binding
//!
//! Configuration produced by name (annotations, property files) can be
//! applied with [`CommandConfigBuilder::command_property`] and
//! [`CommandConfigBuilder::pool_property`]; see the [`properties`] module for
//! the recognised names.
//!
//! ## Observability
//!
//! - [`CommandRegistry`] queries: rolling and cumulative outcome counts,
//!   registered properties, pool metrics, circuit state
//! - [`RequestLog`]: the commands executed while serving one request
//! - event callbacks on [`CommandConfigBuilder`]
//!
//! ## Feature Flags
//! - `metrics`: enables metrics collection using the `metrics` crate
//! - `tracing`: enables logging and tracing using the `tracing` crate
//! - `serde`: enables `Serialize`/`Deserialize` for properties and snapshots

pub use circuit::{CircuitBreaker, CircuitPermit, CircuitState};
pub use config::{
    CircuitProperties, CommandConfig, CommandConfigBuilder, ConfigError, ExecutionProperties,
    IsolationStrategy, PoolProperties, WindowProperties,
};
pub use events::CommandEvent;
pub use executor::{CommandExecutor, Execution};
pub use layer::CommandLayer;
pub use pool::{IsolationPool, PoolError, PoolMetrics, PoolSlot};
pub use registry::{CommandRegistry, CommandState};
pub use request_log::{ExecutedCommand, RequestLog};
pub use service::{Command, CommandWithFallback};
pub use window::{RollingWindow, WindowSnapshot};

pub use tokio_util::sync::CancellationToken;
pub use tower_command_core::{
    CommandError, CommandKey, EventListener, EventListeners, ExecutionOutcome, FallbackError,
    FnListener, GroupKey, ObservableEvent, PoolKey,
};

mod circuit;
mod config;
mod events;
mod executor;
mod layer;
mod pool;
pub mod properties;
mod registry;
mod request_log;
mod service;
mod window;

#[cfg(feature = "metrics")]
static METRICS_INIT: std::sync::Once = std::sync::Once::new();

pub(crate) fn describe_metrics() {
    #[cfg(feature = "metrics")]
    {
        use metrics::{describe_counter, describe_gauge, describe_histogram};

        METRICS_INIT.call_once(|| {
            describe_counter!(
                "command_executions_total",
                "Total number of command executions by primary outcome"
            );
            describe_counter!(
                "command_fallbacks_total",
                "Total number of fallback executions by fallback outcome"
            );
            describe_counter!(
                "command_circuit_transitions_total",
                "Total number of circuit state transitions"
            );
            describe_counter!(
                "command_pool_rejections_total",
                "Total number of tasks rejected by an isolation pool"
            );
            describe_gauge!(
                "command_circuit_state",
                "Current circuit state (0 = closed, 1 = open, 2 = half-open)"
            );
            describe_gauge!("command_pool_active", "Occupied isolation pool slots");
            describe_gauge!("command_pool_queue_size", "Callers waiting for a pool slot");
            describe_histogram!(
                "command_execution_duration_seconds",
                "Time from submission until the primary outcome was decided"
            );
        });
    }
}
