//! Orchestration of a single command invocation.
//!
//! [`CommandExecutor::execute`] runs one invocation through these steps:
//!
//! 1. resolve the command's state in the registry (created once per key);
//! 2. ask the circuit breaker for a permit, or short-circuit;
//! 3. acquire a pool slot, waiting no longer than the remaining deadline;
//! 4. run the work under the deadline, on its own task or inline;
//! 5. record exactly one primary outcome and release the slot;
//! 6. on failure, timeout, rejection or short-circuit, run the fallback.
//!
//! The deadline covers queueing and running. When it passes, the timeout is
//! recorded immediately and the work's cancellation token is cancelled; a
//! result that arrives later is ignored.

use crate::config::{CommandConfig, IsolationStrategy};
use crate::events::CommandEvent;
use crate::pool::PoolError;
use crate::registry::{CommandRegistry, CommandState};
use crate::request_log::{ExecutedCommand, RequestLog};
use futures::future::{FutureExt, Ready};
#[cfg(feature = "metrics")]
use metrics::{counter, histogram};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_command_core::{CommandError, ExecutionOutcome, FallbackError};

/// The result of one invocation together with what was recorded for it.
#[derive(Debug)]
pub struct Execution<T, E> {
    result: Result<T, CommandError<E>>,
    outcome: ExecutionOutcome,
    fallback: Option<ExecutionOutcome>,
    latency: Duration,
}

impl<T, E> Execution<T, E> {
    /// The value returned to the caller, from the work or its fallback.
    pub fn result(&self) -> &Result<T, CommandError<E>> {
        &self.result
    }

    /// Consumes the execution, returning the caller-facing result.
    pub fn into_result(self) -> Result<T, CommandError<E>> {
        self.result
    }

    /// The primary outcome.
    pub fn outcome(&self) -> ExecutionOutcome {
        self.outcome
    }

    /// The fallback outcome, if the fallback path was entered.
    pub fn fallback_outcome(&self) -> Option<ExecutionOutcome> {
        self.fallback
    }

    /// Time from submission until the primary outcome was decided.
    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// The primary outcome followed by the fallback outcome, if any.
    pub fn events(&self) -> Vec<ExecutionOutcome> {
        std::iter::once(self.outcome).chain(self.fallback).collect()
    }

    /// Returns `true` if the work itself succeeded.
    pub fn is_successful_execution(&self) -> bool {
        self.outcome == ExecutionOutcome::Success
    }

    /// Returns `true` if the caller was answered by the fallback.
    pub fn is_response_from_fallback(&self) -> bool {
        self.fallback == Some(ExecutionOutcome::FallbackSuccess)
    }
}

enum Trigger<E> {
    Failure(E),
    Timeout,
    Rejected,
    ShortCircuited,
}

impl<E> Trigger<E> {
    fn outcome(&self) -> ExecutionOutcome {
        match self {
            Trigger::Failure(_) => ExecutionOutcome::Failure,
            Trigger::Timeout => ExecutionOutcome::Timeout,
            Trigger::Rejected => ExecutionOutcome::Rejected,
            Trigger::ShortCircuited => ExecutionOutcome::ShortCircuited,
        }
    }

    fn into_error(self, config: &CommandConfig, fallback: FallbackError<E>) -> CommandError<E> {
        let command = config.command_key.clone();
        match self {
            Trigger::Failure(error) => CommandError::Failure {
                command,
                error,
                fallback,
            },
            Trigger::Timeout => CommandError::Timeout {
                command,
                timeout: config.execution.timeout,
                fallback,
            },
            Trigger::Rejected => CommandError::Rejected {
                command,
                pool: config.pool_key.clone(),
                fallback,
            },
            Trigger::ShortCircuited => CommandError::ShortCircuited { command, fallback },
        }
    }
}

enum Run<T, E> {
    Completed(Result<T, E>),
    Panicked(Box<dyn Any + Send>),
    TimedOut,
}

// Aborts a spawned task unless disarmed, so that a timed-out or cancelled
// invocation does not leave interruptible work running.
struct AbortOnDrop(Option<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// Executes work as commands.
///
/// Cheap to clone; clones share one [`CommandRegistry`].
///
/// # Example
///
/// ```rust
/// use tower_command::{CommandConfig, CommandExecutor, ExecutionOutcome};
/// use std::time::Duration;
///
/// # async fn example() {
/// let executor = CommandExecutor::new();
/// let config = CommandConfig::builder("MainUserService.getUser")
///     .group_key("UserGroupKey")
///     .timeout(Duration::from_millis(110))
///     .build()
///     .unwrap();
///
/// let execution = executor
///     .execute(
///         &config,
///         |_cancel| async {
///             tokio::time::sleep(Duration::from_millis(500)).await;
///             Ok::<_, std::io::Error>("user")
///         },
///         |_trigger| async { Ok("cached user") },
///     )
///     .await;
///
/// assert_eq!(execution.outcome(), ExecutionOutcome::Timeout);
/// assert_eq!(execution.into_result().unwrap(), "cached user");
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    registry: Arc<CommandRegistry>,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandExecutor {
    /// Creates an executor with its own, empty registry.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(CommandRegistry::new()))
    }

    /// Creates an executor backed by the process-wide registry.
    pub fn global() -> Self {
        Self::with_registry(Arc::clone(CommandRegistry::global()))
    }

    /// Creates an executor backed by `registry`.
    pub fn with_registry(registry: Arc<CommandRegistry>) -> Self {
        Self { registry }
    }

    /// The registry holding this executor's command state.
    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    /// Runs `work` as the command described by `config`, falling back to
    /// `fallback` when the work fails, times out, is rejected or is
    /// short-circuited.
    ///
    /// `work` receives a token that is cancelled when the deadline passes.
    /// `fallback` receives the primary outcome that triggered it.
    ///
    /// If the command key was registered before, the registered
    /// configuration is used.
    ///
    /// # Panics
    ///
    /// A panic in `work` is recorded as a failure and then resumed on the
    /// caller's task.
    pub async fn execute<T, E, W, WF, F, FF>(
        &self,
        config: &CommandConfig,
        work: W,
        fallback: F,
    ) -> Execution<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        W: FnOnce(CancellationToken) -> WF + Send,
        WF: Future<Output = Result<T, E>> + Send + 'static,
        F: FnOnce(ExecutionOutcome) -> FF + Send,
        FF: Future<Output = Result<T, E>> + Send,
    {
        self.run(config, work, Some(fallback)).await
    }

    /// Runs `work` as a command that has no fallback.
    ///
    /// With fallback enabled, any failure records `FallbackMissing`.
    pub async fn execute_without_fallback<T, E, W, WF>(
        &self,
        config: &CommandConfig,
        work: W,
    ) -> Execution<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        W: FnOnce(CancellationToken) -> WF + Send,
        WF: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.run(
            config,
            work,
            None::<fn(ExecutionOutcome) -> Ready<Result<T, E>>>,
        )
        .await
    }

    async fn run<T, E, W, WF, F, FF>(
        &self,
        config: &CommandConfig,
        work: W,
        fallback: Option<F>,
    ) -> Execution<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        W: FnOnce(CancellationToken) -> WF + Send,
        WF: Future<Output = Result<T, E>> + Send + 'static,
        F: FnOnce(ExecutionOutcome) -> FF + Send,
        FF: Future<Output = Result<T, E>> + Send,
    {
        let start = Instant::now();
        let state = self.registry.register(config);
        let execution = invoke(&state, start, work, fallback).await;

        RequestLog::record(|| {
            let config = state.config();
            ExecutedCommand {
                command_key: config.command_key.clone(),
                group_key: config.group_key.clone(),
                pool_key: config.pool_key.clone(),
                events: execution.events(),
                latency: execution.latency,
                properties: Arc::clone(config),
                pool_properties: state.pool().properties(),
            }
        });

        execution
    }
}

async fn invoke<T, E, W, WF, F, FF>(
    state: &CommandState,
    start: Instant,
    work: W,
    fallback: Option<F>,
) -> Execution<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
    W: FnOnce(CancellationToken) -> WF,
    WF: Future<Output = Result<T, E>> + Send + 'static,
    F: FnOnce(ExecutionOutcome) -> FF,
    FF: Future<Output = Result<T, E>>,
{
    let config = state.config();
    let execution = &config.execution;
    let deadline = execution
        .timeout_enabled
        .then(|| start + execution.timeout);

    let Some(permit) = state.circuit().attempt() else {
        state.window().record(ExecutionOutcome::ShortCircuited);
        let latency = start.elapsed();
        completed(state, ExecutionOutcome::ShortCircuited, latency);
        return run_fallback(state, Trigger::ShortCircuited, fallback, latency).await;
    };

    let wait = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
    let slot = match state.pool().acquire(wait).await {
        Ok(slot) => slot,
        Err(PoolError::Rejected { .. }) => {
            permit.complete(ExecutionOutcome::Rejected);
            let latency = start.elapsed();
            completed(state, ExecutionOutcome::Rejected, latency);
            return run_fallback(state, Trigger::Rejected, fallback, latency).await;
        }
        Err(PoolError::WaitTimeout { .. }) => {
            state.pool().record(ExecutionOutcome::Timeout);
            permit.complete(ExecutionOutcome::Timeout);
            let latency = start.elapsed();
            completed(state, ExecutionOutcome::Timeout, latency);
            return run_fallback(state, Trigger::Timeout, fallback, latency).await;
        }
    };

    let token = CancellationToken::new();
    let cancel_on_drop = token.clone().drop_guard();
    let future = work(token);
    let run = match execution.isolation {
        IsolationStrategy::Pool => {
            run_spawned(future, deadline, execution.interrupt_on_timeout).await
        }
        IsolationStrategy::Inline => run_inline(future, deadline).await,
    };
    let latency = start.elapsed();

    let outcome = match &run {
        Run::Completed(Ok(_)) => ExecutionOutcome::Success,
        Run::Completed(Err(e)) if config.is_bad_request(e) => ExecutionOutcome::BadRequest,
        Run::Completed(Err(_)) | Run::Panicked(_) => ExecutionOutcome::Failure,
        Run::TimedOut => ExecutionOutcome::Timeout,
    };

    if outcome == ExecutionOutcome::Timeout {
        drop(cancel_on_drop);
    } else {
        cancel_on_drop.disarm();
    }
    drop(slot);
    state.pool().record(outcome);
    permit.complete(outcome);
    completed(state, outcome, latency);

    let trigger = match run {
        Run::Panicked(payload) => std::panic::resume_unwind(payload),
        Run::TimedOut => Trigger::Timeout,
        Run::Completed(Err(error)) if outcome.triggers_fallback() => Trigger::Failure(error),
        // Successes and bad requests go straight back to the caller.
        Run::Completed(result) => {
            return Execution {
                result: result.map_err(|error| CommandError::BadRequest {
                    command: config.command_key.clone(),
                    error,
                }),
                outcome,
                fallback: None,
                latency,
            };
        }
    };
    run_fallback(state, trigger, fallback, latency).await
}

async fn run_spawned<T, E, WF>(future: WF, deadline: Option<Instant>, interrupt: bool) -> Run<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
    WF: Future<Output = Result<T, E>> + Send + 'static,
{
    let handle = tokio::spawn(future);
    let mut abort = AbortOnDrop(interrupt.then(|| handle.abort_handle()));

    let joined = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, handle).await {
            Ok(joined) => joined,
            Err(_) => return Run::TimedOut,
        },
        None => handle.await,
    };
    abort.0 = None;

    match joined {
        Ok(result) => Run::Completed(result),
        Err(e) if e.is_panic() => Run::Panicked(e.into_panic()),
        // Aborted from outside, e.g. by runtime shutdown.
        Err(_) => Run::TimedOut,
    }
}

async fn run_inline<T, E, WF>(future: WF, deadline: Option<Instant>) -> Run<T, E>
where
    WF: Future<Output = Result<T, E>>,
{
    let future = AssertUnwindSafe(future).catch_unwind();
    let caught = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, future).await {
            Ok(caught) => caught,
            Err(_) => return Run::TimedOut,
        },
        None => future.await,
    };
    match caught {
        Ok(result) => Run::Completed(result),
        Err(payload) => Run::Panicked(payload),
    }
}

fn completed(state: &CommandState, outcome: ExecutionOutcome, latency: Duration) {
    let config = state.config();

    #[cfg(feature = "tracing")]
    match outcome {
        ExecutionOutcome::Timeout
        | ExecutionOutcome::Rejected
        | ExecutionOutcome::ShortCircuited => tracing::warn!(
            command = %config.command_key,
            outcome = outcome.as_str(),
            ?latency,
            "command did not run to completion"
        ),
        _ => tracing::debug!(
            command = %config.command_key,
            outcome = outcome.as_str(),
            ?latency,
            "command completed"
        ),
    }

    #[cfg(feature = "metrics")]
    {
        counter!(
            "command_executions_total",
            "command" => config.command_key.to_string(),
            "group" => config.group_key.to_string(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        histogram!(
            "command_execution_duration_seconds",
            "command" => config.command_key.to_string()
        )
        .record(latency.as_secs_f64());
    }

    config.event_listeners.emit(&CommandEvent::Executed {
        command: config.command_key.clone(),
        timestamp: std::time::Instant::now(),
        outcome,
        duration: latency,
    });
}

async fn run_fallback<T, E, F, FF>(
    state: &CommandState,
    trigger: Trigger<E>,
    fallback: Option<F>,
    latency: Duration,
) -> Execution<T, E>
where
    F: FnOnce(ExecutionOutcome) -> FF,
    FF: Future<Output = Result<T, E>>,
{
    let config = state.config();
    let outcome = trigger.outcome();
    debug_assert!(outcome.triggers_fallback());

    if !config.execution.fallback_enabled {
        return Execution {
            result: Err(trigger.into_error(config, FallbackError::Disabled)),
            outcome,
            fallback: None,
            latency,
        };
    }

    let (result, fallback_outcome) = match fallback {
        None => (
            Err(trigger.into_error(config, FallbackError::Missing)),
            ExecutionOutcome::FallbackMissing,
        ),
        Some(fallback) => match state.fallback_permits().try_acquire() {
            Err(_) => (
                Err(trigger.into_error(
                    config,
                    FallbackError::Rejected {
                        max_concurrent: config.execution.fallback_max_concurrent,
                    },
                )),
                ExecutionOutcome::FallbackRejected,
            ),
            Ok(_permit) => match fallback(outcome).await {
                Ok(value) => (Ok(value), ExecutionOutcome::FallbackSuccess),
                Err(error) => (
                    Err(trigger.into_error(config, FallbackError::Failed(error))),
                    ExecutionOutcome::FallbackFailure,
                ),
            },
        },
    };

    state.window().record(fallback_outcome);

    #[cfg(feature = "tracing")]
    tracing::debug!(
        command = %config.command_key,
        trigger = outcome.as_str(),
        outcome = fallback_outcome.as_str(),
        "fallback completed"
    );

    #[cfg(feature = "metrics")]
    counter!(
        "command_fallbacks_total",
        "command" => config.command_key.to_string(),
        "outcome" => fallback_outcome.as_str()
    )
    .increment(1);

    config.event_listeners.emit(&CommandEvent::Fallback {
        command: config.command_key.clone(),
        timestamp: std::time::Instant::now(),
        trigger: outcome,
        outcome: fallback_outcome,
    });

    Execution {
        result,
        outcome,
        fallback: Some(fallback_outcome),
        latency,
    }
}
