//! Per-request log of executed commands.
//!
//! A [`RequestLog`] is installed for the duration of a future with
//! [`RequestLog::scope`]. Every command executed by that future (on its own
//! task) is appended to the log, in completion order.
//!
//! ```rust
//! use tower_command::{CommandConfig, CommandExecutor, RequestLog};
//!
//! # async fn example() {
//! let executor = CommandExecutor::new();
//! let config = CommandConfig::builder("getUser").build().unwrap();
//! let log = RequestLog::new();
//!
//! log.scope(async {
//!     executor
//!         .execute_without_fallback(&config, |_| async { Ok::<_, std::io::Error>(1) })
//!         .await;
//! })
//! .await;
//!
//! let commands = log.all_executed_commands();
//! assert_eq!(commands[0].command_key, "getUser");
//! # }
//! ```

use crate::config::{CommandConfig, PoolProperties};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_command_core::{CommandKey, ExecutionOutcome, GroupKey, PoolKey};

tokio::task_local! {
    static REQUEST_LOG: RequestLog;
}

/// One command execution as seen by the request log.
#[derive(Debug, Clone)]
pub struct ExecutedCommand {
    /// Command that ran.
    pub command_key: CommandKey,
    /// Its group.
    pub group_key: GroupKey,
    /// The pool it ran in.
    pub pool_key: PoolKey,
    /// Primary outcome followed by the fallback outcome, if any.
    pub events: Vec<ExecutionOutcome>,
    /// Time from submission until the primary outcome was decided.
    pub latency: Duration,
    /// Configuration the command was registered with.
    pub properties: Arc<CommandConfig>,
    /// Pool properties at the time the command ran.
    pub pool_properties: PoolProperties,
}

impl ExecutedCommand {
    /// Returns `true` if the execution recorded `outcome`.
    pub fn has_event(&self, outcome: ExecutionOutcome) -> bool {
        self.events.contains(&outcome)
    }

    /// Returns `true` if the caller was answered by the fallback.
    pub fn is_response_from_fallback(&self) -> bool {
        self.has_event(ExecutionOutcome::FallbackSuccess)
    }
}

/// A log of the commands executed while serving one request.
#[derive(Debug, Clone, Default)]
pub struct RequestLog {
    commands: Arc<Mutex<Vec<ExecutedCommand>>>,
}

impl RequestLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `future` with this log installed.
    pub async fn scope<F: Future>(&self, future: F) -> F::Output {
        REQUEST_LOG.scope(self.clone(), future).await
    }

    /// The log installed for the current task, if any.
    pub fn current() -> Option<RequestLog> {
        REQUEST_LOG.try_with(Clone::clone).ok()
    }

    /// Every command recorded so far, in completion order.
    pub fn all_executed_commands(&self) -> Vec<ExecutedCommand> {
        self.commands.lock().clone()
    }

    /// Number of recorded commands.
    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }

    /// Returns `true` if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
    }

    pub(crate) fn record(command: impl FnOnce() -> ExecutedCommand) {
        let _ = REQUEST_LOG.try_with(|log| log.commands.lock().push(command()));
    }
}
