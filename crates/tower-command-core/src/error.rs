//! Caller-facing error types.
//!
//! A command recovers locally from failures, timeouts, pool rejections and
//! short-circuits by invoking its fallback. Only when that recovery is not
//! possible does [`CommandError`] reach the caller, and it always describes
//! the *triggering* problem. What went wrong with the fallback is attached as
//! secondary context in [`FallbackError`]; it never replaces the trigger.
//!
//! # Pattern Matching
//!
//! ```rust
//! use tower_command_core::{CommandError, FallbackError};
//!
//! fn describe(error: &CommandError<std::io::Error>) -> String {
//!     match error {
//!         CommandError::Timeout { timeout, .. } => format!("gave up after {:?}", timeout),
//!         CommandError::ShortCircuited { command, .. } => format!("{} is unavailable", command),
//!         CommandError::Rejected { pool, .. } => format!("pool {} is saturated", pool),
//!         CommandError::Failure { error, fallback: FallbackError::Failed(_), .. } => {
//!             format!("both paths failed, primary error: {}", error)
//!         }
//!         other => other.to_string(),
//!     }
//! }
//! ```

use crate::key::{CommandKey, PoolKey};
use crate::outcome::ExecutionOutcome;
use std::fmt;
use std::time::Duration;

/// Why the fallback could not rescue an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackError<E> {
    /// Fallback is disabled for this command.
    Disabled,
    /// Fallback is enabled but the caller did not supply one.
    Missing,
    /// Too many fallbacks for this command were already running.
    Rejected {
        /// Configured fallback concurrency limit.
        max_concurrent: usize,
    },
    /// The fallback ran and returned an error.
    Failed(E),
}

impl<E> FallbackError<E> {
    /// Returns the fallback outcome recorded for this error, if the fallback
    /// path was entered at all.
    pub fn outcome(&self) -> Option<ExecutionOutcome> {
        match self {
            FallbackError::Disabled => None,
            FallbackError::Missing => Some(ExecutionOutcome::FallbackMissing),
            FallbackError::Rejected { .. } => Some(ExecutionOutcome::FallbackRejected),
            FallbackError::Failed(_) => Some(ExecutionOutcome::FallbackFailure),
        }
    }

    /// Returns the fallback's own error, if it ran and failed.
    pub fn into_failure(self) -> Option<E> {
        match self {
            FallbackError::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Maps the fallback's error using a function.
    pub fn map<F, T>(self, f: F) -> FallbackError<T>
    where
        F: FnOnce(E) -> T,
    {
        match self {
            FallbackError::Disabled => FallbackError::Disabled,
            FallbackError::Missing => FallbackError::Missing,
            FallbackError::Rejected { max_concurrent } => {
                FallbackError::Rejected { max_concurrent }
            }
            FallbackError::Failed(e) => FallbackError::Failed(f(e)),
        }
    }
}

impl<E: fmt::Display> fmt::Display for FallbackError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackError::Disabled => write!(f, "fallback disabled"),
            FallbackError::Missing => write!(f, "no fallback available"),
            FallbackError::Rejected { max_concurrent } => {
                write!(f, "fallback rejected ({} concurrent max)", max_concurrent)
            }
            FallbackError::Failed(e) => write!(f, "fallback failed: {}", e),
        }
    }
}

/// Error returned when a command could not produce a value.
///
/// # Type Parameters
///
/// - `E`: The error type of the work (and of its fallback)
#[derive(Debug, Clone)]
pub enum CommandError<E> {
    /// The work returned an error and the fallback could not recover.
    Failure {
        /// Command that failed.
        command: CommandKey,
        /// The work's error.
        error: E,
        /// Why the fallback did not help.
        fallback: FallbackError<E>,
    },

    /// The work exceeded its deadline and the fallback could not recover.
    Timeout {
        /// Command that timed out.
        command: CommandKey,
        /// The configured timeout.
        timeout: Duration,
        /// Why the fallback did not help.
        fallback: FallbackError<E>,
    },

    /// The isolation pool refused the work and the fallback could not recover.
    Rejected {
        /// Command that was rejected.
        command: CommandKey,
        /// Pool that rejected it.
        pool: PoolKey,
        /// Why the fallback did not help.
        fallback: FallbackError<E>,
    },

    /// The circuit was open and the fallback could not recover.
    ShortCircuited {
        /// Command whose circuit is open.
        command: CommandKey,
        /// Why the fallback did not help.
        fallback: FallbackError<E>,
    },

    /// The work failed with an error classified as a bad request.
    ///
    /// Bad requests bypass the fallback and do not affect circuit health.
    BadRequest {
        /// Command that received the bad request.
        command: CommandKey,
        /// The work's error.
        error: E,
    },
}

impl<E: fmt::Display> fmt::Display for CommandError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Failure {
                command,
                error,
                fallback,
            } => write!(f, "command '{}' failed: {} ({})", command, error, fallback),
            CommandError::Timeout {
                command,
                timeout,
                fallback,
            } => write!(
                f,
                "command '{}' timed out after {:?} ({})",
                command, timeout, fallback
            ),
            CommandError::Rejected {
                command,
                pool,
                fallback,
            } => write!(
                f,
                "command '{}' rejected by pool '{}' ({})",
                command, pool, fallback
            ),
            CommandError::ShortCircuited { command, fallback } => write!(
                f,
                "command '{}' short-circuited: circuit is open ({})",
                command, fallback
            ),
            CommandError::BadRequest { command, error } => {
                write!(f, "command '{}' bad request: {}", command, error)
            }
        }
    }
}

impl<E> std::error::Error for CommandError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Failure { error, .. } | CommandError::BadRequest { error, .. } => {
                Some(error)
            }
            _ => None,
        }
    }
}

impl<E> CommandError<E> {
    /// Returns the primary outcome that produced this error.
    pub fn outcome(&self) -> ExecutionOutcome {
        match self {
            CommandError::Failure { .. } => ExecutionOutcome::Failure,
            CommandError::Timeout { .. } => ExecutionOutcome::Timeout,
            CommandError::Rejected { .. } => ExecutionOutcome::Rejected,
            CommandError::ShortCircuited { .. } => ExecutionOutcome::ShortCircuited,
            CommandError::BadRequest { .. } => ExecutionOutcome::BadRequest,
        }
    }

    /// Returns the key of the command that failed.
    pub fn command_key(&self) -> &CommandKey {
        match self {
            CommandError::Failure { command, .. }
            | CommandError::Timeout { command, .. }
            | CommandError::Rejected { command, .. }
            | CommandError::ShortCircuited { command, .. }
            | CommandError::BadRequest { command, .. } => command,
        }
    }

    /// Returns why the fallback did not recover, if a fallback was relevant.
    pub fn fallback_error(&self) -> Option<&FallbackError<E>> {
        match self {
            CommandError::Failure { fallback, .. }
            | CommandError::Timeout { fallback, .. }
            | CommandError::Rejected { fallback, .. }
            | CommandError::ShortCircuited { fallback, .. } => Some(fallback),
            CommandError::BadRequest { .. } => None,
        }
    }

    /// Returns `true` if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CommandError::Timeout { .. })
    }

    /// Returns `true` if the circuit was open.
    pub fn is_short_circuited(&self) -> bool {
        matches!(self, CommandError::ShortCircuited { .. })
    }

    /// Returns `true` if the pool rejected the work.
    pub fn is_rejected(&self) -> bool {
        matches!(self, CommandError::Rejected { .. })
    }

    /// Returns `true` if the work itself returned an error.
    pub fn is_failure(&self) -> bool {
        matches!(self, CommandError::Failure { .. })
    }

    /// Returns `true` if this is a bad request.
    pub fn is_bad_request(&self) -> bool {
        matches!(self, CommandError::BadRequest { .. })
    }

    /// Returns a reference to the work's error, if the work ran and failed.
    pub fn inner(&self) -> Option<&E> {
        match self {
            CommandError::Failure { error, .. } | CommandError::BadRequest { error, .. } => {
                Some(error)
            }
            _ => None,
        }
    }

    /// Extracts the work's error, if the work ran and failed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            CommandError::Failure { error, .. } | CommandError::BadRequest { error, .. } => {
                Some(error)
            }
            _ => None,
        }
    }

    /// Maps the work (and fallback) error type using a function.
    ///
    /// # Examples
    ///
    /// ```
    /// use tower_command_core::{CommandError, CommandKey, FallbackError};
    ///
    /// let err: CommandError<String> = CommandError::Failure {
    ///     command: CommandKey::from("lookup"),
    ///     error: "boom".to_string(),
    ///     fallback: FallbackError::Disabled,
    /// };
    /// let mapped: CommandError<usize> = err.map(|s| s.len());
    /// assert_eq!(mapped.into_inner(), Some(4));
    /// ```
    pub fn map<F, T>(self, f: F) -> CommandError<T>
    where
        F: Fn(E) -> T,
    {
        match self {
            CommandError::Failure {
                command,
                error,
                fallback,
            } => CommandError::Failure {
                command,
                error: f(error),
                fallback: fallback.map(&f),
            },
            CommandError::Timeout {
                command,
                timeout,
                fallback,
            } => CommandError::Timeout {
                command,
                timeout,
                fallback: fallback.map(&f),
            },
            CommandError::Rejected {
                command,
                pool,
                fallback,
            } => CommandError::Rejected {
                command,
                pool,
                fallback: fallback.map(&f),
            },
            CommandError::ShortCircuited { command, fallback } => CommandError::ShortCircuited {
                command,
                fallback: fallback.map(&f),
            },
            CommandError::BadRequest { command, error } => CommandError::BadRequest {
                command,
                error: f(error),
            },
        }
    }
}
