//! Core infrastructure for tower-command.
//!
//! This crate provides the vocabulary shared by the command execution engine
//! and anything that observes it:
//! - [`ExecutionOutcome`], the closed set of things that can happen to a command
//! - [`CommandKey`], [`GroupKey`] and [`PoolKey`] identifiers
//! - [`CommandError`] and [`FallbackError`], the caller-facing error types
//! - Event system for observability

pub mod error;
pub mod events;
pub mod key;
pub mod outcome;

pub use error::{CommandError, FallbackError};
pub use events::{EventListener, EventListeners, FnListener, ObservableEvent};
pub use key::{CommandKey, GroupKey, PoolKey};
pub use outcome::ExecutionOutcome;
