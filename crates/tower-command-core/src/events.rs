//! Event system for command execution.
//!
//! Every component of the execution engine reports what happened to a
//! command through [`EventListeners`], so metrics exporters, loggers and
//! tests can observe commands without the engine knowing about them.
//!
//! Events are always attributed to a [`CommandKey`], and events that report
//! an [`ExecutionOutcome`] expose it, so a listener can subscribe to a single
//! command or a single outcome without matching on the event type:
//!
//! ```rust
//! use std::time::Instant;
//! use tower_command_core::{CommandKey, EventListeners, ExecutionOutcome, ObservableEvent};
//!
//! #[derive(Debug)]
//! struct Finished {
//!     command: CommandKey,
//!     at: Instant,
//!     outcome: ExecutionOutcome,
//! }
//!
//! impl ObservableEvent for Finished {
//!     fn event_type(&self) -> &'static str {
//!         "finished"
//!     }
//!     fn timestamp(&self) -> Instant {
//!         self.at
//!     }
//!     fn command_key(&self) -> &CommandKey {
//!         &self.command
//!     }
//!     fn outcome(&self) -> Option<ExecutionOutcome> {
//!         Some(self.outcome)
//!     }
//! }
//!
//! let mut listeners = EventListeners::new();
//! listeners.on_outcome(ExecutionOutcome::Timeout, |event: &Finished| {
//!     println!("{} timed out", event.command_key());
//! });
//! ```

use crate::key::CommandKey;
use crate::outcome::ExecutionOutcome;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// An event emitted on behalf of one command.
pub trait ObservableEvent: Send + Sync + fmt::Debug {
    /// Short label for the kind of event, e.g. `"executed"`.
    fn event_type(&self) -> &'static str;

    /// When the event occurred.
    fn timestamp(&self) -> Instant;

    /// The command the event belongs to.
    fn command_key(&self) -> &CommandKey;

    /// The outcome this event reports, if it reports one.
    fn outcome(&self) -> Option<ExecutionOutcome> {
        None
    }
}

/// Receives command events.
pub trait EventListener<E: ObservableEvent>: Send + Sync {
    /// Called for every emitted event.
    fn on_event(&self, event: &E);
}

/// A listener shared between cloned collections.
pub type SharedEventListener<E> = Arc<dyn EventListener<E>>;

/// An ordered collection of listeners.
///
/// Cloning is cheap and the clone shares the registered listeners.
#[derive(Clone)]
pub struct EventListeners<E: ObservableEvent> {
    listeners: Vec<SharedEventListener<E>>,
}

impl<E: ObservableEvent> EventListeners<E> {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Adds a listener that sees every event.
    pub fn add<L>(&mut self, listener: L)
    where
        L: EventListener<E> + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    /// Adds a callback for events that report `outcome`.
    pub fn on_outcome<F>(&mut self, outcome: ExecutionOutcome, f: F)
    where
        E: 'static,
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.add(FnListener::new(move |event: &E| {
            if event.outcome() == Some(outcome) {
                f(event);
            }
        }));
    }

    /// Adds a callback for events that belong to `command`.
    pub fn on_command<F>(&mut self, command: impl Into<CommandKey>, f: F)
    where
        E: 'static,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let command = command.into();
        self.add(FnListener::new(move |event: &E| {
            if *event.command_key() == command {
                f(event);
            }
        }));
    }

    /// Delivers `event` to every listener in registration order.
    ///
    /// Listeners run on the command's execution path. A panicking listener
    /// is caught so that the remaining listeners still receive the event and
    /// the command itself is unaffected.
    pub fn emit(&self, event: &E) {
        for listener in &self.listeners {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_event(event);
            }));
        }
    }

    /// Returns true if there are no listeners.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}

impl<E: ObservableEvent> Default for EventListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: ObservableEvent> fmt::Debug for EventListeners<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListeners")
            .field("len", &self.listeners.len())
            .finish()
    }
}

/// A listener backed by a closure.
pub struct FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    f: F,
    _event: std::marker::PhantomData<fn(&E)>,
}

impl<E, F> FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    /// Wraps `f` as a listener.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _event: std::marker::PhantomData,
        }
    }
}

impl<E, F> EventListener<E> for FnListener<E, F>
where
    E: ObservableEvent,
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        (self.f)(event)
    }
}
