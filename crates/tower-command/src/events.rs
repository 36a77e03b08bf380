use crate::circuit::CircuitState;
use std::time::{Duration, Instant};
use tower_command_core::{CommandKey, ExecutionOutcome, ObservableEvent};

/// Events emitted while executing a command.
#[derive(Debug, Clone)]
pub enum CommandEvent {
    /// The primary path of an invocation reached its outcome.
    Executed {
        command: CommandKey,
        timestamp: Instant,
        outcome: ExecutionOutcome,
        duration: Duration,
    },
    /// The fallback path was entered.
    Fallback {
        command: CommandKey,
        timestamp: Instant,
        trigger: ExecutionOutcome,
        outcome: ExecutionOutcome,
    },
    /// The command's circuit changed state.
    StateTransition {
        command: CommandKey,
        timestamp: Instant,
        from: CircuitState,
        to: CircuitState,
    },
}

impl ObservableEvent for CommandEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CommandEvent::Executed { .. } => "executed",
            CommandEvent::Fallback { .. } => "fallback",
            CommandEvent::StateTransition { .. } => "state_transition",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            CommandEvent::Executed { timestamp, .. }
            | CommandEvent::Fallback { timestamp, .. }
            | CommandEvent::StateTransition { timestamp, .. } => *timestamp,
        }
    }

    fn command_key(&self) -> &CommandKey {
        match self {
            CommandEvent::Executed { command, .. }
            | CommandEvent::Fallback { command, .. }
            | CommandEvent::StateTransition { command, .. } => command,
        }
    }

    /// The primary outcome for [`CommandEvent::Executed`] and the fallback
    /// outcome for [`CommandEvent::Fallback`].
    fn outcome(&self) -> Option<ExecutionOutcome> {
        match self {
            CommandEvent::Executed { outcome, .. } | CommandEvent::Fallback { outcome, .. } => {
                Some(*outcome)
            }
            CommandEvent::StateTransition { .. } => None,
        }
    }
}
