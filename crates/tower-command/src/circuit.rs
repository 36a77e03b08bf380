use crate::config::CircuitProperties;
use crate::events::CommandEvent;
use crate::window::RollingWindow;
#[cfg(feature = "metrics")]
use metrics::{counter, gauge};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tower_command_core::{CommandKey, EventListeners, ExecutionOutcome};

/// Represents the state of a command's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum CircuitState {
    /// Requests pass and outcomes are evaluated.
    Closed = 0,
    /// Requests are short-circuited until the sleep window elapses.
    Open = 1,
    /// A single probe request is running; everything else short-circuits.
    HalfOpen = 2,
}

impl CircuitState {
    fn from_bits(bits: u64) -> Self {
        match bits & STATE_MASK {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Stable label used for metrics and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

const STATE_MASK: u64 = 0b11;

// State and the time the circuit last opened share one word so that a
// transition to Open publishes both at once.
fn pack(state: CircuitState, opened_at_ms: u64) -> u64 {
    (opened_at_ms << 2) | state as u64
}

fn opened_at(bits: u64) -> u64 {
    bits >> 2
}

/// Circuit breaker for a single command.
///
/// The breaker keeps no counters of its own: it trips on the command's
/// [`RollingWindow`] and resets that window when it closes.
pub struct CircuitBreaker {
    command: CommandKey,
    properties: CircuitProperties,
    window: Arc<RollingWindow>,
    state: AtomicU64,
    origin: Instant,
    listeners: EventListeners<CommandEvent>,
}

impl CircuitBreaker {
    /// Creates a closed breaker over `window`.
    pub fn new(
        command: CommandKey,
        properties: CircuitProperties,
        window: Arc<RollingWindow>,
        listeners: EventListeners<CommandEvent>,
    ) -> Self {
        Self {
            command,
            properties,
            window,
            state: AtomicU64::new(pack(CircuitState::Closed, 0)),
            origin: Instant::now(),
            listeners,
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_bits(self.state.load(Ordering::Acquire))
    }

    /// Returns `true` unless the circuit is closed.
    pub fn is_open(&self) -> bool {
        self.state() != CircuitState::Closed
    }

    /// The rolling window this breaker evaluates.
    pub fn window(&self) -> &Arc<RollingWindow> {
        &self.window
    }

    fn now_ms(&self) -> u64 {
        Instant::now()
            .saturating_duration_since(self.origin)
            .as_millis() as u64
    }

    /// Asks whether a request may run. `None` means short-circuit.
    ///
    /// Once the sleep window has elapsed, exactly one caller receives a
    /// probe permit; the circuit's next state depends on that permit's
    /// outcome.
    pub fn attempt(&self) -> Option<CircuitPermit<'_>> {
        if !self.properties.enabled {
            return Some(CircuitPermit::new(self, false));
        }
        if self.properties.force_open {
            return None;
        }
        if self.properties.force_closed {
            return Some(CircuitPermit::new(self, false));
        }

        let mut bits = self.state.load(Ordering::Acquire);
        if CircuitState::from_bits(bits) == CircuitState::Closed {
            if !self.trip_if_unhealthy() {
                return Some(CircuitPermit::new(self, false));
            }
            bits = self.state.load(Ordering::Acquire);
        }

        match CircuitState::from_bits(bits) {
            CircuitState::Closed => Some(CircuitPermit::new(self, false)),
            CircuitState::HalfOpen => None,
            CircuitState::Open => {
                let sleep_ms = self.properties.sleep_window.as_millis() as u64;
                if self.now_ms().saturating_sub(opened_at(bits)) < sleep_ms {
                    return None;
                }
                let probe = pack(CircuitState::HalfOpen, opened_at(bits));
                self.state
                    .compare_exchange(bits, probe, Ordering::AcqRel, Ordering::Acquire)
                    .ok()
                    .map(|_| {
                        self.emit_transition(CircuitState::Open, CircuitState::HalfOpen);
                        CircuitPermit::new(self, true)
                    })
            }
        }
    }

    // Returns true if the circuit is no longer closed.
    fn trip_if_unhealthy(&self) -> bool {
        let snapshot = self.window.snapshot();
        if snapshot.total_requests() < self.properties.request_volume_threshold
            || snapshot.error_percentage() < self.properties.error_threshold_percentage
        {
            return false;
        }

        let closed = self.state.load(Ordering::Acquire);
        if CircuitState::from_bits(closed) != CircuitState::Closed {
            return true;
        }
        let open = pack(CircuitState::Open, self.now_ms());
        if self
            .state
            .compare_exchange(closed, open, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                command = %self.command,
                requests = snapshot.total_requests(),
                error_percentage = snapshot.error_percentage(),
                "circuit opened"
            );
            self.emit_transition(CircuitState::Closed, CircuitState::Open);
        }
        true
    }

    fn complete(&self, outcome: ExecutionOutcome, probe: bool) {
        self.window.record(outcome);

        if probe {
            self.finish_probe(outcome == ExecutionOutcome::Success);
        } else if self.properties.enabled
            && !self.properties.force_closed
            && outcome.is_error()
            && self.state() == CircuitState::Closed
        {
            self.trip_if_unhealthy();
        }
    }

    fn finish_probe(&self, success: bool) {
        let bits = self.state.load(Ordering::Acquire);
        if CircuitState::from_bits(bits) != CircuitState::HalfOpen {
            return;
        }
        let next = if success {
            // Only the trial call leaves HalfOpen, so the window can be cleared
            // before any caller sees Closed.
            self.window.reset();
            pack(CircuitState::Closed, opened_at(bits))
        } else {
            pack(CircuitState::Open, self.now_ms())
        };
        if self
            .state
            .compare_exchange(bits, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.emit_transition(CircuitState::HalfOpen, CircuitState::from_bits(next));
        }
    }

    fn emit_transition(&self, from: CircuitState, to: CircuitState) {
        #[cfg(feature = "tracing")]
        tracing::debug!(command = %self.command, from = from.as_str(), to = to.as_str(), "circuit state transition");

        #[cfg(feature = "metrics")]
        {
            counter!(
                "command_circuit_transitions_total",
                "command" => self.command.to_string(),
                "from" => from.as_str(),
                "to" => to.as_str()
            )
            .increment(1);
            gauge!("command_circuit_state", "command" => self.command.to_string())
                .set(to as u8 as f64);
        }

        self.listeners.emit(&CommandEvent::StateTransition {
            command: self.command.clone(),
            timestamp: std::time::Instant::now(),
            from,
            to,
        });
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("command", &self.command)
            .field("state", &self.state())
            .field("properties", &self.properties)
            .finish()
    }
}

/// Permission to run one request through the breaker.
///
/// Complete it with the request's primary outcome. A probe permit dropped
/// without an outcome reopens the circuit so that a later request can probe.
#[must_use = "a permit must be completed with the request's outcome"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    completed: bool,
}

impl<'a> CircuitPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            completed: false,
        }
    }

    /// Returns `true` if this request is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Records the primary outcome and updates the circuit.
    pub fn complete(mut self, outcome: ExecutionOutcome) {
        self.completed = true;
        self.breaker.complete(outcome, self.probe);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.completed {
            self.breaker.finish_probe(false);
        }
    }
}
