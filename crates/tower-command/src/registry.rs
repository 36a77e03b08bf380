//! Process-wide (or explicitly owned) table of command state.
//!
//! The registry owns one [`CommandState`] per command key and one
//! [`IsolationPool`] per pool key. Both are created on first use, exactly
//! once even under concurrent first calls, and live as long as the registry.
//! Unrelated keys never contend: each map shards its locks per entry.

use crate::circuit::{CircuitBreaker, CircuitState};
use crate::config::{CommandConfig, ConfigError, PoolProperties};
use crate::pool::{IsolationPool, PoolMetrics};
use crate::window::{RollingWindow, WindowSnapshot};
use dashmap::DashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::sync::Semaphore;
use tower_command_core::{CommandKey, PoolKey};

static GLOBAL: OnceLock<Arc<CommandRegistry>> = OnceLock::new();

/// Everything the executor needs for one command key.
pub struct CommandState {
    config: Arc<CommandConfig>,
    window: Arc<RollingWindow>,
    circuit: CircuitBreaker,
    pool: Arc<IsolationPool>,
    fallback_permits: Arc<Semaphore>,
}

impl CommandState {
    fn new(config: CommandConfig, pool: Arc<IsolationPool>) -> Self {
        let window = Arc::new(RollingWindow::new(config.window));
        let circuit = CircuitBreaker::new(
            config.command_key.clone(),
            config.circuit.clone(),
            Arc::clone(&window),
            config.event_listeners.clone(),
        );
        let fallback_permits = Arc::new(Semaphore::new(config.execution.fallback_max_concurrent));
        Self {
            config: Arc::new(config),
            window,
            circuit,
            pool,
            fallback_permits,
        }
    }

    /// The configuration the command was registered with.
    pub fn config(&self) -> &Arc<CommandConfig> {
        &self.config
    }

    /// The command's rolling window.
    pub fn window(&self) -> &Arc<RollingWindow> {
        &self.window
    }

    /// The command's circuit breaker.
    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// The pool the command runs in.
    pub fn pool(&self) -> &Arc<IsolationPool> {
        &self.pool
    }

    pub(crate) fn fallback_permits(&self) -> &Arc<Semaphore> {
        &self.fallback_permits
    }
}

impl fmt::Debug for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandState")
            .field("command_key", &self.config.command_key)
            .field("circuit", &self.circuit.state())
            .field("pool", &self.pool.key())
            .finish()
    }
}

/// Table of command states and isolation pools.
#[derive(Default)]
pub struct CommandRegistry {
    commands: DashMap<CommandKey, Arc<CommandState>>,
    pools: DashMap<PoolKey, Arc<IsolationPool>>,
}

impl CommandRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        crate::describe_metrics();
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static Arc<CommandRegistry> {
        GLOBAL.get_or_init(|| Arc::new(CommandRegistry::new()))
    }

    /// Returns the state for `config`'s command key, creating it (and its
    /// pool, if needed) on first use.
    ///
    /// The first registration of a key wins: later configurations for the
    /// same command key, or pool properties for an existing pool key, are
    /// ignored.
    pub fn register(&self, config: &CommandConfig) -> Arc<CommandState> {
        if let Some(state) = self.commands.get(&config.command_key) {
            return Arc::clone(state.value());
        }

        let entry = self
            .commands
            .entry(config.command_key.clone())
            .or_insert_with(|| {
                let pool = self.pool_for(config);

                #[cfg(feature = "tracing")]
                tracing::debug!(
                    command = %config.command_key,
                    group = %config.group_key,
                    pool = %config.pool_key,
                    "registered command"
                );

                Arc::new(CommandState::new(config.clone(), pool))
            });
        Arc::clone(entry.value())
    }

    fn pool_for(&self, config: &CommandConfig) -> Arc<IsolationPool> {
        let entry = self
            .pools
            .entry(config.pool_key.clone())
            .or_insert_with(|| {
                Arc::new(IsolationPool::new(
                    config.pool_key.clone(),
                    config.pool.clone(),
                ))
            });
        Arc::clone(entry.value())
    }

    /// The state registered for a command key.
    pub fn state(&self, command: &str) -> Option<Arc<CommandState>> {
        self.commands.get(command).map(|s| Arc::clone(s.value()))
    }

    /// The pool registered for a pool key.
    pub fn pool(&self, pool: &str) -> Option<Arc<IsolationPool>> {
        self.pools.get(pool).map(|p| Arc::clone(p.value()))
    }

    /// Keys of every registered command.
    pub fn command_keys(&self) -> Vec<CommandKey> {
        self.commands.iter().map(|e| e.key().clone()).collect()
    }

    /// Outcome counts currently inside the command's rolling window.
    pub fn execution_events(&self, command: &str) -> Option<WindowSnapshot> {
        self.state(command).map(|s| s.window.snapshot())
    }

    /// Outcome counts since the command was registered.
    pub fn cumulative_events(&self, command: &str) -> Option<WindowSnapshot> {
        self.state(command).map(|s| s.window.cumulative())
    }

    /// The configuration a command was registered with.
    pub fn properties(&self, command: &str) -> Option<Arc<CommandConfig>> {
        self.state(command).map(|s| Arc::clone(&s.config))
    }

    /// Current properties of a pool.
    pub fn pool_properties(&self, pool: &str) -> Option<PoolProperties> {
        self.pool(pool).map(|p| p.properties())
    }

    /// Counters of a pool.
    pub fn pool_metrics(&self, pool: &str) -> Option<PoolMetrics> {
        self.pool(pool).map(|p| p.metrics())
    }

    /// Current circuit state of a command.
    pub fn circuit_state(&self, command: &str) -> Option<CircuitState> {
        self.state(command).map(|s| s.circuit.state())
    }

    /// Resizes a pool at runtime.
    pub fn reconfigure_pool(
        &self,
        pool: &str,
        properties: PoolProperties,
    ) -> Result<(), ConfigError> {
        self.pool(pool)
            .ok_or_else(|| ConfigError::UnknownPool(pool.to_string()))?
            .reconfigure(properties)
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.commands.len())
            .field("pools", &self.pools.len())
            .finish()
    }
}
