use crate::circuit::CircuitState;
use crate::events::CommandEvent;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tower_command_core::{CommandKey, EventListeners, ExecutionOutcome, FnListener, GroupKey, PoolKey};

/// Errors raised while building or registering a configuration.
///
/// A `ConfigError` is fatal: it is reported at setup time and never at call
/// time, and retrying with the same input always fails again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A key was empty.
    #[error("{0} must not be empty")]
    EmptyKey(&'static str),

    /// The rolling window has no buckets.
    #[error("rolling window must have at least one bucket")]
    ZeroBuckets,

    /// The window duration is zero.
    #[error("rolling window duration must be at least 1ms")]
    ZeroWindow,

    /// The bucket count does not divide the window duration evenly.
    #[error("{num_buckets} buckets do not evenly divide a {window_ms}ms rolling window")]
    InvalidBucketCount {
        /// Window duration in milliseconds.
        window_ms: u128,
        /// Requested bucket count.
        num_buckets: u32,
    },

    /// The pool has no core slots.
    #[error("pool core size must be at least 1")]
    ZeroCoreSize,

    /// `max_size` is below `core_size` while divergence is allowed.
    #[error("pool max size ({max_size}) must be >= core size ({core_size})")]
    InvalidPoolSize {
        /// Configured core size.
        core_size: usize,
        /// Configured max size.
        max_size: usize,
    },

    /// The error threshold is not a percentage.
    #[error("error threshold percentage must be within 0..=100, got {0}")]
    InvalidErrorThreshold(u32),

    /// Timeouts are enabled with a zero timeout.
    #[error("timeout must be non-zero when timeouts are enabled")]
    ZeroTimeout,

    /// A named property is not recognised.
    #[error("unknown property '{0}'")]
    UnknownProperty(String),

    /// No pool with the given key has been registered.
    #[error("unknown pool '{0}'")]
    UnknownPool(String),

    /// A named property has a value that does not parse.
    #[error("invalid value '{value}' for property '{name}'")]
    InvalidPropertyValue {
        /// Property name.
        name: String,
        /// Offending value.
        value: String,
    },
}

/// Where the work of a command runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IsolationStrategy {
    /// The work is spawned onto its own Tokio task. A timed-out task can be
    /// aborted or left running in the background.
    #[default]
    Pool,
    /// The work is polled on the caller's task and dropped on timeout.
    Inline,
}

/// How a single execution is run.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExecutionProperties {
    /// Deadline for the work, including time spent queued for a slot.
    pub timeout: Duration,
    /// Whether the deadline is enforced at all.
    pub timeout_enabled: bool,
    /// Whether a timed-out task is aborted (`true`) or abandoned (`false`).
    pub interrupt_on_timeout: bool,
    /// Where the work runs.
    pub isolation: IsolationStrategy,
    /// Whether the fallback path is taken on failure.
    pub fallback_enabled: bool,
    /// Maximum number of concurrently running fallbacks for one command.
    pub fallback_max_concurrent: usize,
}

impl Default for ExecutionProperties {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            timeout_enabled: true,
            interrupt_on_timeout: true,
            isolation: IsolationStrategy::Pool,
            fallback_enabled: true,
            fallback_max_concurrent: 10,
        }
    }
}

/// When the circuit opens and how long it stays open.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CircuitProperties {
    /// Whether the breaker takes part in execution at all.
    pub enabled: bool,
    /// Minimum number of requests in the window before the error rate counts.
    pub request_volume_threshold: u64,
    /// Error percentage at or above which the circuit opens.
    pub error_threshold_percentage: u32,
    /// Time the circuit stays open before admitting a probe.
    pub sleep_window: Duration,
    /// Short-circuit every request regardless of health.
    pub force_open: bool,
    /// Never short-circuit, regardless of health.
    pub force_closed: bool,
}

impl Default for CircuitProperties {
    fn default() -> Self {
        Self {
            enabled: true,
            request_volume_threshold: 20,
            error_threshold_percentage: 50,
            sleep_window: Duration::from_millis(5000),
            force_open: false,
            force_closed: false,
        }
    }
}

/// Shape of a rolling statistics window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WindowProperties {
    /// Total span covered by the window.
    pub duration: Duration,
    /// Number of buckets the span is divided into.
    pub num_buckets: u32,
}

impl Default for WindowProperties {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(10_000),
            num_buckets: 10,
        }
    }
}

impl WindowProperties {
    /// Creates window properties from a duration and bucket count.
    pub fn new(duration: Duration, num_buckets: u32) -> Self {
        Self {
            duration,
            num_buckets,
        }
    }

    /// Span covered by one bucket.
    pub fn bucket_duration(&self) -> Duration {
        self.duration / self.num_buckets.max(1)
    }

    /// Checks that the bucket count divides the window evenly.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_buckets == 0 {
            return Err(ConfigError::ZeroBuckets);
        }
        let window_ms = self.duration.as_millis();
        if window_ms == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if self.duration.subsec_nanos() % 1_000_000 != 0
            || window_ms % u128::from(self.num_buckets) != 0
        {
            return Err(ConfigError::InvalidBucketCount {
                window_ms,
                num_buckets: self.num_buckets,
            });
        }
        Ok(())
    }
}

/// Sizing of an isolation pool.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolProperties {
    /// Slots kept available at rest.
    pub core_size: usize,
    /// Upper bound on slots when divergence from the core size is allowed.
    pub max_size: usize,
    /// Bound of the wait queue. `None` means no queue: a full pool rejects.
    pub max_queue_size: Option<usize>,
    /// Queue length at which new arrivals are rejected even though
    /// `max_queue_size` has room. Adjustable at runtime.
    pub queue_rejection_threshold: usize,
    /// Idle time after which slots above the core size are reclaimed.
    pub keep_alive: Duration,
    /// Whether the pool may grow from `core_size` up to `max_size`.
    pub allow_max_diverge_from_core: bool,
    /// Rolling window of the pool's own statistics.
    pub window: WindowProperties,
}

impl Default for PoolProperties {
    fn default() -> Self {
        Self {
            core_size: 10,
            max_size: 10,
            max_queue_size: None,
            queue_rejection_threshold: 5,
            keep_alive: Duration::from_secs(60),
            allow_max_diverge_from_core: false,
            window: WindowProperties::default(),
        }
    }
}

impl PoolProperties {
    /// Largest number of slots the pool may hold.
    pub fn effective_max_size(&self) -> usize {
        if self.allow_max_diverge_from_core {
            self.max_size.max(self.core_size)
        } else {
            self.core_size
        }
    }

    /// Number of waiters the pool admits into its queue.
    pub fn queue_limit(&self) -> usize {
        match self.max_queue_size {
            None => 0,
            Some(max) => max.min(self.queue_rejection_threshold),
        }
    }

    /// Checks the sizing invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.core_size == 0 {
            return Err(ConfigError::ZeroCoreSize);
        }
        if self.allow_max_diverge_from_core && self.max_size < self.core_size {
            return Err(ConfigError::InvalidPoolSize {
                core_size: self.core_size,
                max_size: self.max_size,
            });
        }
        self.window.validate()
    }
}

pub(crate) type BadRequestClassifier = Arc<dyn Fn(&(dyn Any + Send)) -> bool + Send + Sync>;

/// Immutable, validated description of a command.
///
/// Built with [`CommandConfig::builder`]; every invariant is checked by
/// [`CommandConfigBuilder::build`], so an existing `CommandConfig` can always
/// be registered and executed.
#[derive(Clone)]
pub struct CommandConfig {
    pub(crate) command_key: CommandKey,
    pub(crate) group_key: GroupKey,
    pub(crate) pool_key: PoolKey,
    pub(crate) execution: ExecutionProperties,
    pub(crate) circuit: CircuitProperties,
    pub(crate) window: WindowProperties,
    pub(crate) pool: PoolProperties,
    pub(crate) bad_request: Option<BadRequestClassifier>,
    pub(crate) event_listeners: EventListeners<CommandEvent>,
}

impl CommandConfig {
    /// Creates a new configuration builder for the given command.
    pub fn builder(command_key: impl Into<CommandKey>) -> CommandConfigBuilder {
        CommandConfigBuilder::new(command_key.into())
    }

    /// The command's key.
    pub fn command_key(&self) -> &CommandKey {
        &self.command_key
    }

    /// The command's group.
    pub fn group_key(&self) -> &GroupKey {
        &self.group_key
    }

    /// The pool the command runs in.
    pub fn pool_key(&self) -> &PoolKey {
        &self.pool_key
    }

    /// Execution properties.
    pub fn execution(&self) -> &ExecutionProperties {
        &self.execution
    }

    /// Circuit breaker properties.
    pub fn circuit(&self) -> &CircuitProperties {
        &self.circuit
    }

    /// Rolling window properties of the command.
    pub fn window(&self) -> &WindowProperties {
        &self.window
    }

    /// Properties of the pool, applied if this command creates it.
    pub fn pool(&self) -> &PoolProperties {
        &self.pool
    }

    /// Shorthand for `execution().timeout`.
    pub fn timeout(&self) -> Duration {
        self.execution.timeout
    }

    /// Shorthand for `execution().interrupt_on_timeout`.
    pub fn interrupt_on_timeout(&self) -> bool {
        self.execution.interrupt_on_timeout
    }

    pub(crate) fn is_bad_request<E: Send + 'static>(&self, error: &E) -> bool {
        self.bad_request
            .as_ref()
            .map(|classify| classify(error as &(dyn Any + Send)))
            .unwrap_or(false)
    }
}

impl fmt::Debug for CommandConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandConfig")
            .field("command_key", &self.command_key)
            .field("group_key", &self.group_key)
            .field("pool_key", &self.pool_key)
            .field("execution", &self.execution)
            .field("circuit", &self.circuit)
            .field("window", &self.window)
            .field("pool", &self.pool)
            .field("bad_request", &self.bad_request.is_some())
            .field("event_listeners", &self.event_listeners)
            .finish()
    }
}

/// Builder for [`CommandConfig`].
pub struct CommandConfigBuilder {
    command_key: CommandKey,
    group_key: Option<GroupKey>,
    pool_key: Option<PoolKey>,
    execution: ExecutionProperties,
    circuit: CircuitProperties,
    window: WindowProperties,
    pool: PoolProperties,
    bad_request: Option<BadRequestClassifier>,
    event_listeners: EventListeners<CommandEvent>,
    property_error: Option<ConfigError>,
}

impl CommandConfigBuilder {
    /// Creates a new builder with default values.
    pub fn new(command_key: CommandKey) -> Self {
        Self {
            command_key,
            group_key: None,
            pool_key: None,
            execution: ExecutionProperties::default(),
            circuit: CircuitProperties::default(),
            window: WindowProperties::default(),
            pool: PoolProperties::default(),
            bad_request: None,
            event_listeners: EventListeners::new(),
            property_error: None,
        }
    }

    /// Sets the group the command reports under.
    ///
    /// Default: the command key
    pub fn group_key(mut self, group: impl Into<GroupKey>) -> Self {
        self.group_key = Some(group.into());
        self
    }

    /// Sets the pool the command runs in.
    ///
    /// Default: the group key
    pub fn pool_key(mut self, pool: impl Into<PoolKey>) -> Self {
        self.pool_key = Some(pool.into());
        self
    }

    /// Sets the execution deadline.
    ///
    /// Default: 1000ms
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.execution.timeout = timeout;
        self
    }

    /// Enables or disables the execution deadline.
    ///
    /// Default: true
    pub fn timeout_enabled(mut self, enabled: bool) -> Self {
        self.execution.timeout_enabled = enabled;
        self
    }

    /// Sets whether timed-out work is aborted or left running unobserved.
    ///
    /// Either way the pool slot is released at the deadline.
    ///
    /// Default: true
    pub fn interrupt_on_timeout(mut self, interrupt: bool) -> Self {
        self.execution.interrupt_on_timeout = interrupt;
        self
    }

    /// Sets where the work runs.
    ///
    /// Default: [`IsolationStrategy::Pool`]
    pub fn isolation(mut self, strategy: IsolationStrategy) -> Self {
        self.execution.isolation = strategy;
        self
    }

    /// Enables or disables the fallback path.
    ///
    /// Default: true
    pub fn fallback_enabled(mut self, enabled: bool) -> Self {
        self.execution.fallback_enabled = enabled;
        self
    }

    /// Sets how many fallbacks of this command may run at once.
    ///
    /// Default: 10
    pub fn fallback_max_concurrent(mut self, max: usize) -> Self {
        self.execution.fallback_max_concurrent = max;
        self
    }

    /// Enables or disables the circuit breaker.
    ///
    /// Default: true
    pub fn circuit_enabled(mut self, enabled: bool) -> Self {
        self.circuit.enabled = enabled;
        self
    }

    /// Sets the minimum request volume before the error rate is evaluated.
    ///
    /// Default: 20
    pub fn request_volume_threshold(mut self, volume: u64) -> Self {
        self.circuit.request_volume_threshold = volume;
        self
    }

    /// Sets the error percentage at which the circuit opens.
    ///
    /// Default: 50
    pub fn error_threshold_percentage(mut self, percentage: u32) -> Self {
        self.circuit.error_threshold_percentage = percentage;
        self
    }

    /// Sets how long the circuit stays open before admitting a probe.
    ///
    /// Default: 5000ms
    pub fn sleep_window(mut self, window: Duration) -> Self {
        self.circuit.sleep_window = window;
        self
    }

    /// Forces the circuit open.
    ///
    /// Default: false
    pub fn force_open(mut self, force: bool) -> Self {
        self.circuit.force_open = force;
        self
    }

    /// Forces the circuit closed.
    ///
    /// Default: false
    pub fn force_closed(mut self, force: bool) -> Self {
        self.circuit.force_closed = force;
        self
    }

    /// Sets the span of the command's rolling window.
    ///
    /// Default: 10000ms
    pub fn window_duration(mut self, duration: Duration) -> Self {
        self.window.duration = duration;
        self
    }

    /// Sets the number of buckets in the command's rolling window.
    ///
    /// Must divide the window duration evenly.
    ///
    /// Default: 10
    pub fn num_buckets(mut self, buckets: u32) -> Self {
        self.window.num_buckets = buckets;
        self
    }

    /// Sets the pool's core size.
    ///
    /// Default: 10
    pub fn core_size(mut self, size: usize) -> Self {
        self.pool.core_size = size;
        self
    }

    /// Sets the pool's maximum size. Only effective together with
    /// [`allow_max_diverge_from_core`](Self::allow_max_diverge_from_core).
    ///
    /// Default: 10
    pub fn max_size(mut self, size: usize) -> Self {
        self.pool.max_size = size;
        self
    }

    /// Sets the bound of the pool's wait queue. `None` disables queueing.
    ///
    /// Default: None
    pub fn max_queue_size(mut self, size: Option<usize>) -> Self {
        self.pool.max_queue_size = size;
        self
    }

    /// Sets the queue length at which arrivals are rejected.
    ///
    /// Default: 5
    pub fn queue_rejection_threshold(mut self, threshold: usize) -> Self {
        self.pool.queue_rejection_threshold = threshold;
        self
    }

    /// Sets how long slots above the core size may sit idle.
    ///
    /// Default: 1 minute
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.pool.keep_alive = keep_alive;
        self
    }

    /// Allows the pool to grow from its core size to its max size.
    ///
    /// Default: false
    pub fn allow_max_diverge_from_core(mut self, allow: bool) -> Self {
        self.pool.allow_max_diverge_from_core = allow;
        self
    }

    /// Sets the shape of the pool's rolling window.
    ///
    /// Default: 10000ms, 10 buckets
    pub fn pool_window(mut self, duration: Duration, num_buckets: u32) -> Self {
        self.pool.window = WindowProperties::new(duration, num_buckets);
        self
    }

    /// Replaces all pool properties at once.
    pub fn pool_properties(mut self, properties: PoolProperties) -> Self {
        self.pool = properties;
        self
    }

    /// Applies a named command property, as produced by an annotation or
    /// configuration layer (e.g. `execution.isolation.thread.timeoutInMilliseconds`).
    ///
    /// Unknown names and unparsable values are reported by [`build`](Self::build).
    pub fn command_property(mut self, name: &str, value: &str) -> Self {
        if self.property_error.is_none() {
            let result = crate::properties::apply_command_property(
                &mut self.execution,
                &mut self.circuit,
                &mut self.window,
                name,
                value,
            );
            self.property_error = result.err();
        }
        self
    }

    /// Applies a named pool property (e.g. `coreSize`, `maxQueueSize`).
    ///
    /// Unknown names and unparsable values are reported by [`build`](Self::build).
    pub fn pool_property(mut self, name: &str, value: &str) -> Self {
        if self.property_error.is_none() {
            self.property_error = self.pool.apply_property(name, value).err();
        }
        self
    }

    /// Classifies work errors of type `E` as bad requests.
    ///
    /// A bad request is returned to the caller as-is: it does not count
    /// toward circuit health and does not trigger the fallback. Errors of
    /// other types are never bad requests.
    ///
    /// # Example
    /// ```rust
    /// use tower_command::CommandConfig;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let config = CommandConfig::builder("lookup")
    ///     .classify_bad_request(|e: &Error| e.kind() == ErrorKind::InvalidInput)
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn classify_bad_request<E, F>(mut self, classify: F) -> Self
    where
        E: 'static,
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.bad_request = Some(Arc::new(move |error: &(dyn Any + Send)| {
            error.downcast_ref::<E>().map(&classify).unwrap_or(false)
        }));
        self
    }

    /// Registers a callback invoked with the primary outcome of every execution.
    ///
    /// # Callback Signature
    /// `Fn(ExecutionOutcome, Duration)` - the outcome and the time from
    /// submission until the outcome was decided.
    ///
    /// # Example
    /// ```rust,no_run
    /// use tower_command::{CommandConfig, ExecutionOutcome};
    ///
    /// let config = CommandConfig::builder("lookup")
    ///     .on_execution(|outcome, duration| {
    ///         if outcome != ExecutionOutcome::Success {
    ///             println!("lookup ended with {} after {:?}", outcome, duration);
    ///         }
    ///     })
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn on_execution<F>(mut self, f: F) -> Self
    where
        F: Fn(ExecutionOutcome, Duration) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let CommandEvent::Executed {
                outcome, duration, ..
            } = event
            {
                f(*outcome, *duration);
            }
        }));
        self
    }

    /// Registers a callback for every event reporting `outcome`, primary or
    /// fallback.
    ///
    /// # Example
    /// ```rust,no_run
    /// use tower_command::{CommandConfig, ExecutionOutcome};
    ///
    /// let config = CommandConfig::builder("lookup")
    ///     .on_outcome(ExecutionOutcome::Rejected, |event| {
    ///         println!("pool full: {:?}", event);
    ///     })
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn on_outcome<F>(mut self, outcome: ExecutionOutcome, f: F) -> Self
    where
        F: Fn(&CommandEvent) + Send + Sync + 'static,
    {
        self.event_listeners.on_outcome(outcome, f);
        self
    }

    /// Registers a callback invoked whenever the fallback path is entered.
    ///
    /// # Callback Signature
    /// `Fn(ExecutionOutcome, ExecutionOutcome)` - the triggering primary
    /// outcome and the resulting fallback outcome.
    pub fn on_fallback<F>(mut self, f: F) -> Self
    where
        F: Fn(ExecutionOutcome, ExecutionOutcome) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let CommandEvent::Fallback {
                trigger, outcome, ..
            } = event
            {
                f(*trigger, *outcome);
            }
        }));
        self
    }

    /// Registers a callback invoked when the command's circuit changes state.
    ///
    /// # Callback Signature
    /// `Fn(CircuitState, CircuitState)` - the state transitioned **from** and **to**.
    ///
    /// # Example
    /// ```rust,no_run
    /// use tower_command::{CommandConfig, CircuitState};
    ///
    /// let config = CommandConfig::builder("lookup")
    ///     .on_state_transition(|from, to| {
    ///         if to == CircuitState::Open {
    ///             println!("lookup circuit opened (was {:?})", from);
    ///         }
    ///     })
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn on_state_transition<F>(mut self, f: F) -> Self
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let CommandEvent::StateTransition { from, to, .. } = event {
                f(*from, *to);
            }
        }));
        self
    }

    /// Validates the configuration and builds it.
    pub fn build(self) -> Result<CommandConfig, ConfigError> {
        if let Some(error) = self.property_error {
            return Err(error);
        }

        let group_key = self
            .group_key
            .unwrap_or_else(|| GroupKey::from(&self.command_key));
        let pool_key = self.pool_key.unwrap_or_else(|| PoolKey::from(&group_key));

        if self.command_key.is_empty() {
            return Err(ConfigError::EmptyKey("command key"));
        }
        if group_key.is_empty() {
            return Err(ConfigError::EmptyKey("group key"));
        }
        if pool_key.is_empty() {
            return Err(ConfigError::EmptyKey("pool key"));
        }
        if self.execution.timeout_enabled && self.execution.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.circuit.error_threshold_percentage > 100 {
            return Err(ConfigError::InvalidErrorThreshold(
                self.circuit.error_threshold_percentage,
            ));
        }
        self.window.validate()?;
        self.pool.validate()?;

        Ok(CommandConfig {
            command_key: self.command_key,
            group_key,
            pool_key,
            execution: self.execution,
            circuit: self.circuit,
            window: self.window,
            pool: self.pool,
            bad_request: self.bad_request,
            event_listeners: self.event_listeners,
        })
    }
}
