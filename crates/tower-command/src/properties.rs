//! Binding of string-named properties onto typed configuration.
//!
//! Configuration layers that work with names and strings (annotations,
//! property files, environment overrides) produce pairs such as
//! `("execution.isolation.thread.timeoutInMilliseconds", "110")`. This module
//! maps those pairs onto [`ExecutionProperties`], [`CircuitProperties`],
//! [`WindowProperties`] and [`PoolProperties`].
//!
//! # Command properties
//!
//! | name | field |
//! |---|---|
//! | `execution.isolation.strategy` | `isolation` (`THREAD` / `SEMAPHORE`) |
//! | `execution.isolation.thread.timeoutInMilliseconds` | `timeout` |
//! | `execution.timeout.enabled` | `timeout_enabled` |
//! | `execution.isolation.thread.interruptOnTimeout` | `interrupt_on_timeout` |
//! | `fallback.enabled` | `fallback_enabled` |
//! | `fallback.isolation.semaphore.maxConcurrentRequests` | `fallback_max_concurrent` |
//! | `circuitBreaker.enabled` | `enabled` |
//! | `circuitBreaker.requestVolumeThreshold` | `request_volume_threshold` |
//! | `circuitBreaker.errorThresholdPercentage` | `error_threshold_percentage` |
//! | `circuitBreaker.sleepWindowInMilliseconds` | `sleep_window` |
//! | `circuitBreaker.forceOpen` | `force_open` |
//! | `circuitBreaker.forceClosed` | `force_closed` |
//! | `metrics.rollingStats.timeInMilliseconds` | window `duration` |
//! | `metrics.rollingStats.numBuckets` | window `num_buckets` |
//!
//! # Pool properties
//!
//! | name | field |
//! |---|---|
//! | `coreSize` | `core_size` |
//! | `maximumSize` | `max_size` |
//! | `maxQueueSize` | `max_queue_size` (`-1` disables the queue) |
//! | `queueSizeRejectionThreshold` | `queue_rejection_threshold` |
//! | `keepAliveTimeMinutes` | `keep_alive` |
//! | `allowMaximumSizeToDivergeFromCoreSize` | `allow_max_diverge_from_core` |
//! | `metrics.rollingStats.timeInMilliseconds` | window `duration` |
//! | `metrics.rollingStats.numBuckets` | window `num_buckets` |

use crate::config::{
    CircuitProperties, ConfigError, ExecutionProperties, IsolationStrategy, PoolProperties,
    WindowProperties,
};
use std::str::FromStr;
use std::time::Duration;

pub(crate) fn apply_command_property(
    execution: &mut ExecutionProperties,
    circuit: &mut CircuitProperties,
    window: &mut WindowProperties,
    name: &str,
    value: &str,
) -> Result<(), ConfigError> {
    match name {
        "execution.isolation.strategy" => {
            execution.isolation = parse_isolation(name, value)?;
        }
        "execution.isolation.thread.timeoutInMilliseconds" => {
            execution.timeout = Duration::from_millis(parse(name, value)?);
        }
        "execution.timeout.enabled" => execution.timeout_enabled = parse_bool(name, value)?,
        "execution.isolation.thread.interruptOnTimeout" => {
            execution.interrupt_on_timeout = parse_bool(name, value)?;
        }
        "fallback.enabled" => execution.fallback_enabled = parse_bool(name, value)?,
        "fallback.isolation.semaphore.maxConcurrentRequests" => {
            execution.fallback_max_concurrent = parse(name, value)?;
        }
        "circuitBreaker.enabled" => circuit.enabled = parse_bool(name, value)?,
        "circuitBreaker.requestVolumeThreshold" => {
            circuit.request_volume_threshold = parse(name, value)?;
        }
        "circuitBreaker.errorThresholdPercentage" => {
            circuit.error_threshold_percentage = parse(name, value)?;
        }
        "circuitBreaker.sleepWindowInMilliseconds" => {
            circuit.sleep_window = Duration::from_millis(parse(name, value)?);
        }
        "circuitBreaker.forceOpen" => circuit.force_open = parse_bool(name, value)?,
        "circuitBreaker.forceClosed" => circuit.force_closed = parse_bool(name, value)?,
        _ => return apply_window_property(window, name, value),
    }
    Ok(())
}

fn apply_window_property(
    window: &mut WindowProperties,
    name: &str,
    value: &str,
) -> Result<(), ConfigError> {
    match name {
        "metrics.rollingStats.timeInMilliseconds" => {
            window.duration = Duration::from_millis(parse(name, value)?);
        }
        "metrics.rollingStats.numBuckets" => window.num_buckets = parse(name, value)?,
        _ => return Err(ConfigError::UnknownProperty(name.to_string())),
    }
    Ok(())
}

impl PoolProperties {
    /// Applies a named pool property.
    ///
    /// The result is not validated; call [`PoolProperties::validate`] once
    /// all properties are applied.
    ///
    /// # Example
    /// ```rust
    /// use tower_command::PoolProperties;
    ///
    /// let mut pool = PoolProperties::default();
    /// pool.apply_property("coreSize", "30").unwrap();
    /// pool.apply_property("maxQueueSize", "-1").unwrap();
    /// assert_eq!(pool.core_size, 30);
    /// assert_eq!(pool.max_queue_size, None);
    /// ```
    pub fn apply_property(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        match name {
            "coreSize" => self.core_size = parse(name, value)?,
            "maximumSize" => self.max_size = parse(name, value)?,
            "maxQueueSize" => {
                let size: i64 = parse(name, value)?;
                self.max_queue_size = if size < 0 {
                    None
                } else {
                    Some(usize::try_from(size).map_err(|_| invalid(name, value))?)
                };
            }
            "queueSizeRejectionThreshold" => self.queue_rejection_threshold = parse(name, value)?,
            "keepAliveTimeMinutes" => {
                let minutes: u64 = parse(name, value)?;
                self.keep_alive = Duration::from_secs(minutes.saturating_mul(60));
            }
            "allowMaximumSizeToDivergeFromCoreSize" => {
                self.allow_max_diverge_from_core = parse_bool(name, value)?;
            }
            _ => return apply_window_property(&mut self.window, name, value),
        }
        Ok(())
    }
}

fn invalid(name: &str, value: &str) -> ConfigError {
    ConfigError::InvalidPropertyValue {
        name: name.to_string(),
        value: value.to_string(),
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(name, value))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if trimmed.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(invalid(name, value))
    }
}

fn parse_isolation(name: &str, value: &str) -> Result<IsolationStrategy, ConfigError> {
    match value.trim().to_ascii_uppercase().as_str() {
        "THREAD" | "POOL" => Ok(IsolationStrategy::Pool),
        "SEMAPHORE" | "INLINE" => Ok(IsolationStrategy::Inline),
        _ => Err(invalid(name, value)),
    }
}
