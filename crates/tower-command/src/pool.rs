//! Bounded isolation pools.
//!
//! An [`IsolationPool`] hands out [`PoolSlot`]s. A slot is occupied while a
//! command's work runs and is released when the guard drops, on every path:
//! completion, timeout abandonment, panics and caller cancellation.
//!
//! Admission follows the classic executor policy:
//!
//! 1. a free slot is taken immediately;
//! 2. otherwise the caller waits in a FIFO queue if the queue has room;
//! 3. otherwise, if the pool may diverge from its core size, it grows by one
//!    slot up to its maximum;
//! 4. otherwise the caller is rejected without waiting.
//!
//! Slots above the core size are tracked individually: extra slot `i` is
//! needed whenever more than `core_size + i` slots are occupied. An extra
//! slot that has not been needed for `keep_alive` is reclaimed, even while
//! the core slots stay busy. Reclamation and shrinking never disturb occupied
//! slots: a slot that must disappear is retired as it is released.

use crate::config::{ConfigError, PoolProperties};
use crate::window::{RollingWindow, WindowSnapshot};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tower_command_core::{ExecutionOutcome, PoolKey};

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Why a slot could not be acquired.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// No free slot, no queue room and no room to grow.
    #[error("pool '{pool}' rejected the task ({active} active, {queued} queued)")]
    Rejected {
        /// Pool that rejected the task.
        pool: PoolKey,
        /// Occupied slots at the time of rejection.
        active: usize,
        /// Queued waiters at the time of rejection.
        queued: usize,
    },
    /// The caller was queued but no slot freed up in time.
    #[error("timed out waiting for a slot in pool '{pool}'")]
    WaitTimeout {
        /// Pool the caller was queued on.
        pool: PoolKey,
    },
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PoolMetrics {
    /// Occupied slots.
    pub active: usize,
    /// Callers waiting for a slot.
    pub queued: usize,
    /// Slots the pool currently holds.
    pub pool_size: usize,
    /// Largest number of simultaneously occupied slots ever observed.
    pub largest_pool_size: usize,
    /// Slots that were occupied and released.
    pub completed: u64,
    /// Callers rejected since the pool was created.
    pub rejected: u64,
    /// Outcomes recorded in the pool's rolling window.
    pub window: WindowSnapshot,
}

/// A shared, bounded set of execution slots.
pub struct IsolationPool {
    key: PoolKey,
    semaphore: Arc<Semaphore>,
    properties: RwLock<PoolProperties>,
    size: AtomicUsize,
    debt: AtomicUsize,
    active: AtomicUsize,
    queued: AtomicUsize,
    largest: AtomicUsize,
    completed: AtomicU64,
    rejected: AtomicU64,
    origin: Instant,
    // Last time (ms since `origin`) each slot above the core size was needed.
    // Never increasing along the vector.
    extra_busy_ms: Mutex<Vec<u64>>,
    window: RollingWindow,
}

impl IsolationPool {
    /// Creates a pool with `core_size` free slots.
    ///
    /// `properties` must have been validated.
    pub fn new(key: PoolKey, properties: PoolProperties) -> Self {
        let core_size = properties.core_size;
        Self {
            key,
            semaphore: Arc::new(Semaphore::new(core_size)),
            window: RollingWindow::new(properties.window),
            properties: RwLock::new(properties),
            size: AtomicUsize::new(core_size),
            debt: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            largest: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            origin: Instant::now(),
            extra_busy_ms: Mutex::new(Vec::new()),
        }
    }

    /// The pool's key.
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// A copy of the current properties.
    pub fn properties(&self) -> PoolProperties {
        self.properties.read().clone()
    }

    /// Acquires a slot, waiting in the queue for at most `wait` when the pool
    /// is full. `None` waits without a bound.
    pub async fn acquire(self: &Arc<Self>, wait: Option<Duration>) -> Result<PoolSlot, PoolError> {
        self.reclaim_idle();

        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Ok(self.occupy(permit));
        }

        let (queue_limit, max_size) = {
            let properties = self.properties.read();
            (properties.queue_limit(), properties.effective_max_size())
        };

        if let Some(ticket) = self.enter_queue(queue_limit) {
            let acquire = Arc::clone(&self.semaphore).acquire_owned();
            let permit = match wait {
                Some(wait) => match tokio::time::timeout(wait, acquire).await {
                    Ok(permit) => permit,
                    Err(_) => {
                        drop(ticket);
                        #[cfg(feature = "tracing")]
                        tracing::warn!(pool = %self.key, ?wait, "timed out waiting for pool slot");
                        return Err(PoolError::WaitTimeout {
                            pool: self.key.clone(),
                        });
                    }
                },
                None => acquire.await,
            };
            drop(ticket);
            return match permit {
                Ok(permit) => Ok(self.occupy(permit)),
                Err(_) => Err(self.reject()),
            };
        }

        while self.try_grow(max_size) {
            if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
                #[cfg(feature = "tracing")]
                tracing::debug!(pool = %self.key, size = self.size.load(Ordering::Relaxed), "pool grew");
                return Ok(self.occupy(permit));
            }
        }

        Err(self.reject())
    }

    fn enter_queue(&self, limit: usize) -> Option<QueueTicket<'_>> {
        let mut queued = self.queued.load(Ordering::Acquire);
        loop {
            if queued >= limit {
                return None;
            }
            match self.queued.compare_exchange_weak(
                queued,
                queued + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    #[cfg(feature = "metrics")]
                    gauge!("command_pool_queue_size", "pool" => self.key.to_string())
                        .set((queued + 1) as f64);
                    return Some(QueueTicket { pool: self });
                }
                Err(actual) => queued = actual,
            }
        }
    }

    fn try_grow(&self, max_size: usize) -> bool {
        let mut size = self.size.load(Ordering::Acquire);
        loop {
            if size + self.debt.load(Ordering::Acquire) >= max_size {
                return false;
            }
            match self.size.compare_exchange_weak(
                size,
                size + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.semaphore.add_permits(1);
                    return true;
                }
                Err(actual) => size = actual,
            }
        }
    }

    fn occupy(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> PoolSlot {
        let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.largest.fetch_max(active, Ordering::AcqRel);
        self.mark_busy(active);

        #[cfg(feature = "metrics")]
        gauge!("command_pool_active", "pool" => self.key.to_string()).set(active as f64);

        PoolSlot {
            pool: Arc::clone(self),
            permit: Some(permit),
        }
    }

    fn reject(&self) -> PoolError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        self.window.record(ExecutionOutcome::Rejected);

        let active = self.active.load(Ordering::Acquire);
        let queued = self.queued.load(Ordering::Acquire);

        #[cfg(feature = "tracing")]
        tracing::warn!(pool = %self.key, active, queued, "pool rejected task");

        #[cfg(feature = "metrics")]
        counter!("command_pool_rejections_total", "pool" => self.key.to_string()).increment(1);

        PoolError::Rejected {
            pool: self.key.clone(),
            active,
            queued,
        }
    }

    fn release(&self, mut permit: Option<OwnedSemaphorePermit>) {
        let active = self.active.fetch_sub(1, Ordering::AcqRel) - 1;
        self.completed.fetch_add(1, Ordering::Relaxed);
        // The slot being released was needed until now.
        self.mark_busy(active + 1);

        if self
            .debt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |debt| debt.checked_sub(1))
            .is_ok()
        {
            if let Some(permit) = permit.take() {
                permit.forget();
            }
        }
        drop(permit);

        #[cfg(feature = "metrics")]
        gauge!("command_pool_active", "pool" => self.key.to_string()).set(active as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = active;
    }

    /// Records the outcome of a task that ran (or tried to run) in this pool.
    pub fn record(&self, outcome: ExecutionOutcome) {
        self.window.record(outcome);
    }

    fn now_ms(&self) -> u64 {
        Instant::now()
            .saturating_duration_since(self.origin)
            .as_millis() as u64
    }

    // `occupied` slots are in use right now.
    fn mark_busy(&self, occupied: usize) {
        let core_size = self.properties.read().core_size;
        let Some(extra) = occupied.checked_sub(core_size).filter(|e| *e > 0) else {
            return;
        };
        let now = self.now_ms();
        let mut busy = self.extra_busy_ms.lock();
        if busy.len() < extra {
            busy.resize(extra, now);
        }
        busy[..extra].fill(now);
    }

    /// Retires slots above the core size that have not been needed for
    /// `keep_alive`. Returns the number of slots retired.
    ///
    /// Called on every acquisition; may also be called periodically.
    pub fn reclaim_idle(&self) -> usize {
        let properties = self.properties.read();
        let size = self.size.load(Ordering::Acquire);
        if !properties.allow_max_diverge_from_core || size <= properties.core_size {
            return 0;
        }

        let now = self.now_ms();
        let keep_alive = properties.keep_alive.as_millis() as u64;
        let mut busy = self.extra_busy_ms.lock();
        let needed = busy
            .iter()
            .take(size - properties.core_size)
            .take_while(|last| now.saturating_sub(**last) < keep_alive)
            .count();
        let target = properties.core_size + needed;
        if target >= size {
            return 0;
        }
        busy.truncate(needed);
        let retired = self.resize(target);

        #[cfg(feature = "tracing")]
        tracing::debug!(pool = %self.key, retired, "reclaimed idle pool slots");

        retired
    }

    /// Applies new sizing at runtime.
    ///
    /// Occupied slots are not disturbed: when the pool shrinks below its
    /// occupancy, slots are retired as they are released. The rolling window
    /// keeps the shape it was created with.
    pub fn reconfigure(&self, properties: PoolProperties) -> Result<(), ConfigError> {
        properties.validate()?;
        let mut current = self.properties.write();
        let size = self.size.load(Ordering::Acquire);
        let target = size.clamp(properties.core_size, properties.effective_max_size());
        self.resize(target);
        {
            let now = self.now_ms();
            let mut busy = self.extra_busy_ms.lock();
            busy.clear();
            busy.resize(target - properties.core_size, now);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            pool = %self.key,
            core_size = properties.core_size,
            max_size = properties.effective_max_size(),
            queue_limit = properties.queue_limit(),
            "pool reconfigured"
        );

        let window = current.window;
        *current = PoolProperties {
            window,
            ..properties
        };
        Ok(())
    }

    // Returns the number of slots removed.
    fn resize(&self, target: usize) -> usize {
        let current = self.size.swap(target, Ordering::AcqRel);
        if target > current {
            let mut added = target - current;
            let cancelled = self
                .debt
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |debt| {
                    Some(debt.saturating_sub(added))
                })
                .unwrap_or(0)
                .min(added);
            added -= cancelled;
            if added > 0 {
                self.semaphore.add_permits(added);
            }
            0
        } else {
            let excess = current - target;
            let forgotten = self.semaphore.forget_permits(excess);
            if excess > forgotten {
                self.debt.fetch_add(excess - forgotten, Ordering::AcqRel);
            }
            excess
        }
    }

    /// Snapshot of the pool's counters.
    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            active: self.active.load(Ordering::Acquire),
            queued: self.queued.load(Ordering::Acquire),
            pool_size: self.size.load(Ordering::Acquire),
            largest_pool_size: self.largest.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            window: self.window.snapshot(),
        }
    }
}

impl fmt::Debug for IsolationPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationPool")
            .field("key", &self.key)
            .field("properties", &*self.properties.read())
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("queued", &self.queued.load(Ordering::Relaxed))
            .finish()
    }
}

struct QueueTicket<'a> {
    pool: &'a IsolationPool,
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        let queued = self.pool.queued.fetch_sub(1, Ordering::AcqRel) - 1;
        #[cfg(feature = "metrics")]
        gauge!("command_pool_queue_size", "pool" => self.pool.key.to_string()).set(queued as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = queued;
    }
}

/// An occupied slot. Dropping it releases the slot to the oldest waiter.
pub struct PoolSlot {
    pool: Arc<IsolationPool>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PoolSlot {
    /// The pool this slot belongs to.
    pub fn pool(&self) -> &Arc<IsolationPool> {
        &self.pool
    }
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.pool.release(self.permit.take());
    }
}

impl fmt::Debug for PoolSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolSlot")
            .field("pool", &self.pool.key)
            .finish()
    }
}
