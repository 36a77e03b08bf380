//! Bucketed rolling counters for execution outcomes.
//!
//! The window is a ring of `num_buckets` buckets, each covering
//! `duration / num_buckets`. A bucket is tagged with the epoch (absolute
//! bucket index + 1) it currently counts for. A writer that finds a stale
//! epoch claims the bucket, zeroes it and then counts; buckets skipped while
//! the command was idle simply keep their stale epoch and are ignored by
//! readers, so gaps read as empty buckets.
//!
//! Readers never lock. A bucket whose epoch changes while it is being summed
//! is skipped rather than read half-reset.

use crate::config::WindowProperties;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;
use tower_command_core::ExecutionOutcome;

const EMPTY: u64 = 0;
const RESETTING: u64 = u64::MAX;

struct Bucket {
    epoch: AtomicU64,
    counts: [AtomicU64; ExecutionOutcome::COUNT],
}

impl Bucket {
    fn new() -> Self {
        Self {
            epoch: AtomicU64::new(EMPTY),
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn clear(&self) {
        for count in &self.counts {
            count.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time outcome counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct WindowSnapshot {
    counts: [u64; ExecutionOutcome::COUNT],
}

impl WindowSnapshot {
    /// Count of a single outcome.
    pub fn get(&self, outcome: ExecutionOutcome) -> u64 {
        self.counts[outcome.index()]
    }

    /// Requests that take part in health: successes plus errors.
    pub fn total_requests(&self) -> u64 {
        ExecutionOutcome::ALL
            .iter()
            .filter(|o| o.counts_toward_health())
            .map(|o| self.get(*o))
            .sum()
    }

    /// Failures, timeouts and pool rejections.
    pub fn error_count(&self) -> u64 {
        ExecutionOutcome::ALL
            .iter()
            .filter(|o| o.is_error())
            .map(|o| self.get(*o))
            .sum()
    }

    /// Integer error percentage, 0 when no requests were counted.
    pub fn error_percentage(&self) -> u32 {
        let total = self.total_requests();
        if total == 0 {
            return 0;
        }
        (self.error_count() * 100 / total) as u32
    }

    /// Iterates over non-zero counts in outcome order.
    pub fn iter(&self) -> impl Iterator<Item = (ExecutionOutcome, u64)> + '_ {
        ExecutionOutcome::ALL
            .iter()
            .map(|o| (*o, self.get(*o)))
            .filter(|(_, n)| *n > 0)
    }
}

/// Fixed-duration rolling counter store.
pub struct RollingWindow {
    properties: WindowProperties,
    bucket_millis: u64,
    origin: Instant,
    buckets: Box<[Bucket]>,
    cumulative: [AtomicU64; ExecutionOutcome::COUNT],
    // Seqlock around `reset`: odd while a reset is in progress.
    generation: AtomicU64,
}

impl RollingWindow {
    /// Creates an empty window.
    ///
    /// `properties` must have been validated; a bucket shorter than one
    /// millisecond is treated as one millisecond.
    pub fn new(properties: WindowProperties) -> Self {
        let num_buckets = properties.num_buckets.max(1) as usize;
        let bucket_millis = (properties.bucket_duration().as_millis() as u64).max(1);
        Self {
            properties,
            bucket_millis,
            origin: Instant::now(),
            buckets: (0..num_buckets).map(|_| Bucket::new()).collect(),
            cumulative: std::array::from_fn(|_| AtomicU64::new(0)),
            generation: AtomicU64::new(0),
        }
    }

    /// The window's shape.
    pub fn properties(&self) -> &WindowProperties {
        &self.properties
    }

    fn current_index(&self) -> u64 {
        let elapsed = Instant::now().saturating_duration_since(self.origin);
        elapsed.as_millis() as u64 / self.bucket_millis
    }

    /// Counts one outcome in the current bucket and in the cumulative totals.
    pub fn record(&self, outcome: ExecutionOutcome) {
        self.cumulative[outcome.index()].fetch_add(1, Ordering::Relaxed);

        let index = self.current_index();
        let epoch = index + 1;
        let bucket = &self.buckets[(index % self.buckets.len() as u64) as usize];

        loop {
            let seen = bucket.epoch.load(Ordering::Acquire);
            if seen == epoch {
                bucket.counts[outcome.index()].fetch_add(1, Ordering::Relaxed);
                return;
            }
            if seen == RESETTING {
                std::hint::spin_loop();
                continue;
            }
            if seen > epoch {
                // The ring already moved past this record's bucket.
                return;
            }
            if bucket
                .epoch
                .compare_exchange(seen, RESETTING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                bucket.clear();
                bucket.epoch.store(epoch, Ordering::Release);
            }
        }
    }

    /// Aggregate counts across the buckets still inside the window.
    pub fn snapshot(&self) -> WindowSnapshot {
        loop {
            let before = self.generation.load(Ordering::Acquire);
            if before % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let snapshot = self.sum_live_buckets();
            if self.generation.load(Ordering::Acquire) == before {
                return snapshot;
            }
        }
    }

    fn sum_live_buckets(&self) -> WindowSnapshot {
        let now = self.current_index();
        let oldest = now.saturating_sub(self.buckets.len() as u64 - 1);
        let mut snapshot = WindowSnapshot::default();

        for bucket in self.buckets.iter() {
            let epoch = bucket.epoch.load(Ordering::Acquire);
            if epoch == EMPTY || epoch == RESETTING {
                continue;
            }
            let index = epoch - 1;
            if index < oldest || index > now {
                continue;
            }

            let mut counts = [0u64; ExecutionOutcome::COUNT];
            for (slot, count) in counts.iter_mut().zip(bucket.counts.iter()) {
                *slot = count.load(Ordering::Relaxed);
            }

            if bucket.epoch.load(Ordering::Acquire) != epoch {
                continue;
            }
            for (total, n) in snapshot.counts.iter_mut().zip(counts) {
                *total += n;
            }
        }

        snapshot
    }

    /// Totals since the window was created. Never evicted and not affected
    /// by [`reset`](Self::reset).
    pub fn cumulative(&self) -> WindowSnapshot {
        let mut snapshot = WindowSnapshot::default();
        for (slot, count) in snapshot.counts.iter_mut().zip(self.cumulative.iter()) {
            *slot = count.load(Ordering::Relaxed);
        }
        snapshot
    }

    /// Shorthand for `snapshot().error_percentage()`.
    pub fn error_percentage(&self) -> u32 {
        self.snapshot().error_percentage()
    }

    /// Discards every rolling count.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        for bucket in self.buckets.iter() {
            loop {
                let seen = bucket.epoch.load(Ordering::Acquire);
                if seen == EMPTY {
                    break;
                }
                if seen == RESETTING {
                    std::hint::spin_loop();
                    continue;
                }
                if bucket
                    .epoch
                    .compare_exchange(seen, RESETTING, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    bucket.clear();
                    bucket.epoch.store(EMPTY, Ordering::Release);
                    break;
                }
            }
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for RollingWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollingWindow")
            .field("properties", &self.properties)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
