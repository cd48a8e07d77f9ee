//! Retirement timeline shared between the execution thread and its clients.
//!
//! Command buffers carry increasing sequence numbers starting at 1. The
//! execution thread publishes the highest sequence whose GPU work has fully
//! retired; clients read it lock-free and block on it for `flush_and_wait`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Outcome of waiting on a sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    ConditionSatisfied,
    TimeoutExpired,
    /// The device was lost; the awaited work will never produce results.
    Error,
}

#[derive(Default)]
pub struct Timeline {
    retired: AtomicU64,
    device_lost: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest fully retired sequence number.
    pub fn retired(&self) -> u64 {
        self.retired.load(Ordering::Acquire)
    }

    /// Publishes a new retirement frontier. Frontiers never move backwards.
    pub fn advance(&self, frontier: u64) {
        let _guard = self.lock.lock();
        let previous = self.retired.fetch_max(frontier, Ordering::AcqRel);
        if frontier > previous {
            tracing::trace!(frontier, "retired");
        }
        self.cond.notify_all();
    }

    pub fn mark_device_lost(&self) {
        let _guard = self.lock.lock();
        self.device_lost.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    pub fn is_device_lost(&self) -> bool {
        self.device_lost.load(Ordering::Acquire)
    }

    /// Blocks until `seq` retired, the timeout elapsed or the device was lost.
    /// `None` waits forever.
    pub fn wait(&self, seq: u64, timeout: Option<Duration>) -> FenceStatus {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.lock.lock();
        loop {
            if self.is_device_lost() {
                return FenceStatus::Error;
            }
            if self.retired() >= seq {
                return FenceStatus::ConditionSatisfied;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut guard, deadline).timed_out() {
                        if self.is_device_lost() {
                            return FenceStatus::Error;
                        }
                        return if self.retired() >= seq {
                            FenceStatus::ConditionSatisfied
                        } else {
                            FenceStatus::TimeoutExpired
                        };
                    }
                }
                None => self.cond.wait(&mut guard),
            }
        }
    }
}
