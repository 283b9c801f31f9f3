//! Process-wide accounting of captured bytes held in memory.
//!
//! Spawning is admitted only while the total stays under the budget; the
//! foreground drain releases memory and wakes every waiter. The budget is
//! an explicit value threaded through the scheduler and runners, so tests
//! can instantiate an isolated one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// How often a waiter rechecks its cancel condition.
const WAIT_RECHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Shared cap on bytes of captured output buffered across all children.
pub struct MemoryBudget {
    limit: u64,
    /// Bytes currently stored across all output buffers. Lives under the
    /// mutex so waiters can sleep on the condvar against it.
    currently_stored: Mutex<u64>,
    /// Signalled whenever a foreground drain returns memory.
    child_died_freeing_memory: Condvar,
    /// Id of the output buffer now in pass-through (0: none yet). Kept
    /// outside the mutex so wait cancel conditions may read it.
    currently_in_the_foreground: AtomicU64,
}

impl MemoryBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit: limit.max(1),
            currently_stored: Mutex::new(0),
            child_died_freeing_memory: Condvar::new(),
            currently_in_the_foreground: AtomicU64::new(0),
        }
    }

    /// A quarter of total system memory, falling back to 256 MiB when the
    /// kernel will not say.
    pub fn default_limit() -> u64 {
        // SAFETY: sysinfo only fills the struct we hand it.
        let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
        if unsafe { libc::sysinfo(&mut info) } == 0 {
            let total = (info.totalram as u64).saturating_mul(info.mem_unit as u64);
            (total / 4).max(1 << 20)
        } else {
            256 << 20
        }
    }

    pub fn stored(&self) -> u64 {
        *self.lock_stored()
    }

    /// Account freshly buffered bytes.
    pub fn add(&self, bytes: u64) {
        if bytes > 0 {
            *self.lock_stored() += bytes;
        }
    }

    /// Return drained bytes and mark `foreground_id` as the buffer now in
    /// pass-through; wakes everything blocked on the budget.
    pub fn release(&self, bytes: u64, foreground_id: u64) {
        {
            let mut stored = self.lock_stored();
            *stored = stored.saturating_sub(bytes);
        }
        self.currently_in_the_foreground
            .store(foreground_id, Ordering::Release);
        self.child_died_freeing_memory.notify_all();
    }

    pub fn is_foreground(&self, id: u64) -> bool {
        self.currently_in_the_foreground.load(Ordering::Acquire) == id
    }

    /// Block while the budget is exhausted. `cancel` is polled so waiters
    /// bail out on shutdown or once their own buffer has been promoted;
    /// it must not call back into the budget's locked accessors.
    pub fn wait_for_capacity<F: Fn() -> bool>(&self, cancel: F) {
        let mut stored = self.lock_stored();
        while *stored >= self.limit && !cancel() {
            let (guard, _timeout) = self
                .child_died_freeing_memory
                .wait_timeout(stored, WAIT_RECHECK_INTERVAL)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            stored = guard;
        }
    }

    fn lock_stored(&self) -> MutexGuard<'_, u64> {
        match self.currently_stored.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
