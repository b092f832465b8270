//! A cooperative mutex for coroutines.
//!
//! Not present in `original_source/`'s coroutine core itself — SPEC_FULL.md
//! adds it as the one synchronization primitive a coroutine runtime needs to
//! be useful beyond toy examples, modeled on the same project's
//! `qemu-co-queue`/`qemu-co-mutex` pair referenced from the wakeup-queue
//! comments in the coroutine core. Locking never blocks the OS thread: a
//! coroutine that can't acquire the lock parks itself on a FIFO wait queue
//! and `yield_now()`s, to be woken (and re-entered by whoever next drains
//! the scheduler) when the holder unlocks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::error;

use super::{adjust_locks_held, current, wake, yield_now, Coroutine};

/// A lock held across `yield_now()` points, tracked against the holding
/// coroutine's own lock count so the scheduler can catch "terminated while
/// still holding a lock" (SPEC_FULL.md §6, mirrored from the source's
/// `qemu_coroutine_enter`/`assert(co->locks_held == 0)`).
pub struct CoMutex {
    locked: AtomicBool,
    waiters: Mutex<VecDeque<Coroutine>>,
}

impl CoMutex {
    pub const fn new() -> CoMutex {
        CoMutex {
            locked: AtomicBool::new(false),
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Acquire the lock, yielding (possibly repeatedly) until it is free.
    ///
    /// # Panics
    /// Aborts the process if called with no coroutine currently running:
    /// there is no caller to park on the wait queue or charge the lock to.
    pub fn lock(&self) {
        let me = current().unwrap_or_else(|| {
            error!("CoMutex::lock() called with no coroutine running");
            std::process::abort();
        });
        loop {
            if self
                .locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                adjust_locks_held(1);
                return;
            }
            self.waiters.lock().unwrap().push_back(me);
            yield_now();
        }
    }

    /// Acquire the lock only if it is immediately free.
    pub fn try_lock(&self) -> bool {
        let got = self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        if got {
            adjust_locks_held(1);
        }
        got
    }

    /// Release the lock, waking the longest-waiting coroutine, if any.
    pub fn unlock(&self) {
        adjust_locks_held(-1);
        self.locked.store(false, Ordering::Release);
        if let Some(next) = self.waiters.lock().unwrap().pop_front() {
            wake(next);
        }
    }
}

impl Default for CoMutex {
    fn default() -> CoMutex {
        CoMutex::new()
    }
}
