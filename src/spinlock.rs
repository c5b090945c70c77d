//! A single test-and-set spin lock.
//!
//! This is the *only* lock used anywhere in this crate. It guards O(1)
//! work (thread-registry insertion/removal) during thread init and thread
//! exit. It is deliberately not a blocking mutex: a blocking mutex
//! implementation may itself allocate on contention, which would deadlock
//! a hook that is already inside the allocator.

use std::sync::atomic::{AtomicBool, Ordering};

pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
        }
    }

    pub fn lock<R>(&self, critical_section: impl FnOnce() -> R) -> R {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        let result = critical_section();
        self.locked.store(false, Ordering::Release);
        result
    }
}
