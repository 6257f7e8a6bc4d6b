//! Monotonic clock and thread identity shared by every producer.
//!
//! All timestamps in a capture come from `CLOCK_MONOTONIC` so that events
//! from different producers can be merged by time.

#![allow(unsafe_code)] // clock_gettime() and gettid() require unsafe

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Current `CLOCK_MONOTONIC` time in nanoseconds.
#[must_use]
pub fn monotonic_timestamp_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: `ts` is a valid, writable timespec and CLOCK_MONOTONIC is always supported.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    u64::try_from(ts.tv_sec).unwrap_or(0) * 1_000_000_000 + u64::try_from(ts.tv_nsec).unwrap_or(0)
}

/// Kernel thread id of the calling thread.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn current_tid() -> i32 {
    // SAFETY: gettid takes no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn current_pid() -> i32 {
    std::process::id() as i32
}

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
