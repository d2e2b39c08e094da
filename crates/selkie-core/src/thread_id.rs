//! Process-local thread identification
//!
//! Mutating operations on an agent (subscription management, state changes)
//! are only legal on the agent's current working thread. The runtime records
//! and compares thread identities as plain `u64` values handed out from a
//! process-wide counter; `std::thread::ThreadId` has no stable integer form.

use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel for "no thread" (ids start at 1)
pub const THREAD_ID_NONE: u64 = 0;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Get the calling thread's process-local id
pub fn current_thread_id() -> u64 {
    CURRENT_THREAD_ID.with(|id| *id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_within_thread() {
        assert_eq!(current_thread_id(), current_thread_id());
        assert_ne!(current_thread_id(), THREAD_ID_NONE);
    }

    #[test]
    fn test_distinct_across_threads() {
        let here = current_thread_id();
        let there = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(here, there);
    }
}
