//! One-shot reply slots for service requests
//!
//! A service request carries a `ReplySender` into the receiving agent's
//! event queue; the producer keeps the matching `ReplyFuture`. The slot is
//! resolved exactly once: with the handler's result, with a routing error
//! (`NoHandler`, `TooManyHandlers`), or - if the sender is dropped without
//! a reply because the demand never executed - with `AgentShutDown`.
//!
//! The implementation is a plain Mutex + Condvar pair; the runtime has no
//! async surface and callers block (optionally with a timeout).

use crate::error::{Error, Result};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

struct ReplyShared<R> {
    slot: Mutex<Option<Result<R>>>,
    ready: Condvar,
}

/// Create a connected sender/future pair
pub fn reply_channel<R>() -> (ReplySender<R>, ReplyFuture<R>) {
    let shared = Arc::new(ReplyShared {
        slot: Mutex::new(None),
        ready: Condvar::new(),
    });
    (
        ReplySender {
            shared: shared.clone(),
        },
        ReplyFuture { shared },
    )
}

/// Producer-side handle: blocks until the reply arrives
pub struct ReplyFuture<R> {
    shared: Arc<ReplyShared<R>>,
}

impl<R> ReplyFuture<R> {
    /// Block until the reply is available
    pub fn recv(self) -> Result<R> {
        let mut slot = self
            .shared
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            slot = self
                .shared
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the reply is available or the timeout elapses
    pub fn recv_timeout(self, timeout: Duration) -> Result<R> {
        let deadline = Instant::now() + timeout;
        let mut slot = self
            .shared
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::RequestTimeout);
            }
            let (guard, _) = self
                .shared
                .ready
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
    }

    /// Non-blocking probe
    pub fn try_recv(&self) -> Option<Result<R>> {
        self.shared
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Consumer-side handle, resolved at most once
pub struct ReplySender<R> {
    shared: Arc<ReplyShared<R>>,
}

impl<R> ReplySender<R> {
    /// Resolve the slot. A second resolution is a no-op.
    pub fn resolve(self, value: Result<R>) {
        self.set(value);
    }

    fn set(&self, value: Result<R>) {
        let mut slot = self
            .shared
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(value);
            self.shared.ready.notify_all();
        }
    }
}

impl<R> Drop for ReplySender<R> {
    fn drop(&mut self) {
        // A sender dropped without a reply means the demand was discarded
        // before execution (agent shut down mid-queue).
        self.set(Err(Error::AgentShutDown));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_then_recv() {
        let (tx, rx) = reply_channel::<u32>();
        tx.resolve(Ok(42));
        assert_eq!(rx.recv().unwrap(), 42);
    }

    #[test]
    fn test_recv_blocks_until_resolved() {
        let (tx, rx) = reply_channel::<String>();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            tx.resolve(Ok("done".to_string()));
        });
        assert_eq!(rx.recv().unwrap(), "done");
        worker.join().unwrap();
    }

    #[test]
    fn test_dropped_sender_resolves_shut_down() {
        let (tx, rx) = reply_channel::<u32>();
        drop(tx);
        assert!(matches!(rx.recv(), Err(Error::AgentShutDown)));
    }

    #[test]
    fn test_recv_timeout_expires() {
        let (tx, rx) = reply_channel::<u32>();
        let result = rx.recv_timeout(Duration::from_millis(10));
        assert!(matches!(result, Err(Error::RequestTimeout)));
        drop(tx);
    }

    #[test]
    fn test_second_resolution_is_noop() {
        let (tx, rx) = reply_channel::<u32>();
        tx.set(Ok(1));
        tx.resolve(Ok(2));
        assert_eq!(rx.recv().unwrap(), 1);
    }
}
