//! Message limits
//!
//! An agent may cap the number of in-flight demands per message type. The
//! counter increments when a mailbox enqueues a demand and decrements when
//! the demand is dequeued for execution. When a delivery would exceed the
//! ceiling, the configured reaction is applied instead of the push.
//!
//! Limits are fixed at agent construction; mutating them while producers
//! are delivering would race, so there is deliberately no runtime API for
//! changing them.

use crate::mailbox::Mbox;
use selkie_core::{Message, MessageRef, MsgType, Signal};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Result of a transform reaction: where the replacement message goes
pub struct TransformedMessage {
    pub(crate) mbox: Mbox,
    pub(crate) msg_type: MsgType,
    pub(crate) payload: Option<MessageRef>,
}

type RedirectFn = dyn Fn() -> Mbox + Send + Sync;
type TransformFn = dyn Fn(&Option<MessageRef>) -> Option<TransformedMessage> + Send + Sync;

/// What happens to a delivery that would exceed the ceiling
pub(crate) enum LimitReaction {
    /// Discard the message
    Drop,
    /// Abort the process after a logged error
    Abort,
    /// Deliver the same message to another mailbox instead
    Redirect(Arc<RedirectFn>),
    /// Replace the message and deliver the replacement elsewhere
    Transform(Arc<TransformFn>),
}

/// One limit declaration, built by the typed constructors below
pub struct MessageLimit {
    pub(crate) msg_type: MsgType,
    pub(crate) ceiling: usize,
    pub(crate) reaction: LimitReaction,
}

impl MessageLimit {
    /// Drop deliveries of `M` beyond `ceiling` in-flight demands
    pub fn drop_after<M: Message>(ceiling: usize) -> Self {
        debug_assert!(ceiling > 0, "ceiling must be positive");
        Self {
            msg_type: MsgType::of::<M>(),
            ceiling,
            reaction: LimitReaction::Drop,
        }
    }

    /// Abort the process when deliveries of `M` exceed `ceiling`
    pub fn abort_after<M: Message>(ceiling: usize) -> Self {
        debug_assert!(ceiling > 0, "ceiling must be positive");
        Self {
            msg_type: MsgType::of::<M>(),
            ceiling,
            reaction: LimitReaction::Abort,
        }
    }

    /// Redirect overlimit deliveries of `M` to another mailbox
    ///
    /// The target is resolved lazily at reaction time, so the limit can be
    /// declared before the target mailbox exists.
    pub fn redirect_after<M, F>(ceiling: usize, target: F) -> Self
    where
        M: Message,
        F: Fn() -> Mbox + Send + Sync + 'static,
    {
        debug_assert!(ceiling > 0, "ceiling must be positive");
        Self {
            msg_type: MsgType::of::<M>(),
            ceiling,
            reaction: LimitReaction::Redirect(Arc::new(target)),
        }
    }

    /// Replace overlimit deliveries of `M` with a new message for another
    /// mailbox
    pub fn transform_after<M, N, F>(ceiling: usize, transform: F) -> Self
    where
        M: Message,
        N: Message,
        F: Fn(&M) -> (Mbox, N) + Send + Sync + 'static,
    {
        debug_assert!(ceiling > 0, "ceiling must be positive");
        Self {
            msg_type: MsgType::of::<M>(),
            ceiling,
            reaction: LimitReaction::Transform(Arc::new(move |payload: &Option<MessageRef>| {
                let payload = payload.as_ref()?;
                let msg = payload.downcast_ref::<M>()?;
                let (mbox, replacement) = transform(msg);
                Some(TransformedMessage {
                    mbox,
                    msg_type: MsgType::of::<N>(),
                    payload: Some(Arc::new(replacement)),
                })
            })),
        }
    }

    /// Replace overlimit deliveries of signal `S` with a message for
    /// another mailbox
    pub fn transform_signal_after<S, N, F>(ceiling: usize, transform: F) -> Self
    where
        S: Signal,
        N: Message,
        F: Fn() -> (Mbox, N) + Send + Sync + 'static,
    {
        debug_assert!(ceiling > 0, "ceiling must be positive");
        Self {
            msg_type: MsgType::of::<S>(),
            ceiling,
            reaction: LimitReaction::Transform(Arc::new(move |_payload: &Option<MessageRef>| {
                let (mbox, replacement) = transform();
                Some(TransformedMessage {
                    mbox,
                    msg_type: MsgType::of::<N>(),
                    payload: Some(Arc::new(replacement)),
                })
            })),
        }
    }
}

/// Runtime control block for one (agent, message type) limit
pub struct LimitControlBlock {
    pub(crate) msg_type: MsgType,
    pub(crate) ceiling: usize,
    pub(crate) reaction: LimitReaction,
    in_flight: AtomicUsize,
}

impl LimitControlBlock {
    fn new(limit: MessageLimit) -> Self {
        Self {
            msg_type: limit.msg_type,
            ceiling: limit.ceiling,
            reaction: limit.reaction,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Reserve one slot; false when the ceiling is reached
    pub(crate) fn try_acquire(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current < self.ceiling {
                    Some(current + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Release one slot when the demand is dequeued for execution
    pub(crate) fn release(&self) {
        let previous = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "limit counter underflow");
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Per-agent limit table; absence disables all checks
pub(crate) struct LimitStorage {
    blocks: HashMap<MsgType, Arc<LimitControlBlock>>,
}

impl LimitStorage {
    /// Build from declarations; a later declaration for the same type
    /// replaces the earlier one
    pub(crate) fn from_limits(limits: Vec<MessageLimit>) -> Self {
        let mut blocks = HashMap::with_capacity(limits.len());
        for limit in limits {
            blocks.insert(limit.msg_type, Arc::new(LimitControlBlock::new(limit)));
        }
        Self { blocks }
    }

    /// Control block for a message type, if one was declared
    pub(crate) fn lookup(&self, msg_type: MsgType) -> Option<Arc<LimitControlBlock>> {
        self.blocks.get(&msg_type).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe(#[allow(dead_code)] u32);

    #[test]
    fn test_acquire_up_to_ceiling() {
        let storage = LimitStorage::from_limits(vec![MessageLimit::drop_after::<Probe>(2)]);
        let block = storage.lookup(MsgType::of::<Probe>()).unwrap();

        assert!(block.try_acquire());
        assert!(block.try_acquire());
        assert!(!block.try_acquire());
        assert_eq!(block.in_flight(), 2);

        block.release();
        assert!(block.try_acquire());
    }

    #[test]
    fn test_lookup_missing_type() {
        let storage = LimitStorage::from_limits(vec![MessageLimit::drop_after::<Probe>(1)]);
        assert!(storage.lookup(MsgType::of::<String>()).is_none());
    }

    #[test]
    fn test_later_declaration_replaces() {
        let storage = LimitStorage::from_limits(vec![
            MessageLimit::drop_after::<Probe>(1),
            MessageLimit::drop_after::<Probe>(5),
        ]);
        let block = storage.lookup(MsgType::of::<Probe>()).unwrap();
        assert_eq!(block.ceiling, 5);
    }
}
