//! Per-agent subscription storage
//!
//! A compact index keyed on (mailbox, message type) with an inner per-state
//! slot. The mailbox keeps one routing entry per (type, agent); this store
//! keeps the handlers. Handler lookup falls back from the agent's current
//! state to its default state.

use crate::agent::{Agent, AgentContext};
use crate::demand::Demand;
use crate::mailbox::{Mbox, MboxId};
use crate::state::DEFAULT_STATE_INDEX;
use selkie_core::{MsgType, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Whether a handler may run concurrently with other thread-safe handlers
/// of the same agent
///
/// Stored and exposed, but the canonical dispatchers serialize all handlers
/// of one agent regardless; this is a reserved capability for dispatchers
/// that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadSafety {
    /// Handler requires exclusive access to the agent (the default)
    #[default]
    NotSafe,
    /// Handler declares itself safe for concurrent execution
    Safe,
}

/// Type-erased event handler
pub(crate) type HandlerFn =
    dyn Fn(&mut dyn Agent, &mut AgentContext<'_>, &Demand) -> Result<()> + Send + Sync;

/// One installed handler
#[derive(Clone)]
pub(crate) struct HandlerEntry {
    pub handler: Arc<HandlerFn>,
    pub thread_safety: ThreadSafety,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SubKey {
    mbox_id: MboxId,
    msg_type: MsgType,
}

struct SubSlot {
    mbox: Mbox,
    by_state: HashMap<u32, HandlerEntry>,
}

/// Outcome of an insert, telling the caller whether the mailbox needs to
/// learn about this agent
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InsertOutcome {
    /// First subscription for this (mailbox, type); subscribe at the mailbox
    NewEntry,
    /// Another state joined an existing (mailbox, type) slot
    AddedState,
    /// The handler for this exact (mailbox, type, state) was replaced
    Replaced,
}

/// All subscriptions of one agent
pub(crate) struct SubscriptionStorage {
    slots: HashMap<SubKey, SubSlot>,
}

impl SubscriptionStorage {
    pub(crate) fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    /// True if a handler exists for exactly (mailbox, type, state)
    pub(crate) fn contains_state(
        &self,
        mbox_id: MboxId,
        msg_type: MsgType,
        state_index: u32,
    ) -> bool {
        self.slots
            .get(&SubKey { mbox_id, msg_type })
            .is_some_and(|slot| slot.by_state.contains_key(&state_index))
    }

    /// Install or replace the handler for (mailbox, type, state)
    pub(crate) fn insert(
        &mut self,
        mbox: &Mbox,
        msg_type: MsgType,
        state_index: u32,
        entry: HandlerEntry,
    ) -> InsertOutcome {
        let key = SubKey {
            mbox_id: mbox.id(),
            msg_type,
        };
        match self.slots.get_mut(&key) {
            Some(slot) => {
                if slot.by_state.insert(state_index, entry).is_some() {
                    InsertOutcome::Replaced
                } else {
                    InsertOutcome::AddedState
                }
            }
            None => {
                let mut by_state = HashMap::with_capacity(1);
                by_state.insert(state_index, entry);
                self.slots.insert(
                    key,
                    SubSlot {
                        mbox: mbox.clone(),
                        by_state,
                    },
                );
                InsertOutcome::NewEntry
            }
        }
    }

    /// Drop the handler for one state
    ///
    /// Returns the mailbox when the whole (mailbox, type) slot became empty
    /// and was removed, so the caller can unsubscribe there. Absent
    /// subscriptions are a silent no-op.
    pub(crate) fn remove(
        &mut self,
        mbox_id: MboxId,
        msg_type: MsgType,
        state_index: u32,
    ) -> Option<Mbox> {
        let key = SubKey { mbox_id, msg_type };
        let slot = self.slots.get_mut(&key)?;
        slot.by_state.remove(&state_index)?;
        if slot.by_state.is_empty() {
            return self.slots.remove(&key).map(|slot| slot.mbox);
        }
        None
    }

    /// Drop the handlers for every state of (mailbox, type)
    pub(crate) fn remove_all_states(&mut self, mbox_id: MboxId, msg_type: MsgType) -> Option<Mbox> {
        self.slots
            .remove(&SubKey { mbox_id, msg_type })
            .map(|slot| slot.mbox)
    }

    /// Resolve the handler for a demand
    ///
    /// The slot for the current state wins; otherwise the default state's
    /// slot is the fallback.
    pub(crate) fn find(
        &self,
        mbox_id: MboxId,
        msg_type: MsgType,
        current_state: u32,
    ) -> Option<HandlerEntry> {
        let slot = self.slots.get(&SubKey { mbox_id, msg_type })?;
        slot.by_state
            .get(&current_state)
            .or_else(|| slot.by_state.get(&DEFAULT_STATE_INDEX))
            .cloned()
    }

    /// Tear down the whole store, yielding the mailboxes to unsubscribe at
    pub(crate) fn drain(&mut self) -> Vec<(Mbox, MsgType)> {
        self.slots
            .drain()
            .map(|(key, slot)| (slot.mbox, key.msg_type))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentContext};
    use crate::mailbox::Mbox;
    use selkie_core::stderr_logger;

    struct Ping;

    fn mbox(id: u64) -> Mbox {
        Mbox::mpmc(MboxId(id), None, stderr_logger())
    }

    fn entry() -> HandlerEntry {
        HandlerEntry {
            handler: Arc::new(
                |_agent: &mut dyn Agent, _ctx: &mut AgentContext<'_>, _demand: &Demand| Ok(()),
            ),
            thread_safety: ThreadSafety::NotSafe,
        }
    }

    #[test]
    fn test_insert_outcomes() {
        let mut storage = SubscriptionStorage::new();
        let mbox = mbox(1);
        let msg_type = MsgType::of::<Ping>();

        assert_eq!(
            storage.insert(&mbox, msg_type, 0, entry()),
            InsertOutcome::NewEntry
        );
        assert_eq!(
            storage.insert(&mbox, msg_type, 1, entry()),
            InsertOutcome::AddedState
        );
        assert_eq!(
            storage.insert(&mbox, msg_type, 1, entry()),
            InsertOutcome::Replaced
        );
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_find_falls_back_to_default_state() {
        let mut storage = SubscriptionStorage::new();
        let mbox = mbox(1);
        let msg_type = MsgType::of::<Ping>();
        storage.insert(&mbox, msg_type, DEFAULT_STATE_INDEX, entry());

        assert!(storage.find(mbox.id(), msg_type, 5).is_some());
        assert!(storage.find(MboxId(99), msg_type, 5).is_none());
    }

    #[test]
    fn test_find_prefers_current_state() {
        let mut storage = SubscriptionStorage::new();
        let mbox = mbox(1);
        let msg_type = MsgType::of::<Ping>();
        storage.insert(&mbox, msg_type, 2, entry());

        assert!(storage.find(mbox.id(), msg_type, 2).is_some());
        // No default-state handler installed, so other states miss.
        assert!(storage.find(mbox.id(), msg_type, 3).is_none());
    }

    #[test]
    fn test_remove_reports_empty_slot() {
        let mut storage = SubscriptionStorage::new();
        let mbox = mbox(1);
        let msg_type = MsgType::of::<Ping>();
        storage.insert(&mbox, msg_type, 0, entry());
        storage.insert(&mbox, msg_type, 1, entry());

        assert!(storage.remove(mbox.id(), msg_type, 0).is_none());
        assert!(storage.remove(mbox.id(), msg_type, 1).is_some());
        assert!(storage.remove(mbox.id(), msg_type, 1).is_none());
        assert_eq!(storage.len(), 0);
    }

    #[test]
    fn test_drain_yields_mailboxes() {
        let mut storage = SubscriptionStorage::new();
        let first = mbox(1);
        let second = mbox(2);
        storage.insert(&first, MsgType::of::<Ping>(), 0, entry());
        storage.insert(&second, MsgType::of::<String>(), 0, entry());

        let drained = storage.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(storage.len(), 0);
    }
}
