//! Mailboxes
//!
//! A mailbox is an addressable delivery endpoint. `Mpmc` mailboxes
//! broadcast to every subscriber; `Direct` mailboxes belong to exactly one
//! agent. Delivery enumerates subscribers in insertion order, applies the
//! subscriber's delivery filter and message limit, and pushes one execution
//! demand per accepting subscriber. The mailbox routes by message type
//! only; the per-state handler is resolved by the receiving agent when the
//! demand executes.

use crate::agent::{AgentHandle, AgentId};
use crate::demand::Demand;
use crate::limits::{LimitControlBlock, LimitReaction};
use selkie_core::{
    log_error, reply_channel, AnyRequest, Error, ErrorLogger, Message, MessageRef, MsgType,
    ReplyFuture, RequestEnvelope, Result, Signal, OVERLIMIT_REDIRECTION_DEPTH_MAX,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

use crate::sync::lock;

/// Unique mailbox id within one environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MboxId(pub(crate) u64);

impl MboxId {
    /// Sentinel used by synthetic demands (ids start at 1)
    pub(crate) const NONE: MboxId = MboxId(0);
}

impl std::fmt::Display for MboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mbox:{}", self.0)
    }
}

pub(crate) enum MboxKind {
    /// Multi-producer multi-consumer broadcast
    Mpmc,
    /// Single owning agent; the owner is non-owning to break the
    /// handle -> mailbox -> handle cycle
    Direct(Weak<AgentHandle>),
}

pub(crate) type DeliveryFilterFn = Arc<dyn Fn(&MessageRef) -> bool + Send + Sync>;

#[derive(Clone)]
struct SubscriberEntry {
    agent_id: AgentId,
    agent: Arc<AgentHandle>,
    /// A routing entry may exist for the filter alone, before (or after)
    /// the subscription itself
    subscribed: bool,
    filter: Option<DeliveryFilterFn>,
}

struct MboxInner {
    id: MboxId,
    name: Option<Arc<str>>,
    kind: MboxKind,
    subscribers: Mutex<HashMap<MsgType, Vec<SubscriberEntry>>>,
    logger: Arc<dyn ErrorLogger>,
}

/// Handle to one mailbox; cheap to clone and share between threads
#[derive(Clone)]
pub struct Mbox {
    inner: Arc<MboxInner>,
}

impl Mbox {
    pub(crate) fn mpmc(id: MboxId, name: Option<Arc<str>>, logger: Arc<dyn ErrorLogger>) -> Self {
        Self {
            inner: Arc::new(MboxInner {
                id,
                name,
                kind: MboxKind::Mpmc,
                subscribers: Mutex::new(HashMap::new()),
                logger,
            }),
        }
    }

    pub(crate) fn direct(id: MboxId, owner: Weak<AgentHandle>, logger: Arc<dyn ErrorLogger>) -> Self {
        Self {
            inner: Arc::new(MboxInner {
                id,
                name: None,
                kind: MboxKind::Direct(owner),
                subscribers: Mutex::new(HashMap::new()),
                logger,
            }),
        }
    }

    /// The mailbox id
    pub fn id(&self) -> MboxId {
        self.inner.id
    }

    /// The optional mailbox name
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// True for a single-owner direct mailbox
    pub fn is_direct(&self) -> bool {
        matches!(self.inner.kind, MboxKind::Direct(_))
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Deliver a message to every accepting subscriber
    ///
    /// On an `Mpmc` mailbox an absent subscriber is not an error; on a
    /// `Direct` mailbox it fails with `UnknownMessageType`. Demands are
    /// enqueued before the call returns.
    pub fn deliver<M: Message>(&self, msg: M) -> Result<()> {
        self.deliver_erased(MsgType::of::<M>(), Some(Arc::new(msg) as MessageRef), 0)
    }

    /// Deliver a payloadless signal by type identity
    pub fn deliver_signal<S: Signal>(&self) -> Result<()> {
        self.deliver_erased(MsgType::of::<S>(), None, 0)
    }

    pub(crate) fn deliver_erased(
        &self,
        msg_type: MsgType,
        payload: Option<MessageRef>,
        redirection_depth: usize,
    ) -> Result<()> {
        let entries = self.snapshot_subscribed(msg_type);
        if entries.is_empty() {
            return match self.inner.kind {
                MboxKind::Direct(_) => Err(Error::UnknownMessageType {
                    msg_type: msg_type.name(),
                }),
                MboxKind::Mpmc => Ok(()),
            };
        }

        for entry in entries {
            if let (Some(filter), Some(payload_ref)) = (&entry.filter, &payload) {
                if !self.run_filter(filter, payload_ref) {
                    continue;
                }
            }

            let limit = entry.agent.limit_for(msg_type);
            if let Some(block) = &limit {
                if !block.try_acquire() {
                    self.apply_overlimit(block, msg_type, &payload, redirection_depth)?;
                    continue;
                }
            }

            let demand = Demand::message(
                entry.agent.clone(),
                self.id(),
                msg_type,
                payload.clone(),
                limit.clone(),
            );
            if let Err(err) = entry.agent.push_event(demand) {
                if let Some(block) = &limit {
                    block.release();
                }
                return Err(err);
            }
        }

        Ok(())
    }

    /// Deliver a service request to exactly one subscriber
    ///
    /// The returned future is always resolved eventually: with the
    /// handler's result, with `NoHandler`/`TooManyHandlers` before this
    /// call returns, or with `AgentShutDown` if the demand is discarded
    /// without execution.
    pub fn request<M: Message, R: Message>(&self, msg: M) -> ReplyFuture<R> {
        let (sender, future) = reply_channel::<R>();
        let msg_type = MsgType::of::<M>();

        let entries = self.snapshot_subscribed(msg_type);
        if entries.is_empty() {
            sender.resolve(Err(Error::NoHandler {
                msg_type: msg_type.name(),
            }));
            return future;
        }
        if entries.len() > 1 {
            sender.resolve(Err(Error::TooManyHandlers {
                msg_type: msg_type.name(),
            }));
            return future;
        }
        let entry = &entries[0];

        let envelope = Arc::new(RequestEnvelope::<M, R>::new(msg, sender));
        let limit = entry.agent.limit_for(msg_type);
        if let Some(block) = &limit {
            if !block.try_acquire() {
                // Overlimit service requests are dropped; the envelope's
                // reply sender resolves the future on the way out.
                debug!(%msg_type, "service request dropped by message limit");
                return future;
            }
        }

        let demand = Demand::service_request(
            entry.agent.clone(),
            self.id(),
            msg_type,
            envelope as Arc<dyn AnyRequest>,
            limit.clone(),
        );
        if entry.agent.push_event(demand).is_err() {
            if let Some(block) = &limit {
                block.release();
            }
        }
        future
    }

    fn snapshot_subscribed(&self, msg_type: MsgType) -> Vec<SubscriberEntry> {
        let subscribers = lock(&self.inner.subscribers);
        subscribers
            .get(&msg_type)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.subscribed)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn run_filter(&self, filter: &DeliveryFilterFn, payload: &MessageRef) -> bool {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| filter(payload))) {
            Ok(verdict) => verdict,
            Err(_) => {
                // The panic happened on the producer's thread, outside any
                // agent's exception policy; this is unrecoverable.
                log_error!(
                    self.inner.logger,
                    "delivery filter panicked on {}; aborting",
                    self.inner.id
                );
                std::process::abort();
            }
        }
    }

    fn apply_overlimit(
        &self,
        block: &Arc<LimitControlBlock>,
        msg_type: MsgType,
        payload: &Option<MessageRef>,
        redirection_depth: usize,
    ) -> Result<()> {
        match &block.reaction {
            LimitReaction::Drop => {
                debug!(%msg_type, ceiling = block.ceiling, "message dropped by limit");
                Ok(())
            }
            LimitReaction::Abort => {
                log_error!(
                    self.inner.logger,
                    "message limit for {} exceeded (ceiling {}); aborting",
                    msg_type,
                    block.ceiling
                );
                std::process::abort();
            }
            LimitReaction::Redirect(target) => {
                if redirection_depth >= OVERLIMIT_REDIRECTION_DEPTH_MAX {
                    log_error!(
                        self.inner.logger,
                        "overlimit redirection chain for {} deeper than {}; message dropped",
                        msg_type,
                        OVERLIMIT_REDIRECTION_DEPTH_MAX
                    );
                    return Ok(());
                }
                target().deliver_erased(msg_type, payload.clone(), redirection_depth + 1)
            }
            LimitReaction::Transform(transform) => {
                if redirection_depth >= OVERLIMIT_REDIRECTION_DEPTH_MAX {
                    log_error!(
                        self.inner.logger,
                        "overlimit transformation chain for {} deeper than {}; message dropped",
                        msg_type,
                        OVERLIMIT_REDIRECTION_DEPTH_MAX
                    );
                    return Ok(());
                }
                match transform(payload) {
                    Some(out) => {
                        out.mbox
                            .deliver_erased(out.msg_type, out.payload, redirection_depth + 1)
                    }
                    None => {
                        debug!(%msg_type, "overlimit transform declined; message dropped");
                        Ok(())
                    }
                }
            }
        }
    }

    // =========================================================================
    // Subscriber management (driven by the agent's subscription store)
    // =========================================================================

    /// Add a routing entry for (type, agent)
    ///
    /// For a direct mailbox only the owner may subscribe, and at most one
    /// handler per type may exist across the mailbox's lifetime.
    pub(crate) fn subscribe_agent(
        &self,
        agent: &Arc<AgentHandle>,
        msg_type: MsgType,
    ) -> Result<()> {
        let mut subscribers = lock(&self.inner.subscribers);

        if let MboxKind::Direct(owner) = &self.inner.kind {
            let owner_id = owner.upgrade().map(|owner| owner.id());
            if owner_id != Some(agent.id()) {
                return Err(Error::IllegalSubscriber {
                    msg_type: msg_type.name(),
                });
            }
            let already = subscribers
                .get(&msg_type)
                .is_some_and(|entries| entries.iter().any(|entry| entry.subscribed));
            if already {
                return Err(Error::DuplicateHandler {
                    msg_type: msg_type.name(),
                });
            }
        }

        let entries = subscribers.entry(msg_type).or_default();
        match entries
            .iter_mut()
            .find(|entry| entry.agent_id == agent.id())
        {
            Some(entry) => entry.subscribed = true,
            None => entries.push(SubscriberEntry {
                agent_id: agent.id(),
                agent: agent.clone(),
                subscribed: true,
                filter: None,
            }),
        }
        Ok(())
    }

    /// Drop the routing entry for (type, agent); silent if absent
    pub(crate) fn unsubscribe_agent(&self, agent_id: AgentId, msg_type: MsgType) {
        let mut subscribers = lock(&self.inner.subscribers);
        if let Some(entries) = subscribers.get_mut(&msg_type) {
            if let Some(position) = entries.iter().position(|entry| entry.agent_id == agent_id) {
                if entries[position].filter.is_some() {
                    entries[position].subscribed = false;
                } else {
                    entries.remove(position);
                }
            }
            if entries.is_empty() {
                subscribers.remove(&msg_type);
            }
        }
    }

    /// Install a delivery filter for (type, agent); MPMC only
    pub(crate) fn set_filter(
        &self,
        agent: &Arc<AgentHandle>,
        msg_type: MsgType,
        filter: DeliveryFilterFn,
    ) -> Result<()> {
        if self.is_direct() {
            return Err(Error::FilterOnDirectMbox);
        }
        let mut subscribers = lock(&self.inner.subscribers);
        let entries = subscribers.entry(msg_type).or_default();
        match entries
            .iter_mut()
            .find(|entry| entry.agent_id == agent.id())
        {
            Some(entry) => entry.filter = Some(filter),
            None => entries.push(SubscriberEntry {
                agent_id: agent.id(),
                agent: agent.clone(),
                subscribed: false,
                filter: Some(filter),
            }),
        }
        Ok(())
    }

    /// Remove a delivery filter; silent if absent
    pub(crate) fn drop_filter(&self, agent_id: AgentId, msg_type: MsgType) {
        let mut subscribers = lock(&self.inner.subscribers);
        if let Some(entries) = subscribers.get_mut(&msg_type) {
            if let Some(position) = entries.iter().position(|entry| entry.agent_id == agent_id) {
                entries[position].filter = None;
                if !entries[position].subscribed {
                    entries.remove(position);
                }
            }
            if entries.is_empty() {
                subscribers.remove(&msg_type);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self, msg_type: MsgType) -> usize {
        lock(&self.inner.subscribers)
            .get(&msg_type)
            .map(|entries| entries.iter().filter(|entry| entry.subscribed).count())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for Mbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mbox")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("direct", &self.is_direct())
            .finish()
    }
}
