//! Execution demands
//!
//! A demand is a request to invoke one handler on one agent. Mailboxes
//! produce demands; event queues carry them; dispatchers execute them.
//! The synthetic `Start`/`Finish` kinds bracket an agent's lifetime on its
//! working thread.

use crate::agent::AgentHandle;
use crate::limits::LimitControlBlock;
use crate::mailbox::MboxId;
use selkie_core::{AnyRequest, MessageRef, MsgType};
use std::sync::Arc;

/// What a demand asks the agent to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DemandKind {
    /// Run the `on_start` hook (first demand after binding)
    Start,
    /// Run the `on_finish` hook and shut the agent down (last demand)
    Finish,
    /// Dispatch a message or signal to its handler
    Message,
    /// Dispatch a service request; the reply slot rides in the envelope
    ServiceRequest,
}

/// One unit of work addressed to one agent
pub struct Demand {
    pub(crate) target: Arc<AgentHandle>,
    pub(crate) mbox_id: MboxId,
    pub(crate) msg_type: MsgType,
    pub(crate) payload: Option<MessageRef>,
    pub(crate) request: Option<Arc<dyn AnyRequest>>,
    pub(crate) limit: Option<Arc<LimitControlBlock>>,
    pub(crate) kind: DemandKind,
}

impl Demand {
    pub(crate) fn start(target: Arc<AgentHandle>) -> Self {
        Self {
            mbox_id: MboxId::NONE,
            msg_type: MsgType::of::<StartDemandMarker>(),
            payload: None,
            request: None,
            limit: None,
            kind: DemandKind::Start,
            target,
        }
    }

    pub(crate) fn finish(target: Arc<AgentHandle>) -> Self {
        Self {
            mbox_id: MboxId::NONE,
            msg_type: MsgType::of::<FinishDemandMarker>(),
            payload: None,
            request: None,
            limit: None,
            kind: DemandKind::Finish,
            target,
        }
    }

    pub(crate) fn message(
        target: Arc<AgentHandle>,
        mbox_id: MboxId,
        msg_type: MsgType,
        payload: Option<MessageRef>,
        limit: Option<Arc<LimitControlBlock>>,
    ) -> Self {
        Self {
            target,
            mbox_id,
            msg_type,
            payload,
            request: None,
            limit,
            kind: DemandKind::Message,
        }
    }

    pub(crate) fn service_request(
        target: Arc<AgentHandle>,
        mbox_id: MboxId,
        msg_type: MsgType,
        request: Arc<dyn AnyRequest>,
        limit: Option<Arc<LimitControlBlock>>,
    ) -> Self {
        Self {
            target,
            mbox_id,
            msg_type,
            payload: None,
            request: Some(request),
            limit,
            kind: DemandKind::ServiceRequest,
        }
    }
}

// Marker types giving the synthetic demands a type identity for tracing.
struct StartDemandMarker;
struct FinishDemandMarker;

/// Destination for demands, as handed out by a dispatcher binder
///
/// Pushes are non-blocking and thread-safe. A queue accepted from a custom
/// binder must preserve per-agent FIFO order and must never execute demands
/// for one agent on two threads at once.
pub trait EventQueue: Send + Sync {
    /// Append one demand
    fn push(&self, demand: Demand);
}
