//! Message model: type identities, payload references, service requests
//!
//! Messages are plain owned values dispatched by their `TypeId`; there is no
//! serialization inside the process. Signals are payloadless marker types
//! whose identity is the type alone. A service request wraps a message with
//! a one-shot reply slot.

use crate::error::{Error, Result};
use crate::reply::ReplySender;
use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};

/// Anything that can be delivered through a mailbox
pub trait Message: Send + Sync + 'static {}

impl<T> Message for T where T: Send + Sync + 'static {}

/// Marker for payloadless message types
///
/// Signals are never instantiated; they are delivered by type identity
/// alone via `Mbox::deliver_signal::<S>()`.
pub trait Signal: 'static {}

/// Process-stable message type identity
///
/// Equality and hashing use the `TypeId` only; the type name is carried for
/// diagnostics and error messages.
#[derive(Debug, Clone, Copy)]
pub struct MsgType {
    id: TypeId,
    name: &'static str,
}

impl MsgType {
    /// Type identity of `M`
    pub fn of<M: 'static>() -> Self {
        Self {
            id: TypeId::of::<M>(),
            name: type_name::<M>(),
        }
    }

    /// The full type name, for diagnostics
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for MsgType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MsgType {}

impl Hash for MsgType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Shared, immutable message payload
///
/// One payload may be referenced by many demands (MPMC fan-out); receivers
/// only ever see `&M`.
pub type MessageRef = Arc<dyn Any + Send + Sync>;

/// A service request in flight: the parameter plus its one-shot reply slot
///
/// Subscription and routing use the parameter type `M`; the result type `R`
/// is checked when the handler downcasts the envelope.
pub struct RequestEnvelope<M, R> {
    param: M,
    reply: Mutex<Option<ReplySender<R>>>,
}

impl<M: Message, R: Message> RequestEnvelope<M, R> {
    /// Wrap a parameter and its reply sender
    pub fn new(param: M, reply: ReplySender<R>) -> Self {
        Self {
            param,
            reply: Mutex::new(Some(reply)),
        }
    }

    /// The request parameter
    pub fn param(&self) -> &M {
        &self.param
    }

    /// Take the reply sender; `None` if already taken
    pub fn take_reply(&self) -> Option<ReplySender<R>> {
        self.reply
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Type-erased view of a request envelope
///
/// Lets the runtime reject a request (resolve its future with an error)
/// without knowing the concrete parameter and result types, e.g. when
/// handler lookup fails.
pub trait AnyRequest: Send + Sync {
    /// Downcast access for typed handlers
    fn as_any(&self) -> &(dyn Any + Send + Sync);

    /// Resolve the future with an error; no-op if already resolved
    fn reject(&self, err: Error);

    /// The parameter type used for routing
    fn msg_type(&self) -> MsgType;
}

impl<M: Message, R: Message> AnyRequest for RequestEnvelope<M, R> {
    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn reject(&self, err: Error) {
        if let Some(sender) = self.take_reply() {
            sender.resolve(Err(err));
        }
    }

    fn msg_type(&self) -> MsgType {
        MsgType::of::<M>()
    }
}

/// Resolve a request handler outcome into the reply slot
pub fn resolve_request<M: Message, R: Message>(
    envelope: &RequestEnvelope<M, R>,
    outcome: Result<R>,
) {
    if let Some(sender) = envelope.take_reply() {
        sender.resolve(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::reply_channel;

    struct Ping(u32);
    struct Tick;
    impl Signal for Tick {}

    #[test]
    fn test_msg_type_identity() {
        assert_eq!(MsgType::of::<Ping>(), MsgType::of::<Ping>());
        assert_ne!(MsgType::of::<Ping>(), MsgType::of::<Tick>());
        assert!(MsgType::of::<Ping>().name().contains("Ping"));
    }

    #[test]
    fn test_request_envelope_reply_taken_once() {
        let (tx, rx) = reply_channel::<u32>();
        let envelope = RequestEnvelope::new(Ping(1), tx);
        assert_eq!(envelope.param().0, 1);
        assert!(envelope.take_reply().is_some());
        assert!(envelope.take_reply().is_none());
        // Sender dropped without resolution.
        assert!(matches!(rx.recv(), Err(Error::AgentShutDown)));
    }

    #[test]
    fn test_any_request_reject() {
        let (tx, rx) = reply_channel::<u32>();
        let envelope = RequestEnvelope::new(Ping(1), tx);
        let erased: &dyn AnyRequest = &envelope;
        erased.reject(Error::NoHandler {
            msg_type: MsgType::of::<Ping>().name(),
        });
        assert!(matches!(rx.recv(), Err(Error::NoHandler { .. })));
    }
}
