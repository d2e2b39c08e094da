//! Error types for Selkie
//!
//! TigerStyle: Explicit error types with context, using thiserror.
//!
//! The taxonomy follows three tiers: invariant violations (programmer
//! errors, raised synchronously at the offending call), delivery outcomes
//! (runtime conditions a producer can observe), and handler failures
//! (routed through the exception-reaction policy). Fatal conditions
//! (delivery-filter panics, deregistration-notifier failures) abort the
//! process and never appear as `Error` values.

use thiserror::Error;

/// Result type alias for Selkie operations
pub type Result<T> = std::result::Result<T, Error>;

/// Selkie error types
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // State Machine Errors
    // =========================================================================
    #[error("Agent does not own state: {state}")]
    StateNotOwned { state: String },

    #[error("State change from inside a state listener is not allowed")]
    ReentrantStateChange,

    // =========================================================================
    // Threading Errors
    // =========================================================================
    #[error("Operation is only allowed on the agent's working thread: {operation}")]
    NotOnWorkingThread { operation: &'static str },

    // =========================================================================
    // Cooperation Errors
    // =========================================================================
    #[error("Cooperation name already registered: {name}")]
    DuplicateCoopName { name: String },

    #[error("Cooperation has no agents: {name}")]
    EmptyCoop { name: String },

    #[error("Parent cooperation not found: {name}")]
    ParentCoopNotFound { name: String },

    #[error("Parent cooperation is being deregistered: {name}")]
    ParentCoopDeregistering { name: String },

    #[error("Cyclic parent link for cooperation: {name}")]
    CyclicParent { name: String },

    #[error("Cooperation not registered: {name}")]
    CoopNotFound { name: String },

    #[error("Environment is shutting down, no new registrations accepted")]
    ShuttingDown,

    // =========================================================================
    // Subscription Errors
    // =========================================================================
    #[error("Handler already installed on direct mailbox for message type: {msg_type}")]
    DuplicateHandler { msg_type: &'static str },

    #[error("Only the owning agent may subscribe to a direct mailbox (type: {msg_type})")]
    IllegalSubscriber { msg_type: &'static str },

    #[error("Delivery filters cannot be installed on a direct mailbox")]
    FilterOnDirectMbox,

    // =========================================================================
    // Delivery Outcomes
    // =========================================================================
    #[error("No subscriber on direct mailbox for message type: {msg_type}")]
    UnknownMessageType { msg_type: &'static str },

    #[error("No handler for service request of type: {msg_type}")]
    NoHandler { msg_type: &'static str },

    #[error("More than one handler for service request of type: {msg_type}")]
    TooManyHandlers { msg_type: &'static str },

    #[error("Agent has been shut down, demand rejected")]
    AgentShutDown,

    #[error("Service request timed out waiting for the reply")]
    RequestTimeout,

    #[error("Service request handler failed: {reason}")]
    HandlerFailed { reason: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid configuration: {field}, reason: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {reason}")]
    Internal { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Create a handler-failed error from another error's text
    pub fn handler_failed(reason: impl Into<String>) -> Self {
        Self::HandlerFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid-configuration error
    pub fn invalid_configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// True for programmer errors that indicate misuse of the API
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::StateNotOwned { .. }
                | Self::ReentrantStateChange
                | Self::NotOnWorkingThread { .. }
                | Self::DuplicateCoopName { .. }
                | Self::EmptyCoop { .. }
                | Self::ParentCoopNotFound { .. }
                | Self::ParentCoopDeregistering { .. }
                | Self::CyclicParent { .. }
                | Self::DuplicateHandler { .. }
                | Self::IllegalSubscriber { .. }
                | Self::FilterOnDirectMbox
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::DuplicateCoopName {
            name: "workers".into(),
        };
        assert!(err.to_string().contains("workers"));
    }

    #[test]
    fn test_invariant_classification() {
        assert!(Error::FilterOnDirectMbox.is_invariant_violation());
        assert!(!Error::AgentShutDown.is_invariant_violation());
        assert!(!Error::internal("x").is_invariant_violation());
    }
}
